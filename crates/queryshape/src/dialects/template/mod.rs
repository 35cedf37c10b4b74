//! Spring Data repository templates: `@Query` and `@Aggregation`.
//!
//! A repository method carries its query as a JSON-like string. Two kinds of
//! call site produce a query:
//! - the annotated declaration itself, where `?N` placeholders stand for the
//!   method parameters and stay dynamic
//! - a call to the repository method, where `?N` resolves against the actual
//!   argument at that call

pub mod syntax;

use std::ops::Range;

use tree_sitter::Node;

use self::syntax::{Entry, TemplateValue};
use super::{CallSite, Context};
use crate::decompose::{base_type, CallChain, ChainRoot};
use crate::model::{
    Accumulator, AccumulatorOperator, AccumulatorSource, CanonicalQuery, Command, Comparison,
    Dialect, Direction, FieldPath, GroupKey, MalformedReason, NodePath, Operation,
    PipelineStage, Predicate, ProjectField, QueryTarget, ResolvedValue, SortField,
    UnresolvedReason, Value,
};
use crate::resolve::Resolver;
use crate::syntax::symbols::formal_parameters;
use crate::syntax::{
    annotation_argument, enclosing, find_annotation, find_child_by_kind, for_each_descendant,
    named_children, SourceUnit, TYPE_DECLARATIONS,
};
use crate::Location;

/// Return types that make a derived query return many documents.
const MULTI_RESULT_TYPES: &[&str] = &[
    "List",
    "Iterable",
    "Collection",
    "Set",
    "Stream",
    "Page",
    "Slice",
    "Window",
    "Flux",
];

/// Operators allowed inside `{ field: { $op: .. } }`.
const FIELD_OPERATORS: &[&str] = &[
    "$eq", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$not",
];

/// One annotation attribute: its resolved string and where it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateText {
    pub value: ResolvedValue,
    /// Java source of the attribute value
    pub raw: String,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemplateAnnotation {
    Query {
        filter: Option<TemplateText>,
        fields: Option<TemplateText>,
        sort: Option<TemplateText>,
        count: bool,
        delete: bool,
        exists: bool,
    },
    Aggregation {
        pipeline: Vec<TemplateText>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodParameter {
    pub name: String,
    pub location: Location,
}

/// An annotated repository method.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMethod {
    pub repository: String,
    pub name: String,
    pub parameters: Vec<MethodParameter>,
    /// Entity type from `extends XRepository<Entity, Id>`
    pub entity: Option<String>,
    pub returns_many: bool,
    pub annotation: TemplateAnnotation,
    /// Span of the method name
    pub location: Location,
}

impl QueryMethod {
    /// Read a method declaration. `None` unless it carries `@Query` or `@Aggregation`.
    pub fn from_declaration<'t>(resolver: &Resolver<'t>, method: Node<'t>) -> Option<Self> {
        let unit = resolver.unit();
        let annotation = if let Some(query) = find_annotation(unit, method, "Query") {
            let text = |key: &str| {
                annotation_argument(unit, query, key).map(|node| template_text(resolver, node))
            };
            let flag = |key: &str| {
                annotation_argument(unit, query, key).is_some_and(|node| {
                    resolver.resolve_node(node) == ResolvedValue::Literal(Value::Bool(true))
                })
            };
            TemplateAnnotation::Query {
                filter: text("value"),
                fields: text("fields"),
                sort: text("sort"),
                count: flag("count"),
                delete: flag("delete"),
                exists: flag("exists"),
            }
        } else if let Some(aggregation) = find_annotation(unit, method, "Aggregation") {
            let stages = annotation_argument(unit, aggregation, "pipeline")
                .or_else(|| annotation_argument(unit, aggregation, "value"));
            let pipeline = match stages {
                Some(node) if node.kind() == "element_value_array_initializer" => {
                    named_children(node)
                        .into_iter()
                        .map(|stage| template_text(resolver, stage))
                        .collect()
                }
                Some(node) => vec![template_text(resolver, node)],
                None => Vec::new(),
            };
            TemplateAnnotation::Aggregation { pipeline }
        } else {
            return None;
        };

        let name = method.child_by_field_name("name")?;
        let repository = enclosing(method, TYPE_DECLARATIONS)?;
        let parameters = formal_parameters(method)
            .into_iter()
            .map(|param| MethodParameter {
                name: parameter_name(unit, param),
                location: unit.location(param),
            })
            .collect();
        let returns_many = method
            .child_by_field_name("type")
            .is_some_and(|t| returns_many(unit.text(t)));

        Some(Self {
            repository: unit
                .text(repository.child_by_field_name("name")?)
                .to_string(),
            name: unit.text(name).to_string(),
            parameters,
            entity: repository_entity(unit, repository),
            returns_many,
            annotation,
            location: unit.location(name),
        })
    }
}

fn template_text<'t>(resolver: &Resolver<'t>, node: Node<'t>) -> TemplateText {
    TemplateText {
        value: resolver.resolve_node(node),
        raw: resolver.text(node).to_string(),
        location: resolver.location(node),
    }
}

fn parameter_name(unit: &SourceUnit, param: Node<'_>) -> String {
    param
        .child_by_field_name("name")
        .or_else(|| {
            find_child_by_kind(&param, "variable_declarator")
                .and_then(|d| d.child_by_field_name("name"))
        })
        .map(|n| unit.text(n).to_string())
        .unwrap_or_default()
}

fn returns_many(type_text: &str) -> bool {
    type_text.trim_end().ends_with("[]") || MULTI_RESULT_TYPES.contains(&base_type(type_text))
}

/// `interface MovieRepository extends MongoRepository<Movie, String>` -> `Movie`
fn repository_entity(unit: &SourceUnit, repository: Node<'_>) -> Option<String> {
    let supertypes = find_child_by_kind(&repository, "extends_interfaces")
        .or_else(|| repository.child_by_field_name("interfaces"))
        .or_else(|| repository.child_by_field_name("superclass"))?;
    let mut entity = None;
    for_each_descendant(supertypes, |node| {
        if entity.is_some() || node.kind() != "generic_type" {
            return;
        }
        let children = named_children(node);
        let is_repository = children
            .first()
            .is_some_and(|base| unit.text(*base).ends_with("Repository"));
        if is_repository {
            entity = children
                .iter()
                .find(|c| c.kind() == "type_arguments")
                .and_then(|args| named_children(*args).into_iter().next())
                .map(|arg| base_type(unit.text(arg)).to_string());
        }
    });
    entity
}

pub fn accepts<'t>(ctx: &Context<'_, 't>, site: &CallSite<'t>) -> bool {
    match site {
        CallSite::AnnotatedMethod { node } => {
            QueryMethod::from_declaration(ctx.resolver, *node).is_some()
        }
        CallSite::Call { chain, .. } => select_method(ctx, chain).is_some(),
    }
}

pub fn recognize<'t>(ctx: &Context<'_, 't>, site: &CallSite<'t>) -> CanonicalQuery {
    let node = site.node();
    match site {
        CallSite::Call { chain, .. } => match select_method(ctx, chain) {
            Some(method) => {
                let arguments: Vec<ResolvedValue> = chain.steps[0]
                    .arguments
                    .iter()
                    .map(|arg| arg.value.clone())
                    .collect();
                translate(ctx, node, method, &Placeholders::Arguments(&arguments))
            }
            None => CanonicalQuery::unsupported(ctx.text(node), ctx.location(node)),
        },
        CallSite::AnnotatedMethod { node } => {
            match QueryMethod::from_declaration(ctx.resolver, *node) {
                Some(method) => translate(
                    ctx,
                    *node,
                    &method,
                    &Placeholders::Parameters(&method.parameters),
                ),
                None => CanonicalQuery::unsupported(ctx.text(*node), ctx.location(*node)),
            }
        }
    }
}

/// The repository method a call invokes.
///
/// The receiver's declared type picks among same-named methods; without
/// one, the name must be unique across the pass.
fn select_method<'t>(ctx: &Context<'_, 't>, chain: &CallChain<'t>) -> Option<&'t QueryMethod> {
    if matches!(chain.root, ChainRoot::Static(_)) {
        return None;
    }
    let step = chain.steps.first()?;
    let candidates: Vec<&'t QueryMethod> = ctx
        .table()
        .query_methods(&step.name)
        .iter()
        .filter(|m| m.parameters.len() == step.arity())
        .collect();
    if let Some(typed) = candidates.iter().find(|m| chain.has_type(&m.repository)) {
        return Some(*typed);
    }
    match candidates.as_slice() {
        [only] => Some(*only),
        _ => None,
    }
}

/// What `?N` means at this call site.
enum Placeholders<'p> {
    Arguments(&'p [ResolvedValue]),
    Parameters(&'p [MethodParameter]),
}

impl Placeholders<'_> {
    fn get(&self, index: usize) -> Result<ResolvedValue, MalformedReason> {
        let value = match self {
            Placeholders::Arguments(values) => values.get(index).cloned(),
            Placeholders::Parameters(params) => params.get(index).map(|p| {
                ResolvedValue::unresolved(UnresolvedReason::DynamicValue, Some(p.location.clone()))
            }),
        };
        value.ok_or(MalformedReason::PlaceholderOutOfRange(index))
    }
}

fn translate<'t>(
    ctx: &Context<'_, 't>,
    site: Node<'t>,
    method: &QueryMethod,
    placeholders: &Placeholders<'_>,
) -> CanonicalQuery {
    let root = NodePath::root();
    let location = ctx.location(site);
    ctx.record(&root, site);
    ctx.record_location(&root.child("target").child("database"), location.clone());
    ctx.record_location(&root.child("target").child("collection"), method.location.clone());

    let collection = match &method.entity {
        Some(entity) => ctx.table().collection_for(entity, method.location.clone()),
        None => ResolvedValue::unresolved(
            UnresolvedReason::ImplicitCollectionName,
            Some(method.location.clone()),
        ),
    };
    let target = QueryTarget {
        database: ctx.default_database(&location),
        collection,
    };

    let (command, operation) = match &method.annotation {
        TemplateAnnotation::Query {
            filter,
            fields,
            sort,
            count,
            delete,
            exists,
        } => {
            let filter = match filter {
                Some(text) => {
                    ctx.record_location(&root.child("filter"), text.location.clone());
                    Translator::new(text, placeholders).filter()
                }
                None => Predicate::match_all(),
            };
            if *count {
                (Command::CountDocuments, Operation::Count { filter })
            } else if *delete {
                (Command::DeleteMany, Operation::Delete { filter })
            } else {
                let projection = fields.as_ref().map(|text| {
                    ctx.record_location(&root.child("projection"), text.location.clone());
                    Translator::new(text, placeholders).projection()
                });
                let sort = sort.as_ref().map(|text| {
                    ctx.record_location(&root.child("sort"), text.location.clone());
                    Translator::new(text, placeholders).sort()
                });
                let command = if !*exists && method.returns_many {
                    Command::FindMany
                } else {
                    Command::FindOne
                };
                (
                    command,
                    Operation::Find {
                        filter,
                        projection,
                        sort,
                    },
                )
            }
        }
        TemplateAnnotation::Aggregation { pipeline } => {
            let base = root.child("pipeline");
            let stages = pipeline
                .iter()
                .enumerate()
                .map(|(i, text)| {
                    ctx.record_location(&base.index(i), text.location.clone());
                    Translator::new(text, placeholders).stage()
                })
                .collect();
            (Command::Aggregate, Operation::Aggregate { pipeline: stages })
        }
    };

    ctx.finish(Dialect::Template, command, target, operation)
}

/// Maps one template string onto the canonical model.
///
/// Errors returned from the private helpers reject the whole template;
/// node-level problems are folded into `Malformed` nodes in place.
struct Translator<'p> {
    text: &'p str,
    source: &'p TemplateText,
    placeholders: &'p Placeholders<'p>,
}

impl<'p> Translator<'p> {
    fn new(source: &'p TemplateText, placeholders: &'p Placeholders<'p>) -> Self {
        Self {
            text: source.value.as_str().unwrap_or_default(),
            source,
            placeholders,
        }
    }

    /// The template as a document, or why it is not one.
    fn parse(&self) -> Result<TemplateValue, MalformedReason> {
        if let Some(reason) = self.source.value.unresolved_reason() {
            return Err(MalformedReason::TemplateSyntax(format!(
                "template is not a constant ({})",
                reason
            )));
        }
        syntax::parse(self.text).map_err(|err| {
            tracing::debug!("{}: {}", self.source.location, err);
            MalformedReason::TemplateSyntax(err.message)
        })
    }

    fn raw(&self) -> String {
        if self.source.value.is_resolved() {
            self.text.to_string()
        } else {
            self.source.raw.clone()
        }
    }

    fn slice(&self, span: &Range<usize>) -> &'p str {
        self.text.get(span.clone()).unwrap_or(self.text)
    }

    fn filter(&self) -> Predicate {
        if let Some(reason) = self.source.value.unresolved_reason() {
            return Predicate::Unresolved {
                raw: self.source.raw.clone(),
                reason,
            };
        }
        let result = self.parse().and_then(|root| match root.as_object() {
            Some(entries) => self.document(entries),
            None => Err(MalformedReason::TemplateSyntax(
                "query must be a document".to_string(),
            )),
        });
        result.unwrap_or_else(|reason| Predicate::malformed(self.raw(), reason))
    }

    fn document(&self, entries: &[Entry]) -> Result<Predicate, MalformedReason> {
        let predicates = entries
            .iter()
            .map(|entry| self.entry(entry))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Predicate::conjunction(predicates))
    }

    fn entry(&self, entry: &Entry) -> Result<Predicate, MalformedReason> {
        let raw = self.slice(&entry.span);
        match entry.key.as_str() {
            "$and" | "$or" | "$nor" => {
                let TemplateValue::Array(items) = &entry.value else {
                    return Err(MalformedReason::TemplateSyntax(format!(
                        "{} expects an array",
                        entry.key
                    )));
                };
                let children = items
                    .iter()
                    .map(|item| match item.as_object() {
                        Some(entries) => self.document(entries),
                        None => Err(MalformedReason::TemplateSyntax(format!(
                            "{} expects documents",
                            entry.key
                        ))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(match entry.key.as_str() {
                    "$and" => Predicate::And(children),
                    "$or" => Predicate::Or(children),
                    _ => Predicate::Or(children).negate(),
                })
            }
            key if key.starts_with('$') => Err(MalformedReason::UnknownOperator(key.to_string())),
            key => {
                let field = FieldPath::from(key);
                match &entry.value {
                    TemplateValue::Object(inner) if inner.iter().any(|e| e.key.starts_with('$')) => {
                        if let Some(other) = inner
                            .iter()
                            .find(|e| !FIELD_OPERATORS.contains(&e.key.as_str()))
                        {
                            return Err(if other.key.starts_with('$') {
                                MalformedReason::UnknownOperator(other.key.clone())
                            } else {
                                MalformedReason::TemplateSyntax(format!(
                                    "operators mixed with field {}",
                                    other.key
                                ))
                            });
                        }
                        match inner.as_slice() {
                            [op] => self.operator(field, op, raw),
                            _ => Ok(Predicate::malformed(
                                raw,
                                MalformedReason::ImplicitConjunction,
                            )),
                        }
                    }
                    value => Ok(match self.value(value) {
                        Ok(value) => Predicate::Eq(field, value),
                        Err(reason) => Predicate::malformed(raw, reason),
                    }),
                }
            }
        }
    }

    fn operator(&self, field: FieldPath, op: &Entry, raw: &str) -> Result<Predicate, MalformedReason> {
        let local = |result: Result<Predicate, MalformedReason>| {
            result.unwrap_or_else(|reason| Predicate::malformed(raw, reason))
        };
        Ok(match op.key.as_str() {
            "$in" | "$nin" => {
                let negated = op.key == "$nin";
                local(self.values(&op.value).map(|values| {
                    let predicate = Predicate::In(field, values);
                    if negated {
                        predicate.negate()
                    } else {
                        predicate
                    }
                }))
            }
            "$not" => match op.value.as_object() {
                Some([inner]) if inner.key != "$not" && FIELD_OPERATORS.contains(&inner.key.as_str()) => {
                    self.operator(field, inner, raw)?.negate()
                }
                Some([inner]) => return Err(MalformedReason::UnknownOperator(inner.key.clone())),
                Some(inner) if !inner.is_empty() => {
                    Predicate::malformed(raw, MalformedReason::ImplicitConjunction)
                }
                _ => Predicate::malformed(
                    raw,
                    MalformedReason::TemplateSyntax("$not expects an operator document".to_string()),
                ),
            },
            key => match Comparison::from_operator(key) {
                Some(comparison) => local(self.value(&op.value).map(|v| comparison.apply(field, v))),
                None => return Err(MalformedReason::UnknownOperator(key.to_string())),
            },
        })
    }

    fn value(&self, value: &TemplateValue) -> Result<ResolvedValue, MalformedReason> {
        Ok(match value {
            TemplateValue::String(s) => ResolvedValue::string(s.clone()),
            TemplateValue::Int(i) => ResolvedValue::int(*i),
            TemplateValue::Double(d) => ResolvedValue::Literal(Value::Double(*d)),
            TemplateValue::Bool(b) => ResolvedValue::Literal(Value::Bool(*b)),
            TemplateValue::Null => ResolvedValue::Literal(Value::Null),
            TemplateValue::Array(items) => ResolvedValue::Literal(Value::Array(
                items
                    .iter()
                    .map(|item| self.value(item))
                    .collect::<Result<Vec<_>, MalformedReason>>()?,
            )),
            TemplateValue::Object(entries) => ResolvedValue::Literal(Value::Document(
                entries
                    .iter()
                    .map(|e| Ok((e.key.clone(), self.value(&e.value)?)))
                    .collect::<Result<_, MalformedReason>>()?,
            )),
            TemplateValue::Placeholder(index) => self.placeholders.get(*index)?,
            TemplateValue::Expression(_) => ResolvedValue::unresolved(
                UnresolvedReason::DynamicValue,
                Some(self.source.location.clone()),
            ),
        })
    }

    fn values(&self, value: &TemplateValue) -> Result<Vec<ResolvedValue>, MalformedReason> {
        match value {
            TemplateValue::Array(items) => items.iter().map(|item| self.value(item)).collect(),
            TemplateValue::Placeholder(_) | TemplateValue::Expression(_) => {
                Ok(match self.value(value)? {
                    ResolvedValue::Literal(Value::Array(items)) => items,
                    other => vec![other],
                })
            }
            _ => Err(MalformedReason::TemplateSyntax(
                "$in expects an array".to_string(),
            )),
        }
    }

    fn projection(&self) -> Vec<ProjectField> {
        match self.parse().and_then(|root| self.expect_document(root)) {
            Ok(entries) => self.project_entries(&entries),
            Err(reason) => vec![ProjectField::Malformed {
                raw: self.raw(),
                reason,
            }],
        }
    }

    fn sort(&self) -> Vec<SortField> {
        match self.parse().and_then(|root| self.expect_document(root)) {
            Ok(entries) => self.sort_entries(&entries),
            Err(reason) => vec![SortField::Malformed {
                raw: self.raw(),
                reason,
            }],
        }
    }

    fn expect_document(&self, root: TemplateValue) -> Result<Vec<Entry>, MalformedReason> {
        match root {
            TemplateValue::Object(entries) => Ok(entries),
            _ => Err(MalformedReason::TemplateSyntax(
                "expected a document".to_string(),
            )),
        }
    }

    fn project_entries(&self, entries: &[Entry]) -> Vec<ProjectField> {
        entries
            .iter()
            .map(|entry| {
                let include = match entry.value {
                    TemplateValue::Int(1) | TemplateValue::Bool(true) => Some(true),
                    TemplateValue::Int(0) | TemplateValue::Bool(false) => Some(false),
                    _ => None,
                };
                match include {
                    Some(include) => ProjectField::Field {
                        path: FieldPath::from(entry.key.as_str()),
                        include,
                    },
                    None => ProjectField::Malformed {
                        raw: self.slice(&entry.span).to_string(),
                        reason: MalformedReason::TemplateSyntax(
                            "projection value must be 0 or 1".to_string(),
                        ),
                    },
                }
            })
            .collect()
    }

    fn sort_entries(&self, entries: &[Entry]) -> Vec<SortField> {
        entries
            .iter()
            .map(|entry| {
                let direction = match entry.value {
                    TemplateValue::Int(1) => Some(Direction::Ascending),
                    TemplateValue::Int(-1) => Some(Direction::Descending),
                    _ => None,
                };
                match direction {
                    Some(direction) => SortField::Field {
                        path: FieldPath::from(entry.key.as_str()),
                        direction,
                    },
                    None => SortField::Malformed {
                        raw: self.slice(&entry.span).to_string(),
                        reason: MalformedReason::TemplateSyntax(
                            "sort direction must be 1 or -1".to_string(),
                        ),
                    },
                }
            })
            .collect()
    }

    fn stage(&self) -> PipelineStage {
        let root = match self.parse() {
            Ok(root) => root,
            Err(reason) => {
                return PipelineStage::Malformed {
                    raw: self.raw(),
                    reason,
                }
            }
        };
        let Some([entry]) = root.as_object() else {
            return PipelineStage::Malformed {
                raw: self.raw(),
                reason: MalformedReason::TemplateSyntax(
                    "stage must have exactly one operator".to_string(),
                ),
            };
        };
        match (entry.key.as_str(), &entry.value) {
            ("$match", TemplateValue::Object(inner)) => PipelineStage::Match(
                self.document(inner)
                    .unwrap_or_else(|reason| Predicate::malformed(self.raw(), reason)),
            ),
            ("$project", TemplateValue::Object(inner)) => {
                PipelineStage::Project(self.project_entries(inner))
            }
            ("$sort", TemplateValue::Object(inner)) => PipelineStage::Sort(self.sort_entries(inner)),
            ("$group", TemplateValue::Object(inner)) => self.group(inner),
            (key @ ("$match" | "$project" | "$sort" | "$group"), _) => PipelineStage::Malformed {
                raw: self.raw(),
                reason: MalformedReason::TemplateSyntax(format!("{} expects a document", key)),
            },
            (key, _) => PipelineStage::Malformed {
                raw: self.raw(),
                reason: MalformedReason::UnknownStage(key.to_string()),
            },
        }
    }

    fn group(&self, entries: &[Entry]) -> PipelineStage {
        let mut key = None;
        let mut accumulators = Vec::new();
        for entry in entries {
            let raw = self.slice(&entry.span).to_string();
            if entry.key == "_id" {
                key = Some(match &entry.value {
                    TemplateValue::Object(_) | TemplateValue::Array(_) => {
                        return PipelineStage::Malformed {
                            raw,
                            reason: MalformedReason::UnsupportedOperator(
                                "compound group key".to_string(),
                            ),
                        }
                    }
                    value => match self.value(value) {
                        Ok(ResolvedValue::Unresolved { reason, .. }) => GroupKey::Unresolved(reason),
                        Ok(resolved) => match resolved.as_str().and_then(|s| s.strip_prefix('$')) {
                            Some(field) => GroupKey::Field(FieldPath::from(field)),
                            None => GroupKey::All,
                        },
                        Err(reason) => return PipelineStage::Malformed { raw, reason },
                    },
                });
                continue;
            }
            let Some([acc]) = entry.value.as_object() else {
                return PipelineStage::Malformed {
                    raw,
                    reason: MalformedReason::TemplateSyntax(
                        "accumulator must be { $op: expression }".to_string(),
                    ),
                };
            };
            let Some(operator) = AccumulatorOperator::from_name(&acc.key) else {
                return PipelineStage::Malformed {
                    raw,
                    reason: MalformedReason::UnknownAccumulator(acc.key.clone()),
                };
            };
            let source = match self.value(&acc.value) {
                Ok(value) => AccumulatorSource::from_value(value),
                Err(reason) => return PipelineStage::Malformed { raw, reason },
            };
            accumulators.push(Accumulator {
                name: entry.key.clone(),
                operator,
                source,
            });
        }
        match key {
            Some(key) => PipelineStage::Group { key, accumulators },
            None => PipelineStage::Malformed {
                raw: self.raw(),
                reason: MalformedReason::TemplateSyntax("$group requires _id".to_string()),
            },
        }
    }
}
