//! Spring Data `Criteria` and `Query` objects handed to `MongoTemplate`.
//!
//! Criteria read in reverse: `where("year").gte(1990)` names the field first
//! and the comparator after it, and every comparator applies to the most
//! recent `where`/`and` key.

use tree_sitter::Node;

use super::{CallSite, Context};
use crate::decompose::{base_type, decompose, Argument, CallChain, ChainRoot, ChainStep};
use crate::model::{
    Accumulator, AccumulatorOperator, AccumulatorSource, CanonicalQuery, Command, Comparison,
    Dialect, Direction, DocumentSpec, FieldPath, GroupKey, MalformedReason, NodePath, Operation,
    PipelineStage, Predicate, ProjectField, QueryTarget, ResolvedValue, SortField,
    UnresolvedReason, UpdateSpec, Value,
};
use crate::resolve::Expr;
use crate::syntax::{call_arguments, unwrap_expression};
use crate::Location;

/// Receiver types that issue template commands.
const TEMPLATE_TYPES: &[&str] = &[
    "MongoTemplate",
    "MongoOperations",
    "ReactiveMongoTemplate",
    "ReactiveMongoOperations",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminal {
    Find(Command),
    FindAll,
    FindById,
    Distinct,
    Count,
    EstimatedCount,
    Delete(Command),
    Update(Command),
    /// `insert`, `insertAll` and `save` write a whole entity
    Insert(Command),
    Aggregate,
}

const COMMANDS: &[(&str, Terminal)] = &[
    ("find", Terminal::Find(Command::FindMany)),
    ("findOne", Terminal::Find(Command::FindOne)),
    ("findAll", Terminal::FindAll),
    ("findById", Terminal::FindById),
    ("findDistinct", Terminal::Distinct),
    ("count", Terminal::Count),
    ("exactCount", Terminal::Count),
    ("estimatedCount", Terminal::EstimatedCount),
    ("exists", Terminal::Find(Command::FindOne)),
    ("stream", Terminal::Find(Command::FindMany)),
    ("scroll", Terminal::Find(Command::FindMany)),
    ("findAndModify", Terminal::Update(Command::FindOneAndUpdate)),
    ("findAndRemove", Terminal::Delete(Command::FindOneAndDelete)),
    ("findAllAndRemove", Terminal::Delete(Command::DeleteMany)),
    ("findAndReplace", Terminal::Update(Command::FindOneAndReplace)),
    ("remove", Terminal::Delete(Command::DeleteMany)),
    ("update", Terminal::Update(Command::UpdateMany)),
    ("updateFirst", Terminal::Update(Command::UpdateOne)),
    ("updateMulti", Terminal::Update(Command::UpdateMany)),
    ("upsert", Terminal::Update(Command::Upsert)),
    ("replace", Terminal::Update(Command::ReplaceOne)),
    ("insert", Terminal::Insert(Command::InsertOne)),
    ("insertAll", Terminal::Insert(Command::InsertMany)),
    ("save", Terminal::Insert(Command::Upsert)),
    ("aggregate", Terminal::Aggregate),
    ("aggregateStream", Terminal::Aggregate),
];

/// Terminals of `template.query(X.class).matching(q)`.
const FLUENT_TERMINALS: &[(&str, Command)] = &[
    ("all", Command::FindMany),
    ("stream", Command::FindMany),
    ("first", Command::FindOne),
    ("firstValue", Command::FindOne),
    ("one", Command::FindOne),
    ("oneValue", Command::FindOne),
    ("count", Command::CountDocuments),
    ("exists", Command::FindOne),
];

/// How a chain issues its command.
enum Shape {
    /// `template.find(query, Movie.class)`
    Classic(Terminal),
    /// `template.query(Movie.class).matching(query).all()`
    Fluent(Command),
}

fn shape<'t>(ctx: &Context<'_, 't>, chain: &CallChain<'t>) -> Option<Shape> {
    let first = chain.steps.first()?;
    if chain.step("getCollection").is_some() {
        return None;
    }
    let on_template = TEMPLATE_TYPES.iter().any(|t| chain.has_type(t));

    if first.name == "query" && !matches!(chain.root, ChainRoot::Unqualified | ChainRoot::Static(_)) {
        let terminal = chain.steps.last().and_then(|last| {
            FLUENT_TERMINALS
                .iter()
                .find(|(name, _)| *name == last.name)
                .map(|(_, command)| *command)
        });
        let entity_class = first
            .argument(0)
            .is_some_and(|arg| matches!(arg.value, ResolvedValue::Literal(Value::Class(_))));
        return match terminal {
            Some(command) if chain.steps.len() > 1 && (on_template || entity_class) => {
                Some(Shape::Fluent(command))
            }
            _ => None,
        };
    }

    let terminal = COMMANDS
        .iter()
        .find(|(name, _)| *name == first.name)
        .map(|(_, terminal)| *terminal)?;
    let query_argument = first
        .argument(0)
        .is_some_and(|arg| is_query(ctx, &arg.expr));
    (on_template || query_argument).then_some(Shape::Classic(terminal))
}

pub fn accepts<'t>(ctx: &Context<'_, 't>, site: &CallSite<'t>) -> bool {
    match site {
        CallSite::Call { chain, .. } => shape(ctx, chain).is_some(),
        CallSite::AnnotatedMethod { .. } => false,
    }
}

pub fn recognize<'t>(ctx: &Context<'_, 't>, site: &CallSite<'t>) -> CanonicalQuery {
    let node = site.node();
    let Some((chain, shape)) = (match site {
        CallSite::Call { chain, .. } => shape(ctx, chain).map(|shape| (chain, shape)),
        CallSite::AnnotatedMethod { .. } => None,
    }) else {
        return CanonicalQuery::unsupported(ctx.text(node), ctx.location(node));
    };

    let location = ctx.location(node);
    ctx.record(&NodePath::root(), node);
    let (command, target, operation) = match shape {
        Shape::Classic(terminal) => classic(ctx, chain, terminal, &location),
        Shape::Fluent(command) => fluent(ctx, chain, command, &location),
    };
    ctx.finish(Dialect::Criteria, command, target, operation)
}

fn classic<'t>(
    ctx: &Context<'_, 't>,
    chain: &CallChain<'t>,
    terminal: Terminal,
    location: &Location,
) -> (Command, QueryTarget, Operation) {
    let args = chain.steps[0].arguments.as_slice();
    let root = NodePath::root();
    let query_at = |i: usize| match args.get(i) {
        Some(arg) => query_parts(ctx, &arg.expr),
        None => QueryParts::match_all(),
    };

    let first_collection_arg = if terminal == Terminal::Distinct { 2 } else { 1 };
    let explicit = args
        .iter()
        .skip(first_collection_arg)
        .find(|arg| is_collection_name(ctx, arg));
    let entity = match terminal {
        Terminal::Insert(_) => entity_class(args).or_else(|| document_entity(ctx, args.first())),
        Terminal::Update(Command::ReplaceOne) => {
            entity_class(args).or_else(|| document_entity(ctx, args.get(1)))
        }
        Terminal::Aggregate => typed_aggregation(ctx, args.first())
            .or_else(|| args.get(1..2).filter(|_| args.len() > 2).and_then(entity_class)),
        _ => entity_class(args),
    };
    let target = target(ctx, entity, explicit, location);

    let (command, operation) = match terminal {
        Terminal::Find(command) => (command, query_at(0).into_find()),
        Terminal::FindAll => (Command::FindMany, Operation::find(Predicate::match_all())),
        Terminal::FindById => {
            let filter = match args.first() {
                Some(id) => {
                    ctx.record(&root.child("filter"), id.expr.node);
                    Predicate::Eq(FieldPath::from("_id"), id.value.clone())
                }
                None => Predicate::malformed(
                    ctx.text(chain.steps[0].call.node),
                    MalformedReason::InvalidArity {
                        operator: "findById".to_string(),
                        count: 0,
                    },
                ),
            };
            (Command::FindOne, Operation::find(filter))
        }
        Terminal::Distinct => {
            let filter = query_at(0).filter;
            let field = distinct_field(ctx, args.get(1));
            (
                Command::Distinct,
                Operation::Find {
                    filter,
                    projection: Some(vec![field]),
                    sort: None,
                },
            )
        }
        Terminal::Count => (
            Command::CountDocuments,
            Operation::Count {
                filter: query_at(0).filter,
            },
        ),
        Terminal::EstimatedCount => (
            Command::EstimatedDocumentCount,
            Operation::Count {
                filter: Predicate::match_all(),
            },
        ),
        Terminal::Delete(command) => (
            command,
            Operation::Delete {
                filter: query_at(0).filter,
            },
        ),
        Terminal::Insert(command) => {
            let document = args.first().map(|arg| {
                ctx.record(&root.child("document"), arg.expr.node);
                DocumentSpec {
                    raw: ctx.text(unwrap_expression(arg.expr.node)).to_string(),
                }
            });
            (command, Operation::Insert { document })
        }
        Terminal::Aggregate => {
            let pipeline = match args.first() {
                Some(arg) => aggregation(ctx, &arg.expr, &root.child("pipeline")),
                None => Vec::new(),
            };
            (Command::Aggregate, Operation::Aggregate { pipeline })
        }
        Terminal::Update(command) => {
            let filter = query_at(0).filter;
            let update = args.get(1).map(|arg| {
                ctx.record(&root.child("update"), arg.expr.node);
                UpdateSpec {
                    raw: ctx.text(unwrap_expression(arg.expr.node)).to_string(),
                }
            });
            (command, Operation::Update { filter, update })
        }
    };
    (command, target, operation)
}

fn fluent<'t>(
    ctx: &Context<'_, 't>,
    chain: &CallChain<'t>,
    command: Command,
    location: &Location,
) -> (Command, QueryTarget, Operation) {
    let entity = entity_class(&chain.steps[0].arguments);
    let explicit = chain
        .step("inCollection")
        .and_then(|(_, step)| step.argument(0));
    let target = target(ctx, entity, explicit, location);

    let mut parts = QueryParts::match_all();
    let mut distinct = None;
    for step in &chain.steps[1..] {
        match (step.name.as_str(), step.argument(0)) {
            ("matching", Some(arg)) if is_query(ctx, &arg.expr) => parts = query_parts(ctx, &arg.expr),
            ("matching", Some(arg)) => {
                let mut pieces = Vec::new();
                criteria_pieces(ctx, &arg.expr, &mut pieces);
                parts.filter = assemble(ctx, pieces, &NodePath::root().child("filter"));
            }
            ("distinct", Some(arg)) => distinct = Some(arg),
            _ => {}
        }
    }

    if let Some(field) = distinct {
        let projection = Some(vec![distinct_field(ctx, Some(field))]);
        return (
            Command::Distinct,
            target,
            Operation::Find {
                filter: parts.filter,
                projection,
                sort: None,
            },
        );
    }
    let operation = match command {
        Command::CountDocuments => Operation::Count {
            filter: parts.filter,
        },
        _ => parts.into_find(),
    };
    (command, target, operation)
}

fn target<'t>(
    ctx: &Context<'_, 't>,
    entity: Option<String>,
    explicit: Option<&Argument<'t>>,
    location: &Location,
) -> QueryTarget {
    let path = NodePath::root().child("target");
    ctx.record_location(&path.child("database"), location.clone());
    let collection = match (explicit, entity) {
        (Some(arg), _) => {
            ctx.record(&path.child("collection"), arg.expr.node);
            arg.value.clone()
        }
        (None, Some(class)) => {
            let binding = ctx.table().entity(&class).map(|b| b.location.clone());
            ctx.record_location(
                &path.child("collection"),
                binding.unwrap_or_else(|| location.clone()),
            );
            ctx.table().collection_for(&class, location.clone())
        }
        (None, None) => {
            ResolvedValue::unresolved(UnresolvedReason::DynamicValue, Some(location.clone()))
        }
    };
    QueryTarget {
        database: ctx.default_database(location),
        collection,
    }
}

/// Simple name of the first `X.class` argument.
fn entity_class(args: &[Argument<'_>]) -> Option<String> {
    args.iter().find_map(|arg| match &arg.value {
        ResolvedValue::Literal(Value::Class(name)) => Some(base_type(name).to_string()),
        _ => None,
    })
}

/// Entity written by `insert(movie)` or `insertAll(movies)`, from the
/// declared type of the argument or its element type.
fn document_entity<'t>(ctx: &Context<'_, 't>, arg: Option<&Argument<'t>>) -> Option<String> {
    let declared = ctx.resolver.declared_type(&arg?.expr)?;
    let element = match (declared.find('<'), declared.rfind('>')) {
        (Some(open), Some(close)) if open < close => &declared[open + 1..close],
        _ => declared.as_str(),
    };
    // `? extends Movie`
    let name = element.split_whitespace().last()?;
    Some(base_type(name).to_string())
}

fn is_collection_name<'t>(ctx: &Context<'_, 't>, arg: &Argument<'t>) -> bool {
    arg.value.as_str().is_some()
        || ctx
            .resolver
            .declared_type(&arg.expr)
            .is_some_and(|t| base_type(&t) == "String")
}

fn distinct_field<'t>(ctx: &Context<'_, 't>, arg: Option<&Argument<'t>>) -> ProjectField {
    let Some(arg) = arg else {
        return ProjectField::Malformed {
            raw: String::new(),
            reason: MalformedReason::MissingFieldPath,
        };
    };
    ctx.record(&NodePath::root().child("projection").index(0), arg.expr.node);
    match ctx.resolver.field_path(&arg.expr) {
        Ok(path) => ProjectField::Field {
            path,
            include: true,
        },
        Err(reason) => ProjectField::Malformed {
            raw: ctx.text(arg.expr.node).to_string(),
            reason,
        },
    }
}

fn is_new<'t>(ctx: &Context<'_, 't>, node: Node<'t>, type_name: &str) -> bool {
    node.kind() == "object_creation_expression"
        && node
            .child_by_field_name("type")
            .is_some_and(|t| base_type(ctx.text(t)) == type_name)
}

/// Whether an expression builds a `Query`.
fn is_query<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>) -> bool {
    let Ok(chain) = decompose(ctx.resolver, expr) else {
        return false;
    };
    if chain.has_type("Query") {
        return true;
    }
    match &chain.root {
        ChainRoot::Unqualified => chain.steps.first().is_some_and(|s| s.name == "query"),
        ChainRoot::Static(_) => {
            chain.static_root() == Some("Query") && chain.steps.first().is_some_and(|s| s.name == "query")
        }
        ChainRoot::Expression(root) => is_new(ctx, unwrap_expression(root.node), "Query"),
        ChainRoot::Opaque { declared_type, .. } => declared_type
            .as_deref()
            .is_some_and(|t| base_type(t) == "Query"),
    }
}

/// Filter, projection and sort carried by a `Query`.
struct QueryParts {
    filter: Predicate,
    projection: Option<Vec<ProjectField>>,
    sort: Option<Vec<SortField>>,
}

impl QueryParts {
    fn match_all() -> Self {
        Self {
            filter: Predicate::match_all(),
            projection: None,
            sort: None,
        }
    }

    fn into_find(self) -> Operation {
        Operation::Find {
            filter: self.filter,
            projection: self.projection,
            sort: self.sort,
        }
    }
}

fn query_parts<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>) -> QueryParts {
    let root = NodePath::root();
    let node = unwrap_expression(expr.node);
    let mut pieces = Vec::new();
    let mut parts = QueryParts::match_all();

    match decompose(ctx.resolver, expr) {
        Err(unsupported) => {
            tracing::debug!("{}: {}", ctx.location(node), unsupported);
            pieces.push(Piece::Leaf {
                predicate: Predicate::Unresolved {
                    raw: ctx.text(node).to_string(),
                    reason: UnresolvedReason::DynamicValue,
                },
                node,
            });
        }
        Ok(chain) => {
            match &chain.root {
                ChainRoot::Opaque { text, reason, .. } => pieces.push(Piece::Leaf {
                    predicate: Predicate::Unresolved {
                        raw: text.clone(),
                        reason: *reason,
                    },
                    node,
                }),
                ChainRoot::Expression(created) => {
                    let created_node = unwrap_expression(created.node);
                    if is_new(ctx, created_node, "Query") {
                        for arg in call_arguments(created_node) {
                            criteria_pieces(ctx, &created.with_node(arg), &mut pieces);
                        }
                    } else {
                        pieces.push(Piece::Leaf {
                            predicate: Predicate::malformed(
                                ctx.text(created_node),
                                MalformedReason::NotAPredicate,
                            ),
                            node: created_node,
                        });
                    }
                }
                ChainRoot::Unqualified | ChainRoot::Static(_) => {}
            }

            let mut in_fields = false;
            for step in &chain.steps {
                match step.name.as_str() {
                    "query" | "addCriteria" => {
                        for arg in &step.arguments {
                            criteria_pieces(ctx, &arg.expr, &mut pieces);
                        }
                    }
                    "with" => {
                        if let Some(fields) = step
                            .argument(0)
                            .and_then(|arg| sort_fields(ctx, &arg.expr, &root.child("sort")))
                        {
                            parts.sort.get_or_insert_with(Vec::new).extend(fields);
                        }
                    }
                    "fields" => in_fields = true,
                    "include" | "exclude" if in_fields => {
                        ctx.record(&root.child("projection"), step.call.node);
                        let include = step.name == "include";
                        let fields = step.arguments.iter().map(|arg| match ctx.resolver.field_path(&arg.expr) {
                            Ok(path) => ProjectField::Field { path, include },
                            Err(reason) => ProjectField::Malformed {
                                raw: ctx.text(arg.expr.node).to_string(),
                                reason,
                            },
                        });
                        parts.projection.get_or_insert_with(Vec::new).extend(fields);
                    }
                    _ => {}
                }
            }
        }
    }

    parts.filter = assemble(ctx, pieces, &root.child("filter"));
    parts
}

/// `Sort.by([direction,] fields..)`, optionally `.ascending()`, `.descending()`
/// or `.and(other)`. `None` for anything else handed to `with`, e.g. a `Pageable`.
fn sort_fields<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>, path: &NodePath) -> Option<Vec<SortField>> {
    let chain = decompose(ctx.resolver, expr).ok()?;
    let (first, rest) = chain.steps.split_first()?;
    if chain.static_root() != Some("Sort") || first.name != "by" {
        return None;
    }
    ctx.record(path, unwrap_expression(expr.node));

    let mut args = first.arguments.as_slice();
    let mut direction = Direction::Ascending;
    if let Some(given) = args.first().and_then(|arg| sort_direction(ctx, arg)) {
        direction = given;
        args = &args[1..];
    }
    let mut fields: Vec<SortField> = spread(ctx, args)
        .into_iter()
        .map(|(raw, value)| match value.as_str() {
            Some(name) => SortField::Field {
                path: FieldPath::from(name),
                direction,
            },
            None => SortField::Malformed {
                raw,
                reason: MalformedReason::UnresolvedFieldPath,
            },
        })
        .collect();

    for step in rest {
        match (step.name.as_str(), step.argument(0)) {
            ("ascending" | "descending", _) => {
                let flipped = if step.name == "ascending" {
                    Direction::Ascending
                } else {
                    Direction::Descending
                };
                for field in &mut fields {
                    if let SortField::Field { direction, .. } = field {
                        *direction = flipped;
                    }
                }
            }
            ("and", Some(other)) => fields.extend(sort_fields(ctx, &other.expr, path)?),
            _ => return None,
        }
    }
    Some(fields)
}

fn sort_direction<'t>(ctx: &Context<'_, 't>, arg: &Argument<'t>) -> Option<Direction> {
    let text = ctx.text(unwrap_expression(arg.expr.node));
    match text.rsplit('.').next().map(str::trim) {
        Some("ASC") => Some(Direction::Ascending),
        Some("DESC") => Some(Direction::Descending),
        _ => None,
    }
}

/// Raw text and value of varargs, or of the elements of a single array or
/// collection argument.
fn spread<'t>(ctx: &Context<'_, 't>, args: &[Argument<'t>]) -> Vec<(String, ResolvedValue)> {
    if let [single] = args {
        if let Some(items) = ctx.resolver.elements(&single.expr) {
            return items
                .iter()
                .map(|item| (ctx.text(item.node).to_string(), ctx.resolver.resolve(item)))
                .collect();
        }
    }
    args.iter()
        .map(|arg| (ctx.text(arg.expr.node).to_string(), arg.value.clone()))
        .collect()
}

/// `newAggregation(Movie.class, ..)` names its entity.
fn typed_aggregation<'t>(ctx: &Context<'_, 't>, arg: Option<&Argument<'t>>) -> Option<String> {
    let chain = decompose(ctx.resolver, &arg?.expr).ok()?;
    match chain.steps.as_slice() {
        [step] if step.name == "newAggregation" && is_aggregation_root(&chain) => {
            entity_class(step.arguments.get(..1)?)
        }
        _ => None,
    }
}

fn is_aggregation_root(chain: &CallChain<'_>) -> bool {
    match chain.root {
        ChainRoot::Unqualified => true,
        ChainRoot::Static(_) => chain.static_root() == Some("Aggregation"),
        _ => false,
    }
}

/// Stages of an `Aggregation` handed to `aggregate`. Anything other than a
/// visible `newAggregation(..)` call stays a single unresolved stage.
fn aggregation<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>, base: &NodePath) -> Vec<PipelineStage> {
    let node = unwrap_expression(expr.node);
    let raw = ctx.text(node).to_string();
    let unresolved = |reason| {
        ctx.record(base, node);
        vec![PipelineStage::Unresolved {
            raw: raw.clone(),
            reason,
        }]
    };
    let chain = match decompose(ctx.resolver, expr) {
        Ok(chain) => chain,
        Err(unsupported) => {
            tracing::debug!("{}: {}", ctx.location(node), unsupported);
            return unresolved(UnresolvedReason::DynamicValue);
        }
    };
    let step = match (chain.steps.as_slice(), &chain.root) {
        ([step], _) if step.name == "newAggregation" && is_aggregation_root(&chain) => step,
        ([], ChainRoot::Opaque { reason, .. }) => return unresolved(*reason),
        _ => return unresolved(UnresolvedReason::UnsupportedExpression),
    };

    let operations: Vec<&Argument<'t>> = step
        .arguments
        .iter()
        .filter(|arg| !matches!(arg.value, ResolvedValue::Literal(Value::Class(_))))
        .collect();
    let items = match operations.as_slice() {
        [single] => ctx
            .resolver
            .elements(&single.expr)
            .unwrap_or_else(|| vec![single.expr.clone()]),
        args => args.iter().map(|arg| arg.expr.clone()).collect(),
    };
    items
        .iter()
        .enumerate()
        .map(|(i, item)| aggregation_stage(ctx, item, &base.index(i)))
        .collect()
}

fn aggregation_stage<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>, path: &NodePath) -> PipelineStage {
    let node = unwrap_expression(expr.node);
    ctx.record(path, node);
    let raw = ctx.text(node).to_string();
    let chain = match decompose(ctx.resolver, expr) {
        Ok(chain) => chain,
        Err(_) => {
            return PipelineStage::Unresolved {
                raw,
                reason: UnresolvedReason::DynamicValue,
            }
        }
    };
    let (first, rest) = match (chain.steps.split_first(), &chain.root) {
        (Some(split), _) if is_aggregation_root(&chain) => split,
        (None, ChainRoot::Opaque { reason, .. }) => {
            return PipelineStage::Unresolved {
                raw,
                reason: *reason,
            }
        }
        _ => {
            return PipelineStage::Malformed {
                raw,
                reason: MalformedReason::NotAPredicate,
            }
        }
    };
    let args = first.arguments.as_slice();
    match (first.name.as_str(), args) {
        ("match", [criteria]) => {
            let mut pieces = Vec::new();
            criteria_pieces(ctx, &criteria.expr, &mut pieces);
            PipelineStage::Match(assemble(ctx, pieces, &path.child("filter")))
        }
        ("sort", [sort]) => match sort_fields(ctx, &sort.expr, &path.child("fields")) {
            Some(fields) => PipelineStage::Sort(fields),
            None => PipelineStage::Unresolved {
                raw,
                reason: UnresolvedReason::DynamicValue,
            },
        },
        ("sort", [direction, fields @ ..]) if !fields.is_empty() => {
            let Some(direction) = sort_direction(ctx, direction) else {
                return PipelineStage::Malformed {
                    raw,
                    reason: MalformedReason::UnresolvedFieldPath,
                };
            };
            let fields = spread(ctx, fields)
                .into_iter()
                .map(|(raw, value)| match value.as_str() {
                    Some(name) => SortField::Field {
                        path: FieldPath::from(name),
                        direction,
                    },
                    None => SortField::Malformed {
                        raw,
                        reason: MalformedReason::UnresolvedFieldPath,
                    },
                })
                .collect();
            PipelineStage::Sort(fields)
        }
        ("project", _) => {
            let mut fields = projected(ctx, args, true);
            for step in rest {
                match step.name.as_str() {
                    "andInclude" => fields.extend(projected(ctx, &step.arguments, true)),
                    "andExclude" => fields.extend(projected(ctx, &step.arguments, false)),
                    _ => {}
                }
            }
            PipelineStage::Project(fields)
        }
        ("group", _) => aggregation_group(ctx, args, rest, path, raw),
        (name @ ("match" | "sort"), _) => PipelineStage::Malformed {
            raw,
            reason: MalformedReason::InvalidArity {
                operator: name.to_string(),
                count: args.len(),
            },
        },
        (other, _) => PipelineStage::Malformed {
            raw,
            reason: MalformedReason::UnknownStage(other.to_string()),
        },
    }
}

fn projected<'t>(ctx: &Context<'_, 't>, args: &[Argument<'t>], include: bool) -> Vec<ProjectField> {
    spread(ctx, args)
        .into_iter()
        .map(|(raw, value)| match value.as_str() {
            Some(name) => ProjectField::Field {
                path: FieldPath::from(name),
                include,
            },
            None => ProjectField::Malformed {
                raw,
                reason: MalformedReason::UnresolvedFieldPath,
            },
        })
        .collect()
}

/// `group("year").count().as("n").sum("gross").as("total")`: each operator
/// step is named by the `as` that follows it.
fn aggregation_group<'t>(
    ctx: &Context<'_, 't>,
    keys: &[Argument<'t>],
    rest: &[ChainStep<'t>],
    path: &NodePath,
    raw: String,
) -> PipelineStage {
    let key = match keys {
        [] => GroupKey::All,
        [key] => {
            ctx.record(&path.child("key"), key.expr.node);
            match &key.value {
                ResolvedValue::Literal(Value::String(name)) => {
                    GroupKey::Field(FieldPath::from(name.strip_prefix('$').unwrap_or(name)))
                }
                ResolvedValue::Unresolved { reason, .. } => GroupKey::Unresolved(*reason),
                _ => {
                    return PipelineStage::Malformed {
                        raw,
                        reason: MalformedReason::UnresolvedFieldPath,
                    }
                }
            }
        }
        _ => {
            return PipelineStage::Malformed {
                raw,
                reason: MalformedReason::UnsupportedOperator("compound group key".to_string()),
            }
        }
    };

    let base = path.child("accumulators");
    let mut accumulators = Vec::new();
    let mut steps = rest.iter();
    while let Some(step) = steps.next() {
        let item_raw = ctx.text(step.call.node).to_string();
        let (operator, source) = if step.name == "count" && step.arity() == 0 {
            (
                AccumulatorOperator::Sum,
                AccumulatorSource::Value(ResolvedValue::Literal(Value::Int(1))),
            )
        } else {
            let Some(operator) = AccumulatorOperator::from_name(&step.name) else {
                return PipelineStage::Malformed {
                    raw: item_raw,
                    reason: MalformedReason::UnknownAccumulator(step.name.clone()),
                };
            };
            let source = match step.arguments.as_slice() {
                [field] => match field.value.as_str() {
                    Some(name) => {
                        AccumulatorSource::Field(FieldPath::from(name.strip_prefix('$').unwrap_or(name)))
                    }
                    None => AccumulatorSource::Value(field.value.clone()),
                },
                args => {
                    return PipelineStage::Malformed {
                        raw: item_raw,
                        reason: MalformedReason::InvalidArity {
                            operator: step.name.clone(),
                            count: args.len(),
                        },
                    }
                }
            };
            (operator, source)
        };
        let name = steps
            .next()
            .filter(|alias| alias.name == "as")
            .and_then(|alias| alias.argument(0))
            .and_then(|alias| alias.value.as_str().map(str::to_string));
        let Some(name) = name else {
            return PipelineStage::Malformed {
                raw: item_raw,
                reason: MalformedReason::MissingFieldPath,
            };
        };
        ctx.record(&base.index(accumulators.len()), step.call.node);
        accumulators.push(Accumulator {
            name,
            operator,
            source,
        });
    }
    PipelineStage::Group { key, accumulators }
}

/// One conjunct of a query filter. Operator children are translated once
/// their position in the model is known.
enum Piece<'t> {
    Leaf {
        predicate: Predicate,
        node: Node<'t>,
    },
    Operator {
        name: String,
        items: Vec<Expr<'t>>,
        node: Node<'t>,
    },
}

/// Conjunction of pieces, recording each piece's span.
fn assemble<'t>(ctx: &Context<'_, 't>, pieces: Vec<Piece<'t>>, path: &NodePath) -> Predicate {
    let single = pieces.len() == 1;
    let predicates = pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            let at = if single { path.clone() } else { path.index(i) };
            match piece {
                Piece::Leaf { predicate, node } => {
                    ctx.record(&at, node);
                    predicate
                }
                Piece::Operator { name, items, node } => {
                    ctx.record(&at, node);
                    let base = if name == "norOperator" { at.index(0) } else { at };
                    let children = items
                        .iter()
                        .enumerate()
                        .map(|(j, item)| {
                            let mut pieces = Vec::new();
                            criteria_pieces(ctx, item, &mut pieces);
                            assemble(ctx, pieces, &base.index(j))
                        })
                        .collect();
                    match name.as_str() {
                        "andOperator" => Predicate::And(children),
                        "orOperator" => Predicate::Or(children),
                        _ => Predicate::Or(children).negate(),
                    }
                }
            }
        })
        .collect();
    Predicate::conjunction(predicates)
}

/// The key a comparator applies to.
enum Key {
    None,
    Field(FieldPath),
    Invalid(MalformedReason),
}

/// Walk a `Criteria` chain into pieces.
fn criteria_pieces<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>, pieces: &mut Vec<Piece<'t>>) {
    let node = unwrap_expression(expr.node);
    let chain = match decompose(ctx.resolver, expr) {
        Ok(chain) => chain,
        Err(unsupported) => {
            tracing::debug!("{}: {}", ctx.location(node), unsupported);
            pieces.push(Piece::Leaf {
                predicate: Predicate::Unresolved {
                    raw: ctx.text(node).to_string(),
                    reason: UnresolvedReason::DynamicValue,
                },
                node,
            });
            return;
        }
    };

    let mut key = Key::None;
    match &chain.root {
        ChainRoot::Opaque { text, reason, .. } if chain.steps.is_empty() => {
            pieces.push(Piece::Leaf {
                predicate: Predicate::Unresolved {
                    raw: text.clone(),
                    reason: *reason,
                },
                node,
            });
            return;
        }
        ChainRoot::Expression(created) => {
            let created_node = unwrap_expression(created.node);
            if !is_new(ctx, created_node, "Criteria") {
                pieces.push(Piece::Leaf {
                    predicate: Predicate::malformed(ctx.text(node), MalformedReason::NotAPredicate),
                    node,
                });
                return;
            }
            if let Some(field) = call_arguments(created_node).first() {
                key = field_key(ctx, &created.with_node(*field));
            }
        }
        _ => {}
    }

    // a key set by where/and that no comparator has used yet
    let mut pending: Option<Node<'t>> = None;
    let mut negate_next = false;
    for step in &chain.steps {
        let name = step.name.as_str();
        let call = step.call.node;
        let raw = || ctx.text(call).to_string();
        let leaf = match name {
            "where" | "and" => {
                if let Some(open) = pending.take() {
                    pieces.push(incomplete(ctx, open));
                }
                key = match step.argument(0) {
                    Some(arg) => field_key(ctx, &arg.expr),
                    None => Key::Invalid(MalformedReason::MissingFieldPath),
                };
                pending = Some(call);
                continue;
            }
            "not" if step.arity() == 0 => {
                negate_next = true;
                continue;
            }
            "andOperator" | "orOperator" | "norOperator" => {
                let items = match step.arguments.as_slice() {
                    [single] => ctx
                        .resolver
                        .elements(&single.expr)
                        .unwrap_or_else(|| vec![single.expr.clone()]),
                    args => args.iter().map(|arg| arg.expr.clone()).collect(),
                };
                pieces.push(Piece::Operator {
                    name: name.to_string(),
                    items,
                    node: call,
                });
                continue;
            }
            _ => comparator(ctx, &key, name, &step.arguments, raw()),
        };
        pending = None;
        let leaf = if std::mem::take(&mut negate_next) {
            leaf.negate()
        } else {
            leaf
        };
        pieces.push(Piece::Leaf {
            predicate: leaf,
            node: call,
        });
    }
    if let Some(open) = pending {
        pieces.push(incomplete(ctx, open));
    }
}

fn field_key<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>) -> Key {
    match ctx.resolver.field_path(expr) {
        Ok(path) => Key::Field(path),
        Err(reason) => Key::Invalid(reason),
    }
}

fn incomplete<'t>(ctx: &Context<'_, 't>, call: Node<'t>) -> Piece<'t> {
    Piece::Leaf {
        predicate: Predicate::malformed(ctx.text(call), MalformedReason::IncompleteCriteria),
        node: call,
    }
}

fn comparator<'t>(
    ctx: &Context<'_, 't>,
    key: &Key,
    name: &str,
    args: &[Argument<'t>],
    raw: String,
) -> Predicate {
    let field = match key {
        Key::Field(field) => field.clone(),
        Key::Invalid(reason) => return Predicate::malformed(raw, reason.clone()),
        Key::None => return Predicate::malformed(raw, MalformedReason::MissingFieldPath),
    };
    let comparison = match name {
        "is" => Some(Comparison::Eq),
        other => Comparison::from_method(other),
    };
    if let Some(comparison) = comparison {
        return match args {
            [value] => comparison.apply(field, value.value.clone()),
            _ => Predicate::malformed(
                raw,
                MalformedReason::InvalidArity {
                    operator: name.to_string(),
                    count: args.len(),
                },
            ),
        };
    }
    match name {
        "in" | "nin" => {
            let values = spread(ctx, args).into_iter().map(|(_, value)| value).collect();
            let predicate = Predicate::In(field, values);
            if name == "nin" {
                predicate.negate()
            } else {
                predicate
            }
        }
        other => Predicate::malformed(raw, MalformedReason::UnsupportedOperator(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::extract::Analysis;
    use crate::syntax::SourceUnit;

    const ENTITIES: &str = r#"
@Document(collection = "movies")
public class Movie {}

@Document
public class Review {}
"#;

    fn analyze_with(source: &str, config: Config) -> Vec<CanonicalQuery> {
        let units = vec![
            SourceUnit::parse("Movie.java", ENTITIES).expect("Should parse"),
            SourceUnit::parse("MovieService.java", source).expect("Should parse"),
        ];
        Analysis::new(units, config)
            .extract_all()
            .into_iter()
            .flat_map(|file| file.queries)
            .collect()
    }

    fn single(source: &str) -> CanonicalQuery {
        let mut queries = analyze_with(source, Config::default());
        assert_eq!(queries.len(), 1, "Expected one query, got {:?}", queries);
        queries.remove(0)
    }

    fn field(name: &str) -> FieldPath {
        FieldPath::from(name)
    }

    #[test]
    fn test_reversed_criteria() {
        let query = single(
            r#"
class MovieService {
    private final MongoTemplate mongoTemplate;

    List<Movie> recent() {
        return mongoTemplate.find(Query.query(Criteria.where("field").gte(5)), Movie.class);
    }
}
"#,
        );
        assert_eq!(query.dialect, Some(Dialect::Criteria));
        assert_eq!(query.command, Command::FindMany);
        assert_eq!(
            query.operation.filter(),
            Some(&Predicate::Gte(field("field"), ResolvedValue::int(5)))
        );
        assert_eq!(query.target.collection, ResolvedValue::string("movies"));
        assert_eq!(
            query.target.database.unresolved_reason(),
            Some(UnresolvedReason::ExternalConfiguration)
        );
    }

    #[test]
    fn test_chained_keys_and_negation() {
        let query = single(
            r#"
import static org.springframework.data.mongodb.core.query.Criteria.where;
import static org.springframework.data.mongodb.core.query.Query.query;

class MovieService {
    private final MongoTemplate template;

    Movie pick() {
        return template.findOne(
            query(where("year").gte(1990).lt(2000).and("rated").not().is("R").and("genres").in("Drama", "Crime")),
            Movie.class);
    }
}
"#,
        );
        assert_eq!(query.command, Command::FindOne);
        assert_eq!(
            query.operation.filter(),
            Some(&Predicate::And(vec![
                Predicate::Gte(field("year"), ResolvedValue::int(1990)),
                Predicate::Lt(field("year"), ResolvedValue::int(2000)),
                Predicate::Eq(field("rated"), ResolvedValue::string("R")).negate(),
                Predicate::In(
                    field("genres"),
                    vec![ResolvedValue::string("Drama"), ResolvedValue::string("Crime")]
                ),
            ]))
        );
        assert!(query
            .source_locations
            .contains_key(&NodePath::root().child("filter").index(3)));
    }

    #[test]
    fn test_operators_and_malformed_leaves() {
        let query = single(
            r#"
class MovieService {
    private final MongoOperations ops;

    long count() {
        Criteria rated = Criteria.where("rated").is("PG");
        return ops.count(
            new Query(new Criteria().orOperator(rated, Criteria.where("year").nin(List.of(1999, 2000))))
                .addCriteria(Criteria.where("title").regex("^A"))
                .addCriteria(Criteria.where("awards")),
            Movie.class);
    }
}
"#,
        );
        assert_eq!(query.command, Command::CountDocuments);
        let Some(Predicate::And(children)) = query.operation.filter() else {
            panic!("Expected And, got {:?}", query.operation);
        };
        assert_eq!(children.len(), 3);
        assert_eq!(
            children[0],
            Predicate::Or(vec![
                Predicate::Eq(field("rated"), ResolvedValue::string("PG")),
                Predicate::In(field("year"), vec![ResolvedValue::int(1999), ResolvedValue::int(2000)])
                    .negate(),
            ])
        );
        assert!(matches!(
            &children[1],
            Predicate::Malformed {
                reason: MalformedReason::UnsupportedOperator(op),
                ..
            } if op == "regex"
        ));
        assert!(matches!(
            &children[2],
            Predicate::Malformed {
                reason: MalformedReason::IncompleteCriteria,
                ..
            }
        ));
    }

    #[test]
    fn test_comparator_without_key() {
        let query = single(
            r#"
class MovieService {
    private final MongoTemplate template;

    List<Movie> broken() {
        return template.find(new Query(new Criteria().is(5)), Movie.class);
    }
}
"#,
        );
        assert!(matches!(
            query.operation.filter(),
            Some(Predicate::Malformed {
                reason: MalformedReason::MissingFieldPath,
                ..
            })
        ));
    }

    #[test]
    fn test_sort_projection_and_explicit_collection() {
        let query = single(
            r#"
class MovieService {
    private final MongoTemplate template;

    List<Movie> top(String title) {
        Query query = new Query(Criteria.where("title").is(title))
            .with(Sort.by(Sort.Direction.DESC, "rating", "year"));
        return template.find(query, Movie.class, "movies_archive");
    }
}
"#,
        );
        assert_eq!(query.target.collection, ResolvedValue::string("movies_archive"));
        let Operation::Find { filter, sort, .. } = &query.operation else {
            panic!("Expected Find, got {:?}", query.operation);
        };
        assert!(matches!(filter, Predicate::Eq(f, v) if f.as_str() == "title" && !v.is_resolved()));
        assert_eq!(
            sort.as_deref(),
            Some(
                &[
                    SortField::Field {
                        path: field("rating"),
                        direction: Direction::Descending
                    },
                    SortField::Field {
                        path: field("year"),
                        direction: Direction::Descending
                    },
                ][..]
            )
        );
    }

    #[test]
    fn test_find_by_id_and_find_all() {
        let queries = analyze_with(
            r#"
class MovieService {
    private final MongoTemplate template;

    Movie byId(String id) {
        return template.findById(id, Movie.class);
    }

    List<Review> reviews() {
        return template.findAll(Review.class);
    }
}
"#,
            Config {
                default_database: Some("sample_mflix".to_string()),
                ..Config::default()
            },
        );
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].command, Command::FindOne);
        assert!(matches!(
            queries[0].operation.filter(),
            Some(Predicate::Eq(f, _)) if f.as_str() == "_id"
        ));
        assert_eq!(queries[0].target.database, ResolvedValue::string("sample_mflix"));

        assert_eq!(queries[1].operation.filter(), Some(&Predicate::match_all()));
        assert_eq!(
            queries[1].target.collection.unresolved_reason(),
            Some(UnresolvedReason::ImplicitCollectionName)
        );
    }

    #[test]
    fn test_updates_keep_update_opaque() {
        let query = single(
            r#"
class MovieService {
    private final MongoTemplate template;

    void rate(String title) {
        template.updateFirst(
            Query.query(Criteria.where("title").is(title)),
            new Update().inc("votes", 1),
            Movie.class);
    }
}
"#,
        );
        assert_eq!(query.command, Command::UpdateOne);
        match &query.operation {
            Operation::Update { update, .. } => assert_eq!(
                update.as_ref().map(|u| u.raw.as_str()),
                Some("new Update().inc(\"votes\", 1)")
            ),
            other => panic!("Expected Update, got {:?}", other),
        }
    }

    #[test]
    fn test_fluent_query() {
        let query = single(
            r#"
class MovieService {
    private final MongoTemplate template;

    List<Movie> dramas() {
        return template.query(Movie.class)
            .matching(Query.query(Criteria.where("genres").is("Drama")))
            .all();
    }
}
"#,
        );
        assert_eq!(query.command, Command::FindMany);
        assert_eq!(query.target.collection, ResolvedValue::string("movies"));
        assert_eq!(
            query.operation.filter(),
            Some(&Predicate::Eq(field("genres"), ResolvedValue::string("Drama")))
        );
    }

    #[test]
    fn test_dynamic_query_parameter() {
        let query = single(
            r#"
class MovieService {
    private final MongoTemplate template;

    long purge(Query query) {
        return template.remove(query, Movie.class).getDeletedCount();
    }
}
"#,
        );
        assert_eq!(query.command, Command::DeleteMany);
        assert!(matches!(
            query.operation.filter(),
            Some(Predicate::Unresolved {
                reason: UnresolvedReason::DynamicValue,
                ..
            })
        ));
    }

    #[test]
    fn test_inserts_take_entity_from_document_type() {
        let query = single(
            r#"
class MovieService {
    private final MongoTemplate template;

    Movie add(Movie movie) {
        return template.insert(movie);
    }
}
"#,
        );
        assert_eq!(query.command, Command::InsertOne);
        assert_eq!(query.target.collection, ResolvedValue::string("movies"));
        assert_eq!(
            query.operation,
            Operation::Insert {
                document: Some(DocumentSpec {
                    raw: "movie".to_string()
                })
            }
        );
        assert!(query
            .source_locations
            .contains_key(&NodePath::root().child("document")));

        let query = single(
            r#"
class MovieService {
    private final MongoTemplate template;

    void addAll(List<Movie> movies) {
        template.insertAll(movies);
    }
}
"#,
        );
        assert_eq!(query.command, Command::InsertMany);
        assert_eq!(query.target.collection, ResolvedValue::string("movies"));
        assert_eq!(query.operation.filter(), None);
    }

    #[test]
    fn test_save_replace_and_estimated_count() {
        let query = single(
            r#"
class MovieService {
    private final MongoTemplate template;

    Movie store(Movie movie) {
        return template.save(movie, "archive");
    }
}
"#,
        );
        assert_eq!(query.command, Command::Upsert);
        assert_eq!(query.target.collection, ResolvedValue::string("archive"));
        assert!(matches!(query.operation, Operation::Insert { .. }));

        let query = single(
            r#"
class MovieService {
    private final MongoTemplate template;

    void swap(String title, Movie movie) {
        template.replace(Query.query(Criteria.where("title").is(title)), movie);
    }
}
"#,
        );
        assert_eq!(query.command, Command::ReplaceOne);
        assert_eq!(query.target.collection, ResolvedValue::string("movies"));
        match &query.operation {
            Operation::Update { update, .. } => {
                assert_eq!(update.as_ref().map(|u| u.raw.as_str()), Some("movie"))
            }
            other => panic!("Expected Update, got {:?}", other),
        }

        let query = single(
            r#"
class MovieService {
    private final MongoTemplate template;

    long size() {
        return template.estimatedCount(Movie.class);
    }
}
"#,
        );
        assert_eq!(query.command, Command::EstimatedDocumentCount);
        assert_eq!(query.target.collection, ResolvedValue::string("movies"));
        assert_eq!(query.operation.filter(), Some(&Predicate::match_all()));
    }

    #[test]
    fn test_aggregation_stages() {
        let query = single(
            r#"
import static org.springframework.data.mongodb.core.aggregation.Aggregation.*;
import static org.springframework.data.mongodb.core.query.Criteria.where;

class MovieService {
    private final MongoTemplate template;

    AggregationResults<YearCount> perYear() {
        return template.aggregate(
            newAggregation(
                match(where("year").gte(1990)),
                group("year").count().as("n").avg("rating").as("score"),
                project("n", "score").andExclude("_id"),
                sort(Sort.by(Direction.DESC, "n")),
                unwind("genres")),
            "movies",
            YearCount.class);
    }
}
"#,
        );
        assert_eq!(query.command, Command::Aggregate);
        assert_eq!(query.target.collection, ResolvedValue::string("movies"));
        let Operation::Aggregate { pipeline } = &query.operation else {
            panic!("Expected Aggregate, got {:?}", query.operation);
        };
        assert_eq!(pipeline.len(), 5);
        assert_eq!(
            pipeline[0],
            PipelineStage::Match(Predicate::Gte(field("year"), ResolvedValue::int(1990)))
        );
        assert_eq!(
            pipeline[1],
            PipelineStage::Group {
                key: GroupKey::Field(field("year")),
                accumulators: vec![
                    Accumulator {
                        name: "n".to_string(),
                        operator: AccumulatorOperator::Sum,
                        source: AccumulatorSource::Value(ResolvedValue::int(1)),
                    },
                    Accumulator {
                        name: "score".to_string(),
                        operator: AccumulatorOperator::Avg,
                        source: AccumulatorSource::Field(field("rating")),
                    },
                ],
            }
        );
        assert!(matches!(&pipeline[2], PipelineStage::Project(fields) if fields.len() == 3));
        assert_eq!(
            pipeline[3],
            PipelineStage::Sort(vec![SortField::Field {
                path: field("n"),
                direction: Direction::Descending,
            }])
        );
        assert_eq!(
            pipeline[4],
            PipelineStage::Malformed {
                raw: "unwind(\"genres\")".to_string(),
                reason: MalformedReason::UnknownStage("unwind".to_string()),
            }
        );
        assert!(query
            .source_locations
            .contains_key(&NodePath::root().child("pipeline").index(1).child("accumulators").index(1)));
    }

    #[test]
    fn test_typed_and_opaque_aggregations() {
        let query = single(
            r#"
class MovieService {
    private final MongoTemplate template;

    List<Movie> rated() {
        return template.aggregate(
            Aggregation.newAggregation(Movie.class, Aggregation.match(Criteria.where("rated").is("R"))),
            Movie.class).getMappedResults();
    }
}
"#,
        );
        assert_eq!(query.command, Command::Aggregate);
        assert_eq!(query.target.collection, ResolvedValue::string("movies"));
        assert_eq!(
            query.operation,
            Operation::Aggregate {
                pipeline: vec![PipelineStage::Match(Predicate::Eq(
                    field("rated"),
                    ResolvedValue::string("R")
                ))]
            }
        );

        let query = single(
            r#"
class MovieService {
    private final MongoTemplate template;

    List<Document> run(Aggregation aggregation) {
        return template.aggregate(aggregation, "movies", Document.class).getMappedResults();
    }
}
"#,
        );
        assert_eq!(query.command, Command::Aggregate);
        assert_eq!(query.target.collection, ResolvedValue::string("movies"));
        match &query.operation {
            Operation::Aggregate { pipeline } => assert!(matches!(
                pipeline.as_slice(),
                [PipelineStage::Unresolved { raw, .. }] if raw == "aggregation"
            )),
            other => panic!("Expected Aggregate, got {:?}", other),
        }
    }
}
