//! MongoDB Java driver builders.
//!
//! Recognizes `MongoCollection` commands (`find`, `aggregate`, `updateOne`, ...)
//! and translates the `Filters`, `Aggregates`, `Accumulators`, `Projections`
//! and `Sorts` builder calls passed to them. Static imports (`eq("a", 1)`)
//! are treated like their qualified forms.

use tree_sitter::Node;

use super::{CallSite, Context};
use crate::decompose::{base_type, decompose, Argument, CallChain, ChainRoot, ChainStep};
use crate::model::{
    Accumulator, AccumulatorOperator, AccumulatorSource, CanonicalQuery, Command, Comparison,
    Dialect, Direction, FieldPath, GroupKey, MalformedReason, NodePath, Operation,
    PipelineStage, Predicate, ProjectField, QueryTarget, ResolvedValue, SortField,
    DocumentSpec, UnresolvedReason, UpdateSpec, Value,
};
use crate::resolve::Expr;
use crate::syntax::unwrap_expression;
use crate::Location;

/// Collection methods that issue a command.
const COMMANDS: &[(&str, Command)] = &[
    ("find", Command::FindMany),
    ("aggregate", Command::Aggregate),
    ("countDocuments", Command::CountDocuments),
    ("estimatedDocumentCount", Command::EstimatedDocumentCount),
    ("distinct", Command::Distinct),
    ("deleteOne", Command::DeleteOne),
    ("deleteMany", Command::DeleteMany),
    ("updateOne", Command::UpdateOne),
    ("updateMany", Command::UpdateMany),
    ("updateMulti", Command::UpdateMany),
    ("replaceOne", Command::ReplaceOne),
    ("findOneAndUpdate", Command::FindOneAndUpdate),
    ("findOneAndDelete", Command::FindOneAndDelete),
    ("findOneAndReplace", Command::FindOneAndReplace),
    ("insertOne", Command::InsertOne),
    ("insertMany", Command::InsertMany),
];

/// Types whose constructor plus `append` calls spell a filter document.
const DOCUMENT_TYPES: &[&str] = &["Document", "BasicDBObject"];

/// Index and command of the first command step issued on a collection.
fn command_step(chain: &CallChain<'_>) -> Option<(usize, Command)> {
    let (index, command) = chain.steps.iter().enumerate().find_map(|(i, step)| {
        COMMANDS
            .iter()
            .find(|(name, _)| *name == step.name)
            .map(|(_, command)| (i, *command))
    })?;
    let on_collection = chain.steps[..index]
        .iter()
        .any(|step| step.name == "getCollection")
        || chain.has_type("MongoCollection");
    on_collection.then_some((index, command))
}

pub fn accepts<'t>(_ctx: &Context<'_, 't>, site: &CallSite<'t>) -> bool {
    match site {
        CallSite::Call { chain, .. } => command_step(chain).is_some(),
        CallSite::AnnotatedMethod { .. } => false,
    }
}

pub fn recognize<'t>(ctx: &Context<'_, 't>, site: &CallSite<'t>) -> CanonicalQuery {
    let node = site.node();
    let (chain, (index, command)) = match site {
        CallSite::Call { chain, .. } => match command_step(chain) {
            Some(found) => (chain, found),
            None => return CanonicalQuery::unsupported(ctx.text(node), ctx.location(node)),
        },
        CallSite::AnnotatedMethod { .. } => {
            return CanonicalQuery::unsupported(ctx.text(node), ctx.location(node))
        }
    };

    let root = NodePath::root();
    let location = ctx.location(node);
    ctx.record(&root, node);
    let target = target(ctx, chain, index, &location);

    let args = operands(ctx, &chain.steps[index]);
    let refinements = &chain.steps[index + 1..];
    let filter_at = |i: usize| match filters(args).nth(i) {
        Some(arg) => predicate(ctx, &arg.expr, &root.child("filter")),
        None => Predicate::match_all(),
    };

    let (command, operation) = match command {
        Command::FindMany => find(ctx, args, refinements),
        Command::Aggregate => {
            let pipeline = args
                .first()
                .map(|arg| pipeline(ctx, &arg.expr, &root.child("pipeline")))
                .unwrap_or_default();
            (command, Operation::Aggregate { pipeline })
        }
        Command::CountDocuments => (command, Operation::Count { filter: filter_at(0) }),
        Command::EstimatedDocumentCount => (
            command,
            Operation::Count {
                filter: Predicate::match_all(),
            },
        ),
        Command::Distinct => distinct(ctx, args, refinements),
        Command::DeleteOne | Command::DeleteMany | Command::FindOneAndDelete => {
            (command, Operation::Delete { filter: filter_at(0) })
        }
        Command::InsertOne | Command::InsertMany => {
            let document = args.first().map(|arg| {
                ctx.record(&root.child("document"), arg.expr.node);
                DocumentSpec {
                    raw: ctx.text(unwrap_expression(arg.expr.node)).to_string(),
                }
            });
            (command, Operation::Insert { document })
        }
        _ => {
            let update = args.get(1).map(|arg| {
                ctx.record(&root.child("update"), arg.expr.node);
                UpdateSpec {
                    raw: ctx.text(arg.expr.node).to_string(),
                }
            });
            let upsert = args.get(2).is_some_and(|options| is_upsert(ctx, options));
            let command = match command {
                Command::UpdateOne | Command::UpdateMany | Command::ReplaceOne if upsert => {
                    Command::Upsert
                }
                other => other,
            };
            (
                command,
                Operation::Update {
                    filter: filter_at(0),
                    update,
                },
            )
        }
    };

    ctx.finish(Dialect::Builder, command, target, operation)
}

/// `new UpdateOptions().upsert(true)`, inline or through a local or helper.
fn is_upsert<'t>(ctx: &Context<'_, 't>, options: &Argument<'t>) -> bool {
    decompose(ctx.resolver, &options.expr).is_ok_and(|chain| {
        chain.steps.iter().any(|step| {
            step.name == "upsert"
                && step
                    .argument(0)
                    .is_some_and(|arg| arg.value.literal() == Some(&Value::Bool(true)))
        })
    })
}

/// `find(Movie.class)` names the result type, not a filter.
fn is_result_class(arg: &Argument<'_>) -> bool {
    matches!(arg.value, ResolvedValue::Literal(Value::Class(_)))
}

/// Command operands that can carry a filter.
fn filters<'a, 't>(args: &'a [Argument<'t>]) -> impl Iterator<Item = &'a Argument<'t>> {
    args.iter().filter(|arg| !is_result_class(arg))
}

/// `getDatabase(..).getCollection(..)` arguments; a missing side inherits the
/// reason the chain root is unknown.
fn target<'t>(
    ctx: &Context<'_, 't>,
    chain: &CallChain<'t>,
    index: usize,
    location: &Location,
) -> QueryTarget {
    let fallback = match &chain.root {
        ChainRoot::Opaque {
            reason, location, ..
        } => ResolvedValue::unresolved(*reason, Some(location.clone())),
        _ => ResolvedValue::unresolved(UnresolvedReason::DynamicValue, Some(location.clone())),
    };
    let target_path = NodePath::root().child("target");
    let named = |step_name: &str, path: NodePath| {
        chain.steps[..index]
            .iter()
            .rev()
            .find(|step| step.name == step_name)
            .and_then(|step| step.argument(0))
            .map(|arg| {
                ctx.record(&path, arg.expr.node);
                arg.value.clone()
            })
    };
    QueryTarget {
        database: named("getDatabase", target_path.child("database"))
            .unwrap_or_else(|| fallback.clone()),
        collection: named("getCollection", target_path.child("collection"))
            .unwrap_or(fallback),
    }
}

/// Command arguments without a leading `ClientSession`.
fn operands<'c, 't>(ctx: &Context<'_, 't>, step: &'c ChainStep<'t>) -> &'c [Argument<'t>] {
    let session = step.arguments.first().is_some_and(|first| {
        ctx.resolver
            .declared_type(&first.expr)
            .is_some_and(|t| base_type(&t) == "ClientSession")
    });
    if session {
        &step.arguments[1..]
    } else {
        &step.arguments
    }
}

fn find<'t>(
    ctx: &Context<'_, 't>,
    args: &[Argument<'t>],
    refinements: &[ChainStep<'t>],
) -> (Command, Operation) {
    let root = NodePath::root();
    let mut command = Command::FindMany;
    let mut filter = match filters(args).next() {
        Some(arg) => predicate(ctx, &arg.expr, &root.child("filter")),
        None => Predicate::match_all(),
    };
    let mut projection = None;
    let mut sort = None;
    for step in refinements {
        match (step.name.as_str(), step.argument(0)) {
            ("filter", Some(arg)) => filter = predicate(ctx, &arg.expr, &root.child("filter")),
            ("projection", Some(arg)) => {
                projection = Some(projection_fields(ctx, &arg.expr, &root.child("projection")))
            }
            ("sort", Some(arg)) => sort = Some(sort_fields(ctx, &arg.expr, &root.child("sort"))),
            ("first", None) => command = Command::FindOne,
            _ => {}
        }
    }
    (
        command,
        Operation::Find {
            filter,
            projection,
            sort,
        },
    )
}

/// `distinct(field, [filter,] resultClass)`: a find projecting one field.
fn distinct<'t>(
    ctx: &Context<'_, 't>,
    args: &[Argument<'t>],
    refinements: &[ChainStep<'t>],
) -> (Command, Operation) {
    let root = NodePath::root();
    let mut filter = match args {
        [_, filter, _, ..] => predicate(ctx, &filter.expr, &root.child("filter")),
        _ => Predicate::match_all(),
    };
    for step in refinements {
        if let ("filter", Some(arg)) = (step.name.as_str(), step.argument(0)) {
            filter = predicate(ctx, &arg.expr, &root.child("filter"));
        }
    }
    let field = match args.first() {
        Some(arg) => {
            ctx.record(&root.child("projection").index(0), arg.expr.node);
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
        None => ProjectField::Malformed {
            raw: String::new(),
            reason: MalformedReason::MissingFieldPath,
        },
    };
    (
        Command::Distinct,
        Operation::Find {
            filter,
            projection: Some(vec![field]),
            sort: None,
        },
    )
}

fn raw_text<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>) -> String {
    ctx.text(unwrap_expression(expr.node)).to_string()
}

/// Whether a chain starts at the given builder class or a static import.
fn is_builder_root(chain: &CallChain<'_>, class: &str) -> bool {
    match chain.root {
        ChainRoot::Unqualified => true,
        ChainRoot::Static(_) => chain.static_root() == Some(class),
        _ => false,
    }
}

/// Translate a filter expression.
pub(crate) fn predicate<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>, path: &NodePath) -> Predicate {
    let node = unwrap_expression(expr.node);
    ctx.record(path, node);
    let raw = raw_text(ctx, expr);
    let chain = match decompose(ctx.resolver, expr) {
        Ok(chain) => chain,
        Err(unsupported) => {
            tracing::debug!("{}: {}", ctx.location(node), unsupported);
            return Predicate::Unresolved {
                raw,
                reason: UnresolvedReason::DynamicValue,
            };
        }
    };
    if let ChainRoot::Expression(root) = &chain.root {
        if let Some(document) = document_filter(ctx, root, &chain.steps, &raw) {
            return document;
        }
    }
    let Some((first, rest)) = chain.steps.split_first() else {
        return match &chain.root {
            ChainRoot::Opaque { reason, .. } => Predicate::Unresolved {
                raw,
                reason: *reason,
            },
            _ => Predicate::malformed(raw, MalformedReason::NotAPredicate),
        };
    };
    if !is_builder_root(&chain, "Filters") {
        return match &chain.root {
            ChainRoot::Opaque { reason, .. } => Predicate::Unresolved {
                raw,
                reason: *reason,
            },
            ChainRoot::Static(class) => Predicate::malformed(
                raw,
                MalformedReason::UnsupportedOperator(format!("{}.{}", class, first.name)),
            ),
            _ => Predicate::malformed(raw, MalformedReason::NotAPredicate),
        };
    }

    if let Some(other) = rest.iter().find(|step| step.name != "and" && step.name != "or") {
        return Predicate::malformed(raw, MalformedReason::UnsupportedOperator(other.name.clone()));
    }

    // `gte(..).and(gt(..)).and(..)` folds into one combinator per run of the
    // same name; a switch to the other one nests what came before at index 0.
    let runs: Vec<&[ChainStep<'t>]> = rest.chunk_by(|a, b| a.name == b.name).collect();
    let nested = |depth: usize| (0..depth).fold(path.clone(), |p, _| p.index(0));
    let first_path = nested(runs.len());
    ctx.record(&first_path, first.call.node);
    let mut predicate = filter_constructor(ctx, first, &first_path, ctx.text(first.call.node));
    for (k, run) in runs.iter().enumerate() {
        let base = nested(runs.len() - 1 - k);
        let mut children = vec![predicate];
        for step in run.iter() {
            for arg in &step.arguments {
                let child_path = base.index(children.len());
                children.push(self::predicate(ctx, &arg.expr, &child_path));
            }
        }
        predicate = if run.first().is_some_and(|step| step.name == "and") {
            Predicate::And(children)
        } else {
            Predicate::Or(children)
        };
    }
    predicate
}

fn filter_constructor<'t>(
    ctx: &Context<'_, 't>,
    step: &ChainStep<'t>,
    path: &NodePath,
    raw: &str,
) -> Predicate {
    let name = step.name.as_str();
    let args = step.arguments.as_slice();
    let field_of = |arg: &Argument<'t>| ctx.resolver.field_path(&arg.expr);

    if let Some(comparison) = Comparison::from_method(name) {
        return match args {
            [field, value] => match field_of(field) {
                Ok(field) => comparison.apply(field, value.value.clone()),
                Err(reason) => Predicate::malformed(raw, reason),
            },
            [_] if name == "eq" => Predicate::malformed(raw, MalformedReason::MissingFieldPath),
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
            let Some((field, values)) = args.split_first() else {
                return Predicate::malformed(
                    raw,
                    MalformedReason::InvalidArity {
                        operator: name.to_string(),
                        count: 0,
                    },
                );
            };
            match field_of(field) {
                Ok(field) => {
                    let predicate = Predicate::In(field, spread_values(values));
                    if name == "nin" {
                        predicate.negate()
                    } else {
                        predicate
                    }
                }
                Err(reason) => Predicate::malformed(raw, reason),
            }
        }
        "and" | "or" => {
            let items = match args {
                [single] => ctx
                    .resolver
                    .elements(&single.expr)
                    .unwrap_or_else(|| vec![single.expr.clone()]),
                _ => args.iter().map(|arg| arg.expr.clone()).collect(),
            };
            let children = items
                .iter()
                .enumerate()
                .map(|(i, item)| predicate(ctx, item, &path.index(i)))
                .collect();
            if name == "and" {
                Predicate::And(children)
            } else {
                Predicate::Or(children)
            }
        }
        "not" => match args {
            [inner] => predicate(ctx, &inner.expr, &path.index(0)).negate(),
            _ => Predicate::malformed(
                raw,
                MalformedReason::InvalidArity {
                    operator: name.to_string(),
                    count: args.len(),
                },
            ),
        },
        other => Predicate::malformed(raw, MalformedReason::UnsupportedOperator(other.to_string())),
    }
}

/// Varargs values, or the elements of a single collection argument.
fn spread_values(values: &[Argument<'_>]) -> Vec<ResolvedValue> {
    match values {
        [single] => match &single.value {
            ResolvedValue::Literal(Value::Array(items)) => items.clone(),
            other => vec![other.clone()],
        },
        _ => values.iter().map(|arg| arg.value.clone()).collect(),
    }
}

/// `new Document("a", 1).append("b", new Document("$gt", 2))`
fn document_filter<'t>(
    ctx: &Context<'_, 't>,
    root: &Expr<'t>,
    steps: &[ChainStep<'t>],
    raw: &str,
) -> Option<Predicate> {
    let node = unwrap_expression(root.node);
    if node.kind() != "object_creation_expression" {
        return None;
    }
    let type_name = node.child_by_field_name("type").map(|t| ctx.text(t))?;
    if !DOCUMENT_TYPES.contains(&base_type(type_name)) {
        return None;
    }

    let mut pairs: Vec<(Expr<'t>, ResolvedValue)> = Vec::new();
    let constructor_args = crate::syntax::call_arguments(node);
    if let [key, value] = constructor_args.as_slice() {
        let value_expr = root.with_node(*value);
        pairs.push((root.with_node(*key), ctx.resolver.resolve(&value_expr)));
    }
    for step in steps {
        match (step.name.as_str(), step.arguments.as_slice()) {
            ("append" | "put", [key, value]) => pairs.push((key.expr.clone(), value.value.clone())),
            (other, _) => {
                return Some(Predicate::malformed(
                    raw,
                    MalformedReason::UnsupportedOperator(other.to_string()),
                ))
            }
        }
    }

    let predicates = pairs
        .into_iter()
        .map(|(key, value)| {
            let field = match ctx.resolver.field_path(&key) {
                Ok(field) => field,
                Err(reason) => return Predicate::malformed(raw, reason),
            };
            if field.as_str().starts_with('$') {
                return Predicate::malformed(
                    raw,
                    MalformedReason::UnsupportedOperator(field.as_str().to_string()),
                );
            }
            match value {
                ResolvedValue::Literal(Value::Instance {
                    type_name,
                    arguments,
                }) if DOCUMENT_TYPES.contains(&base_type(&type_name)) && arguments.len() == 2 => {
                    let operator = arguments[0].as_str().unwrap_or_default().to_string();
                    match Comparison::from_operator(&operator) {
                        Some(comparison) => comparison.apply(field, arguments[1].clone()),
                        None => {
                            Predicate::malformed(raw, MalformedReason::UnsupportedOperator(operator))
                        }
                    }
                }
                value => Predicate::Eq(field, value),
            }
        })
        .collect();
    Some(Predicate::conjunction(predicates))
}

/// Field names from varargs or a single list argument.
fn field_names(args: &[Argument<'_>]) -> Vec<Result<FieldPath, String>> {
    spread_values(args)
        .into_iter()
        .map(|value| match value.as_str() {
            Some(name) => Ok(FieldPath::from(name)),
            None => Err(format!("{:?}", value)),
        })
        .collect()
}

/// The single builder step of a projection, sort or stage expression.
fn builder_step<'t>(
    ctx: &Context<'_, 't>,
    expr: &Expr<'t>,
    class: &str,
) -> Result<ChainStep<'t>, Option<UnresolvedReason>> {
    let chain = decompose(ctx.resolver, expr).map_err(|_| Some(UnresolvedReason::DynamicValue))?;
    match (chain.steps.as_slice(), &chain.root) {
        ([step], _) if is_builder_root(&chain, class) => Ok(step.clone()),
        ([], ChainRoot::Opaque { reason, .. }) => Err(Some(*reason)),
        _ => Err(None),
    }
}

fn projection_fields<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>, path: &NodePath) -> Vec<ProjectField> {
    ctx.record(path, unwrap_expression(expr.node));
    let raw = raw_text(ctx, expr);
    let step = match builder_step(ctx, expr, "Projections") {
        Ok(step) => step,
        Err(reason) => {
            return vec![ProjectField::Malformed {
                raw,
                reason: match reason {
                    Some(_) => MalformedReason::UnresolvedFieldPath,
                    None => MalformedReason::NotAPredicate,
                },
            }]
        }
    };
    match step.name.as_str() {
        "include" | "exclude" => {
            let include = step.name == "include";
            field_names(&step.arguments)
                .into_iter()
                .map(|name| match name {
                    Ok(path) => ProjectField::Field { path, include },
                    Err(raw) => ProjectField::Malformed {
                        raw,
                        reason: MalformedReason::UnresolvedFieldPath,
                    },
                })
                .collect()
        }
        "excludeId" => vec![ProjectField::Field {
            path: FieldPath::from("_id"),
            include: false,
        }],
        "fields" => {
            let items = match step.arguments.as_slice() {
                [single] => ctx
                    .resolver
                    .elements(&single.expr)
                    .unwrap_or_else(|| vec![single.expr.clone()]),
                args => args.iter().map(|arg| arg.expr.clone()).collect(),
            };
            items
                .iter()
                .flat_map(|item| projection_fields(ctx, item, path))
                .collect()
        }
        other => vec![ProjectField::Malformed {
            raw,
            reason: MalformedReason::UnsupportedOperator(other.to_string()),
        }],
    }
}

fn sort_fields<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>, path: &NodePath) -> Vec<SortField> {
    ctx.record(path, unwrap_expression(expr.node));
    let raw = raw_text(ctx, expr);
    let step = match builder_step(ctx, expr, "Sorts") {
        Ok(step) => step,
        Err(reason) => {
            return vec![SortField::Malformed {
                raw,
                reason: match reason {
                    Some(_) => MalformedReason::UnresolvedFieldPath,
                    None => MalformedReason::NotAPredicate,
                },
            }]
        }
    };
    let direction = match step.name.as_str() {
        "ascending" => Direction::Ascending,
        "descending" => Direction::Descending,
        "orderBy" => {
            let items = match step.arguments.as_slice() {
                [single] => ctx
                    .resolver
                    .elements(&single.expr)
                    .unwrap_or_else(|| vec![single.expr.clone()]),
                args => args.iter().map(|arg| arg.expr.clone()).collect(),
            };
            return items
                .iter()
                .flat_map(|item| sort_fields(ctx, item, path))
                .collect();
        }
        other => {
            return vec![SortField::Malformed {
                raw,
                reason: MalformedReason::UnsupportedOperator(other.to_string()),
            }]
        }
    };
    field_names(&step.arguments)
        .into_iter()
        .map(|name| match name {
            Ok(path) => SortField::Field { path, direction },
            Err(raw) => SortField::Malformed {
                raw,
                reason: MalformedReason::UnresolvedFieldPath,
            },
        })
        .collect()
}

fn pipeline<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>, base: &NodePath) -> Vec<PipelineStage> {
    match ctx.resolver.elements(expr) {
        Some(stages) => stages
            .iter()
            .enumerate()
            .map(|(i, stage_expr)| stage(ctx, stage_expr, &base.index(i)))
            .collect(),
        None => vec![PipelineStage::Unresolved {
            raw: raw_text(ctx, expr),
            reason: UnresolvedReason::DynamicValue,
        }],
    }
}

fn stage<'t>(ctx: &Context<'_, 't>, expr: &Expr<'t>, path: &NodePath) -> PipelineStage {
    let node: Node<'t> = unwrap_expression(expr.node);
    ctx.record(path, node);
    let raw = raw_text(ctx, expr);
    let step = match builder_step(ctx, expr, "Aggregates") {
        Ok(step) => step,
        Err(Some(reason)) => return PipelineStage::Unresolved { raw, reason },
        Err(None) => {
            return PipelineStage::Malformed {
                raw,
                reason: MalformedReason::NotAPredicate,
            }
        }
    };
    let args = step.arguments.as_slice();
    match (step.name.as_str(), args) {
        ("match", [filter]) => PipelineStage::Match(predicate(ctx, &filter.expr, &path.child("filter"))),
        ("project", [fields]) => {
            PipelineStage::Project(projection_fields(ctx, &fields.expr, &path.child("fields")))
        }
        ("sort", [fields]) => PipelineStage::Sort(sort_fields(ctx, &fields.expr, &path.child("fields"))),
        ("group", [key, accumulators @ ..]) => group(ctx, key, accumulators, path, raw),
        (name @ ("match" | "project" | "sort" | "group"), _) => PipelineStage::Malformed {
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

fn group<'t>(
    ctx: &Context<'_, 't>,
    key: &Argument<'t>,
    accumulators: &[Argument<'t>],
    path: &NodePath,
    raw: String,
) -> PipelineStage {
    ctx.record(&path.child("key"), key.expr.node);
    let key = match &key.value {
        ResolvedValue::Literal(Value::Null) => GroupKey::All,
        ResolvedValue::Unresolved { reason, .. } => GroupKey::Unresolved(*reason),
        ResolvedValue::Literal(Value::String(s)) => match s.strip_prefix('$') {
            Some(field) => GroupKey::Field(FieldPath::from(field)),
            None => GroupKey::All,
        },
        _ => {
            return PipelineStage::Malformed {
                raw,
                reason: MalformedReason::UnsupportedOperator("compound group key".to_string()),
            }
        }
    };

    let items: Vec<Expr<'t>> = match accumulators {
        [single] => ctx
            .resolver
            .elements(&single.expr)
            .unwrap_or_else(|| vec![single.expr.clone()]),
        args => args.iter().map(|arg| arg.expr.clone()).collect(),
    };
    let base = path.child("accumulators");
    let mut translated = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        ctx.record(&base.index(i), unwrap_expression(item.node));
        let item_raw = raw_text(ctx, item);
        let step = match builder_step(ctx, item, "Accumulators") {
            Ok(step) => step,
            Err(_) => {
                return PipelineStage::Malformed {
                    raw: item_raw,
                    reason: MalformedReason::NotAPredicate,
                }
            }
        };
        let Some(operator) = AccumulatorOperator::from_name(&step.name) else {
            return PipelineStage::Malformed {
                raw: item_raw,
                reason: MalformedReason::UnknownAccumulator(step.name.clone()),
            };
        };
        let (name, source) = match step.arguments.as_slice() {
            [name, source] => (name, source),
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
        let Some(name) = name.value.as_str() else {
            return PipelineStage::Malformed {
                raw: item_raw,
                reason: MalformedReason::UnresolvedFieldPath,
            };
        };
        translated.push(Accumulator {
            name: name.to_string(),
            operator,
            source: AccumulatorSource::from_value(source.value.clone()),
        });
    }
    PipelineStage::Group {
        key,
        accumulators: translated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::extract::{Analysis, Extractor};
    use crate::syntax::{for_each_descendant, SourceUnit};
    use std::sync::Arc;

    fn analyze(sources: &[(&str, &str)]) -> Vec<CanonicalQuery> {
        let units = sources
            .iter()
            .map(|(path, source)| SourceUnit::parse(*path, *source).expect("Should parse"))
            .collect();
        Analysis::new(units, Config::default())
            .extract_all()
            .into_iter()
            .flat_map(|file| file.queries)
            .collect()
    }

    fn single(source: &str) -> CanonicalQuery {
        let mut queries = analyze(&[("Dao.java", source)]);
        assert_eq!(queries.len(), 1, "Expected one query, got {:?}", queries);
        queries.remove(0)
    }

    fn filter(query: &CanonicalQuery) -> &Predicate {
        query.operation.filter().expect("Should have a filter")
    }

    fn field(name: &str) -> FieldPath {
        FieldPath::from(name)
    }

    #[test]
    fn test_inline_chain() {
        let query = single(
            r#"
class MovieDao {
    List<Document> crime(MongoClient client) {
        return client.getDatabase("sample_mflix")
            .getCollection("movies")
            .find(Filters.and(Filters.eq("year", 1999), Filters.in("genres", "Drama", "Crime")))
            .into(new ArrayList<>());
    }
}
"#,
        );
        assert_eq!(query.dialect, Some(Dialect::Builder));
        assert_eq!(query.command, Command::FindMany);
        assert_eq!(query.target.database, ResolvedValue::string("sample_mflix"));
        assert_eq!(query.target.collection, ResolvedValue::string("movies"));
        assert_eq!(
            filter(&query),
            &Predicate::And(vec![
                Predicate::Eq(field("year"), ResolvedValue::int(1999)),
                Predicate::In(
                    field("genres"),
                    vec![ResolvedValue::string("Drama"), ResolvedValue::string("Crime")]
                ),
            ])
        );
        assert!(query.source_locations.contains_key(&NodePath::root().child("filter").index(1)));
    }

    #[test]
    fn test_chained_and_folds() {
        let query = single(
            r#"
class MovieDao {
    void recent(MongoCollection<Document> movies) {
        final String date = "2001-01-01";
        movies.find(Filters.gte("released", date).and(Filters.gt("awards.wins", 0)));
    }
}
"#,
        );
        assert_eq!(
            filter(&query),
            &Predicate::And(vec![
                Predicate::Gte(field("released"), ResolvedValue::string("2001-01-01")),
                Predicate::Gt(field("awards.wins"), ResolvedValue::int(0)),
            ])
        );
        assert_eq!(
            query.target.collection.unresolved_reason(),
            Some(UnresolvedReason::DynamicValue)
        );
    }

    #[test]
    fn test_empty_find_and_empty_collection_name() {
        let query = single(
            r#"
class MovieDao {
    void all(MongoDatabase db) {
        db.getCollection("").find();
    }
}
"#,
        );
        assert_eq!(query.target.collection, ResolvedValue::string(""));
        assert_eq!(filter(&query), &Predicate::match_all());
    }

    #[test]
    fn test_static_imports_and_malformed_siblings() {
        let query = single(
            r#"
import static com.mongodb.client.model.Filters.*;

class MovieDao {
    void odd(MongoCollection<Document> movies) {
        movies.find(and(eq("a", 1), eq(5), nin("b", List.of(1, 2)), regex("c", "x"), not(gt("d", 1))));
    }
}
"#,
        );
        let Predicate::And(children) = filter(&query) else {
            panic!("Expected And, got {:?}", filter(&query));
        };
        assert_eq!(children.len(), 5);
        assert_eq!(children[0], Predicate::Eq(field("a"), ResolvedValue::int(1)));
        assert_eq!(
            children[1],
            Predicate::malformed("eq(5)", MalformedReason::MissingFieldPath)
        );
        assert_eq!(
            children[2],
            Predicate::In(field("b"), vec![ResolvedValue::int(1), ResolvedValue::int(2)]).negate()
        );
        assert_eq!(
            children[3],
            Predicate::malformed(
                "regex(\"c\", \"x\")",
                MalformedReason::UnsupportedOperator("regex".to_string())
            )
        );
        assert_eq!(
            children[4],
            Predicate::Gt(field("d"), ResolvedValue::int(1)).negate()
        );
    }

    #[test]
    fn test_non_string_field_path_is_malformed() {
        let query = single(
            r#"
class MovieDao {
    void bad(MongoCollection<Document> movies) {
        movies.countDocuments(Filters.eq(42, "x"));
    }
}
"#,
        );
        assert_eq!(query.command, Command::CountDocuments);
        assert!(matches!(
            filter(&query),
            Predicate::Malformed {
                reason: MalformedReason::UnresolvedFieldPath,
                ..
            }
        ));
    }

    #[test]
    fn test_fields_constants_and_constructor_assignment() {
        let queries = analyze(&[
            (
                "Names.java",
                r#"
public final class Names {
    public static final String MOVIES = "movies";
}
"#,
            ),
            (
                "MovieDao.java",
                r#"
class MovieDao {
    private final MongoCollection<Document> movies;

    MovieDao(MongoDatabase database) {
        this.movies = database.getCollection(Names.MOVIES);
    }

    long count(String title) {
        return movies.countDocuments(Filters.eq("title", title));
    }
}
"#,
            ),
        ]);
        assert_eq!(queries.len(), 1);
        let query = &queries[0];
        assert_eq!(query.target.collection, ResolvedValue::string("movies"));
        assert_eq!(
            query.target.database.unresolved_reason(),
            Some(UnresolvedReason::DynamicValue)
        );
        match filter(query) {
            Predicate::Eq(f, value) => {
                assert_eq!(f, &field("title"));
                assert_eq!(value.unresolved_reason(), Some(UnresolvedReason::DynamicValue));
            }
            other => panic!("Expected Eq, got {:?}", other),
        }
    }

    #[test]
    fn test_helper_inlining_depth() {
        let queries = analyze(&[(
            "UserDao.java",
            r#"
class UserDao {
    private final MongoClient client;

    private MongoDatabase db() {
        return client.getDatabase("prod");
    }

    private MongoCollection<Document> users() {
        return db().getCollection("users");
    }

    long oneHop() {
        return db().getCollection("users").countDocuments();
    }

    long twoHops() {
        return users().countDocuments();
    }
}
"#,
        )]);
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].target.database, ResolvedValue::string("prod"));
        assert_eq!(queries[1].target.collection, ResolvedValue::string("users"));
        assert_eq!(
            queries[1].target.database.unresolved_reason(),
            Some(UnresolvedReason::RecursionDepthExceeded)
        );
    }

    #[test]
    fn test_find_refinements_and_session() {
        let query = single(
            r#"
class MovieDao {
    Document top(ClientSession session, MongoCollection<Document> movies) {
        return movies.find(session, Filters.eq("year", 1999))
            .projection(Projections.fields(Projections.include("title", "year"), Projections.excludeId()))
            .sort(Sorts.orderBy(Sorts.descending("rating"), Sorts.ascending("title")))
            .first();
    }
}
"#,
        );
        assert_eq!(query.command, Command::FindOne);
        let Operation::Find {
            filter,
            projection,
            sort,
        } = &query.operation
        else {
            panic!("Expected Find, got {:?}", query.operation);
        };
        assert_eq!(filter, &Predicate::Eq(field("year"), ResolvedValue::int(1999)));
        assert_eq!(
            projection.as_deref(),
            Some(
                &[
                    ProjectField::Field {
                        path: field("title"),
                        include: true
                    },
                    ProjectField::Field {
                        path: field("year"),
                        include: true
                    },
                    ProjectField::Field {
                        path: field("_id"),
                        include: false
                    },
                ][..]
            )
        );
        assert_eq!(
            sort.as_deref(),
            Some(
                &[
                    SortField::Field {
                        path: field("rating"),
                        direction: Direction::Descending
                    },
                    SortField::Field {
                        path: field("title"),
                        direction: Direction::Ascending
                    },
                ][..]
            )
        );
    }

    #[test]
    fn test_aggregation_pipeline() {
        let query = single(
            r#"
class Report {
    void run(MongoCollection<Document> orders) {
        List<Bson> pipeline = Arrays.asList(
            Aggregates.match(Filters.eq("status", "A")),
            Aggregates.group("$cust_id", Accumulators.sum("total", "$amount")),
            Aggregates.group(null, Accumulators.stdDevPop("spread", "$amount")),
            Aggregates.project(Projections.fields(Projections.include("total"), Projections.excludeId())),
            Aggregates.sort(Sorts.descending("total")),
            Aggregates.limit(5));
        orders.aggregate(pipeline);
    }
}
"#,
        );
        assert_eq!(query.command, Command::Aggregate);
        let Operation::Aggregate { pipeline } = &query.operation else {
            panic!("Expected Aggregate, got {:?}", query.operation);
        };
        assert_eq!(pipeline.len(), 6);
        assert_eq!(
            pipeline[0],
            PipelineStage::Match(Predicate::Eq(field("status"), ResolvedValue::string("A")))
        );
        assert_eq!(
            pipeline[1],
            PipelineStage::Group {
                key: GroupKey::Field(field("cust_id")),
                accumulators: vec![Accumulator {
                    name: "total".to_string(),
                    operator: AccumulatorOperator::Sum,
                    source: AccumulatorSource::Field(field("amount")),
                }],
            }
        );
        assert!(matches!(
            &pipeline[2],
            PipelineStage::Malformed {
                reason: MalformedReason::UnknownAccumulator(name),
                ..
            } if name == "stdDevPop"
        ));
        assert!(matches!(&pipeline[3], PipelineStage::Project(fields) if fields.len() == 2));
        assert!(matches!(&pipeline[4], PipelineStage::Sort(fields) if fields.len() == 1));
        assert!(matches!(
            &pipeline[5],
            PipelineStage::Malformed {
                reason: MalformedReason::UnknownStage(name),
                ..
            } if name == "limit"
        ));
    }

    #[test]
    fn test_updates_and_upsert() {
        let query = single(
            r#"
class MovieDao {
    void touch(MongoCollection<Document> movies, ObjectId id) {
        movies.updateOne(Filters.eq("_id", id), Updates.set("seen", true), new UpdateOptions().upsert(true));
    }
}
"#,
        );
        assert_eq!(query.command, Command::Upsert);
        match &query.operation {
            Operation::Update { filter, update } => {
                assert!(matches!(filter, Predicate::Eq(f, _) if f.as_str() == "_id"));
                assert_eq!(
                    update.as_ref().map(|u| u.raw.as_str()),
                    Some("Updates.set(\"seen\", true)")
                );
            }
            other => panic!("Expected Update, got {:?}", other),
        }
    }

    #[test]
    fn test_upsert_options_held_in_a_local() {
        let query = single(
            r#"
class MovieDao {
    void touch(MongoCollection<Document> movies, ObjectId id) {
        UpdateOptions options = new UpdateOptions().upsert(true);
        movies.updateOne(Filters.eq("_id", id), Updates.set("seen", true), options);
    }
}
"#,
        );
        assert_eq!(query.command, Command::Upsert);
    }

    #[test]
    fn test_upsert_false_stays_update() {
        let query = single(
            r#"
class MovieDao {
    void touch(MongoCollection<Document> movies, ObjectId id) {
        movies.updateMany(Filters.eq("_id", id), Updates.set("seen", true), new UpdateOptions().upsert(false));
    }
}
"#,
        );
        assert_eq!(query.command, Command::UpdateMany);
    }

    #[test]
    fn test_result_class_is_not_a_filter() {
        let queries = analyze(&[(
            "Dao.java",
            r#"
class MovieDao {
    List<Movie> all(MongoDatabase db) {
        return db.getCollection("movies").find(Movie.class).into(new ArrayList<>());
    }

    Movie one(MongoCollection<Document> movies) {
        return movies.find(Filters.eq("title", "Heat"), Movie.class).first();
    }
}
"#,
        )]);
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].command, Command::FindMany);
        assert_eq!(filter(&queries[0]), &Predicate::match_all());
        assert!(queries[0]
            .issues()
            .iter()
            .all(|issue| issue.kind != crate::model::IssueKind::MalformedPredicate));
        assert_eq!(queries[1].command, Command::FindOne);
        assert_eq!(
            filter(&queries[1]),
            &Predicate::Eq(field("title"), ResolvedValue::string("Heat"))
        );
    }

    #[test]
    fn test_inserts_keep_documents_opaque() {
        let queries = analyze(&[(
            "Dao.java",
            r#"
class MovieDao {
    void add(MongoDatabase db, Document movie, List<Document> batch) {
        db.getCollection("movies").insertOne(movie);
        db.getCollection("movies").insertMany(batch);
    }
}
"#,
        )]);
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].command, Command::InsertOne);
        assert_eq!(queries[0].target.collection, ResolvedValue::string("movies"));
        assert_eq!(
            queries[0].operation,
            Operation::Insert {
                document: Some(DocumentSpec {
                    raw: "movie".to_string()
                })
            }
        );
        assert!(queries[0]
            .source_locations
            .contains_key(&NodePath::root().child("document")));
        assert_eq!(queries[1].command, Command::InsertMany);
        assert_eq!(queries[1].operation.filter(), None);
    }

    #[test]
    fn test_chained_combinators_flatten() {
        let queries = analyze(&[(
            "Dao.java",
            r#"
class MovieDao {
    void same(MongoCollection<Document> movies) {
        movies.find(Filters.eq("a", 1)
            .and(Filters.eq("b", 2))
            .and(Filters.eq("c", 3)));
    }

    void switched(MongoCollection<Document> movies) {
        movies.find(Filters.eq("a", 1)
            .and(Filters.eq("b", 2))
            .or(Filters.eq("c", 3)));
    }
}
"#,
        )]);
        assert_eq!(queries.len(), 2);
        let eq = |name: &str, value: i64| Predicate::Eq(field(name), ResolvedValue::int(value));

        assert_eq!(
            filter(&queries[0]),
            &Predicate::And(vec![eq("a", 1), eq("b", 2), eq("c", 3)])
        );
        let path = NodePath::root().child("filter");
        let line = |query: &CanonicalQuery, path: &NodePath| {
            query.source_locations.get(path).map(|location| location.line)
        };
        assert_eq!(line(&queries[0], &path.index(0)), Some(4));
        assert_eq!(line(&queries[0], &path.index(1)), Some(5));
        assert_eq!(line(&queries[0], &path.index(2)), Some(6));

        assert_eq!(
            filter(&queries[1]),
            &Predicate::Or(vec![Predicate::And(vec![eq("a", 1), eq("b", 2)]), eq("c", 3)])
        );
        assert_eq!(line(&queries[1], &path.index(0).index(0)), Some(10));
        assert_eq!(line(&queries[1], &path.index(0).index(1)), Some(11));
        assert_eq!(line(&queries[1], &path.index(1)), Some(12));
    }

    #[test]
    fn test_documents_and_dynamic_filters() {
        let queries = analyze(&[(
            "Dao.java",
            r#"
class Dao {
    void run(MongoCollection<Document> movies, Bson external) {
        movies.find(new Document("year", new Document("$gt", 2000)).append("rated", "PG"));
        movies.deleteMany(external);
    }
}
"#,
        )]);
        assert_eq!(queries.len(), 2);
        assert_eq!(
            filter(&queries[0]),
            &Predicate::And(vec![
                Predicate::Gt(field("year"), ResolvedValue::int(2000)),
                Predicate::Eq(field("rated"), ResolvedValue::string("PG")),
            ])
        );
        assert_eq!(queries[1].command, Command::DeleteMany);
        assert!(matches!(
            filter(&queries[1]),
            Predicate::Unresolved {
                reason: UnresolvedReason::DynamicValue,
                ..
            }
        ));
    }

    #[test]
    fn test_distinct() {
        let query = single(
            r#"
class Dao {
    void genres(MongoCollection<Document> movies) {
        movies.distinct("genres", Filters.eq("year", 1999), String.class);
    }
}
"#,
        );
        assert_eq!(query.command, Command::Distinct);
        match &query.operation {
            Operation::Find {
                filter, projection, ..
            } => {
                assert_eq!(filter, &Predicate::Eq(field("year"), ResolvedValue::int(1999)));
                assert_eq!(
                    projection.as_deref(),
                    Some(
                        &[ProjectField::Field {
                            path: field("genres"),
                            include: true
                        }][..]
                    )
                );
            }
            other => panic!("Expected Find, got {:?}", other),
        }
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let unit = SourceUnit::parse(
            "Dao.java",
            r#"
class Dao {
    void run(MongoCollection<Document> movies) {
        movies.find(Filters.or(Filters.eq("a", 1), Filters.lt("b", 2.5)));
    }
}
"#,
        )
        .expect("Should parse");
        let mut call = None;
        for_each_descendant(unit.root(), |n| {
            if call.is_none() && n.kind() == "method_invocation" {
                call = Some(n);
            }
        });
        let call = call.expect("Should find call");
        let table = Arc::new(crate::constants::ConstantTable::build(std::slice::from_ref(&unit), 1));
        let extractor = Extractor::new(table, Arc::new(Config::default()));
        let first = extractor.extract(&unit, call);
        let second = extractor.extract(&unit, call);
        assert_eq!(first, second);
        assert!(first.is_supported());
        assert_eq!(
            first.operation.filter(),
            Some(&Predicate::Or(vec![
                Predicate::Eq(field("a"), ResolvedValue::int(1)),
                Predicate::Lt(field("b"), ResolvedValue::Literal(Value::Double(2.5))),
            ]))
        );
    }
}
