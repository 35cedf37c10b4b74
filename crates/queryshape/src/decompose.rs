//! Call-chain decomposition.
//!
//! `client.getDatabase("db").getCollection("movies").find(eq("a", 1))` becomes
//! a root plus the ordered steps `getDatabase`, `getCollection`, `find`, each
//! with its arguments already resolved. Receivers are followed backwards
//! through locals, fields and pure helper methods, so chains split across
//! statements decompose the same as inline ones.

use std::collections::HashSet;

use tree_sitter::Node;

use crate::model::{ResolvedValue, UnresolvedReason};
use crate::resolve::{Expr, Followed, Resolver};
use crate::syntax::{call_arguments, unwrap_expression};
use crate::Location;

/// One argument of a step: the expression and its resolved value.
#[derive(Debug, Clone)]
pub struct Argument<'t> {
    pub expr: Expr<'t>,
    pub value: ResolvedValue,
}

#[derive(Debug, Clone)]
pub struct ChainStep<'t> {
    pub name: String,
    /// The `method_invocation` for this step
    pub call: Expr<'t>,
    pub arguments: Vec<Argument<'t>>,
}

impl<'t> ChainStep<'t> {
    pub fn argument(&self, index: usize) -> Option<&Argument<'t>> {
        self.arguments.get(index)
    }

    pub fn arity(&self) -> usize {
        self.arguments.len()
    }
}

/// What a chain starts from.
#[derive(Debug, Clone)]
pub enum ChainRoot<'t> {
    /// A type name: `Filters` in `Filters.eq(..)`
    Static(String),
    /// A call with no receiver (static import or inherited method)
    Unqualified,
    /// A receiver whose value only exists at runtime
    Opaque {
        text: String,
        declared_type: Option<String>,
        reason: UnresolvedReason,
        location: Location,
    },
    /// Any other expression, e.g. `new Query()`
    Expression(Expr<'t>),
}

#[derive(Debug, Clone)]
pub struct CallChain<'t> {
    pub root: ChainRoot<'t>,
    pub steps: Vec<ChainStep<'t>>,
    /// Declared types seen while following the receiver, outermost first
    pub types: Vec<String>,
}

impl<'t> CallChain<'t> {
    /// First step with the given name.
    pub fn step(&self, name: &str) -> Option<(usize, &ChainStep<'t>)> {
        self.steps.iter().enumerate().find(|(_, s)| s.name == name)
    }

    /// Index of the first step whose name is in `names`.
    pub fn position(&self, names: &[&str]) -> Option<usize> {
        self.steps.iter().position(|s| names.contains(&s.name.as_str()))
    }

    /// Whether any declared type along the chain has this simple name.
    pub fn has_type(&self, simple_name: &str) -> bool {
        self.types.iter().any(|t| base_type(t) == simple_name)
    }

    /// Simple name of a static root (`com.x.Filters` -> `Filters`).
    pub fn static_root(&self) -> Option<&str> {
        match &self.root {
            ChainRoot::Static(name) => Some(name.rsplit('.').next().unwrap_or(name)),
            _ => None,
        }
    }
}

/// Why a chain could not be decomposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Unsupported {
    #[error("receiver depends on control flow")]
    BranchDependent,
}

/// `MongoCollection<Document>` -> `MongoCollection`
pub fn base_type(type_text: &str) -> &str {
    let without_args = type_text.split('<').next().unwrap_or(type_text).trim();
    without_args.rsplit('.').next().unwrap_or(without_args)
}

pub fn decompose<'t>(resolver: &Resolver<'t>, expr: &Expr<'t>) -> Result<CallChain<'t>, Unsupported> {
    let mut steps = Vec::new();
    let mut types = Vec::new();
    let mut visited = HashSet::new();
    let mut current = expr.clone();

    let root = loop {
        let node = unwrap_expression(current.node);
        let here = current.with_node(node);
        if !visited.insert((node.id(), here.frame.depth())) {
            break opaque(resolver, node, None, UnresolvedReason::RecursionDepthExceeded);
        }
        match node.kind() {
            "method_invocation" => {
                let object = node.child_by_field_name("object");
                if object.map_or(true, |o| o.kind() == "this") {
                    match resolver.inline(&here) {
                        Some(Ok(returned)) => {
                            types.extend(resolver.declared_type(&here));
                            current = returned;
                            continue;
                        }
                        Some(Err(reason)) => {
                            let declared = resolver.declared_type(&here);
                            break opaque(resolver, node, declared, reason);
                        }
                        None => {}
                    }
                }
                steps.push(step(resolver, &here, node));
                match object {
                    Some(object) if object.kind() != "this" => current = here.with_node(object),
                    _ => break ChainRoot::Unqualified,
                }
            }
            "identifier" | "field_access" => match resolver.follow(&here) {
                Followed::Bound {
                    expr,
                    declared_type,
                } => {
                    types.extend(declared_type);
                    current = expr;
                }
                Followed::Variadic(_) => {
                    break opaque(resolver, node, None, UnresolvedReason::DynamicValue)
                }
                Followed::Opaque {
                    reason,
                    declared_type,
                } => {
                    types.extend(declared_type.clone());
                    break opaque(resolver, node, declared_type, reason);
                }
                Followed::Branching { .. } => return Err(Unsupported::BranchDependent),
                Followed::NotReference => {
                    let text = resolver.text(node);
                    let last = text.rsplit('.').next().unwrap_or(text).trim();
                    if last.starts_with(|c: char| c.is_uppercase()) {
                        break ChainRoot::Static(text.split_whitespace().collect());
                    }
                    break opaque(resolver, node, None, UnresolvedReason::UnknownDeclaration);
                }
            },
            "ternary_expression" | "switch_expression" => {
                return Err(Unsupported::BranchDependent)
            }
            _ => break ChainRoot::Expression(here),
        }
    };

    steps.reverse();
    Ok(CallChain { root, steps, types })
}

fn step<'t>(resolver: &Resolver<'t>, call: &Expr<'t>, node: Node<'t>) -> ChainStep<'t> {
    let name = node
        .child_by_field_name("name")
        .map(|n| resolver.text(n).to_string())
        .unwrap_or_default();
    let arguments = call_arguments(node)
        .into_iter()
        .map(|arg| {
            let expr = call.with_node(arg);
            let value = resolver.resolve(&expr);
            Argument { expr, value }
        })
        .collect();
    ChainStep {
        name,
        call: call.clone(),
        arguments,
    }
}

fn opaque<'t>(
    resolver: &Resolver<'t>,
    node: Node<'t>,
    declared_type: Option<String>,
    reason: UnresolvedReason,
) -> ChainRoot<'t> {
    ChainRoot::Opaque {
        text: resolver.text(node).to_string(),
        declared_type,
        reason,
        location: resolver.location(node),
    }
}
