//! Dialect recognizers.
//!
//! Each dialect is a [`Recognizer`]: a signature check (`accepts`) and a
//! translation into the canonical model (`recognize`). Dispatch walks
//! [`RECOGNIZERS`] in order and uses the first dialect that accepts the call
//! site. Template comes first because repository calls have no other
//! signature, and criteria before builder because both use `find`.

pub mod builder;
pub mod criteria;
pub mod template;

use std::cell::RefCell;
use std::collections::BTreeMap;

use tree_sitter::Node;

use crate::config::Config;
use crate::constants::ConstantTable;
use crate::decompose::CallChain;
use crate::model::{
    CanonicalQuery, Command, Dialect, NodePath, Operation, QueryTarget, ResolvedValue,
    UnresolvedReason,
};
use crate::resolve::Resolver;
use crate::syntax::SourceUnit;
use crate::Location;

/// A candidate for extraction.
#[derive(Debug)]
pub enum CallSite<'t> {
    /// A chain-top method invocation, already decomposed
    Call { node: Node<'t>, chain: CallChain<'t> },
    /// A repository method declaration carrying `@Query` or `@Aggregation`
    AnnotatedMethod { node: Node<'t> },
}

impl<'t> CallSite<'t> {
    pub fn node(&self) -> Node<'t> {
        match self {
            CallSite::Call { node, .. } | CallSite::AnnotatedMethod { node } => *node,
        }
    }
}

/// Per-extraction state shared by the recognizers.
pub struct Context<'a, 't> {
    pub resolver: &'a Resolver<'t>,
    pub config: &'a Config,
    spans: RefCell<BTreeMap<NodePath, Location>>,
}

impl<'a, 't> Context<'a, 't> {
    pub fn new(resolver: &'a Resolver<'t>, config: &'a Config) -> Self {
        Self {
            resolver,
            config,
            spans: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn unit(&self) -> &'t SourceUnit {
        self.resolver.unit()
    }

    pub fn table(&self) -> &'t ConstantTable {
        self.resolver.table()
    }

    pub fn text(&self, node: Node<'t>) -> &'t str {
        self.resolver.text(node)
    }

    pub fn location(&self, node: Node<'t>) -> Location {
        self.resolver.location(node)
    }

    /// Record the source span of a model node. The first span recorded wins.
    pub fn record(&self, path: &NodePath, node: Node<'t>) {
        self.record_location(path, self.location(node));
    }

    pub fn record_location(&self, path: &NodePath, location: Location) {
        self.spans.borrow_mut().entry(path.clone()).or_insert(location);
    }

    /// Database for dialects that never name one in code.
    pub fn default_database(&self, location: &Location) -> ResolvedValue {
        match &self.config.default_database {
            Some(name) => ResolvedValue::string(name.clone()),
            None => ResolvedValue::unresolved(
                UnresolvedReason::ExternalConfiguration,
                Some(location.clone()),
            ),
        }
    }

    /// Assemble the query and hand over the recorded spans.
    pub fn finish(
        &self,
        dialect: Dialect,
        command: Command,
        target: QueryTarget,
        operation: Operation,
    ) -> CanonicalQuery {
        CanonicalQuery {
            dialect: Some(dialect),
            command,
            target,
            operation,
            source_locations: self.spans.take(),
        }
    }
}

pub type AcceptFn = for<'a, 't> fn(&Context<'a, 't>, &CallSite<'t>) -> bool;
pub type RecognizeFn = for<'a, 't> fn(&Context<'a, 't>, &CallSite<'t>) -> CanonicalQuery;

pub struct Recognizer {
    pub dialect: Dialect,
    pub accepts: AcceptFn,
    pub recognize: RecognizeFn,
}

/// Dispatch order.
pub const RECOGNIZERS: &[Recognizer] = &[
    Recognizer {
        dialect: Dialect::Template,
        accepts: template::accepts,
        recognize: template::recognize,
    },
    Recognizer {
        dialect: Dialect::Criteria,
        accepts: criteria::accepts,
        recognize: criteria::recognize,
    },
    Recognizer {
        dialect: Dialect::Builder,
        accepts: builder::accepts,
        recognize: builder::recognize,
    },
];

/// First enabled recognizer that accepts the call site.
pub fn dispatch<'t>(ctx: &Context<'_, 't>, site: &CallSite<'t>) -> Option<&'static Recognizer> {
    let found = RECOGNIZERS
        .iter()
        .filter(|r| ctx.config.dialect_enabled(r.dialect))
        .find(|r| (r.accepts)(ctx, site));
    if let Some(recognizer) = found {
        tracing::debug!(
            "{}: dispatched to {} dialect",
            ctx.location(site.node()),
            recognizer.dialect
        );
    }
    found
}
