//! Canonical query model.
//!
//! Every dialect recognizer produces a [`CanonicalQuery`]. The model is plain
//! data: it is created fresh per extraction, immutable once returned, and
//! serializes to JSON for the CLI and editor consumers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Serialize, Serializer};

use crate::Location;

/// A dot-delimited field path (`awards.wins`). Opaque: never validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct FieldPath(String);

impl FieldPath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        Self(path)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A statically known value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Char(char),
    /// A class literal such as `Movie.class`
    Class(String),
    Array(Vec<ResolvedValue>),
    /// An ordered document, as written in a template (`{ a: 1 }`)
    Document(Vec<(String, ResolvedValue)>),
    /// A constructed value object (`new Date(0L)`, `new ObjectId("..")`)
    Instance {
        type_name: String,
        arguments: Vec<ResolvedValue>,
    },
}

impl Value {
    /// Renders scalars the way string concatenation would.
    pub fn concat_text(&self) -> Option<String> {
        match self {
            Value::Null => Some("null".to_string()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Double(d) => Some(d.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Char(c) => Some(c.to_string()),
            _ => None,
        }
    }
}

/// Why a value could not be determined statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnresolvedReason {
    DynamicValue,
    RecursionDepthExceeded,
    ImplicitCollectionName,
    UnknownDeclaration,
    UnsupportedExpression,
    ExternalConfiguration,
}

impl fmt::Display for UnresolvedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UnresolvedReason::DynamicValue => "dynamic value",
            UnresolvedReason::RecursionDepthExceeded => "recursion depth exceeded",
            UnresolvedReason::ImplicitCollectionName => "implicit collection name",
            UnresolvedReason::UnknownDeclaration => "unknown declaration",
            UnresolvedReason::UnsupportedExpression => "unsupported expression",
            UnresolvedReason::ExternalConfiguration => "database configured outside source",
        };
        f.write_str(text)
    }
}

impl Serialize for UnresolvedReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The outcome of resolving one expression.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedValue {
    Literal(Value),
    Unresolved {
        reason: UnresolvedReason,
        location: Option<Location>,
    },
}

impl ResolvedValue {
    pub fn string(s: impl Into<String>) -> Self {
        ResolvedValue::Literal(Value::String(s.into()))
    }

    pub fn int(i: i64) -> Self {
        ResolvedValue::Literal(Value::Int(i))
    }

    pub fn unresolved(reason: UnresolvedReason, location: Option<Location>) -> Self {
        ResolvedValue::Unresolved { reason, location }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, ResolvedValue::Literal(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ResolvedValue::Literal(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn literal(&self) -> Option<&Value> {
        match self {
            ResolvedValue::Literal(v) => Some(v),
            ResolvedValue::Unresolved { .. } => None,
        }
    }

    pub fn unresolved_reason(&self) -> Option<UnresolvedReason> {
        match self {
            ResolvedValue::Literal(_) => None,
            ResolvedValue::Unresolved { reason, .. } => Some(*reason),
        }
    }
}

/// Why a recognized construct is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedReason {
    MissingFieldPath,
    UnresolvedFieldPath,
    InvalidArity { operator: String, count: usize },
    UnsupportedOperator(String),
    NotAPredicate,
    IncompleteCriteria,
    PlaceholderOutOfRange(usize),
    ImplicitConjunction,
    TemplateSyntax(String),
    UnknownOperator(String),
    UnknownAccumulator(String),
    UnknownStage(String),
}

impl MalformedReason {
    /// Whether the whole template text was rejected, as opposed to one node.
    pub fn is_template_error(&self) -> bool {
        matches!(
            self,
            MalformedReason::TemplateSyntax(_) | MalformedReason::UnknownOperator(_)
        )
    }
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::MissingFieldPath => f.write_str("missing field path"),
            MalformedReason::UnresolvedFieldPath => f.write_str("field path could not be resolved"),
            MalformedReason::InvalidArity { operator, count } => {
                write!(f, "invalid arity for {}: {} argument(s)", operator, count)
            }
            MalformedReason::UnsupportedOperator(op) => write!(f, "unsupported operator {}", op),
            MalformedReason::NotAPredicate => f.write_str("expression is not a predicate"),
            MalformedReason::IncompleteCriteria => f.write_str("criteria without comparator"),
            MalformedReason::PlaceholderOutOfRange(index) => {
                write!(f, "placeholder index out of range (?{})", index)
            }
            MalformedReason::ImplicitConjunction => {
                f.write_str("implicit multi-operator conjunction")
            }
            MalformedReason::TemplateSyntax(message) => f.write_str(message),
            MalformedReason::UnknownOperator(op) => write!(f, "unknown operator {}", op),
            MalformedReason::UnknownAccumulator(op) => write!(f, "unknown accumulator {}", op),
            MalformedReason::UnknownStage(stage) => write!(f, "unknown stage {}", stage),
        }
    }
}

impl Serialize for MalformedReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A filter predicate tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Eq(FieldPath, ResolvedValue),
    Ne(FieldPath, ResolvedValue),
    Gt(FieldPath, ResolvedValue),
    Gte(FieldPath, ResolvedValue),
    Lt(FieldPath, ResolvedValue),
    Lte(FieldPath, ResolvedValue),
    In(FieldPath, Vec<ResolvedValue>),
    /// Empty means "always true"
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    /// The filter expression itself is a dynamic value
    Unresolved {
        raw: String,
        reason: UnresolvedReason,
    },
    Malformed {
        raw: String,
        reason: MalformedReason,
    },
}

impl Predicate {
    pub fn match_all() -> Self {
        Predicate::And(Vec::new())
    }

    pub fn malformed(raw: impl Into<String>, reason: MalformedReason) -> Self {
        Predicate::Malformed {
            raw: raw.into(),
            reason,
        }
    }

    /// One predicate stays as is; anything else becomes an `And`.
    pub fn conjunction(mut predicates: Vec<Predicate>) -> Self {
        if predicates.len() == 1 {
            predicates.remove(0)
        } else {
            Predicate::And(predicates)
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Predicate::Malformed { .. })
    }
}

/// The six scalar comparison operators shared by every dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    /// Builder and criteria method names (`gte`).
    pub fn from_method(name: &str) -> Option<Self> {
        match name {
            "eq" => Some(Comparison::Eq),
            "ne" => Some(Comparison::Ne),
            "gt" => Some(Comparison::Gt),
            "gte" => Some(Comparison::Gte),
            "lt" => Some(Comparison::Lt),
            "lte" => Some(Comparison::Lte),
            _ => None,
        }
    }

    /// Template operators (`$gte`).
    pub fn from_operator(op: &str) -> Option<Self> {
        op.strip_prefix('$').and_then(Self::from_method)
    }

    pub fn apply(self, field: FieldPath, value: ResolvedValue) -> Predicate {
        match self {
            Comparison::Eq => Predicate::Eq(field, value),
            Comparison::Ne => Predicate::Ne(field, value),
            Comparison::Gt => Predicate::Gt(field, value),
            Comparison::Gte => Predicate::Gte(field, value),
            Comparison::Lt => Predicate::Lt(field, value),
            Comparison::Lte => Predicate::Lte(field, value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKey {
    /// `group(null)`: a single group over all documents
    All,
    Field(FieldPath),
    Unresolved(UnresolvedReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulatorOperator {
    Sum,
    Avg,
    First,
    Last,
    Max,
    Min,
    Push,
    AddToSet,
}

impl AccumulatorOperator {
    /// `Accumulators.sum` style names; template operators carry a `$` prefix.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.strip_prefix('$').unwrap_or(name) {
            "sum" => Some(AccumulatorOperator::Sum),
            "avg" => Some(AccumulatorOperator::Avg),
            "first" => Some(AccumulatorOperator::First),
            "last" => Some(AccumulatorOperator::Last),
            "max" => Some(AccumulatorOperator::Max),
            "min" => Some(AccumulatorOperator::Min),
            "push" => Some(AccumulatorOperator::Push),
            "addToSet" => Some(AccumulatorOperator::AddToSet),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumulatorSource {
    /// `"$field"` references
    Field(FieldPath),
    Value(ResolvedValue),
}

impl AccumulatorSource {
    /// `"$price"` becomes a field reference, everything else stays a value.
    pub fn from_value(value: ResolvedValue) -> Self {
        match value.as_str().and_then(|s| s.strip_prefix('$')) {
            Some(field) => AccumulatorSource::Field(FieldPath::from(field)),
            None => AccumulatorSource::Value(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Accumulator {
    pub name: String,
    pub operator: AccumulatorOperator,
    pub source: AccumulatorSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectField {
    Field { path: FieldPath, include: bool },
    Malformed { raw: String, reason: MalformedReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    Field { path: FieldPath, direction: Direction },
    Malformed { raw: String, reason: MalformedReason },
}

/// One aggregation stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Match(Predicate),
    Group {
        key: GroupKey,
        accumulators: Vec<Accumulator>,
    },
    Project(Vec<ProjectField>),
    Sort(Vec<SortField>),
    /// The stage expression is only known at runtime
    Unresolved {
        raw: String,
        reason: UnresolvedReason,
    },
    Malformed {
        raw: String,
        reason: MalformedReason,
    },
}

/// The update document of an update command. Kept opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateSpec {
    pub raw: String,
}

/// The document (or documents) an insert writes. Kept opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSpec {
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Operation {
    Find {
        filter: Predicate,
        projection: Option<Vec<ProjectField>>,
        sort: Option<Vec<SortField>>,
    },
    Aggregate {
        pipeline: Vec<PipelineStage>,
    },
    Update {
        filter: Predicate,
        update: Option<UpdateSpec>,
    },
    Count {
        filter: Predicate,
    },
    Delete {
        filter: Predicate,
    },
    /// A write with no filter: `insertOne`, `insert`, `save`
    Insert {
        document: Option<DocumentSpec>,
    },
    Unsupported {
        raw: String,
    },
}

impl Operation {
    pub fn find(filter: Predicate) -> Self {
        Operation::Find {
            filter,
            projection: None,
            sort: None,
        }
    }

    pub fn filter(&self) -> Option<&Predicate> {
        match self {
            Operation::Find { filter, .. }
            | Operation::Update { filter, .. }
            | Operation::Count { filter }
            | Operation::Delete { filter } => Some(filter),
            Operation::Aggregate { .. }
            | Operation::Insert { .. }
            | Operation::Unsupported { .. } => None,
        }
    }
}

/// The concrete command a call site issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    FindMany,
    FindOne,
    Aggregate,
    CountDocuments,
    EstimatedDocumentCount,
    Distinct,
    UpdateOne,
    UpdateMany,
    Upsert,
    ReplaceOne,
    FindOneAndUpdate,
    FindOneAndReplace,
    FindOneAndDelete,
    DeleteOne,
    DeleteMany,
    InsertOne,
    InsertMany,
    Unknown,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Command::FindMany => "find_many",
            Command::FindOne => "find_one",
            Command::Aggregate => "aggregate",
            Command::CountDocuments => "count_documents",
            Command::EstimatedDocumentCount => "estimated_document_count",
            Command::Distinct => "distinct",
            Command::UpdateOne => "update_one",
            Command::UpdateMany => "update_many",
            Command::Upsert => "upsert",
            Command::ReplaceOne => "replace_one",
            Command::FindOneAndUpdate => "find_one_and_update",
            Command::FindOneAndReplace => "find_one_and_replace",
            Command::FindOneAndDelete => "find_one_and_delete",
            Command::DeleteOne => "delete_one",
            Command::DeleteMany => "delete_many",
            Command::InsertOne => "insert_one",
            Command::InsertMany => "insert_many",
            Command::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// MongoDB Java driver builders
    Builder,
    /// Spring Data `Criteria` on `MongoTemplate`
    Criteria,
    /// Spring Data repository `@Query` / `@Aggregation`
    Template,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Builder => write!(f, "builder"),
            Dialect::Criteria => write!(f, "criteria"),
            Dialect::Template => write!(f, "template"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryTarget {
    pub database: ResolvedValue,
    pub collection: ResolvedValue,
}

/// Path of a node inside a [`CanonicalQuery`], e.g. `/filter/1` or `/pipeline/0/filter`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NodePath(String);

impl NodePath {
    pub fn root() -> Self {
        NodePath("/".to_string())
    }

    pub fn child(&self, segment: &str) -> Self {
        if self.0 == "/" {
            NodePath(format!("/{}", segment))
        } else {
            NodePath(format!("{}/{}", self.0, segment))
        }
    }

    pub fn index(&self, i: usize) -> Self {
        self.child(&i.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The canonical shape of one query call site.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalQuery {
    pub dialect: Option<Dialect>,
    pub command: Command,
    pub target: QueryTarget,
    pub operation: Operation,
    pub source_locations: BTreeMap<NodePath, Location>,
}

impl CanonicalQuery {
    /// The minimal model for a call site no recognizer accepts.
    pub fn unsupported(raw: impl Into<String>, location: Location) -> Self {
        let mut source_locations = BTreeMap::new();
        let unknown = ResolvedValue::unresolved(
            UnresolvedReason::UnsupportedExpression,
            Some(location.clone()),
        );
        source_locations.insert(NodePath::root(), location);
        Self {
            dialect: None,
            command: Command::Unknown,
            target: QueryTarget {
                database: unknown.clone(),
                collection: unknown,
            },
            operation: Operation::Unsupported { raw: raw.into() },
            source_locations,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self.operation, Operation::Unsupported { .. })
    }

    /// Location of the whole call site.
    pub fn location(&self) -> Option<&Location> {
        self.source_locations.get(&NodePath::root())
    }

    /// Every unresolved or malformed node, in model order.
    pub fn issues(&self) -> Vec<Issue> {
        let mut collector = IssueCollector {
            locations: &self.source_locations,
            issues: Vec::new(),
        };
        let target = NodePath::root().child("target");
        collector.value(&target.child("database"), &self.target.database);
        collector.value(&target.child("collection"), &self.target.collection);

        match &self.operation {
            Operation::Find {
                filter,
                projection,
                sort,
            } => {
                collector.predicate(&NodePath::root().child("filter"), filter);
                if let Some(fields) = projection {
                    collector.project(&NodePath::root().child("projection"), fields);
                }
                if let Some(fields) = sort {
                    collector.sort(&NodePath::root().child("sort"), fields);
                }
            }
            Operation::Update { filter, .. }
            | Operation::Count { filter }
            | Operation::Delete { filter } => {
                collector.predicate(&NodePath::root().child("filter"), filter);
            }
            Operation::Aggregate { pipeline } => {
                let base = NodePath::root().child("pipeline");
                for (i, stage) in pipeline.iter().enumerate() {
                    collector.stage(&base.index(i), stage);
                }
            }
            Operation::Insert { .. } => {}
            Operation::Unsupported { raw } => {
                collector.push(
                    IssueKind::UnsupportedConstruct,
                    format!("unsupported call site: {}", raw),
                    &NodePath::root(),
                    None,
                );
            }
        }
        collector.issues
    }
}

/// Non-fatal problem categories reported alongside a [`CanonicalQuery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    UnresolvedValue,
    UnsupportedConstruct,
    MalformedPredicate,
    MalformedTemplate,
    RecursionDepthExceeded,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IssueKind::UnresolvedValue => "unresolved-value",
            IssueKind::UnsupportedConstruct => "unsupported-construct",
            IssueKind::MalformedPredicate => "malformed-predicate",
            IssueKind::MalformedTemplate => "malformed-template",
            IssueKind::RecursionDepthExceeded => "recursion-depth-exceeded",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub message: String,
    pub path: NodePath,
    pub location: Option<Location>,
}

struct IssueCollector<'q> {
    locations: &'q BTreeMap<NodePath, Location>,
    issues: Vec<Issue>,
}

impl IssueCollector<'_> {
    fn push(&mut self, kind: IssueKind, message: String, path: &NodePath, own: Option<&Location>) {
        let location = own.cloned().or_else(|| self.locations.get(path).cloned());
        self.issues.push(Issue {
            kind,
            message,
            path: path.clone(),
            location,
        });
    }

    fn value(&mut self, path: &NodePath, value: &ResolvedValue) {
        match value {
            ResolvedValue::Unresolved { reason, location } => {
                let kind = match reason {
                    UnresolvedReason::RecursionDepthExceeded => IssueKind::RecursionDepthExceeded,
                    UnresolvedReason::UnsupportedExpression => IssueKind::UnsupportedConstruct,
                    _ => IssueKind::UnresolvedValue,
                };
                self.push(kind, reason.to_string(), path, location.as_ref());
            }
            ResolvedValue::Literal(Value::Array(items)) => {
                for item in items {
                    self.value(path, item);
                }
            }
            ResolvedValue::Literal(Value::Document(entries)) => {
                for (_, item) in entries {
                    self.value(path, item);
                }
            }
            ResolvedValue::Literal(Value::Instance { arguments, .. }) => {
                for item in arguments {
                    self.value(path, item);
                }
            }
            ResolvedValue::Literal(_) => {}
        }
    }

    fn malformed(&mut self, path: &NodePath, raw: &str, reason: &MalformedReason) {
        let kind = if reason.is_template_error() {
            IssueKind::MalformedTemplate
        } else {
            IssueKind::MalformedPredicate
        };
        self.push(kind, format!("{}: {}", reason, raw), path, None);
    }

    fn predicate(&mut self, path: &NodePath, predicate: &Predicate) {
        match predicate {
            Predicate::Eq(_, v)
            | Predicate::Ne(_, v)
            | Predicate::Gt(_, v)
            | Predicate::Gte(_, v)
            | Predicate::Lt(_, v)
            | Predicate::Lte(_, v) => self.value(path, v),
            Predicate::In(_, values) => {
                for v in values {
                    self.value(path, v);
                }
            }
            Predicate::And(children) | Predicate::Or(children) => {
                for (i, child) in children.iter().enumerate() {
                    self.predicate(&path.index(i), child);
                }
            }
            Predicate::Not(child) => self.predicate(&path.index(0), child),
            Predicate::Unresolved { raw, reason } => {
                let kind = match reason {
                    UnresolvedReason::RecursionDepthExceeded => IssueKind::RecursionDepthExceeded,
                    _ => IssueKind::UnresolvedValue,
                };
                self.push(kind, format!("{}: {}", reason, raw), path, None);
            }
            Predicate::Malformed { raw, reason } => self.malformed(path, raw, reason),
        }
    }

    fn project(&mut self, path: &NodePath, fields: &[ProjectField]) {
        for (i, field) in fields.iter().enumerate() {
            if let ProjectField::Malformed { raw, reason } = field {
                self.malformed(&path.index(i), raw, reason);
            }
        }
    }

    fn sort(&mut self, path: &NodePath, fields: &[SortField]) {
        for (i, field) in fields.iter().enumerate() {
            if let SortField::Malformed { raw, reason } = field {
                self.malformed(&path.index(i), raw, reason);
            }
        }
    }

    fn stage(&mut self, path: &NodePath, stage: &PipelineStage) {
        match stage {
            PipelineStage::Match(filter) => self.predicate(&path.child("filter"), filter),
            PipelineStage::Group { key, accumulators } => {
                if let GroupKey::Unresolved(reason) = key {
                    self.push(
                        IssueKind::UnresolvedValue,
                        reason.to_string(),
                        &path.child("key"),
                        None,
                    );
                }
                let base = path.child("accumulators");
                for (i, acc) in accumulators.iter().enumerate() {
                    if let AccumulatorSource::Value(v) = &acc.source {
                        self.value(&base.index(i), v);
                    }
                }
            }
            PipelineStage::Project(fields) => self.project(&path.child("fields"), fields),
            PipelineStage::Sort(fields) => self.sort(&path.child("fields"), fields),
            PipelineStage::Unresolved { raw, reason } => {
                let kind = match reason {
                    UnresolvedReason::RecursionDepthExceeded => IssueKind::RecursionDepthExceeded,
                    _ => IssueKind::UnresolvedValue,
                };
                self.push(kind, format!("{}: {}", reason, raw), path, None);
            }
            PipelineStage::Malformed { raw, reason } => self.malformed(path, raw, reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn loc(line: u32) -> Location {
        Location::new(PathBuf::from("Q.java"), line, 1)
    }

    fn query(operation: Operation) -> CanonicalQuery {
        CanonicalQuery {
            dialect: Some(Dialect::Builder),
            command: Command::FindMany,
            target: QueryTarget {
                database: ResolvedValue::string("db"),
                collection: ResolvedValue::string("movies"),
            },
            operation,
            source_locations: BTreeMap::new(),
        }
    }

    #[test]
    fn test_node_path_building() {
        let root = NodePath::root();
        assert_eq!(root.as_str(), "/");
        assert_eq!(root.child("filter").as_str(), "/filter");
        assert_eq!(root.child("filter").index(1).as_str(), "/filter/1");
        assert_eq!(
            root.child("pipeline").index(0).child("filter").as_str(),
            "/pipeline/0/filter"
        );
    }

    #[test]
    fn test_conjunction_keeps_single_leaf() {
        let leaf = Predicate::Eq(FieldPath::from("a"), ResolvedValue::int(1));
        assert_eq!(Predicate::conjunction(vec![leaf.clone()]), leaf);
        assert_eq!(Predicate::conjunction(vec![]), Predicate::match_all());
        assert!(matches!(
            Predicate::conjunction(vec![leaf.clone(), leaf]),
            Predicate::And(children) if children.len() == 2
        ));
    }

    #[test]
    fn test_reason_display_strings() {
        assert_eq!(UnresolvedReason::DynamicValue.to_string(), "dynamic value");
        assert_eq!(
            UnresolvedReason::RecursionDepthExceeded.to_string(),
            "recursion depth exceeded"
        );
        assert_eq!(
            UnresolvedReason::ImplicitCollectionName.to_string(),
            "implicit collection name"
        );
        assert_eq!(
            MalformedReason::ImplicitConjunction.to_string(),
            "implicit multi-operator conjunction"
        );
        assert_eq!(MalformedReason::MissingFieldPath.to_string(), "missing field path");
    }

    #[test]
    fn test_comparison_lookup() {
        assert_eq!(Comparison::from_method("gte"), Some(Comparison::Gte));
        assert_eq!(Comparison::from_operator("$lt"), Some(Comparison::Lt));
        assert_eq!(Comparison::from_operator("lt"), None);
        assert_eq!(Comparison::from_method("in"), None);
    }

    #[test]
    fn test_accumulator_source_from_dollar_string() {
        assert_eq!(
            AccumulatorSource::from_value(ResolvedValue::string("$price")),
            AccumulatorSource::Field(FieldPath::from("price"))
        );
        assert_eq!(
            AccumulatorSource::from_value(ResolvedValue::int(1)),
            AccumulatorSource::Value(ResolvedValue::int(1))
        );
    }

    #[test]
    fn test_issues_report_unresolved_and_malformed() {
        let mut q = query(Operation::find(Predicate::And(vec![
            Predicate::Eq(FieldPath::from("title"), ResolvedValue::string("Jaws")),
            Predicate::malformed("eq(1)", MalformedReason::MissingFieldPath),
            Predicate::Gt(
                FieldPath::from("year"),
                ResolvedValue::unresolved(UnresolvedReason::DynamicValue, Some(loc(9))),
            ),
        ])));
        q.source_locations
            .insert(NodePath::root().child("filter").index(1), loc(4));

        let issues = q.issues();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].kind, IssueKind::MalformedPredicate);
        assert_eq!(issues[0].path.as_str(), "/filter/1");
        assert_eq!(issues[0].location, Some(loc(4)));
        assert_eq!(issues[1].kind, IssueKind::UnresolvedValue);
        assert_eq!(issues[1].location, Some(loc(9)));
    }

    #[test]
    fn test_issues_classify_template_errors() {
        let q = query(Operation::find(Predicate::malformed(
            "{ a: ",
            MalformedReason::TemplateSyntax("unbalanced braces".to_string()),
        )));
        let issues = q.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::MalformedTemplate);
        assert!(issues[0].message.starts_with("unbalanced braces"));
    }

    #[test]
    fn test_issues_walk_array_elements() {
        let q = query(Operation::find(Predicate::In(
            FieldPath::from("genre"),
            vec![
                ResolvedValue::string("drama"),
                ResolvedValue::unresolved(UnresolvedReason::RecursionDepthExceeded, None),
            ],
        )));
        let issues = q.issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind, IssueKind::RecursionDepthExceeded);
    }

    #[test]
    fn test_unsupported_query_reports_itself() {
        let q = CanonicalQuery::unsupported("list.size()", loc(2));
        assert!(!q.is_supported());
        assert_eq!(q.location(), Some(&loc(2)));
        let kinds: Vec<_> = q.issues().into_iter().map(|i| i.kind).collect();
        assert!(kinds.iter().all(|k| *k == IssueKind::UnsupportedConstruct));
        assert_eq!(kinds.len(), 3);
    }

    #[test]
    fn test_serializes_reasons_as_strings() {
        let value = ResolvedValue::unresolved(UnresolvedReason::ImplicitCollectionName, None);
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["unresolved"]["reason"], "implicit collection name");

        let pred = Predicate::malformed("x", MalformedReason::ImplicitConjunction);
        let json = serde_json::to_value(&pred).unwrap();
        assert_eq!(json["malformed"]["reason"], "implicit multi-operator conjunction");
    }

    #[test]
    fn test_operation_serializes_with_kind_tag() {
        let json = serde_json::to_value(Operation::find(Predicate::match_all())).unwrap();
        assert_eq!(json["kind"], "find");
        assert_eq!(json["filter"]["and"], serde_json::json!([]));
    }
}
