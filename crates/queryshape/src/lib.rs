//! queryshape: static extraction of MongoDB query shapes from Java source
//!
//! This crate turns query-construction call sites into one canonical model:
//! - Java driver builders (`Filters`, `Aggregates`, `Projections`, `Sorts`)
//! - Spring Data `Criteria` / `Query` chains on `MongoTemplate`
//! - Spring Data repository `@Query` / `@Aggregation` templates
//!
//! Values that cannot be determined statically are kept as explicit
//! [`model::ResolvedValue::Unresolved`] markers instead of failing the extraction.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod config;
pub mod constants;
pub mod decompose;
pub mod dialects;
pub mod discovery;
pub mod extract;
pub mod model;
pub mod resolve;
pub mod syntax;

// Re-export main types
pub use config::Config;
pub use constants::ConstantTable;
pub use extract::{Analysis, Extractor, FileQueries};
pub use model::{
    CanonicalQuery, Command, Dialect, FieldPath, Issue, IssueKind, MalformedReason, Operation,
    Predicate, QueryTarget, ResolvedValue, UnresolvedReason, Value,
};
pub use syntax::SourceUnit;

/// A location in source code (file, line, column) with start and end positions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub file: PathBuf,
    pub line: u32,       // 1-indexed start line
    pub column: u32,     // 1-indexed start column
    pub end_line: u32,   // 1-indexed end line
    pub end_column: u32, // 1-indexed end column
}

impl Location {
    pub fn new(file: PathBuf, line: u32, column: u32) -> Self {
        Self {
            file,
            line,
            column,
            end_line: line,
            end_column: column,
        }
    }

    /// Create a location with explicit start and end positions
    pub fn with_end(file: PathBuf, line: u32, column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            file,
            line,
            column,
            end_line,
            end_column,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

/// Errors raised while loading or parsing sources.
///
/// Extraction itself never fails; these only surface from the I/O edges.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse file: {path}")]
    ParseError { path: PathBuf },

    #[error("Failed to serialize queries: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
