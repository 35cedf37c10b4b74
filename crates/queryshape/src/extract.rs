//! Extraction entry points.
//!
//! [`Extractor`] turns one call site into a [`CanonicalQuery`]. [`Analysis`]
//! owns a set of parsed units, builds the shared [`ConstantTable`] once and
//! extracts every file in parallel.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::Serialize;
use tree_sitter::Node;

use crate::config::Config;
use crate::constants::ConstantTable;
use crate::decompose::decompose;
use crate::dialects::{dispatch, CallSite, Context};
use crate::discovery::find_java_files;
use crate::model::CanonicalQuery;
use crate::resolve::{Expr, Resolver};
use crate::syntax::{find_annotation, for_each_descendant, SourceUnit, Symbols};
use crate::Result;

/// Annotations that carry a repository query on a method declaration.
const QUERY_ANNOTATIONS: &[&str] = &["Query", "Aggregation"];

/// Extracts canonical queries against a shared constant table.
#[derive(Debug, Clone)]
pub struct Extractor {
    table: Arc<ConstantTable>,
    config: Arc<Config>,
}

impl Extractor {
    pub fn new(table: Arc<ConstantTable>, config: Arc<Config>) -> Self {
        Self { table, config }
    }

    pub fn table(&self) -> &ConstantTable {
        &self.table
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Extract the query issued at `node`.
    ///
    /// Never fails: a call site no dialect recognizes yields
    /// `Operation::Unsupported`.
    pub fn extract(&self, unit: &SourceUnit, node: Node<'_>) -> CanonicalQuery {
        let symbols = Symbols::new(unit);
        self.extract_site(&symbols, node)
    }

    /// Every recognized query in `unit`, in source order.
    pub fn extract_all(&self, unit: &SourceUnit) -> Vec<CanonicalQuery> {
        self.extract_until(unit, None)
    }

    fn extract_until(&self, unit: &SourceUnit, cancel: Option<&AtomicBool>) -> Vec<CanonicalQuery> {
        let symbols = Symbols::new(unit);
        let mut queries = Vec::new();
        for node in call_sites(unit) {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                tracing::debug!("Extraction of {} cancelled", unit.path().display());
                break;
            }
            let query = self.extract_site(&symbols, node);
            if query.is_supported() {
                queries.push(query);
            }
        }
        queries
    }

    /// One call site with a fresh resolver, so no cached value outlives it.
    fn extract_site<'t>(&self, symbols: &'t Symbols<'t>, node: Node<'t>) -> CanonicalQuery {
        let resolver = Resolver::new(symbols, &self.table, self.config.max_call_depth);
        let ctx = Context::new(&resolver, &self.config);

        let site = if node.kind() == "method_declaration" {
            CallSite::AnnotatedMethod { node }
        } else {
            match decompose(&resolver, &Expr::root(node)) {
                Ok(chain) => CallSite::Call { node, chain },
                Err(unsupported) => {
                    tracing::debug!("{}: {}", resolver.location(node), unsupported);
                    return CanonicalQuery::unsupported(resolver.text(node), resolver.location(node));
                }
            }
        };

        match dispatch(&ctx, &site) {
            Some(recognizer) => (recognizer.recognize)(&ctx, &site),
            None => CanonicalQuery::unsupported(resolver.text(node), resolver.location(node)),
        }
    }
}

/// Candidate call sites: chain-top method invocations (not the receiver of
/// another call) and methods annotated with a repository query.
pub fn call_sites(unit: &SourceUnit) -> Vec<Node<'_>> {
    let mut sites = Vec::new();
    for_each_descendant(unit.root(), |node| match node.kind() {
        "method_invocation" => {
            let is_receiver = node
                .parent()
                .filter(|parent| parent.kind() == "method_invocation")
                .and_then(|parent| parent.child_by_field_name("object"))
                .is_some_and(|object| object.id() == node.id());
            if !is_receiver {
                sites.push(node);
            }
        }
        "method_declaration" => {
            if QUERY_ANNOTATIONS
                .iter()
                .any(|name| find_annotation(unit, node, name).is_some())
            {
                sites.push(node);
            }
        }
        _ => {}
    });
    sites
}

/// The queries found in one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileQueries {
    pub file: PathBuf,
    pub queries: Vec<CanonicalQuery>,
}

/// A whole-project extraction pass.
pub struct Analysis {
    units: Vec<SourceUnit>,
    extractor: Extractor,
}

impl Analysis {
    /// Build the constant table for `units`.
    pub fn new(units: Vec<SourceUnit>, config: Config) -> Self {
        let table = ConstantTable::build(&units, config.max_call_depth);
        Self {
            units,
            extractor: Extractor::new(Arc::new(table), Arc::new(config)),
        }
    }

    /// Load and parse `paths` in parallel. Unreadable files are logged and skipped.
    pub fn from_paths(paths: &[PathBuf], config: Config) -> Self {
        let units = paths
            .par_iter()
            .filter_map(|path| match SourceUnit::from_file(path) {
                Ok(unit) => Some(unit),
                Err(e) => {
                    tracing::warn!("Skipping {}: {}", path.display(), e);
                    None
                }
            })
            .collect();
        Self::new(units, config)
    }

    /// Discover and load every Java file under `root`.
    pub fn from_root(root: &Path, config: Config) -> Result<Self> {
        let files = find_java_files(root, &config.excluded_dirs(), config.respect_gitignore)?;
        tracing::debug!("Found {} Java files under {}", files.len(), root.display());
        Ok(Self::from_paths(&files, config))
    }

    pub fn units(&self) -> &[SourceUnit] {
        &self.units
    }

    pub fn table(&self) -> &ConstantTable {
        self.extractor.table()
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    /// Extract every file, keeping the order of the units.
    pub fn extract_all(&self) -> Vec<FileQueries> {
        self.run(None)
    }

    /// Like [`Analysis::extract_all`], stopping at the next call site once
    /// `cancel` is set. Files not reached come back empty.
    pub fn extract_all_cancellable(&self, cancel: &AtomicBool) -> Vec<FileQueries> {
        self.run(Some(cancel))
    }

    fn run(&self, cancel: Option<&AtomicBool>) -> Vec<FileQueries> {
        self.units
            .par_iter()
            .map(|unit| FileQueries {
                file: unit.path().to_path_buf(),
                queries: self.extractor.extract_until(unit, cancel),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Command, Dialect, FieldPath, Predicate, ResolvedValue};
    use std::fs;
    use tempfile::TempDir;

    const MIXED: &str = r#"
class MovieService {
    private final MongoTemplate template;
    private final MongoCollection<Document> movies;

    MovieService(MongoTemplate template, MongoDatabase db) {
        this.template = template;
        this.movies = db.getCollection("movies");
    }

    long viaDriver() {
        return movies.countDocuments(Filters.eq("year", 1999));
    }

    List<Movie> viaTemplate() {
        return template.find(Query.query(Criteria.where("year").is(1999)), Movie.class);
    }

    int unrelated(List<String> names) {
        return names.size();
    }
}
"#;

    fn analysis(sources: &[(&str, &str)]) -> Analysis {
        let units = sources
            .iter()
            .map(|(path, source)| SourceUnit::parse(*path, *source).expect("Should parse"))
            .collect();
        Analysis::new(units, Config::default())
    }

    #[test]
    fn test_extract_all_skips_unsupported_sites() {
        let analysis = analysis(&[("MovieService.java", MIXED)]);
        let files = analysis.extract_all();
        assert_eq!(files.len(), 1);
        let dialects: Vec<_> = files[0].queries.iter().map(|q| q.dialect).collect();
        assert_eq!(dialects, vec![Some(Dialect::Builder), Some(Dialect::Criteria)]);
        assert_eq!(files[0].queries[0].command, Command::CountDocuments);
        assert_eq!(
            files[0].queries[1].operation.filter(),
            Some(&Predicate::Eq(FieldPath::from("year"), ResolvedValue::int(1999)))
        );
    }

    #[test]
    fn test_unrecognized_site_is_unsupported() {
        let analysis = analysis(&[("MovieService.java", MIXED)]);
        let unit = &analysis.units()[0];
        let size_call = call_sites(unit)
            .into_iter()
            .find(|node| unit.text(*node) == "names.size()")
            .expect("Should find names.size()");
        let query = analysis.extractor().extract(unit, size_call);
        assert!(!query.is_supported());
        assert_eq!(query.dialect, None);
        assert_eq!(query.command, Command::Unknown);
    }

    #[test]
    fn test_call_sites_are_chain_tops() {
        let unit = SourceUnit::parse(
            "A.java",
            r#"
class A {
    @Query("{ a: ?0 }")
    List<Movie> byA(int a);

    void run() {
        db.getCollection("x").find(eq("a", 1)).first();
    }
}
"#,
        )
        .expect("Should parse");
        let kinds: Vec<_> = call_sites(&unit).into_iter().map(|n| n.kind()).collect();
        // the declaration, the outer chain and the eq(..) argument
        assert_eq!(kinds, vec!["method_declaration", "method_invocation", "method_invocation"]);
    }

    #[test]
    fn test_disabled_dialect_is_skipped() {
        let units = vec![SourceUnit::parse("MovieService.java", MIXED).expect("Should parse")];
        let mut config = Config::default();
        config.dialects.criteria = false;
        let files = Analysis::new(units, config).extract_all();
        assert_eq!(files[0].queries.len(), 1);
        assert_eq!(files[0].queries[0].dialect, Some(Dialect::Builder));
    }

    #[test]
    fn test_cancelled_extraction_returns_no_queries() {
        let analysis = analysis(&[("MovieService.java", MIXED)]);
        let cancel = AtomicBool::new(true);
        let files = analysis.extract_all_cancellable(&cancel);
        assert_eq!(files.len(), 1);
        assert!(files[0].queries.is_empty());
    }

    #[test]
    fn test_from_root_reads_java_files() {
        let temp = TempDir::new().expect("Should create temp dir");
        let src = temp.path().join("src");
        fs::create_dir_all(&src).expect("Should create src");
        fs::write(src.join("MovieService.java"), MIXED).expect("Should write source");
        fs::write(src.join("README.md"), "# not java").expect("Should write readme");

        let analysis = Analysis::from_root(temp.path(), Config::default()).expect("Should load");
        assert_eq!(analysis.units().len(), 1);
        let files = analysis.extract_all();
        assert_eq!(files[0].queries.len(), 2);
        assert!(files[0].file.ends_with("MovieService.java"));
    }

    #[test]
    fn test_from_root_missing_directory_is_an_error() {
        let temp = TempDir::new().expect("Should create temp dir");
        assert!(Analysis::from_root(&temp.path().join("missing"), Config::default()).is_err());
    }

    #[test]
    fn test_results_serialize_to_json() {
        let analysis = analysis(&[("MovieService.java", MIXED)]);
        let json = serde_json::to_value(analysis.extract_all()).expect("Should serialize");
        assert_eq!(json[0]["queries"][0]["dialect"], "builder");
        assert_eq!(json[0]["queries"][0]["operation"]["kind"], "count");
        assert_eq!(
            json[0]["queries"][0]["target"]["collection"]["literal"]["value"],
            "movies"
        );
    }
}
