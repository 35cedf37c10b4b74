//! qshape: extract MongoDB query shapes from Java codebases.
//!
//! - `extract` prints the canonical query of every recognized call site
//! - `check` prints the unresolved and malformed parts of those queries

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use queryshape::model::{
    AccumulatorOperator, AccumulatorSource, Direction, DocumentSpec, GroupKey, PipelineStage,
    ProjectField, SortField, UpdateSpec,
};
use queryshape::{
    Analysis, CanonicalQuery, Config, FieldPath, FileQueries, Issue, Operation, Predicate,
    ResolvedValue, Value,
};
use serde::Serialize;

/// Exit codes for the CLI
///
/// - 0: Success (for `check`: no issues)
/// - 1: `check` found issues
/// - 2: Error (invalid input, missing path, etc.)
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const ISSUES_FOUND: u8 = 1;
    pub const ERROR: u8 = 2;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
    Text,
}

/// Extract MongoDB query shapes from Java source
#[derive(Parser)]
#[command(name = "qshape")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use compact output (no pretty-printing, no source spans)
    #[arg(long, global = true)]
    concise: bool,

    /// Database name for dialects that never name one in code
    #[arg(long, global = true)]
    database: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the canonical query of every recognized call site
    Extract {
        /// Project directory or single Java file (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Report unresolved values and malformed predicates
    Check {
        /// Project directory or single Java file (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();
    let format = cli.format;

    let options = Options {
        format,
        quiet: cli.quiet,
        concise: cli.concise,
        database: cli.database,
    };
    match run(cli.command, &options) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            if format == OutputFormat::Json {
                let error_json = serde_json::json!({
                    "error": "CommandFailed",
                    "message": e.to_string(),
                });
                eprintln!("{}", error_json);
            } else {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::from(exit_codes::ERROR)
        }
    }
}

struct Options {
    format: OutputFormat,
    quiet: bool,
    concise: bool,
    database: Option<String>,
}

fn run(command: Commands, options: &Options) -> Result<u8> {
    match command {
        Commands::Extract { path } => cmd_extract(&path, options),
        Commands::Check { path } => cmd_check(&path, options),
    }
}

/// Load config and sources, then extract with Ctrl-C cancellation.
fn analyze(path: &Path, options: &Options) -> Result<Vec<FileQueries>> {
    let path = path
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", path.display()))?;
    let root = if path.is_file() {
        path.parent().map(Path::to_path_buf).unwrap_or_else(|| path.clone())
    } else {
        path.clone()
    };

    let mut config = Config::load(&root);
    if let Some(database) = &options.database {
        config.default_database = Some(database.clone());
    }
    if !options.quiet && options.format != OutputFormat::Json && !config.exclude_dirs.is_empty() {
        eprintln!("Custom exclusions: {}", config.exclude_dirs.join(", "));
    }

    let analysis = Analysis::from_root(&path, config).context("Failed to load Java sources")?;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        tracing::warn!("Could not install Ctrl-C handler: {}", e);
    }
    let files = analysis.extract_all_cancellable(&cancel);
    if cancel.load(Ordering::Relaxed) {
        anyhow::bail!("Interrupted");
    }

    if !options.quiet && options.format != OutputFormat::Json {
        let queries: usize = files.iter().map(|f| f.queries.len()).sum();
        eprintln!(
            "Analyzed {} files, found {} queries",
            analysis.units().len(),
            queries
        );
    }
    Ok(files)
}

fn cmd_extract(path: &Path, options: &Options) -> Result<u8> {
    let files: Vec<FileQueries> = analyze(path, options)?
        .into_iter()
        .filter(|f| !f.queries.is_empty())
        .collect();

    match options.format {
        OutputFormat::Json => {
            let mut json = serde_json::to_value(&files)?;
            if options.concise {
                strip_source_locations(&mut json);
                println!("{}", serde_json::to_string(&json)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&json)?);
            }
        }
        OutputFormat::Pretty => {
            for file in &files {
                for query in &file.queries {
                    print_pretty(query);
                }
            }
        }
        OutputFormat::Text => {
            for file in &files {
                for query in &file.queries {
                    println!("{} {}", location_text(query), summary_line(query));
                }
            }
        }
    }

    Ok(exit_codes::SUCCESS)
}

fn cmd_check(path: &Path, options: &Options) -> Result<u8> {
    let files = analyze(path, options)?;
    let issues: Vec<Issue> = files
        .iter()
        .flat_map(|f| f.queries.iter())
        .flat_map(CanonicalQuery::issues)
        .collect();

    if options.format == OutputFormat::Json {
        let report = CheckReport {
            count: issues.len(),
            issues: &issues,
        };
        if options.concise {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    } else {
        for issue in &issues {
            let location = issue
                .location
                .as_ref()
                .map(|l| l.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            if options.format == OutputFormat::Pretty {
                println!("{}\n  {} at {}\n  {}", location, issue.kind, issue.path, issue.message);
            } else {
                println!("{} {} {}", location, issue.kind, issue.message);
            }
        }
        if !options.quiet {
            eprintln!("{} issue(s)", issues.len());
        }
    }

    if issues.is_empty() {
        Ok(exit_codes::SUCCESS)
    } else {
        Ok(exit_codes::ISSUES_FOUND)
    }
}

#[derive(Serialize)]
struct CheckReport<'a> {
    count: usize,
    issues: &'a [Issue],
}

fn strip_source_locations(json: &mut serde_json::Value) {
    let Some(files) = json.as_array_mut() else {
        return;
    };
    for file in files {
        if let Some(queries) = file.get_mut("queries").and_then(|q| q.as_array_mut()) {
            for query in queries {
                if let Some(object) = query.as_object_mut() {
                    object.remove("source_locations");
                }
            }
        }
    }
}

fn location_text(query: &CanonicalQuery) -> String {
    query
        .location()
        .map(|l| l.to_string())
        .unwrap_or_else(|| "<unknown>".to_string())
}

fn dialect_text(query: &CanonicalQuery) -> String {
    query
        .dialect
        .map(|d| d.to_string())
        .unwrap_or_else(|| "unsupported".to_string())
}

fn target_text(query: &CanonicalQuery) -> String {
    format!(
        "{}.{}",
        render_name(&query.target.database),
        render_name(&query.target.collection)
    )
}

fn summary_line(query: &CanonicalQuery) -> String {
    let shape = match &query.operation {
        Operation::Find { filter, .. }
        | Operation::Count { filter }
        | Operation::Delete { filter } => render_predicate(filter),
        Operation::Update { filter, update } => match update {
            Some(UpdateSpec { raw }) => format!("{} update {}", render_predicate(filter), raw),
            None => render_predicate(filter),
        },
        Operation::Aggregate { pipeline } => format!(
            "[{}]",
            pipeline.iter().map(stage_name).collect::<Vec<_>>().join(", ")
        ),
        Operation::Insert { document } => match document {
            Some(DocumentSpec { raw }) => format!("document {}", raw),
            None => String::new(),
        },
        Operation::Unsupported { raw } => raw.clone(),
    };
    format!(
        "{} {} {} {}",
        dialect_text(query),
        query.command,
        target_text(query),
        shape
    )
}

fn print_pretty(query: &CanonicalQuery) {
    println!(
        "{}  {} {}",
        location_text(query),
        dialect_text(query),
        query.command
    );
    println!("  target:     {}", target_text(query));
    match &query.operation {
        Operation::Find {
            filter,
            projection,
            sort,
        } => {
            println!("  filter:     {}", render_predicate(filter));
            if let Some(fields) = projection {
                println!("  projection: {}", render_projection(fields));
            }
            if let Some(fields) = sort {
                println!("  sort:       {}", render_sort(fields));
            }
        }
        Operation::Count { filter } | Operation::Delete { filter } => {
            println!("  filter:     {}", render_predicate(filter));
        }
        Operation::Update { filter, update } => {
            println!("  filter:     {}", render_predicate(filter));
            if let Some(update) = update {
                println!("  update:     {}", update.raw);
            }
        }
        Operation::Aggregate { pipeline } => {
            for (i, stage) in pipeline.iter().enumerate() {
                println!("  stage {}:    {}", i, render_stage(stage));
            }
        }
        Operation::Insert { document } => {
            if let Some(document) = document {
                println!("  document:   {}", document.raw);
            }
        }
        Operation::Unsupported { raw } => println!("  raw:        {}", raw),
    }
    println!();
}

/// Names print bare; anything unknown prints as `<reason>`.
fn render_name(value: &ResolvedValue) -> String {
    match value.as_str() {
        Some(name) => name.to_string(),
        None => render_value(value),
    }
}

fn render_value(value: &ResolvedValue) -> String {
    match value {
        ResolvedValue::Literal(literal) => render_literal(literal),
        ResolvedValue::Unresolved { reason, .. } => format!("<{}>", reason),
    }
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{:?}", s),
        Value::Char(c) => format!("{:?}", c),
        Value::Class(name) => format!("{}.class", name),
        Value::Array(items) => format!("[{}]", join(items.iter().map(render_value))),
        Value::Document(entries) => format!(
            "{{ {} }}",
            join(entries.iter().map(|(k, v)| format!("{}: {}", k, render_value(v))))
        ),
        Value::Instance {
            type_name,
            arguments,
        } => format!("new {}({})", type_name, join(arguments.iter().map(render_value))),
        scalar => scalar.concat_text().unwrap_or_default(),
    }
}

fn join(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(", ")
}

fn leaf(field: &FieldPath, op: &str, value: &ResolvedValue) -> String {
    format!("{} {} {}", field, op, render_value(value))
}

fn render_predicate(predicate: &Predicate) -> String {
    match predicate {
        Predicate::Eq(f, v) => leaf(f, "=", v),
        Predicate::Ne(f, v) => leaf(f, "!=", v),
        Predicate::Gt(f, v) => leaf(f, ">", v),
        Predicate::Gte(f, v) => leaf(f, ">=", v),
        Predicate::Lt(f, v) => leaf(f, "<", v),
        Predicate::Lte(f, v) => leaf(f, "<=", v),
        Predicate::In(f, values) => format!("{} in [{}]", f, join(values.iter().map(render_value))),
        Predicate::And(children) if children.is_empty() => "*".to_string(),
        Predicate::And(children) => format!(
            "({})",
            children.iter().map(render_predicate).collect::<Vec<_>>().join(" and ")
        ),
        Predicate::Or(children) => format!(
            "({})",
            children.iter().map(render_predicate).collect::<Vec<_>>().join(" or ")
        ),
        Predicate::Not(child) => format!("not {}", render_predicate(child)),
        Predicate::Unresolved { raw, reason } => format!("<{}: {}>", reason, raw),
        Predicate::Malformed { raw, reason } => format!("<malformed, {}: {}>", reason, raw),
    }
}

fn render_projection(fields: &[ProjectField]) -> String {
    join(fields.iter().map(|field| match field {
        ProjectField::Field { path, include } => {
            format!("{}: {}", path, if *include { 1 } else { 0 })
        }
        ProjectField::Malformed { raw, reason } => format!("<malformed, {}: {}>", reason, raw),
    }))
}

fn render_sort(fields: &[SortField]) -> String {
    join(fields.iter().map(|field| match field {
        SortField::Field { path, direction } => match direction {
            Direction::Ascending => format!("{} asc", path),
            Direction::Descending => format!("{} desc", path),
        },
        SortField::Malformed { raw, reason } => format!("<malformed, {}: {}>", reason, raw),
    }))
}

fn stage_name(stage: &PipelineStage) -> String {
    match stage {
        PipelineStage::Match(_) => "$match".to_string(),
        PipelineStage::Group { .. } => "$group".to_string(),
        PipelineStage::Project(_) => "$project".to_string(),
        PipelineStage::Sort(_) => "$sort".to_string(),
        PipelineStage::Unresolved { .. } => "<unresolved>".to_string(),
        PipelineStage::Malformed { .. } => "<malformed>".to_string(),
    }
}

fn render_stage(stage: &PipelineStage) -> String {
    match stage {
        PipelineStage::Match(filter) => format!("$match {}", render_predicate(filter)),
        PipelineStage::Group { key, accumulators } => {
            let key = match key {
                GroupKey::All => "null".to_string(),
                GroupKey::Field(path) => format!("${}", path),
                GroupKey::Unresolved(reason) => format!("<{}>", reason),
            };
            let accumulators = join(accumulators.iter().map(|acc| {
                let source = match &acc.source {
                    AccumulatorSource::Field(path) => format!("${}", path),
                    AccumulatorSource::Value(value) => render_value(value),
                };
                format!("{}: {}({})", acc.name, accumulator_name(acc.operator), source)
            }));
            format!("$group {} {{ {} }}", key, accumulators)
        }
        PipelineStage::Project(fields) => format!("$project {}", render_projection(fields)),
        PipelineStage::Sort(fields) => format!("$sort {}", render_sort(fields)),
        PipelineStage::Unresolved { raw, reason } => format!("<{}: {}>", reason, raw),
        PipelineStage::Malformed { raw, reason } => format!("<malformed, {}: {}>", reason, raw),
    }
}

fn accumulator_name(operator: AccumulatorOperator) -> &'static str {
    match operator {
        AccumulatorOperator::Sum => "$sum",
        AccumulatorOperator::Avg => "$avg",
        AccumulatorOperator::First => "$first",
        AccumulatorOperator::Last => "$last",
        AccumulatorOperator::Max => "$max",
        AccumulatorOperator::Min => "$min",
        AccumulatorOperator::Push => "$push",
        AccumulatorOperator::AddToSet => "$addToSet",
    }
}
