//! Configuration for queryshape.
//!
//! Loads settings from `.queryshape.toml` in the project root, then from
//! `QUERYSHAPE_*` environment variables. Uses figment for layered
//! configuration with provenance tracking.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::model::Dialect;

/// Name of the project configuration file.
pub const CONFIG_FILE: &str = ".queryshape.toml";

/// Default directories to skip when discovering sources.
pub const DEFAULT_EXCLUDE_DIRS: &[&str] = &[
    "target",
    "build",
    "out",
    "bin",
    ".git",
    ".gradle",
    ".idea",
    ".mvn",
    "node_modules",
];

/// Per-dialect switches. All dialects are on by default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DialectToggles {
    #[serde(default = "enabled")]
    pub builder: bool,
    #[serde(default = "enabled")]
    pub criteria: bool,
    #[serde(default = "enabled")]
    pub template: bool,
}

impl Default for DialectToggles {
    fn default() -> Self {
        Self {
            builder: true,
            criteria: true,
            template: true,
        }
    }
}

/// queryshape configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Additional directories to exclude from discovery (merged with defaults).
    #[serde(default)]
    pub exclude_dirs: Vec<String>,

    /// Whether to respect .gitignore files when discovering sources (default: true).
    #[serde(default = "enabled")]
    pub respect_gitignore: bool,

    /// How many helper calls deep value resolution may inline (default: 1).
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,

    /// Database name used when the code never names one (Spring templates).
    #[serde(default)]
    pub default_database: Option<String>,

    #[serde(default)]
    pub dialects: DialectToggles,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exclude_dirs: Vec::new(),
            respect_gitignore: true,
            max_call_depth: default_max_call_depth(),
            default_database: None,
            dialects: DialectToggles::default(),
        }
    }
}

fn enabled() -> bool {
    true
}

fn default_max_call_depth() -> usize {
    1
}

impl Config {
    /// Load configuration for the project rooted at `root`.
    ///
    /// Layers: defaults <- `.queryshape.toml` <- `QUERYSHAPE_*` variables
    /// (`QUERYSHAPE_DIALECTS__TEMPLATE=false` for nested keys).
    /// Invalid configuration is reported and replaced by defaults.
    pub fn load(root: &Path) -> Self {
        let config_path = root.join(CONFIG_FILE);

        let figment = Figment::from(Serialized::defaults(Config::default()));

        // Only add TOML provider if file exists
        let figment = if config_path.exists() {
            figment.merge(Toml::file(&config_path))
        } else {
            figment
        };
        let figment = figment.merge(Env::prefixed("QUERYSHAPE_").split("__"));

        match figment.extract() {
            Ok(config) => {
                if config_path.exists() {
                    tracing::info!("Loaded config from {:?}", config_path);
                }
                config
            }
            Err(e) => {
                tracing::warn!("Config error: {}", e);
                Self::default()
            }
        }
    }

    /// Get all directories to exclude (defaults + user-configured).
    pub fn excluded_dirs(&self) -> Vec<&str> {
        let mut dirs: Vec<&str> = DEFAULT_EXCLUDE_DIRS.to_vec();
        for dir in &self.exclude_dirs {
            if !dirs.contains(&dir.as_str()) {
                dirs.push(dir.as_str());
            }
        }
        dirs
    }

    pub fn dialect_enabled(&self, dialect: Dialect) -> bool {
        match dialect {
            Dialect::Builder => self.dialects.builder,
            Dialect::Criteria => self.dialects.criteria,
            Dialect::Template => self.dialects.template,
        }
    }
}
