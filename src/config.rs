//! # Configuration
//!
//! JSON configuration file. Only `repository` is required:
//!
//! ```json
//! {
//!   "repository": "./site.git",
//!   "reference": "HEAD",
//!   "allow_stash": false,
//!   "exclude": ["\\.wat$"],
//!   "port": 8080
//! }
//! ```

use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::{ExcludeRules, DEFAULT_CACHE_CAPACITY};
use crate::snapshot::DEFAULT_STASH_REFERENCE;

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path of the git repository (bare or `.git` directory)
    pub repository: PathBuf,

    /// Reference to serve (default: "HEAD")
    #[serde(default = "default_reference")]
    pub reference: String,

    /// Serve the stash reference instead when it exists (default: false)
    #[serde(default)]
    pub allow_stash: bool,

    #[serde(default = "default_stash_reference")]
    pub stash_reference: String,

    /// Patterns of paths never served as raw content
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Host to bind to (default: "0.0.0.0")
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Number of compiled snapshots kept in memory (default: 16)
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Log filter directive, overridden by `RUST_LOG` (default: "info")
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_reference() -> String {
    "HEAD".to_string()
}

fn default_stash_reference() -> String {
    DEFAULT_STASH_REFERENCE.to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_cache_capacity() -> usize {
    DEFAULT_CACHE_CAPACITY
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Configuration serving `repository` with every default
    pub fn new(repository: impl Into<PathBuf>) -> Self {
        Self {
            repository: repository.into(),
            reference: default_reference(),
            allow_stash: false,
            stash_reference: default_stash_reference(),
            exclude: Vec::new(),
            host: default_host(),
            port: default_port(),
            cache_capacity: default_cache_capacity(),
            log_filter: default_log_filter(),
        }
    }

    /// Load and validate a config file. A relative repository path is
    /// taken relative to the file's directory.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::parse(&content)?;
        if config.repository.is_relative() {
            if let Some(dir) = path.parent() {
                config.repository = dir.join(&config.repository);
            }
        }
        Ok(config)
    }

    /// Parse and validate config JSON
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.repository.as_os_str().is_empty() {
            return Err(ConfigError::invalid("repository", "must not be empty"));
        }
        if self.reference.trim().is_empty() {
            return Err(ConfigError::invalid("reference", "must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("port", "must be > 0"));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::invalid("cache_capacity", "must be > 0"));
        }
        self.exclude_rules()?;
        Ok(())
    }

    /// Compiled exclude patterns
    pub fn exclude_rules(&self) -> ConfigResult<ExcludeRules> {
        ExcludeRules::new(&self.exclude).map_err(|e| ConfigError::invalid("exclude", e.to_string()))
    }

    pub fn cache_capacity(&self) -> ConfigResult<NonZeroUsize> {
        NonZeroUsize::new(self.cache_capacity)
            .ok_or_else(|| ConfigError::invalid("cache_capacity", "must be > 0"))
    }

    /// Alternate reference in effect, if any
    pub fn alternate_reference(&self) -> Option<&str> {
        self.allow_stash.then_some(self.stash_reference.as_str())
    }
}
