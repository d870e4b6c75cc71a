//! Store settings, read from an optional TOML file and `DOCSHRED_*`
//! environment variables, the latter taking precedence.
//!
//! ```toml
//! path = "documents.db"
//! busy_timeout_ms = 5000
//! insert_batch_size = 30
//! max_retries = 5
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

// used to layer the config file and the environment
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::dialect::SqlDialect;
use crate::error::{DocShredError, Result};
use crate::postgres::PostgresDialect;
use crate::sqlite::SqliteDialect;

pub const ENV_PREFIX: &str = "DOCSHRED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    #[default]
    Sqlite,
    Postgres,
}

impl DialectKind {
    pub fn build(&self) -> Result<Arc<dyn SqlDialect>> {
        Ok(match self {
            DialectKind::Sqlite => Arc::new(SqliteDialect::new()?),
            DialectKind::Postgres => Arc::new(PostgresDialect::new()?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// The database file; an in-memory database when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub dialect: DialectKind,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Connections kept per connection class.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Rows written per batch.
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
    /// Batches of at least this many rows go out as one multi-row statement.
    #[serde(default = "default_bulk_insert_threshold")]
    pub bulk_insert_threshold: usize,
    /// Document identifiers bound per read or lookup statement.
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Workers used when internal indexes are built after an import.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Start with internal indexes deferred.
    #[serde(default)]
    pub data_import_mode: bool,
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}
const fn default_pool_size() -> usize {
    4
}
const fn default_insert_batch_size() -> usize {
    30
}
const fn default_bulk_insert_threshold() -> usize {
    10
}
const fn default_read_batch_size() -> usize {
    500
}
const fn default_max_retries() -> usize {
    5
}
const fn default_retry_backoff_ms() -> u64 {
    10
}
const fn default_worker_threads() -> usize {
    4
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            dialect: DialectKind::default(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_size: default_pool_size(),
            insert_batch_size: default_insert_batch_size(),
            bulk_insert_threshold: default_bulk_insert_threshold(),
            read_batch_size: default_read_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            worker_threads: default_worker_threads(),
            data_import_mode: false,
        }
    }
}

impl StoreConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }
    /// Reads the settings from `file`, when given, and the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(File::from(file));
        }
        let settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;
        let loaded: StoreConfig = settings.try_deserialize()?;
        loaded.validate()
    }
    fn validate(self) -> Result<Self> {
        let positive = [
            ("pool_size", self.pool_size),
            ("insert_batch_size", self.insert_batch_size),
            ("read_batch_size", self.read_batch_size),
            ("max_retries", self.max_retries),
            ("worker_threads", self.worker_threads),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(DocShredError::Config(format!("{} must be greater than zero", name)));
        }
        Ok(self)
    }
}
