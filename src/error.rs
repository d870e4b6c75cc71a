
use thiserror::Error;

use crate::handler::Context;

#[derive(Error, Debug)]
pub enum DocShredError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Document error: {0}")]
    Document(String),
    #[error("Backend error during {context}: {message}")]
    Backend { context: Context, code: Option<String>, message: String },
    #[error("Rollback requested during {context}: {message}")]
    Rollback { context: Context, code: Option<String>, message: String },
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: usize, last: Box<DocShredError> },
    #[error("Identifier error: {0}")]
    Identifier(String),
    #[error("Internal invariant violated: {0}")]
    Invariant(String),
    #[error("Unknown database: {0}")]
    UnknownDatabase(String),
    #[error("Unknown collection: {database}.{collection}")]
    UnknownCollection { database: String, collection: String },
    #[error("Unsupported: {0}")]
    Unsupported(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

impl DocShredError {
    /// True when the whole transaction should be rolled back and attempted again.
    pub fn is_rollback(&self) -> bool {
        matches!(self, Self::Rollback { .. })
    }
    /// The native backend code, if the error came from the backend.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Backend { code, .. } | Self::Rollback { code, .. } => code.as_deref(),
            Self::RetriesExhausted { last, .. } => last.code(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DocShredError>;

// Helper conversions
impl From<config::ConfigError> for DocShredError {
    fn from(e: config::ConfigError) -> Self { Self::Config(e.to_string()) }
}
impl From<serde_json::Error> for DocShredError {
    fn from(e: serde_json::Error) -> Self { Self::Document(e.to_string()) }
}
impl<T> From<std::sync::PoisonError<T>> for DocShredError {
    fn from(e: std::sync::PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}
