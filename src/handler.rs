//! Classification of native backend failures and the retry loop built on it.
//!
//! Every statement runs under a [`Context`]. A dialect supplies [`ErrorRule`]s
//! mapping native codes (extended result code names on SQLite, SQLSTATE on
//! PostgreSQL) to the contexts in which the failure is transient. A matching
//! rule turns the failure into [`DocShredError::Rollback`], which the
//! [`Retrier`] answers by running the whole transaction again; anything else
//! becomes a fatal [`DocShredError::Backend`].

use std::fmt;
use std::thread;
use std::time::Duration;

// used to read native codes out of SQLite failures
use rusqlite::ffi;

use tracing::{debug, warn};

use crate::error::{DocShredError, Result};

// ------------- Context -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    Connect,
    CreateSchema,
    CreateTable,
    AddColumn,
    CreateIndex,
    DropSchema,
    DropTable,
    DropIndex,
    RenameTable,
    Fetch,
    MetaInsert,
    MetaUpdate,
    MetaDelete,
    Insert,
    Update,
    Delete,
    Commit,
    Rollback,
    Close,
}

impl Context {
    pub fn name(&self) -> &'static str {
        match self {
            Context::Connect => "connect",
            Context::CreateSchema => "create schema",
            Context::CreateTable => "create table",
            Context::AddColumn => "add column",
            Context::CreateIndex => "create index",
            Context::DropSchema => "drop schema",
            Context::DropTable => "drop table",
            Context::DropIndex => "drop index",
            Context::RenameTable => "rename table",
            Context::Fetch => "fetch",
            Context::MetaInsert => "metadata insert",
            Context::MetaUpdate => "metadata update",
            Context::MetaDelete => "metadata delete",
            Context::Insert => "insert",
            Context::Update => "update",
            Context::Delete => "delete",
            Context::Commit => "commit",
            Context::Rollback => "rollback",
            Context::Close => "close",
        }
    }
}
impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ------------- Rules -------------
/// A native code that asks for a rollback. An empty context list matches every context.
#[derive(Debug, Clone, Copy)]
pub struct ErrorRule {
    pub code: &'static str,
    pub contexts: &'static [Context],
}

impl ErrorRule {
    pub const fn always(code: &'static str) -> Self {
        Self { code, contexts: &[] }
    }
    pub const fn during(code: &'static str, contexts: &'static [Context]) -> Self {
        Self { code, contexts }
    }
    pub fn matches(&self, code: &str, context: Context) -> bool {
        self.code == code && (self.contexts.is_empty() || self.contexts.contains(&context))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ErrorHandler {
    rules: &'static [ErrorRule],
}

impl ErrorHandler {
    pub fn new(rules: &'static [ErrorRule]) -> Self {
        Self { rules }
    }
    /// Classifies a failure that carries a native `code`.
    pub fn classify(&self, context: Context, code: Option<&str>, message: impl Into<String>) -> DocShredError {
        let message = message.into();
        let code = code.map(str::to_string);
        let retryable = code
            .as_deref()
            .is_some_and(|code| self.rules.iter().any(|rule| rule.matches(code, context)));
        if retryable {
            debug!(%context, code = code.as_deref().unwrap_or_default(), "rollback requested");
            DocShredError::Rollback { context, code, message }
        } else {
            DocShredError::Backend { context, code, message }
        }
    }
    /// Classifies a SQLite failure by its extended result code name.
    pub fn classify_sqlite(&self, context: Context, error: rusqlite::Error) -> DocShredError {
        let code = sqlite_code_name(&error);
        self.classify(context, code, error.to_string())
    }
    /// Wraps SQLite results so that `?` classifies failures under `context`.
    pub fn check<T>(&self, context: Context, result: rusqlite::Result<T>) -> Result<T> {
        result.map_err(|error| self.classify_sqlite(context, error))
    }
}

/// The name of the extended result code of a SQLite failure, such as
/// `SQLITE_BUSY` or `SQLITE_CONSTRAINT_UNIQUE`.
pub fn sqlite_code_name(error: &rusqlite::Error) -> Option<&'static str> {
    let rusqlite::Error::SqliteFailure(failure, _) = error else {
        return None;
    };
    let name = match failure.extended_code {
        ffi::SQLITE_BUSY_SNAPSHOT => "SQLITE_BUSY_SNAPSHOT",
        ffi::SQLITE_BUSY_RECOVERY => "SQLITE_BUSY_RECOVERY",
        ffi::SQLITE_LOCKED_SHAREDCACHE => "SQLITE_LOCKED_SHAREDCACHE",
        ffi::SQLITE_CONSTRAINT_UNIQUE => "SQLITE_CONSTRAINT_UNIQUE",
        ffi::SQLITE_CONSTRAINT_PRIMARYKEY => "SQLITE_CONSTRAINT_PRIMARYKEY",
        ffi::SQLITE_CONSTRAINT_FOREIGNKEY => "SQLITE_CONSTRAINT_FOREIGNKEY",
        ffi::SQLITE_CONSTRAINT_NOTNULL => "SQLITE_CONSTRAINT_NOTNULL",
        ffi::SQLITE_CONSTRAINT_CHECK => "SQLITE_CONSTRAINT_CHECK",
        _ => match failure.code {
            rusqlite::ErrorCode::DatabaseBusy => "SQLITE_BUSY",
            rusqlite::ErrorCode::DatabaseLocked => "SQLITE_LOCKED",
            rusqlite::ErrorCode::ConstraintViolation => "SQLITE_CONSTRAINT",
            rusqlite::ErrorCode::ReadOnly => "SQLITE_READONLY",
            rusqlite::ErrorCode::DiskFull => "SQLITE_FULL",
            rusqlite::ErrorCode::CannotOpen => "SQLITE_CANTOPEN",
            rusqlite::ErrorCode::DatabaseCorrupt => "SQLITE_CORRUPT",
            _ => "SQLITE_ERROR",
        },
    };
    Some(name)
}

// ------------- Retrier -------------
/// Runs a transaction body until it succeeds, fails fatally or runs out of attempts.
#[derive(Debug, Clone, Copy)]
pub struct Retrier {
    max_attempts: usize,
    backoff: Duration,
}

impl Retrier {
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }
    pub fn run<T>(&self, mut body: impl FnMut(usize) -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match body(attempt) {
                Err(e) if e.is_rollback() => {
                    if attempt >= self.max_attempts {
                        warn!(attempts = attempt, error = %e, "giving up");
                        return Err(DocShredError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }
                    debug!(attempt, error = %e, "retrying");
                    // linear backoff
                    thread::sleep(self.backoff * attempt as u32);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
