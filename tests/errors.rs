use std::cell::Cell;
use std::time::Duration;

use docshred::dialect::SqlDialect;
use docshred::error::DocShredError;
use docshred::handler::{Context, Retrier, sqlite_code_name};
use docshred::postgres::PostgresDialect;
use docshred::sqlite::SqliteDialect;

fn rollback() -> DocShredError {
    DocShredError::Rollback {
        context: Context::Insert,
        code: Some(String::from("SQLITE_BUSY")),
        message: String::from("database is locked"),
    }
}

#[test]
fn sqlite_busy_and_locked_always_retry() {
    let handler = SqliteDialect::new().expect("dialect").error_handler();
    for code in ["SQLITE_BUSY", "SQLITE_BUSY_SNAPSHOT", "SQLITE_LOCKED"] {
        for context in [Context::Insert, Context::Fetch, Context::CreateTable, Context::Commit] {
            assert!(handler.classify(context, Some(code), "busy").is_rollback(), "{} during {}", code, context);
        }
    }
}

#[test]
fn constraint_violations_retry_only_on_metadata() {
    let handler = SqliteDialect::new().expect("dialect").error_handler();
    let racing = handler.classify(Context::MetaInsert, Some("SQLITE_CONSTRAINT_UNIQUE"), "unique");
    assert!(racing.is_rollback());
    let duplicate = handler.classify(Context::Insert, Some("SQLITE_CONSTRAINT_UNIQUE"), "unique");
    assert!(!duplicate.is_rollback());
    assert_eq!(duplicate.code(), Some("SQLITE_CONSTRAINT_UNIQUE"));
    assert!(matches!(
        handler.classify(Context::Insert, None, "no code"),
        DocShredError::Backend { code: None, .. }
    ));
}

#[test]
fn postgres_codes_follow_their_contexts() {
    let handler = PostgresDialect::new().expect("dialect").error_handler();
    assert!(handler.classify(Context::Fetch, Some("40001"), "serialization").is_rollback());
    assert!(handler.classify(Context::Commit, Some("40P01"), "deadlock").is_rollback());
    assert!(handler.classify(Context::CreateTable, Some("42P07"), "exists").is_rollback());
    assert!(!handler.classify(Context::Insert, Some("42P07"), "exists").is_rollback());
    assert!(handler.classify(Context::AddColumn, Some("42701"), "exists").is_rollback());
    assert!(!handler.classify(Context::Insert, Some("23505"), "duplicate").is_rollback());
    assert!(handler.classify(Context::MetaInsert, Some("23505"), "duplicate").is_rollback());
}

#[test]
fn native_failures_are_named() {
    let connection = rusqlite::Connection::open_in_memory().expect("open");
    connection
        .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, v TEXT UNIQUE); INSERT INTO t VALUES (1, 'a');")
        .expect("setup");
    let primary = connection
        .execute("INSERT INTO t VALUES (1, 'b')", [])
        .expect_err("duplicate key");
    assert_eq!(sqlite_code_name(&primary), Some("SQLITE_CONSTRAINT_PRIMARYKEY"));
    let unique = connection
        .execute("INSERT INTO t VALUES (2, 'a')", [])
        .expect_err("duplicate value");
    assert_eq!(sqlite_code_name(&unique), Some("SQLITE_CONSTRAINT_UNIQUE"));
    let handler = SqliteDialect::new().expect("dialect").error_handler();
    let classified = handler.classify_sqlite(Context::MetaInsert, unique);
    assert!(classified.is_rollback());
    assert_eq!(sqlite_code_name(&rusqlite::Error::QueryReturnedNoRows), None);
}

#[test]
fn retrier_runs_again_after_rollbacks() {
    let attempts = Cell::new(0);
    let outcome = Retrier::new(5, Duration::ZERO).run(|attempt| {
        attempts.set(attempt);
        if attempt < 3 { Err(rollback()) } else { Ok(attempt * 10) }
    });
    assert_eq!(outcome.expect("third attempt"), 30);
    assert_eq!(attempts.get(), 3);
}

#[test]
fn retrier_gives_up_after_the_last_attempt() {
    let attempts = Cell::new(0);
    let outcome: Result<(), DocShredError> = Retrier::new(3, Duration::ZERO).run(|_| {
        attempts.set(attempts.get() + 1);
        Err(rollback())
    });
    match outcome {
        Err(DocShredError::RetriesExhausted { attempts: tried, last }) => {
            assert_eq!(tried, 3);
            assert!(last.is_rollback());
        }
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(attempts.get(), 3);
}

#[test]
fn retrier_stops_at_fatal_errors() {
    let attempts = Cell::new(0);
    let outcome: Result<(), DocShredError> = Retrier::new(5, Duration::ZERO).run(|_| {
        attempts.set(attempts.get() + 1);
        Err(DocShredError::Invariant(String::from("broken")))
    });
    assert!(matches!(outcome, Err(DocShredError::Invariant(_))));
    assert_eq!(attempts.get(), 1);
    // at least one attempt is always made
    assert_eq!(Retrier::new(0, Duration::ZERO).max_attempts(), 1);
}
