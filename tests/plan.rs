use docshred::backend::Backend;
use docshred::config::StoreConfig;
use docshred::document::Document;
use docshred::handler::Context;
use docshred::meta::MetaSnapshot;
use docshred::plan::{PlannedStatement, plan_insert};
use docshred::postgres::PostgresDialect;
use docshred::sqlite::SqliteDialect;

fn doc(json: &str) -> Document {
    Document::from_json_str(json).expect("json")
}

fn sql_of(statements: &[PlannedStatement], context: Context) -> Vec<&str> {
    statements
        .iter()
        .filter(|statement| statement.context == context)
        .map(|statement| statement.sql.as_str())
        .collect()
}

#[test]
fn postgres_plan_creates_schema_tables_and_rows() {
    let dialect = PostgresDialect::new().expect("dialect");
    let document = doc(r#"{"a": [1, 2]}"#);
    let statements = plan_insert(
        &dialect,
        &StoreConfig::default(),
        &MetaSnapshot::new(),
        "shop",
        "people",
        [(1, &document)],
    )
    .expect("plan");

    assert_eq!(statements[0].sql, r#"CREATE SCHEMA IF NOT EXISTS "shop""#);
    assert_eq!(
        sql_of(&statements, Context::CreateTable),
        vec![
            r#"CREATE TABLE "shop"."people" ("did" BIGINT NOT NULL PRIMARY KEY)"#,
            r#"CREATE TABLE "shop"."people_a" ("did" BIGINT NOT NULL, "rid" BIGINT NOT NULL PRIMARY KEY, "pid" BIGINT NOT NULL, "seq" INTEGER)"#,
        ]
    );
    assert_eq!(
        sql_of(&statements, Context::AddColumn),
        vec![
            r#"ALTER TABLE "shop"."people" ADD COLUMN "a_e" BOOLEAN"#,
            r#"ALTER TABLE "shop"."people_a" ADD COLUMN "v_i" INTEGER"#,
        ]
    );
    assert_eq!(
        sql_of(&statements, Context::CreateIndex),
        vec![
            r#"CREATE INDEX IF NOT EXISTS "people_a_did_idx" ON "shop"."people_a" ("did")"#,
            r#"CREATE INDEX IF NOT EXISTS "people_a_pid_idx" ON "shop"."people_a" ("pid", "seq")"#,
        ]
    );
    assert_eq!(
        sql_of(&statements, Context::Insert),
        vec![
            r#"INSERT INTO "shop"."people" ("did", "a_e") VALUES ($1, $2)"#,
            r#"INSERT INTO "shop"."people_a" ("did", "rid", "pid", "seq", "v_i") VALUES ($1, $2, $3, $4, $5)"#,
            r#"INSERT INTO "shop"."people_a" ("did", "rid", "pid", "seq", "v_i") VALUES ($1, $2, $3, $4, $5)"#,
        ]
    );
}

#[test]
fn import_mode_plans_leave_out_internal_indexes() {
    let dialect = SqliteDialect::new().expect("dialect");
    let config = StoreConfig {
        data_import_mode: true,
        ..StoreConfig::default()
    };
    let document = doc(r#"{"a": {"b": [true]}}"#);
    let statements = plan_insert(&dialect, &config, &MetaSnapshot::new(), "db", "c", [(1, &document)])
        .expect("plan");
    assert!(sql_of(&statements, Context::CreateIndex).is_empty());
    assert_eq!(sql_of(&statements, Context::CreateTable).len(), 3);
    // no schemas in SQLite
    assert!(sql_of(&statements, Context::CreateSchema).is_empty());
}

#[test]
fn large_batches_become_one_statement() {
    let dialect = SqliteDialect::new().expect("dialect");
    let documents: Vec<(u64, Document)> = (1..=12).map(|did| (did, doc(r#"{"n": 1}"#))).collect();
    let statements = plan_insert(
        &dialect,
        &StoreConfig::default(),
        &MetaSnapshot::new(),
        "db",
        "c",
        documents.iter().map(|(did, document)| (*did, document)),
    )
    .expect("plan");
    let inserts = sql_of(&statements, Context::Insert);
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].matches("(?").count(), 12);
    assert!(inserts[0].starts_with(r#"INSERT INTO "db.c" ("did", "n_i") VALUES (?1, ?2), (?3, ?4)"#));
}

#[test]
fn known_shapes_need_no_ddl() {
    let backend = Backend::open_in_memory().expect("db");
    let stored = doc(r#"{"name": "Alice", "tags": ["a"]}"#);
    backend.insert_documents("shop", "people", &[(1, stored)]).expect("insert");
    let snapshot = backend.snapshot().expect("snapshot");
    let next = doc(r#"{"name": "Bob", "tags": ["b", "c"]}"#);
    let statements = plan_insert(
        backend.dialect(),
        backend.config(),
        &snapshot,
        "shop",
        "people",
        [(2, &next)],
    )
    .expect("plan");
    assert!(statements.iter().all(|statement| statement.context == Context::Insert));
    assert_eq!(statements.len(), 3);
}

#[test]
fn statements_print_with_their_context() {
    let dialect = SqliteDialect::new().expect("dialect");
    let document = doc(r#"{"x": 1}"#);
    let statements = plan_insert(
        &dialect,
        &StoreConfig::default(),
        &MetaSnapshot::new(),
        "db",
        "c",
        [(1, &document)],
    )
    .expect("plan");
    assert_eq!(statements[0].to_string(), "-- create table\nCREATE TABLE \"db.c\" (\"did\" INTEGER NOT NULL PRIMARY KEY);");
}
