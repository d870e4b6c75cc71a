//! The PostgreSQL dialect. It renders statements and classifies SQLSTATE
//! codes but is never executed by this crate.

use std::sync::Arc;

use crate::datatype::FieldType;
use crate::dialect::{ConnectionClass, SqlDialect};
use crate::error::Result;
use crate::handler::{Context, ErrorRule};
use crate::identifier::{BaseIdentifierConstraints, IdentifierConstraints};

const MAX_IDENTIFIER_SIZE: usize = 63;
const MAX_BIND_PARAMETERS: usize = 32767;

const RULES: &[ErrorRule] = &[
    // serialization_failure, deadlock_detected
    ErrorRule::always("40001"),
    ErrorRule::always("40P01"),
    // duplicate_table, duplicate_column, duplicate_schema
    ErrorRule::during("42P07", &[Context::CreateTable, Context::CreateIndex]),
    ErrorRule::during("42701", &[Context::AddColumn]),
    ErrorRule::during("42P06", &[Context::CreateSchema]),
    // unique_violation
    ErrorRule::during("23505", &[Context::MetaInsert]),
];

#[derive(Debug, Clone)]
pub struct PostgresDialect {
    constraints: Arc<BaseIdentifierConstraints>,
}

impl PostgresDialect {
    pub fn new() -> Result<Self> {
        let constraints = BaseIdentifierConstraints::new(
            MAX_IDENTIFIER_SIZE,
            &["pg_catalog", "information_schema", "pg_toast", "public"],
            &[],
            &["oid", "tableoid", "xmin", "cmin", "xmax", "cmax", "ctid"],
        )?;
        Ok(Self {
            constraints: Arc::new(constraints),
        })
    }
}

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }
    fn identifier_constraints(&self) -> Arc<dyn IdentifierConstraints> {
        self.constraints.clone()
    }
    fn error_rules(&self) -> &'static [ErrorRule] {
        RULES
    }
    fn can_execute(&self) -> bool {
        false
    }
    fn data_type(&self, field_type: FieldType) -> &'static str {
        match field_type {
            FieldType::Binary | FieldType::MongoObjectId => "BYTEA",
            FieldType::Boolean | FieldType::Null | FieldType::Child => "BOOLEAN",
            FieldType::Date => "DATE",
            FieldType::Double => "DOUBLE PRECISION",
            FieldType::Instant => "TIMESTAMPTZ",
            FieldType::Integer => "INTEGER",
            FieldType::Long | FieldType::MongoTimeStamp => "BIGINT",
            FieldType::String => "TEXT",
            FieldType::Time => "TIME",
        }
    }
    fn id_type(&self) -> &'static str {
        "BIGINT"
    }
    fn table(&self, schema: &str, table: &str) -> String {
        format!("{}.{}", self.quote(schema), self.quote(table))
    }
    // indexes are created in the schema of their table
    fn index_name(&self, _schema: &str, index: &str) -> String {
        self.quote(index)
    }
    fn placeholder(&self, position: usize) -> String {
        format!("${}", position)
    }
    fn max_bind_parameters(&self) -> usize {
        MAX_BIND_PARAMETERS
    }
    fn begin_statement(&self, class: ConnectionClass) -> &'static str {
        match class {
            ConnectionClass::Session => "BEGIN ISOLATION LEVEL REPEATABLE READ",
            ConnectionClass::System => "BEGIN ISOLATION LEVEL SERIALIZABLE",
            ConnectionClass::ReadOnly => "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY",
        }
    }
    fn create_schema(&self, schema: &str) -> Option<String> {
        Some(format!("CREATE SCHEMA IF NOT EXISTS {}", self.quote(schema)))
    }
    fn drop_schema(&self, schema: &str) -> Option<String> {
        Some(format!("DROP SCHEMA IF EXISTS {} CASCADE", self.quote(schema)))
    }
    fn rename_table(&self, from_schema: &str, from: &str, to_schema: &str, to: &str) -> Vec<String> {
        let mut statements = Vec::new();
        let mut current = self.table(from_schema, from);
        if from != to {
            statements.push(format!("ALTER TABLE {} RENAME TO {}", current, self.quote(to)));
            current = self.table(from_schema, to);
        }
        if from_schema != to_schema {
            statements.push(format!("ALTER TABLE {} SET SCHEMA {}", current, self.quote(to_schema)));
        }
        statements
    }
    fn analyze(&self, schema: &str, table: &str) -> String {
        format!("ANALYZE {}", self.table(schema, table))
    }
    fn table_size(&self, schema: &str, table: &str) -> Option<String> {
        let qualified = self.table(schema, table).replace('\'', "''");
        Some(format!("SELECT pg_total_relation_size('{}')", qualified))
    }
}
