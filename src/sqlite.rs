//! The SQLite dialect, the one the backend executes against.
//!
//! SQLite has no schemas inside one database file, so a table is named by its
//! schema and table identifiers joined with a dot and quoted as one identifier.
//! Generated identifiers never contain a dot, which keeps this unambiguous.

use std::sync::Arc;

use crate::datatype::FieldType;
use crate::dialect::{ConnectionClass, SqlDialect};
use crate::error::Result;
use crate::handler::{Context, ErrorRule};
use crate::identifier::{BaseIdentifierConstraints, IdentifierConstraints};

const MAX_IDENTIFIER_SIZE: usize = 128;
// the default SQLITE_MAX_VARIABLE_NUMBER of the bundled library
const MAX_BIND_PARAMETERS: usize = 32766;

const RULES: &[ErrorRule] = &[
    ErrorRule::always("SQLITE_BUSY"),
    ErrorRule::always("SQLITE_BUSY_SNAPSHOT"),
    ErrorRule::always("SQLITE_BUSY_RECOVERY"),
    ErrorRule::always("SQLITE_LOCKED"),
    ErrorRule::always("SQLITE_LOCKED_SHAREDCACHE"),
    ErrorRule::during("SQLITE_CONSTRAINT_UNIQUE", &[Context::MetaInsert]),
    ErrorRule::during("SQLITE_CONSTRAINT_PRIMARYKEY", &[Context::MetaInsert]),
    ErrorRule::during("SQLITE_CONSTRAINT_FOREIGNKEY", &[Context::MetaInsert]),
];

#[derive(Debug, Clone)]
pub struct SqliteDialect {
    constraints: Arc<BaseIdentifierConstraints>,
}

impl SqliteDialect {
    pub fn new() -> Result<Self> {
        let constraints = BaseIdentifierConstraints::new(
            MAX_IDENTIFIER_SIZE,
            &["main", "temp"],
            &[],
            &["rowid", "oid", "_rowid_"],
        )?;
        Ok(Self {
            constraints: Arc::new(constraints),
        })
    }
}

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }
    fn identifier_constraints(&self) -> Arc<dyn IdentifierConstraints> {
        self.constraints.clone()
    }
    fn error_rules(&self) -> &'static [ErrorRule] {
        RULES
    }
    fn can_execute(&self) -> bool {
        true
    }
    fn data_type(&self, field_type: FieldType) -> &'static str {
        match field_type {
            FieldType::Binary | FieldType::MongoObjectId => "BLOB",
            FieldType::Double => "REAL",
            FieldType::Date | FieldType::Time | FieldType::Instant | FieldType::String => "TEXT",
            FieldType::Boolean
            | FieldType::Integer
            | FieldType::Long
            | FieldType::MongoTimeStamp
            | FieldType::Null
            | FieldType::Child => "INTEGER",
        }
    }
    fn id_type(&self) -> &'static str {
        "INTEGER"
    }
    fn table(&self, schema: &str, table: &str) -> String {
        self.quote(&format!("{}.{}", schema, table))
    }
    fn placeholder(&self, position: usize) -> String {
        format!("?{}", position)
    }
    fn max_bind_parameters(&self) -> usize {
        MAX_BIND_PARAMETERS
    }
    fn begin_statement(&self, class: ConnectionClass) -> &'static str {
        match class {
            ConnectionClass::Session => "BEGIN IMMEDIATE",
            ConnectionClass::System => "BEGIN EXCLUSIVE",
            ConnectionClass::ReadOnly => "BEGIN DEFERRED",
        }
    }
    fn create_schema(&self, _schema: &str) -> Option<String> {
        None
    }
    fn drop_schema(&self, _schema: &str) -> Option<String> {
        None
    }
    fn rename_table(&self, from_schema: &str, from: &str, to_schema: &str, to: &str) -> Vec<String> {
        vec![format!(
            "ALTER TABLE {} RENAME TO {}",
            self.table(from_schema, from),
            self.table(to_schema, to)
        )]
    }
    fn analyze(&self, schema: &str, table: &str) -> String {
        format!("ANALYZE {}", self.table(schema, table))
    }
    fn table_size(&self, schema: &str, table: &str) -> Option<String> {
        let table = format!("{}.{}", schema, table).replace('\'', "''");
        Some(format!(
            "SELECT COALESCE(SUM(pgsize), 0) FROM dbstat WHERE name = '{table}' \
             OR name IN (SELECT name FROM sqlite_schema WHERE type = 'index' AND tbl_name = '{table}')"
        ))
    }
}
