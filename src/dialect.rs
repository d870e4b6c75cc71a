//! What a SQL backend has to render for the mapping engine.
//!
//! The engine never writes SQL text itself. Everything it executes, from the
//! metadata tables to the batched inserts, comes from a [`SqlDialect`]. The
//! dialect also owns the identifier rules of its backend and the error rules
//! used to classify native failures.

use std::fmt;
use std::sync::Arc;

use crate::datatype::FieldType;
use crate::handler::{ErrorHandler, ErrorRule};
use crate::identifier::{DID, INTERNAL_INDEX_SUFFIXES, IdentifierConstraints, META_SCHEMA, PID, RID, SEQ};
use crate::meta::MetaDocPartIndex;

/// Connection classes, each with its own pool and transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionClass {
    /// Document writes and the metadata they create.
    Session,
    /// Exclusive metadata work such as renames and drops.
    System,
    ReadOnly,
}

impl ConnectionClass {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionClass::Session => "session",
            ConnectionClass::System => "system",
            ConnectionClass::ReadOnly => "read-only",
        }
    }
}

/// Names of the metadata tables, all in the metadata schema.
pub mod meta_table {
    pub const DATABASE: &str = "database";
    pub const COLLECTION: &str = "collection";
    pub const DOC_PART: &str = "doc_part";
    pub const FIELD: &str = "field";
    pub const SCALAR: &str = "scalar";
    pub const INDEX: &str = "idx";
    pub const INDEX_FIELD: &str = "idx_field";
    pub const DOC_PART_INDEX: &str = "doc_part_idx";
    pub const DOC_PART_INDEX_COLUMN: &str = "doc_part_idx_column";
    pub const VERSION: &str = "meta_version";
}

pub trait SqlDialect: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;
    fn identifier_constraints(&self) -> Arc<dyn IdentifierConstraints>;
    fn error_rules(&self) -> &'static [ErrorRule];
    fn error_handler(&self) -> ErrorHandler {
        ErrorHandler::new(self.error_rules())
    }
    /// False for dialects that only render statements.
    fn can_execute(&self) -> bool;

    // ------------- Types and names -------------
    fn data_type(&self, field_type: FieldType) -> &'static str;
    /// The type of did, rid and pid columns.
    fn id_type(&self) -> &'static str;
    fn quote(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }
    /// A table (or index) qualified with its schema.
    fn table(&self, schema: &str, table: &str) -> String;
    /// The placeholder of the 1-based parameter `position`.
    fn placeholder(&self, position: usize) -> String;
    fn max_bind_parameters(&self) -> usize;
    fn begin_statement(&self, class: ConnectionClass) -> &'static str;
    fn commit_statement(&self) -> &'static str {
        "COMMIT"
    }
    fn rollback_statement(&self) -> &'static str {
        "ROLLBACK"
    }
    fn placeholders(&self, first: usize, count: usize) -> String {
        (first..first + count)
            .map(|position| self.placeholder(position))
            .collect::<Vec<_>>()
            .join(", ")
    }

    // ------------- Schemas -------------
    fn create_schema(&self, schema: &str) -> Option<String>;
    fn drop_schema(&self, schema: &str) -> Option<String>;

    // ------------- Metadata tables -------------
    fn create_meta_tables(&self) -> Vec<String> {
        let text = self.data_type(FieldType::String);
        let id = self.id_type();
        let flag = self.data_type(FieldType::Boolean);
        let t = |name: &str| self.table(META_SCHEMA, name);
        let mut statements: Vec<String> = self.create_schema(META_SCHEMA).into_iter().collect();
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {database} (
                name {text} NOT NULL PRIMARY KEY,
                identifier {text} NOT NULL UNIQUE
            )",
            database = t(meta_table::DATABASE),
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {collection} (
                database_name {text} NOT NULL,
                name {text} NOT NULL,
                identifier {text} NOT NULL,
                PRIMARY KEY (database_name, name),
                UNIQUE (database_name, identifier),
                FOREIGN KEY (database_name) REFERENCES {database} (name) ON DELETE CASCADE
            )",
            collection = t(meta_table::COLLECTION),
            database = t(meta_table::DATABASE),
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {doc_part} (
                database_name {text} NOT NULL,
                collection_name {text} NOT NULL,
                table_ref {text} NOT NULL,
                identifier {text} NOT NULL,
                last_rid {id} NOT NULL,
                PRIMARY KEY (database_name, collection_name, table_ref),
                UNIQUE (database_name, identifier),
                FOREIGN KEY (database_name, collection_name)
                    REFERENCES {collection} (database_name, name) ON DELETE CASCADE
            )",
            doc_part = t(meta_table::DOC_PART),
            collection = t(meta_table::COLLECTION),
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {field} (
                database_name {text} NOT NULL,
                collection_name {text} NOT NULL,
                table_ref {text} NOT NULL,
                name {text} NOT NULL,
                field_type {text} NOT NULL,
                identifier {text} NOT NULL,
                PRIMARY KEY (database_name, collection_name, table_ref, name, field_type),
                UNIQUE (database_name, collection_name, table_ref, identifier),
                FOREIGN KEY (database_name, collection_name, table_ref)
                    REFERENCES {doc_part} (database_name, collection_name, table_ref) ON DELETE CASCADE
            )",
            field = t(meta_table::FIELD),
            doc_part = t(meta_table::DOC_PART),
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {scalar} (
                database_name {text} NOT NULL,
                collection_name {text} NOT NULL,
                table_ref {text} NOT NULL,
                field_type {text} NOT NULL,
                identifier {text} NOT NULL,
                PRIMARY KEY (database_name, collection_name, table_ref, field_type),
                FOREIGN KEY (database_name, collection_name, table_ref)
                    REFERENCES {doc_part} (database_name, collection_name, table_ref) ON DELETE CASCADE
            )",
            scalar = t(meta_table::SCALAR),
            doc_part = t(meta_table::DOC_PART),
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {index} (
                database_name {text} NOT NULL,
                collection_name {text} NOT NULL,
                name {text} NOT NULL,
                is_unique {flag} NOT NULL,
                PRIMARY KEY (database_name, collection_name, name),
                FOREIGN KEY (database_name, collection_name)
                    REFERENCES {collection} (database_name, name) ON DELETE CASCADE
            )",
            index = t(meta_table::INDEX),
            collection = t(meta_table::COLLECTION),
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {index_field} (
                database_name {text} NOT NULL,
                collection_name {text} NOT NULL,
                index_name {text} NOT NULL,
                ordinal {id} NOT NULL,
                table_ref {text} NOT NULL,
                name {text} NOT NULL,
                direction {text} NOT NULL,
                PRIMARY KEY (database_name, collection_name, index_name, ordinal),
                FOREIGN KEY (database_name, collection_name, index_name)
                    REFERENCES {index} (database_name, collection_name, name) ON DELETE CASCADE
            )",
            index_field = t(meta_table::INDEX_FIELD),
            index = t(meta_table::INDEX),
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {doc_part_index} (
                database_name {text} NOT NULL,
                collection_name {text} NOT NULL,
                table_ref {text} NOT NULL,
                identifier {text} NOT NULL,
                is_unique {flag} NOT NULL,
                PRIMARY KEY (database_name, identifier),
                FOREIGN KEY (database_name, collection_name, table_ref)
                    REFERENCES {doc_part} (database_name, collection_name, table_ref) ON DELETE CASCADE
            )",
            doc_part_index = t(meta_table::DOC_PART_INDEX),
            doc_part = t(meta_table::DOC_PART),
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {column} (
                database_name {text} NOT NULL,
                index_identifier {text} NOT NULL,
                ordinal {id} NOT NULL,
                identifier {text} NOT NULL,
                direction {text} NOT NULL,
                PRIMARY KEY (database_name, index_identifier, ordinal),
                FOREIGN KEY (database_name, index_identifier)
                    REFERENCES {doc_part_index} (database_name, identifier) ON DELETE CASCADE
            )",
            column = t(meta_table::DOC_PART_INDEX_COLUMN),
            doc_part_index = t(meta_table::DOC_PART_INDEX),
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {version} (
                id {id} NOT NULL PRIMARY KEY CHECK (id = 0),
                version {id} NOT NULL
            )",
            version = t(meta_table::VERSION),
        ));
        statements
    }

    // ------------- Document part tables -------------
    fn create_doc_part_table(&self, schema: &str, table: &str, is_root: bool) -> String {
        let id = self.id_type();
        let columns = if is_root {
            format!("{} {} NOT NULL PRIMARY KEY", self.quote(DID), id)
        } else {
            format!(
                "{} {id} NOT NULL, {} {id} NOT NULL PRIMARY KEY, {} {id} NOT NULL, {} {}",
                self.quote(DID),
                self.quote(RID),
                self.quote(PID),
                self.quote(SEQ),
                self.data_type(FieldType::Integer),
            )
        };
        format!("CREATE TABLE {} ({})", self.table(schema, table), columns)
    }
    /// Identifiers of the internal indexes of a table; root tables have none.
    fn internal_index_identifiers(&self, table: &str, is_root: bool) -> Vec<(String, Vec<&'static str>)> {
        if is_root {
            return Vec::new();
        }
        vec![
            (format!("{}{}", table, INTERNAL_INDEX_SUFFIXES[0]), vec![DID]),
            (format!("{}{}", table, INTERNAL_INDEX_SUFFIXES[1]), vec![PID, SEQ]),
        ]
    }
    fn create_internal_indexes(&self, schema: &str, table: &str, is_root: bool) -> Vec<String> {
        self.internal_index_identifiers(table, is_root)
            .into_iter()
            .map(|(index, columns)| {
                let columns: Vec<String> = columns.iter().map(|column| self.quote(column)).collect();
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                    self.index_name(schema, &index),
                    self.table(schema, table),
                    columns.join(", ")
                )
            })
            .collect()
    }
    fn drop_internal_indexes(&self, schema: &str, table: &str, is_root: bool) -> Vec<String> {
        self.internal_index_identifiers(table, is_root)
            .into_iter()
            .map(|(index, _)| format!("DROP INDEX IF EXISTS {}", self.table(schema, &index)))
            .collect()
    }
    /// An index as it is named when created.
    fn index_name(&self, schema: &str, index: &str) -> String {
        self.table(schema, index)
    }
    fn add_column(&self, schema: &str, table: &str, column: &str, field_type: FieldType) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.table(schema, table),
            self.quote(column),
            self.data_type(field_type)
        )
    }
    fn create_index(&self, schema: &str, table: &str, index: &MetaDocPartIndex) -> String {
        let columns: Vec<String> = index
            .columns()
            .iter()
            .map(|column| format!("{} {}", self.quote(column.identifier()), column.ordering().name()))
            .collect();
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if index.is_unique() { "UNIQUE " } else { "" },
            self.index_name(schema, index.identifier()),
            self.table(schema, table),
            columns.join(", ")
        )
    }
    fn drop_index(&self, schema: &str, index: &str) -> String {
        format!("DROP INDEX IF EXISTS {}", self.table(schema, index))
    }
    fn drop_table(&self, schema: &str, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.table(schema, table))
    }
    fn rename_table(&self, from_schema: &str, from: &str, to_schema: &str, to: &str) -> Vec<String>;
    /// Best effort statistics refresh.
    fn analyze(&self, schema: &str, table: &str) -> String;

    // ------------- Rows -------------
    /// An insert of `rows` rows; parameters are bound row after row.
    fn insert_rows(&self, schema: &str, table: &str, columns: &[&str], rows: usize) -> String {
        let quoted: Vec<String> = columns.iter().map(|column| self.quote(column)).collect();
        let values: Vec<String> = (0..rows)
            .map(|row| format!("({})", self.placeholders(row * columns.len() + 1, columns.len())))
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES {}",
            self.table(schema, table),
            quoted.join(", "),
            values.join(", ")
        )
    }
    fn select_rows(&self, schema: &str, table: &str, columns: &[&str], dids: usize) -> String {
        let quoted: Vec<String> = columns.iter().map(|column| self.quote(column)).collect();
        format!(
            "SELECT {} FROM {} WHERE {} IN ({})",
            quoted.join(", "),
            self.table(schema, table),
            self.quote(DID),
            self.placeholders(1, dids)
        )
    }
    fn select_dids_by_column(&self, schema: &str, table: &str, column: &str, values: usize) -> String {
        format!(
            "SELECT DISTINCT {} FROM {} WHERE {} IN ({})",
            self.quote(DID),
            self.table(schema, table),
            self.quote(column),
            self.placeholders(1, values)
        )
    }
    fn select_all_dids(&self, schema: &str, table: &str) -> String {
        format!("SELECT {} FROM {}", self.quote(DID), self.table(schema, table))
    }
    fn count_rows(&self, schema: &str, table: &str) -> String {
        format!("SELECT COUNT(*) FROM {}", self.table(schema, table))
    }
    /// A query returning the bytes used by a table and its indexes, when the backend can tell.
    fn table_size(&self, schema: &str, table: &str) -> Option<String>;
    fn delete_rows(&self, schema: &str, table: &str, dids: usize) -> String {
        format!(
            "DELETE FROM {} WHERE {} IN ({})",
            self.table(schema, table),
            self.quote(DID),
            self.placeholders(1, dids)
        )
    }
}
