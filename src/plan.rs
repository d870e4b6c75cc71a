//! The statements a metadata change or an insert turns into.
//!
//! Write transactions execute these statements; [`plan_insert`] only renders
//! them, which works for every dialect, including those that cannot execute.

use std::fmt;

use crate::collection_data::{CollectionData, D2RTranslator, DocPartData};
use crate::config::StoreConfig;
use crate::dialect::SqlDialect;
use crate::document::Document;
use crate::error::{DocShredError, Result};
use crate::handler::Context;
use crate::identifier::{DID, IdentifierFactory, PID, RID, SEQ};
use crate::meta::{MetaCollection, MetaSnapshot};
use crate::mutable::{MetaChange, MutableMetaSnapshot};
use crate::rid::InMemoryRidGenerator;

/// Appended to a table identifier while its collection is being renamed.
const RENAME_SUFFIX: &str = "$rename";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStatement {
    pub context: Context,
    pub sql: String,
}

impl PlannedStatement {
    fn new(context: Context, sql: String) -> Self {
        Self { context, sql }
    }
}
impl fmt::Display for PlannedStatement {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "-- {}\n{};", self.context, self.sql)
    }
}

fn schema_of<'s>(snapshot: &'s MetaSnapshot, database: &str) -> Result<&'s str> {
    snapshot
        .database(database)
        .map(|db| db.identifier())
        .ok_or_else(|| DocShredError::UnknownDatabase(database.to_string()))
}

fn drop_tables(dialect: &dyn SqlDialect, schema: &str, collection: &MetaCollection, into: &mut Vec<PlannedStatement>) {
    // children first
    for doc_part in collection.doc_parts().rev() {
        into.push(PlannedStatement::new(
            Context::DropTable,
            dialect.drop_table(schema, doc_part.identifier()),
        ));
    }
}

/// The DDL of one metadata change, rendered against the overlay it was
/// recorded in. Changes to entities that no longer exist render nothing.
pub fn change_statements(
    dialect: &dyn SqlDialect,
    snapshot: &MetaSnapshot,
    change: &MetaChange,
    import_mode: bool,
) -> Result<Vec<PlannedStatement>> {
    let mut statements = Vec::new();
    match change {
        MetaChange::AddDatabase { database } => {
            if let Some(sql) = snapshot.database(database).and_then(|db| dialect.create_schema(db.identifier())) {
                statements.push(PlannedStatement::new(Context::CreateSchema, sql));
            }
        }
        MetaChange::AddDocPart { database, collection, table_ref } => {
            let Some(doc_part) = snapshot.collection(database, collection).and_then(|c| c.doc_part(table_ref)) else {
                return Ok(statements);
            };
            let schema = schema_of(snapshot, database)?;
            let is_root = table_ref.is_root();
            statements.push(PlannedStatement::new(
                Context::CreateTable,
                dialect.create_doc_part_table(schema, doc_part.identifier(), is_root),
            ));
            if !import_mode {
                for sql in dialect.create_internal_indexes(schema, doc_part.identifier(), is_root) {
                    statements.push(PlannedStatement::new(Context::CreateIndex, sql));
                }
            }
        }
        MetaChange::AddField { database, collection, table_ref, name, field_type } => {
            let Some(doc_part) = snapshot.collection(database, collection).and_then(|c| c.doc_part(table_ref)) else {
                return Ok(statements);
            };
            if let Some(field) = doc_part.field(name, *field_type) {
                statements.push(PlannedStatement::new(
                    Context::AddColumn,
                    dialect.add_column(schema_of(snapshot, database)?, doc_part.identifier(), field.identifier(), *field_type),
                ));
            }
        }
        MetaChange::AddScalar { database, collection, table_ref, field_type } => {
            let Some(doc_part) = snapshot.collection(database, collection).and_then(|c| c.doc_part(table_ref)) else {
                return Ok(statements);
            };
            if let Some(scalar) = doc_part.scalar(*field_type) {
                statements.push(PlannedStatement::new(
                    Context::AddColumn,
                    dialect.add_column(schema_of(snapshot, database)?, doc_part.identifier(), scalar.identifier(), *field_type),
                ));
            }
        }
        MetaChange::AddDocPartIndex { database, collection, table_ref, identifier } => {
            let Some(doc_part) = snapshot.collection(database, collection).and_then(|c| c.doc_part(table_ref)) else {
                return Ok(statements);
            };
            if let Some(index) = doc_part.index(identifier) {
                statements.push(PlannedStatement::new(
                    Context::CreateIndex,
                    dialect.create_index(schema_of(snapshot, database)?, doc_part.identifier(), index),
                ));
            }
        }
        MetaChange::DropDocPartIndex { database, index, .. } => {
            if let Some(db) = snapshot.database(database) {
                statements.push(PlannedStatement::new(
                    Context::DropIndex,
                    dialect.drop_index(db.identifier(), index.identifier()),
                ));
            }
        }
        MetaChange::DropCollection { database, collection } => {
            drop_tables(dialect, schema_of(snapshot, database)?, collection, &mut statements);
        }
        MetaChange::DropDatabase { database } => {
            for collection in database.collections() {
                drop_tables(dialect, database.identifier(), collection, &mut statements);
            }
            if let Some(sql) = dialect.drop_schema(database.identifier()) {
                statements.push(PlannedStatement::new(Context::DropSchema, sql));
            }
        }
        MetaChange::RenameCollection { from_database, from_collection, to_database, to_collection } => {
            let from_schema = schema_of(snapshot, from_database)?;
            let to_schema = schema_of(snapshot, to_database)?;
            let target = snapshot.collection(to_database, to_collection).ok_or_else(|| {
                DocShredError::UnknownCollection {
                    database: to_database.to_string(),
                    collection: to_collection.to_string(),
                }
            })?;
            for doc_part in from_collection.doc_parts() {
                for index in doc_part.indexes() {
                    statements.push(PlannedStatement::new(
                        Context::DropIndex,
                        dialect.drop_index(from_schema, index.identifier()),
                    ));
                }
                for sql in dialect.drop_internal_indexes(from_schema, doc_part.identifier(), doc_part.table_ref().is_root()) {
                    statements.push(PlannedStatement::new(Context::DropIndex, sql));
                }
                let temporary = format!("{}{}", doc_part.identifier(), RENAME_SUFFIX);
                for sql in dialect.rename_table(from_schema, doc_part.identifier(), from_schema, &temporary) {
                    statements.push(PlannedStatement::new(Context::RenameTable, sql));
                }
            }
            for doc_part in from_collection.doc_parts() {
                let Some(renamed) = target.doc_part(doc_part.table_ref()) else {
                    continue;
                };
                let temporary = format!("{}{}", doc_part.identifier(), RENAME_SUFFIX);
                for sql in dialect.rename_table(from_schema, &temporary, to_schema, renamed.identifier()) {
                    statements.push(PlannedStatement::new(Context::RenameTable, sql));
                }
                if !import_mode {
                    for sql in dialect.create_internal_indexes(to_schema, renamed.identifier(), renamed.table_ref().is_root()) {
                        statements.push(PlannedStatement::new(Context::CreateIndex, sql));
                    }
                }
                for index in renamed.indexes() {
                    statements.push(PlannedStatement::new(
                        Context::CreateIndex,
                        dialect.create_index(to_schema, renamed.identifier(), index),
                    ));
                }
            }
        }
        MetaChange::AddCollection { .. }
        | MetaChange::AddIndex { .. }
        | MetaChange::DropIndex { .. }
        | MetaChange::LastRid { .. } => {}
    }
    Ok(statements)
}

// ------------- Inserts -------------
/// The columns rows of `part` are inserted into, internal columns first.
pub fn insert_columns(part: &DocPartData) -> Vec<&str> {
    let internal: &[&str] = if part.is_root() { &[DID] } else { &[DID, RID, PID, SEQ] };
    internal
        .iter()
        .copied()
        .chain(part.columns().iter().map(|column| column.identifier()))
        .collect()
}

/// How many rows of `width` columns go into one batch.
pub fn rows_per_batch(dialect: &dyn SqlDialect, config: &StoreConfig, width: usize) -> usize {
    config
        .insert_batch_size
        .min(dialect.max_bind_parameters() / width.max(1))
        .max(1)
}

/// Renders everything inserting `documents` into a store holding `snapshot`
/// would execute: the DDL of the metadata it creates, then the inserts.
pub fn plan_insert<'d>(
    dialect: &dyn SqlDialect,
    config: &StoreConfig,
    snapshot: &MetaSnapshot,
    database: &str,
    collection: &str,
    documents: impl IntoIterator<Item = (u64, &'d Document)>,
) -> Result<Vec<PlannedStatement>> {
    let factory = IdentifierFactory::new(dialect.identifier_constraints());
    let mut overlay = MutableMetaSnapshot::new(snapshot);
    let mut data: CollectionData = {
        let mut db = overlay.get_or_create_database(database, &factory)?;
        let mut target = db.get_or_create_collection(collection, &factory)?;
        D2RTranslator::new(&factory).translate(&mut target, documents)?
    };
    let mut statements = Vec::new();
    for change in overlay.changes() {
        statements.extend(change_statements(dialect, overlay.snapshot(), change, config.data_import_mode)?);
    }
    data.assign_rids(&InMemoryRidGenerator::from_snapshot(overlay.snapshot())?)?;
    let schema = schema_of(overlay.snapshot(), database)?;
    for part in data.doc_parts() {
        let columns = insert_columns(part);
        let per_batch = rows_per_batch(dialect, config, columns.len());
        for batch in part.rows().chunks(per_batch) {
            let rows = if batch.len() >= config.bulk_insert_threshold { batch.len() } else { 1 };
            let sql = dialect.insert_rows(schema, part.identifier(), &columns, rows);
            let repeat = if rows == 1 { batch.len() } else { 1 };
            statements.extend((0..repeat).map(|_| PlannedStatement::new(Context::Insert, sql.clone())));
        }
    }
    Ok(statements)
}
