//! Durable storage of the metadata model.
//!
//! The metadata tables live in their own schema and mirror the snapshot tree:
//! one table per entity, keyed by the names of its ancestors, with cascading
//! foreign keys so that deleting a database or collection row removes
//! everything below it. A single-row `meta_version` table counts the commits
//! that changed the schema.

// used for persistence
use rusqlite::{Connection, Params, Row, params};

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::datatype::FieldType;
use crate::dialect::{SqlDialect, meta_table};
use crate::error::{DocShredError, Result};
use crate::handler::{Context, ErrorHandler};
use crate::identifier::META_SCHEMA;
use crate::meta::{
    IndexOrdering, MetaCollection, MetaDatabase, MetaDocPart, MetaDocPartIndex, MetaDocPartIndexColumn,
    MetaField, MetaIndex, MetaIndexField, MetaScalar, MetaSnapshot,
};
use crate::reference::TableRef;

pub(crate) fn sql_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| DocShredError::Invariant(format!("{} exceeds the identifier range", id)))
}

pub(crate) fn id_from_sql(id: i64) -> Result<u64> {
    u64::try_from(id).map_err(|_| DocShredError::Invariant(format!("stored identifier {} is negative", id)))
}

fn field_type(name: &str) -> Result<FieldType> {
    FieldType::from_name(name).ok_or_else(|| DocShredError::Invariant(format!("unknown stored field type {}", name)))
}

fn ordering(name: &str) -> Result<IndexOrdering> {
    IndexOrdering::from_name(name).ok_or_else(|| DocShredError::Invariant(format!("unknown stored ordering {}", name)))
}

pub struct MetaPersistor<'c> {
    connection: &'c Connection,
    dialect: &'c dyn SqlDialect,
    handler: ErrorHandler,
}

impl<'c> MetaPersistor<'c> {
    pub fn new(connection: &'c Connection, dialect: &'c dyn SqlDialect) -> Self {
        Self {
            connection,
            dialect,
            handler: dialect.error_handler(),
        }
    }

    // ------------- Plumbing -------------
    fn table(&self, name: &str) -> String {
        self.dialect.table(META_SCHEMA, name)
    }
    fn execute<P: Params>(&self, context: Context, sql: &str, params: P) -> Result<usize> {
        let mut statement = self.handler.check(context, self.connection.prepare_cached(sql))?;
        self.handler.check(context, statement.execute(params))
    }
    fn insert<P: Params>(&self, table: &str, columns: &[&str], params: P) -> Result<()> {
        let sql = self.dialect.insert_rows(META_SCHEMA, table, columns, 1);
        self.execute(Context::MetaInsert, &sql, params)?;
        Ok(())
    }
    fn delete<P: Params>(&self, table: &str, keys: &[&str], params: P) -> Result<usize> {
        let conditions: Vec<String> = keys
            .iter()
            .enumerate()
            .map(|(position, key)| format!("{} = {}", key, self.dialect.placeholder(position + 1)))
            .collect();
        let sql = format!("DELETE FROM {} WHERE {}", self.table(table), conditions.join(" AND "));
        self.execute(Context::MetaDelete, &sql, params)
    }
    fn query<T, P: Params>(&self, sql: &str, params: P, map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>) -> Result<Vec<T>> {
        let mut statement = self.handler.check(Context::Fetch, self.connection.prepare_cached(sql))?;
        let rows = self.handler.check(Context::Fetch, statement.query_map(params, map))?;
        rows.map(|row| self.handler.check(Context::Fetch, row)).collect()
    }

    // ------------- Tables and version -------------
    pub fn create_tables(&self) -> Result<()> {
        for statement in self.dialect.create_meta_tables() {
            self.execute(Context::CreateTable, &statement, [])?;
        }
        let version = self.table(meta_table::VERSION);
        let sql = format!(
            "INSERT INTO {version} (id, version) SELECT 0, 0 WHERE NOT EXISTS (SELECT 1 FROM {version} WHERE id = 0)"
        );
        self.execute(Context::MetaInsert, &sql, [])?;
        Ok(())
    }
    pub fn version(&self) -> Result<u64> {
        let sql = format!("SELECT version FROM {} WHERE id = 0", self.table(meta_table::VERSION));
        let versions = self.query(&sql, [], |row| row.get::<_, i64>(0))?;
        let version = versions
            .first()
            .copied()
            .ok_or_else(|| DocShredError::Invariant(String::from("the metadata version row is missing")))?;
        id_from_sql(version)
    }
    /// Increments the stored version and returns the new value.
    pub fn bump_version(&self) -> Result<u64> {
        let sql = format!("UPDATE {} SET version = version + 1 WHERE id = 0", self.table(meta_table::VERSION));
        self.execute(Context::MetaUpdate, &sql, [])?;
        self.version()
    }

    // ------------- Inserts -------------
    pub fn insert_database(&self, database: &MetaDatabase) -> Result<()> {
        debug!(database = %database.name, "persisting database");
        self.insert(meta_table::DATABASE, &["name", "identifier"], params![database.name, database.identifier])
    }
    pub fn insert_collection(&self, database: &str, collection: &MetaCollection) -> Result<()> {
        self.insert(
            meta_table::COLLECTION,
            &["database_name", "name", "identifier"],
            params![database, collection.name, collection.identifier],
        )
    }
    pub fn insert_doc_part(&self, database: &str, collection: &str, doc_part: &MetaDocPart) -> Result<()> {
        self.insert(
            meta_table::DOC_PART,
            &["database_name", "collection_name", "table_ref", "identifier", "last_rid"],
            params![
                database,
                collection,
                doc_part.table_ref.to_json(),
                doc_part.identifier,
                sql_id(doc_part.last_rid)?
            ],
        )
    }
    pub fn insert_field(&self, database: &str, collection: &str, table_ref: &TableRef, field: &MetaField) -> Result<()> {
        self.insert(
            meta_table::FIELD,
            &["database_name", "collection_name", "table_ref", "name", "field_type", "identifier"],
            params![
                database,
                collection,
                table_ref.to_json(),
                field.name,
                field.field_type.name(),
                field.identifier
            ],
        )
    }
    pub fn insert_scalar(&self, database: &str, collection: &str, table_ref: &TableRef, scalar: &MetaScalar) -> Result<()> {
        self.insert(
            meta_table::SCALAR,
            &["database_name", "collection_name", "table_ref", "field_type", "identifier"],
            params![database, collection, table_ref.to_json(), scalar.field_type.name(), scalar.identifier],
        )
    }
    pub fn insert_index(&self, database: &str, collection: &str, index: &MetaIndex) -> Result<()> {
        self.insert(
            meta_table::INDEX,
            &["database_name", "collection_name", "name", "is_unique"],
            params![database, collection, index.name, index.unique],
        )?;
        for (ordinal, field) in index.fields.iter().enumerate() {
            self.insert(
                meta_table::INDEX_FIELD,
                &["database_name", "collection_name", "index_name", "ordinal", "table_ref", "name", "direction"],
                params![
                    database,
                    collection,
                    index.name,
                    ordinal as i64,
                    field.table_ref.to_json(),
                    field.name,
                    field.ordering.name()
                ],
            )?;
        }
        Ok(())
    }
    pub fn insert_doc_part_index(
        &self,
        database: &str,
        collection: &str,
        table_ref: &TableRef,
        index: &MetaDocPartIndex,
    ) -> Result<()> {
        self.insert(
            meta_table::DOC_PART_INDEX,
            &["database_name", "collection_name", "table_ref", "identifier", "is_unique"],
            params![database, collection, table_ref.to_json(), index.identifier, index.unique],
        )?;
        for (ordinal, column) in index.columns.iter().enumerate() {
            self.insert(
                meta_table::DOC_PART_INDEX_COLUMN,
                &["database_name", "index_identifier", "ordinal", "identifier", "direction"],
                params![database, index.identifier, ordinal as i64, column.identifier, column.ordering.name()],
            )?;
        }
        Ok(())
    }
    /// Persists a collection with everything below it.
    pub fn insert_collection_tree(&self, database: &str, collection: &MetaCollection) -> Result<()> {
        self.insert_collection(database, collection)?;
        for doc_part in collection.doc_parts() {
            self.insert_doc_part(database, &collection.name, doc_part)?;
            for scalar in &doc_part.scalars {
                self.insert_scalar(database, &collection.name, &doc_part.table_ref, scalar)?;
            }
            for field in &doc_part.fields {
                self.insert_field(database, &collection.name, &doc_part.table_ref, field)?;
            }
        }
        for index in collection.indexes() {
            self.insert_index(database, &collection.name, index)?;
        }
        for doc_part in collection.doc_parts() {
            for index in &doc_part.indexes {
                self.insert_doc_part_index(database, &collection.name, &doc_part.table_ref, index)?;
            }
        }
        Ok(())
    }

    // ------------- Deletes -------------
    pub fn delete_database(&self, database: &str) -> Result<()> {
        self.delete(meta_table::DATABASE, &["name"], params![database])?;
        Ok(())
    }
    pub fn delete_collection(&self, database: &str, collection: &str) -> Result<()> {
        self.delete(meta_table::COLLECTION, &["database_name", "name"], params![database, collection])?;
        Ok(())
    }
    pub fn delete_index(&self, database: &str, collection: &str, index: &str) -> Result<()> {
        self.delete(
            meta_table::INDEX,
            &["database_name", "collection_name", "name"],
            params![database, collection, index],
        )?;
        Ok(())
    }
    pub fn delete_doc_part_index(&self, database: &str, identifier: &str) -> Result<()> {
        self.delete(meta_table::DOC_PART_INDEX, &["database_name", "identifier"], params![database, identifier])?;
        Ok(())
    }

    // ------------- Row identifiers -------------
    pub fn last_rid(&self, database: &str, collection: &str, table_ref: &TableRef) -> Result<u64> {
        let sql = format!(
            "SELECT last_rid FROM {} WHERE database_name = {} AND collection_name = {} AND table_ref = {}",
            self.table(meta_table::DOC_PART),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2),
            self.dialect.placeholder(3)
        );
        let found = self.query(&sql, params![database, collection, table_ref.to_json()], |row| row.get::<_, i64>(0))?;
        let last_rid = found.first().copied().ok_or_else(|| {
            DocShredError::Invariant(format!("{}.{} has no stored document part {}", database, collection, table_ref))
        })?;
        id_from_sql(last_rid)
    }
    /// Moves the counter from `expected` to `last_rid`. A counter that moved
    /// in the meantime asks for a rollback.
    pub fn update_last_rid(
        &self,
        database: &str,
        collection: &str,
        table_ref: &TableRef,
        expected: u64,
        last_rid: u64,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET last_rid = {} WHERE database_name = {} AND collection_name = {} AND table_ref = {} AND last_rid = {}",
            self.table(meta_table::DOC_PART),
            self.dialect.placeholder(1),
            self.dialect.placeholder(2),
            self.dialect.placeholder(3),
            self.dialect.placeholder(4),
            self.dialect.placeholder(5)
        );
        let updated = self.execute(
            Context::MetaUpdate,
            &sql,
            params![sql_id(last_rid)?, database, collection, table_ref.to_json(), sql_id(expected)?],
        )?;
        if updated != 1 {
            return Err(DocShredError::Rollback {
                context: Context::MetaUpdate,
                code: None,
                message: format!("the rid counter of {} moved concurrently", table_ref),
            });
        }
        Ok(())
    }

    // ------------- Restore -------------
    /// Reads the whole metadata model.
    pub fn load_snapshot(&self) -> Result<MetaSnapshot> {
        let mut databases: BTreeMap<String, MetaDatabase> = BTreeMap::new();
        let sql = format!("SELECT name, identifier FROM {}", self.table(meta_table::DATABASE));
        for (name, identifier) in self.query(&sql, [], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))? {
            databases.insert(name.clone(), MetaDatabase::new(name, identifier));
        }

        let mut collections: BTreeMap<(String, String), MetaCollection> = BTreeMap::new();
        let sql = format!("SELECT database_name, name, identifier FROM {}", self.table(meta_table::COLLECTION));
        for (database, name, identifier) in self.query(&sql, [], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })? {
            collections.insert((database, name.clone()), MetaCollection::new(name, identifier));
        }

        type PartKey = (String, String, TableRef);
        let mut doc_parts: BTreeMap<PartKey, MetaDocPart> = BTreeMap::new();
        let sql = format!(
            "SELECT database_name, collection_name, table_ref, identifier, last_rid FROM {}",
            self.table(meta_table::DOC_PART)
        );
        for (database, collection, table_ref, identifier, last_rid) in self.query(&sql, [], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })? {
            let table_ref = TableRef::from_json(&table_ref)?;
            let mut doc_part = MetaDocPart::new(table_ref.clone(), identifier);
            doc_part.last_rid = id_from_sql(last_rid)?;
            doc_parts.insert((database, collection, table_ref), doc_part);
        }

        let sql = format!(
            "SELECT database_name, collection_name, table_ref, field_type, identifier FROM {}",
            self.table(meta_table::SCALAR)
        );
        for (database, collection, table_ref, type_name, identifier) in self.query(&sql, [], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })? {
            let key = (database, collection, TableRef::from_json(&table_ref)?);
            let doc_part = doc_parts.get_mut(&key).ok_or_else(|| orphan("scalar", &identifier))?;
            doc_part.scalars.push(MetaScalar::new(field_type(&type_name)?, identifier));
        }

        let sql = format!(
            "SELECT database_name, collection_name, table_ref, name, field_type, identifier FROM {}",
            self.table(meta_table::FIELD)
        );
        for (database, collection, table_ref, name, type_name, identifier) in self.query(&sql, [], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
            ))
        })? {
            let key = (database, collection, TableRef::from_json(&table_ref)?);
            let doc_part = doc_parts.get_mut(&key).ok_or_else(|| orphan("field", &identifier))?;
            doc_part.fields.push(MetaField::new(name, field_type(&type_name)?, identifier));
        }

        let mut index_columns: BTreeMap<(String, String), Vec<(i64, MetaDocPartIndexColumn)>> = BTreeMap::new();
        let sql = format!(
            "SELECT database_name, index_identifier, ordinal, identifier, direction FROM {}",
            self.table(meta_table::DOC_PART_INDEX_COLUMN)
        );
        for (database, index, ordinal, identifier, direction) in self.query(&sql, [], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })? {
            index_columns
                .entry((database, index))
                .or_default()
                .push((ordinal, MetaDocPartIndexColumn::new(identifier, ordering(&direction)?)));
        }
        let sql = format!(
            "SELECT database_name, collection_name, table_ref, identifier, is_unique FROM {}",
            self.table(meta_table::DOC_PART_INDEX)
        );
        for (database, collection, table_ref, identifier, unique) in self.query(&sql, [], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
            ))
        })? {
            let mut columns = index_columns
                .remove(&(database.clone(), identifier.clone()))
                .unwrap_or_default();
            columns.sort_by_key(|(ordinal, _)| *ordinal);
            let columns = columns.into_iter().map(|(_, column)| column).collect();
            let key = (database, collection, TableRef::from_json(&table_ref)?);
            let doc_part = doc_parts.get_mut(&key).ok_or_else(|| orphan("index", &identifier))?;
            doc_part.indexes.push(MetaDocPartIndex::new(identifier, unique, columns));
        }

        let mut index_fields: BTreeMap<(String, String, String), Vec<(i64, MetaIndexField)>> = BTreeMap::new();
        let sql = format!(
            "SELECT database_name, collection_name, index_name, ordinal, table_ref, name, direction FROM {}",
            self.table(meta_table::INDEX_FIELD)
        );
        for (database, collection, index, ordinal, table_ref, name, direction) in self.query(&sql, [], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })? {
            let field = MetaIndexField::new(TableRef::from_json(&table_ref)?, name, ordering(&direction)?);
            index_fields.entry((database, collection, index)).or_default().push((ordinal, field));
        }
        let sql = format!(
            "SELECT database_name, collection_name, name, is_unique FROM {}",
            self.table(meta_table::INDEX)
        );
        for (database, collection, name, unique) in self.query(&sql, [], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
            ))
        })? {
            let mut fields = index_fields
                .remove(&(database.clone(), collection.clone(), name.clone()))
                .unwrap_or_default();
            fields.sort_by_key(|(ordinal, _)| *ordinal);
            let fields = fields.into_iter().map(|(_, field)| field).collect();
            let target = collections
                .get_mut(&(database, collection))
                .ok_or_else(|| orphan("index", &name))?;
            target.indexes.insert(name.clone(), Arc::new(MetaIndex::new(name, unique, fields)));
        }

        // assemble bottom-up
        for ((database, collection, table_ref), doc_part) in doc_parts {
            let target = collections
                .get_mut(&(database, collection))
                .ok_or_else(|| orphan("document part", &doc_part.identifier))?;
            target.doc_parts.insert(table_ref, Arc::new(doc_part));
        }
        for ((database, name), collection) in collections {
            let target = databases.get_mut(&database).ok_or_else(|| orphan("collection", &name))?;
            target.collections.insert(name, Arc::new(collection));
        }
        let mut snapshot = MetaSnapshot::new();
        for (name, database) in databases {
            snapshot.databases.insert(name, Arc::new(database));
        }
        debug!(databases = snapshot.databases.len(), "metadata restored");
        Ok(snapshot)
    }
}

fn orphan(what: &str, identifier: &str) -> DocShredError {
    DocShredError::Invariant(format!("stored {} {} has no owner", what, identifier))
}
