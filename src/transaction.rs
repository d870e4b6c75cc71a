//! Write and read transactions over one pooled connection.
//!
//! A [`WriteTransaction`] works on a private metadata overlay. Every
//! operation records its metadata changes in the overlay and flushes them
//! before touching rows: metadata rows first, then the DDL, all inside the
//! same SQL transaction. On commit the stored metadata version is bumped when
//! the schema changed and the overlay is merged into the committed
//! repository. A transaction dropped without commit rolls back.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// used for persistence
use rusqlite::types::{Null, ToSql};
use rusqlite::{Connection, params_from_iter};
// used for did sets
use roaring::RoaringTreemap;

use tracing::{debug, info, instrument, trace, warn};

use crate::backend::{Backend, PooledConnection};
use crate::collection_data::{D2RTranslator, DocPartData, DocPartRow};
use crate::datatype::{FieldType, value_from_sql};
use crate::dialect::{ConnectionClass, SqlDialect};
use crate::document::{Document, Value};
use crate::error::{DocShredError, Result};
use crate::handler::{Context, ErrorHandler};
use crate::identifier::{DID, PID, RID, SEQ};
use crate::meta::{MetaCollection, MetaColumn, MetaDocPart, MetaIndexField, MetaSnapshot};
use crate::mutable::{MetaChange, MutableMetaSnapshot};
use crate::persist::{MetaPersistor, id_from_sql, sql_id};
use crate::plan::{change_statements, insert_columns, rows_per_batch};
use crate::r2d::{R2DTranslator, StoredDocPart, StoredRow};
use crate::reference::TableRef;
use crate::rid::{RidBlock, RidGenerator};

fn unknown_collection(database: &str, collection: &str) -> DocShredError {
    DocShredError::UnknownCollection {
        database: database.to_string(),
        collection: collection.to_string(),
    }
}

fn execute(handler: &ErrorHandler, connection: &Connection, context: Context, sql: &str) -> Result<()> {
    debug!(%context, sql, "executing");
    handler.check(context, connection.execute_batch(sql))
}

// the number of identifiers bound per statement
fn id_batch(dialect: &dyn SqlDialect, wanted: usize) -> usize {
    wanted.min(dialect.max_bind_parameters()).max(1)
}

// ------------- Row identifiers -------------
/// Consumes rids from the stored counters. What it consumed is remembered so
/// the overlay can follow.
struct StoredRidGenerator<'c> {
    persistor: MetaPersistor<'c>,
    consumed: RefCell<Vec<(TableRef, u64)>>,
}

impl<'c> StoredRidGenerator<'c> {
    fn new(persistor: MetaPersistor<'c>) -> Self {
        Self {
            persistor,
            consumed: RefCell::new(Vec::new()),
        }
    }
    fn into_consumed(self) -> Vec<(TableRef, u64)> {
        self.consumed.into_inner()
    }
}

impl RidGenerator for StoredRidGenerator<'_> {
    fn consume_rids(&self, database: &str, collection: &str, table_ref: &TableRef, count: u64) -> Result<RidBlock> {
        let last_rid = self.persistor.last_rid(database, collection, table_ref)?;
        let next = last_rid
            .checked_add(count)
            .ok_or_else(|| DocShredError::Invariant(format!("rid counter of {} would overflow", table_ref)))?;
        self.persistor.update_last_rid(database, collection, table_ref, last_rid, next)?;
        self.consumed.borrow_mut().push((table_ref.clone(), next));
        trace!(%table_ref, first = last_rid, count, "rids consumed");
        Ok(RidBlock::new(last_rid, count))
    }
}

// ------------- Write transaction -------------
pub struct WriteTransaction<'b> {
    backend: &'b Backend,
    connection: PooledConnection<'b>,
    class: ConnectionClass,
    overlay: MutableMetaSnapshot,
    flushed: usize,
    finished: bool,
}

impl<'b> WriteTransaction<'b> {
    pub(crate) fn begin(backend: &'b Backend, class: ConnectionClass) -> Result<Self> {
        let connection = backend.acquire(class)?;
        execute(
            backend.handler(),
            connection.get()?,
            Context::Connect,
            backend.dialect().begin_statement(class),
        )?;
        let mut transaction = Self {
            backend,
            connection,
            class,
            overlay: MutableMetaSnapshot::new(&MetaSnapshot::new()),
            flushed: 0,
            finished: false,
        };
        let snapshot = backend.snapshot_for(transaction.connection.get()?)?;
        transaction.overlay = MutableMetaSnapshot::new(&snapshot);
        Ok(transaction)
    }
    pub fn class(&self) -> ConnectionClass {
        self.class
    }
    /// The metadata as this transaction sees it, its own changes included.
    pub fn snapshot(&self) -> &MetaSnapshot {
        self.overlay.snapshot()
    }

    /// Writes the metadata changes recorded since the last flush: for each
    /// change its metadata rows, then its DDL.
    pub fn flush(&mut self) -> Result<()> {
        let pending = self.overlay.changes().len() - self.flushed;
        if pending == 0 {
            return Ok(());
        }
        let dialect = self.backend.dialect();
        let handler = self.backend.handler();
        let import_mode = self.backend.is_data_import_mode();
        let connection = self.connection.get()?;
        let persistor = MetaPersistor::new(connection, dialect);
        let snapshot = self.overlay.snapshot();
        for change in &self.overlay.changes()[self.flushed..] {
            persist_change(&persistor, snapshot, change)?;
            for statement in change_statements(dialect, snapshot, change, import_mode)? {
                execute(handler, connection, statement.context, &statement.sql)?;
            }
        }
        debug!(changes = pending, "metadata flushed");
        self.flushed += pending;
        Ok(())
    }

    /// Returns `count` fresh rids of a document part and advances its stored counter.
    pub fn consume_rids(&mut self, database: &str, collection: &str, table_ref: &TableRef, count: u64) -> Result<RidBlock> {
        let generator = StoredRidGenerator::new(MetaPersistor::new(self.connection.get()?, self.backend.dialect()));
        let block = generator.consume_rids(database, collection, table_ref, count)?;
        let consumed = generator.into_consumed();
        self.follow_rids(database, collection, consumed)?;
        Ok(block)
    }
    fn follow_rids(&mut self, database: &str, collection: &str, consumed: Vec<(TableRef, u64)>) -> Result<()> {
        let mut db = self
            .overlay
            .database_mut(database)
            .ok_or_else(|| DocShredError::UnknownDatabase(database.to_string()))?;
        let mut target = db
            .collection_mut(collection)
            .ok_or_else(|| unknown_collection(database, collection))?;
        for (table_ref, last_rid) in consumed {
            target.set_last_rid(&table_ref, last_rid)?;
        }
        Ok(())
    }
    // other stores may have consumed rids without bumping the metadata version
    fn refresh_rids(&mut self, database: &str, collection: &str) -> Result<()> {
        let table_refs: Vec<TableRef> = match self.overlay.snapshot().collection(database, collection) {
            Some(source) => source.doc_parts().map(|doc_part| doc_part.table_ref.clone()).collect(),
            None => return Ok(()),
        };
        let persistor = MetaPersistor::new(self.connection.get()?, self.backend.dialect());
        let mut stored = Vec::with_capacity(table_refs.len());
        for table_ref in table_refs {
            let last_rid = persistor.last_rid(database, collection, &table_ref)?;
            stored.push((table_ref, last_rid));
        }
        self.follow_rids(database, collection, stored)
    }

    // ------------- Documents -------------
    /// Translates documents into rows, creating the metadata they need, and
    /// writes the rows. Returns the number of rows written.
    #[instrument(skip(self, documents))]
    pub fn insert<'d>(
        &mut self,
        database: &str,
        collection: &str,
        documents: impl IntoIterator<Item = (u64, &'d Document)>,
    ) -> Result<usize> {
        let backend = self.backend;
        let factory = backend.factory();
        let mut data = {
            let mut db = self.overlay.get_or_create_database(database, factory)?;
            let mut target = db.get_or_create_collection(collection, factory)?;
            D2RTranslator::new(factory).translate(&mut target, documents)?
        };
        self.flush()?;
        let generator = StoredRidGenerator::new(MetaPersistor::new(self.connection.get()?, backend.dialect()));
        data.assign_rids(&generator)?;
        let consumed = generator.into_consumed();
        self.follow_rids(database, collection, consumed)?;

        let schema = self
            .overlay
            .snapshot()
            .database(database)
            .map(|db| db.identifier().to_string())
            .ok_or_else(|| DocShredError::UnknownDatabase(database.to_string()))?;
        for part in data.doc_parts() {
            self.write_rows(&schema, part)?;
        }
        info!(rows = data.row_count(), parts = data.doc_parts().len(), "rows written");
        Ok(data.row_count())
    }
    fn write_rows(&self, schema: &str, part: &DocPartData) -> Result<()> {
        let dialect = self.backend.dialect();
        let handler = self.backend.handler();
        let config = self.backend.config();
        let connection = self.connection.get()?;
        let columns = insert_columns(part);
        let width = columns.len();
        let single = dialect.insert_rows(schema, part.identifier(), &columns, 1);
        for batch in part.rows().chunks(rows_per_batch(dialect, config, width)) {
            let ids = batch
                .iter()
                .map(|row| internal_values(row, part.is_root()))
                .collect::<Result<Vec<_>>>()?;
            let mut params: Vec<&dyn ToSql> = Vec::with_capacity(batch.len() * width);
            for (row, ids) in batch.iter().zip(&ids) {
                params.extend(ids.iter().map(|id| id as &dyn ToSql));
                for position in 0..part.columns().len() {
                    match row.values().get(position) {
                        Some(value) => params.push(value),
                        None => params.push(&Null),
                    }
                }
            }
            if batch.len() >= config.bulk_insert_threshold {
                let sql = dialect.insert_rows(schema, part.identifier(), &columns, batch.len());
                let mut statement = handler.check(Context::Insert, connection.prepare_cached(&sql))?;
                handler.check(Context::Insert, statement.execute(&params[..]))?;
            } else {
                let mut statement = handler.check(Context::Insert, connection.prepare_cached(&single))?;
                for row in params.chunks(width) {
                    handler.check(Context::Insert, statement.execute(row))?;
                }
            }
            trace!(table = part.identifier(), rows = batch.len(), "batch written");
        }
        Ok(())
    }
    /// Deletes documents from every document part of a collection and returns
    /// how many documents were removed. Rids are not given back.
    #[instrument(skip(self, dids), fields(dids = dids.len()))]
    pub fn delete_documents(&mut self, database: &str, collection: &str, dids: &RoaringTreemap) -> Result<u64> {
        self.flush()?;
        let snapshot = self.overlay.snapshot();
        let (Some(db), Some(meta)) = (snapshot.database(database), snapshot.collection(database, collection)) else {
            return Ok(0);
        };
        let dialect = self.backend.dialect();
        let handler = self.backend.handler();
        let connection = self.connection.get()?;
        let dids = dids.iter().map(sql_id).collect::<Result<Vec<i64>>>()?;
        let mut deleted = 0u64;
        // children first
        for doc_part in meta.doc_parts().rev() {
            for chunk in dids.chunks(id_batch(dialect, self.backend.config().read_batch_size)) {
                let sql = dialect.delete_rows(db.identifier(), doc_part.identifier(), chunk.len());
                let mut statement = handler.check(Context::Delete, connection.prepare_cached(&sql))?;
                let removed = handler.check(Context::Delete, statement.execute(params_from_iter(chunk.iter())))?;
                if doc_part.table_ref().is_root() {
                    deleted += removed as u64;
                }
            }
        }
        info!(deleted, "documents deleted");
        Ok(deleted)
    }

    // ------------- Metadata -------------
    /// Creates a logical index and the physical indexes backing it.
    #[instrument(skip(self, fields))]
    pub fn create_index(
        &mut self,
        database: &str,
        collection: &str,
        name: &str,
        unique: bool,
        fields: Vec<MetaIndexField>,
    ) -> Result<()> {
        let factory = self.backend.factory();
        {
            let mut db = self.overlay.get_or_create_database(database, factory)?;
            let mut target = db.get_or_create_collection(collection, factory)?;
            target.create_index(name, unique, fields, factory)?;
        }
        self.flush()
    }
    #[instrument(skip(self))]
    pub fn drop_index(&mut self, database: &str, collection: &str, name: &str) -> Result<()> {
        {
            let mut db = self
                .overlay
                .database_mut(database)
                .ok_or_else(|| DocShredError::UnknownDatabase(database.to_string()))?;
            let mut target = db
                .collection_mut(collection)
                .ok_or_else(|| unknown_collection(database, collection))?;
            target.drop_index(name)?;
        }
        self.flush()
    }
    #[instrument(skip(self))]
    pub fn drop_collection(&mut self, database: &str, collection: &str) -> Result<()> {
        self.overlay
            .database_mut(database)
            .ok_or_else(|| DocShredError::UnknownDatabase(database.to_string()))?
            .remove_collection(collection)?;
        self.flush()
    }
    #[instrument(skip(self))]
    pub fn drop_database(&mut self, database: &str) -> Result<()> {
        self.overlay.remove_database(database)?;
        self.flush()
    }
    /// Moves a collection, possibly to another database. Its tables are
    /// renamed to identifiers generated for the target.
    #[instrument(skip(self))]
    pub fn rename_collection(
        &mut self,
        from_database: &str,
        from_collection: &str,
        to_database: &str,
        to_collection: &str,
    ) -> Result<()> {
        self.flush()?;
        self.refresh_rids(from_database, from_collection)?;
        let factory = self.backend.factory();
        self.overlay
            .rename_collection(from_database, from_collection, to_database, to_collection, factory)?;
        self.flush()
    }
    /// Creates the internal indexes of one table and refreshes its statistics.
    pub(crate) fn build_internal_indexes(&mut self, schema: &str, table: &str, is_root: bool) -> Result<()> {
        let dialect = self.backend.dialect();
        let handler = self.backend.handler();
        let connection = self.connection.get()?;
        for sql in dialect.create_internal_indexes(schema, table, is_root) {
            execute(handler, connection, Context::CreateIndex, &sql)?;
        }
        // statistics are best effort
        if let Err(e) = connection.execute_batch(&dialect.analyze(schema, table)) {
            warn!(table, error = %e, "analyze failed");
        }
        Ok(())
    }

    // ------------- Completion -------------
    pub fn commit(mut self) -> Result<()> {
        self.flush()?;
        let dialect = self.backend.dialect();
        let handler = self.backend.handler();
        let connection = self.connection.get()?;
        let version = if self.overlay.has_structural_changes() {
            MetaPersistor::new(connection, dialect).bump_version()?
        } else {
            0
        };
        execute(handler, connection, Context::Commit, dialect.commit_statement())?;
        self.finished = true;
        // the data is durable from here on; a failed merge only forces a reload
        if let Err(e) = self.backend.repository().merge(&self.overlay, version) {
            warn!(error = %e, "committed metadata not merged");
        }
        Ok(())
    }
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        let connection = self.connection.get()?;
        execute(
            self.backend.handler(),
            connection,
            Context::Rollback,
            self.backend.dialect().rollback_statement(),
        )
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let rolled_back = self
            .connection
            .get()
            .map(|connection| connection.execute_batch(self.backend.dialect().rollback_statement()).is_ok())
            .unwrap_or(false);
        if !rolled_back {
            self.connection.discard();
        }
    }
}

fn internal_values(row: &DocPartRow, is_root: bool) -> Result<Vec<Option<i64>>> {
    let did = Some(sql_id(row.did())?);
    if is_root {
        return Ok(vec![did]);
    }
    let (Some(rid), Some(pid)) = (row.rid(), row.pid()) else {
        return Err(DocShredError::Invariant(format!(
            "a row of document {} is written before its rids were assigned",
            row.did()
        )));
    };
    Ok(vec![did, Some(sql_id(rid)?), Some(sql_id(pid)?), row.seq().map(i64::from)])
}

fn persist_change(persistor: &MetaPersistor<'_>, snapshot: &MetaSnapshot, change: &MetaChange) -> Result<()> {
    match change {
        MetaChange::AddDatabase { database } => {
            if let Some(db) = snapshot.database(database) {
                persistor.insert_database(db)?;
            }
        }
        MetaChange::AddCollection { database, collection } => {
            if let Some(meta) = snapshot.collection(database, collection) {
                persistor.insert_collection(database, meta)?;
            }
        }
        MetaChange::AddDocPart { database, collection, table_ref } => {
            if let Some(doc_part) = snapshot.collection(database, collection).and_then(|c| c.doc_part(table_ref)) {
                persistor.insert_doc_part(database, collection, doc_part)?;
            }
        }
        MetaChange::AddField { database, collection, table_ref, name, field_type } => {
            let field = snapshot
                .collection(database, collection)
                .and_then(|c| c.doc_part(table_ref))
                .and_then(|doc_part| doc_part.field(name, *field_type));
            if let Some(field) = field {
                persistor.insert_field(database, collection, table_ref, field)?;
            }
        }
        MetaChange::AddScalar { database, collection, table_ref, field_type } => {
            let scalar = snapshot
                .collection(database, collection)
                .and_then(|c| c.doc_part(table_ref))
                .and_then(|doc_part| doc_part.scalar(*field_type));
            if let Some(scalar) = scalar {
                persistor.insert_scalar(database, collection, table_ref, scalar)?;
            }
        }
        MetaChange::AddIndex { database, collection, name } => {
            if let Some(index) = snapshot.collection(database, collection).and_then(|c| c.index(name)) {
                persistor.insert_index(database, collection, index)?;
            }
        }
        MetaChange::AddDocPartIndex { database, collection, table_ref, identifier } => {
            let index = snapshot
                .collection(database, collection)
                .and_then(|c| c.doc_part(table_ref))
                .and_then(|doc_part| doc_part.index(identifier));
            if let Some(index) = index {
                persistor.insert_doc_part_index(database, collection, table_ref, index)?;
            }
        }
        MetaChange::DropIndex { database, collection, index } => {
            persistor.delete_index(database, collection, index.name())?;
        }
        MetaChange::DropDocPartIndex { database, index, .. } => {
            persistor.delete_doc_part_index(database, index.identifier())?;
        }
        MetaChange::DropCollection { database, collection } => {
            persistor.delete_collection(database, collection.name())?;
        }
        MetaChange::DropDatabase { database } => {
            persistor.delete_database(database.name())?;
        }
        MetaChange::RenameCollection { from_database, from_collection, to_database, to_collection } => {
            persistor.delete_collection(from_database, from_collection.name())?;
            let target = snapshot
                .collection(to_database, to_collection)
                .ok_or_else(|| unknown_collection(to_database, to_collection))?;
            persistor.insert_collection_tree(to_database, target)?;
        }
        // counters are written when rids are consumed
        MetaChange::LastRid { .. } => {}
    }
    Ok(())
}

// ------------- Read transaction -------------
/// A read-only view of the store fixed at the metadata it started with.
pub struct ReadTransaction<'b> {
    backend: &'b Backend,
    connection: PooledConnection<'b>,
    snapshot: Arc<MetaSnapshot>,
    finished: bool,
}

impl<'b> ReadTransaction<'b> {
    pub(crate) fn begin(backend: &'b Backend) -> Result<Self> {
        let connection = backend.acquire(ConnectionClass::ReadOnly)?;
        execute(
            backend.handler(),
            connection.get()?,
            Context::Connect,
            backend.dialect().begin_statement(ConnectionClass::ReadOnly),
        )?;
        let mut transaction = Self {
            backend,
            connection,
            snapshot: Arc::new(MetaSnapshot::new()),
            finished: false,
        };
        transaction.snapshot = backend.snapshot_for(transaction.connection.get()?)?;
        Ok(transaction)
    }
    pub fn snapshot(&self) -> &Arc<MetaSnapshot> {
        &self.snapshot
    }
    fn located(&self, database: &str, collection: &str) -> Option<(&str, &MetaCollection)> {
        let schema = self.snapshot.database(database)?.identifier();
        Some((schema, self.snapshot.collection(database, collection)?))
    }
    fn batch(&self) -> usize {
        id_batch(self.backend.dialect(), self.backend.config().read_batch_size)
    }

    /// Reassembles the documents with the given dids. Dids without a stored
    /// document are left out of the result.
    pub fn read_documents(
        &self,
        database: &str,
        collection: &str,
        dids: &RoaringTreemap,
    ) -> Result<BTreeMap<u64, Document>> {
        let Some((schema, meta)) = self.located(database, collection) else {
            return Ok(BTreeMap::new());
        };
        let dids = dids.iter().map(sql_id).collect::<Result<Vec<i64>>>()?;
        let mut documents = BTreeMap::new();
        for chunk in dids.chunks(self.batch()) {
            let parts = meta
                .doc_parts()
                .map(|doc_part| self.fetch_part(schema, doc_part, chunk))
                .collect::<Result<Vec<_>>>()?;
            documents.append(&mut R2DTranslator::new(&parts).translate()?);
        }
        debug!(documents = documents.len(), "documents read");
        Ok(documents)
    }
    fn fetch_part(&self, schema: &str, doc_part: &MetaDocPart, dids: &[i64]) -> Result<StoredDocPart> {
        let dialect = self.backend.dialect();
        let handler = self.backend.handler();
        let connection = self.connection.get()?;
        let is_root = doc_part.table_ref().is_root();
        let internal: &[&str] = if is_root { &[DID] } else { &[DID, RID, PID, SEQ] };
        let meta_columns: Vec<MetaColumn<'_>> = doc_part.columns().collect();
        let columns: Vec<&str> = internal
            .iter()
            .copied()
            .chain(meta_columns.iter().map(|column| column.identifier()))
            .collect();
        let sql = dialect.select_rows(schema, doc_part.identifier(), &columns, dids.len());
        let mut statement = handler.check(Context::Fetch, connection.prepare_cached(&sql))?;
        let mut rows = handler.check(Context::Fetch, statement.query(params_from_iter(dids.iter())))?;
        let mut part = StoredDocPart::new(doc_part.table_ref().clone());
        while let Some(row) = handler.check(Context::Fetch, rows.next())? {
            let did = id_from_sql(handler.check(Context::Fetch, row.get::<_, i64>(0))?)?;
            let (rid, pid, seq) = if is_root {
                (did, None, None)
            } else {
                let rid = id_from_sql(handler.check(Context::Fetch, row.get::<_, i64>(1))?)?;
                let pid = id_from_sql(handler.check(Context::Fetch, row.get::<_, i64>(2))?)?;
                let seq = handler
                    .check(Context::Fetch, row.get::<_, Option<i64>>(3))?
                    .map(|seq| {
                        u32::try_from(seq).map_err(|_| DocShredError::Invariant(format!("stored seq {} is out of range", seq)))
                    })
                    .transpose()?;
                (rid, Some(pid), seq)
            };
            let mut stored = StoredRow {
                did,
                rid,
                pid,
                seq,
                fields: Vec::new(),
                scalars: Vec::new(),
            };
            for (offset, column) in meta_columns.iter().enumerate() {
                let raw = handler.check(Context::Fetch, row.get_ref(internal.len() + offset))?;
                let Some(value) = value_from_sql(column.field_type(), raw)? else { continue };
                match column {
                    MetaColumn::Scalar(scalar) => stored.scalars.push((scalar.field_type(), value)),
                    MetaColumn::Field(field) => stored.fields.push((field.name().to_string(), field.field_type(), value)),
                }
            }
            part.rows.push(stored);
        }
        trace!(table = doc_part.identifier(), rows = part.rows.len(), "rows fetched");
        Ok(part)
    }
    fn collect_dids(&self, sql: &str, params: &[&dyn ToSql], into: &mut RoaringTreemap) -> Result<()> {
        let handler = self.backend.handler();
        let connection = self.connection.get()?;
        let mut statement = handler.check(Context::Fetch, connection.prepare_cached(sql))?;
        let mut rows = handler.check(Context::Fetch, statement.query(params))?;
        while let Some(row) = handler.check(Context::Fetch, rows.next())? {
            into.insert(id_from_sql(handler.check(Context::Fetch, row.get::<_, i64>(0))?)?);
        }
        Ok(())
    }

    // ------------- Lookups -------------
    /// Dids of documents whose part `table_ref` has a field `name` equal to `value`.
    pub fn find_dids_by_field_eq(
        &self,
        database: &str,
        collection: &str,
        table_ref: &TableRef,
        name: &str,
        value: &Value,
    ) -> Result<RoaringTreemap> {
        self.find_dids_by_field_in(database, collection, table_ref, name, std::slice::from_ref(value))
    }
    /// Dids of documents whose part `table_ref` has a field `name` equal to any of `values`.
    pub fn find_dids_by_field_in(
        &self,
        database: &str,
        collection: &str,
        table_ref: &TableRef,
        name: &str,
        values: &[Value],
    ) -> Result<RoaringTreemap> {
        let mut dids = RoaringTreemap::new();
        let Some((schema, meta)) = self.located(database, collection) else {
            return Ok(dids);
        };
        let Some(doc_part) = meta.doc_part(table_ref) else {
            return Ok(dids);
        };
        // each type has its own column
        let mut by_type: HashMap<FieldType, Vec<&Value>> = HashMap::new();
        for value in values {
            by_type.entry(FieldType::of(value)).or_default().push(value);
        }
        let dialect = self.backend.dialect();
        for (field_type, values) in by_type {
            let Some(field) = doc_part.field(name, field_type) else { continue };
            for chunk in values.chunks(self.batch()) {
                let sql = dialect.select_dids_by_column(schema, doc_part.identifier(), field.identifier(), chunk.len());
                let params: Vec<&dyn ToSql> = chunk.iter().map(|value| *value as &dyn ToSql).collect();
                self.collect_dids(&sql, &params, &mut dids)?;
            }
        }
        Ok(dids)
    }
    pub fn list_dids(&self, database: &str, collection: &str) -> Result<RoaringTreemap> {
        let mut dids = RoaringTreemap::new();
        let Some((schema, meta)) = self.located(database, collection) else {
            return Ok(dids);
        };
        if let Some(root) = meta.doc_part(&TableRef::root()) {
            let sql = self.backend.dialect().select_all_dids(schema, root.identifier());
            self.collect_dids(&sql, &[], &mut dids)?;
        }
        Ok(dids)
    }
    pub fn count_documents(&self, database: &str, collection: &str) -> Result<u64> {
        let Some((schema, meta)) = self.located(database, collection) else {
            return Ok(0);
        };
        let Some(root) = meta.doc_part(&TableRef::root()) else {
            return Ok(0);
        };
        let sql = self.backend.dialect().count_rows(schema, root.identifier());
        self.single_number(&sql)
    }
    fn single_number(&self, sql: &str) -> Result<u64> {
        let handler = self.backend.handler();
        let connection = self.connection.get()?;
        let mut statement = handler.check(Context::Fetch, connection.prepare_cached(sql))?;
        let number = handler.check(Context::Fetch, statement.query_row([], |row| row.get::<_, i64>(0)))?;
        id_from_sql(number)
    }
    /// Bytes used by the tables and indexes of a collection, when the backend can tell.
    pub fn collection_size(&self, database: &str, collection: &str) -> Result<Option<u64>> {
        let Some((schema, meta)) = self.located(database, collection) else {
            return Ok(Some(0));
        };
        let mut total = 0;
        for doc_part in meta.doc_parts() {
            let Some(sql) = self.backend.dialect().table_size(schema, doc_part.identifier()) else {
                return Ok(None);
            };
            total += self.single_number(&sql)?;
        }
        Ok(Some(total))
    }
    pub fn database_size(&self, database: &str) -> Result<Option<u64>> {
        let Some(db) = self.snapshot.database(database) else {
            return Ok(Some(0));
        };
        let mut total = 0;
        for collection in db.collections() {
            match self.collection_size(database, collection.name())? {
                Some(size) => total += size,
                None => return Ok(None),
            }
        }
        Ok(Some(total))
    }

    /// Ends the transaction.
    pub fn close(mut self) -> Result<()> {
        self.finished = true;
        let connection = self.connection.get()?;
        execute(
            self.backend.handler(),
            connection,
            Context::Close,
            self.backend.dialect().commit_statement(),
        )
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let rolled_back = self
            .connection
            .get()
            .map(|connection| connection.execute_batch(self.backend.dialect().rollback_statement()).is_ok())
            .unwrap_or(false);
        if !rolled_back {
            self.connection.discard();
        }
    }
}
