//! Rows accumulated while translating documents.
//!
//! [`D2RTranslator`] walks documents with a [`RowAccumulator`], which resolves
//! or creates document parts and columns in the transaction's metadata overlay
//! and appends rows to one [`DocPartData`] per document part. Translation
//! itself hands out no rids: rows refer to their parents by position, and
//! [`CollectionData::assign_rids`] later consumes one block of rids per
//! document part and fills in `rid` and `pid`.

use std::collections::HashMap;

use tracing::trace;

use crate::d2r::{D2RCallback, D2RVisitor, VisitContext};
use crate::datatype::FieldType;
use crate::document::{Document, Value};
use crate::error::{DocShredError, Result};
use crate::identifier::IdentifierFactory;
use crate::mutable::MutableMetaCollection;
use crate::reference::{Key, RefHasher, TableRef};
use crate::rid::RidGenerator;

// ------------- Columns -------------
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnKey {
    Field(String),
    Scalar,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocPartColumn {
    key: ColumnKey,
    field_type: FieldType,
    identifier: String,
}

impl DocPartColumn {
    pub fn key(&self) -> &ColumnKey {
        &self.key
    }
    pub fn field_type(&self) -> FieldType {
        self.field_type
    }
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

// ------------- Rows -------------
/// Position of a row inside a [`CollectionData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowHandle {
    part: usize,
    row: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocPartRow {
    did: u64,
    rid: Option<u64>,
    pid: Option<u64>,
    seq: Option<u32>,
    parent: Option<RowHandle>,
    values: Vec<Option<Value>>,
}

impl DocPartRow {
    pub fn did(&self) -> u64 {
        self.did
    }
    /// The row identifier; root rows use the document identifier.
    pub fn rid(&self) -> Option<u64> {
        self.rid
    }
    pub fn pid(&self) -> Option<u64> {
        self.pid
    }
    pub fn seq(&self) -> Option<u32> {
        self.seq
    }
    /// Values in column order. Trailing columns created after the row was
    /// appended are absent from the slice.
    pub fn values(&self) -> &[Option<Value>] {
        &self.values
    }
    pub fn value(&self, position: usize) -> Option<&Value> {
        self.values.get(position).and_then(Option::as_ref)
    }
}

// ------------- Doc Part Data -------------
#[derive(Debug, Clone)]
pub struct DocPartData {
    table_ref: TableRef,
    identifier: String,
    columns: Vec<DocPartColumn>,
    positions: HashMap<(ColumnKey, FieldType), usize>,
    rows: Vec<DocPartRow>,
}

impl DocPartData {
    fn new(table_ref: TableRef, identifier: String) -> Self {
        Self {
            table_ref,
            identifier,
            columns: Vec::new(),
            positions: HashMap::new(),
            rows: Vec::new(),
        }
    }
    pub fn table_ref(&self) -> &TableRef {
        &self.table_ref
    }
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
    pub fn is_root(&self) -> bool {
        self.table_ref.is_root()
    }
    /// Columns in the order they were first seen in this batch.
    pub fn columns(&self) -> &[DocPartColumn] {
        &self.columns
    }
    pub fn position(&self, key: &ColumnKey, field_type: FieldType) -> Option<usize> {
        self.positions.get(&(key.clone(), field_type)).copied()
    }
    pub fn rows(&self) -> &[DocPartRow] {
        &self.rows
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    fn column(&mut self, key: ColumnKey, field_type: FieldType, identifier: impl FnOnce() -> Result<String>) -> Result<usize> {
        if let Some(position) = self.positions.get(&(key.clone(), field_type)) {
            return Ok(*position);
        }
        let position = self.columns.len();
        self.columns.push(DocPartColumn {
            key: key.clone(),
            field_type,
            identifier: identifier()?,
        });
        self.positions.insert((key, field_type), position);
        Ok(position)
    }
    fn append_row(&mut self, did: u64, parent: Option<RowHandle>, seq: Option<u32>) -> usize {
        self.rows.push(DocPartRow {
            did,
            rid: None,
            pid: None,
            seq,
            parent,
            values: Vec::new(),
        });
        self.rows.len() - 1
    }
    fn set(&mut self, row: usize, position: usize, value: Value) -> Result<()> {
        let expected = self.columns[position].field_type;
        if FieldType::of(&value) != expected && !(expected == FieldType::Child && matches!(value, Value::Boolean(_))) {
            return Err(DocShredError::Invariant(format!(
                "a {} value cannot go to the {} column {}",
                FieldType::of(&value),
                expected,
                self.columns[position].identifier
            )));
        }
        let values = &mut self.rows[row].values;
        if values.len() <= position {
            values.resize(position + 1, None);
        }
        values[position] = Some(value);
        Ok(())
    }
}

// ------------- Collection Data -------------
/// Everything one translation produced for one collection.
#[derive(Debug, Clone)]
pub struct CollectionData {
    database: String,
    collection: String,
    parts: Vec<DocPartData>,
    by_table_ref: HashMap<TableRef, usize, RefHasher>,
    rids_assigned: bool,
}

impl CollectionData {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            parts: Vec::new(),
            by_table_ref: HashMap::default(),
            rids_assigned: false,
        }
    }
    pub fn database(&self) -> &str {
        &self.database
    }
    pub fn collection(&self) -> &str {
        &self.collection
    }
    /// Document parts in creation order, which puts every part after its parent.
    pub fn doc_parts(&self) -> &[DocPartData] {
        &self.parts
    }
    pub fn doc_part(&self, table_ref: &TableRef) -> Option<&DocPartData> {
        self.by_table_ref.get(table_ref).map(|i| &self.parts[*i])
    }
    pub fn row_count(&self) -> usize {
        self.parts.iter().map(DocPartData::len).sum()
    }
    pub fn rids_assigned(&self) -> bool {
        self.rids_assigned || self.parts.iter().all(DocPartData::is_root)
    }
    /// Consumes one block of rids per non-root document part and resolves
    /// the parent of every row to its rid.
    pub fn assign_rids(&mut self, generator: &dyn RidGenerator) -> Result<()> {
        if self.rids_assigned {
            return Ok(());
        }
        for part in 0..self.parts.len() {
            let block = if self.parts[part].is_root() {
                None
            } else {
                let data = &self.parts[part];
                Some(generator.consume_rids(&self.database, &self.collection, &data.table_ref, data.len() as u64)?)
            };
            let pids: Vec<Option<u64>> = self.parts[part]
                .rows
                .iter()
                .map(|row| row.parent.and_then(|parent| self.parts[parent.part].rows[parent.row].rid))
                .collect();
            let data = &mut self.parts[part];
            for (offset, (row, pid)) in data.rows.iter_mut().zip(pids).enumerate() {
                row.rid = match block {
                    Some(block) => block.get(offset as u64),
                    None => Some(row.did),
                };
                if row.parent.is_some() && pid.is_none() {
                    return Err(DocShredError::Invariant(format!("a row of {} lost its parent", data.table_ref)));
                }
                row.pid = pid;
            }
        }
        self.rids_assigned = true;
        Ok(())
    }
    fn part_index(&self, table_ref: &TableRef) -> Option<usize> {
        self.by_table_ref.get(table_ref).copied()
    }
    fn add_part(&mut self, table_ref: TableRef, identifier: String) -> usize {
        self.parts.push(DocPartData::new(table_ref.clone(), identifier));
        self.by_table_ref.insert(table_ref, self.parts.len() - 1);
        self.parts.len() - 1
    }
}

// ------------- Accumulator -------------
/// The [`D2RCallback`] that turns visitor events into rows of one document.
pub struct RowAccumulator<'t, 'm> {
    collection: &'t mut MutableMetaCollection<'m>,
    factory: &'t IdentifierFactory,
    data: &'t mut CollectionData,
    did: u64,
}

impl<'t, 'm> RowAccumulator<'t, 'm> {
    pub fn new(
        collection: &'t mut MutableMetaCollection<'m>,
        factory: &'t IdentifierFactory,
        data: &'t mut CollectionData,
        did: u64,
    ) -> Self {
        Self { collection, factory, data, did }
    }
    fn part(&mut self, table_ref: &TableRef) -> Result<usize> {
        if let Some(part) = self.data.part_index(table_ref) {
            return Ok(part);
        }
        let identifier = self.collection.get_or_create_doc_part(table_ref, self.factory)?;
        Ok(self.data.add_part(table_ref.clone(), identifier))
    }
    fn field_column(&mut self, part: usize, name: &str, field_type: FieldType) -> Result<usize> {
        let table_ref = self.data.parts[part].table_ref.clone();
        let collection = &mut *self.collection;
        let factory = self.factory;
        self.data.parts[part].column(ColumnKey::Field(name.to_string()), field_type, || {
            collection.get_or_create_field(&table_ref, name, field_type, factory)
        })
    }
    fn scalar_column(&mut self, part: usize, field_type: FieldType) -> Result<usize> {
        let table_ref = self.data.parts[part].table_ref.clone();
        let collection = &mut *self.collection;
        let factory = self.factory;
        self.data.parts[part].column(ColumnKey::Scalar, field_type, || {
            collection.get_or_create_scalar(&table_ref, field_type, factory)
        })
    }
    fn append_row(&mut self, part: usize, parent: Option<RowHandle>, seq: Option<usize>) -> Result<RowHandle> {
        let seq = seq
            .map(u32::try_from)
            .transpose()
            .map_err(|_| DocShredError::Invariant(String::from("array index exceeds the seq range")))?;
        let row = self.data.parts[part].append_row(self.did, parent, seq);
        Ok(RowHandle { part, row })
    }
    fn set(&mut self, handle: RowHandle, position: usize, value: Value) -> Result<()> {
        self.data.parts[handle.part].set(handle.row, position, value)
    }
}

impl<'t, 'm> D2RCallback for RowAccumulator<'t, 'm> {
    type Row = RowHandle;

    fn visit_document(&mut self, document: &Document, context: &VisitContext<RowHandle>) -> Result<RowHandle> {
        let part = self.part(&context.table_ref)?;
        let row = match context.attribute_reference.last_key() {
            Some(Key::Array(index)) => {
                let row = self.append_row(part, context.parent_row, Some(*index))?;
                let marker = self.scalar_column(part, FieldType::Child)?;
                self.set(row, marker, Value::Boolean(false))?;
                row
            }
            _ => self.append_row(part, context.parent_row, None)?,
        };
        for (key, value) in document.iter() {
            let field_type = FieldType::of(value);
            let position = self.field_column(part, key, field_type)?;
            let stored = match value {
                Value::Document(_) => Value::Boolean(false),
                Value::Array(_) => Value::Boolean(true),
                scalar => scalar.clone(),
            };
            self.set(row, position, stored)?;
        }
        trace!(table_ref = %context.table_ref, did = self.did, "document row");
        Ok(row)
    }

    fn visit_array(&mut self, array: &[Value], context: &VisitContext<RowHandle>) -> Result<()> {
        let part = self.part(&context.table_ref)?;
        for (index, item) in array.iter().enumerate() {
            if !item.is_scalar() {
                continue;
            }
            let row = self.append_row(part, context.parent_row, Some(index))?;
            let position = self.scalar_column(part, FieldType::of(item))?;
            self.set(row, position, item.clone())?;
        }
        Ok(())
    }

    fn visit_array_element(&mut self, index: usize, context: &VisitContext<RowHandle>) -> Result<RowHandle> {
        let part = self.part(&context.table_ref)?;
        let row = self.append_row(part, context.parent_row, Some(index))?;
        let marker = self.scalar_column(part, FieldType::Child)?;
        self.set(row, marker, Value::Boolean(true))?;
        Ok(row)
    }
}

// ------------- Translator -------------
/// Translates documents of one collection into rows, creating metadata on the way.
#[derive(Debug, Clone, Copy)]
pub struct D2RTranslator<'f> {
    factory: &'f IdentifierFactory,
}

impl<'f> D2RTranslator<'f> {
    pub fn new(factory: &'f IdentifierFactory) -> Self {
        Self { factory }
    }
    pub fn translate<'d>(
        &self,
        collection: &mut MutableMetaCollection<'_>,
        documents: impl IntoIterator<Item = (u64, &'d Document)>,
    ) -> Result<CollectionData> {
        let mut data = CollectionData::new(collection.database_name(), collection.name());
        for (did, document) in documents {
            let mut accumulator = RowAccumulator::new(collection, self.factory, &mut data, did);
            D2RVisitor::visit(document, &mut accumulator)?;
        }
        Ok(data)
    }
}
