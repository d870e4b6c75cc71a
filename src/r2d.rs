//! Reassembly of documents from the rows of their document parts.
//!
//! Rows of a non-root part hang from the row whose `rid` equals their `pid`.
//! Object rows have no `seq`; array element rows are ordered by it. Where a
//! row holds a `Child` field the value tells whether the nested part holds an
//! object (false) or the elements of an array (true). Element rows carry the
//! `Child` marker as a scalar: false when the element is the row's own
//! document, true when the element is an array whose own elements live one
//! array dimension deeper.

use std::collections::{BTreeMap, HashMap};

use crate::collection_data::{CollectionData, ColumnKey};
use crate::datatype::FieldType;
use crate::document::{Document, Value};
use crate::error::{DocShredError, Result};
use crate::reference::{RefHasher, TableRef};

// ------------- Rows -------------
/// One stored row, with only the columns that hold a value.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub did: u64,
    pub rid: u64,
    pub pid: Option<u64>,
    pub seq: Option<u32>,
    pub fields: Vec<(String, FieldType, Value)>,
    pub scalars: Vec<(FieldType, Value)>,
}

impl StoredRow {
    fn scalar(&self, field_type: FieldType) -> Option<&Value> {
        self.scalars
            .iter()
            .find(|(scalar_type, _)| *scalar_type == field_type)
            .map(|(_, value)| value)
    }
}

/// The rows read from one document part.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocPart {
    pub table_ref: TableRef,
    pub rows: Vec<StoredRow>,
}

impl StoredDocPart {
    pub fn new(table_ref: TableRef) -> Self {
        Self { table_ref, rows: Vec::new() }
    }
}

/// Turns translated rows into the form they would be read back in. Rids must be assigned.
pub fn stored_parts(data: &CollectionData) -> Result<Vec<StoredDocPart>> {
    if !data.rids_assigned() {
        return Err(DocShredError::Invariant(String::from(
            "rows can only be reassembled once their rids are assigned",
        )));
    }
    let mut parts = Vec::with_capacity(data.doc_parts().len());
    for part in data.doc_parts() {
        let mut stored = StoredDocPart::new(part.table_ref().clone());
        for row in part.rows() {
            let mut fields = Vec::new();
            let mut scalars = Vec::new();
            for (column, value) in part.columns().iter().zip(row.values()) {
                let Some(value) = value else { continue };
                match column.key() {
                    ColumnKey::Field(name) => fields.push((name.clone(), column.field_type(), value.clone())),
                    ColumnKey::Scalar => scalars.push((column.field_type(), value.clone())),
                }
            }
            stored.rows.push(StoredRow {
                did: row.did(),
                rid: row.rid().unwrap_or(row.did()),
                pid: row.pid(),
                seq: row.seq(),
                fields,
                scalars,
            });
        }
        parts.push(stored);
    }
    Ok(parts)
}

// ------------- Reassembly -------------
#[derive(Default)]
struct PartIndex<'a> {
    by_pid: HashMap<u64, Vec<&'a StoredRow>>,
}

/// Rebuilds documents from stored rows.
pub struct R2DTranslator<'a> {
    roots: Vec<&'a StoredRow>,
    parts: HashMap<TableRef, PartIndex<'a>, RefHasher>,
}

impl<'a> R2DTranslator<'a> {
    pub fn new(parts: &'a [StoredDocPart]) -> Self {
        let mut roots = Vec::new();
        let mut indexed: HashMap<TableRef, PartIndex<'a>, RefHasher> = HashMap::default();
        for part in parts {
            if part.table_ref.is_root() {
                roots.extend(part.rows.iter());
                continue;
            }
            let index = indexed.entry(part.table_ref.clone()).or_default();
            for row in &part.rows {
                if let Some(pid) = row.pid {
                    index.by_pid.entry(pid).or_default().push(row);
                }
            }
        }
        for index in indexed.values_mut() {
            for children in index.by_pid.values_mut() {
                children.sort_by_key(|row| row.seq);
            }
        }
        Self { roots, parts: indexed }
    }
    /// Documents keyed by did.
    pub fn translate(&self) -> Result<BTreeMap<u64, Document>> {
        let root = TableRef::root();
        let mut documents = BTreeMap::new();
        for row in &self.roots {
            let document = self.build_object(&root, row)?;
            if documents.insert(row.did, document).is_some() {
                return Err(DocShredError::Invariant(format!("document {} has two root rows", row.did)));
            }
        }
        Ok(documents)
    }
    fn children(&self, table_ref: &TableRef, pid: u64) -> &[&'a StoredRow] {
        self.parts
            .get(table_ref)
            .and_then(|index| index.by_pid.get(&pid))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
    fn build_object(&self, table_ref: &TableRef, row: &StoredRow) -> Result<Document> {
        let mut document = Document::new();
        for (name, field_type, value) in &row.fields {
            let value = match (field_type, value) {
                (FieldType::Child, Value::Boolean(false)) => {
                    let child = table_ref.child(name.as_str());
                    let object = self
                        .children(&child, row.rid)
                        .iter()
                        .find(|candidate| candidate.seq.is_none())
                        .ok_or_else(|| missing(&child, row))?;
                    Value::Document(self.build_object(&child, object)?)
                }
                (FieldType::Child, Value::Boolean(true)) => {
                    let child = table_ref.child(name.as_str());
                    Value::Array(self.build_array(&child, row.rid)?)
                }
                (_, value) => value.clone(),
            };
            document.insert(name.clone(), value);
        }
        Ok(document)
    }
    fn build_array(&self, table_ref: &TableRef, pid: u64) -> Result<Vec<Value>> {
        let mut elements = Vec::new();
        for row in self.children(table_ref, pid).iter().filter(|row| row.seq.is_some()) {
            let element = match row.scalar(FieldType::Child) {
                Some(Value::Boolean(false)) => Value::Document(self.build_object(table_ref, row)?),
                Some(Value::Boolean(true)) => Value::Array(self.build_array(&table_ref.array_child(), row.rid)?),
                _ => row
                    .scalars
                    .iter()
                    .find(|(field_type, _)| *field_type != FieldType::Child)
                    .map(|(_, value)| value.clone())
                    .ok_or_else(|| missing(table_ref, row))?,
            };
            elements.push(element);
        }
        Ok(elements)
    }
}

fn missing(table_ref: &TableRef, row: &StoredRow) -> DocShredError {
    DocShredError::Invariant(format!(
        "document {} misses the rows of {} below rid {}",
        row.did, table_ref, row.rid
    ))
}
