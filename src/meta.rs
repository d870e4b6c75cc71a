//! The derived schema as an immutable snapshot.
//!
//! A snapshot is a strict ownership tree: databases own collections, which own
//! document parts and logical indexes, and document parts own their fields,
//! scalars and physical indexes. Children are shared through `Arc`, so copying
//! a snapshot is cheap and the mutable overlay only clones the branches it
//! touches.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::datatype::FieldType;
use crate::identifier::INTERNAL_INDEX_SUFFIXES;
use crate::reference::TableRef;

// ------------- Snapshot -------------
#[derive(Debug, Clone, Default)]
pub struct MetaSnapshot {
    pub(crate) databases: BTreeMap<String, Arc<MetaDatabase>>,
}

impl MetaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn database(&self, name: &str) -> Option<&MetaDatabase> {
        self.databases.get(name).map(Arc::as_ref)
    }
    pub fn database_by_identifier(&self, identifier: &str) -> Option<&MetaDatabase> {
        self.databases().find(|db| db.identifier == identifier)
    }
    pub fn databases(&self) -> impl Iterator<Item = &MetaDatabase> {
        self.databases.values().map(Arc::as_ref)
    }
    pub fn collection(&self, database: &str, collection: &str) -> Option<&MetaCollection> {
        self.database(database)?.collection(collection)
    }
}

// ------------- Database -------------
#[derive(Debug, Clone)]
pub struct MetaDatabase {
    pub(crate) name: String,
    pub(crate) identifier: String,
    pub(crate) collections: BTreeMap<String, Arc<MetaCollection>>,
}

impl MetaDatabase {
    pub fn new(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifier: identifier.into(),
            collections: BTreeMap::new(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
    pub fn collection(&self, name: &str) -> Option<&MetaCollection> {
        self.collections.get(name).map(Arc::as_ref)
    }
    pub fn collections(&self) -> impl Iterator<Item = &MetaCollection> {
        self.collections.values().map(Arc::as_ref)
    }
    /// True when a table or index of this database already uses `identifier`.
    /// Tables and indexes share one namespace per schema.
    pub fn uses_table_identifier(&self, identifier: &str) -> bool {
        self.collections().any(|collection| {
            collection.doc_parts().any(|doc_part| doc_part.uses_table_identifier(identifier))
        })
    }
}

// ------------- Collection -------------
#[derive(Debug, Clone)]
pub struct MetaCollection {
    pub(crate) name: String,
    pub(crate) identifier: String,
    pub(crate) doc_parts: BTreeMap<TableRef, Arc<MetaDocPart>>,
    pub(crate) indexes: BTreeMap<String, Arc<MetaIndex>>,
}

impl MetaCollection {
    pub fn new(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifier: identifier.into(),
            doc_parts: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
    pub fn doc_part(&self, table_ref: &TableRef) -> Option<&MetaDocPart> {
        self.doc_parts.get(table_ref).map(Arc::as_ref)
    }
    /// Document parts ordered parents first.
    pub fn doc_parts(&self) -> impl DoubleEndedIterator<Item = &MetaDocPart> {
        self.doc_parts.values().map(Arc::as_ref)
    }
    pub fn index(&self, name: &str) -> Option<&MetaIndex> {
        self.indexes.get(name).map(Arc::as_ref)
    }
    pub fn indexes(&self) -> impl Iterator<Item = &MetaIndex> {
        self.indexes.values().map(Arc::as_ref)
    }
}

// ------------- Doc Part -------------
#[derive(Debug, Clone)]
pub struct MetaDocPart {
    pub(crate) table_ref: TableRef,
    pub(crate) identifier: String,
    pub(crate) last_rid: u64,
    pub(crate) fields: Vec<MetaField>,
    pub(crate) scalars: Vec<MetaScalar>,
    pub(crate) indexes: Vec<MetaDocPartIndex>,
}

impl MetaDocPart {
    pub fn new(table_ref: TableRef, identifier: impl Into<String>) -> Self {
        Self {
            table_ref,
            identifier: identifier.into(),
            last_rid: 0,
            fields: Vec::new(),
            scalars: Vec::new(),
            indexes: Vec::new(),
        }
    }
    pub fn table_ref(&self) -> &TableRef {
        &self.table_ref
    }
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
    /// Number of row identifiers handed out so far, which is also the next one to hand out.
    pub fn last_rid(&self) -> u64 {
        self.last_rid
    }
    pub fn fields(&self) -> &[MetaField] {
        &self.fields
    }
    pub fn field(&self, name: &str, field_type: FieldType) -> Option<&MetaField> {
        self.fields
            .iter()
            .find(|field| field.name == name && field.field_type == field_type)
    }
    pub fn fields_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MetaField> + 'a {
        self.fields.iter().filter(move |field| field.name == name)
    }
    pub fn scalars(&self) -> &[MetaScalar] {
        &self.scalars
    }
    pub fn scalar(&self, field_type: FieldType) -> Option<&MetaScalar> {
        self.scalars.iter().find(|scalar| scalar.field_type == field_type)
    }
    pub fn indexes(&self) -> &[MetaDocPartIndex] {
        &self.indexes
    }
    pub fn index(&self, identifier: &str) -> Option<&MetaDocPartIndex> {
        self.indexes.iter().find(|index| index.identifier == identifier)
    }
    /// True when the table, one of its internal indexes or one of its indexes is named `identifier`.
    pub fn uses_table_identifier(&self, identifier: &str) -> bool {
        self.identifier == identifier
            || INTERNAL_INDEX_SUFFIXES
                .iter()
                .any(|suffix| identifier.strip_suffix(suffix) == Some(self.identifier.as_str()))
            || self.indexes.iter().any(|index| index.identifier == identifier)
    }
    pub fn has_column_identifier(&self, identifier: &str) -> bool {
        self.fields.iter().any(|field| field.identifier == identifier)
            || self.scalars.iter().any(|scalar| scalar.identifier == identifier)
    }
    /// Columns in table order: scalars first, then fields, each in creation order.
    pub fn columns(&self) -> impl Iterator<Item = MetaColumn<'_>> {
        self.scalars
            .iter()
            .map(MetaColumn::Scalar)
            .chain(self.fields.iter().map(MetaColumn::Field))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaField {
    pub(crate) name: String,
    pub(crate) field_type: FieldType,
    pub(crate) identifier: String,
}

impl MetaField {
    pub fn new(name: impl Into<String>, field_type: FieldType, identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type,
            identifier: identifier.into(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn field_type(&self) -> FieldType {
        self.field_type
    }
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaScalar {
    pub(crate) field_type: FieldType,
    pub(crate) identifier: String,
}

impl MetaScalar {
    pub fn new(field_type: FieldType, identifier: impl Into<String>) -> Self {
        Self {
            field_type,
            identifier: identifier.into(),
        }
    }
    pub fn field_type(&self) -> FieldType {
        self.field_type
    }
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

#[derive(Debug, Clone, Copy)]
pub enum MetaColumn<'a> {
    Scalar(&'a MetaScalar),
    Field(&'a MetaField),
}

impl<'a> MetaColumn<'a> {
    pub fn identifier(&self) -> &'a str {
        match self {
            MetaColumn::Scalar(scalar) => &scalar.identifier,
            MetaColumn::Field(field) => &field.identifier,
        }
    }
    pub fn field_type(&self) -> FieldType {
        match self {
            MetaColumn::Scalar(scalar) => scalar.field_type,
            MetaColumn::Field(field) => field.field_type,
        }
    }
}

// ------------- Indexes -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexOrdering {
    Ascending,
    Descending,
}

impl IndexOrdering {
    pub fn name(&self) -> &'static str {
        match self {
            IndexOrdering::Ascending => "ASC",
            IndexOrdering::Descending => "DESC",
        }
    }
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ASC" => Some(IndexOrdering::Ascending),
            "DESC" => Some(IndexOrdering::Descending),
            _ => None,
        }
    }
}

/// A field of a logical index: the document part and key it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaIndexField {
    pub(crate) table_ref: TableRef,
    pub(crate) name: String,
    pub(crate) ordering: IndexOrdering,
}

impl MetaIndexField {
    pub fn new(table_ref: TableRef, name: impl Into<String>, ordering: IndexOrdering) -> Self {
        Self {
            table_ref,
            name: name.into(),
            ordering,
        }
    }
    pub fn table_ref(&self) -> &TableRef {
        &self.table_ref
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn ordering(&self) -> IndexOrdering {
        self.ordering
    }
}

/// An index as requested by users, independent of how many typed columns back it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaIndex {
    pub(crate) name: String,
    pub(crate) unique: bool,
    pub(crate) fields: Vec<MetaIndexField>,
}

impl MetaIndex {
    pub fn new(name: impl Into<String>, unique: bool, fields: Vec<MetaIndexField>) -> Self {
        Self {
            name: name.into(),
            unique,
            fields,
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn is_unique(&self) -> bool {
        self.unique
    }
    pub fn fields(&self) -> &[MetaIndexField] {
        &self.fields
    }
    /// The document part all fields of the index lie on.
    pub fn table_ref(&self) -> Option<&TableRef> {
        self.fields.first().map(|field| &field.table_ref)
    }
    /// True when `doc_part_index` implements this index.
    pub fn is_implemented_by(&self, doc_part: &MetaDocPart, doc_part_index: &MetaDocPartIndex) -> bool {
        self.table_ref() == Some(&doc_part.table_ref)
            && self.unique == doc_part_index.unique
            && self.fields.len() == doc_part_index.columns.len()
            && self.fields.iter().zip(&doc_part_index.columns).all(|(field, column)| {
                field.ordering == column.ordering
                    && doc_part
                        .fields_named(&field.name)
                        .any(|meta_field| meta_field.identifier == column.identifier)
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaDocPartIndexColumn {
    pub(crate) identifier: String,
    pub(crate) ordering: IndexOrdering,
}

impl MetaDocPartIndexColumn {
    pub fn new(identifier: impl Into<String>, ordering: IndexOrdering) -> Self {
        Self {
            identifier: identifier.into(),
            ordering,
        }
    }
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
    pub fn ordering(&self) -> IndexOrdering {
        self.ordering
    }
}

/// A physical index on one document part table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaDocPartIndex {
    pub(crate) identifier: String,
    pub(crate) unique: bool,
    pub(crate) columns: Vec<MetaDocPartIndexColumn>,
}

impl MetaDocPartIndex {
    pub fn new(identifier: impl Into<String>, unique: bool, columns: Vec<MetaDocPartIndexColumn>) -> Self {
        Self {
            identifier: identifier.into(),
            unique,
            columns,
        }
    }
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
    pub fn is_unique(&self) -> bool {
        self.unique
    }
    pub fn columns(&self) -> &[MetaDocPartIndexColumn] {
        &self.columns
    }
}
