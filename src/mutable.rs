//! The metadata overlay a write transaction works on.
//!
//! A [`MutableMetaSnapshot`] starts as a copy of the committed snapshot and
//! records every change it accepts in a change log. The owning transaction
//! turns the log into metadata rows and DDL, and after commit the log is
//! merged into the committed repository. Nothing in the overlay is visible to
//! other transactions before that.
//!
//! Entities are resolved or created lazily: the `get_or_create_*` methods
//! return the existing identifier or generate a fresh one through the
//! [`IdentifierFactory`]. The `add_*` methods accept identifiers as given and
//! fail fast when they break the identifier rules or collide.

use std::sync::Arc;

use tracing::debug;

use crate::datatype::FieldType;
use crate::error::{DocShredError, Result};
use crate::identifier::{IdentifierFactory, IdentifierKind};
use crate::meta::{
    IndexOrdering, MetaCollection, MetaDatabase, MetaDocPart, MetaDocPartIndex, MetaDocPartIndexColumn,
    MetaField, MetaIndex, MetaIndexField, MetaScalar, MetaSnapshot,
};
use crate::reference::TableRef;
use crate::translate::{AttributeReferenceTranslator, sanitize};

// ------------- Changes -------------
#[derive(Debug, Clone)]
pub enum MetaChange {
    AddDatabase { database: String },
    AddCollection { database: String, collection: String },
    AddDocPart { database: String, collection: String, table_ref: TableRef },
    AddField { database: String, collection: String, table_ref: TableRef, name: String, field_type: FieldType },
    AddScalar { database: String, collection: String, table_ref: TableRef, field_type: FieldType },
    AddIndex { database: String, collection: String, name: String },
    AddDocPartIndex { database: String, collection: String, table_ref: TableRef, identifier: String },
    DropIndex { database: String, collection: String, index: Arc<MetaIndex> },
    DropDocPartIndex { database: String, collection: String, table_ref: TableRef, index: MetaDocPartIndex },
    DropCollection { database: String, collection: Arc<MetaCollection> },
    DropDatabase { database: Arc<MetaDatabase> },
    RenameCollection {
        from_database: String,
        from_collection: Arc<MetaCollection>,
        to_database: String,
        to_collection: String,
    },
    LastRid { database: String, collection: String, table_ref: TableRef, last_rid: u64 },
}

impl MetaChange {
    /// True for changes that alter the shape of the schema, as opposed to counters.
    pub fn is_structural(&self) -> bool {
        !matches!(self, MetaChange::LastRid { .. })
    }
}

// ------------- Snapshot -------------
#[derive(Debug, Clone)]
pub struct MutableMetaSnapshot {
    snapshot: MetaSnapshot,
    changes: Vec<MetaChange>,
}

impl MutableMetaSnapshot {
    pub fn new(base: &MetaSnapshot) -> Self {
        Self {
            snapshot: base.clone(),
            changes: Vec::new(),
        }
    }
    /// The overlay as it currently stands, including uncommitted changes.
    pub fn snapshot(&self) -> &MetaSnapshot {
        &self.snapshot
    }
    pub fn changes(&self) -> &[MetaChange] {
        &self.changes
    }
    pub fn has_structural_changes(&self) -> bool {
        self.changes.iter().any(MetaChange::is_structural)
    }
    pub fn database_mut(&mut self, name: &str) -> Option<MutableMetaDatabase<'_>> {
        let database = self.snapshot.databases.get_mut(name)?;
        Some(MutableMetaDatabase {
            database: Arc::make_mut(database),
            changes: &mut self.changes,
        })
    }
    pub fn add_database(&mut self, name: &str, identifier: &str, factory: &IdentifierFactory) -> Result<()> {
        factory.ensure_allowed(IdentifierKind::Schema, identifier)?;
        if self.snapshot.database(name).is_some() {
            return Err(DocShredError::Invariant(format!("database {} already exists", name)));
        }
        if self.snapshot.database_by_identifier(identifier).is_some() {
            return Err(DocShredError::Invariant(format!("schema identifier {} is already used", identifier)));
        }
        debug!(database = name, identifier, "adding database");
        self.snapshot
            .databases
            .insert(name.to_string(), Arc::new(MetaDatabase::new(name, identifier)));
        self.changes.push(MetaChange::AddDatabase { database: name.to_string() });
        Ok(())
    }
    pub fn get_or_create_database(&mut self, name: &str, factory: &IdentifierFactory) -> Result<MutableMetaDatabase<'_>> {
        if self.snapshot.database(name).is_none() {
            let identifier = factory.generate(IdentifierKind::Schema, &sanitize(name), |candidate| {
                self.snapshot.database_by_identifier(candidate).is_some()
            })?;
            self.add_database(name, &identifier, factory)?;
        }
        self.database_mut(name)
            .ok_or_else(|| DocShredError::UnknownDatabase(name.to_string()))
    }
    pub fn remove_database(&mut self, name: &str) -> Result<Arc<MetaDatabase>> {
        let removed = self
            .snapshot
            .databases
            .remove(name)
            .ok_or_else(|| DocShredError::UnknownDatabase(name.to_string()))?;
        self.changes.push(MetaChange::DropDatabase { database: Arc::clone(&removed) });
        Ok(removed)
    }
    /// Moves a collection, keeping the identifiers of its columns and the
    /// counters of its document parts. Tables and indexes get identifiers
    /// generated for the target.
    pub fn rename_collection(
        &mut self,
        from_database: &str,
        from_collection: &str,
        to_database: &str,
        to_collection: &str,
        factory: &IdentifierFactory,
    ) -> Result<()> {
        if from_database == to_database && from_collection == to_collection {
            return Ok(());
        }
        let source = self
            .snapshot
            .collection(from_database, from_collection)
            .cloned()
            .ok_or_else(|| DocShredError::UnknownCollection {
                database: from_database.to_string(),
                collection: from_collection.to_string(),
            })?;
        let source = Arc::new(source);
        // the source is gone from the namespace before target identifiers are generated
        self.database_mut(from_database)
            .ok_or_else(|| DocShredError::UnknownDatabase(from_database.to_string()))?
            .detach_collection(from_collection)?;
        let translator = AttributeReferenceTranslator::new(factory.constraints());
        {
            let mut target_database = self.get_or_create_database(to_database, factory)?;
            if target_database.view().collection(to_collection).is_some() {
                return Err(DocShredError::Invariant(format!(
                    "collection {}.{} already exists",
                    to_database, to_collection
                )));
            }
            let collection_identifier = target_database.generate_collection_identifier(to_collection, factory)?;
            let mut target = MetaCollection::new(to_collection, collection_identifier);
            for doc_part in source.doc_parts() {
                let base = translator.table_ref_to_table_name(&doc_part.table_ref, to_collection);
                let identifier = factory.generate(IdentifierKind::Table, &base, |candidate| {
                    target_database.view().uses_table_identifier(candidate) || uses_table_identifier(&target, candidate)
                })?;
                let mut copy = MetaDocPart::new(doc_part.table_ref.clone(), identifier);
                copy.last_rid = doc_part.last_rid;
                copy.fields = doc_part.fields.clone();
                copy.scalars = doc_part.scalars.clone();
                target.doc_parts.insert(copy.table_ref.clone(), Arc::new(copy));
            }
            for doc_part in source.doc_parts() {
                let table_identifier = target
                    .doc_part(&doc_part.table_ref)
                    .map(|part| part.identifier.clone())
                    .unwrap_or_default();
                for index in &doc_part.indexes {
                    let base = index_base(&table_identifier, &index.columns);
                    let identifier = factory.generate(IdentifierKind::Index, &base, |candidate| {
                        target_database.view().uses_table_identifier(candidate) || uses_table_identifier(&target, candidate)
                    })?;
                    if let Some(copy) = target.doc_parts.get_mut(&doc_part.table_ref) {
                        Arc::make_mut(copy)
                            .indexes
                            .push(MetaDocPartIndex::new(identifier, index.unique, index.columns.clone()));
                    }
                }
            }
            target.indexes = source.indexes.clone();
            target_database
                .database
                .collections
                .insert(to_collection.to_string(), Arc::new(target));
        }
        self.changes.push(MetaChange::RenameCollection {
            from_database: from_database.to_string(),
            from_collection: source,
            to_database: to_database.to_string(),
            to_collection: to_collection.to_string(),
        });
        Ok(())
    }
    pub(crate) fn record(&mut self, change: MetaChange) {
        self.changes.push(change);
    }
}

fn uses_table_identifier(collection: &MetaCollection, identifier: &str) -> bool {
    collection.doc_parts().any(|doc_part| doc_part.uses_table_identifier(identifier))
}

// the table identifier followed by each column and its direction
fn index_base(table_identifier: &str, columns: &[MetaDocPartIndexColumn]) -> String {
    let mut base = table_identifier.to_string();
    for column in columns {
        base.push('_');
        base.push_str(&column.identifier);
        base.push(match column.ordering {
            IndexOrdering::Ascending => 'a',
            IndexOrdering::Descending => 'd',
        });
    }
    base.push_str("_idx");
    base
}

// ------------- Database -------------
#[derive(Debug)]
pub struct MutableMetaDatabase<'a> {
    database: &'a mut MetaDatabase,
    changes: &'a mut Vec<MetaChange>,
}

impl<'a> MutableMetaDatabase<'a> {
    pub fn view(&self) -> &MetaDatabase {
        self.database
    }
    pub fn name(&self) -> &str {
        &self.database.name
    }
    pub fn identifier(&self) -> &str {
        &self.database.identifier
    }
    pub fn collection_mut(&mut self, name: &str) -> Option<MutableMetaCollection<'_>> {
        if self.database.collection(name).is_none() {
            return None;
        }
        Some(MutableMetaCollection {
            database: &mut *self.database,
            collection: name.to_string(),
            changes: &mut *self.changes,
        })
    }
    pub fn add_collection(&mut self, name: &str, identifier: &str, factory: &IdentifierFactory) -> Result<()> {
        factory.ensure_allowed(IdentifierKind::Collection, identifier)?;
        if self.database.collection(name).is_some() {
            return Err(DocShredError::Invariant(format!(
                "collection {}.{} already exists",
                self.database.name, name
            )));
        }
        if self.database.collections().any(|c| c.identifier == identifier) {
            return Err(DocShredError::Invariant(format!(
                "collection identifier {} is already used in {}",
                identifier, self.database.name
            )));
        }
        debug!(database = %self.database.name, collection = name, identifier, "adding collection");
        self.database
            .collections
            .insert(name.to_string(), Arc::new(MetaCollection::new(name, identifier)));
        self.changes.push(MetaChange::AddCollection {
            database: self.database.name.clone(),
            collection: name.to_string(),
        });
        Ok(())
    }
    pub fn get_or_create_collection(&mut self, name: &str, factory: &IdentifierFactory) -> Result<MutableMetaCollection<'_>> {
        if self.database.collection(name).is_none() {
            let identifier = self.generate_collection_identifier(name, factory)?;
            self.add_collection(name, &identifier, factory)?;
        }
        let database = self.database.name.clone();
        self.collection_mut(name).ok_or_else(|| DocShredError::UnknownCollection {
            database,
            collection: name.to_string(),
        })
    }
    pub fn remove_collection(&mut self, name: &str) -> Result<Arc<MetaCollection>> {
        let removed = self.detach_collection(name)?;
        self.changes.push(MetaChange::DropCollection {
            database: self.database.name.clone(),
            collection: Arc::clone(&removed),
        });
        Ok(removed)
    }
    fn detach_collection(&mut self, name: &str) -> Result<Arc<MetaCollection>> {
        self.database
            .collections
            .remove(name)
            .ok_or_else(|| DocShredError::UnknownCollection {
                database: self.database.name.clone(),
                collection: name.to_string(),
            })
    }
    fn generate_collection_identifier(&self, name: &str, factory: &IdentifierFactory) -> Result<String> {
        factory.generate(IdentifierKind::Collection, &sanitize(name), |candidate| {
            self.database.collections().any(|c| c.identifier == candidate)
        })
    }
}

// ------------- Collection -------------
/// A collection of the overlay. Table identifiers are unique per database,
/// so the handle keeps the whole database in reach.
#[derive(Debug)]
pub struct MutableMetaCollection<'a> {
    database: &'a mut MetaDatabase,
    collection: String,
    changes: &'a mut Vec<MetaChange>,
}

impl<'a> MutableMetaCollection<'a> {
    pub fn view(&self) -> &MetaCollection {
        // the handle is only created for a collection that exists
        &self.database.collections[&self.collection]
    }
    pub fn database_name(&self) -> &str {
        &self.database.name
    }
    pub fn database_identifier(&self) -> &str {
        &self.database.identifier
    }
    pub fn name(&self) -> &str {
        &self.collection
    }
    pub fn doc_part(&self, table_ref: &TableRef) -> Option<&MetaDocPart> {
        self.view().doc_part(table_ref)
    }
    fn collection_mut(&mut self) -> Result<&mut MetaCollection> {
        let collection = self
            .database
            .collections
            .get_mut(&self.collection)
            .ok_or_else(|| DocShredError::UnknownCollection {
                database: self.database.name.clone(),
                collection: self.collection.clone(),
            })?;
        Ok(Arc::make_mut(collection))
    }
    fn doc_part_mut(&mut self, table_ref: &TableRef) -> Result<&mut MetaDocPart> {
        let database = self.database.name.clone();
        let collection = self.collection.clone();
        let doc_part = self
            .collection_mut()?
            .doc_parts
            .get_mut(table_ref)
            .ok_or_else(|| DocShredError::Invariant(format!(
                "{}.{} has no document part {}",
                database, collection, table_ref
            )))?;
        Ok(Arc::make_mut(doc_part))
    }
    fn change_key(&self) -> (String, String) {
        (self.database.name.clone(), self.collection.clone())
    }

    // ------------- Document parts -------------
    pub fn add_doc_part(&mut self, table_ref: &TableRef, identifier: &str, factory: &IdentifierFactory) -> Result<()> {
        factory.ensure_allowed(IdentifierKind::Table, identifier)?;
        if self.doc_part(table_ref).is_some() {
            return Err(DocShredError::Invariant(format!("document part {} already exists", table_ref)));
        }
        if let Some(parent) = table_ref.parent() {
            if self.doc_part(&parent).is_none() {
                return Err(DocShredError::Invariant(format!(
                    "document part {} has no parent document part",
                    table_ref
                )));
            }
        }
        if self.database.uses_table_identifier(identifier) {
            return Err(DocShredError::Invariant(format!("table identifier {} is already used", identifier)));
        }
        debug!(collection = %self.collection, %table_ref, identifier, "adding document part");
        self.collection_mut()?
            .doc_parts
            .insert(table_ref.clone(), Arc::new(MetaDocPart::new(table_ref.clone(), identifier)));
        let (database, collection) = self.change_key();
        self.changes.push(MetaChange::AddDocPart {
            database,
            collection,
            table_ref: table_ref.clone(),
        });
        Ok(())
    }
    /// Returns the identifier of the document part, creating it and any missing ancestors.
    pub fn get_or_create_doc_part(&mut self, table_ref: &TableRef, factory: &IdentifierFactory) -> Result<String> {
        if let Some(existing) = self.doc_part(table_ref) {
            return Ok(existing.identifier.clone());
        }
        if let Some(parent) = table_ref.parent() {
            self.get_or_create_doc_part(&parent, factory)?;
        }
        let translator = AttributeReferenceTranslator::new(factory.constraints());
        let base = translator.table_ref_to_table_name(table_ref, &self.collection);
        let identifier = factory.generate(IdentifierKind::Table, &base, |candidate| {
            self.database.uses_table_identifier(candidate)
        })?;
        self.add_doc_part(table_ref, &identifier, factory)?;
        Ok(identifier)
    }

    // ------------- Columns -------------
    pub fn add_field(
        &mut self,
        table_ref: &TableRef,
        name: &str,
        field_type: FieldType,
        identifier: &str,
        factory: &IdentifierFactory,
    ) -> Result<()> {
        factory.ensure_allowed(IdentifierKind::Column, identifier)?;
        let doc_part = self.doc_part_mut(table_ref)?;
        if doc_part.field(name, field_type).is_some() {
            return Err(DocShredError::Invariant(format!(
                "field {} of type {} already exists in {}",
                name, field_type, table_ref
            )));
        }
        if doc_part.has_column_identifier(identifier) {
            return Err(DocShredError::Invariant(format!(
                "column identifier {} is already used in {}",
                identifier, table_ref
            )));
        }
        doc_part.fields.push(MetaField::new(name, field_type, identifier));
        let (database, collection) = self.change_key();
        self.changes.push(MetaChange::AddField {
            database,
            collection,
            table_ref: table_ref.clone(),
            name: name.to_string(),
            field_type,
        });
        Ok(())
    }
    /// Returns the column identifier of a field, creating the field and the
    /// physical indexes it completes.
    pub fn get_or_create_field(
        &mut self,
        table_ref: &TableRef,
        name: &str,
        field_type: FieldType,
        factory: &IdentifierFactory,
    ) -> Result<String> {
        let doc_part = self.doc_part(table_ref).ok_or_else(|| {
            DocShredError::Invariant(format!("{} has no document part {}", self.collection, table_ref))
        })?;
        if let Some(existing) = doc_part.field(name, field_type) {
            return Ok(existing.identifier.clone());
        }
        let translator = AttributeReferenceTranslator::new(factory.constraints());
        let base = translator.field_column_name(name, field_type);
        let identifier = factory.generate(IdentifierKind::Column, &base, |candidate| {
            doc_part.has_column_identifier(candidate)
        })?;
        self.add_field(table_ref, name, field_type, &identifier, factory)?;
        self.create_missing_doc_part_indexes(table_ref, factory)?;
        Ok(identifier)
    }
    pub fn add_scalar(
        &mut self,
        table_ref: &TableRef,
        field_type: FieldType,
        identifier: &str,
        factory: &IdentifierFactory,
    ) -> Result<()> {
        if identifier != factory.constraints().scalar_identifier(field_type) {
            return Err(DocShredError::Invariant(format!(
                "{} is not the scalar identifier of {}",
                identifier, field_type
            )));
        }
        let doc_part = self.doc_part_mut(table_ref)?;
        if doc_part.scalar(field_type).is_some() || doc_part.has_column_identifier(identifier) {
            return Err(DocShredError::Invariant(format!(
                "scalar {} already exists in {}",
                identifier, table_ref
            )));
        }
        doc_part.scalars.push(MetaScalar::new(field_type, identifier));
        let (database, collection) = self.change_key();
        self.changes.push(MetaChange::AddScalar {
            database,
            collection,
            table_ref: table_ref.clone(),
            field_type,
        });
        Ok(())
    }
    pub fn get_or_create_scalar(
        &mut self,
        table_ref: &TableRef,
        field_type: FieldType,
        factory: &IdentifierFactory,
    ) -> Result<String> {
        if let Some(existing) = self.doc_part(table_ref).and_then(|part| part.scalar(field_type)) {
            return Ok(existing.identifier.clone());
        }
        let identifier = factory.constraints().scalar_identifier(field_type).to_string();
        self.add_scalar(table_ref, field_type, &identifier, factory)?;
        Ok(identifier)
    }

    // ------------- Row identifiers -------------
    pub fn set_last_rid(&mut self, table_ref: &TableRef, last_rid: u64) -> Result<()> {
        let doc_part = self.doc_part_mut(table_ref)?;
        doc_part.last_rid = doc_part.last_rid.max(last_rid);
        let (database, collection) = self.change_key();
        self.changes.push(MetaChange::LastRid {
            database,
            collection,
            table_ref: table_ref.clone(),
            last_rid,
        });
        Ok(())
    }

    // ------------- Indexes -------------
    /// Adds a logical index and the physical indexes of every combination of
    /// typed columns that currently backs its fields.
    pub fn create_index(
        &mut self,
        name: &str,
        unique: bool,
        fields: Vec<MetaIndexField>,
        factory: &IdentifierFactory,
    ) -> Result<()> {
        let Some(table_ref) = fields.first().map(|field| field.table_ref.clone()) else {
            return Err(DocShredError::Unsupported(format!("index {} has no fields", name)));
        };
        if fields.iter().any(|field| field.table_ref != table_ref) {
            return Err(DocShredError::Unsupported(format!(
                "index {} spans more than one document part",
                name
            )));
        }
        if self.view().index(name).is_some() {
            return Err(DocShredError::Invariant(format!("index {} already exists", name)));
        }
        self.get_or_create_doc_part(&table_ref, factory)?;
        self.collection_mut()?
            .indexes
            .insert(name.to_string(), Arc::new(MetaIndex::new(name, unique, fields)));
        let (database, collection) = self.change_key();
        self.changes.push(MetaChange::AddIndex {
            database,
            collection,
            name: name.to_string(),
        });
        self.create_missing_doc_part_indexes(&table_ref, factory)
    }
    /// Removes a logical index and the physical indexes no other index relies on.
    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        let (database, collection) = self.change_key();
        let removed = self
            .collection_mut()?
            .indexes
            .remove(name)
            .ok_or_else(|| DocShredError::Invariant(format!("index {} does not exist", name)))?;
        self.changes.push(MetaChange::DropIndex {
            database: database.clone(),
            collection: collection.clone(),
            index: Arc::clone(&removed),
        });
        let Some(table_ref) = removed.table_ref().cloned() else {
            return Ok(());
        };
        let Some(doc_part) = self.doc_part(&table_ref) else {
            return Ok(());
        };
        let orphans: Vec<MetaDocPartIndex> = doc_part
            .indexes
            .iter()
            .filter(|index| removed.is_implemented_by(doc_part, index))
            .filter(|index| !self.view().indexes().any(|other| other.is_implemented_by(doc_part, index)))
            .cloned()
            .collect();
        let doc_part = self.doc_part_mut(&table_ref)?;
        doc_part
            .indexes
            .retain(|index| !orphans.iter().any(|orphan| orphan.identifier == index.identifier));
        for index in orphans {
            self.changes.push(MetaChange::DropDocPartIndex {
                database: database.clone(),
                collection: collection.clone(),
                table_ref: table_ref.clone(),
                index,
            });
        }
        Ok(())
    }
    fn create_missing_doc_part_indexes(&mut self, table_ref: &TableRef, factory: &IdentifierFactory) -> Result<()> {
        for (unique, columns) in self.missing_doc_part_indexes(table_ref) {
            let doc_part = self.doc_part(table_ref).ok_or_else(|| {
                DocShredError::Invariant(format!("{} has no document part {}", self.collection, table_ref))
            })?;
            let base = index_base(&doc_part.identifier, &columns);
            let identifier = factory.generate(IdentifierKind::Index, &base, |taken| {
                self.database.uses_table_identifier(taken)
            })?;
            debug!(%table_ref, identifier = %identifier, "adding document part index");
            self.doc_part_mut(table_ref)?
                .indexes
                .push(MetaDocPartIndex::new(identifier.clone(), unique, columns));
            let (database, collection) = self.change_key();
            self.changes.push(MetaChange::AddDocPartIndex {
                database,
                collection,
                table_ref: table_ref.clone(),
                identifier,
            });
        }
        Ok(())
    }
    // every combination of typed columns for the fields of each index on the part
    fn missing_doc_part_indexes(&self, table_ref: &TableRef) -> Vec<(bool, Vec<MetaDocPartIndexColumn>)> {
        let Some(doc_part) = self.doc_part(table_ref) else {
            return Vec::new();
        };
        let mut missing: Vec<(bool, Vec<MetaDocPartIndexColumn>)> = Vec::new();
        for index in self.view().indexes().filter(|index| index.table_ref() == Some(table_ref)) {
            let mut combinations: Vec<Vec<MetaDocPartIndexColumn>> = vec![Vec::new()];
            for field in index.fields() {
                let typed: Vec<&MetaField> = doc_part
                    .fields_named(field.name())
                    .filter(|meta_field| meta_field.field_type != FieldType::Child)
                    .collect();
                combinations = combinations
                    .into_iter()
                    .flat_map(|prefix| {
                        typed.iter().map(move |meta_field| {
                            let mut columns = prefix.clone();
                            columns.push(MetaDocPartIndexColumn::new(meta_field.identifier.clone(), field.ordering()));
                            columns
                        })
                    })
                    .collect();
            }
            for columns in combinations {
                let exists = doc_part
                    .indexes
                    .iter()
                    .any(|existing| existing.unique == index.unique && existing.columns == columns);
                let pending = missing
                    .iter()
                    .any(|(unique, pending)| *unique == index.unique && *pending == columns);
                if !columns.is_empty() && !exists && !pending {
                    missing.push((index.unique, columns));
                }
            }
        }
        missing
    }
}
