//! The committed metadata shared by all transactions.
//!
//! Transactions read an `Arc` of the committed snapshot and work on their own
//! overlay. After a successful commit the overlay's change log is merged back.
//! Every commit that changes the schema also bumps a version counter stored
//! next to the metadata tables; when merges arrive out of order, or a merge
//! fails, the repository is marked stale and the next transaction reloads it
//! from the metadata tables.

use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::error::{DocShredError, Result};
use crate::meta::{MetaCollection, MetaDatabase, MetaDocPart, MetaSnapshot};
use crate::mutable::{MetaChange, MutableMetaSnapshot};
use crate::reference::TableRef;

#[derive(Debug)]
struct Committed {
    snapshot: Arc<MetaSnapshot>,
    version: u64,
    stale: bool,
}

#[derive(Debug)]
pub struct MetaRepository {
    committed: RwLock<Committed>,
}

impl MetaRepository {
    pub fn new(snapshot: MetaSnapshot, version: u64) -> Self {
        Self {
            committed: RwLock::new(Committed {
                snapshot: Arc::new(snapshot),
                version,
                stale: false,
            }),
        }
    }
    pub fn snapshot(&self) -> Result<Arc<MetaSnapshot>> {
        Ok(Arc::clone(&self.committed.read()?.snapshot))
    }
    /// The committed snapshot, provided it reflects the stored `version`.
    pub fn snapshot_at(&self, version: u64) -> Result<Option<Arc<MetaSnapshot>>> {
        let committed = self.committed.read()?;
        if committed.stale || committed.version != version {
            return Ok(None);
        }
        Ok(Some(Arc::clone(&committed.snapshot)))
    }
    pub fn replace(&self, snapshot: MetaSnapshot, version: u64) -> Result<Arc<MetaSnapshot>> {
        let mut committed = self.committed.write()?;
        // a concurrent merge may already have moved past what was loaded
        if !committed.stale && committed.version > version {
            return Ok(Arc::clone(&committed.snapshot));
        }
        debug!(version, "metadata reloaded");
        committed.snapshot = Arc::new(snapshot);
        committed.version = version;
        committed.stale = false;
        Ok(Arc::clone(&committed.snapshot))
    }
    pub fn mark_stale(&self) -> Result<()> {
        self.committed.write()?.stale = true;
        Ok(())
    }
    /// Applies the changes of a committed overlay. `version` is the stored
    /// version the commit produced.
    pub fn merge(&self, overlay: &MutableMetaSnapshot, version: u64) -> Result<()> {
        let mut committed = self.committed.write()?;
        let structural = overlay.has_structural_changes();
        if structural && (committed.stale || committed.version + 1 != version) {
            debug!(version, current = committed.version, "metadata merge out of order, marking stale");
            committed.stale = true;
            committed.version = committed.version.max(version);
            return Ok(());
        }
        let mut snapshot = (*committed.snapshot).clone();
        for change in overlay.changes() {
            if let Err(e) = apply(&mut snapshot, overlay.snapshot(), change) {
                warn!(error = %e, "metadata merge failed, marking stale");
                committed.stale = true;
                return Err(e);
            }
        }
        committed.snapshot = Arc::new(snapshot);
        if structural {
            committed.version = version;
        }
        Ok(())
    }
}

fn conflict(what: String) -> DocShredError {
    DocShredError::Invariant(format!("committed metadata conflicts with {}", what))
}

fn database_mut<'a>(snapshot: &'a mut MetaSnapshot, database: &str) -> Result<&'a mut MetaDatabase> {
    snapshot
        .databases
        .get_mut(database)
        .map(Arc::make_mut)
        .ok_or_else(|| DocShredError::UnknownDatabase(database.to_string()))
}

fn collection_mut<'a>(snapshot: &'a mut MetaSnapshot, database: &str, collection: &str) -> Result<&'a mut MetaCollection> {
    database_mut(snapshot, database)?
        .collections
        .get_mut(collection)
        .map(Arc::make_mut)
        .ok_or_else(|| DocShredError::UnknownCollection {
            database: database.to_string(),
            collection: collection.to_string(),
        })
}

fn doc_part_mut<'a>(
    snapshot: &'a mut MetaSnapshot,
    database: &str,
    collection: &str,
    table_ref: &TableRef,
) -> Result<&'a mut MetaDocPart> {
    collection_mut(snapshot, database, collection)?
        .doc_parts
        .get_mut(table_ref)
        .map(Arc::make_mut)
        .ok_or_else(|| conflict(format!("missing document part {}", table_ref)))
}

fn source_doc_part<'a>(
    overlay: &'a MetaSnapshot,
    database: &str,
    collection: &str,
    table_ref: &TableRef,
) -> Option<&'a MetaDocPart> {
    overlay
        .collection(database, collection)
        .and_then(|c| c.doc_part(table_ref))
}

// Applies one change. Re-applying an identical change is a no-op, and changes
// to entities the same transaction dropped later are skipped.
fn apply(into: &mut MetaSnapshot, overlay: &MetaSnapshot, change: &MetaChange) -> Result<()> {
    match change {
        MetaChange::AddDatabase { database } => {
            let Some(source) = overlay.database(database) else {
                return Ok(());
            };
            match into.database(database) {
                Some(existing) if existing.identifier != source.identifier => {
                    return Err(conflict(format!("database {}", database)));
                }
                Some(_) => {}
                None => {
                    into.databases.insert(
                        database.clone(),
                        Arc::new(MetaDatabase::new(database.clone(), source.identifier.clone())),
                    );
                }
            }
        }
        MetaChange::AddCollection { database, collection } => {
            let Some(source) = overlay.collection(database, collection) else {
                return Ok(());
            };
            let target = database_mut(into, database)?;
            match target.collection(collection) {
                Some(existing) if existing.identifier != source.identifier => {
                    return Err(conflict(format!("collection {}.{}", database, collection)));
                }
                Some(_) => {}
                None => {
                    target.collections.insert(
                        collection.clone(),
                        Arc::new(MetaCollection::new(collection.clone(), source.identifier.clone())),
                    );
                }
            }
        }
        MetaChange::AddDocPart { database, collection, table_ref } => {
            let Some(source) = source_doc_part(overlay, database, collection, table_ref) else {
                return Ok(());
            };
            let target = collection_mut(into, database, collection)?;
            match target.doc_part(table_ref) {
                Some(existing) if existing.identifier != source.identifier => {
                    return Err(conflict(format!("document part {}", table_ref)));
                }
                Some(_) => {}
                None => {
                    target.doc_parts.insert(
                        table_ref.clone(),
                        Arc::new(MetaDocPart::new(table_ref.clone(), source.identifier.clone())),
                    );
                }
            }
        }
        MetaChange::AddField { database, collection, table_ref, name, field_type } => {
            let Some(field) = source_doc_part(overlay, database, collection, table_ref)
                .and_then(|part| part.field(name, *field_type))
                .cloned()
            else {
                return Ok(());
            };
            let target = doc_part_mut(into, database, collection, table_ref)?;
            match target.field(name, *field_type) {
                Some(existing) if *existing != field => return Err(conflict(format!("field {}", name))),
                Some(_) => {}
                None => target.fields.push(field),
            }
        }
        MetaChange::AddScalar { database, collection, table_ref, field_type } => {
            let Some(scalar) = source_doc_part(overlay, database, collection, table_ref)
                .and_then(|part| part.scalar(*field_type))
                .cloned()
            else {
                return Ok(());
            };
            let target = doc_part_mut(into, database, collection, table_ref)?;
            match target.scalar(*field_type) {
                Some(existing) if *existing != scalar => {
                    return Err(conflict(format!("scalar {}", field_type)));
                }
                Some(_) => {}
                None => target.scalars.push(scalar),
            }
        }
        MetaChange::AddIndex { database, collection, name } => {
            let Some(index) = overlay
                .collection(database, collection)
                .and_then(|c| c.index(name))
                .cloned()
            else {
                return Ok(());
            };
            let target = collection_mut(into, database, collection)?;
            match target.index(name) {
                Some(existing) if *existing != index => return Err(conflict(format!("index {}", name))),
                Some(_) => {}
                None => {
                    target.indexes.insert(name.clone(), Arc::new(index));
                }
            }
        }
        MetaChange::AddDocPartIndex { database, collection, table_ref, identifier } => {
            let Some(index) = source_doc_part(overlay, database, collection, table_ref)
                .and_then(|part| part.index(identifier))
                .cloned()
            else {
                return Ok(());
            };
            let target = doc_part_mut(into, database, collection, table_ref)?;
            if target.index(identifier).is_none() {
                target.indexes.push(index);
            }
        }
        MetaChange::DropIndex { database, collection, index } => {
            collection_mut(into, database, collection)?.indexes.remove(&index.name);
        }
        MetaChange::DropDocPartIndex { database, collection, table_ref, index } => {
            doc_part_mut(into, database, collection, table_ref)?
                .indexes
                .retain(|existing| existing.identifier != index.identifier);
        }
        MetaChange::DropCollection { database, collection } => {
            database_mut(into, database)?.collections.remove(&collection.name);
        }
        MetaChange::DropDatabase { database } => {
            into.databases.remove(&database.name);
        }
        MetaChange::RenameCollection { from_database, from_collection, to_database, to_collection } => {
            database_mut(into, from_database)?.collections.remove(&from_collection.name);
            if let Some(target) = overlay
                .database(to_database)
                .and_then(|db| db.collections.get(to_collection))
            {
                database_mut(into, to_database)?
                    .collections
                    .insert(to_collection.clone(), Arc::clone(target));
            }
        }
        MetaChange::LastRid { database, collection, table_ref, last_rid } => {
            // the part may have been dropped later in the same transaction
            if let Ok(target) = doc_part_mut(into, database, collection, table_ref) {
                target.last_rid = target.last_rid.max(*last_rid);
            }
        }
    }
    Ok(())
}
