//! Row identifiers of non-root document parts.
//!
//! Each document part keeps a counter of the rids handed out so far. Writers
//! consume contiguous blocks from it; a block is never handed out twice, so
//! rids are never reused, not even after the rows holding them are deleted.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Mutex;

use crate::error::{DocShredError, Result};
use crate::meta::MetaSnapshot;
use crate::reference::{RefHasher, TableRef};

// ------------- Blocks -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RidBlock {
    first: u64,
    len: u64,
}

impl RidBlock {
    pub fn new(first: u64, len: u64) -> Self {
        Self { first, len }
    }
    pub fn first(&self) -> u64 {
        self.first
    }
    pub fn len(&self) -> u64 {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    /// One past the last rid of the block, which is the counter value after consuming it.
    pub fn end(&self) -> u64 {
        self.first + self.len
    }
    pub fn contains(&self, rid: u64) -> bool {
        self.iter().contains(&rid)
    }
    pub fn get(&self, offset: u64) -> Option<u64> {
        (offset < self.len).then(|| self.first + offset)
    }
    pub fn iter(&self) -> Range<u64> {
        self.first..self.end()
    }
}

/// Hands out blocks of rids per document part.
pub trait RidGenerator {
    /// Returns a block of `count` rids starting at the current counter and
    /// advances the counter past it.
    fn consume_rids(&self, database: &str, collection: &str, table_ref: &TableRef, count: u64) -> Result<RidBlock>;
}

// ------------- In-memory generator -------------
type DocPartKey = (String, String, TableRef);

/// A generator that keeps its counters in memory, for translation without a backend.
#[derive(Debug, Default)]
pub struct InMemoryRidGenerator {
    counters: Mutex<HashMap<DocPartKey, u64, RefHasher>>,
}

impl InMemoryRidGenerator {
    pub fn new() -> Self {
        Self::default()
    }
    /// Seeds the counters with the values of a metadata snapshot.
    pub fn from_snapshot(snapshot: &MetaSnapshot) -> Result<Self> {
        let generator = Self::new();
        for database in snapshot.databases() {
            for collection in database.collections() {
                for doc_part in collection.doc_parts() {
                    generator.seed(database.name(), collection.name(), doc_part.table_ref(), doc_part.last_rid())?;
                }
            }
        }
        Ok(generator)
    }
    /// Raises a counter to at least `last_rid`.
    pub fn seed(&self, database: &str, collection: &str, table_ref: &TableRef, last_rid: u64) -> Result<()> {
        let mut counters = self.counters.lock()?;
        let counter = counters
            .entry((database.to_string(), collection.to_string(), table_ref.clone()))
            .or_insert(0);
        *counter = (*counter).max(last_rid);
        Ok(())
    }
    pub fn last_rid(&self, database: &str, collection: &str, table_ref: &TableRef) -> Result<u64> {
        let counters = self.counters.lock()?;
        Ok(counters
            .get(&(database.to_string(), collection.to_string(), table_ref.clone()))
            .copied()
            .unwrap_or(0))
    }
    /// Moves the counters of a renamed collection; the target keeps the larger value.
    pub fn rebase(&self, from: (&str, &str), to: (&str, &str)) -> Result<()> {
        let mut counters = self.counters.lock()?;
        let moved: Vec<(TableRef, u64)> = counters
            .iter()
            .filter(|((database, collection, _), _)| database == from.0 && collection == from.1)
            .map(|((_, _, table_ref), last_rid)| (table_ref.clone(), *last_rid))
            .collect();
        for (table_ref, last_rid) in moved {
            counters.remove(&(from.0.to_string(), from.1.to_string(), table_ref.clone()));
            let counter = counters
                .entry((to.0.to_string(), to.1.to_string(), table_ref))
                .or_insert(0);
            *counter = (*counter).max(last_rid);
        }
        Ok(())
    }
}

impl RidGenerator for InMemoryRidGenerator {
    fn consume_rids(&self, database: &str, collection: &str, table_ref: &TableRef, count: u64) -> Result<RidBlock> {
        let mut counters = self.counters.lock()?;
        let counter = counters
            .entry((database.to_string(), collection.to_string(), table_ref.clone()))
            .or_insert(0);
        let first = *counter;
        *counter = first.checked_add(count).ok_or_else(|| {
            DocShredError::Invariant(format!("rid counter of {} would overflow", table_ref))
        })?;
        Ok(RidBlock::new(first, count))
    }
}
