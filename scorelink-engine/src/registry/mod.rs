//! Universal registry
//!
//! The registry is the only issuer of [`EntryId`]s. It has two phases:
//!
//! 1. **Building** ([`UniversalRegistry`]): the matching engine asks for ids,
//!    the tie resolver adjusts timings, entries are inserted.
//! 2. **Frozen** ([`RegistrySnapshot`]): immutable, shared by `Arc`, and
//!    written once to a read-only snapshot file for downstream stages.
//!
//! Ids are never reused: discarding an entry keeps its id reserved.

mod entry;
mod snapshot;

#[cfg(test)]
pub(crate) use entry::test_support;
pub use entry::{MatchMethod, UniversalEntry};
pub use snapshot::{RegistrySnapshot, SnapshotMetadata, SNAPSHOT_VERSION};

use crate::error::{EngineError, Result};
use crate::ties::TiedGroup;
use scorelink_common::EntryId;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Mutable registry used while matching and tie resolution run
#[derive(Debug, Default)]
pub struct UniversalRegistry {
    issued: HashSet<EntryId>,
    discarded: HashSet<EntryId>,
    entries: Vec<UniversalEntry>,
    index: HashMap<EntryId, usize>,
}

impl UniversalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh id that has never been issued by this registry
    pub fn assign_id(&mut self) -> EntryId {
        loop {
            let id = EntryId::generate();
            if self.issued.insert(id) {
                return id;
            }
            debug!(id = %id, "Regenerating colliding entry id");
        }
    }

    /// Number of ids issued so far (including discarded ones)
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }

    /// Add an entry whose id was issued by this registry
    pub fn insert(&mut self, entry: UniversalEntry) -> Result<()> {
        let id = entry.id;
        if !self.issued.contains(&id) {
            return Err(EngineError::InvalidEntry {
                id,
                reason: "id was not issued by this registry".to_string(),
            });
        }
        if self.discarded.contains(&id) {
            return Err(EngineError::InvalidEntry {
                id,
                reason: "id belongs to a discarded entry".to_string(),
            });
        }
        if self.index.contains_key(&id) {
            return Err(EngineError::InvalidEntry {
                id,
                reason: "entry already registered".to_string(),
            });
        }
        self.index.insert(id, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    pub fn insert_all(&mut self, entries: impl IntoIterator<Item = UniversalEntry>) -> Result<()> {
        for entry in entries {
            self.insert(entry)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &EntryId) -> Option<&UniversalEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// All entries in insertion (score) order
    pub fn all(&self) -> &[UniversalEntry] {
        &self.entries
    }

    /// Mutable view for the tie resolver
    pub fn entries_mut(&mut self) -> &mut [UniversalEntry] {
        &mut self.entries
    }

    /// Drop an entry's performance link; it keeps its id and estimate timing
    pub fn mark_unmatched(&mut self, id: &EntryId) -> Result<()> {
        let index = *self.index.get(id).ok_or(EngineError::UnknownEntry(*id))?;
        self.entries[index].reset_to_estimate();
        Ok(())
    }

    /// Remove an entry; its id stays reserved and is never issued again
    pub fn discard(&mut self, id: &EntryId) -> Option<UniversalEntry> {
        let index = self.index.remove(id)?;
        self.discarded.insert(*id);
        let entry = self.entries.remove(index);
        for slot in self.index.values_mut() {
            if *slot > index {
                *slot -= 1;
            }
        }
        Some(entry)
    }

    /// Freeze into an immutable snapshot
    pub fn freeze(self, tied_groups: Vec<TiedGroup>, metadata: SnapshotMetadata) -> RegistrySnapshot {
        RegistrySnapshot::new(self.entries, tied_groups, metadata)
    }
}
