//! Frozen registry snapshot and its on-disk form

use super::UniversalEntry;
use crate::error::{EngineError, Result};
use crate::manifest::Manifest;
use crate::ties::TiedGroup;
use chrono::{DateTime, Utc};
use scorelink_common::{atomic_file, EntryId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Snapshot file format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Provenance recorded alongside the frozen entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: DateTime<Utc>,
    pub tolerance_ms: f64,
    pub tie_policy: String,
    #[serde(default)]
    pub score_source: Option<PathBuf>,
    #[serde(default)]
    pub performance_source: Option<PathBuf>,
    /// Opaque coordinate-transform descriptor from the score parser
    #[serde(default)]
    pub coordinate_transform: Option<serde_json::Value>,
}

impl SnapshotMetadata {
    pub fn new(tolerance_ms: f64, tie_policy: &str) -> Self {
        Self {
            created_at: Utc::now(),
            tolerance_ms,
            tie_policy: tie_policy.to_string(),
            score_source: None,
            performance_source: None,
            coordinate_transform: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    metadata: SnapshotMetadata,
    entries: Vec<UniversalEntry>,
    tied_groups: Vec<TiedGroup>,
}

/// Immutable registry view shared by every downstream component
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySnapshot {
    metadata: SnapshotMetadata,
    entries: Vec<UniversalEntry>,
    tied_groups: Vec<TiedGroup>,
    index: HashMap<EntryId, usize>,
}

impl RegistrySnapshot {
    pub(crate) fn new(
        entries: Vec<UniversalEntry>,
        tied_groups: Vec<TiedGroup>,
        metadata: SnapshotMetadata,
    ) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();
        Self {
            metadata,
            entries,
            tied_groups,
            index,
        }
    }

    pub fn get(&self, id: &EntryId) -> Option<&UniversalEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn all(&self) -> &[UniversalEntry] {
        &self.entries
    }

    pub fn ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    pub fn tied_groups(&self) -> &[TiedGroup] {
        &self.tied_groups
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries with `artifact_paths` filled in from the manifest
    pub fn entries_with_artifacts(&self, manifest: &Manifest) -> Vec<UniversalEntry> {
        self.entries
            .iter()
            .map(|entry| {
                let mut entry = entry.clone();
                if let Some(stages) = manifest.get(&entry.id) {
                    entry.artifact_paths = stages.clone();
                }
                entry
            })
            .collect()
    }

    /// Write the snapshot atomically and mark the file read-only
    pub fn write(&self, path: &Path) -> Result<()> {
        let file = SnapshotFile {
            version: SNAPSHOT_VERSION,
            metadata: self.metadata.clone(),
            entries: self.entries.clone(),
            tied_groups: self.tied_groups.clone(),
        };
        atomic_file::write_json_atomic(path, &file)?;

        let mut permissions = std::fs::metadata(path)?.permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(path, permissions)?;

        info!(
            path = %path.display(),
            entries = self.entries.len(),
            tied_groups = self.tied_groups.len(),
            "Registry snapshot written"
        );
        Ok(())
    }

    /// Read a snapshot written by [`RegistrySnapshot::write`]
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: SnapshotFile = serde_json::from_str(&content).map_err(|e| {
            EngineError::RegistryCorruption(format!(
                "snapshot {} is unparsable: {}",
                path.display(),
                e
            ))
        })?;

        if file.version != SNAPSHOT_VERSION {
            return Err(EngineError::RegistryCorruption(format!(
                "snapshot {} has version {}, expected {}",
                path.display(),
                file.version,
                SNAPSHOT_VERSION
            )));
        }

        let snapshot = Self::new(file.entries, file.tied_groups, file.metadata);
        if snapshot.index.len() != snapshot.entries.len() {
            return Err(EngineError::RegistryCorruption(format!(
                "snapshot {} contains duplicate entry ids",
                path.display()
            )));
        }
        Ok(snapshot)
    }
}
