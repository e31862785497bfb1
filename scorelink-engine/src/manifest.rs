//! Manifest Manager
//!
//! `manifest.json` maps every entry id to the artifacts each stage produced
//! for it. It is the authoritative id → artifact index; filenames only embed
//! ids as a debugging aid.
//!
//! **Write protocol:** one writer at a time (mutex), every update goes
//! through [`scorelink_common::atomic_file::write_atomic`] (temp file, fsync,
//! rename). The in-memory copy is only replaced after the rename succeeded,
//! so it always equals the last fully written file.
//!
//! **Corruption:** an unparsable manifest is moved aside to
//! `manifest.json.corrupt` and rebuilt from the stage directories by looking
//! for entry ids (full or short form) in artifact filenames. The manager then
//! runs in degraded mode.

use crate::error::{EngineError, Result};
use crate::registry::RegistrySnapshot;
use scorelink_common::entry_id::SHORT_ID_LEN;
use scorelink_common::{atomic_file, EntryId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Suffix of the preserved copy of an unparsable manifest
pub const CORRUPT_SUFFIX: &str = "corrupt";

const FULL_ID_LEN: usize = 36;

/// id → stage → artifact paths (sorted, de-duplicated)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<EntryId, BTreeMap<String, Vec<PathBuf>>>,
}

impl Manifest {
    pub fn get(&self, id: &EntryId) -> Option<&BTreeMap<String, Vec<PathBuf>>> {
        self.entries.get(id)
    }

    /// Artifacts of one stage for one entry
    pub fn artifacts(&self, id: &EntryId, stage: &str) -> &[PathBuf] {
        self.entries
            .get(id)
            .and_then(|stages| stages.get(stage))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Record an artifact; returns false when it was already listed
    pub fn insert(&mut self, id: EntryId, stage: &str, path: PathBuf) -> bool {
        let paths = self
            .entries
            .entry(id)
            .or_default()
            .entry(stage.to_string())
            .or_default();
        match paths.binary_search(&path) {
            Ok(_) => false,
            Err(position) => {
                paths.insert(position, path);
                true
            }
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &EntryId> {
        self.entries.keys()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn artifact_count(&self) -> usize {
        self.entries
            .values()
            .flat_map(|stages| stages.values())
            .map(Vec::len)
            .sum()
    }

    /// Number of entries with at least one artifact from `stage`
    pub fn stage_entry_count(&self, stage: &str) -> usize {
        self.entries
            .values()
            .filter(|stages| stages.get(stage).map_or(false, |p| !p.is_empty()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn retain_ids(&mut self, known: &HashSet<EntryId>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|id, _| known.contains(id));
        before - self.entries.len()
    }
}

/// Single-writer owner of `manifest.json`
#[derive(Debug)]
pub struct ManifestManager {
    path: PathBuf,
    known_ids: HashSet<EntryId>,
    state: Mutex<Manifest>,
    degraded: bool,
}

impl ManifestManager {
    /// Open (or create) the manifest at `path` for the entries of `snapshot`
    ///
    /// Entries for ids not in the snapshot are dropped. An unparsable file is
    /// preserved aside and the manifest is rebuilt by scanning
    /// `<output_dir>/<stage>/` for each of `stages`.
    pub fn open(
        path: &Path,
        snapshot: &RegistrySnapshot,
        output_dir: &Path,
        stages: &[&str],
    ) -> Result<Self> {
        let known_ids: HashSet<EntryId> = snapshot.ids().collect();
        let mut degraded = false;

        let mut manifest = if path.exists() {
            match Self::read_latest(path) {
                Ok(manifest) => manifest,
                Err(EngineError::RegistryCorruption(reason)) => {
                    let aside = corrupt_path_for(path);
                    warn!(
                        path = %path.display(),
                        preserved = %aside.display(),
                        reason = %reason,
                        "Manifest unparsable, reconstructing from artifact directories"
                    );
                    std::fs::rename(path, &aside)?;
                    degraded = true;
                    reconstruct(snapshot, output_dir, stages)
                }
                Err(e) => return Err(e),
            }
        } else {
            Manifest::default()
        };

        let dropped = manifest.retain_ids(&known_ids);
        if dropped > 0 {
            warn!(dropped = dropped, "Dropped manifest entries for ids not in the registry snapshot");
        }

        let manager = Self {
            path: path.to_path_buf(),
            known_ids,
            state: Mutex::new(manifest),
            degraded,
        };
        manager.persist()?;

        info!(
            path = %manager.path.display(),
            entries = manager.snapshot().entry_count(),
            degraded = degraded,
            "Manifest opened"
        );
        Ok(manager)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Manifest was rebuilt from artifact directories
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Record one artifact and atomically rewrite the manifest
    pub fn update(&self, id: EntryId, stage: &str, artifact: PathBuf) -> Result<()> {
        self.update_many(stage, std::iter::once((id, artifact)))
            .map(|_| ())
    }

    /// Record a batch of artifacts for one stage in a single atomic write
    ///
    /// Returns the number of newly recorded paths. Nothing is recorded when
    /// any id is unknown.
    pub fn update_many(
        &self,
        stage: &str,
        artifacts: impl IntoIterator<Item = (EntryId, PathBuf)>,
    ) -> Result<usize> {
        let artifacts: Vec<(EntryId, PathBuf)> = artifacts.into_iter().collect();
        if let Some((id, _)) = artifacts.iter().find(|(id, _)| !self.known_ids.contains(id)) {
            return Err(EngineError::UnknownEntry(*id));
        }

        let mut state = self.lock()?;
        let mut next = state.clone();
        let added = artifacts
            .into_iter()
            .filter(|(id, path)| next.insert(*id, stage, path.clone()))
            .count();

        if added > 0 {
            atomic_file::write_json_atomic(&self.path, &next)?;
            *state = next;
        }
        debug!(stage = %stage, added = added, "Manifest updated");
        Ok(added)
    }

    /// Rewrite the current state (no changes)
    pub fn persist(&self) -> Result<()> {
        let state = self.lock()?;
        atomic_file::write_json_atomic(&self.path, &*state)?;
        Ok(())
    }

    /// Copy of the last fully written state
    pub fn snapshot(&self) -> Manifest {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Read the latest complete manifest file without taking the writer lock
    pub fn read_latest(path: &Path) -> Result<Manifest> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            EngineError::RegistryCorruption(format!(
                "manifest {} is unparsable: {}",
                path.display(),
                e
            ))
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Manifest>> {
        self.state.lock().map_err(|_| {
            EngineError::Common(scorelink_common::Error::Internal(
                "manifest lock poisoned".to_string(),
            ))
        })
    }
}

/// `<path>.corrupt`
pub fn corrupt_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "manifest.json".into());
    name.push(".");
    name.push(CORRUPT_SUFFIX);
    path.with_file_name(name)
}

/// Rebuild a manifest by scanning stage directories for id-bearing filenames
pub fn reconstruct(snapshot: &RegistrySnapshot, output_dir: &Path, stages: &[&str]) -> Manifest {
    let full: HashSet<EntryId> = snapshot.ids().collect();

    // Short ids shared by several entries cannot be attributed
    let mut short: HashMap<String, Option<EntryId>> = HashMap::new();
    for id in &full {
        short
            .entry(id.short())
            .and_modify(|slot| *slot = None)
            .or_insert(Some(*id));
    }

    let mut manifest = Manifest::default();
    for stage in stages {
        let stage_dir = output_dir.join(stage);
        if !stage_dir.is_dir() {
            continue;
        }

        for entry in WalkDir::new(&stage_dir).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(stage = %stage, error = %e, "Error accessing artifact during reconstruction");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            match id_in_name(&name, &full, &short) {
                Some(id) => {
                    manifest.insert(id, stage, entry.path().to_path_buf());
                }
                None => debug!(stage = %stage, file = %name, "No entry id in artifact name"),
            }
        }
    }

    info!(
        entries = manifest.entry_count(),
        artifacts = manifest.artifact_count(),
        "Manifest reconstructed from artifact directories"
    );
    manifest
}

fn id_in_name(
    name: &str,
    full: &HashSet<EntryId>,
    short: &HashMap<String, Option<EntryId>>,
) -> Option<EntryId> {
    let lower = name.to_ascii_lowercase();

    for start in 0..lower.len() {
        if let Some(candidate) = lower.get(start..start + FULL_ID_LEN) {
            if let Ok(id) = candidate.parse::<EntryId>() {
                if full.contains(&id) {
                    return Some(id);
                }
            }
        }
    }

    for start in 0..lower.len() {
        if let Some(candidate) = lower.get(start..start + SHORT_ID_LEN) {
            if let Some(Some(id)) = short.get(candidate) {
                return Some(*id);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::*;
    use crate::registry::{SnapshotMetadata, UniversalEntry, UniversalRegistry};
    use scorelink_common::TieState;
    use tempfile::TempDir;

    fn snapshot(count: usize) -> RegistrySnapshot {
        let mut registry = UniversalRegistry::new();
        for i in 0..count {
            let id = registry.assign_id();
            let beat = i as f64;
            registry
                .insert(UniversalEntry::unmatched(
                    id,
                    score_note("C", beat, 1.0, TieState::None),
                    beat * 0.5,
                    beat * 0.5 + 0.5,
                ))
                .unwrap();
        }
        registry.freeze(Vec::new(), SnapshotMetadata::new(100.0, "proportional"))
    }

    #[test]
    fn test_insert_dedups_and_sorts() {
        let id = EntryId::generate();
        let mut manifest = Manifest::default();
        assert!(manifest.insert(id, "note_images", PathBuf::from("b.svg")));
        assert!(manifest.insert(id, "note_images", PathBuf::from("a.svg")));
        assert!(!manifest.insert(id, "note_images", PathBuf::from("b.svg")));

        assert_eq!(
            manifest.artifacts(&id, "note_images"),
            &[PathBuf::from("a.svg"), PathBuf::from("b.svg")]
        );
        assert_eq!(manifest.artifact_count(), 2);
        assert_eq!(manifest.stage_entry_count("note_images"), 1);
        assert!(manifest.artifacts(&id, "composite").is_empty());
    }

    #[test]
    fn test_manifest_json_shape() {
        let id = EntryId::generate();
        let mut manifest = Manifest::default();
        manifest.insert(id, "audio_features", PathBuf::from("/out/f.json"));

        let value = serde_json::to_value(&manifest).unwrap();
        assert_eq!(
            value[id.to_string()]["audio_features"][0],
            serde_json::json!("/out/f.json")
        );
    }

    #[test]
    fn test_open_creates_empty_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        let snapshot = snapshot(2);

        let manager = ManifestManager::open(&path, &snapshot, dir.path(), &[]).unwrap();

        assert!(path.exists());
        assert!(!manager.is_degraded());
        assert!(ManifestManager::read_latest(&path).unwrap().is_empty());
    }

    #[test]
    fn test_update_is_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        let snapshot = snapshot(2);
        let id = snapshot.all()[0].id;
        let manager = ManifestManager::open(&path, &snapshot, dir.path(), &[]).unwrap();

        manager
            .update(id, "coordinates", dir.path().join("coordinates/coords.json"))
            .unwrap();

        let on_disk = ManifestManager::read_latest(&path).unwrap();
        assert_eq!(on_disk, manager.snapshot());
        assert_eq!(on_disk.artifacts(&id, "coordinates").len(), 1);
        assert!(!atomic_file::temp_path_for(&path).exists());
    }

    #[test]
    fn test_unknown_id_rejected_without_partial_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        let snapshot = snapshot(1);
        let known = snapshot.all()[0].id;
        let manager = ManifestManager::open(&path, &snapshot, dir.path(), &[]).unwrap();

        let result = manager.update_many(
            "note_images",
            vec![
                (known, PathBuf::from("a.svg")),
                (EntryId::generate(), PathBuf::from("b.svg")),
            ],
        );

        assert!(matches!(result, Err(EngineError::UnknownEntry(_))));
        assert!(manager.snapshot().is_empty());
    }

    #[test]
    fn test_stale_ids_dropped_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        let mut stale = Manifest::default();
        stale.insert(EntryId::generate(), "note_images", PathBuf::from("old.svg"));
        atomic_file::write_json_atomic(&path, &stale).unwrap();

        let manager = ManifestManager::open(&path, &snapshot(1), dir.path(), &[]).unwrap();

        assert!(manager.snapshot().is_empty());
        assert!(ManifestManager::read_latest(&path).unwrap().is_empty());
    }

    #[test]
    fn test_id_in_name_full_and_short() {
        let snapshot = snapshot(2);
        let a = snapshot.all()[0].id;
        let b = snapshot.all()[1].id;
        let full: HashSet<EntryId> = snapshot.ids().collect();
        let short: HashMap<String, Option<EntryId>> =
            full.iter().map(|id| (id.short(), Some(*id))).collect();

        assert_eq!(id_in_name(&format!("note_{}.svg", a), &full, &short), Some(a));
        assert_eq!(id_in_name(&format!("{}.wav", b.short()), &full, &short), Some(b));
        assert_eq!(id_in_name("cover.png", &full, &short), None);
    }

    #[test]
    fn test_corrupt_path() {
        assert_eq!(
            corrupt_path_for(Path::new("/out/manifest.json")),
            PathBuf::from("/out/manifest.json.corrupt")
        );
    }
}
