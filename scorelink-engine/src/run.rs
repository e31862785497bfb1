//! Run orchestration
//!
//! A run has two phases:
//!
//! 1. **Registry:** load inputs, match, resolve ties, freeze and write the
//!    snapshot (or reuse an existing snapshot file).
//! 2. **Pipeline:** open the manifest, execute the stage graph, write the
//!    final `entries.json` and `run_report.json`.
//!
//! Output directory layout:
//!
//! ```text
//! <output_dir>/
//!   registry.json        frozen snapshot (read-only)
//!   manifest.json        id -> stage -> artifact paths
//!   entries.json         snapshot entries with artifact paths filled in
//!   run_report.json      execution report, match summary, progress
//!   execution_log.jsonl  structured log (binary only)
//!   <stage>/             artifacts of each stage
//! ```

use crate::error::{MatchError, Result, TimingAmbiguityError};
use crate::input::{self, PerformanceDocument, ScoreDocument};
use crate::manifest::ManifestManager;
use crate::matching::{MatchReport, MatchingEngine};
use crate::pipeline::{
    ExecutionReport, PipelineEvent, RunContext, StageExecutor, StageGraph, StageKind,
};
use crate::progress::ProgressSnapshot;
use crate::registry::{RegistrySnapshot, SnapshotMetadata, UniversalRegistry};
use crate::ties::TiedNoteResolver;
use scorelink_common::atomic_file;
use scorelink_common::config::{ExecutionMode, TomlConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const REGISTRY_FILE: &str = "registry.json";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const ENTRIES_FILE: &str = "entries.json";
pub const REPORT_FILE: &str = "run_report.json";
pub const EXECUTION_LOG_FILE: &str = "execution_log.jsonl";

/// File locations inside an output directory
#[derive(Debug, Clone, PartialEq)]
pub struct RunLayout {
    output_dir: PathBuf,
}

impl RunLayout {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn registry(&self) -> PathBuf {
        self.output_dir.join(REGISTRY_FILE)
    }

    pub fn manifest(&self) -> PathBuf {
        self.output_dir.join(MANIFEST_FILE)
    }

    pub fn entries(&self) -> PathBuf {
        self.output_dir.join(ENTRIES_FILE)
    }

    pub fn report(&self) -> PathBuf {
        self.output_dir.join(REPORT_FILE)
    }

    pub fn execution_log(&self) -> PathBuf {
        self.output_dir.join(EXECUTION_LOG_FILE)
    }

    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }
}

/// Where the registry snapshot comes from
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrySource {
    /// Build it from score and performance documents
    Inputs { score: PathBuf, performance: PathBuf },
    /// Reuse a snapshot written by an earlier run
    Snapshot(PathBuf),
}

/// Everything a run needs besides cancellation and events
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub source: RegistrySource,
    pub output_dir: PathBuf,
    pub mode: ExecutionMode,
    pub config: TomlConfig,
}

/// Registry-phase results kept for the run report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub report: MatchReport,
    pub match_errors: Vec<MatchError>,
    pub ambiguities: Vec<TimingAmbiguityError>,
    pub tied_groups: usize,
    pub broken_chains: usize,
}

/// Contents of `run_report.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub execution: ExecutionReport,
    /// Absent when the snapshot was reused
    #[serde(default)]
    pub matching: Option<MatchSummary>,
    pub progress: ProgressSnapshot,
    pub entries: usize,
    pub manifest_degraded: bool,
    pub snapshot: PathBuf,
    pub manifest: PathBuf,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.execution.success
    }
}

/// Match, resolve ties and freeze
pub fn build_registry(
    score: &ScoreDocument,
    performance: &PerformanceDocument,
    config: &TomlConfig,
) -> Result<(RegistrySnapshot, MatchSummary)> {
    let mut registry = UniversalRegistry::new();
    let engine = MatchingEngine::from_settings(&config.matching);
    let output = engine.match_notes(&mut registry, &score.notes, &score.tempo, &performance.notes)?;

    let mut entries = output.entries;
    let resolver = TiedNoteResolver::from_kind(config.matching.tie_policy);
    let resolved = resolver.resolve(&mut entries, &score.tempo);

    let mut report = output.report;
    let mut match_errors = output.match_errors;
    if !resolved.unlinked.is_empty() {
        for id in &resolved.unlinked {
            if let Some(entry) = entries.iter().find(|e| e.id == *id) {
                match_errors.push(engine.match_error(entry)?);
            }
        }
        report.recount(&entries);
        warn!(
            unlinked = resolved.unlinked.len(),
            unmatched = report.unmatched,
            "Broken tie chains left continuations unmatched"
        );
        engine.warn_unmatched_rate(&report);
    }
    registry.insert_all(entries)?;

    let mut metadata = SnapshotMetadata::new(engine.tolerance_ms(), resolver.policy_name());
    metadata.score_source = score.source.clone();
    metadata.performance_source = performance.source.clone();
    metadata.coordinate_transform = score.coordinate_transform.clone();

    let summary = MatchSummary {
        report,
        match_errors,
        ambiguities: resolved.ambiguities,
        tied_groups: resolved.groups.len(),
        broken_chains: resolved.broken_chains.len(),
    };
    let snapshot = registry.freeze(resolved.groups, metadata);

    info!(
        entries = snapshot.len(),
        tied_groups = summary.tied_groups,
        broken_chains = summary.broken_chains,
        ambiguities = summary.ambiguities.len(),
        "Registry frozen"
    );
    Ok((snapshot, summary))
}

/// Load inputs, build the registry and write the snapshot
///
/// This is the whole of `scorelink match`.
pub fn match_inputs(
    score: &Path,
    performance: &Path,
    layout: &RunLayout,
    config: &TomlConfig,
) -> Result<(Arc<RegistrySnapshot>, MatchSummary)> {
    layout.ensure()?;
    let score = input::load_score(score)?;
    let performance = input::load_performance(performance)?;

    let (snapshot, summary) = build_registry(&score, &performance, config)?;
    snapshot.write(&layout.registry())?;
    Ok((Arc::new(snapshot), summary))
}

/// Full run: registry phase, then the stage graph
///
/// The returned report is also written to `run_report.json`. Stage failures
/// are reported, not returned as errors.
pub async fn run(
    options: &RunOptions,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<PipelineEvent>>,
) -> Result<RunReport> {
    let layout = RunLayout::new(&options.output_dir);
    layout.ensure()?;

    let mut graph = StageGraph::build(&options.config)?;

    let (snapshot, snapshot_path, matching) = match &options.source {
        RegistrySource::Inputs { score, performance } => {
            let (snapshot, summary) = match_inputs(score, performance, &layout, &options.config)?;
            (snapshot, layout.registry(), Some(summary))
        }
        RegistrySource::Snapshot(path) => {
            let snapshot = RegistrySnapshot::load(path)?;
            info!(path = %path.display(), entries = snapshot.len(), "Reusing registry snapshot");
            (Arc::new(snapshot), path.clone(), None)
        }
    };

    let stage_names = StageKind::ALL.map(StageKind::name);
    let manifest = Arc::new(ManifestManager::open(
        &layout.manifest(),
        &snapshot,
        layout.output_dir(),
        &stage_names,
    )?);
    if manifest.is_degraded() {
        warn!(path = %manifest.path().display(), "Running with a reconstructed manifest");
    }

    let run_context = RunContext {
        snapshot: snapshot_path.clone(),
        output_dir: layout.output_dir().to_path_buf(),
        manifest: layout.manifest(),
    };
    let mut executor = StageExecutor::new(
        snapshot.clone(),
        manifest.clone(),
        run_context,
        options.config.pipeline.clone(),
    )
    .with_cancel(cancel);
    if let Some(tx) = events {
        executor = executor.with_events(tx);
    }

    let execution = executor.execute(&mut graph, options.mode).await?;
    manifest.persist()?;

    let entries = snapshot.entries_with_artifacts(&manifest.snapshot());
    atomic_file::write_json_atomic(&layout.entries(), &entries)?;

    let report = RunReport {
        execution,
        matching,
        progress: executor.progress().snapshot(),
        entries: snapshot.len(),
        manifest_degraded: manifest.is_degraded(),
        snapshot: snapshot_path,
        manifest: layout.manifest(),
    };
    atomic_file::write_json_atomic(&layout.report(), &report)?;

    info!(
        success = report.success(),
        report = %layout.report().display(),
        "Run finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = RunLayout::new("/tmp/out");
        assert_eq!(layout.registry(), PathBuf::from("/tmp/out/registry.json"));
        assert_eq!(layout.manifest(), PathBuf::from("/tmp/out/manifest.json"));
        assert_eq!(layout.report(), PathBuf::from("/tmp/out/run_report.json"));
        assert_eq!(layout.execution_log(), PathBuf::from("/tmp/out/execution_log.jsonl"));
    }

    #[test]
    fn test_build_registry_links_ties() {
        let score = input::parse_score(
            r#"{
                "tempo_map": [{"beat": 0.0, "bpm": 120.0}],
                "notes": [
                    {"part_id": "P1", "measure": 1, "pitch": "C", "octave": 4,
                     "beat_position": 0.0, "notated_duration": 1.0, "tie_state": "start"},
                    {"part_id": "P1", "measure": 1, "pitch": "C", "octave": 4,
                     "beat_position": 1.0, "notated_duration": 1.0, "tie_state": "stop"},
                    {"part_id": "P1", "measure": 1, "pitch": "E", "octave": 4,
                     "beat_position": 2.0, "notated_duration": 1.0, "tie_state": "none"}
                ]
            }"#,
        )
        .unwrap();
        let performance = input::parse_performance(
            r#"{"notes": [
                {"pitch": 60, "velocity": 80, "start_time_abs": 0.0, "end_time_abs": 1.0},
                {"pitch": 64, "velocity": 80, "start_time_abs": 1.02, "end_time_abs": 1.5}
            ]}"#,
        )
        .unwrap();

        let (snapshot, summary) = build_registry(&score, &performance, &TomlConfig::default()).unwrap();

        assert_eq!(snapshot.len(), 3);
        assert_eq!(summary.tied_groups, 1);
        assert_eq!(summary.report.matched(), 3);
        assert_eq!(summary.report.tie_continuations, 1);
        assert!(summary.match_errors.is_empty());

        let group = &snapshot.tied_groups()[0];
        assert_eq!(group.len(), 2);
        for id in &group.members {
            let entry = snapshot.get(id).unwrap();
            assert!((entry.computed_offset - 1.0).abs() < 1e-9);
        }
        assert_eq!(snapshot.metadata().tie_policy, "proportional");
    }

    #[test]
    fn test_broken_chain_counts_match_snapshot() {
        let score = input::parse_score(
            r#"{
                "tempo_map": [{"beat": 0.0, "bpm": 120.0}],
                "notes": [
                    {"part_id": "P1", "measure": 1, "pitch": "C", "octave": 4,
                     "beat_position": 0.0, "notated_duration": 1.0, "tie_state": "start"},
                    {"part_id": "P1", "measure": 1, "pitch": "C", "octave": 4,
                     "beat_position": 1.0, "notated_duration": 1.0, "tie_state": "continue"}
                ]
            }"#,
        )
        .unwrap();
        let performance = input::parse_performance(
            r#"{"notes": [
                {"pitch": 60, "velocity": 80, "start_time_abs": 0.0, "end_time_abs": 1.0}
            ]}"#,
        )
        .unwrap();

        let (snapshot, summary) = build_registry(&score, &performance, &TomlConfig::default()).unwrap();

        assert_eq!(summary.broken_chains, 1);
        let unmatched: Vec<_> = snapshot
            .all()
            .iter()
            .filter(|e| e.match_method == crate::registry::MatchMethod::Unmatched)
            .collect();
        assert_eq!(unmatched.len(), 1);
        assert_eq!(summary.report.unmatched, 1);
        assert_eq!(summary.report.exact, 1);
        assert_eq!(summary.report.unmatched_rate(), 0.5);
        assert_eq!(summary.match_errors.len(), 1);
        assert_eq!(summary.match_errors[0].entry_id, unmatched[0].id);
        assert_eq!(summary.match_errors[0].midi_pitch, 60);
    }
}
