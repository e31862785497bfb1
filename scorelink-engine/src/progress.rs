//! Progress Tracker
//!
//! Aggregates per-stage completion counters for reporting. Tracking is
//! best-effort: unknown stages, duplicate items and a poisoned lock are
//! logged and ignored, never returned to the caller.

use chrono::{DateTime, Utc};
use scorelink_common::EntryId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Stage phase as seen by the tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StagePhase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Counters for one stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub phase: StagePhase,
    /// Entries the stage produces artifacts for
    pub total: usize,
    pub completed: usize,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StageProgress {
    /// Format as human-readable string
    pub fn display_string(&self) -> String {
        match self.phase {
            StagePhase::Pending => "pending".to_string(),
            StagePhase::Running => format!("running {} of {}", self.completed, self.total),
            StagePhase::Completed => format!("completed {} of {}", self.completed, self.total),
            StagePhase::Failed => format!(
                "failed after {} of {}: {}",
                self.completed,
                self.total,
                self.reason.as_deref().unwrap_or("unknown")
            ),
            StagePhase::Skipped => format!("skipped: {}", self.reason.as_deref().unwrap_or("unknown")),
        }
    }
}

/// Point-in-time copy of every stage's counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub stages: BTreeMap<String, StageProgress>,
}

impl ProgressSnapshot {
    pub fn items_completed(&self) -> usize {
        self.stages.values().map(|s| s.completed).sum()
    }

    pub fn items_total(&self) -> usize {
        self.stages.values().map(|s| s.total).sum()
    }

    /// Completed fraction over all started stages (0.0 when nothing started)
    pub fn fraction(&self) -> f64 {
        let total = self.items_total();
        if total == 0 {
            0.0
        } else {
            self.items_completed() as f64 / total as f64
        }
    }

    /// Format as human-readable string, one stage per line
    pub fn display_string(&self) -> String {
        self.stages
            .iter()
            .map(|(name, progress)| format!("{}: {}", name, progress.display_string()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    stages: BTreeMap<String, StageProgress>,
    seen: BTreeMap<String, HashSet<EntryId>>,
}

/// Thread-safe progress aggregation
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    state: Arc<Mutex<TrackerState>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker with every stage registered as pending
    pub fn with_stages<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let tracker = Self::new();
        if let Some(mut state) = tracker.lock() {
            for name in names {
                state.stages.insert(name.to_string(), StageProgress::default());
            }
        }
        tracker
    }

    pub fn stage_started(&self, name: &str, total: usize) {
        let Some(mut state) = self.lock() else { return };
        let progress = state.stages.entry(name.to_string()).or_default();
        progress.phase = StagePhase::Running;
        progress.total = total;
        progress.completed = 0;
        progress.reason = None;
        progress.started_at = Some(Utc::now());
        state.seen.insert(name.to_string(), HashSet::new());
    }

    pub fn item_completed(&self, name: &str, id: EntryId) {
        let Some(mut state) = self.lock() else { return };
        let TrackerState { stages, seen } = &mut *state;
        let Some(progress) = stages.get_mut(name) else {
            warn!(stage = %name, entry_id = %id, "Progress for unknown stage ignored");
            return;
        };
        if !seen.entry(name.to_string()).or_default().insert(id) {
            warn!(stage = %name, entry_id = %id, "Duplicate item completion ignored");
            return;
        }
        progress.completed += 1;
    }

    pub fn stage_completed(&self, name: &str) {
        self.finish(name, StagePhase::Completed, None);
    }

    pub fn stage_failed(&self, name: &str, reason: &str) {
        self.finish(name, StagePhase::Failed, Some(reason));
    }

    pub fn stage_skipped(&self, name: &str, reason: &str) {
        self.finish(name, StagePhase::Skipped, Some(reason));
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        match self.lock() {
            Some(state) => ProgressSnapshot {
                stages: state.stages.clone(),
            },
            None => ProgressSnapshot::default(),
        }
    }

    fn finish(&self, name: &str, phase: StagePhase, reason: Option<&str>) {
        let Some(mut state) = self.lock() else { return };
        let Some(progress) = state.stages.get_mut(name) else {
            warn!(stage = %name, phase = ?phase, "Progress for unknown stage ignored");
            return;
        };
        progress.phase = phase;
        progress.reason = reason.map(str::to_string);
        progress.finished_at = Some(Utc::now());
    }

    fn lock(&self) -> Option<MutexGuard<'_, TrackerState>> {
        match self.state.lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("Progress tracker lock poisoned, update ignored");
                None
            }
        }
    }
}
