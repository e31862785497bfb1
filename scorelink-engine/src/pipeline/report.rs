//! Execution report

use super::stage::{StageGraph, StageKind, StageStatus};
use crate::error::StageErrorKind;
use chrono::{DateTime, Utc};
use scorelink_common::config::ExecutionMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Final state of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub name: String,
    pub kind: StageKind,
    pub status: StageStatus,
    pub critical: bool,
    #[serde(default)]
    pub error_kind: Option<StageErrorKind>,
    /// Original cause when the error was propagated from upstream
    #[serde(default)]
    pub root_kind: Option<StageErrorKind>,
    #[serde(default)]
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Artifacts recorded in the manifest by this stage
    pub artifacts_recorded: usize,
}

impl StageOutcome {
    /// Completed, or skipped because the stage itself has no command
    ///
    /// A configured stage skipped because its upstream is not configured is
    /// not acceptable.
    pub fn is_acceptable(&self) -> bool {
        match self.status {
            StageStatus::Completed => true,
            StageStatus::Skipped => self.error_kind == Some(StageErrorKind::NotConfigured),
            _ => false,
        }
    }
}

/// Outcome of one [`super::StageExecutor::execute`] call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub mode: ExecutionMode,
    pub cancelled: bool,
    /// Critical stage whose failure aborted the run
    #[serde(default)]
    pub aborted_by: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub stages: Vec<StageOutcome>,
}

impl ExecutionReport {
    pub(crate) fn from_graph(
        graph: &StageGraph,
        mode: ExecutionMode,
        started_at: DateTime<Utc>,
        elapsed: Duration,
        cancelled: bool,
        aborted_by: Option<String>,
        artifacts: impl Fn(&str) -> usize,
    ) -> Self {
        let stages: Vec<StageOutcome> = graph
            .topological_order()
            .iter()
            .map(|&i| {
                let stage = graph.stage(i);
                StageOutcome {
                    name: stage.name.clone(),
                    kind: stage.kind,
                    status: stage.status(),
                    critical: stage.is_critical(),
                    error_kind: stage.error().map(|e| e.kind()),
                    root_kind: stage.error().map(|e| e.root_kind()),
                    error: stage.error().map(|e| e.to_string()),
                    attempts: stage.attempts(),
                    duration_ms: stage.duration().map(|d| d.as_millis() as u64),
                    artifacts_recorded: artifacts(&stage.name),
                }
            })
            .collect();

        let success = !cancelled && stages.iter().all(StageOutcome::is_acceptable);
        Self {
            success,
            mode,
            cancelled,
            aborted_by,
            started_at,
            finished_at: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            stages,
        }
    }

    pub fn stage(&self, name: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Format as human-readable string, one stage per line
    pub fn display_string(&self) -> String {
        let mut lines = vec![format!(
            "{} in {} ms ({} mode)",
            if self.success { "succeeded" } else { "failed" },
            self.duration_ms,
            self.mode
        )];
        for stage in &self.stages {
            let mut line = format!("  {:<15} {}", stage.name, stage.status);
            if stage.attempts > 1 {
                line.push_str(&format!(" after {} attempts", stage.attempts));
            }
            if let Some(error) = &stage.error {
                line.push_str(&format!(": {}", error));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}
