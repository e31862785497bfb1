//! Pipeline events for embedding callers

use super::circuit_breaker::BreakerState;
use crate::error::StageErrorKind;
use scorelink_common::EntryId;
use serde::{Deserialize, Serialize};

/// Progress events sent to an optional `mpsc` channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// Stage began running
    StageStarted {
        stage: String,
        /// Entries the stage produces artifacts for
        total_items: usize,
        /// Unix timestamp (seconds since epoch)
        timestamp: i64,
    },

    /// One entry's artifacts were produced and recorded
    ItemCompleted { stage: String, entry_id: EntryId },

    StageCompleted {
        stage: String,
        attempts: u32,
        duration_ms: u64,
    },

    StageFailed {
        stage: String,
        error_kind: StageErrorKind,
        message: String,
    },

    /// Stage did not run (upstream failure, open breaker, not configured, cancelled)
    StageSkipped {
        stage: String,
        root_kind: StageErrorKind,
        reason: String,
    },

    BreakerStateChanged {
        stage: String,
        from: BreakerState,
        to: BreakerState,
    },

    RunFinished {
        success: bool,
        /// Unix timestamp (seconds since epoch)
        timestamp: i64,
    },
}
