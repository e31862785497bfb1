//! Error types for scorelink-engine
//!
//! Three families:
//! - [`EngineError`]: fatal errors returned through `Result`
//! - [`MatchError`], [`TimingAmbiguityError`]: per-note conditions that are
//!   recorded and logged, never raised
//! - [`StageError`]: why a pipeline stage (or one invocation of it) did not
//!   complete; drives retry, circuit breaking and skip propagation

use scorelink_common::EntryId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for scorelink-engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// scorelink-common error (config, input, io)
    #[error("Common error: {0}")]
    Common(#[from] scorelink_common::Error),

    /// File I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Manifest or registry snapshot could not be parsed
    #[error("Registry corruption: {0}")]
    RegistryCorruption(String),

    /// Id not known to the registry
    #[error("Unknown entry: {0}")]
    UnknownEntry(EntryId),

    /// Entry inserted twice, or with an id the registry never issued
    #[error("Invalid entry {id}: {reason}")]
    InvalidEntry { id: EntryId, reason: String },

    /// Stage status change not allowed by the state machine
    #[error("Invalid transition for stage {stage}: {from} -> {to}")]
    InvalidTransition {
        stage: String,
        from: crate::pipeline::StageStatus,
        to: crate::pipeline::StageStatus,
    },

    /// Static stage graph is inconsistent
    #[error("Stage graph error: {0}")]
    Graph(String),
}

/// Convenience Result type using [`EngineError`]
pub type Result<T> = std::result::Result<T, EngineError>;

/// A score note found no performance note within tolerance
///
/// Non-fatal: the entry is recorded as unmatched with estimated timing.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error(
    "no performance note within {tolerance_ms} ms for MIDI {midi_pitch} at {estimated_onset:.3}s \
     (part {part_id}, measure {measure})"
)]
pub struct MatchError {
    pub entry_id: EntryId,
    pub part_id: String,
    pub measure: u32,
    pub midi_pitch: u8,
    pub estimated_onset: f64,
    pub tolerance_ms: f64,
}

/// A tied group could not be tempo-converted reliably
///
/// Non-fatal: the resolver falls back to linear interpolation.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("tied group starting at entry {primary} is ambiguous: {reason}")]
pub struct TimingAmbiguityError {
    pub primary: EntryId,
    pub reason: String,
}

/// Serializable classification of a [`StageError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    Timeout,
    Process,
    OutputMissing,
    InputMissing,
    CircuitOpen,
    Spawn,
    Manifest,
    Upstream,
    Cancelled,
    NotConfigured,
}

/// Why a stage or one of its invocations did not complete
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageError {
    /// Invocation exceeded its timeout and was force-terminated
    #[error("stage {stage} timed out after {timeout:?}")]
    Timeout { stage: String, timeout: Duration },

    /// Invocation exited with a nonzero status
    #[error("stage {stage} exited with status {code:?}: {stderr}")]
    Process {
        stage: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Invocation exited 0 but declared outputs are absent
    #[error("stage {stage} did not produce declared outputs: {missing:?}")]
    OutputMissing { stage: String, missing: Vec<PathBuf> },

    /// Declared inputs were absent before invocation
    #[error("stage {stage} is missing declared inputs: {missing:?}")]
    InputMissing { stage: String, missing: Vec<PathBuf> },

    /// Circuit breaker rejected the call without invoking the command
    #[error("circuit breaker open for stage {stage}")]
    CircuitOpen { stage: String },

    /// Command could not be started or its template could not be expanded
    #[error("failed to launch stage {stage}: {message}")]
    Spawn { stage: String, message: String },

    /// Artifacts could not be recorded in the manifest
    #[error("manifest update failed for stage {stage}: {message}")]
    Manifest { stage: String, message: String },

    /// An upstream stage did not complete
    #[error("upstream stage {upstream} did not complete ({root:?}): {reason}")]
    Upstream {
        upstream: String,
        root: StageErrorKind,
        reason: String,
    },

    /// Run was cancelled
    #[error("stage {stage} cancelled")]
    Cancelled { stage: String },

    /// No command configured for the stage
    #[error("stage {stage} is not configured")]
    NotConfigured { stage: String },
}

impl StageError {
    pub fn kind(&self) -> StageErrorKind {
        match self {
            StageError::Timeout { .. } => StageErrorKind::Timeout,
            StageError::Process { .. } => StageErrorKind::Process,
            StageError::OutputMissing { .. } => StageErrorKind::OutputMissing,
            StageError::InputMissing { .. } => StageErrorKind::InputMissing,
            StageError::CircuitOpen { .. } => StageErrorKind::CircuitOpen,
            StageError::Spawn { .. } => StageErrorKind::Spawn,
            StageError::Manifest { .. } => StageErrorKind::Manifest,
            StageError::Upstream { .. } => StageErrorKind::Upstream,
            StageError::Cancelled { .. } => StageErrorKind::Cancelled,
            StageError::NotConfigured { .. } => StageErrorKind::NotConfigured,
        }
    }

    /// Original cause, looking through upstream propagation
    pub fn root_kind(&self) -> StageErrorKind {
        match self {
            StageError::Upstream { root, .. } => *root,
            other => other.kind(),
        }
    }

    /// Whether a fresh attempt of the same invocation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StageError::Timeout { .. }
                | StageError::Process { .. }
                | StageError::OutputMissing { .. }
        )
    }

    /// Whether the failure counts against the stage's circuit breaker
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            StageError::Timeout { .. }
                | StageError::Process { .. }
                | StageError::OutputMissing { .. }
                | StageError::Spawn { .. }
        )
    }
}
