//! # scorelink engine
//!
//! Links notated score notes to performed MIDI notes and drives the render
//! pipeline that produces per-note artifacts:
//!
//! - [`matching`]: tolerance-based score/performance matching
//! - [`ties`]: timing of tied notes sharing one performed sound
//! - [`registry`]: id issuing and the frozen registry snapshot
//! - [`pipeline`]: stage graph, resilient execution of external tools
//! - [`manifest`]: atomic id -> artifact bookkeeping
//! - [`progress`]: per-stage completion counters
//! - [`run`]: end-to-end orchestration used by the `scorelink` binary

pub mod error;
pub mod input;
pub mod logging;
pub mod manifest;
pub mod matching;
pub mod pipeline;
pub mod progress;
pub mod registry;
pub mod run;
pub mod ties;

pub use error::{EngineError, MatchError, Result, StageError, StageErrorKind, TimingAmbiguityError};
pub use manifest::{Manifest, ManifestManager};
pub use matching::{MatchReport, MatchingEngine};
pub use pipeline::{ExecutionReport, StageExecutor, StageGraph, StageStatus};
pub use progress::ProgressTracker;
pub use registry::{RegistrySnapshot, UniversalEntry, UniversalRegistry};
pub use ties::{TiedGroup, TiedNoteResolver};
