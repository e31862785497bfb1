//! Render pipeline
//!
//! Stages run external tools against the frozen registry snapshot and record
//! their artifacts in the manifest:
//!
//! ```text
//! coordinates ──> note_images ──> composite
//! audio_render ──> audio_features
//! ```
//!
//! - [`stage`]: stage kinds, the status state machine and the graph
//! - [`template`]: `{placeholder}` expansion for commands and paths
//! - [`runner`]: external process invocation
//! - [`retry`], [`circuit_breaker`]: resilience around every invocation
//! - [`executor`]: the control loop driving the graph
//! - [`report`], [`events`]: results for callers

pub mod circuit_breaker;
pub mod events;
pub mod executor;
pub mod report;
pub mod retry;
pub mod runner;
pub mod stage;
pub mod template;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use events::PipelineEvent;
pub use executor::StageExecutor;
pub use report::{ExecutionReport, StageOutcome};
pub use retry::{ResiliencePolicy, RetryPolicy};
pub use runner::{CommandRunner, Invocation, InvocationOutput, ProcessRunner};
pub use stage::{Criticality, PipelineStage, StageGraph, StageKind, StageScope, StageStatus};
pub use template::RunContext;
