//! # scorelink common library
//!
//! Shared code for the scorelink workspace:
//! - Score and performance note models
//! - Tempo map and time conversions
//! - Universal entry identifiers
//! - Configuration loading
//! - Atomic file writes

pub mod atomic_file;
pub mod config;
pub mod entry_id;
pub mod error;
pub mod models;
pub mod timing;

pub use entry_id::EntryId;
pub use error::{Error, Result};
pub use models::{PerformanceNote, ScoreNote, SpatialCoordinates, TieState};
pub use timing::{TempoEvent, TempoMap};
