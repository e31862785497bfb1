//! Tempo-map based timing conversions
//!
//! Score positions are expressed in quarter-note beats; performance events
//! and every computed onset/offset are expressed in absolute seconds. The
//! [`TempoMap`] bridges the two.
//!
//! # Model
//!
//! A tempo map is a list of tempo events `(beat, bpm)`. Tempo is piecewise
//! constant: an event holds until the next one. Positions before the first
//! event are extrapolated with the first event's tempo, measured from beat 0.
//!
//! ```text
//! beat:    0 ─────── 4 ─────────── 8
//! bpm:        120    │     60
//! seconds: 0 ─────── 2 ─────────── 6
//! ```
//!
//! # Examples
//!
//! ```rust
//! use scorelink_common::timing::{TempoEvent, TempoMap};
//!
//! let map = TempoMap::new(vec![
//!     TempoEvent { beat: 0.0, bpm: 120.0 },
//!     TempoEvent { beat: 4.0, bpm: 60.0 },
//! ]).unwrap();
//!
//! assert_eq!(map.beats_to_seconds(4.0), 2.0);
//! assert_eq!(map.beats_to_seconds(8.0), 6.0);
//! assert_eq!(map.span_seconds(3.0, 2.0), 1.5);
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Tempo used when a score carries no tempo information
pub const DEFAULT_BPM: f64 = 120.0;

/// A tempo change at an absolute beat position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoEvent {
    /// Absolute position in quarter-note beats
    pub beat: f64,
    /// Quarter notes per minute from this beat on
    pub bpm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    start_beat: f64,
    start_seconds: f64,
    bpm: f64,
}

impl Segment {
    fn seconds_per_beat(&self) -> f64 {
        60.0 / self.bpm
    }
}

/// Piecewise-constant tempo map
#[derive(Debug, Clone, PartialEq)]
pub struct TempoMap {
    segments: Vec<Segment>,
}

impl TempoMap {
    /// Build a tempo map from tempo events
    ///
    /// Events are sorted by beat; when two events share a beat the later one
    /// in input order wins.
    ///
    /// # Errors
    /// - empty event list
    /// - negative or non-finite beat
    /// - non-positive or non-finite bpm
    pub fn new(mut events: Vec<TempoEvent>) -> Result<Self> {
        if events.is_empty() {
            return Err(Error::InvalidInput("tempo map has no events".to_string()));
        }

        for event in &events {
            if !event.beat.is_finite() || event.beat < 0.0 {
                return Err(Error::InvalidInput(format!(
                    "tempo event beat must be finite and >= 0, got {}",
                    event.beat
                )));
            }
            if !event.bpm.is_finite() || event.bpm <= 0.0 {
                return Err(Error::InvalidInput(format!(
                    "tempo event bpm must be finite and > 0, got {}",
                    event.bpm
                )));
            }
        }

        events.sort_by(|a, b| a.beat.total_cmp(&b.beat));

        let mut deduped: Vec<TempoEvent> = Vec::with_capacity(events.len());
        for event in events {
            match deduped.last_mut() {
                Some(last) if last.beat == event.beat => *last = event,
                _ => deduped.push(event),
            }
        }

        let mut segments = Vec::with_capacity(deduped.len());
        let first = deduped[0];
        let mut seconds = first.beat * 60.0 / first.bpm;
        let mut previous: Option<Segment> = None;

        for event in deduped {
            if let Some(prev) = previous {
                seconds = prev.start_seconds + (event.beat - prev.start_beat) * prev.seconds_per_beat();
            }
            let segment = Segment {
                start_beat: event.beat,
                start_seconds: seconds,
                bpm: event.bpm,
            };
            segments.push(segment);
            previous = Some(segment);
        }

        Ok(Self { segments })
    }

    /// Tempo map with a single constant tempo from beat 0
    pub fn constant(bpm: f64) -> Result<Self> {
        Self::new(vec![TempoEvent { beat: 0.0, bpm }])
    }

    /// Build from events, falling back to [`DEFAULT_BPM`] when there are none
    pub fn from_events_or_default(events: Vec<TempoEvent>) -> Result<Self> {
        if events.is_empty() {
            tracing::warn!(bpm = DEFAULT_BPM, "No tempo events supplied, assuming default tempo");
            return Self::constant(DEFAULT_BPM);
        }
        Self::new(events)
    }

    /// Beat of the first tempo event
    pub fn first_beat(&self) -> f64 {
        self.segments[0].start_beat
    }

    /// Whether tempo information exists at `beat` (no extrapolation needed)
    pub fn covers(&self, beat: f64) -> bool {
        beat >= self.first_beat()
    }

    /// Tempo (bpm) in effect at `beat`
    pub fn bpm_at(&self, beat: f64) -> f64 {
        self.segment_for_beat(beat).bpm
    }

    /// Convert an absolute beat position to absolute seconds
    pub fn beats_to_seconds(&self, beat: f64) -> f64 {
        let segment = self.segment_for_beat(beat);
        segment.start_seconds + (beat - segment.start_beat) * segment.seconds_per_beat()
    }

    /// Convert absolute seconds back to an absolute beat position
    pub fn seconds_to_beats(&self, seconds: f64) -> f64 {
        let segment = self
            .segments
            .iter()
            .rev()
            .find(|s| s.start_seconds <= seconds)
            .unwrap_or(&self.segments[0]);
        segment.start_beat + (seconds - segment.start_seconds) / segment.seconds_per_beat()
    }

    /// Duration in seconds of `beats` starting at `start_beat`
    ///
    /// Correct across tempo changes inside the span.
    pub fn span_seconds(&self, start_beat: f64, beats: f64) -> f64 {
        self.beats_to_seconds(start_beat + beats) - self.beats_to_seconds(start_beat)
    }

    /// Convert a MIDI-style tick position to absolute seconds
    pub fn ticks_to_seconds(&self, tick: u64, ticks_per_quarter: u32) -> Result<f64> {
        if ticks_per_quarter == 0 {
            return Err(Error::InvalidInput("ticks_per_quarter must be > 0".to_string()));
        }
        Ok(self.beats_to_seconds(tick as f64 / ticks_per_quarter as f64))
    }

    fn segment_for_beat(&self, beat: f64) -> &Segment {
        self.segments
            .iter()
            .rev()
            .find(|s| s.start_beat <= beat)
            .unwrap_or(&self.segments[0])
    }
}

/// Convert milliseconds to fractional seconds
pub fn ms_to_seconds(milliseconds: f64) -> f64 {
    milliseconds / 1000.0
}

/// Convert fractional seconds to milliseconds
pub fn seconds_to_ms(seconds: f64) -> f64 {
    seconds * 1000.0
}
