//! Note models shared between the score and performance sides
//!
//! Both [`ScoreNote`] and [`PerformanceNote`] are produced by external
//! parsers and are immutable once loaded.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a note in a tie chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieState {
    /// Not tied
    #[default]
    None,
    /// First note of a tie chain
    Start,
    /// Inner note of a tie chain
    Continue,
    /// Last note of a tie chain
    Stop,
}

impl TieState {
    /// Continue or Stop: the note extends an earlier sound
    pub fn is_continuation(self) -> bool {
        matches!(self, TieState::Continue | TieState::Stop)
    }
}

impl fmt::Display for TieState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TieState::None => "none",
            TieState::Start => "start",
            TieState::Continue => "continue",
            TieState::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// Bounding box of a notehead on the rendered page
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialCoordinates {
    pub page: u32,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
}

/// A notated note from the score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreNote {
    /// Part identifier (e.g. "P1")
    pub part_id: String,
    /// Measure number (1-based, informational)
    pub measure: u32,
    /// Step letter with optional accidentals: "C", "F#", "Bb", "Cx", "Ebb"
    pub pitch: String,
    /// Scientific octave number (C4 = middle C)
    pub octave: i32,
    /// Absolute position from score start in quarter-note beats
    pub beat_position: f64,
    /// Notated duration in quarter-note beats
    pub notated_duration: f64,
    #[serde(default)]
    pub tie_state: TieState,
    #[serde(default)]
    pub spatial_coordinates: Option<SpatialCoordinates>,
}

impl ScoreNote {
    /// MIDI note number for `pitch` + `octave`
    pub fn midi_pitch(&self) -> Result<u8> {
        midi_from_spelling(&self.pitch, self.octave)
    }

    /// Beat position where the notated duration ends
    pub fn end_beat(&self) -> f64 {
        self.beat_position + self.notated_duration
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<()> {
        if !self.beat_position.is_finite() || self.beat_position < 0.0 {
            return Err(Error::InvalidInput(format!(
                "score note in part {} measure {}: beat_position must be finite and >= 0",
                self.part_id, self.measure
            )));
        }
        if !self.notated_duration.is_finite() || self.notated_duration < 0.0 {
            return Err(Error::InvalidInput(format!(
                "score note in part {} measure {}: notated_duration must be finite and >= 0",
                self.part_id, self.measure
            )));
        }
        self.midi_pitch().map(|_| ())
    }
}

/// A sounding note from the performance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceNote {
    pub track: u16,
    /// MIDI note number (0-127)
    pub pitch: u8,
    pub velocity: u8,
    /// Absolute note-on time in seconds
    pub start_time_abs: f64,
    /// Absolute note-off time in seconds
    pub end_time_abs: f64,
    pub channel: u8,
}

impl PerformanceNote {
    pub fn duration(&self) -> f64 {
        self.end_time_abs - self.start_time_abs
    }

    /// Validate field ranges
    pub fn validate(&self) -> Result<()> {
        if self.pitch > 127 {
            return Err(Error::InvalidInput(format!(
                "performance pitch {} out of MIDI range",
                self.pitch
            )));
        }
        if !self.start_time_abs.is_finite() || !self.end_time_abs.is_finite() {
            return Err(Error::InvalidInput(
                "performance note times must be finite".to_string(),
            ));
        }
        if self.end_time_abs < self.start_time_abs {
            return Err(Error::InvalidInput(format!(
                "performance note ends ({}) before it starts ({})",
                self.end_time_abs, self.start_time_abs
            )));
        }
        Ok(())
    }
}

/// Convert a pitch spelling and octave into a MIDI note number
///
/// ```rust
/// use scorelink_common::models::midi_from_spelling;
///
/// assert_eq!(midi_from_spelling("C", 4).unwrap(), 60);
/// assert_eq!(midi_from_spelling("A", 4).unwrap(), 69);
/// assert_eq!(midi_from_spelling("Cb", 4).unwrap(), 59);
/// ```
pub fn midi_from_spelling(spelling: &str, octave: i32) -> Result<u8> {
    let mut chars = spelling.trim().chars();
    let step = chars
        .next()
        .ok_or_else(|| Error::InvalidInput("empty pitch spelling".to_string()))?;

    let pitch_class: i32 = match step.to_ascii_uppercase() {
        'C' => 0,
        'D' => 2,
        'E' => 4,
        'F' => 5,
        'G' => 7,
        'A' => 9,
        'B' => 11,
        other => {
            return Err(Error::InvalidInput(format!(
                "unknown pitch step '{}' in '{}'",
                other, spelling
            )))
        }
    };

    let mut alter = 0i32;
    for c in chars {
        alter += match c {
            '#' | '♯' => 1,
            'x' | '𝄪' => 2,
            'b' | '♭' => -1,
            other => {
                return Err(Error::InvalidInput(format!(
                    "unknown accidental '{}' in '{}'",
                    other, spelling
                )))
            }
        };
    }

    let midi = (octave + 1) * 12 + pitch_class + alter;
    if !(0..=127).contains(&midi) {
        return Err(Error::InvalidInput(format!(
            "pitch {}{} is outside the MIDI range",
            spelling, octave
        )));
    }
    Ok(midi as u8)
}
