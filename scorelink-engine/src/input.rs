//! Score and performance input documents
//!
//! Both documents are JSON. Score notes come from the score parser with a
//! notated tempo map; performance notes come from the MIDI parser either in
//! absolute seconds or in ticks.

use crate::error::{EngineError, Result};
use scorelink_common::{Error, PerformanceNote, ScoreNote, TempoEvent, TempoMap};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Parsed, validated score document
#[derive(Debug, Clone)]
pub struct ScoreDocument {
    pub tempo: TempoMap,
    /// Opaque descriptor passed through to the snapshot metadata
    pub coordinate_transform: Option<serde_json::Value>,
    /// Sorted by (beat_position, part_id), stable
    pub notes: Vec<ScoreNote>,
    pub source: Option<PathBuf>,
}

/// Parsed, validated performance document
#[derive(Debug, Clone)]
pub struct PerformanceDocument {
    /// Sorted by start time, stable
    pub notes: Vec<PerformanceNote>,
    pub source: Option<PathBuf>,
}

#[derive(Deserialize)]
struct RawScore {
    #[serde(default)]
    tempo_map: Vec<TempoEvent>,
    #[serde(default)]
    coordinate_transform: Option<serde_json::Value>,
    notes: Vec<ScoreNote>,
}

#[derive(Deserialize)]
struct RawPerformance {
    #[serde(default)]
    ticks_per_quarter: Option<u32>,
    #[serde(default)]
    tempo_map: Vec<TempoEvent>,
    notes: Vec<RawPerformanceNote>,
}

fn default_velocity() -> u8 {
    64
}

#[derive(Deserialize)]
struct RawPerformanceNote {
    #[serde(default)]
    track: u16,
    pitch: u32,
    #[serde(default = "default_velocity")]
    velocity: u8,
    #[serde(default)]
    channel: u8,
    #[serde(default)]
    start_time_abs: Option<f64>,
    #[serde(default)]
    end_time_abs: Option<f64>,
    #[serde(default)]
    start_tick: Option<u64>,
    #[serde(default)]
    end_tick: Option<u64>,
}

fn invalid(message: String) -> EngineError {
    EngineError::Common(Error::InvalidInput(message))
}

fn read_document(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| invalid(format!("cannot read {}: {}", path.display(), e)))
}

/// Load a score document from `path`
pub fn load_score(path: &Path) -> Result<ScoreDocument> {
    let mut document = parse_score(&read_document(path)?)
        .map_err(|e| invalid(format!("{}: {}", path.display(), e)))?;
    document.source = Some(path.to_path_buf());

    info!(
        path = %path.display(),
        notes = document.notes.len(),
        "Score loaded"
    );
    Ok(document)
}

/// Parse a score document
pub fn parse_score(json: &str) -> Result<ScoreDocument> {
    let raw: RawScore =
        serde_json::from_str(json).map_err(|e| invalid(format!("score document: {}", e)))?;

    let tempo = TempoMap::from_events_or_default(raw.tempo_map)?;

    let mut notes = raw.notes;
    for (i, note) in notes.iter().enumerate() {
        note.validate()
            .map_err(|e| invalid(format!("score note {}: {}", i, e)))?;
    }
    notes.sort_by(|a, b| {
        a.beat_position
            .total_cmp(&b.beat_position)
            .then_with(|| a.part_id.cmp(&b.part_id))
    });

    Ok(ScoreDocument {
        tempo,
        coordinate_transform: raw.coordinate_transform,
        notes,
        source: None,
    })
}

/// Load a performance document from `path`
pub fn load_performance(path: &Path) -> Result<PerformanceDocument> {
    let mut document = parse_performance(&read_document(path)?)
        .map_err(|e| invalid(format!("{}: {}", path.display(), e)))?;
    document.source = Some(path.to_path_buf());

    info!(
        path = %path.display(),
        notes = document.notes.len(),
        "Performance loaded"
    );
    Ok(document)
}

/// Parse a performance document
///
/// Each note gives either `start_time_abs`/`end_time_abs` in seconds or
/// `start_tick`/`end_tick`, which need `ticks_per_quarter`.
pub fn parse_performance(json: &str) -> Result<PerformanceDocument> {
    let raw: RawPerformance =
        serde_json::from_str(json).map_err(|e| invalid(format!("performance document: {}", e)))?;

    let uses_ticks = raw
        .notes
        .iter()
        .any(|n| n.start_time_abs.is_none() || n.end_time_abs.is_none());
    let tempo = if uses_ticks {
        Some(TempoMap::from_events_or_default(raw.tempo_map)?)
    } else {
        if !raw.tempo_map.is_empty() {
            warn!("Performance tempo map ignored, all notes carry absolute times");
        }
        None
    };

    let mut notes = Vec::with_capacity(raw.notes.len());
    for (i, note) in raw.notes.into_iter().enumerate() {
        let note = convert_note(note, raw.ticks_per_quarter, tempo.as_ref())
            .map_err(|e| invalid(format!("performance note {}: {}", i, e)))?;
        notes.push(note);
    }
    notes.sort_by(|a, b| a.start_time_abs.total_cmp(&b.start_time_abs));

    Ok(PerformanceDocument { notes, source: None })
}

fn convert_note(
    raw: RawPerformanceNote,
    ticks_per_quarter: Option<u32>,
    tempo: Option<&TempoMap>,
) -> std::result::Result<PerformanceNote, String> {
    if raw.pitch > 127 {
        return Err(format!("pitch {} out of MIDI range", raw.pitch));
    }

    let (start, end) = match (raw.start_time_abs, raw.end_time_abs, raw.start_tick, raw.end_tick) {
        (Some(start), Some(end), _, _) => (start, end),
        (_, _, Some(start_tick), Some(end_tick)) => {
            let tpq = ticks_per_quarter
                .ok_or_else(|| "tick times given without ticks_per_quarter".to_string())?;
            let tempo = tempo.ok_or_else(|| "tick times given without a tempo map".to_string())?;
            let start = tempo.ticks_to_seconds(start_tick, tpq).map_err(|e| e.to_string())?;
            let end = tempo.ticks_to_seconds(end_tick, tpq).map_err(|e| e.to_string())?;
            (start, end)
        }
        _ => {
            return Err(
                "needs start_time_abs/end_time_abs or start_tick/end_tick".to_string(),
            )
        }
    };

    let note = PerformanceNote {
        track: raw.track,
        pitch: raw.pitch as u8,
        velocity: raw.velocity,
        start_time_abs: start,
        end_time_abs: end,
        channel: raw.channel,
    };
    note.validate().map_err(|e| e.to_string())?;
    Ok(note)
}
