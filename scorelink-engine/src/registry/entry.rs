//! Universal entry: one score note, its match result and derived timing

use scorelink_common::{EntryId, PerformanceNote, ScoreNote};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// How an entry's timing was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// Performance onset equals the estimate
    Exact,
    /// Performance onset within tolerance of the estimate
    Tolerance,
    /// No performance note; timing is the estimate
    Unmatched,
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchMethod::Exact => f.write_str("exact"),
            MatchMethod::Tolerance => f.write_str("tolerance"),
            MatchMethod::Unmatched => f.write_str("unmatched"),
        }
    }
}

/// Stable link between a score note, its performance note and artifacts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniversalEntry {
    pub id: EntryId,
    pub score_note: ScoreNote,
    pub performance_note: Option<PerformanceNote>,
    /// Index of `performance_note` in the loaded performance list
    pub performance_index: Option<usize>,
    pub match_confidence: f64,
    pub match_method: MatchMethod,
    /// Tempo-map estimate of the onset (seconds)
    pub estimated_onset: f64,
    /// Estimated onset plus tempo-converted notated duration (seconds)
    pub estimated_offset: f64,
    pub computed_onset: f64,
    pub computed_offset: f64,
    /// Primary entry of the tie chain this entry continues
    #[serde(default)]
    pub tied_to: Option<EntryId>,
    /// Artifacts per stage; empty in the frozen snapshot, the manifest is authoritative
    #[serde(default)]
    pub artifact_paths: BTreeMap<String, Vec<PathBuf>>,
}

impl UniversalEntry {
    /// Entry with no performance note, timed by its estimate
    pub fn unmatched(
        id: EntryId,
        score_note: ScoreNote,
        estimated_onset: f64,
        estimated_offset: f64,
    ) -> Self {
        Self {
            id,
            score_note,
            performance_note: None,
            performance_index: None,
            match_confidence: 0.0,
            match_method: MatchMethod::Unmatched,
            estimated_onset,
            estimated_offset,
            computed_onset: estimated_onset,
            computed_offset: estimated_offset,
            tied_to: None,
            artifact_paths: BTreeMap::new(),
        }
    }

    /// Entry timed by a performance note
    #[allow(clippy::too_many_arguments)]
    pub fn matched(
        id: EntryId,
        score_note: ScoreNote,
        performance_note: PerformanceNote,
        performance_index: usize,
        match_method: MatchMethod,
        match_confidence: f64,
        estimated_onset: f64,
        estimated_offset: f64,
    ) -> Self {
        Self {
            id,
            computed_onset: performance_note.start_time_abs,
            computed_offset: performance_note.end_time_abs,
            score_note,
            performance_note: Some(performance_note),
            performance_index: Some(performance_index),
            match_confidence,
            match_method,
            estimated_onset,
            estimated_offset,
            tied_to: None,
            artifact_paths: BTreeMap::new(),
        }
    }

    pub fn is_matched(&self) -> bool {
        self.match_method != MatchMethod::Unmatched
    }

    /// Tie continuation: shares its chain primary's performance note
    pub fn is_tie_continuation(&self) -> bool {
        self.tied_to.is_some()
    }

    /// Drop the performance link and fall back to estimated timing
    ///
    /// `tied_to` is kept: a continuation of a broken chain is still notated
    /// as tied, it just has no performance timing.
    pub fn reset_to_estimate(&mut self) {
        self.performance_note = None;
        self.performance_index = None;
        self.match_confidence = 0.0;
        self.match_method = MatchMethod::Unmatched;
        self.computed_onset = self.estimated_onset;
        self.computed_offset = self.estimated_offset;
    }

    /// Signed onset error of the match (performance - estimate)
    pub fn onset_delta(&self) -> Option<f64> {
        self.performance_note
            .as_ref()
            .map(|p| p.start_time_abs - self.estimated_onset)
    }
}
