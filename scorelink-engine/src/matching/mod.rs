//! Tolerance-based score-to-performance note matching
//!
//! Each score note gets a tempo-map onset estimate and is paired with the
//! closest unconsumed performance note of the same MIDI pitch inside the
//! tolerance window. A performance note is consumed at most once, so chord
//! tones of equal pitch each take a distinct note.
//!
//! Tie continuations do not consume: they inherit the performance note of
//! the open chain for their part and pitch. Timing inside the chain is left
//! to [`crate::ties::TiedNoteResolver`].

mod report;

pub use report::MatchReport;

use crate::error::{MatchError, Result};
use crate::registry::{MatchMethod, UniversalEntry, UniversalRegistry};
use scorelink_common::config::MatchingSettings;
use scorelink_common::timing::{ms_to_seconds, seconds_to_ms};
use scorelink_common::{EntryId, PerformanceNote, ScoreNote, TempoMap, TieState};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Deltas below this are exact matches (seconds)
pub const EXACT_EPSILON: f64 = 1e-6;

/// Lowest confidence given to an in-tolerance match
pub const MIN_TOLERANCE_CONFIDENCE: f64 = 0.05;

/// Output of [`MatchingEngine::match_notes`]
#[derive(Debug)]
pub struct MatchOutput {
    /// One entry per score note, in score order
    pub entries: Vec<UniversalEntry>,
    pub report: MatchReport,
    pub match_errors: Vec<MatchError>,
}

#[derive(Debug, Clone)]
struct OpenChain {
    primary: EntryId,
    performance: Option<(usize, MatchMethod, f64)>,
}

/// Pairs score notes with performance notes
#[derive(Debug, Clone)]
pub struct MatchingEngine {
    tolerance_ms: f64,
    auto_align: bool,
    unmatched_warn_rate: f64,
}

impl MatchingEngine {
    pub fn new(tolerance_ms: f64) -> Self {
        Self {
            tolerance_ms,
            auto_align: false,
            unmatched_warn_rate: 0.25,
        }
    }

    pub fn from_settings(settings: &MatchingSettings) -> Self {
        Self {
            tolerance_ms: settings.tolerance_ms,
            auto_align: settings.auto_align,
            unmatched_warn_rate: settings.unmatched_warn_rate,
        }
    }

    pub fn with_auto_align(mut self, auto_align: bool) -> Self {
        self.auto_align = auto_align;
        self
    }

    pub fn tolerance_ms(&self) -> f64 {
        self.tolerance_ms
    }

    /// Confidence for a match with the given onset error
    pub fn confidence(&self, delta: f64) -> f64 {
        if delta.abs() < EXACT_EPSILON {
            return 1.0;
        }
        let tolerance = ms_to_seconds(self.tolerance_ms);
        (1.0 - delta.abs() / tolerance).clamp(MIN_TOLERANCE_CONFIDENCE, 1.0)
    }

    /// Match `score` (in score order) against `performance`
    ///
    /// Ids are issued by `registry`; the entries are returned, not inserted,
    /// so the tie resolver can adjust them first.
    pub fn match_notes(
        &self,
        registry: &mut UniversalRegistry,
        score: &[ScoreNote],
        tempo: &TempoMap,
        performance: &[PerformanceNote],
    ) -> Result<MatchOutput> {
        let tolerance = ms_to_seconds(self.tolerance_ms);

        // MIDI pitch -> performance indices sorted by start time, then input order
        let mut by_pitch: HashMap<u8, Vec<usize>> = HashMap::new();
        for (i, note) in performance.iter().enumerate() {
            by_pitch.entry(note.pitch).or_default().push(i);
        }
        for indices in by_pitch.values_mut() {
            indices.sort_by(|&a, &b| {
                performance[a]
                    .start_time_abs
                    .total_cmp(&performance[b].start_time_abs)
                    .then(a.cmp(&b))
            });
        }

        let alignment_offset = if self.auto_align {
            self.alignment_offset(score, tempo, performance)
        } else {
            0.0
        };

        let mut consumed = vec![false; performance.len()];
        let mut open_chains: HashMap<(String, u8), OpenChain> = HashMap::new();
        let mut entries = Vec::with_capacity(score.len());
        let mut match_errors = Vec::new();
        let mut report = MatchReport {
            score_notes: score.len(),
            performance_notes: performance.len(),
            alignment_offset,
            tolerance_ms: self.tolerance_ms,
            ..Default::default()
        };

        for note in score {
            let midi = note.midi_pitch()?;
            let estimated_onset = tempo.beats_to_seconds(note.beat_position) + alignment_offset;
            let estimated_offset =
                estimated_onset + tempo.span_seconds(note.beat_position, note.notated_duration);
            let id = registry.assign_id();
            let key = (note.part_id.clone(), midi);

            if note.tie_state.is_continuation() {
                if let Some(chain) = open_chains.get(&key).cloned() {
                    let mut entry = match chain.performance {
                        Some((index, method, confidence)) => UniversalEntry::matched(
                            id,
                            note.clone(),
                            performance[index].clone(),
                            index,
                            method,
                            confidence,
                            estimated_onset,
                            estimated_offset,
                        ),
                        None => UniversalEntry::unmatched(
                            id,
                            note.clone(),
                            estimated_onset,
                            estimated_offset,
                        ),
                    };
                    entry.tied_to = Some(chain.primary);
                    report.tie_continuations += 1;
                    count_method(&mut report, entry.match_method);
                    if note.tie_state == TieState::Stop {
                        open_chains.remove(&key);
                    }
                    entries.push(entry);
                    continue;
                }
                warn!(
                    part = %note.part_id,
                    measure = note.measure,
                    midi = midi,
                    tie_state = %note.tie_state,
                    "Tie continuation without an open chain, matching as an ordinary note"
                );
            }

            let candidate = by_pitch
                .get(&midi)
                .and_then(|indices| best_candidate(indices, performance, &consumed, estimated_onset, tolerance));

            let entry = match candidate {
                Some((index, delta)) => {
                    consumed[index] = true;
                    let method = if delta.abs() < EXACT_EPSILON {
                        MatchMethod::Exact
                    } else {
                        MatchMethod::Tolerance
                    };
                    UniversalEntry::matched(
                        id,
                        note.clone(),
                        performance[index].clone(),
                        index,
                        method,
                        self.confidence(delta),
                        estimated_onset,
                        estimated_offset,
                    )
                }
                None => {
                    let error = MatchError {
                        entry_id: id,
                        part_id: note.part_id.clone(),
                        measure: note.measure,
                        midi_pitch: midi,
                        estimated_onset,
                        tolerance_ms: self.tolerance_ms,
                    };
                    debug!(entry_id = %id, error = %error, "Score note unmatched");
                    match_errors.push(error);
                    UniversalEntry::unmatched(id, note.clone(), estimated_onset, estimated_offset)
                }
            };
            count_method(&mut report, entry.match_method);

            if note.tie_state == TieState::Start {
                let chain = OpenChain {
                    primary: id,
                    performance: entry
                        .performance_index
                        .map(|index| (index, entry.match_method, entry.match_confidence)),
                };
                if open_chains.insert(key, chain).is_some() {
                    warn!(
                        part = %note.part_id,
                        measure = note.measure,
                        midi = midi,
                        "Tie chain restarted before its stop"
                    );
                }
            }

            entries.push(entry);
        }

        for ((part, midi), chain) in &open_chains {
            warn!(part = %part, midi = midi, primary = %chain.primary, "Tie chain never stopped");
        }

        for (index, note) in performance.iter().enumerate() {
            if !consumed[index] {
                debug!(
                    index = index,
                    midi = note.pitch,
                    start = note.start_time_abs,
                    "Performance note not matched to any score note"
                );
            }
        }
        report.unconsumed_performance_notes = consumed.iter().filter(|c| !**c).count();

        info!(
            exact = report.exact,
            tolerance = report.tolerance,
            unmatched = report.unmatched,
            unconsumed = report.unconsumed_performance_notes,
            "Matching complete: {}",
            report.display_string()
        );
        self.warn_unmatched_rate(&report);

        Ok(MatchOutput {
            entries,
            report,
            match_errors,
        })
    }

    /// Unmatched record for an entry that lost its performance note after matching
    pub fn match_error(&self, entry: &UniversalEntry) -> Result<MatchError> {
        Ok(MatchError {
            entry_id: entry.id,
            part_id: entry.score_note.part_id.clone(),
            measure: entry.score_note.measure,
            midi_pitch: entry.score_note.midi_pitch()?,
            estimated_onset: entry.estimated_onset,
            tolerance_ms: self.tolerance_ms,
        })
    }

    pub fn warn_unmatched_rate(&self, report: &MatchReport) {
        if report.score_notes > 0 && report.unmatched_rate() > self.unmatched_warn_rate {
            warn!(
                unmatched_rate = report.unmatched_rate(),
                threshold = self.unmatched_warn_rate,
                "High unmatched rate; check tempo map, tolerance or auto_align"
            );
        }
    }

    /// Shift that puts the first score onset on the first performance onset
    fn alignment_offset(
        &self,
        score: &[ScoreNote],
        tempo: &TempoMap,
        performance: &[PerformanceNote],
    ) -> f64 {
        let first_score = score
            .iter()
            .map(|n| tempo.beats_to_seconds(n.beat_position))
            .min_by(f64::total_cmp);
        let first_performance = performance
            .iter()
            .map(|n| n.start_time_abs)
            .min_by(f64::total_cmp);

        match (first_score, first_performance) {
            (Some(score_onset), Some(performance_onset)) => {
                let offset = performance_onset - score_onset;
                info!(offset_ms = seconds_to_ms(offset), "Auto-aligning score estimates");
                offset
            }
            _ => 0.0,
        }
    }
}

fn count_method(report: &mut MatchReport, method: MatchMethod) {
    match method {
        MatchMethod::Exact => report.exact += 1,
        MatchMethod::Tolerance => report.tolerance += 1,
        MatchMethod::Unmatched => report.unmatched += 1,
    }
}

/// Closest unconsumed note within `tolerance` of `onset`
///
/// `indices` is sorted by start time, so on equal distance the earlier note
/// (then the earlier input index) wins.
fn best_candidate(
    indices: &[usize],
    performance: &[PerformanceNote],
    consumed: &[bool],
    onset: f64,
    tolerance: f64,
) -> Option<(usize, f64)> {
    // Inclusive window; the epsilon absorbs rounding in the seconds conversion
    let reach = tolerance + EXACT_EPSILON;
    let window_start = indices.partition_point(|&i| performance[i].start_time_abs < onset - reach);

    let mut best: Option<(usize, f64)> = None;
    for &index in &indices[window_start..] {
        let start = performance[index].start_time_abs;
        if start > onset + reach {
            break;
        }
        if consumed[index] {
            continue;
        }
        let delta = start - onset;
        if delta.abs() > reach {
            continue;
        }
        match best {
            Some((_, best_delta)) if delta.abs() >= best_delta.abs() => {}
            _ => best = Some((index, delta)),
        }
    }
    best
}
