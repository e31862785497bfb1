//! Tied-note timing resolver
//!
//! The matching engine links tie continuations to their chain's primary entry
//! (`tied_to`) and lets them share the primary's performance note. This module
//! turns each complete chain into a [`TiedGroup`]: the primary keeps the
//! performed onset, the other members get onsets from a [`TiedTimingPolicy`],
//! and every member ends at the performed note-off.
//!
//! A chain is only a group when it is complete: primary matched, every member
//! on the same performance note, and the last member a `stop`. Broken chains
//! have their continuations reset to estimate timing.

mod policy;

pub use policy::{policy_for, LinearPolicy, ProportionalPolicy, TiedTimingPolicy};

use crate::error::TimingAmbiguityError;
use crate::registry::UniversalEntry;
use scorelink_common::config::TiePolicyKind;
use scorelink_common::{EntryId, TempoMap, TieState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Notated notes sharing one performed sound
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiedGroup {
    /// First member; keeps the performed onset
    pub primary: EntryId,
    /// All members in score order, primary first
    pub members: Vec<EntryId>,
    /// Index of the shared performance note
    pub performance_index: usize,
    /// Performed onset (seconds)
    pub onset: f64,
    /// Performed offset shared by every member (seconds)
    pub offset: f64,
    /// Policy that placed the inner onsets
    pub policy: String,
    /// Linear interpolation was used because tempo conversion was ambiguous
    pub fallback: bool,
}

impl TiedGroup {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Result of one resolver pass
#[derive(Debug, Default)]
pub struct ResolveOutput {
    pub groups: Vec<TiedGroup>,
    pub ambiguities: Vec<TimingAmbiguityError>,
    /// Primaries of chains that could not form a group
    pub broken_chains: Vec<EntryId>,
    /// Continuations of broken chains that lost their inherited performance note
    pub unlinked: Vec<EntryId>,
}

/// Applies a [`TiedTimingPolicy`] to every complete tie chain
#[derive(Debug)]
pub struct TiedNoteResolver {
    policy: Box<dyn TiedTimingPolicy>,
}

impl Default for TiedNoteResolver {
    fn default() -> Self {
        Self::new(Box::new(ProportionalPolicy))
    }
}

impl TiedNoteResolver {
    pub fn new(policy: Box<dyn TiedTimingPolicy>) -> Self {
        Self { policy }
    }

    pub fn from_kind(kind: TiePolicyKind) -> Self {
        Self::new(policy_for(kind))
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Rewrite member timings in place and return the detected groups
    pub fn resolve(&self, entries: &mut [UniversalEntry], tempo: &TempoMap) -> ResolveOutput {
        let positions: HashMap<EntryId, usize> = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id, i))
            .collect();

        // primary id -> member positions in score order (primary excluded)
        let mut chains: Vec<(EntryId, Vec<usize>)> = Vec::new();
        let mut chain_slot: HashMap<EntryId, usize> = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            if let Some(primary) = entry.tied_to {
                let slot = *chain_slot.entry(primary).or_insert_with(|| {
                    chains.push((primary, Vec::new()));
                    chains.len() - 1
                });
                chains[slot].1.push(i);
            }
        }

        let mut output = ResolveOutput::default();

        for (primary_id, continuations) in chains {
            let Some(&primary_pos) = positions.get(&primary_id) else {
                warn!(primary = %primary_id, "Tie continuations refer to an unknown entry");
                output.unlinked.extend(reset_members(entries, &continuations));
                output.broken_chains.push(primary_id);
                continue;
            };

            if let Err(reason) = check_chain(entries, primary_pos, &continuations) {
                warn!(primary = %primary_id, members = continuations.len() + 1, reason = %reason, "Broken tie chain, continuations keep estimate timing");
                output.unlinked.extend(reset_members(entries, &continuations));
                output.broken_chains.push(primary_id);
                continue;
            }

            let mut members = Vec::with_capacity(continuations.len() + 1);
            members.push(primary_pos);
            members.extend(continuations);

            let (group, ambiguity) = self.apply(entries, &members, tempo);
            if let Some(ambiguity) = ambiguity {
                warn!(primary = %ambiguity.primary, reason = %ambiguity.reason, "Tied group timing ambiguous, using linear interpolation");
                output.ambiguities.push(ambiguity);
            }
            debug!(primary = %group.primary, members = group.len(), policy = %group.policy, "Resolved tied group");
            output.groups.push(group);
        }

        info!(
            groups = output.groups.len(),
            ambiguous = output.ambiguities.len(),
            broken = output.broken_chains.len(),
            policy = self.policy.name(),
            "Tied-note resolution complete"
        );
        output
    }

    fn apply(
        &self,
        entries: &mut [UniversalEntry],
        members: &[usize],
        tempo: &TempoMap,
    ) -> (TiedGroup, Option<TimingAmbiguityError>) {
        let primary = &entries[members[0]];
        let primary_id = primary.id;
        let start_beat = primary.score_note.beat_position;
        // Primary is matched, checked by check_chain
        let (perf_start, perf_end, performance_index) = match (&primary.performance_note, primary.performance_index) {
            (Some(perf), Some(index)) => (perf.start_time_abs, perf.end_time_abs, index),
            _ => (primary.computed_onset, primary.computed_offset, 0),
        };

        let durations: Vec<f64> = members
            .iter()
            .map(|&i| {
                let note = &entries[i].score_note;
                tempo.span_seconds(note.beat_position, note.notated_duration)
            })
            .collect();
        let total: f64 = durations.iter().sum();

        let ambiguity = if !tempo.covers(start_beat) {
            Some(format!(
                "group starts at beat {} before the first tempo event at beat {}",
                start_beat,
                tempo.first_beat()
            ))
        } else if !(total.is_finite() && total > 0.0) {
            Some(format!("tempo-converted total duration {} is not positive", total))
        } else {
            None
        };

        let (onsets, policy_name) = match ambiguity {
            Some(_) => (
                LinearPolicy.member_onsets(perf_start, perf_end, &durations),
                LinearPolicy.name(),
            ),
            None => (
                self.policy.member_onsets(perf_start, perf_end, &durations),
                self.policy.name(),
            ),
        };

        for (&i, onset) in members.iter().zip(onsets) {
            let entry = &mut entries[i];
            entry.computed_onset = onset;
            entry.computed_offset = perf_end;
        }
        // Primary timing is the performed onset exactly
        entries[members[0]].computed_onset = perf_start;

        let group = TiedGroup {
            primary: primary_id,
            members: members.iter().map(|&i| entries[i].id).collect(),
            performance_index,
            onset: perf_start,
            offset: perf_end,
            policy: policy_name.to_string(),
            fallback: ambiguity.is_some(),
        };
        let ambiguity = ambiguity.map(|reason| TimingAmbiguityError {
            primary: primary_id,
            reason,
        });
        (group, ambiguity)
    }
}

fn check_chain(
    entries: &[UniversalEntry],
    primary_pos: usize,
    continuations: &[usize],
) -> std::result::Result<(), String> {
    let primary = &entries[primary_pos];
    if primary.score_note.tie_state != TieState::Start {
        return Err(format!("primary has tie state {}", primary.score_note.tie_state));
    }
    let Some(performance_index) = primary.performance_index else {
        return Err("primary is unmatched".to_string());
    };
    let Some((last, inner)) = continuations.split_last() else {
        return Err("chain has no continuation".to_string());
    };
    if entries[*last].score_note.tie_state != TieState::Stop {
        return Err("chain has no stop".to_string());
    }
    if inner
        .iter()
        .any(|&i| entries[i].score_note.tie_state != TieState::Continue)
    {
        return Err("stop before the end of the chain".to_string());
    }
    if continuations
        .iter()
        .any(|&i| entries[i].performance_index != Some(performance_index))
    {
        return Err("members refer to different performance notes".to_string());
    }
    Ok(())
}

/// Reset `positions` to estimate timing; returns the ids that were matched
fn reset_members(entries: &mut [UniversalEntry], positions: &[usize]) -> Vec<EntryId> {
    let mut unlinked = Vec::new();
    for &i in positions {
        if entries[i].is_matched() {
            unlinked.push(entries[i].id);
        }
        entries[i].reset_to_estimate();
    }
    unlinked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::*;
    use crate::registry::MatchMethod;
    use scorelink_common::TempoEvent;

    /// Tie chain where every member shares performance note 0
    fn chain(specs: &[(f64, f64, TieState)], perf: (f64, f64)) -> Vec<UniversalEntry> {
        let mut entries: Vec<UniversalEntry> = Vec::new();
        let mut primary = None;
        for &(beat, duration, tie) in specs {
            let mut entry = UniversalEntry::matched(
                EntryId::generate(),
                score_note("G", beat, duration, tie),
                perf_note(67, perf.0, perf.1),
                0,
                MatchMethod::Tolerance,
                0.9,
                beat * 0.5,
                (beat + duration) * 0.5,
            );
            match primary {
                None => primary = Some(entry.id),
                Some(id) => entry.tied_to = Some(id),
            }
            entries.push(entry);
        }
        entries
    }

    #[test]
    fn test_three_equal_members() {
        let tempo = TempoMap::constant(120.0).unwrap();
        let mut entries = chain(
            &[
                (0.0, 1.0, TieState::Start),
                (1.0, 1.0, TieState::Continue),
                (2.0, 1.0, TieState::Stop),
            ],
            (0.02, 1.52),
        );

        let output = TiedNoteResolver::default().resolve(&mut entries, &tempo);

        assert_eq!(output.groups.len(), 1);
        let group = &output.groups[0];
        assert_eq!(group.len(), 3);
        assert_eq!(group.primary, entries[0].id);
        assert!(!group.fallback);

        assert_eq!(entries[0].computed_onset, 0.02);
        let d1 = entries[1].computed_onset - entries[0].computed_onset;
        let d2 = entries[2].computed_onset - entries[1].computed_onset;
        assert!((d1 - d2).abs() < 1e-9);
        assert!((d1 - 0.5).abs() < 1e-9);
        for entry in &entries {
            assert_eq!(entry.computed_offset, 1.52);
        }
    }

    #[test]
    fn test_tempo_change_inside_group() {
        // Beat 0-1 at 120 bpm (0.5 s), beat 1-2 at 60 bpm (1.0 s)
        let tempo = TempoMap::new(vec![
            TempoEvent { beat: 0.0, bpm: 120.0 },
            TempoEvent { beat: 1.0, bpm: 60.0 },
        ])
        .unwrap();
        let mut entries = chain(
            &[(0.0, 1.0, TieState::Start), (1.0, 1.0, TieState::Stop)],
            (0.0, 3.0),
        );

        let output = TiedNoteResolver::default().resolve(&mut entries, &tempo);

        assert_eq!(output.groups.len(), 1);
        // 3.0 * 0.5 / 1.5, not the 1.5 a beat-proportional split would give
        assert!((entries[1].computed_onset - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_group_before_first_tempo_event_falls_back_to_linear() {
        let tempo = TempoMap::new(vec![TempoEvent { beat: 4.0, bpm: 60.0 }]).unwrap();
        let mut entries = chain(
            &[
                (0.0, 2.0, TieState::Start),
                (2.0, 1.0, TieState::Continue),
                (3.0, 1.0, TieState::Stop),
            ],
            (0.0, 3.0),
        );

        let output = TiedNoteResolver::default().resolve(&mut entries, &tempo);

        assert_eq!(output.ambiguities.len(), 1);
        assert_eq!(output.ambiguities[0].primary, entries[0].id);
        let group = &output.groups[0];
        assert!(group.fallback);
        assert_eq!(group.policy, "linear");
        assert_eq!(entries[1].computed_onset, 1.0);
        assert_eq!(entries[2].computed_onset, 2.0);
    }

    #[test]
    fn test_zero_duration_group_falls_back_to_linear() {
        let tempo = TempoMap::constant(120.0).unwrap();
        let mut entries = chain(
            &[(0.0, 0.0, TieState::Start), (0.0, 0.0, TieState::Stop)],
            (1.0, 2.0),
        );

        let output = TiedNoteResolver::default().resolve(&mut entries, &tempo);

        assert_eq!(output.ambiguities.len(), 1);
        assert_eq!(entries[1].computed_onset, 1.5);
    }

    #[test]
    fn test_chain_without_stop_is_broken() {
        let tempo = TempoMap::constant(120.0).unwrap();
        let mut entries = chain(
            &[(0.0, 1.0, TieState::Start), (1.0, 1.0, TieState::Continue)],
            (0.0, 1.0),
        );

        let output = TiedNoteResolver::default().resolve(&mut entries, &tempo);

        assert!(output.groups.is_empty());
        assert_eq!(output.broken_chains, vec![entries[0].id]);
        // Primary keeps its match, the continuation reverts to its estimate
        assert_eq!(entries[0].match_method, MatchMethod::Tolerance);
        assert_eq!(entries[1].match_method, MatchMethod::Unmatched);
        assert_eq!(entries[1].computed_onset, 0.5);
        assert_eq!(entries[1].tied_to, Some(entries[0].id));
        assert_eq!(output.unlinked, vec![entries[1].id]);
    }

    #[test]
    fn test_members_on_different_performance_notes_are_broken() {
        let tempo = TempoMap::constant(120.0).unwrap();
        let mut entries = chain(
            &[(0.0, 1.0, TieState::Start), (1.0, 1.0, TieState::Stop)],
            (0.0, 1.0),
        );
        entries[1].performance_index = Some(7);

        let output = TiedNoteResolver::default().resolve(&mut entries, &tempo);

        assert!(output.groups.is_empty());
        assert_eq!(output.broken_chains.len(), 1);
    }

    #[test]
    fn test_linear_policy_resolver() {
        let tempo = TempoMap::constant(120.0).unwrap();
        let mut entries = chain(
            &[(0.0, 3.0, TieState::Start), (3.0, 1.0, TieState::Stop)],
            (0.0, 2.0),
        );

        let resolver = TiedNoteResolver::from_kind(TiePolicyKind::Linear);
        let output = resolver.resolve(&mut entries, &tempo);

        assert_eq!(output.groups[0].policy, "linear");
        assert_eq!(entries[1].computed_onset, 1.0);
    }
}
