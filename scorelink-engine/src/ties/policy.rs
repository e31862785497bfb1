//! Onset distribution rules for tied groups
//!
//! A tied group is one performed sound split over several notated notes. The
//! performance only tells us when the sound starts and stops; where the
//! inner notated boundaries fall is a heuristic, so the rule is pluggable.

use scorelink_common::config::TiePolicyKind;

/// Distributes member onsets over a performed sound
pub trait TiedTimingPolicy: Send + Sync + std::fmt::Debug {
    /// Short name recorded in the snapshot metadata
    fn name(&self) -> &'static str;

    /// Onset (absolute seconds) of every member
    ///
    /// `durations` holds the tempo-converted notated duration (seconds) of
    /// each member in order. The first returned onset must equal
    /// `perf_start`.
    fn member_onsets(&self, perf_start: f64, perf_end: f64, durations: &[f64]) -> Vec<f64>;
}

/// Onsets proportional to notated durations
///
/// `onset_i = start + (end - start) * sum(durations[..i]) / sum(durations)`
#[derive(Debug, Clone, Copy, Default)]
pub struct ProportionalPolicy;

impl TiedTimingPolicy for ProportionalPolicy {
    fn name(&self) -> &'static str {
        "proportional"
    }

    fn member_onsets(&self, perf_start: f64, perf_end: f64, durations: &[f64]) -> Vec<f64> {
        let total: f64 = durations.iter().sum();
        if !(total.is_finite() && total > 0.0) {
            return LinearPolicy.member_onsets(perf_start, perf_end, durations);
        }

        let span = perf_end - perf_start;
        let mut cumulative = 0.0;
        durations
            .iter()
            .map(|duration| {
                let onset = perf_start + span * (cumulative / total);
                cumulative += duration;
                onset
            })
            .collect()
    }
}

/// Equal split of the performed duration, ignoring notation
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearPolicy;

impl TiedTimingPolicy for LinearPolicy {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn member_onsets(&self, perf_start: f64, perf_end: f64, durations: &[f64]) -> Vec<f64> {
        let count = durations.len();
        if count == 0 {
            return Vec::new();
        }
        let step = (perf_end - perf_start) / count as f64;
        (0..count).map(|i| perf_start + step * i as f64).collect()
    }
}

/// Policy object for a configured kind
pub fn policy_for(kind: TiePolicyKind) -> Box<dyn TiedTimingPolicy> {
    match kind {
        TiePolicyKind::Proportional => Box::new(ProportionalPolicy),
        TiePolicyKind::Linear => Box::new(LinearPolicy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proportional_uneven_durations() {
        // half + quarter + quarter over 2 seconds
        let onsets = ProportionalPolicy.member_onsets(10.0, 12.0, &[1.0, 0.5, 0.5]);
        assert_eq!(onsets, vec![10.0, 11.0, 11.5]);
    }

    #[test]
    fn test_proportional_equal_durations_equal_steps() {
        let onsets = ProportionalPolicy.member_onsets(1.0, 2.5, &[0.5, 0.5, 0.5]);
        let deltas: Vec<f64> = onsets.windows(2).map(|w| w[1] - w[0]).collect();
        assert!((deltas[0] - deltas[1]).abs() < 1e-12);
        assert!((deltas[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_proportional_zero_total_falls_back_to_linear() {
        let onsets = ProportionalPolicy.member_onsets(0.0, 1.0, &[0.0, 0.0]);
        assert_eq!(onsets, vec![0.0, 0.5]);
    }

    #[test]
    fn test_linear_ignores_durations() {
        let onsets = LinearPolicy.member_onsets(0.0, 3.0, &[2.0, 0.5, 0.5]);
        assert_eq!(onsets, vec![0.0, 1.0, 2.0]);
        assert!(LinearPolicy.member_onsets(0.0, 1.0, &[]).is_empty());
    }

    #[test]
    fn test_policy_for_kind() {
        assert_eq!(policy_for(TiePolicyKind::Proportional).name(), "proportional");
        assert_eq!(policy_for(TiePolicyKind::Linear).name(), "linear");
    }
}
