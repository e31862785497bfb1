//! Matching statistics

use crate::registry::{MatchMethod, UniversalEntry};
use serde::{Deserialize, Serialize};

/// Counters collected during one matching pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    pub score_notes: usize,
    pub performance_notes: usize,
    pub exact: usize,
    pub tolerance: usize,
    pub unmatched: usize,
    /// Continuations that inherited their chain's performance note
    pub tie_continuations: usize,
    /// Performance notes no score note consumed (ornaments, extra notes)
    pub unconsumed_performance_notes: usize,
    /// Offset added to every estimate by auto-alignment (seconds)
    pub alignment_offset: f64,
    pub tolerance_ms: f64,
}

impl MatchReport {
    pub fn matched(&self) -> usize {
        self.exact + self.tolerance
    }

    /// Recount the per-method counters from final entry states
    pub fn recount(&mut self, entries: &[UniversalEntry]) {
        self.exact = 0;
        self.tolerance = 0;
        self.unmatched = 0;
        for entry in entries {
            match entry.match_method {
                MatchMethod::Exact => self.exact += 1,
                MatchMethod::Tolerance => self.tolerance += 1,
                MatchMethod::Unmatched => self.unmatched += 1,
            }
        }
    }

    /// Fraction of score notes without a performance note
    pub fn unmatched_rate(&self) -> f64 {
        if self.score_notes == 0 {
            0.0
        } else {
            self.unmatched as f64 / self.score_notes as f64
        }
    }

    /// Format as human-readable string
    pub fn display_string(&self) -> String {
        format!(
            "{} score notes: {} exact, {} tolerance, {} unmatched ({:.1}%), {} tie continuations, {} of {} performance notes unconsumed",
            self.score_notes,
            self.exact,
            self.tolerance,
            self.unmatched,
            self.unmatched_rate() * 100.0,
            self.tie_continuations,
            self.unconsumed_performance_notes,
            self.performance_notes
        )
    }
}
