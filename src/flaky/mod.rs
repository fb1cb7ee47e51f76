//! Historical pass/fail pattern analysis.

use crate::history::CaseStatus;

pub const DEFAULT_WINDOW: usize = 10;
pub const DEFAULT_MIN_TRANSITIONS: usize = 2;

pub struct FlakyDetector {
    pub window: usize,
    pub min_transitions: usize,
}

impl Default for FlakyDetector {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            min_transitions: DEFAULT_MIN_TRANSITIONS,
        }
    }
}

impl FlakyDetector {
    pub fn new(window: usize, min_transitions: usize) -> Self {
        Self { window, min_transitions }
    }

    /// `history` is most-recent-first (matching `HistoryStore::get_case_history`
    /// ordering). Classifies flaky when the sequence -- skipped entries
    /// excluded -- exhibits at least `min_transitions` `failed<->passed`
    /// flips within the most recent `window` entries.
    pub fn is_flaky(&self, history: &[CaseStatus]) -> bool {
        let windowed: Vec<CaseStatus> = history
            .iter()
            .copied()
            .filter(|s| *s != CaseStatus::Skipped)
            .take(self.window)
            .collect();

        let transitions = windowed
            .windows(2)
            .filter(|pair| pair[0] != pair[1])
            .count();

        transitions >= self.min_transitions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_alternating_sequence_as_flaky() {
        let detector = FlakyDetector::default();
        let history = vec![
            CaseStatus::Passed,
            CaseStatus::Failed,
            CaseStatus::Passed,
            CaseStatus::Failed,
        ];
        assert!(detector.is_flaky(&history));
    }

    #[test]
    fn stable_sequence_is_not_flaky() {
        let detector = FlakyDetector::default();
        let history = vec![CaseStatus::Passed, CaseStatus::Passed, CaseStatus::Passed];
        assert!(!detector.is_flaky(&history));
    }

    #[test]
    fn skipped_entries_are_excluded_from_transition_count() {
        let detector = FlakyDetector::new(10, 2);
        let history = vec![
            CaseStatus::Passed,
            CaseStatus::Skipped,
            CaseStatus::Failed,
            CaseStatus::Skipped,
            CaseStatus::Passed,
        ];
        // after filtering skips: passed, failed, passed -> 2 transitions
        assert!(detector.is_flaky(&history));
    }

    #[test]
    fn single_transition_below_default_threshold_is_not_flaky() {
        let detector = FlakyDetector::default();
        let history = vec![CaseStatus::Passed, CaseStatus::Passed, CaseStatus::Failed];
        assert!(!detector.is_flaky(&history));
    }

    #[test]
    fn window_limits_how_much_history_is_considered() {
        let detector = FlakyDetector::new(2, 2);
        // only the most-recent two (passed, failed) are considered: 1 transition
        let history = vec![
            CaseStatus::Passed,
            CaseStatus::Failed,
            CaseStatus::Passed,
            CaseStatus::Failed,
            CaseStatus::Passed,
            CaseStatus::Failed,
        ];
        assert!(!detector.is_flaky(&history));
    }
}
