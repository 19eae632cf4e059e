//! Per-outbox backoff bookkeeping.

use crate::config::BackoffLadder;
use crate::producer::OutcomeKind;
use std::time::Duration;

/// Consecutive failure counters of one outbox instance.
///
/// Owned by the instance's background task only.
#[derive(Debug, Default)]
pub(crate) struct BackoffState {
    unhandled: u32,
    last_failure: Option<(OutcomeKind, u32)>,
}

impl BackoffState {
    /// Records a recognized failure and returns how long to wait before the next cycle.
    ///
    /// The occurrence count restarts at one when the failure kind differs from the
    /// previous one.
    pub(crate) fn on_failure(&mut self, kind: OutcomeKind, ladder: &BackoffLadder) -> Duration {
        self.unhandled = 0;
        let occurrences = match self.last_failure {
            Some((last, count)) if last == kind => count.saturating_add(1),
            _ => 1,
        };
        self.last_failure = Some((kind, occurrences));
        ladder.delay_for(occurrences)
    }

    /// Records a panic escaping a cycle.
    pub(crate) fn on_unhandled(&mut self, ladder: &BackoffLadder) -> Duration {
        self.unhandled = self.unhandled.saturating_add(1);
        ladder.delay_for(self.unhandled)
    }

    /// Forgets every failure.
    pub(crate) fn reset(&mut self) {
        self.unhandled = 0;
        self.last_failure = None;
    }

    #[cfg(test)]
    pub(crate) fn consecutive(&self) -> Option<(OutcomeKind, u32)> {
        self.last_failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_failures_never_shrink_the_delay() {
        let ladder = BackoffLadder::default();
        let mut state = BackoffState::default();
        let mut previous = Duration::ZERO;
        for _ in 0..5 {
            let delay = state.on_failure(OutcomeKind::FetchError, &ladder);
            assert!(delay >= previous);
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(300));
        assert_eq!(state.consecutive(), Some((OutcomeKind::FetchError, 5)));
    }

    #[test]
    fn success_resets_to_first_step() {
        let ladder = BackoffLadder::default();
        let mut state = BackoffState::default();
        state.on_failure(OutcomeKind::ProduceError, &ladder);
        state.on_failure(OutcomeKind::ProduceError, &ladder);
        state.reset();
        assert_eq!(
            state.on_failure(OutcomeKind::ProduceError, &ladder),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn different_kind_resets_to_first_step() {
        let ladder = BackoffLadder::default();
        let mut state = BackoffState::default();
        state.on_failure(OutcomeKind::ProduceError, &ladder);
        assert_eq!(
            state.on_failure(OutcomeKind::ProduceError, &ladder),
            Duration::from_secs(5)
        );
        assert_eq!(
            state.on_failure(OutcomeKind::PartialProduction, &ladder),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn unhandled_counter_is_separate() {
        let ladder = BackoffLadder::default();
        let mut state = BackoffState::default();
        state.on_failure(OutcomeKind::FetchError, &ladder);
        state.on_failure(OutcomeKind::FetchError, &ladder);
        assert_eq!(state.on_unhandled(&ladder), Duration::from_secs(1));
        assert_eq!(state.on_unhandled(&ladder), Duration::from_secs(5));
        assert_eq!(state.consecutive(), Some((OutcomeKind::FetchError, 2)));
    }
}
