//! Configuration types for the polling engine.

use crate::error::OutboxError;
use std::time::Duration;

/// A step function of delays indexed by how many times in a row a failure occurred.
///
/// The first occurrence waits `steps[0]`, the second `steps[1]`, and so on; once the
/// ladder runs out, the last step is repeated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffLadder {
    steps: Vec<Duration>,
}

impl BackoffLadder {
    /// Creates a ladder. Steps must be non-empty and non-decreasing.
    pub fn new(steps: Vec<Duration>) -> Result<Self, OutboxError> {
        if steps.is_empty() {
            return Err(OutboxError::configuration("backoff ladder needs at least one step"));
        }
        if steps.windows(2).any(|w| w[1] < w[0]) {
            return Err(OutboxError::configuration(
                "backoff ladder steps must be non-decreasing",
            ));
        }
        Ok(Self { steps })
    }

    /// Delay for the `occurrence`-th consecutive failure (1-based). Zero occurrences yields
    /// the first step.
    pub fn delay_for(&self, occurrence: u32) -> Duration {
        let index = (occurrence.saturating_sub(1) as usize).min(self.steps.len() - 1);
        self.steps[index]
    }

    /// The largest delay of the ladder.
    pub fn max_delay(&self) -> Duration {
        self.steps[self.steps.len() - 1]
    }

    /// The ladder steps.
    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }
}

impl Default for BackoffLadder {
    fn default() -> Self {
        Self {
            steps: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
                Duration::from_secs(60),
                Duration::from_secs(300),
            ],
        }
    }
}

/// How a produced message is marked as done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// The message row/document is deleted.
    #[default]
    Delete,
    /// The message is kept and stamped with a processed-at time. A cleaner purges it later.
    Update,
}

/// Configuration of one polling background service.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// How long to sleep between cycles when nobody triggers the outbox.
    pub polling_interval: Duration,
    /// Delays applied when a cycle ends with a recognized failure or a panic.
    pub backoff: BackoffLadder,
    /// Delays between attempts of the completion retrier.
    pub completion_retry: BackoffLadder,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            polling_interval: Duration::from_secs(5),
            backoff: BackoffLadder::default(),
            completion_retry: BackoffLadder::default(),
        }
    }
}

impl PollingConfig {
    /// Checks the configuration, failing fast before any task starts.
    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.polling_interval.is_zero() {
            return Err(OutboxError::configuration("polling interval must be positive"));
        }
        Ok(())
    }
}

/// Configuration for [`DistributedLockManager`](crate::lock::DistributedLockManager) leases.
#[derive(Debug, Clone)]
pub struct DistributedLockConfig {
    /// How long a lease lives without being renewed. Keep-alive renews every `duration / 2`.
    pub duration: Duration,
    /// Whether to use the store's change feed to react to releases and lease changes.
    pub use_change_notifications: bool,
}

impl Default for DistributedLockConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(30),
            use_change_notifications: true,
        }
    }
}

impl DistributedLockConfig {
    /// Longest lease accepted by [`validate`](Self::validate).
    pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.duration < Duration::from_millis(2) {
            return Err(OutboxError::configuration(
                "lock duration must be at least 2ms so keep-alive has a positive interval",
            ));
        }
        if self.duration > Self::MAX_DURATION {
            return Err(OutboxError::configuration(format!(
                "lock duration must not exceed {:?}",
                Self::MAX_DURATION
            )));
        }
        Ok(())
    }
}

/// Validates a batch size, shared by every provider configuration.
pub fn validate_batch_size(batch_size: usize) -> Result<(), OutboxError> {
    if batch_size == 0 {
        return Err(OutboxError::configuration("batch size must be greater than zero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ladder_matches_documented_steps() {
        let ladder = BackoffLadder::default();
        assert_eq!(ladder.delay_for(1), Duration::from_secs(1));
        assert_eq!(ladder.delay_for(2), Duration::from_secs(5));
        assert_eq!(ladder.delay_for(3), Duration::from_secs(30));
        assert_eq!(ladder.delay_for(4), Duration::from_secs(60));
        assert_eq!(ladder.delay_for(5), Duration::from_secs(300));
        assert_eq!(ladder.delay_for(50), Duration::from_secs(300));
        assert_eq!(ladder.max_delay(), Duration::from_secs(300));
    }

    #[test]
    fn ladder_rejects_bad_steps() {
        assert!(BackoffLadder::new(vec![]).is_err());
        assert!(
            BackoffLadder::new(vec![Duration::from_secs(5), Duration::from_secs(1)]).is_err()
        );
        assert!(BackoffLadder::new(vec![Duration::from_secs(1)]).is_ok());
    }

    #[test]
    fn polling_config_has_sensible_defaults() {
        let config = PollingConfig::default();
        assert_eq!(config.polling_interval, Duration::from_secs(5));
        assert_eq!(config.backoff, BackoffLadder::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_interval_and_batch_size_are_rejected() {
        let config = PollingConfig {
            polling_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OutboxError::Configuration(_))
        ));
        assert!(validate_batch_size(0).is_err());
        assert!(validate_batch_size(1).is_ok());
    }

    #[test]
    fn lock_config_defaults() {
        let config = DistributedLockConfig::default();
        assert_eq!(config.duration, Duration::from_secs(30));
        assert!(config.use_change_notifications);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn lock_duration_is_bounded() {
        let too_long = DistributedLockConfig {
            duration: Duration::MAX,
            ..Default::default()
        };
        assert!(matches!(
            too_long.validate(),
            Err(OutboxError::Configuration(_))
        ));

        let longest = DistributedLockConfig {
            duration: DistributedLockConfig::MAX_DURATION,
            ..Default::default()
        };
        assert!(longest.validate().is_ok());
    }
}
