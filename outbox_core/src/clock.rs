//! Time source used for backoff, polling intervals and lease expiry.

use crate::error::OutboxError;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A source of "now" and of cancellable delays.
///
/// Every time based decision in the engine goes through a `Clock`, so tests can drive
/// time with [`ManualClock`].
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// The current time.
    fn now(&self) -> DateTime<Utc>;

    /// Waits for `duration`, or returns [`OutboxError::Cancelled`] as soon as `cancel` fires.
    async fn sleep(&self, duration: Duration, cancel: &CancellationToken)
    -> Result<(), OutboxError>;
}

/// Wall clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), OutboxError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OutboxError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

/// A clock that only moves when told to.
///
/// Sleepers wake up once [`ManualClock::advance`] moves the time past their deadline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<watch::Sender<DateTime<Utc>>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        let (now, _) = watch::channel(start);
        Self { now: Arc::new(now) }
    }

    /// Moves the clock forward, waking every sleeper whose deadline has passed.
    pub fn advance(&self, by: Duration) {
        self.now.send_modify(|now| {
            *now = checked_offset(*now, by).unwrap_or(DateTime::<Utc>::MAX_UTC);
        });
    }

    /// Jumps to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        self.now.send_replace(to);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.borrow()
    }

    async fn sleep(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), OutboxError> {
        // An unrepresentable deadline never elapses.
        let deadline = checked_offset(self.now(), duration).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut rx = self.now.subscribe();
        loop {
            if *rx.borrow_and_update() >= deadline {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OutboxError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        // The sender lives as long as `self`; unreachable while we borrow it.
                        return Err(OutboxError::Cancelled);
                    }
                }
            }
        }
    }
}

/// `at + by`, or `None` when the result is not representable.
pub fn checked_offset(at: DateTime<Utc>, by: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|by| at.checked_add_signed(by))
}

/// Time left until `deadline`, clamped to `[0, max]`.
pub fn remaining_until(now: DateTime<Utc>, deadline: DateTime<Utc>, max: Duration) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO).min(max)
}
