//! Lease based mutual exclusion for stores without native advisory locks.
//!
//! A lock is one lease per lock id in a [`LeaseStore`]. Acquiring is a conditional upsert;
//! the holder keeps the lease alive every `duration / 2` and deletes it on release. A
//! holder that dies simply stops renewing, and the lease becomes acquirable once it
//! expires.

mod handle;
mod lease;

pub use handle::LockHandle;
pub use lease::{Lease, LeaseChange, LeaseChangeStream, LeaseStore};

use crate::clock::{Clock, checked_offset, remaining_until};
use crate::config::DistributedLockConfig;
use crate::error::OutboxError;
use futures::StreamExt;
use log::{debug, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Callback invoked once when a held lock is lost.
pub type OnLockLost = Arc<dyn Fn() + Send + Sync>;

/// What to lock, for whom, and for how long.
#[derive(Clone)]
pub struct LockDefinition {
    /// Lock id.
    pub id: String,
    /// Owner token. Re-acquiring with the same token extends the lease.
    pub owner: String,
    /// Lease duration.
    pub duration: Duration,
    /// Called once if keep-alive discovers the lease was lost.
    pub on_lost: Option<OnLockLost>,
}

impl LockDefinition {
    /// Creates a definition without a lost callback.
    pub fn new(id: impl Into<String>, owner: impl Into<String>, duration: Duration) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            duration,
            on_lost: None,
        }
    }

    /// Sets the callback invoked when the lease is lost.
    pub fn on_lost(mut self, on_lost: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_lost = Some(Arc::new(on_lost));
        self
    }
}

impl fmt::Debug for LockDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockDefinition")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("duration", &self.duration)
            .field("on_lost", &self.on_lost.as_ref().map(|_| "Some(<callback>)"))
            .finish()
    }
}

/// Acquires leases from a [`LeaseStore`].
#[derive(Clone)]
pub struct DistributedLockManager {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    use_change_notifications: bool,
}

impl fmt::Debug for DistributedLockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedLockManager")
            .field("clock", &self.clock)
            .field("use_change_notifications", &self.use_change_notifications)
            .finish()
    }
}

impl DistributedLockManager {
    /// Creates a manager. All expiry math uses `clock`.
    pub fn new(
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        config: &DistributedLockConfig,
    ) -> Self {
        Self {
            store,
            clock,
            use_change_notifications: config.use_change_notifications,
        }
    }

    /// Tries once. `Ok(None)` means someone else holds a live lease.
    pub async fn try_acquire(
        &self,
        definition: LockDefinition,
    ) -> Result<Option<LockHandle>, OutboxError> {
        let now = self.clock.now();
        let expires_at = checked_offset(now, definition.duration).ok_or_else(|| {
            OutboxError::configuration(format!(
                "lock '{}': duration {:?} is out of range",
                definition.id, definition.duration
            ))
        })?;
        if !self
            .store
            .try_upsert(&definition.id, &definition.owner, now, expires_at)
            .await?
        {
            debug!(
                "Lock '{}' is held by someone else, '{}' backs off",
                definition.id, definition.owner
            );
            return Ok(None);
        }
        debug!("Lock '{}' acquired by '{}'", definition.id, definition.owner);
        Ok(Some(LockHandle::start(
            definition,
            self.store.clone(),
            self.clock.clone(),
            self.use_change_notifications,
        )))
    }

    /// Waits until the lock is acquired or `cancel` fires.
    ///
    /// Between attempts it sleeps until the current lease expires, waking earlier if the
    /// change feed reports that the lease was deleted.
    pub async fn acquire(
        &self,
        definition: LockDefinition,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, OutboxError> {
        // Subscribe before the first attempt so a release in between is not missed.
        let mut deletions = if self.use_change_notifications {
            match self.store.watch(&definition.id).await {
                Ok(changes) => changes,
                Err(e) => {
                    warn!(
                        "Lock '{}': change feed unavailable, falling back to polling: {}",
                        definition.id, e
                    );
                    None
                }
            }
        } else {
            None
        };

        loop {
            if cancel.is_cancelled() {
                return Err(OutboxError::Cancelled);
            }
            if let Some(handle) = self.try_acquire(definition.clone()).await? {
                return Ok(handle);
            }
            let wait = self.time_to_expiry(&definition).await?;
            tokio::select! {
                slept = self.clock.sleep(wait, cancel) => slept?,
                _ = wait_for_deletion(&mut deletions) => {
                    debug!("Lock '{}' was released, retrying", definition.id);
                }
            }
        }
    }

    async fn time_to_expiry(&self, definition: &LockDefinition) -> Result<Duration, OutboxError> {
        Ok(match self.store.get(&definition.id).await? {
            Some(lease) => remaining_until(self.clock.now(), lease.expires_at, definition.duration),
            None => Duration::ZERO,
        })
    }
}

async fn wait_for_deletion(changes: &mut Option<LeaseChangeStream>) {
    if let Some(stream) = changes.as_mut() {
        while let Some(change) = stream.next().await {
            if change == LeaseChange::Deleted {
                return;
            }
        }
    }
    futures::future::pending::<()>().await
}
