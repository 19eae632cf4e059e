//! A held lease and its keep-alive task.

use super::lease::{LeaseChange, LeaseChangeStream, LeaseStore};
use super::LockDefinition;
use crate::clock::{Clock, checked_offset, remaining_until};
use crate::error::OutboxError;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Ownership of a distributed lock.
///
/// Renewed in the background every `duration / 2`. Call [`release`](LockHandle::release)
/// to give it back; dropping the handle only stops the renewal and lets the lease expire.
pub struct LockHandle {
    lock_id: String,
    owner: String,
    store: Arc<dyn LeaseStore>,
    keep_alive_cancel: CancellationToken,
    keep_alive: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
}

impl LockHandle {
    pub(super) fn start(
        definition: LockDefinition,
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        use_change_notifications: bool,
    ) -> Self {
        let keep_alive_cancel = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));
        let lock_id = definition.id.clone();
        let owner = definition.owner.clone();
        let keep_alive = tokio::spawn(keep_alive(
            definition,
            store.clone(),
            clock,
            use_change_notifications,
            keep_alive_cancel.clone(),
            lost.clone(),
        ));
        Self {
            lock_id,
            owner,
            store,
            keep_alive_cancel,
            keep_alive: Some(keep_alive),
            lost,
        }
    }

    /// The lock id.
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    /// The owner token.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Whether keep-alive found that someone else owns the lease now.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stops the keep-alive, then deletes the lease if it is still ours.
    ///
    /// Failures are logged: an undeleted lease simply expires.
    pub async fn release(mut self) {
        // Keep-alive must be fully stopped first, or it could renew the lease we delete.
        self.keep_alive_cancel.cancel();
        if let Some(task) = self.keep_alive.take() {
            if let Err(e) = task.await {
                warn!("Lock '{}': keep-alive task failed: {}", self.lock_id, e);
            }
        }
        match self.store.delete_owned(&self.lock_id, &self.owner).await {
            Ok(true) => debug!("Lock '{}' released by '{}'", self.lock_id, self.owner),
            Ok(false) => debug!(
                "Lock '{}' was no longer owned by '{}' at release",
                self.lock_id, self.owner
            ),
            Err(e) => warn!(
                "Lock '{}': failed to release, it will expire on its own: {}",
                self.lock_id, e
            ),
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("lock_id", &self.lock_id)
            .field("owner", &self.owner)
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.keep_alive_cancel.cancel();
    }
}

async fn next_change(changes: &mut Option<LeaseChangeStream>) -> LeaseChange {
    if let Some(stream) = changes.as_mut() {
        if let Some(change) = stream.next().await {
            return change;
        }
    }
    futures::future::pending().await
}

async fn keep_alive(
    definition: LockDefinition,
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    use_change_notifications: bool,
    cancel: CancellationToken,
    lost: Arc<AtomicBool>,
) {
    let interval = definition.duration / 2;
    let mut changes = if use_change_notifications {
        match store.watch(&definition.id).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(
                    "Lock '{}': change feed unavailable, relying on keep-alive only: {}",
                    definition.id, e
                );
                None
            }
        }
    } else {
        None
    };

    let renewal_after =
        |now: DateTime<Utc>| checked_offset(now, interval).unwrap_or(DateTime::<Utc>::MAX_UTC);
    let mut next_renewal = renewal_after(clock.now());
    loop {
        let wait = remaining_until(clock.now(), next_renewal, interval);
        let renew = tokio::select! {
            slept = clock.sleep(wait, &cancel) => {
                if slept.is_err() {
                    return;
                }
                true
            }
            change = next_change(&mut changes) => {
                debug!("Lock '{}': lease changed ({:?}), verifying ownership", definition.id, change);
                false
            }
        };
        if cancel.is_cancelled() {
            return;
        }

        let still_ours = if renew {
            let now = clock.now();
            let renewed = match checked_offset(now, definition.duration) {
                Some(expires_at) => {
                    store
                        .try_upsert(&definition.id, &definition.owner, now, expires_at)
                        .await
                }
                None => Err(OutboxError::configuration(format!(
                    "lock '{}': duration {:?} is out of range",
                    definition.id, definition.duration
                ))),
            };
            next_renewal = renewal_after(clock.now());
            renewed
        } else {
            store.get(&definition.id).await.map(|lease| {
                lease.is_some_and(|l| l.owner == definition.owner && l.is_live(clock.now()))
            })
        };
        // Release may have started while the store call was in flight.
        if cancel.is_cancelled() {
            return;
        }

        match still_ours {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    "Lock '{}': lease taken over, '{}' lost it",
                    definition.id, definition.owner
                );
                mark_lost(&definition, &lost);
                return;
            }
            Err(e) => {
                warn!(
                    "Lock '{}': renewing the lease failed, considering it lost: {}",
                    definition.id, e
                );
                mark_lost(&definition, &lost);
                return;
            }
        }
    }
}

fn mark_lost(definition: &LockDefinition, lost: &AtomicBool) {
    if !lost.swap(true, Ordering::SeqCst) {
        if let Some(on_lost) = &definition.on_lost {
            on_lost();
        }
    }
}
