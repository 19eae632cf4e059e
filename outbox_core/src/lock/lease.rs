//! Storage contract for distributed lock leases.

use crate::error::OutboxError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

/// The lease document/row of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Lock id. Unique in the store.
    pub lock_id: String,
    /// Token of the current owner.
    pub owner: String,
    /// When the lease stops protecting its owner.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease is still protecting its owner at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A change observed on a lease through the store's change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseChange {
    /// The lease was created or renewed.
    Upserted,
    /// The lease was deleted.
    Deleted,
}

/// Stream of changes on one lease.
pub type LeaseChangeStream = BoxStream<'static, LeaseChange>;

/// A store holding at most one lease per lock id.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Conditional upsert. Succeeds, setting `owner` and `expires_at`, only when no lease
    /// exists for `lock_id`, when it is owned by `owner`, or when it expired at `now`.
    async fn try_upsert(
        &self,
        lock_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, OutboxError>;

    /// Deletes the lease only if `owner` still owns it. Returns whether a lease was deleted.
    async fn delete_owned(&self, lock_id: &str, owner: &str) -> Result<bool, OutboxError>;

    /// Reads the current lease.
    async fn get(&self, lock_id: &str) -> Result<Option<Lease>, OutboxError>;

    /// Subscribes to changes of `lock_id`. Stores without a change feed return `None`.
    async fn watch(&self, _lock_id: &str) -> Result<Option<LeaseChangeStream>, OutboxError> {
        Ok(None)
    }
}
