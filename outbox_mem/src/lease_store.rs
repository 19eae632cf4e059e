use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::debug;
use outbox_core::OutboxError;
use outbox_core::lock::{Lease, LeaseChange, LeaseChangeStream, LeaseStore};
use std::collections::HashMap;
use tokio::sync::{Mutex, broadcast};
use tokio_stream::wrappers::BroadcastStream;

const CHANGE_FEED_CAPACITY: usize = 256;

/// Lease collection with a change feed.
#[derive(Debug)]
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
    changes: broadcast::Sender<(String, LeaseChange)>,
}

impl Default for InMemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLeaseStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            leases: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn publish(&self, lock_id: &str, change: LeaseChange) {
        // No subscribers is fine.
        let _ = self.changes.send((lock_id.to_string(), change));
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn try_upsert(
        &self,
        lock_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, OutboxError> {
        let mut leases = self.leases.lock().await;
        if let Some(current) = leases.get(lock_id) {
            if current.owner != owner && current.is_live(now) {
                return Ok(false);
            }
        }
        leases.insert(
            lock_id.to_string(),
            Lease {
                lock_id: lock_id.to_string(),
                owner: owner.to_string(),
                expires_at,
            },
        );
        drop(leases);
        self.publish(lock_id, LeaseChange::Upserted);
        Ok(true)
    }

    async fn delete_owned(&self, lock_id: &str, owner: &str) -> Result<bool, OutboxError> {
        let mut leases = self.leases.lock().await;
        let owned = leases.get(lock_id).is_some_and(|l| l.owner == owner);
        if !owned {
            return Ok(false);
        }
        leases.remove(lock_id);
        drop(leases);
        self.publish(lock_id, LeaseChange::Deleted);
        Ok(true)
    }

    async fn get(&self, lock_id: &str) -> Result<Option<Lease>, OutboxError> {
        Ok(self.leases.lock().await.get(lock_id).cloned())
    }

    async fn watch(&self, lock_id: &str) -> Result<Option<LeaseChangeStream>, OutboxError> {
        let lock_id = lock_id.to_string();
        let stream = BroadcastStream::new(self.changes.subscribe()).filter_map(move |event| {
            let change = match event {
                Ok((id, change)) if id == lock_id => Some(change),
                Ok(_) => None,
                Err(e) => {
                    // Lagged: whatever we missed, the subscriber has to look again.
                    debug!("Lease change feed for '{}' lagged: {}", lock_id, e);
                    Some(LeaseChange::Deleted)
                }
            };
            futures::future::ready(change)
        });
        Ok(Some(stream.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[tokio::test]
    async fn upsert_respects_live_leases() {
        let store = InMemoryLeaseStore::new();
        let now = Utc::now();
        let later = now + TimeDelta::seconds(30);

        assert!(store.try_upsert("l", "a", now, later).await.unwrap());
        assert!(!store.try_upsert("l", "b", now, later).await.unwrap());
        // Same owner renews.
        assert!(store.try_upsert("l", "a", now, later).await.unwrap());
        // Expired lease can be taken over.
        assert!(store.try_upsert("l", "b", later, later).await.unwrap());
        assert_eq!(store.get("l").await.unwrap().unwrap().owner, "b");
    }

    #[tokio::test]
    async fn delete_requires_ownership() {
        let store = InMemoryLeaseStore::new();
        let now = Utc::now();
        store
            .try_upsert("l", "a", now, now + TimeDelta::seconds(1))
            .await
            .unwrap();

        assert!(!store.delete_owned("l", "b").await.unwrap());
        assert!(store.delete_owned("l", "a").await.unwrap());
        assert!(store.get("l").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn watch_only_sees_its_lock() {
        let store = InMemoryLeaseStore::new();
        let mut changes = store.watch("l").await.unwrap().unwrap();
        let now = Utc::now();
        let later = now + TimeDelta::seconds(1);

        store.try_upsert("other", "a", now, later).await.unwrap();
        store.try_upsert("l", "a", now, later).await.unwrap();
        store.delete_owned("l", "a").await.unwrap();

        assert_eq!(changes.next().await, Some(LeaseChange::Upserted));
        assert_eq!(changes.next().await, Some(LeaseChange::Deleted));
    }
}
