use crate::config::SortOrder;
use chrono::{DateTime, Utc};
use log::debug;
use outbox_core::{CompletionMode, NewOutboxMessage, OutboxError, OutboxMessage};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Message type stored by the in-memory outbox.
pub type InMemoryMessage = OutboxMessage<u64>;

/// Errors of the in-memory outbox.
#[derive(Debug, thiserror::Error)]
pub enum InMemoryOutboxError {
    /// The store was told to fail the next write.
    #[error("in-memory outbox store is unavailable")]
    Unavailable,
}

impl From<InMemoryOutboxError> for OutboxError {
    fn from(value: InMemoryOutboxError) -> Self {
        OutboxError::storage(value)
    }
}

#[derive(Debug, Default)]
struct StoreData {
    messages: BTreeMap<u64, InMemoryMessage>,
    next_id: u64,
    failing_completions: usize,
}

/// The outbox collection. Cloning shares the underlying data.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    data: Arc<Mutex<StoreData>>,
}

impl InMemoryOutboxStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a message and returns its id.
    pub async fn insert(&self, message: NewOutboxMessage) -> u64 {
        let mut data = self.data.lock().await;
        data.next_id += 1;
        let id = data.next_id;
        data.messages.insert(
            id,
            OutboxMessage {
                id,
                message_type: message.message_type,
                payload: message.payload,
                created_at: message.created_at,
                trace_context: message.trace_context,
                processed_at: None,
            },
        );
        id
    }

    /// Number of messages not yet completed.
    pub async fn pending_count(&self) -> usize {
        let data = self.data.lock().await;
        data.messages
            .values()
            .filter(|m| m.processed_at.is_none())
            .count()
    }

    /// Every stored message, processed ones included, by id.
    pub async fn all(&self) -> Vec<InMemoryMessage> {
        let data = self.data.lock().await;
        data.messages.values().cloned().collect()
    }

    /// Removes a message regardless of its state.
    pub async fn remove(&self, id: u64) -> bool {
        self.data.lock().await.messages.remove(&id).is_some()
    }

    /// Makes the next `count` completions fail, to exercise retry paths.
    pub async fn fail_next_completions(&self, count: usize) {
        self.data.lock().await.failing_completions = count;
    }

    pub(crate) async fn pending(&self, limit: usize, order: SortOrder) -> Vec<InMemoryMessage> {
        let data = self.data.lock().await;
        let mut pending: Vec<_> = data
            .messages
            .values()
            .filter(|m| m.processed_at.is_none())
            .cloned()
            .collect();
        if order == SortOrder::CreatedAt {
            pending.sort_by_key(|m| (m.created_at, m.id));
        }
        pending.truncate(limit);
        pending
    }

    pub(crate) async fn has_pending(&self) -> bool {
        let data = self.data.lock().await;
        data.messages.values().any(|m| m.processed_at.is_none())
    }

    /// Completes the pending messages among `ids` and returns how many were affected.
    pub(crate) async fn complete(
        &self,
        ids: &[u64],
        mode: CompletionMode,
        now: DateTime<Utc>,
    ) -> Result<u64, InMemoryOutboxError> {
        let mut data = self.data.lock().await;
        if data.failing_completions > 0 {
            data.failing_completions -= 1;
            return Err(InMemoryOutboxError::Unavailable);
        }
        let mut affected = 0;
        for id in ids {
            let pending = data
                .messages
                .get(id)
                .is_some_and(|m| m.processed_at.is_none());
            if !pending {
                continue;
            }
            match mode {
                CompletionMode::Delete => {
                    data.messages.remove(id);
                }
                CompletionMode::Update => {
                    if let Some(message) = data.messages.get_mut(id) {
                        message.processed_at = Some(now);
                    }
                }
            }
            affected += 1;
        }
        debug!("Completed {} of {} messages ({:?})", affected, ids.len(), mode);
        Ok(affected)
    }

    pub(crate) async fn count_pending(&self, ids: &[u64]) -> usize {
        let data = self.data.lock().await;
        ids.iter()
            .filter(|id| {
                data.messages
                    .get(id)
                    .is_some_and(|m| m.processed_at.is_none())
            })
            .count()
    }

    pub(crate) async fn remove_processed_before(&self, cutoff: DateTime<Utc>) -> u64 {
        let mut data = self.data.lock().await;
        let before = data.messages.len();
        data.messages
            .retain(|_, m| !m.processed_at.is_some_and(|at| at < cutoff));
        (before - data.messages.len()) as u64
    }
}
