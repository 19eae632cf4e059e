use crate::store::InMemoryOutboxStore;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use log::debug;
use outbox_core::{Cleaner, Clock, OutboxError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Purges messages completed in update mode.
#[derive(Debug, Clone)]
pub struct InMemoryCleaner {
    store: InMemoryOutboxStore,
    clock: Arc<dyn Clock>,
}

impl InMemoryCleaner {
    /// Creates a cleaner over `store`.
    pub fn new(store: InMemoryOutboxStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl Cleaner for InMemoryCleaner {
    async fn clean(
        &self,
        max_age: Duration,
        cancel: &CancellationToken,
    ) -> Result<u64, OutboxError> {
        if cancel.is_cancelled() {
            return Err(OutboxError::Cancelled);
        }
        let max_age = TimeDelta::from_std(max_age)
            .map_err(|e| OutboxError::configuration(format!("max_age out of range: {e}")))?;
        let cutoff = self
            .clock
            .now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.store.remove_processed_before(cutoff).await;
        debug!("Cleaned {} processed messages", removed);
        Ok(removed)
    }
}
