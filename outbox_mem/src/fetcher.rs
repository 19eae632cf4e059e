use crate::config::InMemoryOutboxConfig;
use crate::store::{InMemoryMessage, InMemoryOutboxStore};
use async_trait::async_trait;
use log::{debug, warn};
use outbox_core::lock::LeaseStore;
use outbox_core::message::ids_of;
use outbox_core::{
    BatchContext, BatchFetcher, Clock, CompletionMode, DistributedLockManager, EmptyBatch,
    LockDefinition, LockHandle, OutboxError, OutboxKey, ensure_all_completed,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Claims batches from an [`InMemoryOutboxStore`] under a distributed lock.
///
/// One lock per outbox key: while a batch is held nobody else fetches from the same
/// outbox. Contention yields an empty batch.
#[derive(Debug)]
pub struct InMemoryBatchFetcher {
    store: InMemoryOutboxStore,
    locks: DistributedLockManager,
    clock: Arc<dyn Clock>,
    config: InMemoryOutboxConfig,
    lock_id: String,
    owner: String,
}

impl InMemoryBatchFetcher {
    /// Creates a fetcher for `key`.
    pub fn new(
        key: &OutboxKey,
        store: InMemoryOutboxStore,
        leases: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        config: InMemoryOutboxConfig,
    ) -> Result<Self, OutboxError> {
        config.validate()?;
        Ok(Self {
            store,
            locks: DistributedLockManager::new(leases, clock.clone(), &config.lock),
            clock,
            lock_id: format!("outbox:{key}"),
            owner: Uuid::new_v4().to_string(),
            config,
        })
    }

    /// Lock id guarding this outbox.
    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }
}

#[async_trait]
impl BatchFetcher<InMemoryMessage> for InMemoryBatchFetcher {
    async fn fetch_and_hold(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn BatchContext<InMemoryMessage>>, OutboxError> {
        if cancel.is_cancelled() {
            return Err(OutboxError::Cancelled);
        }
        let definition = LockDefinition::new(&self.lock_id, &self.owner, self.config.lock.duration);
        let Some(lock) = self.locks.try_acquire(definition).await? else {
            return Ok(EmptyBatch::boxed());
        };

        let messages = self
            .store
            .pending(self.config.batch_size, self.config.sort_order)
            .await;
        if messages.is_empty() {
            lock.release().await;
            return Ok(EmptyBatch::boxed());
        }
        debug!(
            "Claimed {} messages under lock '{}'",
            messages.len(),
            self.lock_id
        );
        Ok(Box::new(InMemoryBatch {
            store: self.store.clone(),
            clock: self.clock.clone(),
            completion_mode: self.config.completion_mode,
            messages,
            lock: Some(lock),
        }))
    }
}

struct InMemoryBatch {
    store: InMemoryOutboxStore,
    clock: Arc<dyn Clock>,
    completion_mode: CompletionMode,
    messages: Vec<InMemoryMessage>,
    lock: Option<LockHandle>,
}

impl InMemoryBatch {
    async fn complete_held(
        &self,
        ok: &[InMemoryMessage],
        lock: &LockHandle,
    ) -> Result<(), OutboxError> {
        if ok.is_empty() {
            return Ok(());
        }
        if lock.is_lost() {
            return Err(OutboxError::LockLost(lock.lock_id().to_string()));
        }
        let affected = self
            .store
            .complete(&ids_of(ok), self.completion_mode, self.clock.now())
            .await?;
        ensure_all_completed(ok.len(), affected)
    }
}

#[async_trait]
impl BatchContext<InMemoryMessage> for InMemoryBatch {
    fn messages(&self) -> &[InMemoryMessage] {
        &self.messages
    }

    async fn complete(
        &mut self,
        ok: &[InMemoryMessage],
        _cancel: &CancellationToken,
    ) -> Result<(), OutboxError> {
        let Some(lock) = self.lock.take() else {
            warn!("Batch completed twice, ignoring");
            return Ok(());
        };
        let result = self.complete_held(ok, &lock).await;
        lock.release().await;
        result
    }

    async fn has_next(&mut self, _cancel: &CancellationToken) -> Result<bool, OutboxError> {
        Ok(self.store.has_pending().await)
    }

    async fn dispose(mut self: Box<Self>) {
        if let Some(lock) = self.lock.take() {
            lock.release().await;
        }
    }
}
