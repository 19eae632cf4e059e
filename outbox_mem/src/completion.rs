use crate::config::InMemoryOutboxConfig;
use crate::store::{InMemoryMessage, InMemoryOutboxStore};
use async_trait::async_trait;
use log::info;
use outbox_core::message::ids_of;
use outbox_core::{BatchCompleteRetrier, Clock, CompletionMode, OutboxError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Completes previously produced messages without taking the lock.
///
/// Completion is idempotent: messages someone else already completed are skipped, only
/// the ones still pending afterwards fail the retry.
#[derive(Debug, Clone)]
pub struct InMemoryCompletionRetrier {
    store: InMemoryOutboxStore,
    clock: Arc<dyn Clock>,
    completion_mode: CompletionMode,
}

impl InMemoryCompletionRetrier {
    /// Creates a retrier completing with the mode of `config`.
    pub fn new(
        store: InMemoryOutboxStore,
        clock: Arc<dyn Clock>,
        config: &InMemoryOutboxConfig,
    ) -> Self {
        Self {
            store,
            clock,
            completion_mode: config.completion_mode,
        }
    }
}

#[async_trait]
impl BatchCompleteRetrier<InMemoryMessage> for InMemoryCompletionRetrier {
    async fn retry_complete(
        &self,
        messages: &[InMemoryMessage],
        _cancel: &CancellationToken,
    ) -> Result<(), OutboxError> {
        if messages.is_empty() {
            return Ok(());
        }
        let ids = ids_of(messages);
        let affected = self
            .store
            .complete(&ids, self.completion_mode, self.clock.now())
            .await?;
        if affected as usize == ids.len() {
            return Ok(());
        }
        let remaining = self.store.count_pending(&ids).await;
        if remaining > 0 {
            return Err(OutboxError::IncompleteCompletion {
                remaining: remaining as u64,
            });
        }
        info!(
            "{} of {} messages were already completed elsewhere",
            ids.len() - affected as usize,
            ids.len()
        );
        Ok(())
    }
}
