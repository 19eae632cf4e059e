//! Keeps trying to complete messages that reached the broker but were never marked done.

use crate::batch::BatchCompleteRetrier;
use crate::clock::Clock;
use crate::config::BackoffLadder;
use crate::error::OutboxError;
use crate::key::OutboxKey;
use crate::message::Message;
use crate::observer::OutboxObserver;
use log::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-outbox queue of produced-but-not-completed messages.
///
/// Owned by the outbox's background task. The queue is drained before every fetch so a
/// new batch is never claimed while an older one is still unacknowledged.
pub struct CompletionRetrier<M: Message> {
    key: OutboxKey,
    retrier: Arc<dyn BatchCompleteRetrier<M>>,
    clock: Arc<dyn Clock>,
    ladder: BackoffLadder,
    observer: Arc<dyn OutboxObserver>,
    pending: Vec<M>,
}

impl<M: Message> CompletionRetrier<M> {
    /// Creates an empty retrier.
    pub fn new(
        key: OutboxKey,
        retrier: Arc<dyn BatchCompleteRetrier<M>>,
        clock: Arc<dyn Clock>,
        ladder: BackoffLadder,
        observer: Arc<dyn OutboxObserver>,
    ) -> Self {
        Self {
            key,
            retrier,
            clock,
            ladder,
            observer,
            pending: Vec::new(),
        }
    }

    /// Queues messages whose completion failed.
    pub fn collect(&mut self, messages: Vec<M>) {
        self.pending.extend(messages);
    }

    /// Messages waiting for completion.
    pub fn pending(&self) -> &[M] {
        &self.pending
    }

    /// Retries until every queued message is completed.
    ///
    /// Only returns an error when `cancel` fires while backing off, in which case the
    /// queue is kept for the next run. Each attempt itself is never cancelled.
    pub async fn retry_all(&mut self, cancel: &CancellationToken) -> Result<(), OutboxError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let count = self.pending.len();
            let attempt_cancel = CancellationToken::new();
            match self
                .retrier
                .retry_complete(&self.pending, &attempt_cancel)
                .await
            {
                Ok(()) => {
                    info!(
                        "Outbox '{}': completed {} previously produced messages (attempt {})",
                        self.key, count, attempt
                    );
                    self.observer.on_completion_retry(&self.key, count, true);
                    self.pending.clear();
                    return Ok(());
                }
                Err(e) => {
                    self.observer.on_completion_retry(&self.key, count, false);
                    let delay = self.ladder.delay_for(attempt);
                    warn!(
                        "Outbox '{}': retrying completion of {} messages failed (attempt {}): {}. Retrying in {:?}",
                        self.key, count, attempt, e, delay
                    );
                    self.clock.sleep(delay, cancel).await?;
                }
            }
        }
    }
}
