//! The fetch → produce → complete loop that drains one outbox.

use crate::batch::{BatchContext, BatchFetcher, BatchProducer};
use crate::error::OutboxError;
use crate::key::OutboxKey;
use crate::message::Message;
use crate::observer::OutboxObserver;
use log::{debug, error, warn};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// How a drain cycle ended, without payload. Used for backoff and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    /// Every pending message was produced and completed (or the cycle was cancelled).
    Ok,
    /// Claiming a batch or checking for more messages failed.
    FetchError,
    /// The broker producer failed for the whole batch.
    ProduceError,
    /// The broker accepted only part of a batch.
    PartialProduction,
    /// Produced messages could not be marked as done.
    CompleteError,
}

impl OutcomeKind {
    /// A stable lowercase name for logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::FetchError => "fetch_error",
            Self::ProduceError => "produce_error",
            Self::PartialProduction => "partial_production",
            Self::CompleteError => "complete_error",
        }
    }
}

/// Terminal outcome of [`PollingProducer::produce_pending`].
#[derive(Debug)]
pub enum ProducePendingOutcome<M> {
    /// Nothing left to do.
    Ok,
    /// See [`OutcomeKind::FetchError`].
    FetchError,
    /// See [`OutcomeKind::ProduceError`].
    ProduceError,
    /// See [`OutcomeKind::PartialProduction`]. The accepted subset was completed.
    PartialProduction,
    /// The broker accepted `pending` but completing them failed; they must go through the
    /// completion retrier.
    CompleteError {
        /// Produced but not completed messages.
        pending: Vec<M>,
    },
}

impl<M> ProducePendingOutcome<M> {
    /// The payload-free kind of this outcome.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Self::Ok => OutcomeKind::Ok,
            Self::FetchError => OutcomeKind::FetchError,
            Self::ProduceError => OutcomeKind::ProduceError,
            Self::PartialProduction => OutcomeKind::PartialProduction,
            Self::CompleteError { .. } => OutcomeKind::CompleteError,
        }
    }
}

enum BatchOutcome<M> {
    MoreAvailable,
    AllDone,
    Failed(ProducePendingOutcome<M>),
}

/// Drains one outbox by repeatedly claiming, producing and completing batches.
pub struct PollingProducer<M: Message> {
    key: OutboxKey,
    fetcher: Arc<dyn BatchFetcher<M>>,
    producer: Arc<dyn BatchProducer<M>>,
    observer: Arc<dyn OutboxObserver>,
}

impl<M: Message> PollingProducer<M> {
    /// Creates a producer for `key`.
    pub fn new(
        key: OutboxKey,
        fetcher: Arc<dyn BatchFetcher<M>>,
        producer: Arc<dyn BatchProducer<M>>,
        observer: Arc<dyn OutboxObserver>,
    ) -> Self {
        Self {
            key,
            fetcher,
            producer,
            observer,
        }
    }

    /// The outbox this producer drains.
    pub fn key(&self) -> &OutboxKey {
        &self.key
    }

    /// Runs batches until the outbox is empty, a batch fails, or `cancel` fires.
    ///
    /// Cancellation is reported as [`ProducePendingOutcome::Ok`].
    pub async fn produce_pending(&self, cancel: &CancellationToken) -> ProducePendingOutcome<M> {
        loop {
            if cancel.is_cancelled() {
                debug!("Outbox '{}': stopping drain, cancellation requested", self.key);
                return ProducePendingOutcome::Ok;
            }
            match self.produce_batch(cancel).await {
                BatchOutcome::MoreAvailable => continue,
                BatchOutcome::AllDone => return ProducePendingOutcome::Ok,
                BatchOutcome::Failed(outcome) => return outcome,
            }
        }
    }

    async fn produce_batch(&self, cancel: &CancellationToken) -> BatchOutcome<M> {
        let mut batch = match self.fetcher.fetch_and_hold(cancel).await {
            Ok(batch) => batch,
            Err(OutboxError::Cancelled) => return BatchOutcome::AllDone,
            Err(e) => {
                warn!("Outbox '{}': failed to fetch a batch: {}", self.key, e);
                return BatchOutcome::Failed(ProducePendingOutcome::FetchError);
            }
        };
        let outcome = self.process_batch(batch.as_mut(), cancel).await;
        batch.dispose().await;
        outcome
    }

    async fn process_batch(
        &self,
        batch: &mut dyn BatchContext<M>,
        cancel: &CancellationToken,
    ) -> BatchOutcome<M> {
        let fetched = batch.messages().len();
        if fetched == 0 {
            return BatchOutcome::AllDone;
        }
        self.observer.on_batch_fetched(&self.key, fetched);

        let produced = match self.producer.produce(&self.key, batch.messages(), cancel).await {
            Ok(result) => self.owned_subset(batch.messages(), result.ok),
            Err(_) if cancel.is_cancelled() => {
                debug!("Outbox '{}': producer interrupted by cancellation", self.key);
                return BatchOutcome::AllDone;
            }
            Err(e) => {
                warn!(
                    "Outbox '{}': producing {} messages failed: {}",
                    self.key, fetched, e
                );
                return BatchOutcome::Failed(ProducePendingOutcome::ProduceError);
            }
        };
        self.observer
            .on_batch_produced(&self.key, produced.len(), fetched);

        // Delivered messages get acknowledged even when shutting down.
        let completion_cancel = CancellationToken::new();
        if let Err(e) = batch.complete(&produced, &completion_cancel).await {
            error!(
                "Outbox '{}': {} messages were produced but could not be completed: {}",
                self.key,
                produced.len(),
                e
            );
            return BatchOutcome::Failed(ProducePendingOutcome::CompleteError { pending: produced });
        }

        if produced.len() < fetched {
            warn!(
                "Outbox '{}': broker accepted {} of {} messages, halting this cycle",
                self.key,
                produced.len(),
                fetched
            );
            return BatchOutcome::Failed(ProducePendingOutcome::PartialProduction);
        }

        match batch.has_next(cancel).await {
            Ok(true) => BatchOutcome::MoreAvailable,
            Ok(false) => BatchOutcome::AllDone,
            Err(OutboxError::Cancelled) => BatchOutcome::AllDone,
            Err(e) => {
                warn!(
                    "Outbox '{}': failed to check for pending messages: {}",
                    self.key, e
                );
                BatchOutcome::Failed(ProducePendingOutcome::FetchError)
            }
        }
    }

    /// Keeps only reported messages that really belong to the batch.
    fn owned_subset(&self, fetched: &[M], reported: Vec<M>) -> Vec<M> {
        let ids: HashSet<&M::Id> = fetched.iter().map(|m| m.id()).collect();
        let reported_len = reported.len();
        let mut seen = HashSet::with_capacity(reported_len);
        let produced: Vec<M> = reported
            .into_iter()
            .filter(|m| ids.contains(m.id()) && seen.insert(m.id().clone()))
            .collect();
        if produced.len() != reported_len {
            warn!(
                "Outbox '{}': producer reported {} messages that were not part of the batch",
                self.key,
                reported_len - produced.len()
            );
        }
        produced
    }
}
