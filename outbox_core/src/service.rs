//! Long-running scheduler of one outbox instance.

use crate::backoff::BackoffState;
use crate::clock::Clock;
use crate::config::PollingConfig;
use crate::error::OutboxError;
use crate::key::OutboxKey;
use crate::listener::OutboxListener;
use crate::message::Message;
use crate::observer::OutboxObserver;
use crate::producer::{PollingProducer, ProducePendingOutcome};
use crate::retrier::CompletionRetrier;
use futures::FutureExt;
use log::{debug, error, info};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

enum NextWait {
    /// Wait for a trigger or the polling interval, whichever comes first.
    Interval,
    /// Sleep for the given time, ignoring triggers.
    Backoff(Duration),
}

/// Drives one outbox: retries pending completions, drains the outbox, then sleeps until
/// triggered, the polling interval elapses, or a backoff delay passes.
///
/// The service owns all per-instance state (backoff counters, completion queue), so it
/// needs no internal locking. Run exactly one per [`OutboxKey`].
pub struct PollingBackgroundService<M: Message> {
    key: OutboxKey,
    producer: PollingProducer<M>,
    retrier: CompletionRetrier<M>,
    listener: Arc<dyn OutboxListener>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn OutboxObserver>,
    config: PollingConfig,
    backoff: BackoffState,
}

impl<M: Message> PollingBackgroundService<M> {
    /// Assembles a service. `producer` and `retrier` must belong to the same key.
    pub fn new(
        producer: PollingProducer<M>,
        retrier: CompletionRetrier<M>,
        listener: Arc<dyn OutboxListener>,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn OutboxObserver>,
        config: PollingConfig,
    ) -> Self {
        Self {
            key: producer.key().clone(),
            producer,
            retrier,
            listener,
            clock,
            observer,
            config,
            backoff: BackoffState::default(),
        }
    }

    /// Runs until `cancel` fires. Never fails and never panics out: failures are logged
    /// and backed off.
    ///
    /// A cycle in flight when `cancel` fires finishes its current batch before returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Outbox '{}': polling service started", self.key);
        while !cancel.is_cancelled() {
            let next = match AssertUnwindSafe(self.run_cycle(&cancel))
                .catch_unwind()
                .await
            {
                Ok(next) => next,
                Err(panic) => {
                    let delay = self.backoff.on_unhandled(&self.config.backoff);
                    error!(
                        "Outbox '{}': polling cycle panicked: {}. Backing off for {:?}",
                        self.key,
                        panic_message(panic.as_ref()),
                        delay
                    );
                    NextWait::Backoff(delay)
                }
            };

            let waited = match next {
                NextWait::Interval => self.wait_for_trigger_or_interval(&cancel).await,
                NextWait::Backoff(delay) => self.clock.sleep(delay, &cancel).await,
            };
            match waited {
                Ok(()) => {}
                Err(OutboxError::Cancelled) => break,
                Err(e) => {
                    let delay = self.backoff.on_unhandled(&self.config.backoff);
                    error!(
                        "Outbox '{}': waiting for new messages failed: {}. Backing off for {:?}",
                        self.key, e, delay
                    );
                    if self.clock.sleep(delay, &cancel).await.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Outbox '{}': polling service stopped", self.key);
    }

    async fn run_cycle(&mut self, cancel: &CancellationToken) -> NextWait {
        if self.retrier.retry_all(cancel).await.is_err() {
            debug!(
                "Outbox '{}': completion retry interrupted by shutdown",
                self.key
            );
            return NextWait::Interval;
        }

        let outcome = self.producer.produce_pending(cancel).await;
        let kind = outcome.kind();
        self.observer.on_cycle_completed(&self.key, kind);
        match outcome {
            ProducePendingOutcome::Ok => {
                self.backoff.reset();
                NextWait::Interval
            }
            ProducePendingOutcome::CompleteError { pending } => {
                self.retrier.collect(pending);
                NextWait::Interval
            }
            ProducePendingOutcome::FetchError
            | ProducePendingOutcome::ProduceError
            | ProducePendingOutcome::PartialProduction => {
                let delay = self.backoff.on_failure(kind, &self.config.backoff);
                info!(
                    "Outbox '{}': cycle ended with {}, backing off for {:?}",
                    self.key,
                    kind.as_str(),
                    delay
                );
                NextWait::Backoff(delay)
            }
        }
    }

    async fn wait_for_trigger_or_interval(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), OutboxError> {
        tokio::select! {
            woken = self.listener.wait_for_messages(&self.key, cancel) => woken,
            slept = self.clock.sleep(self.config.polling_interval, cancel) => slept,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
