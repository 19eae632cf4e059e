//! Contracts between the polling engine and storage providers / broker producers.

use crate::error::{BoxError, OutboxError};
use crate::key::OutboxKey;
use crate::message::Message;
use async_trait::async_trait;
use std::marker::PhantomData;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A claimed batch of messages together with the lock or transaction held for it.
///
/// Implementations must release the held resource exactly once: either inside
/// [`complete`](BatchContext::complete) (whatever its outcome) or inside
/// [`dispose`](BatchContext::dispose) when `complete` was never reached. Disposing a batch
/// that was never completed must leave every message untouched.
#[async_trait]
pub trait BatchContext<M: Message>: Send {
    /// The claimed messages, in the configured order.
    fn messages(&self) -> &[M];

    /// Marks `ok` as done and releases the held resource.
    ///
    /// An empty `ok` completes nothing but still releases (rolls back) the resource.
    async fn complete(&mut self, ok: &[M], cancel: &CancellationToken) -> Result<(), OutboxError>;

    /// Whether more messages are waiting after this batch.
    async fn has_next(&mut self, cancel: &CancellationToken) -> Result<bool, OutboxError>;

    /// Releases the held resource if `complete` didn't already.
    async fn dispose(self: Box<Self>);
}

/// The batch handed out when the lock was not acquired or nothing was pending.
///
/// Holds nothing, so completing or disposing it is a no-op.
#[derive(Debug)]
pub struct EmptyBatch<M> {
    _message: PhantomData<fn() -> M>,
}

impl<M: Message> EmptyBatch<M> {
    /// Boxes an empty batch.
    pub fn boxed() -> Box<dyn BatchContext<M>> {
        Box::new(Self {
            _message: PhantomData,
        })
    }
}

#[async_trait]
impl<M: Message> BatchContext<M> for EmptyBatch<M> {
    fn messages(&self) -> &[M] {
        &[]
    }

    async fn complete(&mut self, _ok: &[M], _cancel: &CancellationToken) -> Result<(), OutboxError> {
        Ok(())
    }

    async fn has_next(&mut self, _cancel: &CancellationToken) -> Result<bool, OutboxError> {
        Ok(false)
    }

    async fn dispose(self: Box<Self>) {}
}

/// Atomically claims the next batch of pending messages under the provider's
/// concurrency control.
#[async_trait]
pub trait BatchFetcher<M: Message>: Send + Sync {
    /// Claims up to the configured batch size of messages.
    ///
    /// Lock contention is not an error: it yields an empty batch.
    async fn fetch_and_hold(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn BatchContext<M>>, OutboxError>;
}

/// The subset of a batch the broker accepted.
#[derive(Debug, Clone)]
pub struct ProduceResult<M> {
    /// Messages successfully delivered.
    pub ok: Vec<M>,
}

impl<M: Message> ProduceResult<M> {
    /// Every message was delivered.
    pub fn all(messages: &[M]) -> Self {
        Self {
            ok: messages.to_vec(),
        }
    }

    /// Only `ok` was delivered.
    pub fn partial(ok: Vec<M>) -> Self {
        Self { ok }
    }
}

/// User supplied bridge to the message broker.
#[async_trait]
pub trait BatchProducer<M: Message>: Send + Sync {
    /// Pushes `messages` to the broker and reports which of them were accepted.
    ///
    /// Returning an error means nothing was delivered.
    async fn produce(
        &self,
        key: &OutboxKey,
        messages: &[M],
        cancel: &CancellationToken,
    ) -> Result<ProduceResult<M>, BoxError>;
}

/// Completes already produced messages without any lock held.
#[async_trait]
pub trait BatchCompleteRetrier<M: Message>: Send + Sync {
    /// Runs the completion again. Messages that someone else already completed are not an
    /// error; only messages that are genuinely still pending are.
    async fn retry_complete(
        &self,
        messages: &[M],
        cancel: &CancellationToken,
    ) -> Result<(), OutboxError>;
}

/// Purges messages that were completed in [`CompletionMode::Update`](crate::CompletionMode::Update).
#[async_trait]
pub trait Cleaner: Send + Sync {
    /// Deletes processed messages older than `max_age` and returns how many were removed.
    async fn clean(&self, max_age: Duration, cancel: &CancellationToken)
    -> Result<u64, OutboxError>;
}

/// Checks the affected count of a completion done under a held lock.
pub fn ensure_all_completed(expected: usize, affected: u64) -> Result<(), OutboxError> {
    if affected != expected as u64 {
        return Err(OutboxError::CompletionMismatch {
            expected: expected as u64,
            actual: affected,
        });
    }
    Ok(())
}
