//! # Outbox core
//!
//! Storage agnostic engine of the transactional outbox: applications write messages to an
//! outbox table inside their own transaction, and one background task per outbox drains
//! that table into a message broker.
//!
//! A drain cycle claims a batch under the provider's concurrency control
//! ([`BatchFetcher`]), hands it to the user's [`BatchProducer`], completes what the broker
//! accepted and keeps going while more messages are pending. Failed cycles back off,
//! messages that were produced but could not be completed go through the
//! [`CompletionRetrier`] before anything new is claimed.

#![deny(missing_docs)]

mod backoff;
/// Batch contracts implemented by storage providers and broker producers.
pub mod batch;
/// Clocks.
pub mod clock;
/// Engine configuration.
pub mod config;
mod error;
/// Outbox registry.
pub mod host;
mod key;
/// Listener and trigger.
pub mod listener;
pub mod lock;
/// Message capability.
pub mod message;
/// Metrics/tracing port.
pub mod observer;
/// Batch loop.
pub mod producer;
/// Completion retrier.
pub mod retrier;
/// Background service.
pub mod service;

pub use batch::{
    BatchCompleteRetrier, BatchContext, BatchFetcher, BatchProducer, Cleaner, EmptyBatch,
    ProduceResult, ensure_all_completed,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackoffLadder, CompletionMode, DistributedLockConfig, PollingConfig};
pub use error::{BoxError, OutboxError};
pub use host::{OutboxHost, OutboxHostBuilder};
pub use key::OutboxKey;
pub use listener::{KeyedOutboxListener, OutboxListener, OutboxTrigger, SingleOutboxListener};
pub use lock::{DistributedLockManager, LockDefinition, LockHandle};
pub use message::{Message, NewOutboxMessage, OutboxMessage};
pub use observer::{NoopObserver, OutboxObserver};
pub use producer::{OutcomeKind, PollingProducer, ProducePendingOutcome};
pub use retrier::CompletionRetrier;
pub use service::PollingBackgroundService;

pub mod prelude {
    //! The prelude module for the `outbox_core` crate.
    pub use super::{
        BatchCompleteRetrier, BatchContext, BatchFetcher, BatchProducer, Clock, CompletionMode,
        Message, NewOutboxMessage, OutboxError, OutboxHost, OutboxKey, OutboxMessage,
        OutboxTrigger, ProduceResult,
    };
}
