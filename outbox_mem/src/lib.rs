//! # Outbox memory store
//!
//! In-memory outbox provider, primarily for testing. It behaves like a document store
//! without native advisory locks: batches are claimed under a lease from the
//! [`DistributedLockManager`](outbox_core::DistributedLockManager), stored in an
//! [`InMemoryLeaseStore`] that offers a change feed.
//!
//! ```ignore
//! let store = InMemoryOutboxStore::new();
//! let leases = Arc::new(InMemoryLeaseStore::new());
//! let fetcher = InMemoryBatchFetcher::new(key, store.clone(), leases, clock, config)?;
//!
//! store.insert(NewOutboxMessage::new("order.created", payload)).await;
//! let mut batch = fetcher.fetch_and_hold(&cancel).await?;
//! ```

#![deny(missing_docs)]

mod cleaner;
mod completion;
mod config;
mod fetcher;
mod lease_store;
mod store;

pub use cleaner::InMemoryCleaner;
pub use completion::InMemoryCompletionRetrier;
pub use config::{InMemoryOutboxConfig, SortOrder};
pub use fetcher::InMemoryBatchFetcher;
pub use lease_store::InMemoryLeaseStore;
pub use store::{InMemoryMessage, InMemoryOutboxError, InMemoryOutboxStore};
