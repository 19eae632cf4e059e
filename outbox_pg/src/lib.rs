//! # Outbox postgres store
//!
//! PostgreSQL provider of the outbox engine. Messages live in a plain table written by the
//! application inside its own transaction ([`PgOutbox::insert_message`]); batches are
//! claimed either with row locks held in a transaction or under a session advisory lock.
//! [`PgLeaseStore`] backs the distributed lock manager with a lease table whose changes are
//! published through LISTEN/NOTIFY.

#![deny(missing_docs)]

mod advisory;
mod completion;
/// Provider configuration.
pub mod config;
mod error;
mod lease_store;
mod outbox;
mod queries;
mod row_lock;

pub use advisory::{AdvisoryLockBatchFetcher, advisory_lock_key};
pub use completion::{PgCleaner, PgCompletionRetrier};
pub use config::{
    AdvisoryLockConfig, ConcurrencyControl, OrderColumn, PgLeaseConfig, PgOutboxConfig,
    TableConfig,
};
pub use error::PgOutboxError;
pub use lease_store::PgLeaseStore;
pub use outbox::PgOutbox;
pub use queries::PgMessage;
pub use row_lock::RowLockBatchFetcher;
