//! # Outbox
//!
//! Transactional outbox: write messages to an outbox table in the same transaction as the
//! business change, and let a background host deliver them to the broker.
//!
//! The engine lives in [`outbox_core`]; storage providers are enabled with the `in-memory`
//! and `postgres` features.

#![deny(missing_docs)]

pub use outbox_core::*;

#[cfg(feature = "in-memory")]
/// In-memory provider.
pub mod mem {
    //! Document-store style provider kept in memory, mostly for tests.
    pub use outbox_mem::*;
}

#[cfg(feature = "postgres")]
/// PostgreSQL provider.
pub mod pg {
    //! PostgreSQL provider built on `sqlx`.
    pub use outbox_pg::*;
}

pub mod prelude {
    //! The prelude module for the `outbox` crate.
    pub use outbox_core::prelude::*;

    #[cfg(feature = "in-memory")]
    pub use super::mem::{InMemoryBatchFetcher, InMemoryCompletionRetrier, InMemoryOutboxStore};
    #[cfg(feature = "postgres")]
    pub use super::pg::{PgOutbox, PgOutboxConfig};
}
