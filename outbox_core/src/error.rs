//! Errors shared by the engine and every storage provider.

use crate::key::OutboxKey;

/// An opaque failure raised by a collaborator (storage driver, broker producer...).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that cross the seams between the engine and its providers.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// The operation observed its cancellation token and stopped.
    #[error("operation cancelled")]
    Cancelled,
    /// The outbox was configured with invalid settings.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// A key was used that is not part of the closed set registered at startup.
    #[error("unknown outbox key {0}")]
    UnknownKey(OutboxKey),
    /// Completing a batch under a held lock touched a different number of rows than
    /// requested. This can't happen when the lock is working.
    #[error("completion affected {actual} messages, expected {expected}")]
    CompletionMismatch {
        /// Number of messages that were asked to be completed.
        expected: u64,
        /// Number of rows/documents the storage reported as affected.
        actual: u64,
    },
    /// A completion retry left messages that are still pending.
    #[error("{remaining} messages are still pending after retrying completion")]
    IncompleteCompletion {
        /// Number of messages still pending.
        remaining: u64,
    },
    /// The distributed lock guarding a batch was lost before the batch was completed.
    #[error("lock '{0}' was lost")]
    LockLost(String),
    /// The underlying storage failed.
    #[error("storage error: {0}")]
    Storage(#[source] BoxError),
}

impl OutboxError {
    /// Wraps a storage driver error.
    pub fn storage(err: impl Into<BoxError>) -> Self {
        Self::Storage(err.into())
    }

    /// Creates a configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }

    /// Whether this error only reports that the caller asked to stop.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
