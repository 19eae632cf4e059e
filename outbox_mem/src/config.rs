use outbox_core::config::validate_batch_size;
use outbox_core::{CompletionMode, DistributedLockConfig, OutboxError};

/// Order in which pending messages are claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum SortOrder {
    /// Insertion order.
    #[default]
    Id,
    /// Creation time, ties broken by insertion order.
    CreatedAt,
}

/// Configuration of an in-memory outbox.
#[derive(Debug, Clone)]
pub struct InMemoryOutboxConfig {
    /// Maximum number of messages per batch.
    pub batch_size: usize,
    /// How completed messages are marked.
    pub completion_mode: CompletionMode,
    /// Claim order.
    pub sort_order: SortOrder,
    /// Lease settings of the lock guarding each batch.
    pub lock: DistributedLockConfig,
}

impl Default for InMemoryOutboxConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            completion_mode: CompletionMode::Delete,
            sort_order: SortOrder::Id,
            lock: DistributedLockConfig::default(),
        }
    }
}

impl InMemoryOutboxConfig {
    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), OutboxError> {
        validate_batch_size(self.batch_size)?;
        self.lock.validate()
    }
}
