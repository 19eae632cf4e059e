use crate::error::PgOutboxError;
use outbox_core::config::validate_batch_size;
use outbox_core::{CompletionMode, OutboxError};
use std::time::Duration;

const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Column used to order batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum OrderColumn {
    /// The `id` column.
    Id,
    /// The `created_at` column.
    CreatedAt,
}

impl OrderColumn {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            OrderColumn::Id => "id",
            OrderColumn::CreatedAt => "created_at",
        }
    }
}

/// The outbox table.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Table name, optionally schema qualified (`schema.table`).
    pub name: String,
    /// Batch order. `id` is appended as a tie breaker when missing.
    pub order_by: Vec<OrderColumn>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            name: "outbox_messages".to_string(),
            order_by: vec![OrderColumn::Id],
        }
    }
}

impl TableConfig {
    /// Checks the table name and order.
    pub fn validate(&self) -> Result<(), PgOutboxError> {
        validate_qualified_identifier(&self.name)?;
        if self.order_by.is_empty() {
            return Err(PgOutboxError::InvalidIdentifier(
                "order_by needs at least one column".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn order_clause(&self) -> String {
        let mut columns: Vec<&str> = Vec::new();
        for column in &self.order_by {
            if !columns.contains(&column.column()) {
                columns.push(column.column());
            }
        }
        if !columns.contains(&"id") {
            columns.push("id");
        }
        columns.join(", ")
    }

    /// Unqualified table name, used to name indexes.
    pub(crate) fn base_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }
}

/// Settings of the advisory lock strategy.
#[derive(Debug, Clone)]
pub struct AdvisoryLockConfig {
    /// How long a fetcher waits for the lock before giving up with an empty batch.
    pub wait_timeout: Duration,
    /// Name the lock key is derived from. Defaults to `outbox:<current database>`.
    pub lock_name: Option<String>,
}

impl Default for AdvisoryLockConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(15),
            lock_name: None,
        }
    }
}

/// How concurrent fetchers are kept from claiming the same messages.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub enum ConcurrencyControl {
    /// `SELECT ... FOR UPDATE` inside a transaction held for the batch.
    #[default]
    RowLocking,
    /// A session advisory lock held for the batch.
    AdvisoryLock(AdvisoryLockConfig),
}

/// Configuration of a PostgreSQL outbox.
#[derive(Debug, Clone)]
pub struct PgOutboxConfig {
    /// The outbox table.
    pub table: TableConfig,
    /// Maximum number of messages per batch.
    pub batch_size: usize,
    /// How completed messages are marked.
    pub completion_mode: CompletionMode,
    /// Concurrency strategy.
    pub concurrency: ConcurrencyControl,
}

impl Default for PgOutboxConfig {
    fn default() -> Self {
        Self {
            table: TableConfig::default(),
            batch_size: 100,
            completion_mode: CompletionMode::Delete,
            concurrency: ConcurrencyControl::RowLocking,
        }
    }
}

impl PgOutboxConfig {
    /// Checks the configuration.
    pub fn validate(&self) -> Result<(), OutboxError> {
        validate_batch_size(self.batch_size)?;
        self.table.validate()?;
        Ok(())
    }
}

/// The lease table backing distributed locks.
#[derive(Debug, Clone)]
pub struct PgLeaseConfig {
    /// Table name, optionally schema qualified.
    pub table: String,
    /// NOTIFY channel of the change feed.
    pub channel: String,
}

impl Default for PgLeaseConfig {
    fn default() -> Self {
        Self {
            table: "outbox_leases".to_string(),
            channel: "outbox_lease_changes".to_string(),
        }
    }
}

impl PgLeaseConfig {
    /// Checks the table and channel names.
    pub fn validate(&self) -> Result<(), PgOutboxError> {
        validate_qualified_identifier(&self.table)?;
        validate_identifier(&self.channel)
    }
}

fn validate_qualified_identifier(name: &str) -> Result<(), PgOutboxError> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(PgOutboxError::InvalidIdentifier(name.to_string()));
    }
    parts.into_iter().try_for_each(validate_identifier)
}

fn validate_identifier(name: &str) -> Result<(), PgOutboxError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid = valid_start
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= MAX_IDENTIFIER_LENGTH;
    if !valid {
        return Err(PgOutboxError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = PgOutboxConfig::default();
        assert_eq!(config.table.name, "outbox_messages");
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.completion_mode, CompletionMode::Delete);
        assert!(matches!(config.concurrency, ConcurrencyControl::RowLocking));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_advisory_lock_config() {
        let config = AdvisoryLockConfig::default();
        assert_eq!(config.wait_timeout, Duration::from_secs(15));
        assert!(config.lock_name.is_none());
    }

    #[test]
    fn identifiers_are_validated() {
        for name in ["outbox", "app.outbox", "_x1"] {
            assert!(validate_qualified_identifier(name).is_ok(), "{name}");
        }
        let too_long = "a".repeat(64);
        for name in ["", "1outbox", "out box", "a.b.c", "x;drop table y", too_long.as_str()] {
            assert!(validate_qualified_identifier(name).is_err(), "{name}");
        }
    }

    #[test]
    fn invalid_table_is_a_configuration_error() {
        let config = PgOutboxConfig {
            table: TableConfig {
                name: "bad name".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OutboxError::Configuration(_))
        ));
    }

    #[test]
    fn order_clause_ends_with_id() {
        let table = TableConfig {
            name: "app.outbox".to_string(),
            order_by: vec![OrderColumn::CreatedAt, OrderColumn::CreatedAt],
        };
        assert_eq!(table.order_clause(), "created_at, id");
        assert_eq!(table.base_name(), "outbox");
        assert_eq!(TableConfig::default().order_clause(), "id");
    }
}
