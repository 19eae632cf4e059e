use crate::advisory::AdvisoryLockBatchFetcher;
use crate::completion::{PgCleaner, PgCompletionRetrier};
use crate::config::{ConcurrencyControl, PgOutboxConfig};
use crate::error::PgOutboxError;
use crate::queries::{PgMessage, Queries};
use crate::row_lock::RowLockBatchFetcher;
use log::info;
use outbox_core::{BatchFetcher, Clock, NewOutboxMessage, OutboxError, SystemClock};
use sqlx::{PgExecutor, PgPool};
use std::sync::Arc;

/// A PostgreSQL outbox table and the components draining it.
///
/// ```ignore
/// let outbox = PgOutbox::new(pool.clone(), PgOutboxConfig::default())?;
/// outbox.initialize().await?;
///
/// let mut tx = pool.begin().await?;
/// // ... business writes ...
/// outbox.insert_message(&mut *tx, &NewOutboxMessage::new("order.created", payload)).await?;
/// tx.commit().await?;
/// ```
#[derive(Debug, Clone)]
pub struct PgOutbox {
    pool: PgPool,
    config: PgOutboxConfig,
    queries: Arc<Queries>,
    clock: Arc<dyn Clock>,
}

impl PgOutbox {
    /// Validates `config` and prepares the SQL for its table.
    pub fn new(pool: PgPool, config: PgOutboxConfig) -> Result<Self, OutboxError> {
        config.validate()?;
        let queries = Arc::new(Queries::new(&config.table));
        Ok(Self {
            pool,
            config,
            queries,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the clock timing the advisory lock wait.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The configuration.
    pub fn config(&self) -> &PgOutboxConfig {
        &self.config
    }

    /// Creates the outbox table and its pending index if they don't exist.
    pub async fn initialize(&self) -> Result<(), PgOutboxError> {
        sqlx::query(&self.queries.create_table)
            .execute(&self.pool)
            .await?;
        sqlx::query(&self.queries.create_index)
            .execute(&self.pool)
            .await?;
        info!("Outbox table '{}' ready", self.config.table.name);
        Ok(())
    }

    /// Writes a message with `executor`, typically the application's own transaction.
    pub async fn insert_message<'a, T>(
        &self,
        executor: T,
        message: &NewOutboxMessage,
    ) -> Result<i64, PgOutboxError>
    where
        T: PgExecutor<'a>,
    {
        let (id,): (i64,) = sqlx::query_as(&self.queries.insert)
            .bind(&message.message_type)
            .bind(&message.payload)
            .bind(message.created_at)
            .bind(&message.trace_context)
            .fetch_one(executor)
            .await?;
        Ok(id)
    }

    /// The fetcher of the configured concurrency strategy.
    pub fn fetcher(&self) -> Arc<dyn BatchFetcher<PgMessage>> {
        match &self.config.concurrency {
            ConcurrencyControl::RowLocking => Arc::new(self.row_lock_fetcher()),
            ConcurrencyControl::AdvisoryLock(lock) => Arc::new(AdvisoryLockBatchFetcher::new(
                self.pool.clone(),
                self.queries.clone(),
                self.config.batch_size,
                self.config.completion_mode,
                lock.clone(),
                self.clock.clone(),
            )),
        }
    }

    /// A row locking fetcher, whatever the configured strategy.
    pub fn row_lock_fetcher(&self) -> RowLockBatchFetcher {
        RowLockBatchFetcher::new(
            self.pool.clone(),
            self.queries.clone(),
            self.config.batch_size,
            self.config.completion_mode,
        )
    }

    /// Completion retrier for messages produced but not completed.
    pub fn completion_retrier(&self) -> PgCompletionRetrier {
        PgCompletionRetrier::new(
            self.pool.clone(),
            self.queries.clone(),
            self.config.completion_mode,
        )
    }

    /// Cleaner purging messages completed in update mode.
    pub fn cleaner(&self) -> PgCleaner {
        PgCleaner::new(self.pool.clone(), self.queries.clone())
    }
}
