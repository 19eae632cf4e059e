use crate::error::db;
use crate::queries::{PgMessage, Queries};
use async_trait::async_trait;
use log::{debug, info};
use outbox_core::message::ids_of;
use outbox_core::{BatchCompleteRetrier, Cleaner, CompletionMode, OutboxError};
use sqlx::{PgExecutor, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs the completion statement for `ids` and returns the affected row count.
pub(crate) async fn complete_ids<'e, E>(
    executor: E,
    queries: &Queries,
    mode: CompletionMode,
    ids: &[i64],
) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(queries.complete(mode))
        .bind(ids)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

/// Completes previously produced messages outside of any batch.
#[derive(Debug, Clone)]
pub struct PgCompletionRetrier {
    pool: PgPool,
    queries: Arc<Queries>,
    mode: CompletionMode,
}

impl PgCompletionRetrier {
    pub(crate) fn new(pool: PgPool, queries: Arc<Queries>, mode: CompletionMode) -> Self {
        Self {
            pool,
            queries,
            mode,
        }
    }
}

#[async_trait]
impl BatchCompleteRetrier<PgMessage> for PgCompletionRetrier {
    async fn retry_complete(
        &self,
        messages: &[PgMessage],
        _cancel: &CancellationToken,
    ) -> Result<(), OutboxError> {
        if messages.is_empty() {
            return Ok(());
        }
        let ids = ids_of(messages);
        let affected = complete_ids(&self.pool, &self.queries, self.mode, &ids)
            .await
            .map_err(db)?;
        if affected == ids.len() as u64 {
            return Ok(());
        }

        // Someone else may have completed part of them already, which is fine.
        let (remaining,): (i64,) = sqlx::query_as(&self.queries.count_pending)
            .bind(&ids)
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        if remaining > 0 {
            return Err(OutboxError::IncompleteCompletion {
                remaining: remaining as u64,
            });
        }
        info!(
            "{} of {} messages were already completed elsewhere",
            ids.len() as u64 - affected,
            ids.len()
        );
        Ok(())
    }
}

/// Purges messages completed in update mode.
#[derive(Debug, Clone)]
pub struct PgCleaner {
    pool: PgPool,
    queries: Arc<Queries>,
}

impl PgCleaner {
    pub(crate) fn new(pool: PgPool, queries: Arc<Queries>) -> Self {
        Self { pool, queries }
    }
}

#[async_trait]
impl Cleaner for PgCleaner {
    async fn clean(
        &self,
        max_age: Duration,
        cancel: &CancellationToken,
    ) -> Result<u64, OutboxError> {
        if cancel.is_cancelled() {
            return Err(OutboxError::Cancelled);
        }
        let result = sqlx::query(&self.queries.clean)
            .bind(max_age.as_secs_f64())
            .execute(&self.pool)
            .await
            .map_err(db)?;
        debug!("Cleaned {} processed messages", result.rows_affected());
        Ok(result.rows_affected())
    }
}
