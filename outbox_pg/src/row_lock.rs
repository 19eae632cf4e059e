use crate::completion::complete_ids;
use crate::error::db;
use crate::queries::{PgMessage, PgMessageRow, Queries};
use async_trait::async_trait;
use log::{debug, warn};
use outbox_core::message::ids_of;
use outbox_core::{
    BatchContext, BatchFetcher, CompletionMode, EmptyBatch, OutboxError, ensure_all_completed,
};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Claims batches with `SELECT ... FOR UPDATE` in a transaction kept open until the batch
/// is completed.
///
/// A concurrent fetcher selecting the same rows blocks in the database until that
/// transaction ends.
#[derive(Debug, Clone)]
pub struct RowLockBatchFetcher {
    pool: PgPool,
    queries: Arc<Queries>,
    batch_size: i64,
    mode: CompletionMode,
}

impl RowLockBatchFetcher {
    pub(crate) fn new(
        pool: PgPool,
        queries: Arc<Queries>,
        batch_size: usize,
        mode: CompletionMode,
    ) -> Self {
        Self {
            pool,
            queries,
            batch_size: batch_size as i64,
            mode,
        }
    }
}

#[async_trait]
impl BatchFetcher<PgMessage> for RowLockBatchFetcher {
    async fn fetch_and_hold(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn BatchContext<PgMessage>>, OutboxError> {
        if cancel.is_cancelled() {
            return Err(OutboxError::Cancelled);
        }
        let mut tx = self.pool.begin().await.map_err(db)?;
        let rows: Vec<PgMessageRow> = sqlx::query_as(&self.queries.select_for_update)
            .bind(self.batch_size)
            .fetch_all(&mut *tx)
            .await
            .map_err(db)?;
        if rows.is_empty() {
            tx.rollback().await.map_err(db)?;
            return Ok(EmptyBatch::boxed());
        }
        debug!("Locked {} outbox rows", rows.len());
        Ok(Box::new(RowLockBatch {
            tx: Some(tx),
            pool: self.pool.clone(),
            queries: self.queries.clone(),
            mode: self.mode,
            messages: rows.into_iter().map(PgMessage::from).collect(),
        }))
    }
}

struct RowLockBatch {
    tx: Option<Transaction<'static, Postgres>>,
    pool: PgPool,
    queries: Arc<Queries>,
    mode: CompletionMode,
    messages: Vec<PgMessage>,
}

#[async_trait]
impl BatchContext<PgMessage> for RowLockBatch {
    fn messages(&self) -> &[PgMessage] {
        &self.messages
    }

    async fn complete(
        &mut self,
        ok: &[PgMessage],
        _cancel: &CancellationToken,
    ) -> Result<(), OutboxError> {
        let Some(mut tx) = self.tx.take() else {
            warn!("Batch completed twice, ignoring");
            return Ok(());
        };
        if ok.is_empty() {
            return tx.rollback().await.map_err(db);
        }
        let affected = match complete_ids(&mut *tx, &self.queries, self.mode, &ids_of(ok)).await
        {
            Ok(affected) => affected,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Rollback after failed completion failed: {}", rollback);
                }
                return Err(db(e));
            }
        };
        if let Err(e) = ensure_all_completed(ok.len(), affected) {
            if let Err(rollback) = tx.rollback().await {
                warn!("Rollback after completion mismatch failed: {}", rollback);
            }
            return Err(e);
        }
        tx.commit().await.map_err(db)
    }

    async fn has_next(&mut self, _cancel: &CancellationToken) -> Result<bool, OutboxError> {
        let (exists,): (bool,) = sqlx::query_as(&self.queries.exists_pending)
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        Ok(exists)
    }

    async fn dispose(mut self: Box<Self>) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                warn!("Rolling back an uncompleted batch failed: {}", e);
            }
        }
    }
}
