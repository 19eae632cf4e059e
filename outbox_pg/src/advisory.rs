use crate::completion::complete_ids;
use crate::config::AdvisoryLockConfig;
use crate::error::{PgOutboxError, db};
use crate::queries::{PgMessage, PgMessageRow, Queries};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use outbox_core::clock::{checked_offset, remaining_until};
use outbox_core::message::ids_of;
use outbox_core::{
    BatchContext, BatchFetcher, Clock, CompletionMode, EmptyBatch, OutboxError,
    ensure_all_completed,
};
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Derives the 64-bit advisory lock key of a lock name.
///
/// The first eight bytes of the name's SHA-256 digest, so any name length maps to a
/// stable key.
pub fn advisory_lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Claims batches while holding a session advisory lock.
///
/// Only one fetcher per lock name is mid-batch at a time; a fetcher that cannot get the
/// lock within [`AdvisoryLockConfig::wait_timeout`] returns an empty batch.
#[derive(Debug)]
pub struct AdvisoryLockBatchFetcher {
    pool: PgPool,
    queries: Arc<Queries>,
    batch_size: i64,
    mode: CompletionMode,
    config: AdvisoryLockConfig,
    clock: Arc<dyn Clock>,
    key: OnceCell<i64>,
}

impl AdvisoryLockBatchFetcher {
    pub(crate) fn new(
        pool: PgPool,
        queries: Arc<Queries>,
        batch_size: usize,
        mode: CompletionMode,
        config: AdvisoryLockConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pool,
            queries,
            batch_size: batch_size as i64,
            mode,
            config,
            clock,
            key: OnceCell::new(),
        }
    }

    /// The advisory lock key, resolving the database name on first use.
    pub async fn lock_key(&self) -> Result<i64, PgOutboxError> {
        self.key
            .get_or_try_init(|| async {
                let name = match &self.config.lock_name {
                    Some(name) => name.clone(),
                    None => {
                        let (database,): (String,) = sqlx::query_as("SELECT current_database()")
                            .fetch_one(&self.pool)
                            .await?;
                        format!("outbox:{database}")
                    }
                };
                Ok::<_, PgOutboxError>(advisory_lock_key(&name))
            })
            .await
            .copied()
    }

    async fn try_lock(
        &self,
        conn: &mut PgConnection,
        key: i64,
        cancel: &CancellationToken,
    ) -> Result<bool, OutboxError> {
        let deadline = checked_offset(self.clock.now(), self.config.wait_timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        loop {
            let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut *conn)
                .await
                .map_err(db)?;
            if locked {
                return Ok(true);
            }
            let now = self.clock.now();
            if now >= deadline {
                return Ok(false);
            }
            self.clock
                .sleep(remaining_until(now, deadline, LOCK_RETRY_INTERVAL), cancel)
                .await?;
        }
    }
}

#[async_trait]
impl BatchFetcher<PgMessage> for AdvisoryLockBatchFetcher {
    async fn fetch_and_hold(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn BatchContext<PgMessage>>, OutboxError> {
        let key = self.lock_key().await?;
        let mut conn = self.pool.acquire().await.map_err(db)?;
        if !self.try_lock(&mut conn, key, cancel).await? {
            debug!(
                "Advisory lock {} still held after {:?}, skipping this cycle",
                key, self.config.wait_timeout
            );
            return Ok(EmptyBatch::boxed());
        }

        let rows: Vec<PgMessageRow> = match sqlx::query_as(&self.queries.select)
            .bind(self.batch_size)
            .fetch_all(&mut *conn)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                unlock(&mut conn, key).await;
                return Err(db(e));
            }
        };
        if rows.is_empty() {
            unlock(&mut conn, key).await;
            return Ok(EmptyBatch::boxed());
        }
        debug!("Claimed {} outbox rows under advisory lock {}", rows.len(), key);
        Ok(Box::new(AdvisoryLockBatch {
            conn: Some(conn),
            key,
            pool: self.pool.clone(),
            queries: self.queries.clone(),
            mode: self.mode,
            messages: rows.into_iter().map(PgMessage::from).collect(),
        }))
    }
}

async fn unlock(conn: &mut PoolConnection<Postgres>, key: i64) {
    let unlocked: Result<(bool,), sqlx::Error> = sqlx::query_as("SELECT pg_advisory_unlock($1)")
        .bind(key)
        .fetch_one(&mut **conn)
        .await;
    match unlocked {
        Ok((true,)) => debug!("Advisory lock {} released", key),
        Ok((false,)) => {
            warn!("Advisory lock {} was not held by this session", key);
            conn.close_on_drop();
        }
        Err(e) => {
            // Closing the session releases the lock server side.
            warn!("Failed to release advisory lock {}: {}", key, e);
            conn.close_on_drop();
        }
    }
}

struct AdvisoryLockBatch {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
    pool: PgPool,
    queries: Arc<Queries>,
    mode: CompletionMode,
    messages: Vec<PgMessage>,
}

#[async_trait]
impl BatchContext<PgMessage> for AdvisoryLockBatch {
    fn messages(&self) -> &[PgMessage] {
        &self.messages
    }

    async fn complete(
        &mut self,
        ok: &[PgMessage],
        _cancel: &CancellationToken,
    ) -> Result<(), OutboxError> {
        let Some(mut conn) = self.conn.take() else {
            warn!("Batch completed twice, ignoring");
            return Ok(());
        };
        let result = if ok.is_empty() {
            Ok(())
        } else {
            match complete_ids(&mut *conn, &self.queries, self.mode, &ids_of(ok)).await {
                Ok(affected) => ensure_all_completed(ok.len(), affected),
                Err(e) => Err(db(e)),
            }
        };
        unlock(&mut conn, self.key).await;
        result
    }

    async fn has_next(&mut self, _cancel: &CancellationToken) -> Result<bool, OutboxError> {
        let (exists,): (bool,) = sqlx::query_as(&self.queries.exists_pending)
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        Ok(exists)
    }

    async fn dispose(mut self: Box<Self>) {
        if let Some(mut conn) = self.conn.take() {
            unlock(&mut conn, self.key).await;
        }
    }
}

impl Drop for AdvisoryLockBatch {
    fn drop(&mut self) {
        // Never disposed: the session must not go back to the pool holding the lock.
        if let Some(conn) = self.conn.as_mut() {
            conn.close_on_drop();
        }
    }
}
