use crate::config::PgLeaseConfig;
use crate::error::{PgOutboxError, db};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use log::{debug, warn};
use outbox_core::OutboxError;
use outbox_core::lock::{Lease, LeaseChange, LeaseChangeStream, LeaseStore};
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::{FromRow, PgPool};

#[derive(Debug, FromRow)]
struct LeaseRow {
    lock_id: String,
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct LeaseNotification {
    lock_id: String,
    op: String,
}

impl LeaseNotification {
    fn decode(payload: &str) -> Result<Self, PgOutboxError> {
        Ok(serde_json::from_str(payload)?)
    }

    fn change(&self) -> LeaseChange {
        if self.op == "DELETE" {
            LeaseChange::Deleted
        } else {
            LeaseChange::Upserted
        }
    }
}

/// Distributed lock leases in a PostgreSQL table, one row per lock id.
///
/// The change feed is a LISTEN on the channel fed by the table's trigger, see
/// [`PgLeaseStore::initialize`].
#[derive(Debug, Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
    config: PgLeaseConfig,
}

impl PgLeaseStore {
    /// Creates a store over `config.table`.
    pub fn new(pool: PgPool, config: PgLeaseConfig) -> Result<Self, PgOutboxError> {
        config.validate()?;
        Ok(Self { pool, config })
    }

    /// Creates the lease table and the trigger publishing its changes. Idempotent.
    pub async fn initialize(&self) -> Result<(), PgOutboxError> {
        let table = &self.config.table;
        let function = format!("{}_notify", table.replace('.', "_"));
        let trigger = format!("{}_notify_trigger", table.rsplit('.').next().unwrap_or(table));

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                lock_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            r#"
            CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $$
            BEGIN
                IF TG_OP = 'DELETE' THEN
                    PERFORM pg_notify('{channel}',
                        json_build_object('lock_id', OLD.lock_id, 'op', TG_OP)::text);
                    RETURN OLD;
                END IF;
                PERFORM pg_notify('{channel}',
                    json_build_object('lock_id', NEW.lock_id, 'op', TG_OP)::text);
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;
            "#,
            channel = self.config.channel
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!("DROP TRIGGER IF EXISTS {trigger} ON {table}"))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            r#"
            CREATE TRIGGER {trigger}
            AFTER INSERT OR UPDATE OR DELETE ON {table}
            FOR EACH ROW
            EXECUTE FUNCTION {function}()
            "#
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn try_upsert(
        &self,
        lock_id: &str,
        owner: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, OutboxError> {
        let table = &self.config.table;
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {table} (lock_id, owner, expires_at)
            VALUES ($1, $2, $4)
            ON CONFLICT (lock_id) DO UPDATE
                SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                WHERE {table}.owner = EXCLUDED.owner OR {table}.expires_at <= $3
            "#
        ))
        .bind(lock_id)
        .bind(owner)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_owned(&self, lock_id: &str, owner: &str) -> Result<bool, OutboxError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE lock_id = $1 AND owner = $2",
            self.config.table
        ))
        .bind(lock_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, lock_id: &str) -> Result<Option<Lease>, OutboxError> {
        let row: Option<LeaseRow> = sqlx::query_as(&format!(
            "SELECT lock_id, owner, expires_at FROM {} WHERE lock_id = $1",
            self.config.table
        ))
        .bind(lock_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        Ok(row.map(|row| Lease {
            lock_id: row.lock_id,
            owner: row.owner,
            expires_at: row.expires_at,
        }))
    }

    async fn watch(&self, lock_id: &str) -> Result<Option<LeaseChangeStream>, OutboxError> {
        let mut listener = PgListener::connect_with(&self.pool).await.map_err(db)?;
        listener.listen(&self.config.channel).await.map_err(db)?;
        debug!(
            "Watching lease '{}' on channel '{}'",
            lock_id, self.config.channel
        );

        let lock_id = lock_id.to_string();
        let changes = listener.into_stream().filter_map(move |notification| {
            let change = match notification {
                Ok(notification) => {
                    match LeaseNotification::decode(notification.payload()) {
                        Ok(event) if event.lock_id == lock_id => Some(event.change()),
                        Ok(_) => None,
                        Err(e) => {
                            warn!("Ignoring malformed lease notification: {}", e);
                            None
                        }
                    }
                }
                Err(e) => {
                    // Lease expiry polling still applies when the feed goes quiet.
                    warn!("Lease change feed error: {}", e);
                    None
                }
            };
            futures::future::ready(change)
        });
        Ok(Some(changes.boxed()))
    }
}
