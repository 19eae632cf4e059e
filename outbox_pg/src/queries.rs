use crate::config::TableConfig;
use chrono::{DateTime, Utc};
use outbox_core::{CompletionMode, OutboxMessage};
use sqlx::FromRow;

/// Message type read from a PostgreSQL outbox.
pub type PgMessage = OutboxMessage<i64>;

#[derive(Debug, FromRow)]
pub(crate) struct PgMessageRow {
    id: i64,
    message_type: String,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
    trace_context: Option<Vec<u8>>,
    processed_at: Option<DateTime<Utc>>,
}

impl From<PgMessageRow> for PgMessage {
    fn from(row: PgMessageRow) -> Self {
        OutboxMessage {
            id: row.id,
            message_type: row.message_type,
            payload: row.payload,
            created_at: row.created_at,
            trace_context: row.trace_context,
            processed_at: row.processed_at,
        }
    }
}

/// SQL for one outbox table, rendered once from a validated [`TableConfig`].
#[derive(Debug)]
pub(crate) struct Queries {
    pub create_table: String,
    pub create_index: String,
    pub insert: String,
    pub select_for_update: String,
    pub select: String,
    pub exists_pending: String,
    pub delete: String,
    pub mark_processed: String,
    pub count_pending: String,
    pub clean: String,
}

const COLUMNS: &str = "id, message_type, payload, created_at, trace_context, processed_at";

impl Queries {
    pub fn new(table: &TableConfig) -> Self {
        let t = &table.name;
        let order = table.order_clause();
        let select = format!(
            "SELECT {COLUMNS} FROM {t} WHERE processed_at IS NULL ORDER BY {order} LIMIT $1"
        );
        Self {
            create_table: format!(
                r#"
                CREATE TABLE IF NOT EXISTS {t} (
                    id BIGSERIAL PRIMARY KEY,
                    message_type TEXT NOT NULL,
                    payload BYTEA NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    trace_context BYTEA,
                    processed_at TIMESTAMPTZ
                )
                "#
            ),
            create_index: format!(
                "CREATE INDEX IF NOT EXISTS {}_pending_idx ON {t} ({order}) WHERE processed_at IS NULL",
                table.base_name()
            ),
            insert: format!(
                "INSERT INTO {t} (message_type, payload, created_at, trace_context) \
                 VALUES ($1, $2, $3, $4) RETURNING id"
            ),
            select_for_update: format!("{select} FOR UPDATE"),
            select,
            exists_pending: format!(
                "SELECT EXISTS (SELECT 1 FROM {t} WHERE processed_at IS NULL)"
            ),
            delete: format!("DELETE FROM {t} WHERE id = ANY($1) AND processed_at IS NULL"),
            mark_processed: format!(
                "UPDATE {t} SET processed_at = NOW() WHERE id = ANY($1) AND processed_at IS NULL"
            ),
            count_pending: format!(
                "SELECT COUNT(*) FROM {t} WHERE id = ANY($1) AND processed_at IS NULL"
            ),
            clean: format!(
                "DELETE FROM {t} WHERE processed_at IS NOT NULL \
                 AND processed_at < NOW() - make_interval(secs => $1)"
            ),
        }
    }

    pub fn complete(&self, mode: CompletionMode) -> &str {
        match mode {
            CompletionMode::Delete => &self.delete,
            CompletionMode::Update => &self.mark_processed,
        }
    }
}
