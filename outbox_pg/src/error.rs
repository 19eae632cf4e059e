use outbox_core::OutboxError;

/// Errors raised by the PostgreSQL provider.
#[derive(Debug, thiserror::Error)]
pub enum PgOutboxError {
    /// Database error.
    #[error("SQLx error: {0}")]
    Db(#[from] sqlx::Error),
    /// A table, column or channel name that is not a plain SQL identifier.
    #[error("Invalid identifier '{0}'")]
    InvalidIdentifier(String),
    /// A lease change notification that could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<PgOutboxError> for OutboxError {
    fn from(value: PgOutboxError) -> Self {
        match value {
            PgOutboxError::InvalidIdentifier(_) => OutboxError::configuration(value.to_string()),
            other => OutboxError::storage(other),
        }
    }
}

pub(crate) fn db(err: sqlx::Error) -> OutboxError {
    PgOutboxError::Db(err).into()
}
