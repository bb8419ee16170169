use thiserror::Error;

/// Error taxonomy shared by the store, the loops, the admin API and the CLI.
///
/// `Database` covers transient errors (connection loss, timeouts); callers
/// on hot paths log those and rely on the next tick instead of retrying
/// inline.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition: {0}")]
    Precondition(String),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// True when the underlying database error is a unique-constraint
    /// violation (idempotency keys, registry double-insert).
    pub fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => db.is_unique_violation(),
            _ => false,
        }
    }
}
