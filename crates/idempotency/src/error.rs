use messaging::HandlerError;
use thiserror::Error;

/// Errors that can occur while consulting or updating idempotency records.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IdempotencyError {
    /// A failed lookup or insert can always be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, IdempotencyError::Database(_))
    }
}

impl From<IdempotencyError> for HandlerError {
    fn from(err: IdempotencyError) -> Self {
        if err.is_transient() {
            HandlerError::transient(err)
        } else {
            HandlerError::permanent(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, IdempotencyError>;
