//! Error types and result handling for relay storage operations.
//!
//! Classifies database failures so callers can distinguish missing rows and
//! constraint violations (load-bearing for the idempotency race) from plain
//! connectivity problems.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and domain operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique, foreign-key, or check constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input rejected before reaching the database.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// True when the error is a unique-constraint violation.
    ///
    /// The ingress path uses this to resolve two concurrent inserts with the
    /// same `(source, idempotency_key)` pair: the loser re-reads the winner's
    /// event id.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation(msg) if msg.starts_with("unique"))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
