//! Error types for the label calculation engine.

use thiserror::Error;

/// Result type alias using the engine's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// SQLSTATE raised by PostgreSQL when a serializable transaction is aborted.
const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";

/// SQLSTATE raised by PostgreSQL when a deadlock is detected.
const SQLSTATE_DEADLOCK_DETECTED: &str = "40P01";

/// Core error type for label calculation.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Dataset not found
    #[error("Dataset not found: {0}")]
    DatasetNotFound(i32),

    /// Trigger payload could not be parsed
    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a transaction abort raised by the storage
    /// layer's concurrency control (serialization failure or deadlock).
    ///
    /// These are not retried: the recalculation gate exists to prevent them,
    /// so one getting through is reported as a failed attempt.
    pub fn is_serialization_conflict(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db)) => matches!(
                db.code().as_deref(),
                Some(SQLSTATE_SERIALIZATION_FAILURE) | Some(SQLSTATE_DEADLOCK_DETECTED)
            ),
            _ => false,
        }
    }
}
