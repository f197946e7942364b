//! Error types for job storage.

use thiserror::Error;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Failed to establish the database connection pool.
    #[error("connection error: {0}")]
    Connection(String),

    /// A query failed.
    #[error("query error: {0}")]
    Query(#[from] sqlx::Error),

    /// The referenced staged job does not exist.
    #[error("no staged job with id {0}")]
    RowNotFound(i64),

    /// A stored status value is not part of the job state machine.
    #[error("invalid job status: {0}")]
    InvalidStatus(String),

    /// A stored client port is outside the 16-bit range.
    #[error("invalid client port: {0}")]
    InvalidPort(i64),
}
