//! Error types for the materialization pipeline.

use thiserror::Error;

/// Query pipeline errors.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid request options: {0}")]
    InvalidOptions(String),

    #[error("unknown query id: {0}")]
    UnknownQuery(String),

    #[error("datasource error: {0}")]
    Datasource(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("row encoding error: {0}")]
    Encode(String),

    #[error("materialization canceled")]
    Canceled,

    #[error(transparent)]
    Storage(#[from] quarry_storage::StorageError),

    #[error(transparent)]
    Core(#[from] quarry_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for query pipeline operations.
pub type QueryResult<T> = std::result::Result<T, QueryError>;
