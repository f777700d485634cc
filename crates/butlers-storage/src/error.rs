//! Storage error types.

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Pool or connection setup failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A query failed.
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    /// The migration plan is internally inconsistent.
    #[error("migration conflict: {0}")]
    MigrationConflict(String),

    /// A caller-supplied value failed validation.
    #[error("validation: {0}")]
    Validation(String),

    /// A row was expected but not found.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
