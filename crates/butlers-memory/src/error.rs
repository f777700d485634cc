//! Memory error types.

use thiserror::Error;

/// Errors from the memory module.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// An illegal state transition was requested.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// Tenant scoping is mandatory.
    #[error("missing tenant")]
    MissingTenant,

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] butlers_storage::StorageError),
}

/// Result type for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;
