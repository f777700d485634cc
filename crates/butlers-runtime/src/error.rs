//! Runtime error types.

use thiserror::Error;

use butlers_core::ErrorClass;

/// Errors from the spawner and runtime adapters.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The butler's spawner permit is exhausted; re-entrant triggers
    /// fail fast here instead of deadlocking.
    #[error("spawner busy: {0}")]
    Overloaded(String),

    /// The session exceeded its deadline.
    #[error("session deadline exceeded after {timeout_s}s")]
    Deadline {
        /// The configured deadline.
        timeout_s: u64,
    },

    /// The child runtime failed to start or crashed.
    #[error("runtime adapter failed: {0}")]
    Adapter(String),

    /// The adapter produced output the spawner could not parse.
    #[error("unparseable runtime output: {0}")]
    BadOutput(String),

    /// Session bookkeeping failed.
    #[error(transparent)]
    Storage(#[from] butlers_storage::StorageError),
}

impl RuntimeError {
    /// The canonical class this failure maps to at the tool boundary.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Overloaded(_) => ErrorClass::OverloadRejected,
            Self::Deadline { .. } => ErrorClass::Timeout,
            Self::Adapter(_) | Self::BadOutput(_) | Self::Storage(_) => ErrorClass::InternalError,
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
