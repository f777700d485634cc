//! Scheduler error types.

use thiserror::Error;

/// Errors from the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A cron expression failed to parse or yields no future fire time.
    #[error("bad cron expression '{expr}': {message}")]
    BadCron {
        /// The expression.
        expr: String,
        /// Why it was rejected.
        message: String,
    },

    /// The task was not found.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] butlers_storage::StorageError),
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
