//! Approval error types.

use thiserror::Error;

/// Errors from the approval gate.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// The action was not found.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// The rule was not found.
    #[error("unknown standing rule: {0}")]
    UnknownRule(String),

    /// A decision-bearing operation was attempted by a non-human actor.
    #[error("decision requires a human actor; got {actor_kind} '{actor}'")]
    NonHumanActor {
        /// The rejected actor identity.
        actor: String,
        /// The actor kind that was rejected.
        actor_kind: String,
    },

    /// The gated tool has no registered executor.
    #[error("no executor registered for gated tool '{0}'")]
    NoExecutor(String),

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] butlers_storage::StorageError),
}

/// Result type for approval operations.
pub type ApprovalResult<T> = Result<T, ApprovalError>;
