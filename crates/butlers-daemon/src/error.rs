//! Daemon error types.

use thiserror::Error;

/// Errors raised while assembling or running a butler daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Manifest loading failed.
    #[error(transparent)]
    Config(#[from] butlers_config::ConfigError),

    /// Storage or migration failure.
    #[error(transparent)]
    Storage(#[from] butlers_storage::StorageError),

    /// Module resolution or lifecycle failure.
    #[error(transparent)]
    Module(#[from] butlers_module::ModuleError),

    /// Scheduler failure.
    #[error(transparent)]
    Scheduler(#[from] butlers_scheduler::SchedulerError),

    /// RPC listener failure.
    #[error(transparent)]
    Rpc(#[from] butlers_rpc::RpcError),

    /// Missing environment (DATABASE_URL, tokens).
    #[error("environment: {0}")]
    Environment(String),

    /// The personality document could not be read.
    #[error("failed to read {path}: {source}")]
    Personality {
        /// The file path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
