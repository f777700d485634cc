//! Config error types.

use thiserror::Error;

/// Errors raised while loading or validating a butler manifest.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The manifest file could not be read.
    #[error("failed to read {path}: {source}")]
    ReadError {
        /// Path that failed.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The manifest is not valid TOML or does not match the schema.
    #[error("failed to parse {path}: {source}")]
    ParseError {
        /// Path that failed.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: Box<toml::de::Error>,
    },

    /// A field failed validation.
    #[error("invalid config field {field}: {message}")]
    ValidationError {
        /// Dotted field path.
        field: String,
        /// What went wrong.
        message: String,
    },

    /// A required `${NAME}` reference did not resolve from the process
    /// environment at startup.
    #[error("unresolved environment variable: {name}")]
    UnresolvedEnvVar {
        /// The missing variable.
        name: String,
    },

    /// A secret-looking key carried a literal value instead of a
    /// `${NAME}` reference.
    #[error("literal secret in config at {field}; use a ${{NAME}} environment reference")]
    LiteralSecret {
        /// Dotted field path.
        field: String,
    },

    /// The manifest enabled a module this build does not know.
    #[error("unknown module: {name}")]
    UnknownModule {
        /// The unknown module name.
        name: String,
    },
}

/// Result type for config operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
