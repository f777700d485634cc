//! Subscriber setup.
//!
//! One butler process installs exactly one global subscriber at startup.
//! The filter comes from the config level plus any extra directives,
//! with `RUST_LOG` taking precedence when set.

use tracing_subscriber::EnvFilter;

use crate::error::{TelemetryError, TelemetryResult};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable multi-line output for interactive runs.
    Pretty,
    /// Single-line output for service logs.
    #[default]
    Compact,
    /// Structured JSON for log shippers.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base level directive (`error`..`trace`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Extra per-target directives (e.g. `"butlers_messenger=debug"`).
    pub directives: Vec<String>,
}

impl LogConfig {
    /// Create a config with the given base level.
    #[must_use]
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            format: LogFormat::default(),
            directives: Vec::new(),
        }
    }

    /// Set the output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Add a per-target directive.
    #[must_use]
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    fn build_filter(&self) -> TelemetryResult<EnvFilter> {
        // RUST_LOG wins over configured levels when present.
        if std::env::var("RUST_LOG").is_ok() {
            return EnvFilter::try_from_default_env()
                .map_err(|e| TelemetryError::ConfigError(e.to_string()));
        }
        let mut filter = EnvFilter::try_new(&self.level)
            .map_err(|e| TelemetryError::ConfigError(e.to_string()))?;
        for directive in &self.directives {
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|e| TelemetryError::ConfigError(format!("{directive}: {e}")))?,
            );
        }
        Ok(filter)
    }
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns [`TelemetryError::InitError`] if a subscriber is already
/// installed, or [`TelemetryError::ConfigError`] for a bad directive.
pub fn setup_logging(config: &LogConfig) -> TelemetryResult<()> {
    let filter = config.build_filter()?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| TelemetryError::InitError(e.to_string()))
}

/// Install a compact `info`-level subscriber.
///
/// # Errors
///
/// Returns [`TelemetryError::InitError`] if a subscriber is already
/// installed.
pub fn setup_default_logging() -> TelemetryResult<()> {
    setup_logging(&LogConfig::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_directives() {
        let config = LogConfig::new("info")
            .with_format(LogFormat::Json)
            .with_directive("butlers_messenger=debug")
            .with_directive("sqlx=warn");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.directives.len(), 2);
    }

    #[test]
    fn bad_directive_is_a_config_error() {
        let config = LogConfig::new("info").with_directive("===");
        let err = config.build_filter().unwrap_err();
        assert!(matches!(err, TelemetryError::ConfigError(_)));
    }
}
