//! Butlers Telemetry - Logging and tracing for the butlers agent fleet.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats
//! - The tool-span attribute contract every tool handler follows
//!
//! # Span attribute contract
//!
//! Every tool handler span carries the required low-cardinality
//! attributes: `butler`, `tool_name`, `outcome`, `trigger_source`, and
//! where applicable `error_class` and `source_channel`. High-cardinality
//! identifiers (request ids, raw sender/thread ids, message text) are
//! recorded on events inside the span, never as span fields.
//!
//! # Example
//!
//! ```rust,no_run
//! use butlers_telemetry::{LogConfig, LogFormat, setup_logging, ToolSpan};
//!
//! # fn main() -> Result<(), butlers_telemetry::TelemetryError> {
//! setup_logging(&LogConfig::new("info").with_format(LogFormat::Json))?;
//!
//! let span = ToolSpan::new("health", "trigger").with_trigger_source("external");
//! let _guard = span.enter();
//! tracing::info!("handling tool call");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod error;
mod logging;
mod span;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::{LogConfig, LogFormat, setup_default_logging, setup_logging};
pub use span::{ToolOutcome, ToolSpan};
