//! Butlers Config - Manifest loading for butler daemons.
//!
//! A butler's config directory holds a declarative `butler.toml` manifest
//! plus personality/prompt documents (`CLAUDE.md`). This crate parses the
//! manifest into a validated in-memory structure covering butler identity,
//! port, database schema, enabled modules with per-module config blocks,
//! schedule entries, environment-variable declarations, runtime-spawner
//! settings, and switchboard integration parameters.
//!
//! Secrets come from the environment only: `${NAME}` references resolve
//! at startup, unresolved required references are startup-blocking, and
//! literal secret values in the file are rejected.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod env;
mod error;
mod loader;
mod types;
mod validate;

pub use env::{resolve_env_references, snapshot_declared};
pub use error::{ConfigError, ConfigResult};
pub use loader::{MANIFEST_FILE, PERSONALITY_FILE, load_dir, load_file, load_str};
pub use types::{
    ApprovalsSection, ButlerManifest, ButlerSection, DbSection, EnvSection, GatedTool,
    ModuleSection, PricingEntry, RuntimeKind, RuntimeSection, ScheduleDispatch, ScheduleEntry,
    SecuritySection, SwitchboardSection,
};
