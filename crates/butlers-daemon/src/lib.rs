//! Butlers Daemon - Assembles one butler from its config directory.
//!
//! Startup order: manifest load → schema-pinned pool → migration plan
//! (core → plane chain → module chains in dependency order) → dangling
//! session recovery → schedule sync → spawner and approval gate →
//! plane construction (Switchboard and Messenger get their overrides)
//! → RPC listener → registry advertisement loop.
//!
//! Ownership is a strict DAG: the database sits under the modules,
//! modules under the spawner, the spawner under the RPC surface, and
//! connectors on top. Back-references travel as ids plus lookups,
//! never ownership.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod butler;
mod dispatcher;
mod error;
mod heartbeat;
mod modules;
mod planes;

pub use butler::{Butler, database_url_from_env};
pub use dispatcher::SpawnerDispatcher;
pub use error::{DaemonError, DaemonResult};
pub use heartbeat::run_fleet_tick;
pub use modules::build_module;
