//! Butlers Storage - Per-butler Postgres persistence.
//!
//! Every butler owns one schema inside a shared physical database. This
//! crate provides:
//! - [`Database`]: a connection pool pinned to the butler's schema
//! - The migration runner: core chain + butler chain + module chains
//! - [`StateStore`]: the per-butler key → JSON map
//! - [`SessionLog`]: durable spawner session records with cost reporting
//!
//! Cross-butler access is impossible by construction: a pool's
//! `search_path` is fixed at connect time and no API takes a schema
//! name.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod chains;
pub mod db;
pub mod error;
pub mod migrate;
pub mod sessions;
pub mod state;

pub use db::Database;
pub use error::{StorageError, StorageResult};
pub use migrate::{Migration, MigrationChain, MigrationPlan, MigrationRunner};
pub use sessions::{
    DailyUsage, OpenSession, PricingTable, ScheduleCost, SessionFilter, SessionLog,
    SessionRecord, SessionTerminal, SummaryPeriod, UsageSummary,
};
pub use state::{StateEntry, StateStore};
