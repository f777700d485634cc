//! Butlers Runtime - The ephemeral LLM runtime.
//!
//! A butler never talks to a model directly: the [`Spawner`] serializes
//! invocations through a per-butler permit, opens a session row before
//! the model runs, composes the system prompt (personality document
//! plus optional memory context), snapshots the declared credential
//! environment, executes the [`RuntimeAdapter`], and writes terminal
//! fields afterwards.
//!
//! Re-entry protection: a `trigger` issued while the same butler's
//! permit is held fails fast with `overload_rejected` instead of
//! deadlocking.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod adapter;
mod error;
mod spawner;

pub use adapter::{
    ClaudeCodeAdapter, RuntimeAdapter, SpawnRequest, SpawnUsage, SpawnedResult, ToolCallRecord,
};
pub use error::{RuntimeError, RuntimeResult};
pub use spawner::{ContextHook, SessionSummary, Spawner, SpawnerConfig};
