//! Butlers Module - The capability module runtime.
//!
//! A module is an opt-in plugin contributing tools, migration chains,
//! and lifecycle hooks to a butler. Modules declare their dependencies;
//! the runtime resolves a topological startup order (cycles and unknown
//! names are startup-blocking) and runs shutdown hooks in reverse.
//!
//! The runtime also enforces channel egress ownership: on non-Messenger
//! butlers any declared output tool matching the channel send/reply/
//! react pattern is stripped before registration, guaranteeing Messenger
//! is the sole outbound execution plane.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod registry;
mod tool;
mod traits;

pub use error::{ModuleError, ModuleResult};
pub use registry::{ModuleRegistry, is_channel_egress_tool};
pub use tool::{ApprovalDefault, ToolDescriptor, ToolHandler, ToolOutput, ToolScope};
pub use traits::{ButlerModule, ModuleContext};
