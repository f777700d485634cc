//! Butlers Approval - The human approval gate.
//!
//! Registered output tools matched by the config's gated set (union the
//! identity-default rule: user-scoped send/reply are always gated) pass
//! through the gate. A standing rule match pre-approves and executes
//! immediately; otherwise the call is parked as a pending action and
//! the caller receives a structured `pending_approval` result — tools
//! return a variant, they never raise for control flow.
//!
//! Decision-bearing operations (approve, reject, standing-rule create
//! and revoke) require an authenticated human actor. Auto-approved and
//! human-approved actions share the same executor path, so audit rows
//! and status transitions are identical either way.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod gate;
mod rules;
mod store;
mod types;

pub use error::{ApprovalError, ApprovalResult};
pub use gate::{ApprovalGate, GatePolicy};
pub use rules::{constraint_matches, rule_matches};
pub use store::ApprovalStore;
pub use types::{
    Actor, ActorKind, ApprovalRecord, ApprovalStatus, ArgConstraint, StandingRule,
};
