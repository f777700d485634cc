//! Butlers Memory - Episodes, facts, rules, and budgeted retrieval.
//!
//! Three artifact classes with distinct lifecycles:
//! - **Episodes**: append-only observations, TTL-managed, with a
//!   consolidation state machine (`pending → consolidated | failed |
//!   dead_letter`).
//! - **Facts**: subject/predicate/content triples with decaying
//!   confidence and a validity state machine (`active → fading →
//!   superseded | expired | retracted`). Active-fact uniqueness per
//!   `(tenant, scope, subject, predicate)` is enforced by the database.
//! - **Rules**: behavioral guidance with maturity progression
//!   (`candidate → established → proven | anti_pattern`); harmful
//!   evidence outweighs helpful.
//!
//! Retrieval returns a deterministically ordered context block under a
//! token budget. Tenant scoping is mandatory; non-memory callers see
//! their own scope plus `global`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod module;
mod retrieval;
mod store;
mod types;

pub use error::{MemoryError, MemoryResult};
pub use module::MemoryModule;
pub use retrieval::{RetrievalBudget, RetrievalInput, approximate_tokens, build_context};
pub use store::MemoryStore;
pub use types::{
    ConsolidationState, Episode, Fact, FactState, MemoryRule, RuleMaturity, effective_confidence,
};
