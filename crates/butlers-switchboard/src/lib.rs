//! Butlers Switchboard - The single ingress and orchestration plane.
//!
//! One external message flows: canonical `ingest.v1` validation →
//! channel-aware dedupe → inbox persistence with a fresh UUIDv7
//! request id → lifecycle `PROGRESS` signal → bounded admission queue
//! with channel fairness → LLM classification (injection-isolated,
//! fail-safe to `general`) → fanout execution with dependency modes and
//! per-target circuit breakers → aggregation → terminal `PARSED` or
//! `ERRORED`, persisted to the inbox with the routing log.
//!
//! Switchboard also owns the butler registry and terminates `notify`
//! by forwarding to Messenger.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod classify;
pub mod dedupe;
pub mod ingress;
pub mod inbox;
pub mod plan;
pub mod plane;
pub mod registry;
pub mod router;
pub mod transport;

pub use classify::{Classifier, ClassifierAdapter, Decomposition, parse_decomposition};
pub use dedupe::dedupe_key;
pub use ingress::{
    AdmissionQueue, IngestAccept, IngressService, LifecycleSignaler, OverflowPolicy, RoutingWork,
};
pub use inbox::{InboxRow, InboxStore, InsertOutcome};
pub use plan::{DependencyMode, FanoutPlan, Segment, arbitrate};
pub use plane::SwitchboardPlane;
pub use registry::{ButlerRecord, Liveness, Registry};
pub use router::{RouteTransport, Router, RouterBudget, SubrouteOutcome};
pub use transport::{RegistryTransport, RuntimeClassifierAdapter};
