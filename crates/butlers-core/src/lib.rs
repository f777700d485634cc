//! Butlers Core - Foundation types for the butlers agent fleet.
//!
//! This crate provides:
//! - The canonical cross-butler error taxonomy
//! - Typed identifiers (`RequestId`, `SubrequestId`, `SessionId`, ...)
//! - The immutable request context propagated through every routed hop
//! - Canonical wire envelopes (`ingest.v1`, `route.v1`, `notify.v1`, ...)
//! - Interactive lifecycle states and trigger provenance

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod circuit;
pub mod context;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod lifecycle;
pub mod trigger;

pub use circuit::{CircuitBreaker, CircuitState};
pub use context::RequestContext;
pub use envelope::{
    DeliveryIntent, ErrorEnvelope, HeartbeatV1, IngestControl, IngestEvent, IngestPayload,
    IngestSender, IngestSource, IngestV1, NotifyDelivery, NotifyResponseV1, NotifyV1,
    RouteResponseV1, RouteStatus, RouteV1, SourceMetadata,
};
pub use error::{ButlerError, ButlerResult, ErrorClass};
pub use ids::{ActionId, ButlerName, DeliveryId, RequestId, SegmentId, SessionId, SubrequestId};
pub use lifecycle::LifecycleState;
pub use trigger::TriggerSource;
