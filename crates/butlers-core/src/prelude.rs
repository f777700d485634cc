//! Convenience re-exports for downstream crates.

pub use crate::context::RequestContext;
pub use crate::envelope::{
    DeliveryIntent, ErrorEnvelope, IngestV1, NotifyResponseV1, NotifyV1, RouteResponseV1,
    RouteStatus, RouteV1,
};
pub use crate::error::{ButlerError, ButlerResult, ErrorClass};
pub use crate::ids::{
    ActionId, ButlerName, DeliveryId, RequestId, SegmentId, SessionId, SubrequestId,
};
pub use crate::lifecycle::LifecycleState;
pub use crate::trigger::TriggerSource;
