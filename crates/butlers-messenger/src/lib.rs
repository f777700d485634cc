//! Butlers Messenger - The single outbound delivery plane.
//!
//! Every external channel side effect in the fleet executes here, and
//! only here. A `notify.v1` arrives via `route.execute` (carried at
//! `input.context.notify_request`), is validated before any side
//! effect, keyed for at-most-one-effect idempotency, admitted through
//! layered rate budgets, delivered with bounded retries under a
//! per-provider circuit breaker, and audited across four tables.
//!
//! Per `(channel, thread)` causal order is preserved; there is no
//! cross-thread global order.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod engine;
pub mod idempotency;
pub mod presentation;
pub mod provider;
pub mod ratelimit;
pub mod store;
pub mod validate;

pub use engine::{DeliveryEngine, EngineConfig, MessengerPlane};
pub use idempotency::{content_hash, idempotency_key};
pub use presentation::{PresentedContent, present};
pub use provider::{
    DeliveryJob, HttpEmailProvider, ProviderAdapter, ProviderFailure, ProviderReceipt,
    TelegramProvider,
};
pub use ratelimit::{
    AdmissionDecision, RateLimiter, RateLimitsConfig, RejectedLayer, TokenBucket,
};
pub use store::{ClaimOutcome, DeliveryRecord, DeliveryStatus, DeliveryStore};
pub use validate::validate_notify;
