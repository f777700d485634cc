//! Canonical wire envelopes.
//!
//! Every cross-butler hop speaks one of these versioned envelopes:
//!
//! | Envelope | Hop |
//! |----------|-----|
//! | `ingest.v1` | connector → Switchboard |
//! | `route.v1` | Switchboard → target `route_execute` |
//! | `route_response.v1` | target → Switchboard |
//! | `notify.v1` | any butler → Switchboard → Messenger |
//! | `notify_response.v1` | Messenger → origin |
//! | `connector.heartbeat.v1` | connector → Switchboard |
//!
//! Validation is structural only; policy checks (trusted callers,
//! contract version ranges) live with the receiving component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::error::ErrorClass;
use crate::ids::{DeliveryId, RequestId};

/// Schema tag for `ingest.v1`.
pub const INGEST_V1: &str = "ingest.v1";
/// Schema tag for `route.v1`.
pub const ROUTE_V1: &str = "route.v1";
/// Schema tag for `route_response.v1`.
pub const ROUTE_RESPONSE_V1: &str = "route_response.v1";
/// Schema tag for `notify.v1`.
pub const NOTIFY_V1: &str = "notify.v1";
/// Schema tag for `notify_response.v1`.
pub const NOTIFY_RESPONSE_V1: &str = "notify_response.v1";
/// Schema tag for `connector.heartbeat.v1`.
pub const HEARTBEAT_V1: &str = "connector.heartbeat.v1";

// ---------------------------------------------------------------------------
// ingest.v1
// ---------------------------------------------------------------------------

/// Where an ingested event came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSource {
    /// Channel name (`telegram`, `email`, `api`).
    pub channel: String,
    /// Provider implementation (`telegram_bot_api`, `imap`, ...).
    pub provider: String,
    /// The receiving endpoint (bot identity, mailbox address).
    pub endpoint_identity: String,
}

/// The provider-side event identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestEvent {
    /// Provider event id (telegram `update_id`, email `Message-ID`).
    pub external_event_id: String,
    /// Provider thread id, when the channel has threads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_thread_id: Option<String>,
    /// When the connector observed the event.
    pub observed_at: DateTime<Utc>,
}

/// The external sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSender {
    /// Sender identity as the provider reports it.
    pub identity: String,
}

/// The message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestPayload {
    /// Raw provider payload, preserved for audit.
    pub raw: serde_json::Value,
    /// Normalized plain text for classification.
    pub normalized_text: String,
}

/// Connector-supplied control fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestControl {
    /// Caller-chosen idempotency key for API-style channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// W3C `traceparent`, carried opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<String>,
    /// Optional admission policy tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_tier: Option<String>,
}

/// Canonical ingest envelope — the sole entry point into Switchboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestV1 {
    /// Must be `"ingest.v1"`.
    pub schema_version: String,
    /// Source triple.
    pub source: IngestSource,
    /// Event identity.
    pub event: IngestEvent,
    /// Sender identity.
    pub sender: IngestSender,
    /// Message body.
    pub payload: IngestPayload,
    /// Control fields.
    #[serde(default)]
    pub control: IngestControl,
}

impl IngestV1 {
    /// Structural validation: schema tag plus non-empty identities.
    ///
    /// # Errors
    ///
    /// Returns the first violated field name.
    pub fn validate(&self) -> Result<(), String> {
        if self.schema_version != INGEST_V1 {
            return Err(format!("unknown schema_version: {}", self.schema_version));
        }
        if self.source.channel.is_empty() {
            return Err("source.channel must not be empty".to_owned());
        }
        if self.source.endpoint_identity.is_empty() {
            return Err("source.endpoint_identity must not be empty".to_owned());
        }
        if self.event.external_event_id.is_empty() {
            return Err("event.external_event_id must not be empty".to_owned());
        }
        if self.sender.identity.is_empty() {
            return Err("sender.identity must not be empty".to_owned());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// route.v1 / route_response.v1
// ---------------------------------------------------------------------------

/// The prompt and context handed to a routed butler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteInput {
    /// The prompt text for the target's spawner.
    pub prompt: String,
    /// Structured side-channel context. The Switchboard→Messenger hop
    /// carries `notify_request` here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

/// Provenance of the routed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Originating channel.
    pub channel: String,
    /// Caller identity (the routing butler's name).
    pub identity: String,
    /// The tool that produced this route.
    pub tool_name: String,
}

/// Routed execution envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteV1 {
    /// Must be `"route.v1"`.
    pub schema_version: String,
    /// Shared request lineage.
    pub request_context: RequestContext,
    /// Prompt and context.
    pub input: RouteInput,
    /// Call provenance.
    pub source_metadata: SourceMetadata,
}

impl RouteV1 {
    /// Build a `route.v1` envelope.
    #[must_use]
    pub fn new(request_context: RequestContext, prompt: impl Into<String>) -> Self {
        Self {
            schema_version: ROUTE_V1.to_owned(),
            request_context,
            input: RouteInput {
                prompt: prompt.into(),
                context: None,
            },
            source_metadata: SourceMetadata {
                channel: String::new(),
                identity: String::new(),
                tool_name: String::new(),
            },
        }
    }

    /// Attach structured context.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.input.context = Some(context);
        self
    }

    /// Set call provenance.
    #[must_use]
    pub fn with_source(
        mut self,
        channel: impl Into<String>,
        identity: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        self.source_metadata = SourceMetadata {
            channel: channel.into(),
            identity: identity.into(),
            tool_name: tool_name.into(),
        };
        self
    }

    /// The `notify.v1` payload carried on the Switchboard→Messenger
    /// hop, if present at `input.context.notify_request`.
    #[must_use]
    pub fn notify_request(&self) -> Option<&serde_json::Value> {
        self.input.context.as_ref()?.get("notify_request")
    }
}

/// Terminal status of a routed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    /// The subrequest completed successfully.
    Ok,
    /// The subrequest failed; `error` carries the class.
    Error,
}

/// A classified error on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Canonical class.
    pub class: ErrorClass,
    /// Human-readable message.
    pub message: String,
    /// Whether the caller may retry.
    pub retryable: bool,
}

impl ErrorEnvelope {
    /// Build from a class and message, deriving `retryable`.
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            retryable: class.retryable(),
        }
    }
}

/// Timing block of a route response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTiming {
    /// Wall-clock duration of the routed execution.
    pub duration_ms: u64,
}

/// Response envelope for one routed subrequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteResponseV1 {
    /// Must be `"route_response.v1"`.
    pub schema_version: String,
    /// Echoed request lineage.
    pub request_context: RequestContext,
    /// Terminal status.
    pub status: RouteStatus,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
    /// Timing.
    pub timing: RouteTiming,
}

impl RouteResponseV1 {
    /// Build a success response.
    #[must_use]
    pub fn ok(
        request_context: RequestContext,
        result: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            schema_version: ROUTE_RESPONSE_V1.to_owned(),
            request_context,
            status: RouteStatus::Ok,
            result: Some(result),
            error: None,
            timing: RouteTiming { duration_ms },
        }
    }

    /// Build a failure response.
    #[must_use]
    pub fn err(request_context: RequestContext, error: ErrorEnvelope, duration_ms: u64) -> Self {
        Self {
            schema_version: ROUTE_RESPONSE_V1.to_owned(),
            request_context,
            status: RouteStatus::Error,
            result: None,
            error: Some(error),
            timing: RouteTiming { duration_ms },
        }
    }

    /// Validate against the request id the caller dispatched.
    ///
    /// # Errors
    ///
    /// Returns a description of the mismatch or missing field.
    pub fn validate_for(&self, expected: RequestId) -> Result<(), String> {
        if self.schema_version != ROUTE_RESPONSE_V1 {
            return Err(format!("unknown schema_version: {}", self.schema_version));
        }
        if self.request_context.request_id != expected {
            return Err(format!(
                "request_id mismatch: expected {expected}, got {}",
                self.request_context.request_id
            ));
        }
        match self.status {
            RouteStatus::Ok => Ok(()),
            RouteStatus::Error if self.error.is_some() => Ok(()),
            RouteStatus::Error => Err("error status without error envelope".to_owned()),
        }
    }
}

// ---------------------------------------------------------------------------
// notify.v1 / notify_response.v1
// ---------------------------------------------------------------------------

/// Outbound delivery intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryIntent {
    /// Unsolicited outbound message.
    Send,
    /// Reply within the thread of the originating request.
    Reply,
    /// Reaction on the originating message (telegram only).
    React,
}

impl DeliveryIntent {
    /// The wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Send => "send",
            Self::Reply => "reply",
            Self::React => "react",
        }
    }
}

/// The delivery block of a `notify.v1` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyDelivery {
    /// What to do.
    pub intent: DeliveryIntent,
    /// Target channel.
    pub channel: String,
    /// Message body (required for send/reply).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Explicit recipient identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Contact-book reference, resolved by Messenger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    /// Email subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Reaction emoji (required for react).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
}

/// Outbound notification envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyV1 {
    /// Must be `"notify.v1"`.
    pub schema_version: String,
    /// The butler asking for the delivery.
    pub origin_butler: String,
    /// What to deliver.
    pub delivery: NotifyDelivery,
    /// Originating request lineage, when replying or reacting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_context: Option<RequestContext>,
}

impl NotifyV1 {
    /// Build a plain send.
    #[must_use]
    pub fn send(
        origin_butler: impl Into<String>,
        channel: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: NOTIFY_V1.to_owned(),
            origin_butler: origin_butler.into(),
            delivery: NotifyDelivery {
                intent: DeliveryIntent::Send,
                channel: channel.into(),
                message: Some(message.into()),
                recipient: None,
                contact_id: None,
                subject: None,
                emoji: None,
            },
            request_context: None,
        }
    }
}

/// The delivery block of a `notify_response.v1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResponseDelivery {
    /// Channel the delivery went out on.
    pub channel: String,
    /// Stable delivery id on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<DeliveryId>,
}

/// Response to a `notify.v1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResponseV1 {
    /// Must be `"notify_response.v1"`.
    pub schema_version: String,
    /// Echoed request id lineage.
    pub request_context: NotifyResponseContext,
    /// Terminal status.
    pub status: RouteStatus,
    /// Delivery outcome.
    pub delivery: NotifyResponseDelivery,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorEnvelope>,
}

/// The echoed lineage of a notify response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResponseContext {
    /// The originating request id, when the notify carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

impl NotifyResponseV1 {
    /// Build a success response.
    #[must_use]
    pub fn ok(request_id: Option<RequestId>, channel: impl Into<String>, id: DeliveryId) -> Self {
        Self {
            schema_version: NOTIFY_RESPONSE_V1.to_owned(),
            request_context: NotifyResponseContext { request_id },
            status: RouteStatus::Ok,
            delivery: NotifyResponseDelivery {
                channel: channel.into(),
                delivery_id: Some(id),
            },
            error: None,
        }
    }

    /// Build a failure response.
    #[must_use]
    pub fn err(
        request_id: Option<RequestId>,
        channel: impl Into<String>,
        error: ErrorEnvelope,
    ) -> Self {
        Self {
            schema_version: NOTIFY_RESPONSE_V1.to_owned(),
            request_context: NotifyResponseContext { request_id },
            status: RouteStatus::Error,
            delivery: NotifyResponseDelivery {
                channel: channel.into(),
                delivery_id: None,
            },
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// connector.heartbeat.v1
// ---------------------------------------------------------------------------

/// Periodic liveness beacon from a connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatV1 {
    /// Must be `"connector.heartbeat.v1"`.
    pub schema_version: String,
    /// Channel the connector serves.
    pub channel: String,
    /// The connector's endpoint identity.
    pub endpoint_identity: String,
    /// When the beacon was emitted.
    pub emitted_at: DateTime<Utc>,
    /// Events accepted since the previous beacon.
    pub accepted_since_last: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ingest() -> IngestV1 {
        IngestV1 {
            schema_version: INGEST_V1.to_owned(),
            source: IngestSource {
                channel: "telegram".to_owned(),
                provider: "telegram_bot_api".to_owned(),
                endpoint_identity: "bot-A".to_owned(),
            },
            event: IngestEvent {
                external_event_id: "42".to_owned(),
                external_thread_id: Some("chat-5".to_owned()),
                observed_at: Utc::now(),
            },
            sender: IngestSender {
                identity: "user-9".to_owned(),
            },
            payload: IngestPayload {
                raw: serde_json::json!({"update_id": 42}),
                normalized_text: "Log 180/90 BP".to_owned(),
            },
            control: IngestControl::default(),
        }
    }

    #[test]
    fn ingest_validates() {
        assert!(sample_ingest().validate().is_ok());
    }

    #[test]
    fn ingest_rejects_unknown_schema_version() {
        let mut env = sample_ingest();
        env.schema_version = "ingest.v2".to_owned();
        let err = env.validate().unwrap_err();
        assert!(err.contains("unknown schema_version"));
    }

    #[test]
    fn ingest_rejects_empty_sender() {
        let mut env = sample_ingest();
        env.sender.identity = String::new();
        assert!(env.validate().is_err());
    }

    #[test]
    fn route_response_rejects_request_id_mismatch() {
        let ctx = RequestContext::new("telegram", "bot-A", "user-9");
        let resp = RouteResponseV1::ok(ctx, serde_json::json!({"ok": true}), 12);
        let other = RequestId::new();
        assert!(resp.validate_for(other).is_err());
        assert!(
            resp.validate_for(resp.request_context.request_id)
                .is_ok()
        );
    }

    #[test]
    fn route_response_error_requires_envelope() {
        let ctx = RequestContext::new("telegram", "bot-A", "user-9");
        let id = ctx.request_id;
        let mut resp =
            RouteResponseV1::err(ctx, ErrorEnvelope::new(ErrorClass::Timeout, "deadline"), 5);
        assert!(resp.validate_for(id).is_ok());
        resp.error = None;
        assert!(resp.validate_for(id).is_err());
    }

    #[test]
    fn notify_request_is_reachable_from_route_context() {
        let notify = NotifyV1::send("health", "telegram", "Hi");
        let ctx = RequestContext::new("telegram", "bot-A", "user-9");
        let route = RouteV1::new(ctx, "deliver notification").with_context(serde_json::json!({
            "notify_request": serde_json::to_value(&notify).unwrap(),
        }));

        let carried = route.notify_request().expect("notify_request present");
        let back: NotifyV1 = serde_json::from_value(carried.clone()).unwrap();
        assert_eq!(back, notify);
    }

    #[test]
    fn error_envelope_derives_retryable() {
        let e = ErrorEnvelope::new(ErrorClass::Timeout, "deadline");
        assert!(e.retryable);
        let e = ErrorEnvelope::new(ErrorClass::ValidationError, "bad");
        assert!(!e.retryable);
    }
}
