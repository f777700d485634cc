//! Request context — the immutable lineage record for a routed request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RequestId, SegmentId, SubrequestId};

/// The canonical request context assigned by Switchboard at ingest and
/// propagated to every routed session.
///
/// `request_id` is immutable through all fanout: children get fresh
/// `subrequest_id`/`segment_id` values while the root identity and the
/// source identities are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Root identity (UUIDv7), assigned once at ingest.
    pub request_id: RequestId,
    /// When Switchboard accepted the request.
    pub received_at: DateTime<Utc>,
    /// Originating channel (`telegram`, `email`, `api`, ...).
    pub source_channel: String,
    /// The endpoint that received the message (bot identity, mailbox).
    pub source_endpoint_identity: String,
    /// The external sender.
    pub source_sender_identity: String,
    /// Thread/chat identity on thread-capable channels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_thread_identity: Option<String>,
    /// Set on fanout: the subrequest this context was forked for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subrequest_id: Option<SubrequestId>,
    /// Set on fanout: the classification segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<SegmentId>,
    /// W3C `traceparent` payload, carried opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_context: Option<String>,
}

impl RequestContext {
    /// Create a root context for a newly ingested request.
    #[must_use]
    pub fn new(
        source_channel: impl Into<String>,
        source_endpoint_identity: impl Into<String>,
        source_sender_identity: impl Into<String>,
    ) -> Self {
        Self {
            request_id: RequestId::new(),
            received_at: Utc::now(),
            source_channel: source_channel.into(),
            source_endpoint_identity: source_endpoint_identity.into(),
            source_sender_identity: source_sender_identity.into(),
            source_thread_identity: None,
            subrequest_id: None,
            segment_id: None,
            trace_context: None,
        }
    }

    /// Set the thread identity.
    #[must_use]
    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.source_thread_identity = Some(thread.into());
        self
    }

    /// Set the trace context.
    #[must_use]
    pub fn with_trace(mut self, traceparent: impl Into<String>) -> Self {
        self.trace_context = Some(traceparent.into());
        self
    }

    /// Fork this context for one fanout subrequest.
    ///
    /// The root `request_id` and all source identities are preserved;
    /// only `subrequest_id` and `segment_id` are replaced.
    #[must_use]
    pub fn fork(&self, subrequest_id: SubrequestId, segment_id: Option<SegmentId>) -> Self {
        Self {
            subrequest_id: Some(subrequest_id),
            segment_id,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_preserves_root_identity() {
        let root = RequestContext::new("telegram", "bot-A", "user-9").with_thread("chat-5");
        let sub = SubrequestId::new();
        let forked = root.fork(sub, Some(SegmentId::from("seg-1")));

        assert_eq!(forked.request_id, root.request_id);
        assert_eq!(forked.source_channel, "telegram");
        assert_eq!(forked.source_sender_identity, "user-9");
        assert_eq!(forked.source_thread_identity.as_deref(), Some("chat-5"));
        assert_eq!(forked.subrequest_id, Some(sub));
        assert_eq!(forked.segment_id, Some(SegmentId::from("seg-1")));
    }

    #[test]
    fn optional_fields_are_omitted_from_wire_form() {
        let ctx = RequestContext::new("email", "inbox@example.com", "alice@example.com");
        let json = serde_json::to_value(&ctx).unwrap();
        assert!(json.get("subrequest_id").is_none());
        assert!(json.get("trace_context").is_none());
    }
}
