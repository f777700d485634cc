//! Switchboard's plane override.
//!
//! Switchboard terminates `notify`: any butler's notification is
//! forwarded to Messenger as a `route.v1` carrying the payload at
//! `input.context.notify_request`, with the origin butler's
//! authenticated identity asserted in `source_metadata`. `notify` is
//! not recursive on Switchboard itself.

use std::sync::Arc;

use async_trait::async_trait;

use butlers_core::{
    ErrorClass, ErrorEnvelope, NotifyResponseV1, NotifyV1, RequestContext, RouteResponseV1,
    RouteStatus, RouteV1,
};
use butlers_rpc::PlaneOverride;

use crate::router::RouteTransport;

/// Name of the delivery plane butler.
const MESSENGER: &str = "messenger";

/// The Switchboard plane.
pub struct SwitchboardPlane {
    transport: Arc<dyn RouteTransport>,
}

impl std::fmt::Debug for SwitchboardPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchboardPlane").finish_non_exhaustive()
    }
}

impl SwitchboardPlane {
    /// Create the plane over the routing transport.
    #[must_use]
    pub fn new(transport: Arc<dyn RouteTransport>) -> Self {
        Self { transport }
    }

    async fn forward_to_messenger(
        &self,
        caller: &str,
        envelope: &NotifyV1,
        context: RequestContext,
    ) -> NotifyResponseV1 {
        let request_id = envelope.request_context.as_ref().map(|c| c.request_id);
        let channel = envelope.delivery.channel.clone();

        let notify_value = match serde_json::to_value(envelope) {
            Ok(value) => value,
            Err(e) => {
                return NotifyResponseV1::err(
                    request_id,
                    channel,
                    ErrorEnvelope::new(ErrorClass::InternalError, e.to_string()),
                );
            },
        };
        let route = RouteV1::new(context, "deliver notification")
            .with_context(serde_json::json!({"notify_request": notify_value}))
            .with_source(envelope.delivery.channel.clone(), caller, "notify");

        match self.transport.dispatch(MESSENGER, &route).await {
            Ok(response) => match response.status {
                RouteStatus::Ok => response
                    .result
                    .and_then(|r| serde_json::from_value(r).ok())
                    .unwrap_or_else(|| {
                        NotifyResponseV1::err(
                            request_id,
                            channel,
                            ErrorEnvelope::new(
                                ErrorClass::InternalError,
                                "messenger returned an unreadable response",
                            ),
                        )
                    }),
                RouteStatus::Error => {
                    let error = response.error.unwrap_or_else(|| {
                        ErrorEnvelope::new(ErrorClass::InternalError, "delivery failed")
                    });
                    NotifyResponseV1::err(request_id, channel, error)
                },
            },
            Err(e) => NotifyResponseV1::err(
                request_id,
                channel,
                ErrorEnvelope::new(e.class, e.message),
            ),
        }
    }
}

#[async_trait]
impl PlaneOverride for SwitchboardPlane {
    async fn handle_route(&self, envelope: &RouteV1) -> Option<RouteResponseV1> {
        // A routed envelope carrying a notify payload is a butler's
        // wrapped notification; everything else falls through to the
        // default path.
        let notify_value = envelope.notify_request()?.clone();
        let started = std::time::Instant::now();
        let context = envelope.request_context.clone();

        let response = match serde_json::from_value::<NotifyV1>(notify_value) {
            Ok(notify) => {
                self.forward_to_messenger(
                    &envelope.source_metadata.identity,
                    &notify,
                    context.clone(),
                )
                .await
            },
            Err(e) => NotifyResponseV1::err(
                Some(context.request_id),
                "unknown",
                ErrorEnvelope::new(
                    ErrorClass::ValidationError,
                    format!("bad notify_request payload: {e}"),
                ),
            ),
        };

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Some(match response.status {
            RouteStatus::Ok => RouteResponseV1::ok(
                context,
                serde_json::to_value(&response).unwrap_or_default(),
                duration_ms,
            ),
            RouteStatus::Error => {
                let error = response.error.clone().unwrap_or_else(|| {
                    ErrorEnvelope::new(ErrorClass::InternalError, "delivery failed")
                });
                RouteResponseV1::err(context, error, duration_ms)
            },
        })
    }

    async fn handle_notify(
        &self,
        caller: &str,
        envelope: &NotifyV1,
    ) -> Option<NotifyResponseV1> {
        let context = envelope
            .request_context
            .clone()
            .unwrap_or_else(|| RequestContext::new("internal", "switchboard", caller));
        Some(self.forward_to_messenger(caller, envelope, context).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// Transport that answers messenger routes with a canned response.
    struct CannedTransport {
        fail: bool,
    }

    #[async_trait]
    impl RouteTransport for CannedTransport {
        async fn dispatch(
            &self,
            target: &str,
            envelope: &RouteV1,
        ) -> Result<RouteResponseV1, butlers_core::ButlerError> {
            assert_eq!(target, MESSENGER);
            let ctx = envelope.request_context.clone();
            if self.fail {
                return Ok(RouteResponseV1::err(
                    ctx,
                    ErrorEnvelope::new(ErrorClass::TargetUnavailable, "provider down"),
                    3,
                ));
            }
            let delivery_id = butlers_core::DeliveryId::new();
            let notify_response = NotifyResponseV1::ok(
                Some(ctx.request_id),
                "telegram",
                delivery_id,
            );
            Ok(RouteResponseV1::ok(
                ctx,
                serde_json::to_value(&notify_response).unwrap(),
                3,
            ))
        }

        async fn routable(&self) -> BTreeSet<String> {
            BTreeSet::new()
        }
    }

    #[tokio::test]
    async fn notify_forwards_to_messenger_and_returns_delivery() {
        let plane = SwitchboardPlane::new(Arc::new(CannedTransport { fail: false }));
        let envelope = NotifyV1::send("health", "telegram", "Hi");
        let response = plane.handle_notify("health", &envelope).await.unwrap();
        assert_eq!(response.status, RouteStatus::Ok);
        assert!(response.delivery.delivery_id.is_some());
    }

    #[tokio::test]
    async fn messenger_errors_surface_with_their_class() {
        let plane = SwitchboardPlane::new(Arc::new(CannedTransport { fail: true }));
        let envelope = NotifyV1::send("health", "telegram", "Hi");
        let response = plane.handle_notify("health", &envelope).await.unwrap();
        assert_eq!(response.status, RouteStatus::Error);
        assert_eq!(
            response.error.unwrap().class,
            ErrorClass::TargetUnavailable
        );
    }

    #[tokio::test]
    async fn wrapped_route_notify_is_terminated_here() {
        let plane = SwitchboardPlane::new(Arc::new(CannedTransport { fail: false }));
        let notify = NotifyV1::send("health", "telegram", "Hi");
        let ctx = RequestContext::new("telegram", "bot-A", "user-9");
        let route = RouteV1::new(ctx, "deliver notification")
            .with_context(serde_json::json!({
                "notify_request": serde_json::to_value(&notify).unwrap(),
            }))
            .with_source("internal", "health", "notify");

        let response = plane.handle_route(&route).await.unwrap();
        assert_eq!(response.status, RouteStatus::Ok);
    }

    #[tokio::test]
    async fn plain_routes_fall_through() {
        let plane = SwitchboardPlane::new(Arc::new(CannedTransport { fail: false }));
        let ctx = RequestContext::new("telegram", "bot-A", "user-9");
        let route = RouteV1::new(ctx, "just a prompt");
        assert!(plane.handle_route(&route).await.is_none());
    }
}
