//! `notify.v1` validation — all checks run before any side effect.

use butlers_core::{ButlerError, DeliveryIntent, NotifyV1};

/// Channels whose threads can receive reactions.
const REACT_CAPABLE_CHANNELS: [&str; 1] = ["telegram"];

/// Channels that target replies by thread identity.
const THREAD_TARGETING_CHANNELS: [&str; 1] = ["telegram"];

/// Validate a `notify.v1` envelope against the authenticated caller.
///
/// # Errors
///
/// Every violation is a `validation_error`:
/// - missing `schema_version`/`origin_butler`/delivery basics
/// - `reply` without full originating request context (and thread
///   identity on thread-targeting channels)
/// - `react` without emoji, thread identity, or on a channel that
///   cannot react
/// - `origin_butler` not matching the authenticated routed caller
///   (payload alone can never spoof origin)
pub fn validate_notify(envelope: &NotifyV1, authenticated_caller: &str) -> Result<(), ButlerError> {
    if envelope.schema_version != butlers_core::envelope::NOTIFY_V1 {
        return Err(ButlerError::validation(format!(
            "unknown schema_version: {}",
            envelope.schema_version
        )));
    }
    if envelope.origin_butler.is_empty() {
        return Err(ButlerError::validation("origin_butler is required"));
    }
    if envelope.origin_butler != authenticated_caller {
        return Err(ButlerError::validation(format!(
            "origin_butler '{}' does not match authenticated caller '{authenticated_caller}'",
            envelope.origin_butler
        )));
    }

    let delivery = &envelope.delivery;
    if delivery.channel.is_empty() {
        return Err(ButlerError::validation("delivery.channel is required"));
    }

    match delivery.intent {
        DeliveryIntent::Send | DeliveryIntent::Reply => {
            if delivery.message.as_deref().is_none_or(str::is_empty) {
                return Err(ButlerError::validation("delivery.message is required"));
            }
        },
        DeliveryIntent::React => {
            if delivery.emoji.as_deref().is_none_or(str::is_empty) {
                return Err(ButlerError::validation("delivery.emoji is required for react"));
            }
            if !REACT_CAPABLE_CHANNELS.contains(&delivery.channel.as_str()) {
                return Err(ButlerError::validation(format!(
                    "channel '{}' cannot react",
                    delivery.channel
                )));
            }
        },
    }

    if matches!(delivery.intent, DeliveryIntent::Reply | DeliveryIntent::React) {
        let Some(context) = &envelope.request_context else {
            return Err(ButlerError::validation(
                "request_context is required for reply/react",
            ));
        };
        if context.source_channel.is_empty()
            || context.source_endpoint_identity.is_empty()
            || context.source_sender_identity.is_empty()
        {
            return Err(ButlerError::validation(
                "request_context source identities are required for reply/react",
            ));
        }
        let needs_thread = delivery.intent == DeliveryIntent::React
            || THREAD_TARGETING_CHANNELS.contains(&delivery.channel.as_str());
        if needs_thread && context.source_thread_identity.is_none() {
            return Err(ButlerError::validation(
                "source_thread_identity is required on thread-targeting channels",
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlers_core::RequestContext;
    use butlers_core::envelope::NotifyDelivery;

    fn reply(channel: &str) -> NotifyV1 {
        NotifyV1 {
            schema_version: butlers_core::envelope::NOTIFY_V1.to_owned(),
            origin_butler: "health".to_owned(),
            delivery: NotifyDelivery {
                intent: DeliveryIntent::Reply,
                channel: channel.to_owned(),
                message: Some("done".to_owned()),
                recipient: None,
                contact_id: None,
                subject: None,
                emoji: None,
            },
            request_context: Some(
                RequestContext::new(channel, "bot-A", "user-9").with_thread("chat-5"),
            ),
        }
    }

    #[test]
    fn valid_send_passes() {
        let envelope = NotifyV1::send("health", "telegram", "Hi");
        validate_notify(&envelope, "health").unwrap();
    }

    #[test]
    fn origin_spoofing_is_rejected() {
        let envelope = NotifyV1::send("messenger", "telegram", "Hi");
        let err = validate_notify(&envelope, "health").unwrap_err();
        assert_eq!(err.class, butlers_core::ErrorClass::ValidationError);
        assert!(err.message.contains("does not match"));
    }

    #[test]
    fn send_requires_message() {
        let mut envelope = NotifyV1::send("health", "telegram", "");
        envelope.delivery.message = None;
        assert!(validate_notify(&envelope, "health").is_err());
    }

    #[test]
    fn reply_requires_request_context() {
        let mut envelope = reply("telegram");
        envelope.request_context = None;
        assert!(validate_notify(&envelope, "health").is_err());
    }

    #[test]
    fn reply_on_thread_channel_requires_thread_identity() {
        let mut envelope = reply("telegram");
        if let Some(ctx) = envelope.request_context.as_mut() {
            ctx.source_thread_identity = None;
        }
        assert!(validate_notify(&envelope, "health").is_err());
    }

    #[test]
    fn reply_on_email_does_not_need_thread_identity() {
        let mut envelope = reply("email");
        if let Some(ctx) = envelope.request_context.as_mut() {
            ctx.source_thread_identity = None;
        }
        validate_notify(&envelope, "health").unwrap();
    }

    #[test]
    fn react_requires_emoji_thread_and_telegram() {
        let mut envelope = reply("telegram");
        envelope.delivery.intent = DeliveryIntent::React;
        envelope.delivery.message = None;
        assert!(validate_notify(&envelope, "health").is_err());

        envelope.delivery.emoji = Some("👀".to_owned());
        validate_notify(&envelope, "health").unwrap();

        envelope.delivery.channel = "email".to_owned();
        let err = validate_notify(&envelope, "health").unwrap_err();
        assert!(err.message.contains("cannot react"));
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let mut envelope = NotifyV1::send("health", "telegram", "Hi");
        envelope.schema_version = "notify.v9".to_owned();
        assert!(validate_notify(&envelope, "health").is_err());
    }
}
