//! Canonical idempotency keys.
//!
//! The key is a stable hash over `(request_id or caller key,
//! origin_butler, intent, channel, normalized_target, content_hash,
//! subject_hash?)`. The unique index on
//! `delivery_requests.idempotency_key` is the single enforcement point
//! for at-most-one-effect delivery; retries reuse the same key.

use sha2::{Digest, Sha256};

use butlers_core::NotifyV1;

/// Stable hash of the user-visible content (message or emoji).
#[must_use]
pub fn content_hash(envelope: &NotifyV1) -> String {
    let mut hasher = Sha256::new();
    if let Some(message) = &envelope.delivery.message {
        hasher.update(message.as_bytes());
    }
    if let Some(emoji) = &envelope.delivery.emoji {
        hasher.update(emoji.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Derive the canonical idempotency key for a validated envelope with
/// its resolved target.
#[must_use]
pub fn idempotency_key(envelope: &NotifyV1, normalized_target: &str) -> String {
    let root: String = envelope
        .request_context
        .as_ref()
        .map(|c| c.request_id.to_string())
        .unwrap_or_else(|| format!("origin:{}", envelope.origin_butler));

    let mut hasher = Sha256::new();
    for part in [
        root.as_str(),
        envelope.origin_butler.as_str(),
        envelope.delivery.intent.as_str(),
        envelope.delivery.channel.as_str(),
        normalized_target,
        &content_hash(envelope),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    if let Some(subject) = &envelope.delivery.subject {
        hasher.update(Sha256::digest(subject.as_bytes()));
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlers_core::RequestContext;

    fn envelope(message: &str) -> NotifyV1 {
        let mut e = NotifyV1::send("health", "telegram", message);
        e.request_context = Some(RequestContext::new("telegram", "bot-A", "user-9"));
        e
    }

    #[test]
    fn same_envelope_same_key() {
        let e = envelope("Hi");
        assert_eq!(
            idempotency_key(&e, "chat-5"),
            idempotency_key(&e, "chat-5")
        );
    }

    #[test]
    fn different_content_different_key() {
        let a = envelope("Hi");
        let mut b = envelope("Bye");
        // Same request lineage, different content.
        b.request_context = a.request_context.clone();
        assert_ne!(idempotency_key(&a, "chat-5"), idempotency_key(&b, "chat-5"));
    }

    #[test]
    fn different_target_different_key() {
        let e = envelope("Hi");
        assert_ne!(
            idempotency_key(&e, "chat-5"),
            idempotency_key(&e, "chat-6")
        );
    }

    #[test]
    fn different_intent_different_key() {
        let send = envelope("Hi");
        let mut reply = envelope("Hi");
        reply.request_context = send.request_context.clone();
        reply.delivery.intent = butlers_core::DeliveryIntent::Reply;
        assert_ne!(
            idempotency_key(&send, "chat-5"),
            idempotency_key(&reply, "chat-5")
        );
    }

    #[test]
    fn subject_participates_when_present() {
        let mut a = envelope("Hi");
        let mut b = envelope("Hi");
        b.request_context = a.request_context.clone();
        a.delivery.subject = Some("Weekly report".to_owned());
        b.delivery.subject = Some("Daily report".to_owned());
        assert_ne!(idempotency_key(&a, "inbox"), idempotency_key(&b, "inbox"));
    }

    #[test]
    fn retried_notify_with_same_lineage_reuses_the_key() {
        let first = envelope("Hi");
        let mut retry = envelope("Hi");
        retry.request_context = first.request_context.clone();
        assert_eq!(
            idempotency_key(&first, "chat-5"),
            idempotency_key(&retry, "chat-5")
        );
    }

    #[test]
    fn no_request_context_falls_back_to_origin() {
        let e = NotifyV1::send("health", "telegram", "Hi");
        assert_eq!(idempotency_key(&e, "chat-5"), idempotency_key(&e, "chat-5"));
    }

    #[test]
    fn content_hash_covers_emoji() {
        let mut a = NotifyV1::send("health", "telegram", "");
        a.delivery.message = None;
        a.delivery.emoji = Some("👀".to_owned());
        let mut b = a.clone();
        b.delivery.emoji = Some("👾".to_owned());
        assert_ne!(content_hash(&a), content_hash(&b));
    }
}
