//! Channel-aware dedupe keys.
//!
//! A unique index on the key is the enforcement point: one canonical
//! request per key, ever. Keys are channel-specific:
//!
//! | Channel | Key |
//! |---------|-----|
//! | telegram | `tg:<bot_identity>:<update_id>` |
//! | email | `em:<mailbox_identity>:<Message-ID>` |
//! | api/mcp | caller key, else a hash of payload + sender + window |

use sha2::{Digest, Sha256};

use butlers_core::IngestV1;

/// Width of the time window for hash-derived API keys, in seconds.
/// Re-submissions of identical content within the window dedupe even
/// under modest clock skew between callers.
const API_WINDOW_S: i64 = 300;

/// Compute the dedupe key for a validated ingest envelope.
#[must_use]
pub fn dedupe_key(envelope: &IngestV1) -> String {
    match envelope.source.channel.as_str() {
        "telegram" => format!(
            "tg:{}:{}",
            envelope.source.endpoint_identity, envelope.event.external_event_id
        ),
        "email" => format!(
            "em:{}:{}",
            envelope.source.endpoint_identity, envelope.event.external_event_id
        ),
        _ => match &envelope.control.idempotency_key {
            Some(key) => format!("api:{}:{key}", envelope.source.endpoint_identity),
            None => hashed_key(envelope),
        },
    }
}

/// Deterministic hash key for API events without a caller key:
/// `(normalized_payload, sender_identity, time_window)`.
fn hashed_key(envelope: &IngestV1) -> String {
    let window = envelope.event.observed_at.timestamp().div_euclid(API_WINDOW_S);
    let mut hasher = Sha256::new();
    hasher.update(envelope.payload.normalized_text.as_bytes());
    hasher.update([0]);
    hasher.update(envelope.sender.identity.as_bytes());
    hasher.update([0]);
    hasher.update(window.to_be_bytes());
    format!("api:{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use butlers_core::envelope::{
        INGEST_V1, IngestControl, IngestEvent, IngestPayload, IngestSender, IngestSource,
    };
    use chrono::{TimeZone, Utc};

    fn envelope(channel: &str) -> IngestV1 {
        IngestV1 {
            schema_version: INGEST_V1.to_owned(),
            source: IngestSource {
                channel: channel.to_owned(),
                provider: "test".to_owned(),
                endpoint_identity: "bot-A".to_owned(),
            },
            event: IngestEvent {
                external_event_id: "42".to_owned(),
                external_thread_id: None,
                observed_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 30).unwrap(),
            },
            sender: IngestSender {
                identity: "user-9".to_owned(),
            },
            payload: IngestPayload {
                raw: serde_json::json!({}),
                normalized_text: "hello".to_owned(),
            },
            control: IngestControl::default(),
        }
    }

    #[test]
    fn telegram_key_is_bot_and_update_id() {
        assert_eq!(dedupe_key(&envelope("telegram")), "tg:bot-A:42");
    }

    #[test]
    fn email_key_is_mailbox_and_message_id() {
        let mut e = envelope("email");
        e.source.endpoint_identity = "inbox@example.com".to_owned();
        e.event.external_event_id = "<msg-1@mail>".to_owned();
        assert_eq!(dedupe_key(&e), "em:inbox@example.com:<msg-1@mail>");
    }

    #[test]
    fn api_prefers_caller_idempotency_key() {
        let mut e = envelope("api");
        e.control.idempotency_key = Some("caller-key-1".to_owned());
        assert_eq!(dedupe_key(&e), "api:bot-A:caller-key-1");
    }

    #[test]
    fn api_hash_key_is_stable_within_the_window() {
        let a = envelope("api");
        let mut b = envelope("api");
        // 30 seconds later, same window.
        b.event.observed_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 1, 0).unwrap();
        assert_eq!(dedupe_key(&a), dedupe_key(&b));
    }

    #[test]
    fn api_hash_key_changes_across_windows() {
        let a = envelope("api");
        let mut b = envelope("api");
        b.event.observed_at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        assert_ne!(dedupe_key(&a), dedupe_key(&b));
    }

    #[test]
    fn api_hash_key_distinguishes_senders() {
        let a = envelope("api");
        let mut b = envelope("api");
        b.sender.identity = "user-10".to_owned();
        assert_ne!(dedupe_key(&a), dedupe_key(&b));
    }

    #[test]
    fn same_telegram_update_twice_yields_the_same_key() {
        assert_eq!(dedupe_key(&envelope("telegram")), dedupe_key(&envelope("telegram")));
    }
}
