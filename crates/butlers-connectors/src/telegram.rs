//! Telegram long-poll connector.
//!
//! Polls `getUpdates`, normalizes each message into `ingest.v1`, and
//! submits to Switchboard. The update offset is the resume cursor,
//! persisted only after acceptance. Thread identity is encoded as
//! `<chat_id>:<message_id>` so Messenger can both reply into the chat
//! and react to the exact message.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use teloxide::payloads::GetUpdatesSetters;
use teloxide::prelude::Requester;
use teloxide::types::UpdateKind;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use butlers_core::envelope::{
    HEARTBEAT_V1, INGEST_V1, HeartbeatV1, IngestControl, IngestEvent, IngestPayload,
    IngestSender, IngestSource, IngestV1,
};

use crate::cursor::FileCursor;
use crate::error::ConnectorResult;
use crate::sink::IngestSink;

/// Poll interval between empty `getUpdates` batches.
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// One normalized telegram message, decoupled from provider types so
/// normalization stays testable.
#[derive(Debug, Clone)]
pub struct TelegramEvent {
    /// Provider update id.
    pub update_id: i64,
    /// Chat the message arrived in.
    pub chat_id: i64,
    /// Message id within the chat.
    pub message_id: i32,
    /// Sender identity.
    pub sender: String,
    /// Message text.
    pub text: String,
    /// Provider timestamp (unix seconds).
    pub date: i64,
}

impl TelegramEvent {
    /// Normalize into the canonical ingest envelope.
    #[must_use]
    pub fn to_ingest(&self, bot_identity: &str) -> IngestV1 {
        IngestV1 {
            schema_version: INGEST_V1.to_owned(),
            source: IngestSource {
                channel: "telegram".to_owned(),
                provider: "telegram_bot_api".to_owned(),
                endpoint_identity: bot_identity.to_owned(),
            },
            event: IngestEvent {
                external_event_id: self.update_id.to_string(),
                external_thread_id: Some(format!("{}:{}", self.chat_id, self.message_id)),
                observed_at: Utc
                    .timestamp_opt(self.date, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            },
            sender: IngestSender {
                identity: self.sender.clone(),
            },
            payload: IngestPayload {
                raw: serde_json::json!({
                    "update_id": self.update_id,
                    "chat_id": self.chat_id,
                    "message_id": self.message_id,
                    "text": self.text,
                }),
                normalized_text: self.text.clone(),
            },
            control: IngestControl::default(),
        }
    }
}

/// The telegram connector.
pub struct TelegramConnector {
    bot: teloxide::Bot,
    bot_identity: String,
    cursor: FileCursor,
    sink: Arc<dyn IngestSink>,
}

impl std::fmt::Debug for TelegramConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConnector")
            .field("bot_identity", &self.bot_identity)
            .finish_non_exhaustive()
    }
}

impl TelegramConnector {
    /// Create a connector.
    #[must_use]
    pub fn new(
        token: impl Into<String>,
        bot_identity: impl Into<String>,
        cursor: FileCursor,
        sink: Arc<dyn IngestSink>,
    ) -> Self {
        Self {
            bot: teloxide::Bot::new(token.into()),
            bot_identity: bot_identity.into(),
            cursor,
            sink,
        }
    }

    /// Run the poll loop until the task is cancelled.
    ///
    /// # Errors
    ///
    /// Returns only on unrecoverable cursor IO failures; provider and
    /// sink errors back off and continue.
    pub async fn run(&self) -> ConnectorResult<()> {
        let mut offset: Option<i32> = self
            .cursor
            .load()?
            .and_then(|s| s.parse().ok());
        let mut accepted_since_last: u64 = 0;
        let mut last_heartbeat = tokio::time::Instant::now();
        info!(bot = %self.bot_identity, ?offset, "telegram connector started");

        loop {
            let mut request = self.bot.get_updates().timeout(25);
            if let Some(o) = offset {
                request = request.offset(o);
            }

            match request.await {
                Ok(updates) => {
                    for update in updates {
                        let next_offset =
                            i32::try_from(update.id.0.saturating_add(1)).unwrap_or(i32::MAX);
                        if let Some(event) = extract_event(&update) {
                            match self.sink.submit(&event.to_ingest(&self.bot_identity)).await
                            {
                                Ok(()) => {
                                    accepted_since_last = accepted_since_last.saturating_add(1);
                                },
                                Err(e) => {
                                    // Leave the cursor behind this
                                    // update; the provider will replay
                                    // and dedupe absorbs double-accepts.
                                    warn!(error = %e, "ingest submission failed; will replay");
                                    sleep(POLL_INTERVAL).await;
                                    continue;
                                },
                            }
                        } else {
                            debug!(update = update.id.0, "skipping non-message update");
                        }
                        offset = Some(next_offset);
                        self.cursor.store(&next_offset.to_string())?;
                    }
                },
                Err(e) => {
                    warn!(error = %e, "getUpdates failed; backing off");
                    sleep(POLL_INTERVAL).await;
                },
            }

            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                let beacon = HeartbeatV1 {
                    schema_version: HEARTBEAT_V1.to_owned(),
                    channel: "telegram".to_owned(),
                    endpoint_identity: self.bot_identity.clone(),
                    emitted_at: Utc::now(),
                    accepted_since_last,
                };
                if let Err(e) = self.sink.heartbeat(&beacon).await {
                    warn!(error = %e, "heartbeat failed");
                }
                accepted_since_last = 0;
                last_heartbeat = tokio::time::Instant::now();
            }

            sleep(POLL_INTERVAL).await;
        }
    }
}

/// Pull the normalizable fields out of a provider update.
fn extract_event(update: &teloxide::types::Update) -> Option<TelegramEvent> {
    let UpdateKind::Message(message) = &update.kind else {
        return None;
    };
    let text = message.text()?.to_owned();
    let sender = message
        .from
        .as_ref()
        .map_or_else(|| "unknown".to_owned(), |user| user.id.0.to_string());
    Some(TelegramEvent {
        update_id: i64::from(update.id.0),
        chat_id: message.chat.id.0,
        message_id: message.id.0,
        sender,
        text,
        date: message.date.timestamp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> TelegramEvent {
        TelegramEvent {
            update_id: 42,
            chat_id: -100_500,
            message_id: 7,
            sender: "user-9".to_owned(),
            text: "Log 180/90 BP".to_owned(),
            date: 1_767_225_600,
        }
    }

    #[test]
    fn normalization_produces_a_valid_envelope() {
        let envelope = event().to_ingest("bot-A");
        envelope.validate().unwrap();
        assert_eq!(envelope.source.channel, "telegram");
        assert_eq!(envelope.event.external_event_id, "42");
        assert_eq!(envelope.sender.identity, "user-9");
        assert_eq!(envelope.payload.normalized_text, "Log 180/90 BP");
    }

    #[test]
    fn thread_identity_carries_chat_and_message() {
        let envelope = event().to_ingest("bot-A");
        assert_eq!(
            envelope.event.external_thread_id.as_deref(),
            Some("-100500:7")
        );
    }

    #[test]
    fn observed_at_comes_from_the_provider_timestamp() {
        let envelope = event().to_ingest("bot-A");
        assert_eq!(envelope.event.observed_at.timestamp(), 1_767_225_600);
    }
}
