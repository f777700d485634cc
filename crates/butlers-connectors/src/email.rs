//! Email polling connector.
//!
//! The mailbox protocol sits behind [`MailFetcher`] so the connector
//! owns only normalization, cursor advancement, and heartbeats. The
//! cursor is the last accepted `Message-ID`; fetchers return messages
//! strictly after it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{Duration, sleep};
use tracing::{info, warn};

use butlers_core::envelope::{
    HEARTBEAT_V1, INGEST_V1, HeartbeatV1, IngestControl, IngestEvent, IngestPayload,
    IngestSender, IngestSource, IngestV1,
};

use crate::cursor::FileCursor;
use crate::error::ConnectorResult;
use crate::sink::IngestSink;

/// Poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// One fetched mail message.
#[derive(Debug, Clone)]
pub struct MailMessage {
    /// RFC 5322 `Message-ID`.
    pub message_id: String,
    /// `In-Reply-To`/thread root, when present.
    pub thread_id: Option<String>,
    /// Sender address.
    pub from: String,
    /// Subject line.
    pub subject: String,
    /// Plain-text body.
    pub body: String,
    /// Receipt time.
    pub received_at: DateTime<Utc>,
}

impl MailMessage {
    /// Normalize into the canonical ingest envelope.
    #[must_use]
    pub fn to_ingest(&self, mailbox_identity: &str) -> IngestV1 {
        IngestV1 {
            schema_version: INGEST_V1.to_owned(),
            source: IngestSource {
                channel: "email".to_owned(),
                provider: "imap".to_owned(),
                endpoint_identity: mailbox_identity.to_owned(),
            },
            event: IngestEvent {
                external_event_id: self.message_id.clone(),
                external_thread_id: self.thread_id.clone(),
                observed_at: self.received_at,
            },
            sender: IngestSender {
                identity: self.from.clone(),
            },
            payload: IngestPayload {
                raw: serde_json::json!({
                    "message_id": self.message_id,
                    "from": self.from,
                    "subject": self.subject,
                    "body": self.body,
                }),
                normalized_text: format!("{}\n\n{}", self.subject, self.body),
            },
            control: IngestControl::default(),
        }
    }
}

/// Mailbox access.
#[async_trait]
pub trait MailFetcher: Send + Sync {
    /// Fetch messages strictly after the cursor, oldest first.
    async fn fetch_after(&self, cursor: Option<&str>) -> ConnectorResult<Vec<MailMessage>>;
}

/// The email polling connector.
pub struct EmailPoller {
    fetcher: Arc<dyn MailFetcher>,
    mailbox_identity: String,
    cursor: FileCursor,
    sink: Arc<dyn IngestSink>,
}

impl std::fmt::Debug for EmailPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailPoller")
            .field("mailbox_identity", &self.mailbox_identity)
            .finish_non_exhaustive()
    }
}

impl EmailPoller {
    /// Create a poller.
    #[must_use]
    pub fn new(
        fetcher: Arc<dyn MailFetcher>,
        mailbox_identity: impl Into<String>,
        cursor: FileCursor,
        sink: Arc<dyn IngestSink>,
    ) -> Self {
        Self {
            fetcher,
            mailbox_identity: mailbox_identity.into(),
            cursor,
            sink,
        }
    }

    /// Drain one batch: fetch after the cursor, submit each message,
    /// advance the cursor only after acceptance. Returns accepted
    /// count.
    ///
    /// # Errors
    ///
    /// Returns cursor IO failures; fetch and submit failures stop the
    /// batch (the cursor stays behind, the next batch replays).
    pub async fn drain_once(&self) -> ConnectorResult<u64> {
        let cursor_value = self.cursor.load()?;
        let messages = self.fetcher.fetch_after(cursor_value.as_deref()).await?;
        let mut accepted: u64 = 0;
        for message in messages {
            match self.sink.submit(&message.to_ingest(&self.mailbox_identity)).await {
                Ok(()) => {
                    self.cursor.store(&message.message_id)?;
                    accepted = accepted.saturating_add(1);
                },
                Err(e) => {
                    warn!(error = %e, message_id = %message.message_id, "submission failed; stopping batch");
                    break;
                },
            }
        }
        Ok(accepted)
    }

    /// Run the poll loop until cancelled.
    ///
    /// # Errors
    ///
    /// Returns only unrecoverable cursor IO failures.
    pub async fn run(&self) -> ConnectorResult<()> {
        info!(mailbox = %self.mailbox_identity, "email poller started");
        let mut accepted_since_last: u64 = 0;
        let mut last_heartbeat = tokio::time::Instant::now();
        loop {
            match self.drain_once().await {
                Ok(count) => {
                    accepted_since_last = accepted_since_last.saturating_add(count);
                },
                Err(e) => warn!(error = %e, "email drain failed; backing off"),
            }

            if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                let beacon = HeartbeatV1 {
                    schema_version: HEARTBEAT_V1.to_owned(),
                    channel: "email".to_owned(),
                    endpoint_identity: self.mailbox_identity.clone(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeFetcher {
        messages: Vec<MailMessage>,
    }

    #[async_trait]
    impl MailFetcher for FakeFetcher {
        async fn fetch_after(&self, cursor: Option<&str>) -> ConnectorResult<Vec<MailMessage>> {
            let start = cursor
                .and_then(|c| self.messages.iter().position(|m| m.message_id == c))
                .map_or(0, |idx| idx.saturating_add(1));
            Ok(self.messages.get(start..).unwrap_or_default().to_vec())
        }
    }

    struct RecordingSink {
        accepted: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl IngestSink for RecordingSink {
        async fn submit(&self, envelope: &IngestV1) -> ConnectorResult<()> {
            if self.fail_on.as_deref() == Some(envelope.event.external_event_id.as_str()) {
                return Err(crate::error::ConnectorError::IngestRejected("full".to_owned()));
            }
            self.accepted
                .lock()
                .unwrap()
                .push(envelope.event.external_event_id.clone());
            Ok(())
        }

        async fn heartbeat(&self, _beacon: &HeartbeatV1) -> ConnectorResult<()> {
            Ok(())
        }
    }

    fn mail(id: &str) -> MailMessage {
        MailMessage {
            message_id: id.to_owned(),
            thread_id: None,
            from: "alice@example.com".to_owned(),
            subject: "Hello".to_owned(),
            body: "body".to_owned(),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn normalization_is_valid_and_keeps_the_message_id() {
        let envelope = mail("<m1@mail>").to_ingest("inbox@example.com");
        envelope.validate().unwrap();
        assert_eq!(envelope.event.external_event_id, "<m1@mail>");
        assert!(envelope.payload.normalized_text.starts_with("Hello"));
    }

    #[tokio::test]
    async fn cursor_advances_only_after_acceptance() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = FileCursor::new(dir.path().join("email.cursor"));
        let sink = Arc::new(RecordingSink {
            accepted: Mutex::new(Vec::new()),
            fail_on: Some("<m2@mail>".to_owned()),
        });
        let poller = EmailPoller::new(
            Arc::new(FakeFetcher {
                messages: vec![mail("<m1@mail>"), mail("<m2@mail>"), mail("<m3@mail>")],
            }),
            "inbox@example.com",
            cursor.clone(),
            Arc::clone(&sink) as Arc<dyn IngestSink>,
        );

        let accepted = poller.drain_once().await.unwrap();
        assert_eq!(accepted, 1);
        // Cursor sits at m1: m2 failed and stopped the batch.
        assert_eq!(cursor.load().unwrap().as_deref(), Some("<m1@mail>"));
        assert_eq!(sink.accepted.lock().unwrap().as_slice(), ["<m1@mail>"]);
    }

    #[tokio::test]
    async fn replayed_batch_resumes_after_the_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let cursor = FileCursor::new(dir.path().join("email.cursor"));
        cursor.store("<m1@mail>").unwrap();
        let sink = Arc::new(RecordingSink {
            accepted: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let poller = EmailPoller::new(
            Arc::new(FakeFetcher {
                messages: vec![mail("<m1@mail>"), mail("<m2@mail>")],
            }),
            "inbox@example.com",
            cursor.clone(),
            Arc::clone(&sink) as Arc<dyn IngestSink>,
        );

        poller.drain_once().await.unwrap();
        assert_eq!(sink.accepted.lock().unwrap().as_slice(), ["<m2@mail>"]);
        assert_eq!(cursor.load().unwrap().as_deref(), Some("<m2@mail>"));
    }
}
