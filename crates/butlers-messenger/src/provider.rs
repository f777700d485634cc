//! Channel provider adapters.
//!
//! An adapter executes exactly one provider side effect per call. The
//! engine owns idempotency, retries, and rate policy; adapters report
//! failures with a class, retryability, and an optional `Retry-After`.

use async_trait::async_trait;
use chrono::Duration;
use teloxide::prelude::Requester;
use teloxide::types::ChatId;
use tracing::debug;

use butlers_core::{DeliveryIntent, ErrorClass};

use crate::presentation::PresentedContent;

/// One delivery handed to a provider.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    /// Intent.
    pub intent: DeliveryIntent,
    /// Channel.
    pub channel: String,
    /// Resolved recipient identifier (chat id, email address).
    pub target: String,
    /// Thread identity for reply/react.
    pub thread: Option<String>,
    /// Presented content.
    pub content: PresentedContent,
    /// Reaction emoji for react.
    pub emoji: Option<String>,
}

/// Success receipt from a provider.
#[derive(Debug, Clone)]
pub struct ProviderReceipt {
    /// The provider's delivery id, when it reports one.
    pub provider_delivery_id: Option<String>,
}

/// Classified provider failure.
#[derive(Debug, Clone)]
pub struct ProviderFailure {
    /// Canonical class (`target_unavailable` for throttling/outage,
    /// `validation_error` for rejected requests).
    pub class: ErrorClass,
    /// Description.
    pub message: String,
    /// Whether a retry can help.
    pub retryable: bool,
    /// Provider-mandated minimum delay before the next attempt
    /// (HTTP 429 `Retry-After`).
    pub retry_after: Option<Duration>,
}

impl ProviderFailure {
    /// A throttled failure honoring `Retry-After`.
    #[must_use]
    pub fn throttled(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            class: ErrorClass::TargetUnavailable,
            message: message.into(),
            retryable: true,
            retry_after: Some(retry_after),
        }
    }

    /// A permanent rejection.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::ValidationError,
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }

    /// A transient outage.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::TargetUnavailable,
            message: message.into(),
            retryable: true,
            retry_after: None,
        }
    }
}

/// A channel provider.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// The channel this adapter serves.
    fn channel(&self) -> &'static str;

    /// Execute one delivery.
    async fn deliver(&self, job: &DeliveryJob) -> Result<ProviderReceipt, ProviderFailure>;
}

/// Telegram provider over the Bot API.
pub struct TelegramProvider {
    bot: teloxide::Bot,
    http: reqwest::Client,
    token: String,
}

impl std::fmt::Debug for TelegramProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramProvider").finish_non_exhaustive()
    }
}

impl TelegramProvider {
    /// Create a provider from the bot token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            bot: teloxide::Bot::new(token.clone()),
            http: reqwest::Client::new(),
            token,
        }
    }

    fn parse_chat(target: &str) -> Result<ChatId, ProviderFailure> {
        target
            .parse::<i64>()
            .map(ChatId)
            .map_err(|_| ProviderFailure::rejected(format!("bad telegram chat id '{target}'")))
    }

    async fn react(&self, chat: &str, message_id: &str, emoji: &str) -> Result<(), ProviderFailure> {
        // setMessageReaction predates teloxide's typed wrapper here;
        // call the Bot API directly.
        let url = format!("https://api.telegram.org/bot{}/setMessageReaction", self.token);
        let body = serde_json::json!({
            "chat_id": chat,
            "message_id": message_id.parse::<i64>().map_err(|_| {
                ProviderFailure::rejected(format!("bad telegram message id '{message_id}'"))
            })?,
            "reaction": [{"type": "emoji", "emoji": emoji}],
        });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderFailure::unavailable(e.to_string()))?;
        map_http_status(response).await
    }
}

async fn map_http_status(response: reqwest::Response) -> Result<(), ProviderFailure> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    if status.as_u16() == 429 {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok())
            .map_or_else(|| Duration::seconds(5), Duration::seconds);
        return Err(ProviderFailure::throttled(
            "telegram rate limited",
            retry_after,
        ));
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        Err(ProviderFailure::rejected(format!("{status}: {body}")))
    } else {
        Err(ProviderFailure::unavailable(format!("{status}: {body}")))
    }
}

#[async_trait]
impl ProviderAdapter for TelegramProvider {
    fn channel(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, job: &DeliveryJob) -> Result<ProviderReceipt, ProviderFailure> {
        match job.intent {
            DeliveryIntent::Send | DeliveryIntent::Reply => {
                let chat = Self::parse_chat(&job.target)?;
                let text = job
                    .content
                    .message
                    .clone()
                    .ok_or_else(|| ProviderFailure::rejected("missing message body"))?;
                let sent = self
                    .bot
                    .send_message(chat, text)
                    .await
                    .map_err(map_teloxide_error)?;
                debug!(chat = %job.target, message_id = sent.id.0, "telegram message sent");
                Ok(ProviderReceipt {
                    provider_delivery_id: Some(sent.id.0.to_string()),
                })
            },
            DeliveryIntent::React => {
                let thread = job
                    .thread
                    .as_deref()
                    .ok_or_else(|| ProviderFailure::rejected("react needs a thread identity"))?;
                let emoji = job
                    .emoji
                    .as_deref()
                    .ok_or_else(|| ProviderFailure::rejected("react needs an emoji"))?;
                self.react(&job.target, thread, emoji).await?;
                Ok(ProviderReceipt {
                    provider_delivery_id: None,
                })
            },
        }
    }
}

fn map_teloxide_error(err: teloxide::RequestError) -> ProviderFailure {
    match err {
        teloxide::RequestError::RetryAfter(seconds) => ProviderFailure::throttled(
            "telegram rate limited",
            Duration::seconds(i64::try_from(seconds.seconds()).unwrap_or(5)),
        ),
        teloxide::RequestError::Api(api) => ProviderFailure::rejected(api.to_string()),
        other => ProviderFailure::unavailable(other.to_string()),
    }
}

/// Email provider posting to a configured relay endpoint.
///
/// The relay owns SMTP; Messenger owns idempotency and audit. The
/// relay contract is one JSON document per message.
pub struct HttpEmailProvider {
    http: reqwest::Client,
    relay_url: String,
    from_address: String,
}

impl std::fmt::Debug for HttpEmailProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEmailProvider")
            .field("from_address", &self.from_address)
            .finish_non_exhaustive()
    }
}

impl HttpEmailProvider {
    /// Create a provider posting to `relay_url`.
    #[must_use]
    pub fn new(relay_url: impl Into<String>, from_address: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            relay_url: relay_url.into(),
            from_address: from_address.into(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpEmailProvider {
    fn channel(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, job: &DeliveryJob) -> Result<ProviderReceipt, ProviderFailure> {
        if job.intent == DeliveryIntent::React {
            return Err(ProviderFailure::rejected("email cannot react"));
        }
        let body = serde_json::json!({
            "from": self.from_address,
            "to": job.target,
            "subject": job.content.subject,
            "body": job.content.message,
            "in_reply_to": job.thread,
        });
        let response = self
            .http
            .post(&self.relay_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderFailure::unavailable(e.to_string()))?;
        let provider_delivery_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        map_http_status(response).await?;
        Ok(ProviderReceipt {
            provider_delivery_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_ids_must_be_numeric() {
        assert!(TelegramProvider::parse_chat("12345").is_ok());
        assert!(TelegramProvider::parse_chat("-10012345").is_ok());
        let err = TelegramProvider::parse_chat("chat-5").unwrap_err();
        assert_eq!(err.class, ErrorClass::ValidationError);
        assert!(!err.retryable);
    }

    #[test]
    fn failure_constructors_classify() {
        let throttled = ProviderFailure::throttled("429", Duration::seconds(7));
        assert_eq!(throttled.class, ErrorClass::TargetUnavailable);
        assert!(throttled.retryable);
        assert_eq!(throttled.retry_after, Some(Duration::seconds(7)));

        let rejected = ProviderFailure::rejected("bad chat");
        assert!(!rejected.retryable);
    }
}
