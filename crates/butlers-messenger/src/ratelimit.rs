//! Layered admission and rate control.
//!
//! Three budgets, checked outermost-first: the global delivery budget,
//! the per `(channel, identity_scope)` budget, and the per-recipient
//! anti-flood budget. A `reply` preempts non-reply traffic under
//! contention: non-reply deliveries keep a reserve of headroom free.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use butlers_core::DeliveryIntent;

/// Refill-over-time token bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_s: f64,
    updated_at: DateTime<Utc>,
}

impl TokenBucket {
    /// A bucket holding `capacity` tokens, refilling at
    /// `refill_per_s`.
    #[must_use]
    pub fn new(capacity: f64, refill_per_s: f64, now: DateTime<Utc>) -> Self {
        Self {
            capacity: capacity.max(1.0),
            tokens: capacity.max(1.0),
            refill_per_s: refill_per_s.max(0.0),
            updated_at: now,
        }
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.updated_at).num_milliseconds() as f64 / 1000.0;
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_s).min(self.capacity);
            self.updated_at = now;
        }
    }

    /// Take one token if at least `reserve` tokens would remain
    /// afterwards (reserve 0 = plain take).
    pub fn try_take(&mut self, now: DateTime<Utc>, reserve: f64) -> bool {
        self.refill(now);
        if self.tokens - 1.0 >= reserve - f64::EPSILON {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available.
    #[must_use]
    pub fn available(&self) -> f64 {
        self.tokens
    }

    /// Push the next refill out by `delay` (provider `Retry-After`).
    pub fn defer_until(&mut self, now: DateTime<Utc>, delay: Duration) {
        self.tokens = 0.0;
        self.updated_at = now + delay;
    }
}

/// Rate limit configuration.
#[derive(Debug, Clone)]
pub struct RateLimitsConfig {
    /// Global deliveries per minute.
    pub global_per_minute: f64,
    /// Per `(channel, identity_scope)` deliveries per minute.
    pub per_channel_per_minute: f64,
    /// Per-recipient deliveries per minute (anti-flood).
    pub per_recipient_per_minute: f64,
    /// Fraction of each budget reserved for `reply` traffic.
    pub reply_reserve_fraction: f64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            global_per_minute: 120.0,
            per_channel_per_minute: 30.0,
            per_recipient_per_minute: 10.0,
            reply_reserve_fraction: 0.25,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// All budgets admitted the delivery.
    Admitted,
    /// A budget was exhausted; retryable `overload_rejected`.
    Rejected {
        /// Which layer rejected.
        layer: RejectedLayer,
    },
}

/// Which budget layer rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectedLayer {
    /// The global delivery budget.
    Global,
    /// The `(channel, identity_scope)` budget.
    Channel,
    /// The per-recipient anti-flood budget.
    Recipient,
}

/// The layered rate limiter.
pub struct RateLimiter {
    config: RateLimitsConfig,
    global: tokio::sync::Mutex<TokenBucket>,
    channels: DashMap<String, TokenBucket>,
    recipients: DashMap<String, TokenBucket>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter.
    #[must_use]
    pub fn new(config: RateLimitsConfig, now: DateTime<Utc>) -> Self {
        let global = TokenBucket::new(
            config.global_per_minute,
            config.global_per_minute / 60.0,
            now,
        );
        Self {
            config,
            global: tokio::sync::Mutex::new(global),
            channels: DashMap::new(),
            recipients: DashMap::new(),
        }
    }

    /// Check all three layers for one delivery. Replies bypass the
    /// reserve; non-replies must leave the reserve intact.
    pub async fn admit(
        &self,
        intent: DeliveryIntent,
        channel: &str,
        identity_scope: &str,
        recipient: &str,
        now: DateTime<Utc>,
    ) -> AdmissionDecision {
        let is_reply = intent == DeliveryIntent::Reply;

        let global_reserve = if is_reply {
            0.0
        } else {
            self.config.global_per_minute * self.config.reply_reserve_fraction
        };
        if !self.global.lock().await.try_take(now, global_reserve) {
            return AdmissionDecision::Rejected {
                layer: RejectedLayer::Global,
            };
        }

        let channel_key = format!("{channel}:{identity_scope}");
        let channel_reserve = if is_reply {
            0.0
        } else {
            self.config.per_channel_per_minute * self.config.reply_reserve_fraction
        };
        let channel_ok = self
            .channels
            .entry(channel_key)
            .or_insert_with(|| {
                TokenBucket::new(
                    self.config.per_channel_per_minute,
                    self.config.per_channel_per_minute / 60.0,
                    now,
                )
            })
            .try_take(now, channel_reserve);
        if !channel_ok {
            return AdmissionDecision::Rejected {
                layer: RejectedLayer::Channel,
            };
        }

        let recipient_key = format!("{channel}:{recipient}");
        let recipient_ok = self
            .recipients
            .entry(recipient_key)
            .or_insert_with(|| {
                TokenBucket::new(
                    self.config.per_recipient_per_minute,
                    self.config.per_recipient_per_minute / 60.0,
                    now,
                )
            })
            .try_take(now, 0.0);
        if !recipient_ok {
            return AdmissionDecision::Rejected {
                layer: RejectedLayer::Recipient,
            };
        }

        AdmissionDecision::Admitted
    }

    /// Honor a provider `Retry-After` on a channel bucket.
    pub fn defer_channel(
        &self,
        channel: &str,
        identity_scope: &str,
        delay: Duration,
        now: DateTime<Utc>,
    ) {
        let key = format!("{channel}:{identity_scope}");
        if let Some(mut bucket) = self.channels.get_mut(&key) {
            bucket.defer_until(now, delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(per_channel: f64) -> RateLimitsConfig {
        RateLimitsConfig {
            global_per_minute: 1000.0,
            per_channel_per_minute: per_channel,
            per_recipient_per_minute: 1000.0,
            reply_reserve_fraction: 0.25,
        }
    }

    #[test]
    fn bucket_refills_over_time() {
        let t0 = Utc::now();
        let mut bucket = TokenBucket::new(2.0, 1.0, t0);
        assert!(bucket.try_take(t0, 0.0));
        assert!(bucket.try_take(t0, 0.0));
        assert!(!bucket.try_take(t0, 0.0));
        let t1 = t0 + Duration::seconds(1);
        assert!(bucket.try_take(t1, 0.0));
    }

    #[test]
    fn defer_empties_and_delays_refill() {
        let t0 = Utc::now();
        let mut bucket = TokenBucket::new(10.0, 10.0, t0);
        bucket.defer_until(t0, Duration::seconds(30));
        assert!(!bucket.try_take(t0 + Duration::seconds(29), 0.0));
        assert!(bucket.try_take(t0 + Duration::seconds(31), 0.0));
    }

    #[tokio::test]
    async fn replies_preempt_non_replies_under_contention() {
        let now = Utc::now();
        // Channel budget of 4 with 25% reserve: non-replies may use 3,
        // the last token is reply-only.
        let limiter = RateLimiter::new(config(4.0), now);
        for _ in 0..3 {
            assert_eq!(
                limiter
                    .admit(DeliveryIntent::Send, "telegram", "bot-A", "chat-5", now)
                    .await,
                AdmissionDecision::Admitted
            );
        }
        assert!(matches!(
            limiter
                .admit(DeliveryIntent::Send, "telegram", "bot-A", "chat-5", now)
                .await,
            AdmissionDecision::Rejected {
                layer: RejectedLayer::Channel
            }
        ));
        assert_eq!(
            limiter
                .admit(DeliveryIntent::Reply, "telegram", "bot-A", "chat-5", now)
                .await,
            AdmissionDecision::Admitted
        );
    }

    #[tokio::test]
    async fn recipient_anti_flood_is_per_recipient() {
        let now = Utc::now();
        let mut cfg = config(1000.0);
        cfg.per_recipient_per_minute = 1.0;
        let limiter = RateLimiter::new(cfg, now);
        assert_eq!(
            limiter
                .admit(DeliveryIntent::Send, "telegram", "bot-A", "chat-5", now)
                .await,
            AdmissionDecision::Admitted
        );
        assert!(matches!(
            limiter
                .admit(DeliveryIntent::Send, "telegram", "bot-A", "chat-5", now)
                .await,
            AdmissionDecision::Rejected {
                layer: RejectedLayer::Recipient
            }
        ));
        // A different recipient is unaffected.
        assert_eq!(
            limiter
                .admit(DeliveryIntent::Send, "telegram", "bot-A", "chat-6", now)
                .await,
            AdmissionDecision::Admitted
        );
    }
}
