//! The delivery engine.
//!
//! Execution order for one `notify.v1`: validate → resolve target →
//! derive the canonical idempotency key → claim it (unique index) →
//! coalesce in-flight duplicates → layered admission → ordered,
//! circuit-guarded provider attempts with bounded backoff → audit.
//!
//! Duplicate semantics: a duplicate of a terminal success returns the
//! original payload including the original delivery id; a duplicate of
//! a terminal non-retryable failure returns the same failure; an
//! in-flight duplicate awaits the owner's terminal state.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{info, warn};

use butlers_core::circuit::CircuitBreaker;
use butlers_core::{
    ButlerError, DeliveryIntent, ErrorClass, ErrorEnvelope, NotifyResponseV1, NotifyV1,
    RequestId, RouteResponseV1, RouteV1,
};
use butlers_rpc::PlaneOverride;

use crate::idempotency::{content_hash, idempotency_key};
use crate::presentation::present;
use crate::provider::{DeliveryJob, ProviderAdapter, ProviderFailure};
use crate::ratelimit::{AdmissionDecision, RateLimiter};
use crate::store::{ClaimOutcome, DeliveryRecord, DeliveryStatus, DeliveryStore};
use crate::validate::validate_notify;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Max provider attempts per delivery.
    pub max_attempts: u32,
    /// Base backoff between attempts.
    pub backoff_base_ms: u64,
    /// Owner default recipient per channel, used when neither a
    /// contact nor an explicit recipient targets the delivery.
    pub owner_contacts: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 250,
            owner_contacts: BTreeMap::new(),
        }
    }
}

/// The delivery engine.
pub struct DeliveryEngine {
    config: EngineConfig,
    store: DeliveryStore,
    limiter: RateLimiter,
    providers: BTreeMap<String, Arc<dyn ProviderAdapter>>,
    circuits: DashMap<String, Arc<Mutex<CircuitBreaker>>>,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
    thread_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("channels", &self.providers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl DeliveryEngine {
    /// Create an engine.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: DeliveryStore,
        limiter: RateLimiter,
        providers: Vec<Arc<dyn ProviderAdapter>>,
    ) -> Self {
        Self {
            config,
            store,
            limiter,
            providers: providers
                .into_iter()
                .map(|p| (p.channel().to_owned(), p))
                .collect(),
            circuits: DashMap::new(),
            in_flight: DashMap::new(),
            thread_locks: DashMap::new(),
        }
    }

    /// Execute one validated-or-not notify envelope as
    /// `authenticated_caller`.
    pub async fn deliver(
        &self,
        authenticated_caller: &str,
        envelope: &NotifyV1,
    ) -> NotifyResponseV1 {
        let request_id = envelope.request_context.as_ref().map(|c| c.request_id);
        let channel = envelope.delivery.channel.clone();

        match self.deliver_inner(authenticated_caller, envelope).await {
            Ok((delivery_id, req)) => NotifyResponseV1::ok(req, channel, delivery_id),
            Err(e) => {
                NotifyResponseV1::err(request_id, channel, ErrorEnvelope::new(e.class, e.message))
            },
        }
    }

    async fn deliver_inner(
        &self,
        authenticated_caller: &str,
        envelope: &NotifyV1,
    ) -> Result<(butlers_core::DeliveryId, Option<RequestId>), ButlerError> {
        validate_notify(envelope, authenticated_caller)?;
        let request_id = envelope.request_context.as_ref().map(|c| c.request_id);

        // Target resolution: contact → explicit recipient → owner.
        let target = self.resolve_target(envelope).await?;
        let Some(target) = target else {
            return self.park_missing_identifier(envelope, request_id).await;
        };

        let key = idempotency_key(envelope, &target);
        let hash = content_hash(envelope);

        let claim = self
            .store
            .claim(
                &key,
                &envelope.origin_butler,
                &envelope.delivery.channel,
                envelope.delivery.intent.as_str(),
                Some(&target),
                &hash,
                request_id,
                DeliveryStatus::InFlight,
            )
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))?;

        let record = match claim {
            ClaimOutcome::Fresh(record) => record,
            // A retry of a non-terminal failure re-executes under the
            // original key; true duplicates resolve to the recorded
            // terminal state.
            ClaimOutcome::Existing(record)
                if matches!(
                    record.status,
                    DeliveryStatus::FailedRetryable | DeliveryStatus::PendingMissingIdentifier
                ) =>
            {
                record
            },
            ClaimOutcome::Existing(record) => {
                return self.resolve_duplicate(&key, record, request_id).await;
            },
        };

        let lock = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        // Re-check under the lock: a concurrent retry for the same key
        // may have just resolved it, and a second provider call would
        // break at-most-one-effect.
        let current = self
            .store
            .by_key(&key)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))?;
        if let Some(current) = &current {
            if current.status.is_terminal() {
                drop(guard);
                self.in_flight.remove(&key);
                return self.resolve_duplicate(&key, current.clone(), request_id).await;
            }
        }

        let result = self.execute(envelope, &record, &target).await;
        drop(guard);
        self.in_flight.remove(&key);

        result.map(|id| (id, request_id))
    }

    /// Duplicate handling per terminal status.
    async fn resolve_duplicate(
        &self,
        key: &str,
        record: DeliveryRecord,
        request_id: Option<RequestId>,
    ) -> Result<(butlers_core::DeliveryId, Option<RequestId>), ButlerError> {
        let record = if record.status == DeliveryStatus::InFlight {
            // Coalesce: wait for the owner and return its resolution.
            // The owner may not have registered its lock yet, so poll
            // with a bounded wait rather than trusting one observation.
            let mut current = record;
            for _ in 0..50u32 {
                if let Some(lock) = self.in_flight.get(key).map(|l| l.clone()) {
                    drop(lock.lock().await);
                }
                match self
                    .store
                    .by_key(key)
                    .await
                    .map_err(|e| ButlerError::internal(e.to_string()))?
                {
                    Some(r) if r.status != DeliveryStatus::InFlight => {
                        current = r;
                        break;
                    },
                    Some(r) => current = r,
                    None => break,
                }
                tokio::time::sleep(StdDuration::from_millis(50)).await;
            }
            current
        } else {
            record
        };

        match record.status {
            DeliveryStatus::Succeeded => Ok((record.delivery_id, request_id)),
            DeliveryStatus::FailedTerminal | DeliveryStatus::DeadLettered => {
                let class = record
                    .error_class
                    .as_deref()
                    .and_then(ErrorClass::parse)
                    .unwrap_or(ErrorClass::InternalError);
                Err(ButlerError::new(
                    class,
                    record
                        .error_message
                        .unwrap_or_else(|| "delivery failed".to_owned()),
                ))
            },
            // Still unresolved (owner crashed or parked): retryable.
            _ => Err(ButlerError::overloaded(
                "delivery is still in flight; retry shortly",
            )),
        }
    }

    async fn resolve_target(&self, envelope: &NotifyV1) -> Result<Option<String>, ButlerError> {
        // Reply/react target the originating thread, not the contact
        // book. Telegram thread identity is "<chat>:<message>".
        if matches!(
            envelope.delivery.intent,
            DeliveryIntent::Reply | DeliveryIntent::React
        ) {
            let context = envelope
                .request_context
                .as_ref()
                .ok_or_else(|| ButlerError::validation("missing request_context"))?;
            let target = context
                .source_thread_identity
                .clone()
                .map_or_else(|| context.source_sender_identity.clone(), |thread| {
                    thread
                        .split_once(':')
                        .map_or(thread.clone(), |(chat, _)| chat.to_owned())
                });
            return Ok(Some(target));
        }

        if let Some(contact_id) = &envelope.delivery.contact_id {
            let resolved = self
                .store
                .contact_identifier(contact_id, &envelope.delivery.channel)
                .await
                .map_err(|e| ButlerError::internal(e.to_string()))?;
            return Ok(resolved);
        }
        if let Some(recipient) = &envelope.delivery.recipient {
            return Ok(Some(recipient.clone()));
        }
        Ok(self
            .config
            .owner_contacts
            .get(&envelope.delivery.channel)
            .cloned())
    }

    async fn park_missing_identifier(
        &self,
        envelope: &NotifyV1,
        request_id: Option<RequestId>,
    ) -> Result<(butlers_core::DeliveryId, Option<RequestId>), ButlerError> {
        let key = idempotency_key(envelope, "unresolved");
        let claim = self
            .store
            .claim(
                &key,
                &envelope.origin_butler,
                &envelope.delivery.channel,
                envelope.delivery.intent.as_str(),
                None,
                &content_hash(envelope),
                request_id,
                DeliveryStatus::PendingMissingIdentifier,
            )
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))?;
        let record = match claim {
            ClaimOutcome::Fresh(r) | ClaimOutcome::Existing(r) => r,
        };
        warn!(
            delivery = %record.delivery_id,
            channel = %envelope.delivery.channel,
            "parked delivery: no contact identifier for requested channel"
        );
        self.notify_owner_of_park(envelope).await;
        Err(ButlerError::validation(format!(
            "no contact identifier for channel '{}'; delivery parked as pending_missing_identifier",
            envelope.delivery.channel
        )))
    }

    /// Owner notification for a parked delivery (fail-open).
    async fn notify_owner_of_park(&self, envelope: &NotifyV1) {
        let Some((channel, owner)) = self
            .config
            .owner_contacts
            .iter()
            .find(|(channel, _)| self.providers.contains_key(*channel))
        else {
            return;
        };
        let Some(provider) = self.providers.get(channel) else {
            return;
        };
        let job = DeliveryJob {
            intent: DeliveryIntent::Send,
            channel: channel.clone(),
            target: owner.clone(),
            thread: None,
            content: crate::presentation::PresentedContent {
                message: Some(format!(
                    "[messenger] A delivery from '{}' on channel '{}' is parked: \
                     no contact identifier. Add one to release it.",
                    envelope.origin_butler, envelope.delivery.channel
                )),
                subject: Some("[messenger] parked delivery".to_owned()),
            },
            emoji: None,
        };
        if let Err(e) = provider.deliver(&job).await {
            warn!(error = %e.message, "owner park notification failed");
        }
    }

    /// Provider attempts under ordering, circuit, and retry policy.
    async fn execute(
        &self,
        envelope: &NotifyV1,
        record: &DeliveryRecord,
        target: &str,
    ) -> Result<butlers_core::DeliveryId, ButlerError> {
        let channel = &envelope.delivery.channel;
        let provider = self.providers.get(channel).ok_or_else(|| {
            ButlerError::validation(format!("no provider for channel '{channel}'"))
        })?;

        // Admission: global → channel/identity → recipient.
        let identity_scope = envelope
            .request_context
            .as_ref()
            .map_or("default", |c| c.source_endpoint_identity.as_str());
        let decision = self
            .limiter
            .admit(
                envelope.delivery.intent,
                channel,
                identity_scope,
                target,
                Utc::now(),
            )
            .await;
        if let AdmissionDecision::Rejected { layer } = decision {
            let message = format!("delivery budget exhausted ({layer:?})");
            self.store
                .mark_failed(
                    record.delivery_id,
                    DeliveryStatus::FailedRetryable,
                    ErrorClass::OverloadRejected.as_str(),
                    &message,
                )
                .await
                .map_err(|e| ButlerError::internal(e.to_string()))?;
            return Err(ButlerError::overloaded(message));
        }

        let thread = envelope
            .request_context
            .as_ref()
            .and_then(|c| c.source_thread_identity.as_ref())
            .and_then(|t| t.split_once(':').map(|(_, message)| message.to_owned()));
        let job = DeliveryJob {
            intent: envelope.delivery.intent,
            channel: channel.clone(),
            target: target.to_owned(),
            thread,
            content: present(envelope),
            emoji: envelope.delivery.emoji.clone(),
        };

        // Per (channel, thread) causal ordering.
        let order_key = format!("{channel}:{}", job.thread.as_deref().unwrap_or(target));
        let order_lock = self
            .thread_locks
            .entry(order_key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _ordered = order_lock.lock().await;

        let circuit = self
            .circuits
            .entry(channel.clone())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(5, 30))))
            .clone();

        let mut last_failure: Option<ProviderFailure> = None;
        for attempt in 0..self.config.max_attempts {
            if !circuit.lock().await.allow(Utc::now()) {
                let message = format!("provider circuit open for channel '{channel}'");
                self.store
                    .mark_failed(
                        record.delivery_id,
                        DeliveryStatus::FailedRetryable,
                        ErrorClass::TargetUnavailable.as_str(),
                        &message,
                    )
                    .await
                    .map_err(|e| ButlerError::internal(e.to_string()))?;
                return Err(ButlerError::unavailable(message));
            }

            let started = std::time::Instant::now();
            let outcome = provider.deliver(&job).await;
            let latency = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

            match outcome {
                Ok(receipt) => {
                    circuit.lock().await.record_success();
                    self.store
                        .record_attempt(record.delivery_id, "ok", latency, None, false)
                        .await
                        .map_err(|e| ButlerError::internal(e.to_string()))?;
                    self.store
                        .mark_succeeded(
                            record.delivery_id,
                            receipt.provider_delivery_id.as_deref(),
                        )
                        .await
                        .map_err(|e| ButlerError::internal(e.to_string()))?;
                    info!(delivery = %record.delivery_id, channel = %channel, "delivered");
                    return Ok(record.delivery_id);
                },
                Err(failure) => {
                    circuit.lock().await.record_failure(Utc::now());
                    self.store
                        .record_attempt(
                            record.delivery_id,
                            "error",
                            latency,
                            Some(failure.class.as_str()),
                            failure.retryable,
                        )
                        .await
                        .map_err(|e| ButlerError::internal(e.to_string()))?;

                    if !failure.retryable {
                        self.store
                            .mark_failed(
                                record.delivery_id,
                                DeliveryStatus::FailedTerminal,
                                failure.class.as_str(),
                                &failure.message,
                            )
                            .await
                            .map_err(|e| ButlerError::internal(e.to_string()))?;
                        return Err(ButlerError::new(failure.class, failure.message));
                    }

                    // Honor Retry-After: never retry earlier than the
                    // provider allows.
                    let backoff = self.backoff(attempt);
                    let wait = failure.retry_after.map_or(backoff, |after| {
                        if let Some(d) = after.to_std().ok().filter(|d| *d > backoff) {
                            self.limiter.defer_channel(channel, identity_scope, after, Utc::now());
                            d
                        } else {
                            backoff
                        }
                    });
                    last_failure = Some(failure);
                    if attempt.saturating_add(1) < self.config.max_attempts {
                        tokio::time::sleep(wait).await;
                    }
                },
            }
        }

        // Retries exhausted: dead letter with replay eligibility.
        let failure = last_failure
            .unwrap_or_else(|| ProviderFailure::unavailable("delivery attempts exhausted"));
        self.store
            .dead_letter(
                record.delivery_id,
                &record.idempotency_key,
                &format!("retries exhausted: {}", failure.message),
            )
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))?;
        Err(ButlerError::new(failure.class, failure.message))
    }

    /// Replay a dead letter preserving its idempotency key lineage.
    ///
    /// # Errors
    ///
    /// Unknown or ineligible entries are `validation_error`.
    pub async fn replay(&self, dead_letter_id: i64) -> Result<DeliveryRecord, ButlerError> {
        let record = self
            .store
            .replay_candidate(dead_letter_id)
            .await
            .map_err(|e| ButlerError::validation(e.to_string()))?;
        self.store
            .mark_replayed(dead_letter_id, record.delivery_id)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))?;
        info!(delivery = %record.delivery_id, "dead letter reopened for replay");
        Ok(record)
    }

    fn backoff(&self, attempt: u32) -> StdDuration {
        let base = StdDuration::from_millis(self.config.backoff_base_ms);
        let exp = base.saturating_mul(2u32.saturating_pow(attempt));
        let jitter = rand::thread_rng().gen_range(0..self.config.backoff_base_ms.max(1));
        exp.saturating_add(StdDuration::from_millis(jitter))
    }
}

/// Messenger's plane override: terminates `notify` at the delivery
/// adapters, whether it arrived as a direct `notify` or wrapped inside
/// `route.v1` at `input.context.notify_request`.
pub struct MessengerPlane {
    engine: Arc<DeliveryEngine>,
}

impl std::fmt::Debug for MessengerPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessengerPlane").finish_non_exhaustive()
    }
}

impl MessengerPlane {
    /// Create the plane over the engine.
    #[must_use]
    pub fn new(engine: Arc<DeliveryEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PlaneOverride for MessengerPlane {
    async fn handle_route(&self, envelope: &RouteV1) -> Option<RouteResponseV1> {
        let notify_value = envelope.notify_request()?.clone();
        let started = std::time::Instant::now();
        let context = envelope.request_context.clone();

        let response = match serde_json::from_value::<NotifyV1>(notify_value) {
            Ok(notify) => {
                // The routed caller identity Switchboard asserts for
                // the origin butler rides in source_metadata.
                self.engine
                    .deliver(&envelope.source_metadata.identity, &notify)
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
        Some(match &response.status {
            butlers_core::RouteStatus::Ok => RouteResponseV1::ok(
                context,
                serde_json::to_value(&response).unwrap_or_default(),
                duration_ms,
            ),
            butlers_core::RouteStatus::Error => {
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
        Some(self.engine.deliver(caller, envelope).await)
    }
}
