//! Canonical ingress: validation, dedupe, admission, lifecycle signal.
//!
//! Acceptance is decoupled from execution: `ingest` returns as soon as
//! the canonical row exists and the work item is queued. Routing
//! workers drain the queue with per-channel round-robin fairness so no
//! channel starves another.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

use butlers_core::{ButlerError, IngestV1, LifecycleState, RequestContext, RequestId};

use crate::dedupe::dedupe_key;
use crate::inbox::{InboxStore, InsertOutcome};

/// What to do when the admission queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Reject new work immediately (`overload_rejected`); interactive
    /// sources prefer this fast-fail.
    #[default]
    Reject,
    /// Drop the oldest queued item to admit the new one.
    Shed,
    /// Accept but mark deferred; workers process after the backlog.
    Defer,
}

/// Signals interactive lifecycle transitions (e.g. telegram reactions).
#[async_trait]
pub trait LifecycleSignaler: Send + Sync {
    /// Signal a lifecycle state for a request. Failures are logged by
    /// implementations and never propagate.
    async fn signal(&self, context: &RequestContext, state: LifecycleState);
}

/// One unit of routing work.
#[derive(Debug, Clone)]
pub struct RoutingWork {
    /// The canonical request.
    pub context: RequestContext,
    /// Normalized text to classify.
    pub normalized_text: String,
}

#[derive(Default)]
struct QueueInner {
    channels: BTreeMap<String, VecDeque<RoutingWork>>,
    /// Round-robin cursor over channel names.
    cursor: usize,
    len: usize,
}

/// Bounded admission queue with channel fairness.
pub struct AdmissionQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl std::fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl AdmissionQueue {
    /// Create a queue holding at most `capacity` items total.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    /// Queue one work item.
    ///
    /// # Errors
    ///
    /// Under the `Reject` policy a full queue yields
    /// `overload_rejected`.
    pub async fn push(&self, channel: &str, work: RoutingWork) -> Result<(), ButlerError> {
        let mut inner = self.inner.lock().await;
        if inner.len >= self.capacity {
            match self.policy {
                OverflowPolicy::Reject => {
                    return Err(ButlerError::overloaded(format!(
                        "admission queue full ({} items)",
                        self.capacity
                    )));
                },
                OverflowPolicy::Shed => {
                    // Drop the oldest item from the longest channel.
                    if let Some(longest) = inner
                        .channels
                        .iter()
                        .max_by_key(|(_, q)| q.len())
                        .map(|(name, _)| name.clone())
                    {
                        if let Some(queue) = inner.channels.get_mut(&longest) {
                            if queue.pop_front().is_some() {
                                inner.len = inner.len.saturating_sub(1);
                                warn!(channel = %longest, "shed oldest queued request");
                            }
                        }
                    }
                },
                OverflowPolicy::Defer => {
                    debug!("admission queue over capacity; deferring");
                },
            }
        }
        inner
            .channels
            .entry(channel.to_owned())
            .or_default()
            .push_back(work);
        inner.len = inner.len.saturating_add(1);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Whether a push on this channel would currently be admitted
    /// under the `Reject` policy.
    pub async fn has_capacity(&self) -> bool {
        if self.policy != OverflowPolicy::Reject {
            return true;
        }
        self.inner.lock().await.len < self.capacity
    }

    /// Take the next item, round-robin across channels. Waits until
    /// work is available.
    pub async fn next(&self) -> RoutingWork {
        loop {
            {
                let mut inner = self.inner.lock().await;
                let names: Vec<String> = inner.channels.keys().cloned().collect();
                if !names.is_empty() {
                    let start = inner.cursor;
                    for offset in 0..names.len() {
                        let idx = start
                            .saturating_add(offset)
                            .checked_rem(names.len())
                            .unwrap_or(0);
                        let name = &names[idx];
                        if let Some(queue) = inner.channels.get_mut(name) {
                            if let Some(work) = queue.pop_front() {
                                inner.cursor = idx.saturating_add(1);
                                inner.len = inner.len.saturating_sub(1);
                                return work;
                            }
                        }
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    /// Items currently queued.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Acceptance response for one ingest call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAccept {
    /// The canonical request id (fresh or original).
    pub request_id: RequestId,
    /// Whether this event deduped onto an existing request.
    pub deduped: bool,
}

/// The ingress service.
pub struct IngressService {
    inbox: InboxStore,
    queue: Arc<AdmissionQueue>,
    signaler: Option<Arc<dyn LifecycleSignaler>>,
}

impl std::fmt::Debug for IngressService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngressService").finish_non_exhaustive()
    }
}

impl IngressService {
    /// Create the service.
    #[must_use]
    pub fn new(inbox: InboxStore, queue: Arc<AdmissionQueue>) -> Self {
        Self {
            inbox,
            queue,
            signaler: None,
        }
    }

    /// Attach the lifecycle signaler.
    #[must_use]
    pub fn with_signaler(mut self, signaler: Arc<dyn LifecycleSignaler>) -> Self {
        self.signaler = Some(signaler);
        self
    }

    /// The admission queue (for routing workers).
    #[must_use]
    pub fn queue(&self) -> Arc<AdmissionQueue> {
        Arc::clone(&self.queue)
    }

    /// Accept one canonical ingest envelope.
    ///
    /// Steps: validate → dedupe → inbox insert (unique on the dedupe
    /// key) → fresh UUIDv7 request context if newly created →
    /// `PROGRESS` signal on interactive channels → enqueue routing
    /// work. Returns immediately with the request id.
    ///
    /// # Errors
    ///
    /// Schema violations are `validation_error`; a full queue is
    /// `overload_rejected` (checked before any insert so rejected
    /// events leave no row behind).
    pub async fn ingest(&self, envelope: &IngestV1) -> Result<IngestAccept, ButlerError> {
        envelope.validate().map_err(ButlerError::validation)?;

        let key = dedupe_key(envelope);

        // Fast-path dedupe across partitions and restarts.
        if let Some(existing) = self
            .inbox
            .find_by_key(&key)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))?
        {
            debug!(%key, request_id = %existing, "deduped ingest event");
            return Ok(IngestAccept {
                request_id: existing,
                deduped: true,
            });
        }

        if !self.queue.has_capacity().await {
            return Err(ButlerError::overloaded("admission queue full"));
        }

        let mut context = RequestContext::new(
            envelope.source.channel.clone(),
            envelope.source.endpoint_identity.clone(),
            envelope.sender.identity.clone(),
        );
        if let Some(thread) = &envelope.event.external_thread_id {
            context.source_thread_identity = Some(thread.clone());
        }
        context.trace_context = envelope.control.trace_context.clone();

        let outcome = self
            .inbox
            .insert(&key, &context, &envelope.payload.raw, &envelope.payload.normalized_text)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))?;

        let deduped = matches!(outcome, InsertOutcome::Deduped { .. });
        let request_id = outcome.request_id();

        if !deduped {
            if let Some(signaler) = &self.signaler {
                if is_interactive(&envelope.source.channel) {
                    signaler.signal(&context, LifecycleState::Progress).await;
                }
            }
            self.queue
                .push(
                    &envelope.source.channel,
                    RoutingWork {
                        context,
                        normalized_text: envelope.payload.normalized_text.clone(),
                    },
                )
                .await?;
        }

        Ok(IngestAccept {
            request_id,
            deduped,
        })
    }
}

fn is_interactive(channel: &str) -> bool {
    matches!(channel, "telegram")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work(text: &str) -> RoutingWork {
        RoutingWork {
            context: RequestContext::new("telegram", "bot-A", "user-9"),
            normalized_text: text.to_owned(),
        }
    }

    #[tokio::test]
    async fn queue_round_robins_across_channels() {
        let queue = AdmissionQueue::new(10, OverflowPolicy::Reject);
        queue.push("telegram", work("t1")).await.unwrap();
        queue.push("telegram", work("t2")).await.unwrap();
        queue.push("telegram", work("t3")).await.unwrap();
        queue.push("email", work("e1")).await.unwrap();

        let order: Vec<String> = [
            queue.next().await,
            queue.next().await,
            queue.next().await,
            queue.next().await,
        ]
        .into_iter()
        .map(|w| w.normalized_text)
        .collect();

        // Email must not wait behind the whole telegram backlog.
        let email_pos = order.iter().position(|t| t == "e1").unwrap();
        assert!(email_pos < 3, "email starved: {order:?}");
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn reject_policy_fails_fast_when_full() {
        let queue = AdmissionQueue::new(2, OverflowPolicy::Reject);
        queue.push("telegram", work("a")).await.unwrap();
        queue.push("telegram", work("b")).await.unwrap();
        let err = queue.push("telegram", work("c")).await.unwrap_err();
        assert_eq!(err.class, butlers_core::ErrorClass::OverloadRejected);
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn shed_policy_drops_oldest_and_admits() {
        let queue = AdmissionQueue::new(2, OverflowPolicy::Shed);
        queue.push("telegram", work("a")).await.unwrap();
        queue.push("telegram", work("b")).await.unwrap();
        queue.push("telegram", work("c")).await.unwrap();
        assert_eq!(queue.len().await, 2);
        let first = queue.next().await;
        assert_eq!(first.normalized_text, "b");
    }

    #[tokio::test]
    async fn defer_policy_admits_over_capacity() {
        let queue = AdmissionQueue::new(1, OverflowPolicy::Defer);
        queue.push("telegram", work("a")).await.unwrap();
        queue.push("telegram", work("b")).await.unwrap();
        assert_eq!(queue.len().await, 2);
    }

    #[test]
    fn only_thread_channels_are_interactive() {
        assert!(is_interactive("telegram"));
        assert!(!is_interactive("email"));
        assert!(!is_interactive("api"));
    }
}
