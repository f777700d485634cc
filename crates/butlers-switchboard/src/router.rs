//! Fanout execution and lifecycle aggregation.
//!
//! For each classified segment the router forks the request context
//! with a fresh subrequest id, builds a `route.v1` envelope, and
//! dispatches it through the transport under per-target retry and
//! circuit-breaker policy. Downstream responses are validated against
//! the root request id; unknown error classes normalize to
//! `internal_error` with the original preserved as metadata.
//!
//! After all subroutes reach terminal state the router composes the
//! user-facing response: `PARSED` iff every required subroute
//! succeeded, `ERRORED` otherwise with an actionable message. A
//! subroute skipped by its dependency mode is excluded from the
//! required set; its upstream failure is what surfaces.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use butlers_core::{
    ButlerError, ErrorClass, ErrorEnvelope, LifecycleState, RequestContext, RouteResponseV1,
    RouteStatus, RouteV1, SubrequestId,
};

use butlers_core::circuit::CircuitBreaker;

use crate::classify::Classifier;
use crate::ingress::{LifecycleSignaler, RoutingWork};
use crate::inbox::InboxStore;
use crate::plan::{DependencyMode, FanoutPlan, Segment};

/// Max dispatch attempts per subroute (initial call plus retries).
const MAX_ATTEMPTS: u32 = 3;
/// Base backoff between attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(200);
/// Circuit: consecutive failures before opening.
const CIRCUIT_THRESHOLD: u32 = 5;
/// Circuit: seconds before a half-open probe.
const CIRCUIT_RECOVERY_S: i64 = 30;

/// Per-request budgets.
#[derive(Debug, Clone, Copy)]
pub struct RouterBudget {
    /// Wall-clock budget for the whole fanout.
    pub wall_clock: Duration,
    /// Model-call budget (classification calls per request).
    pub max_model_calls: u32,
}

impl Default for RouterBudget {
    fn default() -> Self {
        Self {
            wall_clock: Duration::from_secs(300),
            max_model_calls: 2,
        }
    }
}

/// Resolves targets and executes routed calls.
///
/// Implementations own registry lookup, liveness exclusion, and
/// contract version negotiation; the router owns retry, circuits, and
/// response validation.
#[async_trait]
pub trait RouteTransport: Send + Sync {
    /// Execute one routed envelope on `target`.
    async fn dispatch(
        &self,
        target: &str,
        envelope: &RouteV1,
    ) -> Result<RouteResponseV1, ButlerError>;

    /// Names eligible for new routes right now.
    async fn routable(&self) -> BTreeSet<String>;
}

/// Terminal outcome of one subroute.
#[derive(Debug, Clone, Serialize)]
pub struct SubrouteOutcome {
    /// The segment this outcome belongs to.
    pub butler: String,
    /// The forked subrequest id.
    pub subrequest_id: SubrequestId,
    /// Segment id, when the classifier assigned one.
    pub segment_id: Option<String>,
    /// Success payload.
    pub result: Option<serde_json::Value>,
    /// Failure payload.
    pub error: Option<ErrorEnvelope>,
    /// Whether the subroute was skipped by dependency policy.
    pub skipped: bool,
    /// Dispatch duration.
    pub duration_ms: u64,
}

impl SubrouteOutcome {
    fn succeeded(&self) -> bool {
        !self.skipped && self.error.is_none()
    }
}

/// The router.
pub struct Router {
    classifier: Classifier,
    transport: Arc<dyn RouteTransport>,
    inbox: InboxStore,
    signaler: Option<Arc<dyn LifecycleSignaler>>,
    circuits: DashMap<String, Arc<Mutex<CircuitBreaker>>>,
    budget: RouterBudget,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a router.
    #[must_use]
    pub fn new(
        classifier: Classifier,
        transport: Arc<dyn RouteTransport>,
        inbox: InboxStore,
        budget: RouterBudget,
    ) -> Self {
        Self {
            classifier,
            transport,
            inbox,
            signaler: None,
            circuits: DashMap::new(),
            budget,
        }
    }

    /// Attach the lifecycle signaler.
    #[must_use]
    pub fn with_signaler(mut self, signaler: Arc<dyn LifecycleSignaler>) -> Self {
        self.signaler = Some(signaler);
        self
    }

    /// Process one queued request end to end: classify, fan out,
    /// aggregate, finalize, signal.
    pub async fn handle(&self, work: RoutingWork) {
        let request_id = work.context.request_id;
        let registered = self.transport.routable().await;
        let plan = self
            .classifier
            .classify(&work.normalized_text, &registered)
            .await;

        if let Err(e) = self
            .inbox
            .record_classification(
                request_id,
                &serde_json::to_value(&plan).unwrap_or_default(),
            )
            .await
        {
            // Fail-open: classification audit must not block routing.
            warn!(error = %e, "failed to record classification");
        }

        let outcomes = match tokio::time::timeout(
            self.budget.wall_clock,
            self.execute_plan(&work.context, &plan),
        )
        .await
        {
            Ok(outcomes) => outcomes,
            Err(_) => {
                warn!(%request_id, "fanout exceeded wall-clock budget");
                vec![SubrouteOutcome {
                    butler: "switchboard".to_owned(),
                    subrequest_id: SubrequestId::new(),
                    segment_id: None,
                    result: None,
                    error: Some(ErrorEnvelope::new(
                        ErrorClass::Timeout,
                        "request budget exhausted",
                    )),
                    skipped: false,
                    duration_ms: u64::try_from(self.budget.wall_clock.as_millis())
                        .unwrap_or(u64::MAX),
                }]
            },
        };

        let (state, summary) = aggregate(&outcomes);
        if let Err(e) = self
            .inbox
            .finalize(
                request_id,
                state,
                &summary,
                &serde_json::to_value(&outcomes).unwrap_or_default(),
            )
            .await
        {
            warn!(error = %e, %request_id, "failed to finalize inbox row");
        }
        if let Some(signaler) = &self.signaler {
            signaler.signal(&work.context, state).await;
        }
        info!(%request_id, state = %state, "request finalized");
    }

    /// Execute a plan in its dependency mode.
    pub async fn execute_plan(
        &self,
        context: &RequestContext,
        plan: &FanoutPlan,
    ) -> Vec<SubrouteOutcome> {
        match plan.mode {
            DependencyMode::Parallel => {
                let dispatches = plan
                    .segments
                    .iter()
                    .map(|segment| self.dispatch_segment(context, segment));
                futures::future::join_all(dispatches).await
            },
            DependencyMode::Ordered => {
                let mut outcomes = Vec::with_capacity(plan.segments.len());
                let mut aborted = false;
                for segment in &plan.segments {
                    if aborted {
                        outcomes.push(skipped_outcome(segment));
                        continue;
                    }
                    let outcome = self.dispatch_segment(context, segment).await;
                    if !outcome.succeeded() && !plan.continue_after_failure {
                        aborted = true;
                    }
                    outcomes.push(outcome);
                }
                outcomes
            },
            DependencyMode::Conditional => {
                let mut outcomes: Vec<SubrouteOutcome> = Vec::with_capacity(plan.segments.len());
                for (idx, segment) in plan.segments.iter().enumerate() {
                    let upstream_ok = segment.depends_on.iter().all(|&dep| {
                        dep < idx && outcomes.get(dep).is_some_and(SubrouteOutcome::succeeded)
                    });
                    if upstream_ok {
                        outcomes.push(self.dispatch_segment(context, segment).await);
                    } else {
                        outcomes.push(skipped_outcome(segment));
                    }
                }
                outcomes
            },
        }
    }

    /// Dispatch one segment with retry and circuit policy.
    async fn dispatch_segment(
        &self,
        context: &RequestContext,
        segment: &Segment,
    ) -> SubrouteOutcome {
        let subrequest_id = SubrequestId::new();
        let forked = context.fork(subrequest_id, segment.segment_id.clone());
        let envelope = RouteV1::new(forked, segment.prompt.clone()).with_source(
            context.source_channel.clone(),
            "switchboard",
            "route_execute",
        );
        let started_at = Utc::now();
        let started = std::time::Instant::now();

        let circuit = self
            .circuits
            .entry(segment.butler.as_str().to_owned())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CircuitBreaker::new(
                    CIRCUIT_THRESHOLD,
                    CIRCUIT_RECOVERY_S,
                )))
            })
            .clone();

        let result = self
            .dispatch_with_retry(segment.butler.as_str(), &envelope, &circuit)
            .await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let outcome = match result {
            Ok(response) => SubrouteOutcome {
                butler: segment.butler.as_str().to_owned(),
                subrequest_id,
                segment_id: segment.segment_id.as_ref().map(|s| s.as_str().to_owned()),
                result: response.result,
                error: response.error,
                skipped: false,
                duration_ms,
            },
            Err(e) => SubrouteOutcome {
                butler: segment.butler.as_str().to_owned(),
                subrequest_id,
                segment_id: segment.segment_id.as_ref().map(|s| s.as_str().to_owned()),
                result: None,
                error: Some(ErrorEnvelope::new(e.class, e.message)),
                skipped: false,
                duration_ms,
            },
        };

        let (log_outcome, error_class) = match &outcome.error {
            None => ("ok", None),
            Some(e) => ("error", Some(e.class.as_str())),
        };
        if let Err(e) = self
            .inbox
            .log_route(
                context.request_id,
                subrequest_id,
                outcome.segment_id.as_deref(),
                &outcome.butler,
                "route_execute",
                log_outcome,
                error_class,
                i64::try_from(duration_ms).unwrap_or(i64::MAX),
                started_at,
            )
            .await
        {
            warn!(error = %e, "failed to append routing log");
        }
        outcome
    }

    async fn dispatch_with_retry(
        &self,
        target: &str,
        envelope: &RouteV1,
        circuit: &Arc<Mutex<CircuitBreaker>>,
    ) -> Result<RouteResponseV1, ButlerError> {
        let expected = envelope.request_context.request_id;
        let mut last_error = ButlerError::unavailable(format!("target '{target}' unreachable"));

        for attempt in 0..MAX_ATTEMPTS {
            if !circuit.lock().await.allow(Utc::now()) {
                return Err(ButlerError::unavailable(format!(
                    "circuit open for target '{target}'"
                )));
            }

            match self.transport.dispatch(target, envelope).await {
                Ok(response) => {
                    if let Err(reason) = response.validate_for(expected) {
                        circuit.lock().await.record_failure(Utc::now());
                        return Err(ButlerError::validation(reason));
                    }
                    // Normalize downstream error classes: routed butlers
                    // may only emit the executor set.
                    let response = normalize_response(response);
                    match response.status {
                        RouteStatus::Ok => {
                            circuit.lock().await.record_success();
                            return Ok(response);
                        },
                        RouteStatus::Error => {
                            let retryable = response
                                .error
                                .as_ref()
                                .is_some_and(|e| e.retryable);
                            circuit.lock().await.record_failure(Utc::now());
                            if !retryable || attempt.saturating_add(1) >= MAX_ATTEMPTS {
                                return Ok(response);
                            }
                            if let Some(e) = &response.error {
                                last_error = ButlerError::new(e.class, e.message.clone());
                            }
                        },
                    }
                },
                Err(e) => {
                    circuit.lock().await.record_failure(Utc::now());
                    if !e.retryable() || attempt.saturating_add(1) >= MAX_ATTEMPTS {
                        return Err(e);
                    }
                    last_error = e;
                },
            }

            tokio::time::sleep(backoff(attempt)).await;
        }
        Err(last_error)
    }
}

/// Exponential backoff with jitter.
fn backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(2u32.saturating_pow(attempt));
    let jitter = rand::thread_rng().gen_range(0..100);
    exp.saturating_add(Duration::from_millis(jitter))
}

fn skipped_outcome(segment: &Segment) -> SubrouteOutcome {
    SubrouteOutcome {
        butler: segment.butler.as_str().to_owned(),
        subrequest_id: SubrequestId::new(),
        segment_id: segment.segment_id.as_ref().map(|s| s.as_str().to_owned()),
        result: None,
        error: None,
        skipped: true,
        duration_ms: 0,
    }
}

/// Restrict downstream error classes to the executor set.
fn normalize_response(mut response: RouteResponseV1) -> RouteResponseV1 {
    if let Some(error) = response.error.take() {
        let normalized = ButlerError::normalize_downstream(error.class.as_str(), error.message);
        response.error = Some(ErrorEnvelope::new(normalized.class, normalized.message));
    }
    response
}

/// Compose the terminal lifecycle state and user-facing summary.
#[must_use]
pub(crate) fn aggregate(outcomes: &[SubrouteOutcome]) -> (LifecycleState, String) {
    let required: Vec<&SubrouteOutcome> = outcomes.iter().filter(|o| !o.skipped).collect();
    let failures: Vec<&SubrouteOutcome> =
        required.iter().filter(|o| o.error.is_some()).copied().collect();

    if failures.is_empty() && !required.is_empty() {
        let parts: Vec<String> = required
            .iter()
            .map(|o| {
                let text = o
                    .result
                    .as_ref()
                    .and_then(|r| r.get("result"))
                    .and_then(|r| r.as_str())
                    .unwrap_or("done");
                format!("{}: {text}", o.butler)
            })
            .collect();
        return (LifecycleState::Parsed, parts.join("\n"));
    }

    let failed_names: Vec<String> = failures
        .iter()
        .map(|o| {
            let class = o
                .error
                .as_ref()
                .map_or("internal_error", |e| e.class.as_str());
            format!("{} ({class})", o.butler)
        })
        .collect();
    let summary = if failed_names.is_empty() {
        "Nothing could be dispatched for this request; please try again.".to_owned()
    } else {
        format!(
            "Part of your request could not be completed — {} failed. \
             Successful parts were applied; you can retry the rest.",
            failed_names.join(", ")
        )
    };
    (LifecycleState::Errored, summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassifierAdapter;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn outcome(butler: &str, error: Option<ErrorClass>, skipped: bool) -> SubrouteOutcome {
        SubrouteOutcome {
            butler: butler.to_owned(),
            subrequest_id: SubrequestId::new(),
            segment_id: None,
            result: error
                .is_none()
                .then(|| serde_json::json!({"result": "done"})),
            error: error.map(|c| ErrorEnvelope::new(c, "boom")),
            skipped,
            duration_ms: 10,
        }
    }

    // -----------------------------------------------------------------------
    // Aggregation
    // -----------------------------------------------------------------------

    #[test]
    fn all_success_is_parsed() {
        let (state, summary) = aggregate(&[
            outcome("health", None, false),
            outcome("relationship", None, false),
        ]);
        assert_eq!(state, LifecycleState::Parsed);
        assert!(summary.contains("health"));
    }

    #[test]
    fn any_failure_is_errored_with_actionable_message() {
        let (state, summary) = aggregate(&[
            outcome("health", None, false),
            outcome("relationship", Some(ErrorClass::Timeout), false),
        ]);
        assert_eq!(state, LifecycleState::Errored);
        assert!(summary.contains("relationship (timeout)"));
        assert!(summary.contains("retry"));
    }

    #[test]
    fn skipped_subroutes_are_excluded_from_the_required_set() {
        let (state, _) = aggregate(&[
            outcome("health", None, false),
            outcome("relationship", None, true),
        ]);
        assert_eq!(state, LifecycleState::Parsed);
    }

    #[test]
    fn empty_required_set_is_errored() {
        let (state, _) = aggregate(&[outcome("health", None, true)]);
        assert_eq!(state, LifecycleState::Errored);
    }

    // -----------------------------------------------------------------------
    // Normalization
    // -----------------------------------------------------------------------

    #[test]
    fn downstream_switchboard_classes_normalize_to_internal() {
        let ctx = RequestContext::new("telegram", "bot-A", "user-9");
        let response = RouteResponseV1::err(
            ctx,
            ErrorEnvelope::new(ErrorClass::ClassificationError, "downstream lied"),
            5,
        );
        let normalized = normalize_response(response);
        assert_eq!(
            normalized.error.unwrap().class,
            ErrorClass::InternalError
        );
    }

    // -----------------------------------------------------------------------
    // Fanout modes (fake transport, no database writes)
    // -----------------------------------------------------------------------

    struct FakeTransport {
        /// Butlers that fail with the given class.
        failing: Vec<(String, ErrorClass)>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RouteTransport for FakeTransport {
        async fn dispatch(
            &self,
            target: &str,
            envelope: &RouteV1,
        ) -> Result<RouteResponseV1, ButlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let ctx = envelope.request_context.clone();
            match self.failing.iter().find(|(name, _)| name == target) {
                Some((_, class)) => Ok(RouteResponseV1::err(
                    ctx,
                    ErrorEnvelope::new(*class, "failed"),
                    3,
                )),
                None => Ok(RouteResponseV1::ok(
                    ctx,
                    serde_json::json!({"result": "done"}),
                    3,
                )),
            }
        }

        async fn routable(&self) -> BTreeSet<String> {
            BTreeSet::new()
        }
    }

    struct NullClassifier;

    #[async_trait]
    impl ClassifierAdapter for NullClassifier {
        async fn classify(
            &self,
            _system: &str,
            _message: &str,
        ) -> Result<String, ButlerError> {
            Ok(String::new())
        }
    }

    fn router(failing: Vec<(String, ErrorClass)>) -> (Router, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport {
            failing,
            calls: AtomicU32::new(0),
        });
        let db = butlers_storage::Database::connect_lazy(
            "postgres://localhost/butlers",
            "test_router",
        )
        .unwrap();
        let router = Router::new(
            Classifier::new(Arc::new(NullClassifier), Duration::from_secs(1)),
            Arc::clone(&transport) as Arc<dyn RouteTransport>,
            InboxStore::new(db),
            RouterBudget::default(),
        );
        (router, transport)
    }

    fn plan(mode: DependencyMode, butlers: &[&str]) -> FanoutPlan {
        FanoutPlan {
            segments: butlers.iter().map(|b| Segment::new(*b, "task")).collect(),
            mode,
            continue_after_failure: false,
        }
    }

    #[tokio::test]
    async fn parallel_mode_dispatches_all_segments() {
        let (router, _) = router(vec![]);
        let ctx = RequestContext::new("telegram", "bot-A", "user-9");
        let outcomes = router
            .execute_plan(&ctx, &plan(DependencyMode::Parallel, &["health", "relationship"]))
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(SubrouteOutcome::succeeded));
    }

    #[tokio::test]
    async fn request_id_is_preserved_through_forks() {
        let (router, _) = router(vec![]);
        let ctx = RequestContext::new("telegram", "bot-A", "user-9");
        let outcomes = router
            .execute_plan(&ctx, &plan(DependencyMode::Parallel, &["health"]))
            .await;
        // The fake transport echoes the forked context; success implies
        // validate_for(root id) passed inside dispatch_with_retry.
        assert!(outcomes[0].succeeded());
    }

    #[tokio::test]
    async fn ordered_mode_aborts_after_failure() {
        let (router, transport) = router(vec![(
            "health".to_owned(),
            ErrorClass::ValidationError,
        )]);
        let ctx = RequestContext::new("telegram", "bot-A", "user-9");
        let outcomes = router
            .execute_plan(&ctx, &plan(DependencyMode::Ordered, &["health", "relationship"]))
            .await;
        assert!(outcomes[0].error.is_some());
        assert!(outcomes[1].skipped);
        // validation_error is non-retryable: exactly one call.
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ordered_mode_continues_when_policy_allows() {
        let (router, _) = router(vec![("health".to_owned(), ErrorClass::ValidationError)]);
        let ctx = RequestContext::new("telegram", "bot-A", "user-9");
        let mut p = plan(DependencyMode::Ordered, &["health", "relationship"]);
        p.continue_after_failure = true;
        let outcomes = router.execute_plan(&ctx, &p).await;
        assert!(outcomes[0].error.is_some());
        assert!(!outcomes[1].skipped);
        assert!(outcomes[1].succeeded());
    }

    #[tokio::test]
    async fn conditional_mode_skips_dependents_of_failures() {
        let (router, _) = router(vec![("health".to_owned(), ErrorClass::InternalError)]);
        let ctx = RequestContext::new("telegram", "bot-A", "user-9");
        let mut p = plan(DependencyMode::Conditional, &["health", "relationship"]);
        p.segments[1].depends_on = vec![0];
        let outcomes = router.execute_plan(&ctx, &p).await;
        assert!(outcomes[0].error.is_some());
        assert!(outcomes[1].skipped);
    }

    #[tokio::test]
    async fn retryable_failures_are_retried() {
        let (router, transport) = router(vec![(
            "health".to_owned(),
            ErrorClass::TargetUnavailable,
        )]);
        let ctx = RequestContext::new("telegram", "bot-A", "user-9");
        let outcomes = router
            .execute_plan(&ctx, &plan(DependencyMode::Parallel, &["health"]))
            .await;
        assert!(outcomes[0].error.is_some());
        assert_eq!(transport.calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }
}
