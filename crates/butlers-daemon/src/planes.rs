//! Switchboard and Messenger plane assembly.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use butlers_core::{
    ButlerError, DeliveryIntent, LifecycleState, NotifyV1, RequestContext, RouteV1,
};
use butlers_messenger::{
    DeliveryEngine, DeliveryStore, EngineConfig, HttpEmailProvider, MessengerPlane,
    ProviderAdapter, RateLimiter, RateLimitsConfig, TelegramProvider,
};
use butlers_rpc::{IngressPlane, PlaneOverride};
use butlers_runtime::RuntimeAdapter;
use butlers_storage::Database;
use butlers_switchboard::{
    AdmissionQueue, Classifier, IngressService, LifecycleSignaler, OverflowPolicy, Registry,
    RegistryTransport, Router, RouterBudget, RouteTransport, RuntimeClassifierAdapter,
    SwitchboardPlane,
};

/// Admission queue depth before overflow policy applies.
const ADMISSION_CAPACITY: usize = 256;
/// Routing worker pool size.
const ROUTER_WORKERS: usize = 4;
/// Classifier call deadline.
const CLASSIFIER_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(45);

/// Everything the Switchboard butler adds on top of the core daemon.
pub(crate) struct SwitchboardParts {
    /// Plane override for `route_execute`/`notify`.
    pub plane: Arc<dyn PlaneOverride>,
    /// The ingest/registry surface.
    pub api: Arc<dyn IngressPlane>,
    /// Routing worker handles.
    pub workers: Vec<tokio::task::JoinHandle<()>>,
}

/// Assemble the Switchboard plane.
pub(crate) fn build_switchboard(
    db: &Database,
    runtime_adapter: Arc<dyn RuntimeAdapter>,
    classifier_model: &str,
    liveness_ttl_s: i64,
) -> SwitchboardParts {
    let registry = Arc::new(Registry::new(
        db.clone(),
        liveness_ttl_s,
        liveness_ttl_s.saturating_mul(5),
    ));
    let transport: Arc<dyn RouteTransport> =
        Arc::new(RegistryTransport::new(Arc::clone(&registry)));
    let inbox = butlers_switchboard::InboxStore::new(db.clone());
    let queue = Arc::new(AdmissionQueue::new(ADMISSION_CAPACITY, OverflowPolicy::Reject));
    let signaler: Arc<dyn LifecycleSignaler> = Arc::new(ReactionSignaler {
        transport: Arc::clone(&transport),
    });

    let ingress = Arc::new(
        IngressService::new(inbox.clone(), Arc::clone(&queue))
            .with_signaler(Arc::clone(&signaler)),
    );

    let classifier = Classifier::new(
        Arc::new(RuntimeClassifierAdapter::new(
            runtime_adapter,
            classifier_model,
        )),
        CLASSIFIER_TIMEOUT,
    );
    let router = Arc::new(
        Router::new(
            classifier,
            Arc::clone(&transport),
            inbox.clone(),
            RouterBudget::default(),
        )
        .with_signaler(Arc::clone(&signaler)),
    );

    let mut workers = Vec::with_capacity(ROUTER_WORKERS);
    for worker in 0..ROUTER_WORKERS {
        let queue = Arc::clone(&queue);
        let router = Arc::clone(&router);
        workers.push(tokio::spawn(async move {
            info!(worker, "routing worker started");
            loop {
                let work = queue.next().await;
                router.handle(work).await;
            }
        }));
    }

    SwitchboardParts {
        plane: Arc::new(SwitchboardPlane::new(Arc::clone(&transport))),
        api: Arc::new(SwitchboardApi {
            ingress,
            inbox,
            registry,
        }),
        workers,
    }
}

/// Lifecycle signaling via Messenger reactions.
///
/// A small, bounded concern: build a `react` notify for the request's
/// thread and route it to Messenger. Failures are logged and dropped;
/// reactions must never affect request processing.
struct ReactionSignaler {
    transport: Arc<dyn RouteTransport>,
}

#[async_trait]
impl LifecycleSignaler for ReactionSignaler {
    async fn signal(&self, context: &RequestContext, state: LifecycleState) {
        if context.source_channel != "telegram" {
            return;
        }
        let mut envelope = NotifyV1::send("switchboard", "telegram", "");
        envelope.delivery.intent = DeliveryIntent::React;
        envelope.delivery.message = None;
        envelope.delivery.emoji = Some(state.telegram_reaction().to_owned());
        envelope.request_context = Some(context.clone());

        let notify_value = match serde_json::to_value(&envelope) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "could not encode reaction notify");
                return;
            },
        };
        let route = RouteV1::new(context.clone(), "deliver notification")
            .with_context(serde_json::json!({"notify_request": notify_value}))
            .with_source("telegram", "switchboard", "notify");

        if let Err(e) = self.transport.dispatch("messenger", &route).await {
            warn!(error = %e, state = %state, "lifecycle reaction failed");
        }
    }
}

/// The Switchboard RPC surface implementation.
struct SwitchboardApi {
    ingress: Arc<IngressService>,
    inbox: butlers_switchboard::InboxStore,
    registry: Arc<Registry>,
}

#[async_trait]
impl IngressPlane for SwitchboardApi {
    async fn ingest(
        &self,
        envelope: butlers_core::IngestV1,
    ) -> Result<serde_json::Value, ButlerError> {
        let accept = self.ingress.ingest(&envelope).await?;
        serde_json::to_value(accept).map_err(|e| ButlerError::internal(e.to_string()))
    }

    async fn heartbeat(
        &self,
        beacon: butlers_core::HeartbeatV1,
    ) -> Result<(), ButlerError> {
        self.inbox
            .record_heartbeat(&beacon)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    async fn register(&self, record: serde_json::Value) -> Result<(), ButlerError> {
        let record: butlers_switchboard::ButlerRecord = serde_json::from_value(record)
            .map_err(|e| ButlerError::validation(format!("bad butler record: {e}")))?;
        self.registry
            .register(record)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    async fn registry_list(&self) -> Result<Vec<serde_json::Value>, ButlerError> {
        let records = self
            .registry
            .list()
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))?;
        records
            .into_iter()
            .map(|r| serde_json::to_value(r).map_err(|e| ButlerError::internal(e.to_string())))
            .collect()
    }
}

/// Assemble the Messenger plane from the environment: a telegram
/// provider when `BUTLER_TELEGRAM_TOKEN` is set, an email relay when
/// `BUTLER_EMAIL_RELAY_URL` and `BUTLER_EMAIL_ADDRESS` are.
pub(crate) fn build_messenger(
    db: &Database,
    owner_contacts: std::collections::BTreeMap<String, String>,
) -> Arc<dyn PlaneOverride> {
    let mut providers: Vec<Arc<dyn ProviderAdapter>> = Vec::new();
    if let Ok(token) = std::env::var("BUTLER_TELEGRAM_TOKEN") {
        providers.push(Arc::new(TelegramProvider::new(token)));
    }
    if let (Ok(relay), Ok(address)) = (
        std::env::var("BUTLER_EMAIL_RELAY_URL"),
        std::env::var("BUTLER_EMAIL_ADDRESS"),
    ) {
        providers.push(Arc::new(HttpEmailProvider::new(relay, address)));
    }
    if providers.is_empty() {
        warn!("messenger has no providers configured; deliveries will fail validation");
    }

    let engine = Arc::new(DeliveryEngine::new(
        EngineConfig {
            owner_contacts,
            ..EngineConfig::default()
        },
        DeliveryStore::new(db.clone()),
        RateLimiter::new(RateLimitsConfig::default(), chrono::Utc::now()),
        providers,
    ));
    Arc::new(MessengerPlane::new(engine))
}
