//! Delivery-engine integration tests.
//!
//! Ignored by default; run against a disposable database with
//! `BUTLERS_TEST_DATABASE_URL=postgres://... cargo test -- --ignored`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use butlers_core::{NotifyV1, RequestContext, RouteStatus};
use butlers_messenger::{
    DeliveryEngine, DeliveryJob, DeliveryStore, EngineConfig, ProviderAdapter, ProviderFailure,
    ProviderReceipt, RateLimiter, RateLimitsConfig,
};
use butlers_storage::{Database, MigrationPlan, MigrationRunner, chains};

/// Counts provider side effects; that count is the property under test.
struct CountingProvider {
    calls: AtomicU32,
}

#[async_trait]
impl ProviderAdapter for CountingProvider {
    fn channel(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, _job: &DeliveryJob) -> Result<ProviderReceipt, ProviderFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderReceipt {
            provider_delivery_id: Some("prov-1".to_owned()),
        })
    }
}

async fn engine(schema: &str) -> (Arc<DeliveryEngine>, Arc<CountingProvider>) {
    let url = std::env::var("BUTLERS_TEST_DATABASE_URL")
        .expect("set BUTLERS_TEST_DATABASE_URL to run ignored postgres tests");
    let db = Database::connect(&url, schema).await.unwrap();
    MigrationRunner::new(&db)
        .apply(&MigrationPlan::with_core().then(chains::messenger_chain()))
        .await
        .unwrap();

    let provider = Arc::new(CountingProvider {
        calls: AtomicU32::new(0),
    });
    let engine = Arc::new(DeliveryEngine::new(
        EngineConfig::default(),
        DeliveryStore::new(db),
        RateLimiter::new(RateLimitsConfig::default(), chrono::Utc::now()),
        vec![Arc::clone(&provider) as Arc<dyn ProviderAdapter>],
    ));
    (engine, provider)
}

fn notify() -> NotifyV1 {
    let mut envelope = NotifyV1::send("health", "telegram", "Hi");
    envelope.delivery.recipient = Some("5".to_owned());
    envelope.request_context = Some(RequestContext::new("telegram", "bot-A", "user-9"));
    envelope
}

#[tokio::test]
#[ignore = "needs a live postgres"]
async fn duplicate_notifies_produce_exactly_one_provider_call() {
    let (engine, provider) = engine("it_delivery_dupe").await;
    let envelope = notify();

    let first = engine.deliver("health", &envelope).await;
    assert_eq!(first.status, RouteStatus::Ok);
    let original_id = first.delivery.delivery_id.unwrap();

    // Two retries of the identical envelope: same delivery id back,
    // no further provider calls.
    for _ in 0..2 {
        let dup = engine.deliver("health", &envelope).await;
        assert_eq!(dup.status, RouteStatus::Ok);
        assert_eq!(dup.delivery.delivery_id, Some(original_id));
    }
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[ignore = "needs a live postgres"]
async fn concurrent_duplicates_coalesce() {
    let (engine, provider) = engine("it_delivery_race").await;
    let envelope = notify();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        let envelope = envelope.clone();
        handles.push(tokio::spawn(async move {
            engine.deliver("health", &envelope).await
        }));
    }

    let mut ids = std::collections::BTreeSet::new();
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status, RouteStatus::Ok);
        ids.insert(response.delivery.delivery_id.unwrap());
    }
    assert_eq!(ids.len(), 1, "all duplicates must return one delivery id");
    assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
#[ignore = "needs a live postgres"]
async fn origin_spoofing_fails_before_any_side_effect() {
    let (engine, provider) = engine("it_delivery_spoof").await;
    let envelope = notify();

    let response = engine.deliver("finance", &envelope).await;
    assert_eq!(response.status, RouteStatus::Error);
    assert_eq!(
        response.error.unwrap().class,
        butlers_core::ErrorClass::ValidationError
    );
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}
