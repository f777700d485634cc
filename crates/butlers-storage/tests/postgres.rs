//! Postgres-backed integration tests.
//!
//! Ignored by default; run against a disposable database with
//! `BUTLERS_TEST_DATABASE_URL=postgres://... cargo test -- --ignored`.
//! Each test uses its own schema so runs are independent.

use butlers_core::TriggerSource;
use butlers_storage::{
    Database, MigrationPlan, MigrationRunner, OpenSession, PricingTable, SessionFilter,
    SessionLog, SessionTerminal, StateStore,
};

fn test_url() -> String {
    std::env::var("BUTLERS_TEST_DATABASE_URL")
        .expect("set BUTLERS_TEST_DATABASE_URL to run ignored postgres tests")
}

async fn fresh_db(schema: &str) -> Database {
    let db = Database::connect(&test_url(), schema).await.unwrap();
    MigrationRunner::new(&db)
        .apply(&MigrationPlan::with_core())
        .await
        .unwrap();
    db
}

#[tokio::test]
#[ignore = "needs a live postgres"]
async fn migrations_are_idempotent_across_restarts() {
    let db = fresh_db("it_migrate").await;
    let runner = MigrationRunner::new(&db);
    let second_run = runner.apply(&MigrationPlan::with_core()).await.unwrap();
    assert_eq!(second_run, 0, "already-applied revisions must be skipped");
}

#[tokio::test]
#[ignore = "needs a live postgres"]
async fn state_store_round_trip_and_prefix_listing() {
    let db = fresh_db("it_state").await;
    let store = StateStore::new(db);

    store
        .set("prefs.language", &serde_json::json!("en"))
        .await
        .unwrap();
    store
        .set("prefs.timezone", &serde_json::json!("Europe/Amsterdam"))
        .await
        .unwrap();
    store.set("cursor", &serde_json::json!(42)).await.unwrap();

    assert_eq!(
        store.get("prefs.language").await.unwrap(),
        Some(serde_json::json!("en"))
    );
    let prefs = store.list(Some("prefs.")).await.unwrap();
    assert_eq!(prefs.len(), 2);

    // Last write wins.
    store
        .set("prefs.language", &serde_json::json!("nl"))
        .await
        .unwrap();
    assert_eq!(
        store.get("prefs.language").await.unwrap(),
        Some(serde_json::json!("nl"))
    );

    assert!(store.delete("cursor").await.unwrap());
    assert!(!store.delete("cursor").await.unwrap());
}

#[tokio::test]
#[ignore = "needs a live postgres"]
async fn session_rows_reach_terminal_state_even_after_crash() {
    let db = fresh_db("it_sessions").await;
    let log = SessionLog::new(db, PricingTable::default());

    let open = OpenSession {
        trigger_source: TriggerSource::Trigger,
        prompt: "do the thing".to_owned(),
        model: "claude-sonnet-4-20250514".to_owned(),
        parent_session_id: None,
        request_id: None,
        subrequest_id: None,
        segment_id: None,
    };
    let completed = log.create(&open).await.unwrap();
    log.complete(
        completed,
        &SessionTerminal {
            success: true,
            result: Some("done".to_owned()),
            error: None,
            tool_calls: 2,
            input_tokens: 100,
            output_tokens: 20,
            duration_ms: 1200,
            trace_id: None,
        },
    )
    .await
    .unwrap();

    // A crashed session never got its terminal write.
    let crashed = log.create(&open).await.unwrap();
    let recovered = log.recover_dangling().await.unwrap();
    assert_eq!(recovered, 1);

    let row = log.get(crashed).await.unwrap().unwrap();
    assert!(row.completed_at.is_some());
    assert_eq!(row.success, Some(false));

    // Completing an already-terminal row is an error, not a rewrite.
    assert!(
        log.complete(
            completed,
            &SessionTerminal {
                success: false,
                result: None,
                error: Some("late".to_owned()),
                tool_calls: 0,
                input_tokens: 0,
                output_tokens: 0,
                duration_ms: 1,
                trace_id: None,
            },
        )
        .await
        .is_err()
    );

    let listed = log
        .list(&SessionFilter {
            success: Some(true),
            ..SessionFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
}
