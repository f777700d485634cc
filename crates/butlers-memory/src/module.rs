//! The memory capability module.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use butlers_module::{
    ButlerModule, ModuleContext, ToolDescriptor, ToolHandler, ToolOutput,
};
use butlers_storage::MigrationChain;

use crate::retrieval::{RetrievalBudget, RetrievalInput, build_context};
use crate::store::MemoryStore;

/// The `memory` module: contributes storage tools and the retrieval
/// context used by the spawner.
#[derive(Debug, Default)]
pub struct MemoryModule;

impl MemoryModule {
    /// Build the retrieval context for a prompt. Fail-open: any storage
    /// failure yields `None` and the spawner proceeds without memory.
    pub async fn context_for(
        store: &MemoryStore,
        tenant: &str,
        caller_scope: &str,
        prompt: &str,
    ) -> Option<String> {
        let facts = match store.visible_facts(tenant, caller_scope).await {
            Ok(facts) => facts,
            Err(e) => {
                warn!(error = %e, "memory fact retrieval failed; continuing without");
                return None;
            },
        };
        let rules = match store.visible_rules(tenant, caller_scope).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "memory rule retrieval failed; continuing without");
                return None;
            },
        };
        let episodes = store.recent_episodes(tenant, 5).await.unwrap_or_default();

        build_context(
            prompt,
            &RetrievalInput {
                facts,
                rules,
                episodes,
            },
            RetrievalBudget::default(),
            Utc::now(),
        )
    }
}

struct StoreFactHandler {
    store: MemoryStore,
    tenant: String,
    scope: String,
}

#[async_trait]
impl ToolHandler for StoreFactHandler {
    async fn call(&self, args: serde_json::Value) -> ToolOutput {
        let subject = args.get("subject").and_then(|v| v.as_str());
        let predicate = args.get("predicate").and_then(|v| v.as_str());
        let content = args.get("content").and_then(|v| v.as_str());
        let (Some(subject), Some(predicate), Some(content)) = (subject, predicate, content)
        else {
            return ToolOutput::Error {
                class: butlers_core::ErrorClass::ValidationError,
                message: "subject, predicate, and content are required".to_owned(),
            };
        };
        let confidence = args
            .get("confidence")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.7);
        let importance = args
            .get("importance")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(0.5);
        match self
            .store
            .upsert_fact(
                &self.tenant,
                &self.scope,
                subject,
                predicate,
                content,
                confidence,
                importance,
            )
            .await
        {
            Ok(id) => ToolOutput::ok(serde_json::json!({"fact_id": id})),
            Err(e) => ToolOutput::Error {
                class: butlers_core::ErrorClass::InternalError,
                message: e.to_string(),
            },
        }
    }
}

struct RetractFactHandler {
    store: MemoryStore,
}

#[async_trait]
impl ToolHandler for RetractFactHandler {
    async fn call(&self, args: serde_json::Value) -> ToolOutput {
        let Some(id) = args
            .get("fact_id")
            .and_then(|v| v.as_str())
            .and_then(|s| uuid::Uuid::parse_str(s).ok())
        else {
            return ToolOutput::Error {
                class: butlers_core::ErrorClass::ValidationError,
                message: "fact_id (uuid) is required".to_owned(),
            };
        };
        match self.store.retract_fact(id).await {
            Ok(()) => ToolOutput::ok(serde_json::json!({"retracted": true})),
            Err(e) => ToolOutput::Error {
                class: butlers_core::ErrorClass::ValidationError,
                message: e.to_string(),
            },
        }
    }
}

struct RecallHandler {
    store: MemoryStore,
    tenant: String,
    scope: String,
}

#[async_trait]
impl ToolHandler for RecallHandler {
    async fn call(&self, args: serde_json::Value) -> ToolOutput {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or("");
        match MemoryModule::context_for(&self.store, &self.tenant, &self.scope, query).await {
            Some(context) => ToolOutput::ok(serde_json::json!({"context": context})),
            None => ToolOutput::ok(serde_json::json!({"context": ""})),
        }
    }
}

#[async_trait]
impl ButlerModule for MemoryModule {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn migration_chain(&self) -> Option<MigrationChain> {
        Some(butlers_storage::chains::memory_chain())
    }

    fn register_tools(&self, ctx: &ModuleContext) -> Vec<(ToolDescriptor, Arc<dyn ToolHandler>)> {
        let store = MemoryStore::new(ctx.db.clone());
        let tenant = ctx
            .config
            .get("tenant")
            .and_then(toml::Value::as_str)
            .unwrap_or("default")
            .to_owned();
        let scope = ctx.butler_name.clone();

        vec![
            (
                ToolDescriptor::new("memory_store_fact", "Store or update a remembered fact"),
                Arc::new(StoreFactHandler {
                    store: store.clone(),
                    tenant: tenant.clone(),
                    scope: scope.clone(),
                }) as Arc<dyn ToolHandler>,
            ),
            (
                ToolDescriptor::new("memory_retract_fact", "Withdraw a remembered fact"),
                Arc::new(RetractFactHandler {
                    store: store.clone(),
                }) as Arc<dyn ToolHandler>,
            ),
            (
                ToolDescriptor::new("memory_recall", "Retrieve remembered context for a query"),
                Arc::new(RecallHandler {
                    store,
                    tenant,
                    scope,
                }) as Arc<dyn ToolHandler>,
            ),
        ]
    }
}
