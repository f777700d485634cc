//! Production transport: registry-resolved RPC dispatch.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use butlers_core::{ButlerError, RouteResponseV1, RouteV1};
use butlers_rpc::{ButlerClient, RouteVersion};
use butlers_runtime::{RuntimeAdapter, SpawnRequest};

use crate::classify::ClassifierAdapter;
use crate::registry::{Liveness, Registry};
use crate::router::RouteTransport;

/// Resolves targets through the registry and dispatches over HTTP.
///
/// Owns liveness exclusion and route contract negotiation: an envelope
/// whose version falls outside the target's advertised range fails with
/// `validation_error` carrying the supported range.
pub struct RegistryTransport {
    registry: Arc<Registry>,
    clients: DashMap<String, ButlerClient>,
}

impl std::fmt::Debug for RegistryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryTransport").finish_non_exhaustive()
    }
}

impl RegistryTransport {
    /// Create a transport over the registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            clients: DashMap::new(),
        }
    }

    fn client_for(&self, name: &str, endpoint: &str) -> Result<ButlerClient, ButlerError> {
        if let Some(client) = self.clients.get(name) {
            if client.endpoint() == endpoint {
                return Ok(client.clone());
            }
        }
        let client = ButlerClient::connect(endpoint)
            .map_err(|e| ButlerError::unavailable(e.to_string()))?;
        self.clients.insert(name.to_owned(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl RouteTransport for RegistryTransport {
    async fn dispatch(
        &self,
        target: &str,
        envelope: &RouteV1,
    ) -> Result<RouteResponseV1, ButlerError> {
        let record = self
            .registry
            .get(target)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))?
            .ok_or_else(|| {
                ButlerError::unavailable(format!("butler '{target}' is not registered"))
            })?;

        if self.registry.liveness_of(&record, Utc::now()) == Liveness::Offline {
            return Err(ButlerError::unavailable(format!(
                "butler '{target}' is offline"
            )));
        }

        let range = RouteVersion {
            min: record.route_contract_min,
            max: record.route_contract_max,
        };
        if !range.accepts(&envelope.schema_version) {
            return Err(ButlerError::validation(format!(
                "target '{target}' supports route.v{}..route.v{}, envelope is '{}'",
                record.route_contract_min, record.route_contract_max, envelope.schema_version
            )));
        }

        let client = self.client_for(target, &record.endpoint_url)?;
        client
            .route_execute("switchboard", envelope)
            .await
            .map_err(|e| ButlerClient::classify_failure(&e))
    }

    async fn routable(&self) -> BTreeSet<String> {
        self.registry
            .routable_names(Utc::now())
            .await
            .unwrap_or_default()
            .into_iter()
            .collect()
    }
}

/// Classifier adapter over the ephemeral runtime: the decomposition
/// call is just another model invocation with an isolated prompt.
pub struct RuntimeClassifierAdapter {
    adapter: Arc<dyn RuntimeAdapter>,
    model: String,
}

impl std::fmt::Debug for RuntimeClassifierAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeClassifierAdapter")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl RuntimeClassifierAdapter {
    /// Create an adapter invoking `model` through the runtime.
    #[must_use]
    pub fn new(adapter: Arc<dyn RuntimeAdapter>, model: impl Into<String>) -> Self {
        Self {
            adapter,
            model: model.into(),
        }
    }
}

#[async_trait]
impl ClassifierAdapter for RuntimeClassifierAdapter {
    async fn classify(&self, system_prompt: &str, message: &str) -> Result<String, ButlerError> {
        let outcome = self
            .adapter
            .invoke(SpawnRequest {
                system_prompt: system_prompt.to_owned(),
                prompt: message.to_owned(),
                model: self.model.clone(),
                env: std::collections::BTreeMap::new(),
            })
            .await
            .map_err(|e| ButlerError::new(e.class(), e.to_string()))?;
        outcome
            .result
            .ok_or_else(|| ButlerError::internal("classifier produced no output"))
    }
}
