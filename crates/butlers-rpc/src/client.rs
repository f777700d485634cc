//! HTTP client for calling other butlers.
//!
//! A thin wrapper over the client half generated from the
//! [`crate::api`] trait: connection setup, deadline configuration, and
//! transport-failure classification live here; method signatures come
//! from the API definition.

use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};

use butlers_core::{
    ButlerError, HeartbeatV1, IngestV1, NotifyResponseV1, NotifyV1, RouteResponseV1, RouteV1,
};
use butlers_scheduler::TickSummary;

use crate::api::ButlerRpcClient;
use crate::error::{RpcError, RpcResult, from_error_object};
use crate::types::StatusResponse;

/// Default per-call deadline.
const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

/// A client bound to one butler's RPC endpoint.
#[derive(Debug, Clone)]
pub struct ButlerClient {
    client: HttpClient,
    endpoint: String,
}

impl ButlerClient {
    /// Connect to a butler endpoint (e.g. `http://127.0.0.1:8011`).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Transport`] for a malformed endpoint.
    pub fn connect(endpoint: &str) -> RpcResult<Self> {
        Self::connect_with_timeout(endpoint, DEFAULT_TIMEOUT)
    }

    /// Connect with an explicit per-call deadline.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Transport`] for a malformed endpoint.
    pub fn connect_with_timeout(
        endpoint: &str,
        timeout: std::time::Duration,
    ) -> RpcResult<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .build(endpoint)
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_owned(),
        })
    }

    /// The endpoint this client is bound to.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Fetch the target's status.
    ///
    /// # Errors
    ///
    /// Returns transport failures or the target's classified error.
    pub async fn status(&self) -> RpcResult<StatusResponse> {
        ButlerRpcClient::status(&self.client).await.map_err(map_client_err)
    }

    /// Drive the target's scheduler tick.
    ///
    /// # Errors
    ///
    /// Returns transport failures or the target's classified error.
    pub async fn tick(&self) -> RpcResult<TickSummary> {
        ButlerRpcClient::tick(&self.client).await.map_err(map_client_err)
    }

    /// Execute a routed envelope on the target as `caller`.
    ///
    /// # Errors
    ///
    /// Returns transport failures or the target's classified error;
    /// the router synthesizes terminal responses from either.
    pub async fn route_execute(
        &self,
        caller: &str,
        envelope: &RouteV1,
    ) -> RpcResult<RouteResponseV1> {
        ButlerRpcClient::route_execute(&self.client, caller.to_owned(), envelope.clone())
            .await
            .map_err(map_client_err)
    }

    /// Submit a `notify.v1` to the target (normally Switchboard).
    ///
    /// # Errors
    ///
    /// Returns transport failures or the target's classified error.
    pub async fn notify(&self, caller: &str, envelope: &NotifyV1) -> RpcResult<NotifyResponseV1> {
        ButlerRpcClient::notify(&self.client, caller.to_owned(), envelope.clone())
            .await
            .map_err(map_client_err)
    }

    /// Submit a canonical ingest envelope (Switchboard only).
    ///
    /// # Errors
    ///
    /// Returns transport failures or the target's classified error.
    pub async fn ingest(&self, envelope: &IngestV1) -> RpcResult<serde_json::Value> {
        ButlerRpcClient::ingest(&self.client, envelope.clone())
            .await
            .map_err(map_client_err)
    }

    /// Submit a connector heartbeat (Switchboard only).
    ///
    /// # Errors
    ///
    /// Returns transport failures or the target's classified error.
    pub async fn connector_heartbeat(&self, beacon: &HeartbeatV1) -> RpcResult<()> {
        ButlerRpcClient::connector_heartbeat(&self.client, beacon.clone())
            .await
            .map_err(map_client_err)
    }

    /// Advertise a butler into the registry (Switchboard only).
    ///
    /// # Errors
    ///
    /// Returns transport failures or the target's classified error.
    pub async fn registry_register(&self, record: &serde_json::Value) -> RpcResult<()> {
        ButlerRpcClient::registry_register(&self.client, record.clone())
            .await
            .map_err(map_client_err)
    }

    /// List registered butlers (Switchboard only).
    ///
    /// # Errors
    ///
    /// Returns transport failures or the target's classified error.
    pub async fn registry_list(&self) -> RpcResult<Vec<serde_json::Value>> {
        ButlerRpcClient::registry_list(&self.client)
            .await
            .map_err(map_client_err)
    }

    /// Classify a transport-level failure for routing policy.
    #[must_use]
    pub fn classify_failure(err: &RpcError) -> ButlerError {
        match err {
            RpcError::Butler(e) => ButlerError::new(e.class, e.message.clone()),
            RpcError::Transport(msg) if msg.contains("timed out") => {
                ButlerError::timeout(msg.clone())
            },
            RpcError::Transport(msg) | RpcError::Startup(msg) => {
                ButlerError::unavailable(msg.clone())
            },
        }
    }
}

fn map_client_err(err: jsonrpsee::core::ClientError) -> RpcError {
    match err {
        jsonrpsee::core::ClientError::Call(obj) => RpcError::Butler(from_error_object(&obj)),
        other => RpcError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_endpoint_is_a_transport_error() {
        let err = ButlerClient::connect("not a url").unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[test]
    fn transport_timeouts_classify_as_timeout() {
        let err = RpcError::Transport("request timed out".to_owned());
        let classified = ButlerClient::classify_failure(&err);
        assert_eq!(classified.class, butlers_core::ErrorClass::Timeout);
    }

    #[test]
    fn other_transport_failures_classify_as_unavailable() {
        let err = RpcError::Transport("connection refused".to_owned());
        let classified = ButlerClient::classify_failure(&err);
        assert_eq!(classified.class, butlers_core::ErrorClass::TargetUnavailable);
        assert!(classified.retryable());
    }
}
