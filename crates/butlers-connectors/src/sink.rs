//! The canonical ingest boundary, from the connector's side.

use async_trait::async_trait;

use butlers_core::{HeartbeatV1, IngestV1};
use butlers_rpc::ButlerClient;

use crate::error::{ConnectorError, ConnectorResult};

/// Where normalized events go. Prod is Switchboard over RPC; tests
/// record.
#[async_trait]
pub trait IngestSink: Send + Sync {
    /// Submit one envelope. Returns once Switchboard accepted it.
    async fn submit(&self, envelope: &IngestV1) -> ConnectorResult<()>;

    /// Emit a heartbeat beacon.
    async fn heartbeat(&self, beacon: &HeartbeatV1) -> ConnectorResult<()>;
}

/// Sink over the Switchboard RPC endpoint.
#[derive(Debug, Clone)]
pub struct RpcIngestSink {
    client: ButlerClient,
}

impl RpcIngestSink {
    /// Create a sink bound to Switchboard.
    #[must_use]
    pub fn new(client: ButlerClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IngestSink for RpcIngestSink {
    async fn submit(&self, envelope: &IngestV1) -> ConnectorResult<()> {
        self.client
            .ingest(envelope)
            .await
            .map(|_| ())
            .map_err(|e| ConnectorError::IngestRejected(e.to_string()))
    }

    async fn heartbeat(&self, beacon: &HeartbeatV1) -> ConnectorResult<()> {
        self.client
            .connector_heartbeat(beacon)
            .await
            .map_err(|e| ConnectorError::IngestRejected(e.to_string()))
    }
}
