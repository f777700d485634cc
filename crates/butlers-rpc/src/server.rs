//! JSON-RPC server assembly.
//!
//! [`RpcApi`] implements the [`ButlerRpcServer`] trait generated from
//! the API definition in [`crate::api`]; `serve` binds the listener
//! and starts it via `into_rpc()`. Every method opens the required
//! observability span (`butler`, `tool_name`, `outcome`,
//! `trigger_source`), runs its handler inside it, records the outcome,
//! and maps classified failures onto the wire via
//! [`crate::error::to_error_object`].

use std::net::SocketAddr;
use std::sync::Arc;

use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use tracing::{Instrument, info};

use butlers_approval::{Actor, ApprovalRecord};
use butlers_core::{
    ActionId, ButlerError, HeartbeatV1, IngestV1, NotifyResponseV1, NotifyV1, RouteResponseV1,
    RouteV1, SessionId,
};
use butlers_module::ToolOutput;
use butlers_runtime::SessionSummary;
use butlers_scheduler::{ScheduledTask, TickSummary};
use butlers_storage::{
    DailyUsage, ScheduleCost, SessionFilter, SessionRecord, StateEntry, UsageSummary,
};
use butlers_telemetry::{ToolOutcome, ToolSpan};

use crate::api::ButlerRpcServer;
use crate::error::{RpcError, RpcResult, to_error_object};
use crate::state::RpcState;
use crate::types::{ScheduleCreateParams, StateSetParams, StatusResponse, TriggerParams};

/// A running RPC server.
#[derive(Debug)]
pub struct RpcServerHandle {
    handle: ServerHandle,
    /// The bound address.
    pub addr: SocketAddr,
}

impl RpcServerHandle {
    /// Signal shutdown and wait for the listener to stop.
    pub async fn stop(self) {
        // Stop errors only occur when already stopped.
        let _ = self.handle.stop();
        self.handle.stopped().await;
    }
}

/// Bind the listener on `port` and start the RPC implementation.
///
/// # Errors
///
/// Returns [`RpcError::Startup`] when the port cannot be bound.
pub async fn serve(state: Arc<RpcState>, port: u16) -> RpcResult<RpcServerHandle> {
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();
    let server = Server::builder()
        .build(addr)
        .await
        .map_err(|e| RpcError::Startup(e.to_string()))?;
    let addr = server
        .local_addr()
        .map_err(|e| RpcError::Startup(e.to_string()))?;

    let handle = server.start(RpcApi { state }.into_rpc());
    info!(%addr, "rpc listener started");
    Ok(RpcServerHandle { handle, addr })
}

/// The server-side implementation over shared daemon state.
struct RpcApi {
    state: Arc<RpcState>,
}

/// Record the outcome on the span and map failures onto the wire.
fn finish<T>(span: &ToolSpan, result: Result<T, ButlerError>) -> Result<T, ErrorObjectOwned> {
    match result {
        Ok(value) => {
            span.record_outcome(ToolOutcome::Ok);
            Ok(value)
        },
        Err(err) => {
            span.record_error(err.class);
            Err(to_error_object(&err))
        },
    }
}

#[jsonrpsee::core::async_trait]
impl ButlerRpcServer for RpcApi {
    async fn status(&self) -> Result<StatusResponse, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "status");
        finish(&span, Ok(self.state.status()))
    }

    async fn trigger(&self, params: TriggerParams) -> Result<SessionSummary, ErrorObjectOwned> {
        let span =
            ToolSpan::new(&self.state.butler_name, "trigger").with_trigger_source("trigger");
        let result = self.state.trigger(params).instrument(span.span().clone()).await;
        finish(&span, result)
    }

    async fn route_execute(
        &self,
        caller: String,
        envelope: RouteV1,
    ) -> Result<RouteResponseV1, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "route_execute")
            .with_trigger_source("trigger")
            .with_source_channel(&envelope.request_context.source_channel);
        let result = self
            .state
            .route_execute(&caller, envelope)
            .instrument(span.span().clone())
            .await;
        finish(&span, result)
    }

    async fn tick(&self) -> Result<TickSummary, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "tick").with_trigger_source("tick");
        let result = self.state.tick().instrument(span.span().clone()).await;
        finish(&span, result)
    }

    async fn notify(
        &self,
        caller: String,
        envelope: NotifyV1,
    ) -> Result<NotifyResponseV1, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "notify")
            .with_source_channel(&envelope.delivery.channel);
        let result = self
            .state
            .notify(&caller, envelope)
            .instrument(span.span().clone())
            .await;
        finish(&span, result)
    }

    async fn ingest(&self, envelope: IngestV1) -> Result<serde_json::Value, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "ingest")
            .with_trigger_source("external")
            .with_source_channel(&envelope.source.channel);
        let result = self.state.ingest(envelope).instrument(span.span().clone()).await;
        finish(&span, result)
    }

    async fn connector_heartbeat(&self, beacon: HeartbeatV1) -> Result<(), ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "connector_heartbeat");
        finish(&span, self.state.connector_heartbeat(beacon).await)
    }

    async fn registry_register(
        &self,
        record: serde_json::Value,
    ) -> Result<(), ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "registry_register");
        finish(&span, self.state.registry_register(record).await)
    }

    async fn registry_list(&self) -> Result<Vec<serde_json::Value>, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "registry_list");
        finish(&span, self.state.registry_list().await)
    }

    async fn tool_call(
        &self,
        tool_name: String,
        args: serde_json::Value,
    ) -> Result<ToolOutput, ErrorObjectOwned> {
        let span =
            ToolSpan::new(&self.state.butler_name, &tool_name).with_trigger_source("trigger");
        let result = self
            .state
            .tool_call(&tool_name, args)
            .instrument(span.span().clone())
            .await;
        if let Ok(ToolOutput::PendingApproval { .. }) = &result {
            span.record_outcome(ToolOutcome::PendingApproval);
        }
        finish(&span, result)
    }

    async fn state_get(
        &self,
        key: String,
    ) -> Result<Option<serde_json::Value>, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "state_get");
        finish(&span, self.state.state_get(&key).await)
    }

    async fn state_set(&self, params: StateSetParams) -> Result<(), ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "state_set");
        finish(&span, self.state.state_set(&params.key, params.value).await)
    }

    async fn state_delete(&self, key: String) -> Result<bool, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "state_delete");
        finish(&span, self.state.state_delete(&key).await)
    }

    async fn state_list(
        &self,
        prefix: Option<String>,
    ) -> Result<Vec<StateEntry>, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "state_list");
        finish(&span, self.state.state_list(prefix).await)
    }

    async fn schedule_create(
        &self,
        params: ScheduleCreateParams,
    ) -> Result<(), ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "schedule_create");
        finish(&span, self.state.schedule_create(params).await)
    }

    async fn schedule_list(&self) -> Result<Vec<ScheduledTask>, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "schedule_list");
        finish(&span, self.state.schedule_list().await)
    }

    async fn schedule_delete(&self, name: String) -> Result<(), ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "schedule_delete");
        finish(&span, self.state.schedule_delete(&name).await)
    }

    async fn schedule_run(&self, name: String) -> Result<String, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "schedule_run");
        let result = self
            .state
            .schedule_run(&name)
            .instrument(span.span().clone())
            .await;
        finish(&span, result)
    }

    async fn sessions_list(
        &self,
        filter: Option<serde_json::Value>,
    ) -> Result<Vec<SessionRecord>, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "sessions_list");
        let filter = filter.map(parse_filter).unwrap_or_default();
        finish(&span, self.state.sessions_list(filter).await)
    }

    async fn sessions_get(&self, id: SessionId) -> Result<SessionRecord, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "sessions_get");
        finish(&span, self.state.sessions_get(id).await)
    }

    async fn sessions_summary(
        &self,
        period: Option<String>,
    ) -> Result<UsageSummary, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "sessions_summary");
        let period = period.unwrap_or_else(|| "today".to_owned());
        finish(&span, self.state.sessions_summary(&period).await)
    }

    async fn sessions_daily(
        &self,
        from: chrono::NaiveDate,
        to: chrono::NaiveDate,
    ) -> Result<Vec<DailyUsage>, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "sessions_daily");
        finish(&span, self.state.sessions_daily(from, to).await)
    }

    async fn sessions_top(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<SessionRecord>, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "sessions_top");
        finish(&span, self.state.sessions_top(limit.unwrap_or(10)).await)
    }

    async fn schedule_costs(&self) -> Result<Vec<ScheduleCost>, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "schedule_costs");
        finish(&span, self.state.schedule_costs().await)
    }

    async fn approvals_pending(&self) -> Result<Vec<ApprovalRecord>, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "approvals_pending");
        finish(&span, self.state.approvals_pending().await)
    }

    async fn approvals_approve(
        &self,
        action_id: ActionId,
        actor: Actor,
    ) -> Result<ApprovalRecord, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "approvals_approve");
        let result = self
            .state
            .approvals_approve(action_id, actor)
            .instrument(span.span().clone())
            .await;
        finish(&span, result)
    }

    async fn approvals_reject(
        &self,
        action_id: ActionId,
        actor: Actor,
        reason: String,
    ) -> Result<ApprovalRecord, ErrorObjectOwned> {
        let span = ToolSpan::new(&self.state.butler_name, "approvals_reject");
        finish(&span, self.state.approvals_reject(action_id, actor, reason).await)
    }
}

fn parse_filter(value: serde_json::Value) -> SessionFilter {
    SessionFilter {
        trigger_source: value
            .get("trigger_source")
            .and_then(|v| v.as_str())
            .map(str::to_owned),
        since: value
            .get("since")
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
        success: value.get("success").and_then(serde_json::Value::as_bool),
        limit: value.get("limit").and_then(serde_json::Value::as_i64),
        offset: value.get("offset").and_then(serde_json::Value::as_i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_parses_partial_documents() {
        let filter = parse_filter(serde_json::json!({
            "trigger_source": "tick",
            "limit": 10,
        }));
        assert_eq!(filter.trigger_source.as_deref(), Some("tick"));
        assert_eq!(filter.limit, Some(10));
        assert!(filter.since.is_none());
        assert!(filter.success.is_none());
    }
}
