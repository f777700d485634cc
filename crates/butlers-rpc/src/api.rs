//! JSON-RPC API definition for butler ↔ butler communication.
//!
//! Uses jsonrpsee proc macros to define the RPC interface. Every
//! butler daemon implements the server side; [`crate::ButlerClient`]
//! wraps the generated client side. No namespace prefix: wire method
//! names match the core tool surface (`status`, `trigger`,
//! `route_execute`, ...) so the routing log and spans name the same
//! thing the wire does.

use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;

use butlers_approval::{Actor, ApprovalRecord};
use butlers_core::{
    ActionId, HeartbeatV1, IngestV1, NotifyResponseV1, NotifyV1, RouteResponseV1, RouteV1,
    SessionId,
};
use butlers_module::ToolOutput;
use butlers_runtime::SessionSummary;
use butlers_scheduler::{ScheduledTask, TickSummary};
use butlers_storage::{DailyUsage, ScheduleCost, SessionRecord, StateEntry, UsageSummary};

use crate::types::{ScheduleCreateParams, StateSetParams, StatusResponse, TriggerParams};

/// The per-butler RPC surface.
///
/// Implemented by every daemon (server side); called by peers,
/// connectors, and the CLI (client side). Switchboard-only methods
/// (`ingest`, `connector_heartbeat`, `registry_*`) reject with
/// `validation_error` everywhere else.
#[rpc(server, client)]
pub trait ButlerRpc {
    /// Identity, health, modules, and uptime.
    #[method(name = "status")]
    async fn status(&self) -> Result<StatusResponse, ErrorObjectOwned>;

    /// Run one spawner session.
    #[method(name = "trigger")]
    async fn trigger(&self, params: TriggerParams) -> Result<SessionSummary, ErrorObjectOwned>;

    /// Routed execution entrypoint. Caller trust and contract version
    /// are enforced before any side effect.
    #[method(name = "route_execute")]
    async fn route_execute(
        &self,
        caller: String,
        envelope: RouteV1,
    ) -> Result<RouteResponseV1, ErrorObjectOwned>;

    /// Drive the scheduler tick.
    #[method(name = "tick")]
    async fn tick(&self) -> Result<TickSummary, ErrorObjectOwned>;

    /// Submit an outbound notification.
    #[method(name = "notify")]
    async fn notify(
        &self,
        caller: String,
        envelope: NotifyV1,
    ) -> Result<NotifyResponseV1, ErrorObjectOwned>;

    /// Canonical ingest (Switchboard only).
    #[method(name = "ingest")]
    async fn ingest(&self, envelope: IngestV1) -> Result<serde_json::Value, ErrorObjectOwned>;

    /// Connector liveness beacon (Switchboard only).
    #[method(name = "connector_heartbeat")]
    async fn connector_heartbeat(&self, beacon: HeartbeatV1) -> Result<(), ErrorObjectOwned>;

    /// Idempotent registry advertisement (Switchboard only).
    #[method(name = "registry_register")]
    async fn registry_register(
        &self,
        record: serde_json::Value,
    ) -> Result<(), ErrorObjectOwned>;

    /// List registered butlers (Switchboard only).
    #[method(name = "registry_list")]
    async fn registry_list(&self) -> Result<Vec<serde_json::Value>, ErrorObjectOwned>;

    /// Execute a registered module tool through the approval gate.
    #[method(name = "tool_call")]
    async fn tool_call(
        &self,
        tool_name: String,
        args: serde_json::Value,
    ) -> Result<ToolOutput, ErrorObjectOwned>;

    /// Fetch a state value.
    #[method(name = "state_get")]
    async fn state_get(
        &self,
        key: String,
    ) -> Result<Option<serde_json::Value>, ErrorObjectOwned>;

    /// Set a state value (last write wins).
    #[method(name = "state_set")]
    async fn state_set(&self, params: StateSetParams) -> Result<(), ErrorObjectOwned>;

    /// Delete a state key. Returns whether a row existed.
    #[method(name = "state_delete")]
    async fn state_delete(&self, key: String) -> Result<bool, ErrorObjectOwned>;

    /// List state entries, optionally by key prefix.
    #[method(name = "state_list")]
    async fn state_list(
        &self,
        prefix: Option<String>,
    ) -> Result<Vec<StateEntry>, ErrorObjectOwned>;

    /// Create a runtime scheduled task.
    #[method(name = "schedule_create")]
    async fn schedule_create(
        &self,
        params: ScheduleCreateParams,
    ) -> Result<(), ErrorObjectOwned>;

    /// List scheduled tasks.
    #[method(name = "schedule_list")]
    async fn schedule_list(&self) -> Result<Vec<ScheduledTask>, ErrorObjectOwned>;

    /// Delete a scheduled task.
    #[method(name = "schedule_delete")]
    async fn schedule_delete(&self, name: String) -> Result<(), ErrorObjectOwned>;

    /// Dispatch a task immediately, out of band.
    #[method(name = "schedule_run")]
    async fn schedule_run(&self, name: String) -> Result<String, ErrorObjectOwned>;

    /// List sessions, newest first. The filter document accepts
    /// `trigger_source`, `since`, `success`, `limit`, and `offset`.
    #[method(name = "sessions_list")]
    async fn sessions_list(
        &self,
        filter: Option<serde_json::Value>,
    ) -> Result<Vec<SessionRecord>, ErrorObjectOwned>;

    /// Fetch one session.
    #[method(name = "sessions_get")]
    async fn sessions_get(&self, id: SessionId) -> Result<SessionRecord, ErrorObjectOwned>;

    /// Aggregate usage for a period (`today|week|month|all`).
    #[method(name = "sessions_summary")]
    async fn sessions_summary(
        &self,
        period: Option<String>,
    ) -> Result<UsageSummary, ErrorObjectOwned>;

    /// Per-day usage for an inclusive date range.
    #[method(name = "sessions_daily")]
    async fn sessions_daily(
        &self,
        from: chrono::NaiveDate,
        to: chrono::NaiveDate,
    ) -> Result<Vec<DailyUsage>, ErrorObjectOwned>;

    /// The most expensive sessions by token volume.
    #[method(name = "sessions_top")]
    async fn sessions_top(
        &self,
        limit: Option<i64>,
    ) -> Result<Vec<SessionRecord>, ErrorObjectOwned>;

    /// Cost attribution per schedule.
    #[method(name = "schedule_costs")]
    async fn schedule_costs(&self) -> Result<Vec<ScheduleCost>, ErrorObjectOwned>;

    /// Pending approval actions.
    #[method(name = "approvals_pending")]
    async fn approvals_pending(&self) -> Result<Vec<ApprovalRecord>, ErrorObjectOwned>;

    /// Approve a pending action as a human actor and execute it once.
    #[method(name = "approvals_approve")]
    async fn approvals_approve(
        &self,
        action_id: ActionId,
        actor: Actor,
    ) -> Result<ApprovalRecord, ErrorObjectOwned>;

    /// Reject a pending action as a human actor.
    #[method(name = "approvals_reject")]
    async fn approvals_reject(
        &self,
        action_id: ActionId,
        actor: Actor,
        reason: String,
    ) -> Result<ApprovalRecord, ErrorObjectOwned>;
}
