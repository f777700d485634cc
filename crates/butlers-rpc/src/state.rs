//! Shared handler state and the core tool implementations.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use butlers_approval::{Actor, ApprovalGate};
use butlers_core::{
    ActionId, ButlerError, NotifyResponseV1, NotifyV1, RequestContext, RouteResponseV1, RouteV1,
    SessionId, TriggerSource,
};
use butlers_module::ModuleRegistry;
use butlers_runtime::{SessionSummary, Spawner};
use butlers_scheduler::{Scheduler, TickDispatcher, TickSummary};
use butlers_storage::{SessionFilter, SessionLog, StateStore, SummaryPeriod};

use crate::client::ButlerClient;
use crate::types::{ScheduleCreateParams, StatusResponse, TriggerParams};

/// Supported route contract version range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteVersion {
    /// Lowest accepted version.
    pub min: u32,
    /// Highest accepted version.
    pub max: u32,
}

impl RouteVersion {
    /// Parse a `route.vN` schema tag into its version number.
    #[must_use]
    pub fn parse_tag(tag: &str) -> Option<u32> {
        tag.strip_prefix("route.v")?.parse().ok()
    }

    /// Whether a schema tag falls inside this range.
    #[must_use]
    pub fn accepts(&self, tag: &str) -> bool {
        Self::parse_tag(tag).is_some_and(|v| v >= self.min && v <= self.max)
    }
}

/// Plane-specific handling of routed envelopes and notify termination.
///
/// Switchboard and Messenger install overrides; plain butlers use the
/// default spawner path.
#[async_trait]
pub trait PlaneOverride: Send + Sync {
    /// Handle a validated routed envelope instead of the default
    /// spawner path. Return `None` to fall through.
    async fn handle_route(&self, envelope: &RouteV1) -> Option<RouteResponseV1>;

    /// Terminate a `notify.v1` locally (Switchboard forwards to
    /// Messenger; Messenger delivers). Return `None` to fall through
    /// to the default wrap-and-forward path.
    async fn handle_notify(&self, caller: &str, envelope: &NotifyV1) -> Option<NotifyResponseV1>;
}

/// The Switchboard-only RPC surface: canonical ingest, connector
/// heartbeats, and the butler registry. On any other butler these
/// methods reject with `validation_error`.
#[async_trait]
pub trait IngressPlane: Send + Sync {
    /// Accept one canonical ingest envelope.
    async fn ingest(
        &self,
        envelope: butlers_core::IngestV1,
    ) -> Result<serde_json::Value, ButlerError>;

    /// Record a connector heartbeat.
    async fn heartbeat(
        &self,
        beacon: butlers_core::HeartbeatV1,
    ) -> Result<(), ButlerError>;

    /// Idempotent butler advertisement upsert.
    async fn register(&self, record: serde_json::Value) -> Result<(), ButlerError>;

    /// List registered butlers.
    async fn registry_list(&self) -> Result<Vec<serde_json::Value>, ButlerError>;
}

/// Everything the RPC handlers need.
pub struct RpcState {
    /// Butler name.
    pub butler_name: String,
    /// Listener port.
    pub port: u16,
    /// Daemon start time.
    pub started_at: Instant,
    /// Callers allowed to invoke `route_execute`.
    pub trusted_route_callers: Vec<String>,
    /// Accepted route contract versions.
    pub contract: RouteVersion,
    /// The spawner.
    pub spawner: Arc<Spawner>,
    /// The scheduler.
    pub scheduler: Scheduler,
    /// Tick dispatch wiring.
    pub dispatcher: Arc<dyn TickDispatcher>,
    /// Per-butler state store.
    pub state: StateStore,
    /// Session log.
    pub sessions: SessionLog,
    /// Module registry.
    pub modules: Arc<ModuleRegistry>,
    /// Approval gate.
    pub gate: Arc<ApprovalGate>,
    /// Client bound to Switchboard, for the default notify path.
    pub switchboard: Option<ButlerClient>,
    /// Plane-specific override (Switchboard / Messenger).
    pub plane: Option<Arc<dyn PlaneOverride>>,
    /// Ingress termination (Switchboard only).
    pub ingress: Option<Arc<dyn IngressPlane>>,
}

impl std::fmt::Debug for RpcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcState")
            .field("butler_name", &self.butler_name)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl RpcState {
    /// `status` handler.
    #[must_use]
    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            name: self.butler_name.clone(),
            port: self.port,
            healthy: true,
            modules: self
                .modules
                .module_names()
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            uptime_s: self.started_at.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// `trigger` handler: one spawner session.
    ///
    /// # Errors
    ///
    /// Maps spawner failures onto the canonical classes; a held permit
    /// fails fast with `overload_rejected`.
    pub async fn trigger(&self, params: TriggerParams) -> Result<SessionSummary, ButlerError> {
        let prompt = match params.context {
            Some(context) => format!("{}\n\nContext:\n{context}", params.prompt),
            None => params.prompt,
        };
        self.spawner
            .invoke(TriggerSource::Trigger, &prompt, None)
            .await
            .map_err(|e| ButlerError::new(e.class(), e.to_string()))
    }

    /// `route_execute` handler.
    ///
    /// Caller trust and contract version are enforced before any side
    /// effect; a rejected call leaves no session row behind.
    ///
    /// # Errors
    ///
    /// Untrusted callers and bad envelopes yield `validation_error`.
    pub async fn route_execute(
        &self,
        caller: &str,
        envelope: RouteV1,
    ) -> Result<RouteResponseV1, ButlerError> {
        if !self.trusted_route_callers.iter().any(|c| c == caller) {
            return Err(ButlerError::validation(format!(
                "caller '{caller}' is not a trusted route caller"
            )));
        }
        if !self.contract.accepts(&envelope.schema_version) {
            return Err(ButlerError::validation(format!(
                "unsupported route contract '{}'; supported route.v{}..route.v{}",
                envelope.schema_version, self.contract.min, self.contract.max
            )));
        }
        if envelope.input.prompt.is_empty() && envelope.notify_request().is_none() {
            return Err(ButlerError::validation("empty prompt"));
        }

        if let Some(plane) = &self.plane {
            if let Some(response) = plane.handle_route(&envelope).await {
                return Ok(response);
            }
        }

        let started = Instant::now();
        let context = envelope.request_context.clone();
        let outcome = self
            .spawner
            .invoke(TriggerSource::Trigger, &envelope.input.prompt, Some(&context))
            .await;
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        Ok(match outcome {
            Ok(summary) if summary.success => RouteResponseV1::ok(
                context,
                serde_json::json!({
                    "session_id": summary.session_id,
                    "result": summary.result,
                }),
                duration_ms,
            ),
            Ok(summary) => RouteResponseV1::err(
                context,
                butlers_core::ErrorEnvelope::new(
                    butlers_core::ErrorClass::InternalError,
                    summary.error.unwrap_or_else(|| "session failed".to_owned()),
                ),
                duration_ms,
            ),
            Err(e) => RouteResponseV1::err(
                context,
                butlers_core::ErrorEnvelope::new(e.class(), e.to_string()),
                duration_ms,
            ),
        })
    }

    /// `tick` handler.
    ///
    /// # Errors
    ///
    /// Storage failures while selecting tasks.
    pub async fn tick(&self) -> Result<TickSummary, ButlerError> {
        self.scheduler
            .tick(self.dispatcher.as_ref())
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    /// `notify` handler.
    ///
    /// Plain butlers wrap the envelope as `route.v1` whose
    /// `input.context.notify_request` carries the payload and dispatch
    /// it to Switchboard. Switchboard and Messenger terminate via
    /// their plane override.
    ///
    /// # Errors
    ///
    /// Validation failures, or transport failures reaching Switchboard.
    pub async fn notify(
        &self,
        caller: &str,
        envelope: NotifyV1,
    ) -> Result<NotifyResponseV1, ButlerError> {
        if envelope.schema_version != butlers_core::envelope::NOTIFY_V1 {
            return Err(ButlerError::validation(format!(
                "unknown schema_version: {}",
                envelope.schema_version
            )));
        }
        if let Some(plane) = &self.plane {
            if let Some(response) = plane.handle_notify(caller, &envelope).await {
                return Ok(response);
            }
        }

        let Some(switchboard) = &self.switchboard else {
            return Err(ButlerError::unavailable("no switchboard configured"));
        };

        let context = envelope
            .request_context
            .clone()
            .unwrap_or_else(|| RequestContext::new("internal", self.butler_name.clone(), "system"));
        let route = RouteV1::new(context, "deliver notification")
            .with_context(serde_json::json!({
                "notify_request": serde_json::to_value(&envelope)
                    .map_err(|e| ButlerError::internal(e.to_string()))?,
            }))
            .with_source("internal", self.butler_name.clone(), "notify");

        let response = switchboard
            .route_execute(&self.butler_name, &route)
            .await
            .map_err(|err| ButlerClient::classify_failure(&err))?;
        match response.status {
            butlers_core::RouteStatus::Ok => {
                serde_json::from_value(response.result.unwrap_or_default())
                    .map_err(|err| ButlerError::internal(err.to_string()))
            },
            butlers_core::RouteStatus::Error => {
                let error = response
                    .error
                    .map_or_else(|| ButlerError::internal("unspecified routing failure"), |e| {
                        ButlerError::new(e.class, e.message)
                    });
                debug!(class = %error.class, "notify routing failed");
                Err(error)
            },
        }
    }

    /// `ingest` handler: canonical ingress, Switchboard only.
    ///
    /// # Errors
    ///
    /// Non-ingress butlers reject with `validation_error`.
    pub async fn ingest(
        &self,
        envelope: butlers_core::IngestV1,
    ) -> Result<serde_json::Value, ButlerError> {
        match &self.ingress {
            Some(ingress) => ingress.ingest(envelope).await,
            None => Err(ButlerError::validation(format!(
                "butler '{}' does not terminate ingest",
                self.butler_name
            ))),
        }
    }

    /// `connector_heartbeat` handler: Switchboard only.
    ///
    /// # Errors
    ///
    /// Non-ingress butlers reject with `validation_error`.
    pub async fn connector_heartbeat(
        &self,
        beacon: butlers_core::HeartbeatV1,
    ) -> Result<(), ButlerError> {
        match &self.ingress {
            Some(ingress) => ingress.heartbeat(beacon).await,
            None => Err(ButlerError::validation(format!(
                "butler '{}' does not terminate connector heartbeats",
                self.butler_name
            ))),
        }
    }

    /// `registry_register` handler: Switchboard only.
    ///
    /// # Errors
    ///
    /// Non-ingress butlers reject with `validation_error`.
    pub async fn registry_register(
        &self,
        record: serde_json::Value,
    ) -> Result<(), ButlerError> {
        match &self.ingress {
            Some(ingress) => ingress.register(record).await,
            None => Err(ButlerError::validation(format!(
                "butler '{}' does not own the registry",
                self.butler_name
            ))),
        }
    }

    /// `registry_list` handler: Switchboard only.
    ///
    /// # Errors
    ///
    /// Non-ingress butlers reject with `validation_error`.
    pub async fn registry_list(&self) -> Result<Vec<serde_json::Value>, ButlerError> {
        match &self.ingress {
            Some(ingress) => ingress.registry_list().await,
            None => Err(ButlerError::validation(format!(
                "butler '{}' does not own the registry",
                self.butler_name
            ))),
        }
    }

    /// `tool_call` handler: execute a registered module tool through
    /// the approval gate.
    ///
    /// Gated tools without a matching standing rule return a
    /// structured `pending_approval` output instead of executing.
    ///
    /// # Errors
    ///
    /// Unknown tools are `validation_error`; gate storage failures are
    /// `internal_error`.
    pub async fn tool_call(
        &self,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<butlers_module::ToolOutput, ButlerError> {
        let (descriptor, handler) = self
            .modules
            .tool(tool_name)
            .ok_or_else(|| ButlerError::validation(format!("unknown tool '{tool_name}'")))?;
        self.gate
            .invoke(descriptor, handler, args)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    // -- state tools -------------------------------------------------------

    /// `state_get` handler.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn state_get(&self, key: &str) -> Result<Option<serde_json::Value>, ButlerError> {
        self.state
            .get(key)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    /// `state_set` handler.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn state_set(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), ButlerError> {
        self.state
            .set(key, &value)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    /// `state_delete` handler.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn state_delete(&self, key: &str) -> Result<bool, ButlerError> {
        self.state
            .delete(key)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    /// `state_list` handler.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn state_list(
        &self,
        prefix: Option<String>,
    ) -> Result<Vec<butlers_storage::StateEntry>, ButlerError> {
        self.state
            .list(prefix.as_deref())
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    // -- schedule tools ----------------------------------------------------

    /// `schedule_create` handler.
    ///
    /// # Errors
    ///
    /// Bad cron expressions are `validation_error`.
    pub async fn schedule_create(&self, params: ScheduleCreateParams) -> Result<(), ButlerError> {
        self.scheduler
            .store()
            .create_runtime(&params.name, &params.cron, &params.prompt)
            .await
            .map_err(|e| match e {
                butlers_scheduler::SchedulerError::BadCron { .. } => {
                    ButlerError::validation(e.to_string())
                },
                other => ButlerError::internal(other.to_string()),
            })
    }

    /// `schedule_list` handler.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn schedule_list(
        &self,
    ) -> Result<Vec<butlers_scheduler::ScheduledTask>, ButlerError> {
        self.scheduler
            .store()
            .list()
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    /// `schedule_delete` handler.
    ///
    /// # Errors
    ///
    /// Unknown names are `validation_error`.
    pub async fn schedule_delete(&self, name: &str) -> Result<(), ButlerError> {
        let existed = self
            .scheduler
            .store()
            .delete(name)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))?;
        if existed {
            Ok(())
        } else {
            Err(ButlerError::validation(format!("unknown task '{name}'")))
        }
    }

    /// `schedule_run` handler: immediate out-of-band dispatch.
    ///
    /// # Errors
    ///
    /// Unknown names are `validation_error`.
    pub async fn schedule_run(&self, name: &str) -> Result<String, ButlerError> {
        let task = self
            .scheduler
            .store()
            .get(name)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))?
            .ok_or_else(|| ButlerError::validation(format!("unknown task '{name}'")))?;
        let result = match (&task.prompt, &task.job_name) {
            (Some(prompt), _) => {
                self.dispatcher
                    .dispatch_prompt(TriggerSource::Schedule(task.name.clone()), prompt)
                    .await
            },
            (None, Some(job)) => self.dispatcher.dispatch_job(job).await,
            (None, None) => Err("task has neither prompt nor job_name".to_owned()),
        };
        result.map_err(ButlerError::internal)
    }

    // -- session tools -----------------------------------------------------

    /// `sessions_list` handler.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn sessions_list(
        &self,
        filter: SessionFilter,
    ) -> Result<Vec<butlers_storage::SessionRecord>, ButlerError> {
        self.sessions
            .list(&filter)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    /// `sessions_get` handler.
    ///
    /// # Errors
    ///
    /// Unknown sessions are `validation_error`.
    pub async fn sessions_get(
        &self,
        id: SessionId,
    ) -> Result<butlers_storage::SessionRecord, ButlerError> {
        self.sessions
            .get(id)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))?
            .ok_or_else(|| ButlerError::validation(format!("unknown session {id}")))
    }

    /// `sessions_summary` handler.
    ///
    /// # Errors
    ///
    /// Unsupported periods are `validation_error`.
    pub async fn sessions_summary(
        &self,
        period: &str,
    ) -> Result<butlers_storage::UsageSummary, ButlerError> {
        let period =
            SummaryPeriod::parse(period).map_err(|e| ButlerError::validation(e.to_string()))?;
        self.sessions
            .summary(period)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    /// `sessions_daily` handler.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn sessions_daily(
        &self,
        from: chrono::NaiveDate,
        to: chrono::NaiveDate,
    ) -> Result<Vec<butlers_storage::DailyUsage>, ButlerError> {
        self.sessions
            .daily(from, to)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    /// `sessions_top` handler.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn sessions_top(
        &self,
        limit: i64,
    ) -> Result<Vec<butlers_storage::SessionRecord>, ButlerError> {
        self.sessions
            .top_sessions(limit)
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    /// `schedule_costs` handler.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn schedule_costs(
        &self,
    ) -> Result<Vec<butlers_storage::ScheduleCost>, ButlerError> {
        self.sessions
            .schedule_costs()
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    // -- approval tools ----------------------------------------------------

    /// `approvals_pending` handler.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn approvals_pending(
        &self,
    ) -> Result<Vec<butlers_approval::ApprovalRecord>, ButlerError> {
        self.gate
            .pending()
            .await
            .map_err(|e| ButlerError::internal(e.to_string()))
    }

    /// `approvals_approve` handler.
    ///
    /// # Errors
    ///
    /// Non-human actors are `validation_error`.
    pub async fn approvals_approve(
        &self,
        action_id: ActionId,
        actor: Actor,
    ) -> Result<butlers_approval::ApprovalRecord, ButlerError> {
        self.gate
            .approve(action_id, &actor)
            .await
            .map_err(approval_to_butler)
    }

    /// `approvals_reject` handler.
    ///
    /// # Errors
    ///
    /// Non-human actors are `validation_error`.
    pub async fn approvals_reject(
        &self,
        action_id: ActionId,
        actor: Actor,
        reason: String,
    ) -> Result<butlers_approval::ApprovalRecord, ButlerError> {
        self.gate
            .reject(action_id, &actor, &reason)
            .await
            .map_err(approval_to_butler)
    }
}

fn approval_to_butler(err: butlers_approval::ApprovalError) -> ButlerError {
    match err {
        butlers_approval::ApprovalError::NonHumanActor { .. }
        | butlers_approval::ApprovalError::UnknownAction(_)
        | butlers_approval::ApprovalError::UnknownRule(_) => {
            ButlerError::validation(err.to_string())
        },
        other => ButlerError::internal(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_version_parses_tags() {
        assert_eq!(RouteVersion::parse_tag("route.v1"), Some(1));
        assert_eq!(RouteVersion::parse_tag("route.v12"), Some(12));
        assert_eq!(RouteVersion::parse_tag("notify.v1"), None);
        assert_eq!(RouteVersion::parse_tag("route.vx"), None);
    }

    #[test]
    fn route_version_bounds_are_inclusive() {
        let range = RouteVersion { min: 1, max: 2 };
        assert!(range.accepts("route.v1"));
        assert!(range.accepts("route.v2"));
        assert!(!range.accepts("route.v3"));
        assert!(!range.accepts("route.v0"));
    }
}
