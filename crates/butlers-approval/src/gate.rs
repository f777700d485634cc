//! The approval gate.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;

use butlers_core::ActionId;
use butlers_module::{ApprovalDefault, ToolDescriptor, ToolHandler, ToolOutput, ToolScope};

use crate::error::{ApprovalError, ApprovalResult};
use crate::rules::rule_matches;
use crate::store::ApprovalStore;
use crate::types::{Actor, ActorKind, ApprovalRecord, ApprovalStatus, StandingRule};

/// Default pending-action expiry when the config does not set one.
const DEFAULT_EXPIRY_S: u64 = 24 * 60 * 60;

/// Which tools are gated, derived from config plus the identity-default
/// rule: user-scoped send/reply/react tools are always gated; bot-scoped
/// tools are gated only when opted in.
#[derive(Debug, Clone, Default)]
pub struct GatePolicy {
    /// Config-gated tool names with their pending expiry (seconds).
    gated: BTreeMap<String, u64>,
}

impl GatePolicy {
    /// Build from config `(tool, expiry_s)` pairs.
    #[must_use]
    pub fn new(gated_tools: impl IntoIterator<Item = (String, Option<u64>)>) -> Self {
        Self {
            gated: gated_tools
                .into_iter()
                .map(|(tool, expiry)| (tool, expiry.unwrap_or(DEFAULT_EXPIRY_S)))
                .collect(),
        }
    }

    /// Whether a tool is gated.
    #[must_use]
    pub fn is_gated(&self, descriptor: &ToolDescriptor) -> bool {
        if self.gated.contains_key(&descriptor.name) {
            return true;
        }
        match descriptor.approval_default {
            ApprovalDefault::Always => true,
            ApprovalDefault::None | ApprovalDefault::Conditional => {
                // Identity default: user-scoped channel egress is always
                // human-gated regardless of module opinion.
                descriptor.scope == Some(ToolScope::User)
                    && butlers_module::is_channel_egress_tool(&descriptor.name)
            },
        }
    }

    /// Pending expiry for a tool, in seconds.
    #[must_use]
    pub fn expiry_s(&self, tool_name: &str) -> u64 {
        self.gated.get(tool_name).copied().unwrap_or(DEFAULT_EXPIRY_S)
    }
}

/// The approval gate for one butler.
pub struct ApprovalGate {
    store: ApprovalStore,
    policy: GatePolicy,
    executors: RwLock<BTreeMap<String, Arc<dyn ToolHandler>>>,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ApprovalGate {
    /// Create a gate.
    #[must_use]
    pub fn new(store: ApprovalStore, policy: GatePolicy) -> Self {
        Self {
            store,
            policy,
            executors: RwLock::new(BTreeMap::new()),
        }
    }

    /// The gate policy.
    #[must_use]
    pub fn policy(&self) -> &GatePolicy {
        &self.policy
    }

    /// Register the executor for a gated tool. The same executor serves
    /// auto-approved and human-approved actions.
    pub async fn register_executor(&self, tool_name: &str, handler: Arc<dyn ToolHandler>) {
        self.executors
            .write()
            .await
            .insert(tool_name.to_owned(), handler);
    }

    /// Invoke a tool through the gate.
    ///
    /// Ungated tools pass straight through. For a gated tool, standing
    /// rules are checked in insertion order; a match pre-approves and
    /// executes, anything else parks a pending action and returns
    /// `pending_approval` without touching the underlying tool.
    ///
    /// # Errors
    ///
    /// Returns storage failures; the gated tool's own failures surface
    /// inside the returned [`ToolOutput`].
    pub async fn invoke(
        &self,
        descriptor: &ToolDescriptor,
        handler: &Arc<dyn ToolHandler>,
        args: serde_json::Value,
    ) -> ApprovalResult<ToolOutput> {
        if !self.policy.is_gated(descriptor) {
            return Ok(handler.call(args).await);
        }

        let now = Utc::now();
        let rules = self.store.rules_for(&descriptor.name).await?;
        if let Some(rule) = rules
            .iter()
            .find(|rule| rule_matches(rule, &descriptor.name, &args, now))
        {
            self.store.increment_rule_use(rule.rule_id).await?;
            let expires =
                now + chrono::Duration::seconds(i64::try_from(
                    self.policy.expiry_s(&descriptor.name),
                )
                .unwrap_or(i64::MAX));
            let action_id = self
                .store
                .insert_action(
                    &descriptor.name,
                    &args,
                    expires,
                    ApprovalStatus::Approved,
                    Some(&format!("rule:{}", rule.rule_id)),
                )
                .await?;
            info!(tool = %descriptor.name, rule = %rule.rule_id, "pre-approved by standing rule");
            return self.execute(action_id, &descriptor.name, args).await;
        }

        let expires = now
            + chrono::Duration::seconds(
                i64::try_from(self.policy.expiry_s(&descriptor.name)).unwrap_or(i64::MAX),
            );
        let action_id = self
            .store
            .insert_action(
                &descriptor.name,
                &args,
                expires,
                ApprovalStatus::Pending,
                None,
            )
            .await?;
        info!(tool = %descriptor.name, action = %action_id, "parked pending approval");
        Ok(ToolOutput::PendingApproval { action_id })
    }

    /// Approve a pending action as `actor` and execute it exactly once.
    ///
    /// Approving a non-pending action is a no-op returning the stable
    /// terminal record.
    ///
    /// # Errors
    ///
    /// Rejects non-human actors with [`ApprovalError::NonHumanActor`]
    /// before any state is touched.
    pub async fn approve(
        &self,
        action_id: ActionId,
        actor: &Actor,
    ) -> ApprovalResult<ApprovalRecord> {
        require_human(actor)?;

        let Some(record) = self
            .store
            .decide(action_id, ApprovalStatus::Approved, &actor.id)
            .await?
        else {
            // Already decided: return the stable terminal state.
            return self.store.get_action(action_id).await;
        };

        self.execute(action_id, &record.tool_name, record.args.clone())
            .await?;
        self.store.get_action(action_id).await
    }

    /// Reject a pending action as `actor`. Idempotent like
    /// [`approve`](Self::approve).
    ///
    /// # Errors
    ///
    /// Rejects non-human actors before any state is touched.
    pub async fn reject(
        &self,
        action_id: ActionId,
        actor: &Actor,
        reason: &str,
    ) -> ApprovalResult<ApprovalRecord> {
        require_human(actor)?;

        match self
            .store
            .decide(action_id, ApprovalStatus::Rejected, &actor.id)
            .await?
        {
            Some(record) => {
                info!(action = %action_id, by = %actor.id, reason, "action rejected");
                Ok(record)
            },
            None => self.store.get_action(action_id).await,
        }
    }

    /// Declare a standing rule.
    ///
    /// # Errors
    ///
    /// Rejects non-human actors.
    pub async fn create_rule(&self, rule: StandingRule, actor: &Actor) -> ApprovalResult<()> {
        require_human(actor)?;
        self.store.insert_rule(&rule).await
    }

    /// Revoke a standing rule.
    ///
    /// # Errors
    ///
    /// Rejects non-human actors; unknown rules yield
    /// [`ApprovalError::UnknownRule`].
    pub async fn revoke_rule(&self, rule_id: uuid::Uuid, actor: &Actor) -> ApprovalResult<()> {
        require_human(actor)?;
        if self.store.revoke_rule(rule_id).await? {
            Ok(())
        } else {
            Err(ApprovalError::UnknownRule(rule_id.to_string()))
        }
    }

    /// Pending actions awaiting a decision.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn pending(&self) -> ApprovalResult<Vec<ApprovalRecord>> {
        self.store.list_pending().await
    }

    /// The shared executor path for approved actions.
    async fn execute(
        &self,
        action_id: ActionId,
        tool_name: &str,
        args: serde_json::Value,
    ) -> ApprovalResult<ToolOutput> {
        let handler = {
            let executors = self.executors.read().await;
            executors
                .get(tool_name)
                .cloned()
                .ok_or_else(|| ApprovalError::NoExecutor(tool_name.to_owned()))?
        };
        let output = handler.call(args).await;
        let result = serde_json::to_value(&output).unwrap_or_default();
        self.store.mark_executed(action_id, &result).await?;
        Ok(output)
    }
}

fn require_human(actor: &Actor) -> ApprovalResult<()> {
    match actor.kind {
        ActorKind::Human => Ok(()),
        ActorKind::Machine => Err(ApprovalError::NonHumanActor {
            actor: actor.id.clone(),
            actor_kind: "machine".to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, scope: Option<ToolScope>, default: ApprovalDefault) -> ToolDescriptor {
        let mut d = ToolDescriptor::new(name, "test");
        d.scope = scope;
        d.approval_default = default;
        d
    }

    // -----------------------------------------------------------------------
    // Policy
    // -----------------------------------------------------------------------

    #[test]
    fn config_gated_tools_are_gated() {
        let policy = GatePolicy::new([("calendar_create_event".to_owned(), Some(600))]);
        let d = descriptor("calendar_create_event", None, ApprovalDefault::None);
        assert!(policy.is_gated(&d));
        assert_eq!(policy.expiry_s("calendar_create_event"), 600);
    }

    #[test]
    fn user_scoped_send_is_always_gated() {
        let policy = GatePolicy::default();
        let d = descriptor(
            "user_telegram_send_message",
            Some(ToolScope::User),
            ApprovalDefault::None,
        );
        assert!(policy.is_gated(&d));
    }

    #[test]
    fn bot_scoped_send_is_gated_only_by_opt_in() {
        let policy = GatePolicy::default();
        let bot = descriptor(
            "bot_telegram_send_message",
            Some(ToolScope::Bot),
            ApprovalDefault::None,
        );
        assert!(!policy.is_gated(&bot));

        let opted = GatePolicy::new([("bot_telegram_send_message".to_owned(), None)]);
        assert!(opted.is_gated(&bot));
    }

    #[test]
    fn approval_default_always_gates() {
        let policy = GatePolicy::default();
        let d = descriptor("calendar_delete_event", None, ApprovalDefault::Always);
        assert!(policy.is_gated(&d));
    }

    #[test]
    fn plain_tools_are_not_gated() {
        let policy = GatePolicy::default();
        let d = descriptor("memory_store", None, ApprovalDefault::None);
        assert!(!policy.is_gated(&d));
    }

    // -----------------------------------------------------------------------
    // Actor checks (before any storage access)
    // -----------------------------------------------------------------------

    fn gate() -> ApprovalGate {
        let db = butlers_storage::Database::connect_lazy(
            "postgres://localhost/butlers",
            "test_approval",
        )
        .unwrap();
        ApprovalGate::new(ApprovalStore::new(db), GatePolicy::default())
    }

    #[tokio::test]
    async fn machine_actor_cannot_approve() {
        let gate = gate();
        let err = gate
            .approve(ActionId::new(), &Actor::machine("switchboard"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NonHumanActor { .. }));
    }

    #[tokio::test]
    async fn machine_actor_cannot_reject_or_manage_rules() {
        let gate = gate();
        let machine = Actor::machine("scheduler");
        assert!(matches!(
            gate.reject(ActionId::new(), &machine, "nope").await.unwrap_err(),
            ApprovalError::NonHumanActor { .. }
        ));
        assert!(matches!(
            gate.revoke_rule(uuid::Uuid::new_v4(), &machine).await.unwrap_err(),
            ApprovalError::NonHumanActor { .. }
        ));
    }
}
