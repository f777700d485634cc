//! Persistence for pending actions and standing rules.

use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use butlers_core::ActionId;
use butlers_storage::{Database, StorageError};

use crate::error::{ApprovalError, ApprovalResult};
use crate::types::{ApprovalRecord, ApprovalStatus, StandingRule};

/// Store over the `approval_actions` and `approval_standing_rules`
/// tables.
#[derive(Debug, Clone)]
pub struct ApprovalStore {
    db: Database,
}

impl ApprovalStore {
    /// Create a store over the butler's database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new action row.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn insert_action(
        &self,
        tool_name: &str,
        args: &serde_json::Value,
        expires_at: DateTime<Utc>,
        status: ApprovalStatus,
        decided_by: Option<&str>,
    ) -> ApprovalResult<ActionId> {
        let id = ActionId::new();
        sqlx::query(
            "INSERT INTO approval_actions
                (action_id, tool_name, args, expires_at, status, decided_by, decided_at)
             VALUES ($1, $2, $3, $4, $5, $6,
                     CASE WHEN $6 IS NULL THEN NULL ELSE now() END)",
        )
        .bind(id.as_uuid())
        .bind(tool_name)
        .bind(args)
        .bind(expires_at)
        .bind(status.as_str())
        .bind(decided_by)
        .execute(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        Ok(id)
    }

    /// Fetch one action.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::UnknownAction`] when absent.
    pub async fn get_action(&self, action_id: ActionId) -> ApprovalResult<ApprovalRecord> {
        let row = sqlx::query(
            "SELECT action_id, tool_name, args, requested_at, expires_at,
                    status, decided_by, decided_at, result
             FROM approval_actions WHERE action_id = $1",
        )
        .bind(action_id.as_uuid())
        .fetch_optional(self.db.pool())
        .await
        .map_err(StorageError::from)?
        .ok_or_else(|| ApprovalError::UnknownAction(action_id.to_string()))?;
        record_from_row(&row)
    }

    /// Transition a pending action to a decision status. Returns the
    /// fresh record when the transition happened, or `None` when the
    /// action was not pending (idempotent callers re-read and return
    /// the stable terminal state).
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn decide(
        &self,
        action_id: ActionId,
        status: ApprovalStatus,
        decided_by: &str,
    ) -> ApprovalResult<Option<ApprovalRecord>> {
        let result = sqlx::query(
            "UPDATE approval_actions
             SET status = $2, decided_by = $3, decided_at = now()
             WHERE action_id = $1 AND status = 'pending'",
        )
        .bind(action_id.as_uuid())
        .bind(status.as_str())
        .bind(decided_by)
        .execute(self.db.pool())
        .await
        .map_err(StorageError::from)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(self.get_action(action_id).await?))
    }

    /// Mark an approved action as executed with its result.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn mark_executed(
        &self,
        action_id: ActionId,
        result: &serde_json::Value,
    ) -> ApprovalResult<()> {
        sqlx::query(
            "UPDATE approval_actions SET status = 'executed', result = $2
             WHERE action_id = $1",
        )
        .bind(action_id.as_uuid())
        .bind(result)
        .execute(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    /// List pending actions, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn list_pending(&self) -> ApprovalResult<Vec<ApprovalRecord>> {
        let rows = sqlx::query(
            "SELECT action_id, tool_name, args, requested_at, expires_at,
                    status, decided_by, decided_at, result
             FROM approval_actions WHERE status = 'pending'
             ORDER BY requested_at",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        rows.iter().map(record_from_row).collect()
    }

    /// Expire pending actions past their deadline. Expired rows are
    /// hard-deleted after being counted, per the retention policy.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn expire_overdue(&self) -> ApprovalResult<u64> {
        let marked = sqlx::query(
            "UPDATE approval_actions SET status = 'expired', decided_at = now()
             WHERE status = 'pending' AND expires_at <= now()",
        )
        .execute(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        sqlx::query(
            "DELETE FROM approval_actions
             WHERE status = 'expired' AND decided_at < now() - interval '30 days'",
        )
        .execute(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        Ok(marked.rows_affected())
    }

    // -- standing rules ----------------------------------------------------

    /// Insert a standing rule.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn insert_rule(&self, rule: &StandingRule) -> ApprovalResult<()> {
        sqlx::query(
            "INSERT INTO approval_standing_rules
                (rule_id, tool_name, arg_constraints, active, use_count,
                 use_limit, expires_at, owner)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(rule.rule_id)
        .bind(&rule.tool_name)
        .bind(serde_json::to_value(&rule.arg_constraints).unwrap_or_default())
        .bind(rule.active)
        .bind(rule.use_count)
        .bind(rule.use_limit)
        .bind(rule.expires_at)
        .bind(&rule.owner)
        .execute(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    /// Deactivate a rule. Returns whether it existed and was active.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn revoke_rule(&self, rule_id: Uuid) -> ApprovalResult<bool> {
        let result = sqlx::query(
            "UPDATE approval_standing_rules SET active = FALSE, updated_at = now()
             WHERE rule_id = $1 AND active",
        )
        .bind(rule_id)
        .execute(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        Ok(result.rows_affected() > 0)
    }

    /// Active rules for a tool, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn rules_for(&self, tool_name: &str) -> ApprovalResult<Vec<StandingRule>> {
        let rows = sqlx::query(
            "SELECT rule_id, tool_name, arg_constraints, active, use_count,
                    use_limit, expires_at, owner, created_at
             FROM approval_standing_rules
             WHERE tool_name = $1 AND active
             ORDER BY created_at",
        )
        .bind(tool_name)
        .fetch_all(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        rows.iter().map(rule_from_row).collect()
    }

    /// Consume one use of a rule.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn increment_rule_use(&self, rule_id: Uuid) -> ApprovalResult<()> {
        sqlx::query(
            "UPDATE approval_standing_rules
             SET use_count = use_count + 1, updated_at = now()
             WHERE rule_id = $1",
        )
        .bind(rule_id)
        .execute(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> ApprovalResult<ApprovalRecord> {
    let status_raw: String = row.try_get("status").map_err(StorageError::from)?;
    let status = ApprovalStatus::parse(&status_raw).ok_or_else(|| {
        ApprovalError::Storage(StorageError::Validation(format!(
            "unknown approval status '{status_raw}'"
        )))
    })?;
    Ok(ApprovalRecord {
        action_id: ActionId::from_uuid(row.try_get("action_id").map_err(StorageError::from)?),
        tool_name: row.try_get("tool_name").map_err(StorageError::from)?,
        args: row.try_get("args").map_err(StorageError::from)?,
        requested_at: row.try_get("requested_at").map_err(StorageError::from)?,
        expires_at: row.try_get("expires_at").map_err(StorageError::from)?,
        status,
        decided_by: row.try_get("decided_by").map_err(StorageError::from)?,
        decided_at: row.try_get("decided_at").map_err(StorageError::from)?,
        result: row.try_get("result").map_err(StorageError::from)?,
    })
}

fn rule_from_row(row: &sqlx::postgres::PgRow) -> ApprovalResult<StandingRule> {
    let constraints: serde_json::Value =
        row.try_get("arg_constraints").map_err(StorageError::from)?;
    Ok(StandingRule {
        rule_id: row.try_get("rule_id").map_err(StorageError::from)?,
        tool_name: row.try_get("tool_name").map_err(StorageError::from)?,
        arg_constraints: serde_json::from_value(constraints).unwrap_or_default(),
        active: row.try_get("active").map_err(StorageError::from)?,
        use_count: row.try_get("use_count").map_err(StorageError::from)?,
        use_limit: row.try_get("use_limit").map_err(StorageError::from)?,
        expires_at: row.try_get("expires_at").map_err(StorageError::from)?,
        owner: row.try_get("owner").map_err(StorageError::from)?,
        created_at: row.try_get("created_at").map_err(StorageError::from)?,
    })
}
