//! Persistence for memory artifacts.

use sqlx::Row;
use uuid::Uuid;

use butlers_storage::{Database, StorageError};

use crate::error::{MemoryError, MemoryResult};
use crate::types::{ConsolidationState, Fact, FactState, MemoryRule, RuleMaturity};

/// Default episode TTL in days.
const EPISODE_TTL_DAYS: i64 = 30;

/// Store over the memory tables of one butler schema.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    db: Database,
}

impl MemoryStore {
    /// Create a store over the butler's database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an episode in `pending` consolidation state.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::MissingTenant`] for an empty tenant.
    pub async fn append_episode(&self, tenant: &str, content: &str) -> MemoryResult<Uuid> {
        if tenant.is_empty() {
            return Err(MemoryError::MissingTenant);
        }
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO memory_episodes (id, tenant, content, expires_at)
             VALUES ($1, $2, $3, now() + make_interval(days => $4))",
        )
        .bind(id)
        .bind(tenant)
        .bind(content)
        .bind(i32::try_from(EPISODE_TTL_DAYS).unwrap_or(30))
        .execute(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        Ok(id)
    }

    /// Transition an episode's consolidation state, enforcing the state
    /// machine and bumping retry metadata on failure.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::IllegalTransition`] for a move the state
    /// machine forbids.
    pub async fn transition_episode(
        &self,
        id: Uuid,
        next: ConsolidationState,
        error: Option<&str>,
    ) -> MemoryResult<()> {
        let row = sqlx::query("SELECT consolidation_state FROM memory_episodes WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(StorageError::from)?
            .ok_or_else(|| {
                MemoryError::Storage(StorageError::NotFound(format!("episode {id}")))
            })?;
        let current_raw: String = row.try_get("consolidation_state").map_err(StorageError::from)?;
        let current = ConsolidationState::parse(&current_raw).ok_or_else(|| {
            MemoryError::Storage(StorageError::Validation(format!(
                "unknown consolidation state '{current_raw}'"
            )))
        })?;
        if !current.can_transition(next) {
            return Err(MemoryError::IllegalTransition {
                from: current.as_str().to_owned(),
                to: next.as_str().to_owned(),
            });
        }
        sqlx::query(
            "UPDATE memory_episodes
             SET consolidation_state = $2,
                 retry_count = retry_count + CASE WHEN $2 = 'failed' THEN 1 ELSE 0 END,
                 last_error = $3,
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(next.as_str())
        .bind(error)
        .execute(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    /// Upsert a fact. An existing active fact for the same
    /// `(tenant, scope, subject, predicate)` is superseded first, so
    /// the partial unique index never trips in normal operation.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::MissingTenant`] for an empty tenant.
    pub async fn upsert_fact(
        &self,
        tenant: &str,
        scope: &str,
        subject: &str,
        predicate: &str,
        content: &str,
        confidence: f64,
        importance: f64,
    ) -> MemoryResult<Uuid> {
        if tenant.is_empty() {
            return Err(MemoryError::MissingTenant);
        }
        let mut tx = self.db.pool().begin().await.map_err(StorageError::from)?;
        sqlx::query(
            "UPDATE memory_facts SET state = 'superseded', updated_at = now()
             WHERE tenant = $1 AND scope = $2 AND subject = $3 AND predicate = $4
               AND state = 'active'",
        )
        .bind(tenant)
        .bind(scope)
        .bind(subject)
        .bind(predicate)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;

        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO memory_facts
                (id, tenant, scope, subject, predicate, content, confidence, importance)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(id)
        .bind(tenant)
        .bind(scope)
        .bind(subject)
        .bind(predicate)
        .bind(content)
        .bind(confidence.clamp(0.0, 1.0))
        .bind(importance.clamp(0.0, 1.0))
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;
        tx.commit().await.map_err(StorageError::from)?;
        Ok(id)
    }

    /// Soft-delete a fact (state → `retracted`). Accepts the legacy
    /// alias state name transparently since callers never pass states.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::IllegalTransition`] when the fact is
    /// already terminal.
    pub async fn retract_fact(&self, id: Uuid) -> MemoryResult<()> {
        let row = sqlx::query("SELECT state FROM memory_facts WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(StorageError::from)?
            .ok_or_else(|| MemoryError::Storage(StorageError::NotFound(format!("fact {id}"))))?;
        let raw: String = row.try_get("state").map_err(StorageError::from)?;
        let current = FactState::parse(&raw).ok_or_else(|| {
            MemoryError::Storage(StorageError::Validation(format!("unknown fact state '{raw}'")))
        })?;
        if !current.can_transition(FactState::Retracted) {
            return Err(MemoryError::IllegalTransition {
                from: current.as_str().to_owned(),
                to: FactState::Retracted.as_str().to_owned(),
            });
        }
        sqlx::query(
            "UPDATE memory_facts SET state = 'retracted', updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        Ok(())
    }

    /// Retrievable facts visible to `caller_scope` (own scope plus
    /// `global`), active or fading.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn visible_facts(
        &self,
        tenant: &str,
        caller_scope: &str,
    ) -> MemoryResult<Vec<Fact>> {
        let rows = sqlx::query(
            "SELECT id, tenant, scope, subject, predicate, content, state,
                    confidence, decay_rate, importance, last_confirmed_at, created_at
             FROM memory_facts
             WHERE tenant = $1 AND scope IN ($2, 'global')
               AND state IN ('active', 'fading')
             ORDER BY created_at DESC
             LIMIT 500",
        )
        .bind(tenant)
        .bind(caller_scope)
        .fetch_all(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        rows.iter().map(fact_from_row).collect()
    }

    /// Retrievable rules visible to `caller_scope`.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn visible_rules(
        &self,
        tenant: &str,
        caller_scope: &str,
    ) -> MemoryResult<Vec<MemoryRule>> {
        let rows = sqlx::query(
            "SELECT id, tenant, scope, content, maturity, helpful_count,
                    harmful_count, created_at
             FROM memory_rules
             WHERE tenant = $1 AND scope IN ($2, 'global')
             ORDER BY created_at DESC
             LIMIT 200",
        )
        .bind(tenant)
        .bind(caller_scope)
        .fetch_all(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        rows.iter().map(rule_from_row).collect()
    }

    /// Recent unexpired episode texts, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn recent_episodes(&self, tenant: &str, limit: i64) -> MemoryResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT content FROM memory_episodes
             WHERE tenant = $1 AND expires_at > now()
             ORDER BY created_at DESC
             LIMIT $2",
        )
        .bind(tenant)
        .bind(limit.clamp(0, 50))
        .fetch_all(self.db.pool())
        .await
        .map_err(StorageError::from)?;
        Ok(rows.into_iter().map(|(content,)| content).collect())
    }

    /// Drop expired episodes. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn sweep_expired_episodes(&self) -> MemoryResult<u64> {
        let result = sqlx::query("DELETE FROM memory_episodes WHERE expires_at <= now()")
            .execute(self.db.pool())
            .await
            .map_err(StorageError::from)?;
        Ok(result.rows_affected())
    }

    /// Record rule evidence and refresh maturity.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn record_rule_evidence(&self, id: Uuid, helpful: bool) -> MemoryResult<()> {
        let row = sqlx::query(
            "UPDATE memory_rules
             SET helpful_count = helpful_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                 harmful_count = harmful_count + CASE WHEN $2 THEN 0 ELSE 1 END,
                 updated_at = now()
             WHERE id = $1
             RETURNING id, tenant, scope, content, maturity, helpful_count,
                       harmful_count, created_at",
        )
        .bind(id)
        .bind(helpful)
        .fetch_optional(self.db.pool())
        .await
        .map_err(StorageError::from)?
        .ok_or_else(|| MemoryError::Storage(StorageError::NotFound(format!("rule {id}"))))?;

        let rule = rule_from_row(&row)?;
        let assessed = rule.assess_maturity();
        if assessed != rule.maturity {
            sqlx::query("UPDATE memory_rules SET maturity = $2, updated_at = now() WHERE id = $1")
                .bind(id)
                .bind(assessed.as_str())
                .execute(self.db.pool())
                .await
                .map_err(StorageError::from)?;
        }
        Ok(())
    }
}

fn fact_from_row(row: &sqlx::postgres::PgRow) -> MemoryResult<Fact> {
    let state_raw: String = row.try_get("state").map_err(StorageError::from)?;
    let state = FactState::parse(&state_raw).ok_or_else(|| {
        MemoryError::Storage(StorageError::Validation(format!(
            "unknown fact state '{state_raw}'"
        )))
    })?;
    Ok(Fact {
        id: row.try_get("id").map_err(StorageError::from)?,
        tenant: row.try_get("tenant").map_err(StorageError::from)?,
        scope: row.try_get("scope").map_err(StorageError::from)?,
        subject: row.try_get("subject").map_err(StorageError::from)?,
        predicate: row.try_get("predicate").map_err(StorageError::from)?,
        content: row.try_get("content").map_err(StorageError::from)?,
        state,
        confidence: row.try_get("confidence").map_err(StorageError::from)?,
        decay_rate: row.try_get("decay_rate").map_err(StorageError::from)?,
        importance: row.try_get("importance").map_err(StorageError::from)?,
        last_confirmed_at: row.try_get("last_confirmed_at").map_err(StorageError::from)?,
        created_at: row.try_get("created_at").map_err(StorageError::from)?,
    })
}

fn rule_from_row(row: &sqlx::postgres::PgRow) -> MemoryResult<MemoryRule> {
    let maturity_raw: String = row.try_get("maturity").map_err(StorageError::from)?;
    let maturity = RuleMaturity::parse(&maturity_raw).ok_or_else(|| {
        MemoryError::Storage(StorageError::Validation(format!(
            "unknown rule maturity '{maturity_raw}'"
        )))
    })?;
    Ok(MemoryRule {
        id: row.try_get("id").map_err(StorageError::from)?,
        tenant: row.try_get("tenant").map_err(StorageError::from)?,
        scope: row.try_get("scope").map_err(StorageError::from)?,
        content: row.try_get("content").map_err(StorageError::from)?,
        maturity,
        helpful_count: row.try_get("helpful_count").map_err(StorageError::from)?,
        harmful_count: row.try_get("harmful_count").map_err(StorageError::from)?,
        created_at: row.try_get("created_at").map_err(StorageError::from)?,
    })
}
