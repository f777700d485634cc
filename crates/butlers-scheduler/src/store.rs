//! The `scheduled_tasks` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use butlers_config::{ScheduleDispatch, ScheduleEntry};
use butlers_storage::Database;

use crate::cron_eval::next_fire;
use crate::error::SchedulerResult;

/// Where a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    /// Declared in the manifest; re-upserted at every startup.
    Config,
    /// Created at runtime via the schedule tools; preserved across
    /// restarts.
    Runtime,
}

impl TaskSource {
    /// Column form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Runtime => "runtime",
        }
    }
}

/// One scheduled task row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledTask {
    /// Unique name within the butler.
    pub name: String,
    /// Cron expression.
    pub cron: String,
    /// Prompt for session dispatch, `None` for job dispatch.
    pub prompt: Option<String>,
    /// Registered job name for job dispatch.
    pub job_name: Option<String>,
    /// Whether the task fires.
    pub enabled: bool,
    /// `config` or `runtime`.
    pub source: String,
    /// Last dispatch time.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Last dispatch result (truncated).
    pub last_result: Option<String>,
    /// Next due time; strictly monotonic per task after each tick.
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Store for scheduled tasks over one butler schema.
#[derive(Debug, Clone)]
pub struct TaskStore {
    db: Database,
    tz: chrono_tz::Tz,
}

impl TaskStore {
    /// Create a store; `tz` is the butler's cron evaluation timezone.
    #[must_use]
    pub fn new(db: Database, tz: chrono_tz::Tz) -> Self {
        Self { db, tz }
    }

    /// The cron evaluation timezone.
    #[must_use]
    pub fn timezone(&self) -> chrono_tz::Tz {
        self.tz
    }

    /// Upsert manifest schedules with `source=config`.
    ///
    /// Config entries own their row: cron, prompt, and enabled flag
    /// follow the manifest on every startup. Runtime-created tasks are
    /// untouched. Config rows whose manifest entry disappeared are
    /// removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error; a bad cron expression in the manifest
    /// was already rejected at config load.
    pub async fn sync_config_entries(&self, entries: &[ScheduleEntry]) -> SchedulerResult<()> {
        let now = Utc::now();
        for entry in entries {
            let (prompt, job_name) = match &entry.dispatch {
                ScheduleDispatch::Prompt { prompt } => (Some(prompt.clone()), None),
                ScheduleDispatch::Job { job_name, .. } => (None, Some(job_name.clone())),
            };
            let next = next_fire(&entry.cron, self.tz, now)?;
            sqlx::query(
                "INSERT INTO scheduled_tasks
                    (name, cron, prompt, job_name, enabled, source, next_run_at)
                 VALUES ($1, $2, $3, $4, $5, 'config', $6)
                 ON CONFLICT (name) DO UPDATE SET
                    cron = $2, prompt = $3, job_name = $4, enabled = $5,
                    source = 'config',
                    next_run_at = CASE
                        WHEN scheduled_tasks.cron = $2 THEN scheduled_tasks.next_run_at
                        ELSE $6
                    END,
                    updated_at = now()",
            )
            .bind(&entry.name)
            .bind(&entry.cron)
            .bind(&prompt)
            .bind(&job_name)
            .bind(entry.enabled)
            .bind(next)
            .execute(self.db.pool())
            .await
            .map_err(butlers_storage::StorageError::from)?;
        }

        let names: Vec<String> = entries.iter().map(|e| e.name.clone()).collect();
        sqlx::query(
            "DELETE FROM scheduled_tasks
             WHERE source = 'config' AND NOT (name = ANY($1))",
        )
        .bind(&names)
        .execute(self.db.pool())
        .await
        .map_err(butlers_storage::StorageError::from)?;
        Ok(())
    }

    /// Create a runtime task.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SchedulerError::BadCron`] for a bad expression,
    /// or a storage error on conflict.
    pub async fn create_runtime(
        &self,
        name: &str,
        cron: &str,
        prompt: &str,
    ) -> SchedulerResult<()> {
        let next = next_fire(cron, self.tz, Utc::now())?;
        sqlx::query(
            "INSERT INTO scheduled_tasks (name, cron, prompt, enabled, source, next_run_at)
             VALUES ($1, $2, $3, TRUE, 'runtime', $4)",
        )
        .bind(name)
        .bind(cron)
        .bind(prompt)
        .bind(next)
        .execute(self.db.pool())
        .await
        .map_err(butlers_storage::StorageError::from)?;
        Ok(())
    }

    /// Delete a task by name. Returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn delete(&self, name: &str) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE name = $1")
            .bind(name)
            .execute(self.db.pool())
            .await
            .map_err(butlers_storage::StorageError::from)?;
        Ok(result.rows_affected() > 0)
    }

    /// List all tasks ordered by next due time.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn list(&self) -> SchedulerResult<Vec<ScheduledTask>> {
        let tasks = sqlx::query_as::<_, ScheduledTask>(
            "SELECT name, cron, prompt, job_name, enabled, source,
                    last_run_at, last_result, next_run_at
             FROM scheduled_tasks
             ORDER BY next_run_at NULLS LAST, name",
        )
        .fetch_all(self.db.pool())
        .await
        .map_err(butlers_storage::StorageError::from)?;
        Ok(tasks)
    }

    /// Fetch one task.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn get(&self, name: &str) -> SchedulerResult<Option<ScheduledTask>> {
        let task = sqlx::query_as::<_, ScheduledTask>(
            "SELECT name, cron, prompt, job_name, enabled, source,
                    last_run_at, last_result, next_run_at
             FROM scheduled_tasks WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(self.db.pool())
        .await
        .map_err(butlers_storage::StorageError::from)?;
        Ok(task)
    }

    /// Tasks due at `now`, in `next_run_at` order.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn due(&self, now: DateTime<Utc>) -> SchedulerResult<Vec<ScheduledTask>> {
        let tasks = sqlx::query_as::<_, ScheduledTask>(
            "SELECT name, cron, prompt, job_name, enabled, source,
                    last_run_at, last_result, next_run_at
             FROM scheduled_tasks
             WHERE enabled AND next_run_at IS NOT NULL AND next_run_at <= $1
             ORDER BY next_run_at",
        )
        .bind(now)
        .fetch_all(self.db.pool())
        .await
        .map_err(butlers_storage::StorageError::from)?;
        Ok(tasks)
    }

    /// Claim a due task by advancing `next_run_at` from its observed
    /// value. Returns `false` when another tick claimed it first —
    /// this conditional update is what makes concurrent ticks dispatch
    /// a task at most once.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn claim(
        &self,
        name: &str,
        observed_next: DateTime<Utc>,
        advanced_next: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE scheduled_tasks
             SET next_run_at = $3, last_run_at = now(), updated_at = now()
             WHERE name = $1 AND next_run_at = $2",
        )
        .bind(name)
        .bind(observed_next)
        .bind(advanced_next)
        .execute(self.db.pool())
        .await
        .map_err(butlers_storage::StorageError::from)?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the dispatch result (truncated to a sane length).
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn record_result(&self, name: &str, result: &str) -> SchedulerResult<()> {
        let truncated: String = result.chars().take(2000).collect();
        sqlx::query(
            "UPDATE scheduled_tasks SET last_result = $2, updated_at = now() WHERE name = $1",
        )
        .bind(name)
        .bind(truncated)
        .execute(self.db.pool())
        .await
        .map_err(butlers_storage::StorageError::from)?;
        Ok(())
    }
}
