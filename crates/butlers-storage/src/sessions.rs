//! Durable session log.
//!
//! Every spawner invocation is one row: created in an open state before
//! the LLM runs, completed with terminal fields afterwards. Cost is
//! derived at query time from the pricing table; it is never persisted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use butlers_core::{RequestId, SessionId, SubrequestId, TriggerSource};

use crate::db::Database;
use crate::error::{StorageError, StorageResult};

/// Immutable fields written when a session opens.
#[derive(Debug, Clone)]
pub struct OpenSession {
    /// What caused the session.
    pub trigger_source: TriggerSource,
    /// Prompt text.
    pub prompt: String,
    /// Model name.
    pub model: String,
    /// Parent session for nested invocations.
    pub parent_session_id: Option<SessionId>,
    /// Routed request lineage.
    pub request_id: Option<RequestId>,
    /// Routed subrequest lineage.
    pub subrequest_id: Option<SubrequestId>,
    /// Classification segment lineage.
    pub segment_id: Option<String>,
}

/// Terminal fields written when a session completes.
#[derive(Debug, Clone)]
pub struct SessionTerminal {
    /// Whether the invocation succeeded.
    pub success: bool,
    /// Final output on success.
    pub result: Option<String>,
    /// Failure description.
    pub error: Option<String>,
    /// Number of tool calls the runtime made.
    pub tool_calls: i64,
    /// Input token usage.
    pub input_tokens: i64,
    /// Output token usage.
    pub output_tokens: i64,
    /// Wall-clock duration, measured from before the row was created.
    pub duration_ms: i64,
    /// Trace correlation id.
    pub trace_id: Option<String>,
}

/// A full session row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionRecord {
    /// Session id.
    pub id: uuid::Uuid,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Trigger provenance in wire form.
    pub trigger_source: String,
    /// Prompt text.
    pub prompt: String,
    /// Model name.
    pub model: String,
    /// Parent session.
    pub parent_session_id: Option<uuid::Uuid>,
    /// Routed request lineage.
    pub request_id: Option<uuid::Uuid>,
    /// Routed subrequest lineage.
    pub subrequest_id: Option<uuid::Uuid>,
    /// Classification segment lineage.
    pub segment_id: Option<String>,
    /// Completion time; `None` while open.
    pub completed_at: Option<DateTime<Utc>>,
    /// Success flag; `None` while open.
    pub success: Option<bool>,
    /// Final output.
    pub result: Option<String>,
    /// Failure description.
    pub error: Option<String>,
    /// Tool call count.
    pub tool_calls: i64,
    /// Input token usage.
    pub input_tokens: i64,
    /// Output token usage.
    pub output_tokens: i64,
    /// Wall-clock duration.
    pub duration_ms: Option<i64>,
    /// Trace correlation id.
    pub trace_id: Option<String>,
}

/// Filter for [`SessionLog::list`].
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    /// Restrict to one trigger source (wire form).
    pub trigger_source: Option<String>,
    /// Restrict to sessions started at/after this time.
    pub since: Option<DateTime<Utc>>,
    /// Restrict to success/failure.
    pub success: Option<bool>,
    /// Page size (default 50, capped at 500).
    pub limit: Option<i64>,
    /// Page offset.
    pub offset: Option<i64>,
}

/// Summary period for [`SessionLog::summary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryPeriod {
    /// Since local midnight UTC.
    Today,
    /// Last 7 days.
    Week,
    /// Last 30 days.
    Month,
    /// Everything.
    All,
}

impl SummaryPeriod {
    /// Parse a period name.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Validation`] for unsupported periods.
    pub fn parse(s: &str) -> StorageResult<Self> {
        match s {
            "today" => Ok(Self::Today),
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "all" => Ok(Self::All),
            other => Err(StorageError::Validation(format!(
                "unsupported summary period '{other}'; expected today, week, month, or all"
            ))),
        }
    }

    /// Lower bound for the period, `None` for [`Self::All`].
    #[must_use]
    pub fn since(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Today => Some(
                now.date_naive()
                    .and_hms_opt(0, 0, 0)
                    .unwrap_or_default()
                    .and_utc(),
            ),
            Self::Week => Some(now - chrono::Duration::days(7)),
            Self::Month => Some(now - chrono::Duration::days(30)),
            Self::All => None,
        }
    }
}

/// Per-model token pricing, USD per million tokens.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    prices: BTreeMap<String, (f64, f64)>,
}

impl PricingTable {
    /// Build from `(model, input_per_million, output_per_million)`
    /// entries.
    #[must_use]
    pub fn new(entries: impl IntoIterator<Item = (String, f64, f64)>) -> Self {
        Self {
            prices: entries
                .into_iter()
                .map(|(model, input, output)| (model, (input, output)))
                .collect(),
        }
    }

    /// Derive the cost of one session. Unknown models cost zero.
    #[must_use]
    pub fn cost_usd(&self, model: &str, input_tokens: i64, output_tokens: i64) -> f64 {
        let Some((input_price, output_price)) = self.prices.get(model) else {
            return 0.0;
        };
        let input = input_tokens.max(0) as f64 / 1_000_000.0 * input_price;
        let output = output_tokens.max(0) as f64 / 1_000_000.0 * output_price;
        input + output
    }

    /// Whether pricing is known for a model.
    #[must_use]
    pub fn knows(&self, model: &str) -> bool {
        self.prices.contains_key(model)
    }
}

/// Aggregate usage for a period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    /// Total sessions in the period.
    pub sessions: i64,
    /// Sessions that succeeded.
    pub succeeded: i64,
    /// Sessions that failed.
    pub failed: i64,
    /// Sessions still open.
    pub open: i64,
    /// Summed input tokens.
    pub input_tokens: i64,
    /// Summed output tokens.
    pub output_tokens: i64,
    /// Derived cost.
    pub cost_usd: f64,
    /// Models seen that the pricing table does not know.
    pub unpriced_models: Vec<String>,
}

/// One day of usage for [`SessionLog::daily`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyUsage {
    /// The day (UTC).
    pub day: chrono::NaiveDate,
    /// Sessions that day.
    pub sessions: i64,
    /// Summed input tokens.
    pub input_tokens: i64,
    /// Summed output tokens.
    pub output_tokens: i64,
    /// Derived cost.
    pub cost_usd: f64,
}

/// Per-schedule cost aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleCost {
    /// The schedule name (from `schedule:<name>` trigger sources).
    pub schedule: String,
    /// Sessions dispatched by this schedule.
    pub sessions: i64,
    /// Derived cost.
    pub cost_usd: f64,
}

/// The session log over one butler schema.
#[derive(Debug, Clone)]
pub struct SessionLog {
    db: Database,
    pricing: PricingTable,
}

impl SessionLog {
    /// Create a log over the butler's database.
    #[must_use]
    pub fn new(db: Database, pricing: PricingTable) -> Self {
        Self { db, pricing }
    }

    /// Open a session row. Returns the new session id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn create(&self, open: &OpenSession) -> StorageResult<SessionId> {
        let id = SessionId::new();
        sqlx::query(
            "INSERT INTO sessions
                (id, started_at, trigger_source, prompt, model,
                 parent_session_id, request_id, subrequest_id, segment_id)
             VALUES ($1, now(), $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(id.as_uuid())
        .bind(open.trigger_source.to_wire())
        .bind(&open.prompt)
        .bind(&open.model)
        .bind(open.parent_session_id.map(|s| s.as_uuid()))
        .bind(open.request_id.map(|r| r.as_uuid()))
        .bind(open.subrequest_id.map(|s| s.as_uuid()))
        .bind(&open.segment_id)
        .execute(self.db.pool())
        .await?;
        Ok(id)
    }

    /// Write terminal fields. Completing an already-complete session is
    /// an error (the row is immutable once terminal).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] when the session does not
    /// exist or is already terminal.
    pub async fn complete(&self, id: SessionId, terminal: &SessionTerminal) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE sessions SET
                completed_at = now(), success = $2, result = $3, error = $4,
                tool_calls = $5, input_tokens = $6, output_tokens = $7,
                duration_ms = $8, trace_id = $9
             WHERE id = $1 AND completed_at IS NULL",
        )
        .bind(id.as_uuid())
        .bind(terminal.success)
        .bind(&terminal.result)
        .bind(&terminal.error)
        .bind(terminal.tool_calls)
        .bind(terminal.input_tokens)
        .bind(terminal.output_tokens)
        .bind(terminal.duration_ms)
        .bind(&terminal.trace_id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!(
                "open session {id} not found"
            )));
        }
        Ok(())
    }

    /// Fetch one session.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn get(&self, id: SessionId) -> StorageResult<Option<SessionRecord>> {
        let record = sqlx::query_as::<_, SessionRecord>(
            "SELECT * FROM sessions WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(self.db.pool())
        .await?;
        Ok(record)
    }

    /// List sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn list(&self, filter: &SessionFilter) -> StorageResult<Vec<SessionRecord>> {
        let limit = filter.limit.unwrap_or(50).clamp(1, 500);
        let offset = filter.offset.unwrap_or(0).max(0);
        let records = sqlx::query_as::<_, SessionRecord>(
            "SELECT * FROM sessions
             WHERE ($1::text IS NULL OR trigger_source = $1)
               AND ($2::timestamptz IS NULL OR started_at >= $2)
               AND ($3::boolean IS NULL OR success = $3)
             ORDER BY started_at DESC
             LIMIT $4 OFFSET $5",
        )
        .bind(&filter.trigger_source)
        .bind(filter.since)
        .bind(filter.success)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.db.pool())
        .await?;
        Ok(records)
    }

    /// Aggregate usage for a period. Cost derives from the pricing
    /// table at query time.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn summary(&self, period: SummaryPeriod) -> StorageResult<UsageSummary> {
        let since = period.since(Utc::now());
        let rows: Vec<(String, i64, i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT model,
                    count(*),
                    count(*) FILTER (WHERE success = TRUE),
                    count(*) FILTER (WHERE success = FALSE),
                    coalesce(sum(input_tokens), 0),
                    coalesce(sum(output_tokens), 0)
             FROM sessions
             WHERE ($1::timestamptz IS NULL OR started_at >= $1)
             GROUP BY model",
        )
        .bind(since)
        .fetch_all(self.db.pool())
        .await?;

        let mut summary = UsageSummary {
            sessions: 0,
            succeeded: 0,
            failed: 0,
            open: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            unpriced_models: Vec::new(),
        };
        for (model, total, succeeded, failed, input, output) in rows {
            summary.sessions = summary.sessions.saturating_add(total);
            summary.succeeded = summary.succeeded.saturating_add(succeeded);
            summary.failed = summary.failed.saturating_add(failed);
            summary.open = summary
                .open
                .saturating_add(total.saturating_sub(succeeded).saturating_sub(failed));
            summary.input_tokens = summary.input_tokens.saturating_add(input);
            summary.output_tokens = summary.output_tokens.saturating_add(output);
            summary.cost_usd += self.pricing.cost_usd(&model, input, output);
            if !self.pricing.knows(&model) {
                summary.unpriced_models.push(model);
            }
        }
        summary.unpriced_models.sort();
        Ok(summary)
    }

    /// Per-day usage for a date range (inclusive).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn daily(
        &self,
        from: chrono::NaiveDate,
        to: chrono::NaiveDate,
    ) -> StorageResult<Vec<DailyUsage>> {
        let rows: Vec<(chrono::NaiveDate, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT started_at::date, model, count(*),
                    coalesce(sum(input_tokens), 0),
                    coalesce(sum(output_tokens), 0)
             FROM sessions
             WHERE started_at::date BETWEEN $1 AND $2
             GROUP BY started_at::date, model
             ORDER BY started_at::date",
        )
        .bind(from)
        .bind(to)
        .fetch_all(self.db.pool())
        .await?;

        let mut days: BTreeMap<chrono::NaiveDate, DailyUsage> = BTreeMap::new();
        for (day, model, sessions, input, output) in rows {
            let entry = days.entry(day).or_insert_with(|| DailyUsage {
                day,
                sessions: 0,
                input_tokens: 0,
                output_tokens: 0,
                cost_usd: 0.0,
            });
            entry.sessions = entry.sessions.saturating_add(sessions);
            entry.input_tokens = entry.input_tokens.saturating_add(input);
            entry.output_tokens = entry.output_tokens.saturating_add(output);
            entry.cost_usd += self.pricing.cost_usd(&model, input, output);
        }
        Ok(days.into_values().collect())
    }

    /// The most expensive sessions by token volume.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn top_sessions(&self, limit: i64) -> StorageResult<Vec<SessionRecord>> {
        let records = sqlx::query_as::<_, SessionRecord>(
            "SELECT * FROM sessions
             ORDER BY (input_tokens + output_tokens) DESC
             LIMIT $1",
        )
        .bind(limit.clamp(1, 100))
        .fetch_all(self.db.pool())
        .await?;
        Ok(records)
    }

    /// Cost attribution per schedule.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn schedule_costs(&self) -> StorageResult<Vec<ScheduleCost>> {
        let rows: Vec<(String, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT trigger_source, model, count(*),
                    coalesce(sum(input_tokens), 0),
                    coalesce(sum(output_tokens), 0)
             FROM sessions
             WHERE trigger_source LIKE 'schedule:%'
             GROUP BY trigger_source, model",
        )
        .fetch_all(self.db.pool())
        .await?;

        let mut costs: BTreeMap<String, ScheduleCost> = BTreeMap::new();
        for (trigger, model, sessions, input, output) in rows {
            let schedule = trigger
                .strip_prefix("schedule:")
                .unwrap_or(trigger.as_str())
                .to_owned();
            let entry = costs
                .entry(schedule.clone())
                .or_insert_with(|| ScheduleCost {
                    schedule,
                    sessions: 0,
                    cost_usd: 0.0,
                });
            entry.sessions = entry.sessions.saturating_add(sessions);
            entry.cost_usd += self.pricing.cost_usd(&model, input, output);
        }
        Ok(costs.into_values().collect())
    }

    /// Close any sessions left open by a crash.
    ///
    /// Called once at startup so no row dangles: every session reaches
    /// a terminal state even across restarts.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Query`] on database failure.
    pub async fn recover_dangling(&self) -> StorageResult<u64> {
        let result = sqlx::query(
            "UPDATE sessions SET
                completed_at = now(),
                success = FALSE,
                error = 'recovered: daemon restarted while session was open',
                duration_ms = coalesce(
                    duration_ms,
                    (extract(epoch FROM now() - started_at) * 1000)::bigint)
             WHERE completed_at IS NULL",
        )
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_period_is_a_typed_error() {
        let err = SummaryPeriod::parse("fortnight").unwrap_err();
        assert!(matches!(err, StorageError::Validation(msg) if msg.contains("fortnight")));
    }

    #[test]
    fn period_bounds() {
        let now = Utc::now();
        assert!(SummaryPeriod::parse("all").unwrap().since(now).is_none());
        let week = SummaryPeriod::Week.since(now).unwrap();
        assert!(now - week >= chrono::Duration::days(7) - chrono::Duration::seconds(1));
    }

    #[test]
    fn cost_derivation() {
        let pricing = PricingTable::new([(
            "claude-sonnet-4-20250514".to_owned(),
            3.0,
            15.0,
        )]);
        let cost = pricing.cost_usd("claude-sonnet-4-20250514", 1_000_000, 1_000_000);
        assert!((cost - 18.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_costs_zero() {
        let pricing = PricingTable::default();
        assert_eq!(pricing.cost_usd("mystery-model", 1_000_000, 0), 0.0);
        assert!(!pricing.knows("mystery-model"));
    }

    #[test]
    fn negative_token_counts_do_not_produce_negative_cost() {
        let pricing = PricingTable::new([("m".to_owned(), 3.0, 15.0)]);
        assert_eq!(pricing.cost_usd("m", -10, -10), 0.0);
    }
}
