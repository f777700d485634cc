//! Month-partitioned message inbox, routing log, and heartbeat log.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use butlers_core::{HeartbeatV1, LifecycleState, RequestContext, RequestId};
use butlers_storage::{Database, StorageError, StorageResult};

/// Result of an inbox insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum InsertOutcome {
    /// A new canonical request was created.
    Created {
        /// The fresh request id.
        request_id: RequestId,
    },
    /// The dedupe key already exists; the original request is returned.
    Deduped {
        /// The original request id.
        request_id: RequestId,
    },
}

impl InsertOutcome {
    /// The canonical request id either way.
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        match self {
            Self::Created { request_id } | Self::Deduped { request_id } => *request_id,
        }
    }
}

/// One inbox row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxRow {
    /// Canonical request id.
    pub request_id: RequestId,
    /// The dedupe key.
    pub dedupe_key: String,
    /// Full request context.
    pub request_context: RequestContext,
    /// Normalized text.
    pub normalized_text: String,
    /// Lifecycle state.
    pub lifecycle_state: LifecycleState,
    /// Classification result, when classified.
    pub classification_result: Option<serde_json::Value>,
    /// User-facing response summary, when terminal.
    pub response_summary: Option<String>,
    /// Receipt time.
    pub received_at: DateTime<Utc>,
    /// Terminal time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Store over the switchboard inbox tables.
#[derive(Debug, Clone)]
pub struct InboxStore {
    db: Database,
}

impl InboxStore {
    /// Create a store over the switchboard database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Ensure the partition covering `at` exists
    /// (`message_inbox_yYYYYmMM`, one calendar month wide).
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn ensure_partition(&self, at: DateTime<Utc>) -> StorageResult<()> {
        let (from, to) = month_bounds(at);
        let name = partition_name(at);
        // Partition names derive from a date, not user input.
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {name} PARTITION OF message_inbox
             FOR VALUES FROM ('{from}') TO ('{to}')"
        ))
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Drop partitions entirely before the retention horizon (one
    /// month back from `now`).
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn drop_expired_partitions(&self, now: DateTime<Utc>) -> StorageResult<Vec<String>> {
        let horizon = previous_month(now);
        let rows = sqlx::query(
            "SELECT tablename FROM pg_tables
             WHERE schemaname = current_schema() AND tablename LIKE 'message_inbox_y%'",
        )
        .fetch_all(self.db.pool())
        .await?;
        let mut dropped = Vec::new();
        for row in rows {
            let name: String = row.try_get("tablename")?;
            if let Some(month_start) = parse_partition_name(&name) {
                if month_start < horizon {
                    sqlx::query(&format!("DROP TABLE IF EXISTS {name}"))
                        .execute(self.db.pool())
                        .await?;
                    dropped.push(name);
                }
            }
        }
        Ok(dropped)
    }

    /// Insert a canonical request, deduplicating on the key.
    ///
    /// The unique index on `(dedupe_key, received_at)` within the
    /// partition enforces one canonical row per key; a conflict
    /// returns the original `request_id` with outcome `deduped` and
    /// writes nothing.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn insert(
        &self,
        dedupe_key: &str,
        context: &RequestContext,
        raw_payload: &serde_json::Value,
        normalized_text: &str,
    ) -> StorageResult<InsertOutcome> {
        self.ensure_partition(context.received_at).await?;

        let inserted = sqlx::query(
            "INSERT INTO message_inbox
                (request_id, dedupe_key, request_context, raw_payload,
                 normalized_text, lifecycle_state, received_at)
             VALUES ($1, $2, $3, $4, $5, 'PROGRESS', $6)
             ON CONFLICT (dedupe_key, received_at) DO NOTHING",
        )
        .bind(context.request_id.as_uuid())
        .bind(dedupe_key)
        .bind(serde_json::to_value(context).unwrap_or_default())
        .bind(raw_payload)
        .bind(normalized_text)
        .bind(context.received_at)
        .execute(self.db.pool())
        .await?;

        if inserted.rows_affected() > 0 {
            return Ok(InsertOutcome::Created {
                request_id: context.request_id,
            });
        }

        // Conflicted within the same timestamp partition row; fetch the
        // canonical owner of the key.
        let row = sqlx::query("SELECT request_id FROM message_inbox WHERE dedupe_key = $1")
            .bind(dedupe_key)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| {
                StorageError::NotFound(format!("dedupe key {dedupe_key} vanished mid-insert"))
            })?;
        Ok(InsertOutcome::Deduped {
            request_id: RequestId::from_uuid(row.try_get("request_id")?),
        })
    }

    /// Canonical owner of a dedupe key, if any. The ingest path checks
    /// this before assigning a fresh request id so duplicates across
    /// timestamps still dedupe.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn find_by_key(&self, dedupe_key: &str) -> StorageResult<Option<RequestId>> {
        let row = sqlx::query("SELECT request_id FROM message_inbox WHERE dedupe_key = $1")
            .bind(dedupe_key)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row
            .map(|r| r.try_get("request_id").map(RequestId::from_uuid))
            .transpose()?)
    }

    /// Attach the classification result.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn record_classification(
        &self,
        request_id: RequestId,
        classification: &serde_json::Value,
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE message_inbox SET classification_result = $2 WHERE request_id = $1",
        )
        .bind(request_id.as_uuid())
        .bind(classification)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Finalize the row with its terminal lifecycle state and summary.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn finalize(
        &self,
        request_id: RequestId,
        state: LifecycleState,
        response_summary: &str,
        dispatch_outcomes: &serde_json::Value,
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE message_inbox
             SET lifecycle_state = $2, response_summary = $3,
                 dispatch_outcomes = $4, completed_at = now()
             WHERE request_id = $1",
        )
        .bind(request_id.as_uuid())
        .bind(state.as_str())
        .bind(response_summary)
        .bind(dispatch_outcomes)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Append one routing-log row for a dispatched subrequest.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_route(
        &self,
        request_id: RequestId,
        subrequest_id: butlers_core::SubrequestId,
        segment_id: Option<&str>,
        target_butler: &str,
        tool: &str,
        outcome: &str,
        error_class: Option<&str>,
        duration_ms: i64,
        started_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO routing_log
                (request_id, subrequest_id, segment_id, target_butler, tool,
                 outcome, error_class, duration_ms, started_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(request_id.as_uuid())
        .bind(subrequest_id.as_uuid())
        .bind(segment_id)
        .bind(target_butler)
        .bind(tool)
        .bind(outcome)
        .bind(error_class)
        .bind(duration_ms)
        .bind(started_at)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Record a connector heartbeat; the log is swept after 7 days.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn record_heartbeat(&self, beacon: &HeartbeatV1) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO connector_heartbeat_log
                (channel, endpoint_identity, emitted_at, accepted_since_last)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&beacon.channel)
        .bind(&beacon.endpoint_identity)
        .bind(beacon.emitted_at)
        .bind(i64::try_from(beacon.accepted_since_last).unwrap_or(i64::MAX))
        .execute(self.db.pool())
        .await?;
        sqlx::query(
            "DELETE FROM connector_heartbeat_log WHERE emitted_at < now() - interval '7 days'",
        )
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}

fn partition_name(at: DateTime<Utc>) -> String {
    format!("message_inbox_y{}m{:02}", at.year(), at.month())
}

fn parse_partition_name(name: &str) -> Option<DateTime<Utc>> {
    let rest = name.strip_prefix("message_inbox_y")?;
    let (year, month) = rest.split_once('m')?;
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .map(|d| d.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc())
}

fn month_bounds(at: DateTime<Utc>) -> (String, String) {
    let start = chrono::NaiveDate::from_ymd_opt(at.year(), at.month(), 1).unwrap_or_default();
    let end = if at.month() == 12 {
        chrono::NaiveDate::from_ymd_opt(at.year().saturating_add(1), 1, 1)
    } else {
        chrono::NaiveDate::from_ymd_opt(at.year(), at.month().saturating_add(1), 1)
    }
    .unwrap_or_default();
    (start.format("%Y-%m-%d").to_string(), end.format("%Y-%m-%d").to_string())
}

fn previous_month(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 1 {
        (now.year().saturating_sub(1), 12)
    } else {
        (now.year(), now.month().saturating_sub(1))
    };
    chrono::NaiveDate::from_ymd_opt(year, month, 1)
        .unwrap_or_default()
        .and_hms_opt(0, 0, 0)
        .unwrap_or_default()
        .and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn partition_names_are_month_scoped() {
        let at = Utc.with_ymd_and_hms(2026, 3, 15, 10, 0, 0).unwrap();
        assert_eq!(partition_name(at), "message_inbox_y2026m03");
        let (from, to) = month_bounds(at);
        assert_eq!(from, "2026-03-01");
        assert_eq!(to, "2026-04-01");
    }

    #[test]
    fn december_rolls_into_the_next_year() {
        let at = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
        let (from, to) = month_bounds(at);
        assert_eq!(from, "2026-12-01");
        assert_eq!(to, "2027-01-01");
    }

    #[test]
    fn partition_names_round_trip() {
        let at = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
        let parsed = parse_partition_name(&partition_name(at)).unwrap();
        assert_eq!(parsed, at);
    }

    #[test]
    fn retention_horizon_is_the_previous_month() {
        let now = Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap();
        assert_eq!(
            previous_month(now),
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
        );
        let january = Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap();
        assert_eq!(
            previous_month(january),
            Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn insert_outcome_exposes_the_canonical_id() {
        let id = RequestId::new();
        assert_eq!(InsertOutcome::Created { request_id: id }.request_id(), id);
        assert_eq!(InsertOutcome::Deduped { request_id: id }.request_id(), id);
    }
}
