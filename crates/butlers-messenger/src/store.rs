//! Delivery audit persistence.
//!
//! Four tables: `delivery_requests` (canonical row + idempotency key +
//! terminal status), `delivery_attempts` (one row per provider call),
//! `delivery_receipts` (provider webhooks), and `delivery_dead_letter`
//! (retry exhaustion / manual quarantine with replay eligibility).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use butlers_core::{DeliveryId, RequestId};
use butlers_storage::{Database, StorageError, StorageResult};

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Being executed.
    InFlight,
    /// Provider side effect confirmed.
    Succeeded,
    /// Failed; retry may help.
    FailedRetryable,
    /// Failed permanently.
    FailedTerminal,
    /// Retries exhausted or quarantined.
    DeadLettered,
    /// Parked: the requested channel has no contact identifier.
    PendingMissingIdentifier,
}

impl DeliveryStatus {
    /// Column form.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Succeeded => "succeeded",
            Self::FailedRetryable => "failed_retryable",
            Self::FailedTerminal => "failed_terminal",
            Self::DeadLettered => "dead_lettered",
            Self::PendingMissingIdentifier => "pending_missing_identifier",
        }
    }

    /// Parse the column form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_flight" => Some(Self::InFlight),
            "succeeded" => Some(Self::Succeeded),
            "failed_retryable" => Some(Self::FailedRetryable),
            "failed_terminal" => Some(Self::FailedTerminal),
            "dead_lettered" => Some(Self::DeadLettered),
            "pending_missing_identifier" => Some(Self::PendingMissingIdentifier),
            _ => None,
        }
    }

    /// Whether no further transitions happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::FailedTerminal | Self::DeadLettered
        )
    }
}

/// One delivery row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    /// Delivery id.
    pub delivery_id: DeliveryId,
    /// Canonical idempotency key.
    pub idempotency_key: String,
    /// Requesting butler.
    pub origin_butler: String,
    /// Channel.
    pub channel: String,
    /// Intent wire name.
    pub intent: String,
    /// Resolved target identifier.
    pub resolved_target: Option<String>,
    /// Content hash.
    pub content_hash: String,
    /// Status.
    pub status: DeliveryStatus,
    /// Provider's delivery id, when reported.
    pub provider_delivery_id: Option<String>,
    /// Failure class for failed rows.
    pub error_class: Option<String>,
    /// Failure message.
    pub error_message: Option<String>,
    /// Originating request lineage.
    pub request_id: Option<RequestId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Terminal time.
    pub terminal_at: Option<DateTime<Utc>>,
}

/// Result of claiming an idempotency key.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This caller owns execution of a fresh delivery.
    Fresh(DeliveryRecord),
    /// The key exists; the current record is returned.
    Existing(DeliveryRecord),
}

/// Store over the messenger delivery tables.
#[derive(Debug, Clone)]
pub struct DeliveryStore {
    db: Database,
}

impl DeliveryStore {
    /// Create a store over the messenger database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Claim an idempotency key: insert a fresh `in_flight` row, or
    /// return the existing row on conflict. The unique index is the
    /// at-most-one-effect enforcement point.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn claim(
        &self,
        idempotency_key: &str,
        origin_butler: &str,
        channel: &str,
        intent: &str,
        resolved_target: Option<&str>,
        content_hash: &str,
        request_id: Option<RequestId>,
        initial_status: DeliveryStatus,
    ) -> StorageResult<ClaimOutcome> {
        let delivery_id = DeliveryId::new();
        let inserted = sqlx::query(
            "INSERT INTO delivery_requests
                (delivery_id, idempotency_key, origin_butler, channel, intent,
                 resolved_target, content_hash, status, request_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(delivery_id.as_uuid())
        .bind(idempotency_key)
        .bind(origin_butler)
        .bind(channel)
        .bind(intent)
        .bind(resolved_target)
        .bind(content_hash)
        .bind(initial_status.as_str())
        .bind(request_id.map(|r| r.as_uuid()))
        .execute(self.db.pool())
        .await?;

        let record = self
            .by_key(idempotency_key)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("key {idempotency_key}")))?;
        if inserted.rows_affected() > 0 {
            Ok(ClaimOutcome::Fresh(record))
        } else {
            Ok(ClaimOutcome::Existing(record))
        }
    }

    /// Fetch a delivery by its idempotency key.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn by_key(&self, idempotency_key: &str) -> StorageResult<Option<DeliveryRecord>> {
        let row = sqlx::query(
            "SELECT delivery_id, idempotency_key, origin_butler, channel, intent,
                    resolved_target, content_hash, status, provider_delivery_id,
                    error_class, error_message, request_id, created_at, terminal_at
             FROM delivery_requests WHERE idempotency_key = $1",
        )
        .bind(idempotency_key)
        .fetch_optional(self.db.pool())
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Mark success with the provider's id.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn mark_succeeded(
        &self,
        delivery_id: DeliveryId,
        provider_delivery_id: Option<&str>,
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE delivery_requests
             SET status = 'succeeded', provider_delivery_id = $2, terminal_at = now()
             WHERE delivery_id = $1",
        )
        .bind(delivery_id.as_uuid())
        .bind(provider_delivery_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Mark a failure with its class.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn mark_failed(
        &self,
        delivery_id: DeliveryId,
        status: DeliveryStatus,
        error_class: &str,
        error_message: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE delivery_requests
             SET status = $2, error_class = $3, error_message = $4,
                 terminal_at = CASE WHEN $2 IN ('failed_terminal', 'dead_lettered')
                                    THEN now() ELSE terminal_at END
             WHERE delivery_id = $1",
        )
        .bind(delivery_id.as_uuid())
        .bind(status.as_str())
        .bind(error_class)
        .bind(error_message)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Append one provider attempt.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn record_attempt(
        &self,
        delivery_id: DeliveryId,
        outcome: &str,
        latency_ms: i64,
        error_class: Option<&str>,
        retryable: bool,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO delivery_attempts
                (delivery_id, outcome, latency_ms, error_class, retryable)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(delivery_id.as_uuid())
        .bind(outcome)
        .bind(latency_ms)
        .bind(error_class)
        .bind(retryable)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Record a provider webhook receipt.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn record_receipt(
        &self,
        delivery_id: DeliveryId,
        provider_delivery_id: Option<&str>,
        payload: &serde_json::Value,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO delivery_receipts (delivery_id, provider_delivery_id, payload)
             VALUES ($1, $2, $3)",
        )
        .bind(delivery_id.as_uuid())
        .bind(provider_delivery_id)
        .bind(payload)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Quarantine a delivery into the dead letter table.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn dead_letter(
        &self,
        delivery_id: DeliveryId,
        idempotency_key: &str,
        reason: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO delivery_dead_letter (delivery_id, idempotency_key, reason)
             VALUES ($1, $2, $3)",
        )
        .bind(delivery_id.as_uuid())
        .bind(idempotency_key)
        .bind(reason)
        .execute(self.db.pool())
        .await?;
        self.mark_failed(delivery_id, DeliveryStatus::DeadLettered, "timeout", reason)
            .await
    }

    /// Fetch a replay-eligible dead letter and its delivery record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for unknown or already
    /// replayed entries.
    pub async fn replay_candidate(&self, dead_letter_id: i64) -> StorageResult<DeliveryRecord> {
        let row = sqlx::query(
            "SELECT idempotency_key FROM delivery_dead_letter
             WHERE id = $1 AND replay_eligible AND replayed_at IS NULL",
        )
        .bind(dead_letter_id)
        .fetch_optional(self.db.pool())
        .await?
        .ok_or_else(|| {
            StorageError::NotFound(format!("replayable dead letter {dead_letter_id}"))
        })?;
        let key: String = row.try_get("idempotency_key")?;
        self.by_key(&key)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("delivery for key {key}")))
    }

    /// Mark a dead letter replayed and reopen its delivery for one
    /// more execution under the original idempotency key lineage.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn mark_replayed(&self, dead_letter_id: i64, delivery_id: DeliveryId) -> StorageResult<()> {
        sqlx::query("UPDATE delivery_dead_letter SET replayed_at = now() WHERE id = $1")
            .bind(dead_letter_id)
            .execute(self.db.pool())
            .await?;
        sqlx::query(
            "UPDATE delivery_requests SET status = 'in_flight', terminal_at = NULL
             WHERE delivery_id = $1",
        )
        .bind(delivery_id.as_uuid())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Resolve a contact's identifier on a channel.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn contact_identifier(
        &self,
        contact_id: &str,
        channel: &str,
    ) -> StorageResult<Option<String>> {
        let row = sqlx::query(
            "SELECT identifier FROM contact_info
             WHERE contact_id = $1 AND channel = $2 AND NOT deleted",
        )
        .bind(contact_id)
        .bind(channel)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row
            .map(|r| r.try_get::<String, _>("identifier"))
            .transpose()?)
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> StorageResult<DeliveryRecord> {
    let status_raw: String = row.try_get("status")?;
    let status = DeliveryStatus::parse(&status_raw).ok_or_else(|| {
        StorageError::Validation(format!("unknown delivery status '{status_raw}'"))
    })?;
    Ok(DeliveryRecord {
        delivery_id: DeliveryId::from_uuid(row.try_get("delivery_id")?),
        idempotency_key: row.try_get("idempotency_key")?,
        origin_butler: row.try_get("origin_butler")?,
        channel: row.try_get("channel")?,
        intent: row.try_get("intent")?,
        resolved_target: row.try_get("resolved_target")?,
        content_hash: row.try_get("content_hash")?,
        status,
        provider_delivery_id: row.try_get("provider_delivery_id")?,
        error_class: row.try_get("error_class")?,
        error_message: row.try_get("error_message")?,
        request_id: row
            .try_get::<Option<uuid::Uuid>, _>("request_id")?
            .map(RequestId::from_uuid),
        created_at: row.try_get("created_at")?,
        terminal_at: row.try_get("terminal_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            DeliveryStatus::InFlight,
            DeliveryStatus::Succeeded,
            DeliveryStatus::FailedRetryable,
            DeliveryStatus::FailedTerminal,
            DeliveryStatus::DeadLettered,
            DeliveryStatus::PendingMissingIdentifier,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(DeliveryStatus::Succeeded.is_terminal());
        assert!(DeliveryStatus::FailedTerminal.is_terminal());
        assert!(DeliveryStatus::DeadLettered.is_terminal());
        assert!(!DeliveryStatus::InFlight.is_terminal());
        assert!(!DeliveryStatus::FailedRetryable.is_terminal());
        assert!(!DeliveryStatus::PendingMissingIdentifier.is_terminal());
    }
}
