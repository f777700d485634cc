//! Per-butler key → JSON state store.
//!
//! Last-write-wins semantics; keys are prefix-listable. Cross-butler
//! access is impossible because the pool is schema-pinned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::StorageResult;

/// One state row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StateEntry {
    /// The key.
    pub key: String,
    /// The stored JSON value.
    pub value: serde_json::Value,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

/// State store over one butler schema.
#[derive(Debug, Clone)]
pub struct StateStore {
    db: Database,
}

impl StateStore {
    /// Create a store over the butler's database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetch a value.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Query`] on database failure.
    pub async fn get(&self, key: &str) -> StorageResult<Option<serde_json::Value>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT value FROM state WHERE key = $1")
                .bind(key)
                .fetch_optional(self.db.pool())
                .await?;
        Ok(row.map(|(value,)| value))
    }

    /// Set a value (last write wins).
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Query`] on database failure.
    pub async fn set(&self, key: &str, value: &serde_json::Value) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO state (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = now()",
        )
        .bind(key)
        .bind(value)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Delete a key. Returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Query`] on database failure.
    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM state WHERE key = $1")
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List entries, optionally restricted to a key prefix, ordered by
    /// key.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Query`] on database failure.
    pub async fn list(&self, prefix: Option<&str>) -> StorageResult<Vec<StateEntry>> {
        let entries = match prefix {
            Some(prefix) => {
                sqlx::query_as::<_, StateEntry>(
                    "SELECT key, value, updated_at FROM state
                     WHERE key LIKE $1 || '%' ORDER BY key",
                )
                .bind(prefix)
                .fetch_all(self.db.pool())
                .await?
            },
            None => {
                sqlx::query_as::<_, StateEntry>(
                    "SELECT key, value, updated_at FROM state ORDER BY key",
                )
                .fetch_all(self.db.pool())
                .await?
            },
        };
        Ok(entries)
    }
}
