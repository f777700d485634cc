//! The butler registry.
//!
//! Switchboard is the single owner; butlers advertise themselves via
//! idempotent upsert and everything else reads. Liveness derives from
//! `last_seen_at`; stale and offline targets are excluded from new
//! routes unless policy overrides.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::Row;

use butlers_storage::{Database, StorageError, StorageResult};

/// Liveness derived from `last_seen_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    /// Seen within the live TTL.
    Online,
    /// Seen within the stale TTL.
    Stale,
    /// Not seen for longer than the stale TTL.
    Offline,
}

/// One registered butler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButlerRecord {
    /// Butler name.
    pub name: String,
    /// RPC endpoint.
    pub endpoint_url: String,
    /// Enabled module names.
    pub modules: Vec<String>,
    /// Advertised capabilities.
    pub capabilities: Vec<String>,
    /// Last advertisement time.
    pub last_seen_at: DateTime<Utc>,
    /// Lowest route contract version accepted.
    pub route_contract_min: u32,
    /// Highest route contract version accepted.
    pub route_contract_max: u32,
    /// Whether the butler wants routes.
    pub advertise_flag: bool,
}

impl ButlerRecord {
    /// Liveness at `now` under the given TTLs.
    #[must_use]
    pub fn liveness(&self, now: DateTime<Utc>, live_ttl_s: i64, stale_ttl_s: i64) -> Liveness {
        let age = now - self.last_seen_at;
        if age < Duration::seconds(live_ttl_s) {
            Liveness::Online
        } else if age < Duration::seconds(stale_ttl_s) {
            Liveness::Stale
        } else {
            Liveness::Offline
        }
    }
}

/// The registry: Postgres rows mirrored into a read cache.
#[derive(Debug)]
pub struct Registry {
    db: Database,
    cache: DashMap<String, ButlerRecord>,
    live_ttl_s: i64,
    stale_ttl_s: i64,
}

impl Registry {
    /// Create a registry with the given TTLs.
    #[must_use]
    pub fn new(db: Database, live_ttl_s: i64, stale_ttl_s: i64) -> Self {
        Self {
            db,
            cache: DashMap::new(),
            live_ttl_s,
            stale_ttl_s,
        }
    }

    /// Idempotent upsert from a butler advertisement.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn register(&self, record: ButlerRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO butler_registry
                (name, endpoint_url, modules, capabilities, last_seen_at,
                 route_contract_min, route_contract_max, advertise_flag)
             VALUES ($1, $2, $3, $4, now(), $5, $6, $7)
             ON CONFLICT (name) DO UPDATE SET
                endpoint_url = $2, modules = $3, capabilities = $4,
                last_seen_at = now(), route_contract_min = $5,
                route_contract_max = $6, advertise_flag = $7,
                updated_at = now()",
        )
        .bind(&record.name)
        .bind(&record.endpoint_url)
        .bind(serde_json::to_value(&record.modules).unwrap_or_default())
        .bind(serde_json::to_value(&record.capabilities).unwrap_or_default())
        .bind(i32::try_from(record.route_contract_min).unwrap_or(1))
        .bind(i32::try_from(record.route_contract_max).unwrap_or(1))
        .bind(record.advertise_flag)
        .execute(self.db.pool())
        .await?;
        self.cache.insert(record.name.clone(), record);
        Ok(())
    }

    /// Look up one butler from the cache, falling back to the table.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn get(&self, name: &str) -> StorageResult<Option<ButlerRecord>> {
        if let Some(record) = self.cache.get(name) {
            return Ok(Some(record.clone()));
        }
        let row = sqlx::query(
            "SELECT name, endpoint_url, modules, capabilities, last_seen_at,
                    route_contract_min, route_contract_max, advertise_flag
             FROM butler_registry WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(self.db.pool())
        .await?;
        match row {
            Some(row) => {
                let record = record_from_row(&row)?;
                self.cache.insert(record.name.clone(), record.clone());
                Ok(Some(record))
            },
            None => Ok(None),
        }
    }

    /// Names of butlers eligible for new routes at `now`: advertising
    /// and not offline.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn routable_names(&self, now: DateTime<Utc>) -> StorageResult<Vec<String>> {
        self.refresh_cache().await?;
        let mut names: Vec<String> = self
            .cache
            .iter()
            .filter(|entry| {
                entry.advertise_flag
                    && entry.liveness(now, self.live_ttl_s, self.stale_ttl_s) != Liveness::Offline
            })
            .map(|entry| entry.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    /// All records, freshly loaded.
    ///
    /// # Errors
    ///
    /// Returns a storage error on database failure.
    pub async fn list(&self) -> StorageResult<Vec<ButlerRecord>> {
        self.refresh_cache().await?;
        let mut records: Vec<ButlerRecord> =
            self.cache.iter().map(|entry| entry.clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Liveness of one butler at `now`.
    #[must_use]
    pub fn liveness_of(&self, record: &ButlerRecord, now: DateTime<Utc>) -> Liveness {
        record.liveness(now, self.live_ttl_s, self.stale_ttl_s)
    }

    async fn refresh_cache(&self) -> StorageResult<()> {
        let rows = sqlx::query(
            "SELECT name, endpoint_url, modules, capabilities, last_seen_at,
                    route_contract_min, route_contract_max, advertise_flag
             FROM butler_registry",
        )
        .fetch_all(self.db.pool())
        .await?;
        for row in &rows {
            let record = record_from_row(row)?;
            self.cache.insert(record.name.clone(), record);
        }
        Ok(())
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> StorageResult<ButlerRecord> {
    let modules: serde_json::Value = row.try_get("modules")?;
    let capabilities: serde_json::Value = row.try_get("capabilities")?;
    let min: i32 = row.try_get("route_contract_min")?;
    let max: i32 = row.try_get("route_contract_max")?;
    Ok(ButlerRecord {
        name: row.try_get("name")?,
        endpoint_url: row.try_get("endpoint_url")?,
        modules: serde_json::from_value(modules).unwrap_or_default(),
        capabilities: serde_json::from_value(capabilities).unwrap_or_default(),
        last_seen_at: row.try_get("last_seen_at")?,
        route_contract_min: u32::try_from(min).unwrap_or(1),
        route_contract_max: u32::try_from(max).unwrap_or(1),
        advertise_flag: row.try_get("advertise_flag")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(seen_seconds_ago: i64) -> ButlerRecord {
        ButlerRecord {
            name: "health".to_owned(),
            endpoint_url: "http://127.0.0.1:8011".to_owned(),
            modules: vec!["memory".to_owned()],
            capabilities: vec![],
            last_seen_at: Utc::now() - Duration::seconds(seen_seconds_ago),
            route_contract_min: 1,
            route_contract_max: 1,
            advertise_flag: true,
        }
    }

    #[test]
    fn liveness_tiers() {
        let now = Utc::now();
        assert_eq!(record(10).liveness(now, 60, 300), Liveness::Online);
        assert_eq!(record(120).liveness(now, 60, 300), Liveness::Stale);
        assert_eq!(record(600).liveness(now, 60, 300), Liveness::Offline);
    }

    #[test]
    fn liveness_boundaries_are_exclusive_at_the_ttl() {
        let now = Utc::now();
        assert_eq!(record(60).liveness(now, 60, 300), Liveness::Stale);
        assert_eq!(record(300).liveness(now, 60, 300), Liveness::Offline);
    }
}
