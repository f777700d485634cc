//! Migration runner.
//!
//! A butler's migration plan is composed of the shared `core` chain,
//! the butler-specific chain (if any), and each enabled module's chain
//! in module dependency order. Chains are linear within themselves;
//! applied revisions are recorded in `schema_migrations` and re-running
//! the plan is a no-op for applied revisions.
//!
//! Duplicate revision ids anywhere in the plan fail deterministically
//! before any SQL runs, blocking startup.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::db::Database;
use crate::error::{StorageError, StorageResult};

/// One migration step.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique revision id (e.g. `"core_0001_initial"`).
    pub revision: String,
    /// DDL/DML to execute.
    pub sql: String,
}

impl Migration {
    /// Create a migration.
    #[must_use]
    pub fn new(revision: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            sql: sql.into(),
        }
    }
}

/// A linear chain of migrations owned by one source (core, the butler,
/// or a module).
#[derive(Debug, Clone)]
pub struct MigrationChain {
    /// Chain name (`core`, the butler name, or the module name).
    pub name: String,
    /// Ordered migrations.
    pub migrations: Vec<Migration>,
}

impl MigrationChain {
    /// Create a chain.
    #[must_use]
    pub fn new(name: impl Into<String>, migrations: Vec<Migration>) -> Self {
        Self {
            name: name.into(),
            migrations,
        }
    }
}

/// The composed plan for one butler: core → butler chain → module
/// chains in dependency topological order.
#[derive(Debug, Clone, Default)]
pub struct MigrationPlan {
    chains: Vec<MigrationChain>,
}

impl MigrationPlan {
    /// Start from the shared core chain.
    #[must_use]
    pub fn with_core() -> Self {
        Self {
            chains: vec![crate::chains::core_chain()],
        }
    }

    /// Append a chain. Order of calls is execution order.
    #[must_use]
    pub fn then(mut self, chain: MigrationChain) -> Self {
        self.chains.push(chain);
        self
    }

    /// Validate plan-wide revision uniqueness.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MigrationConflict`] naming the first
    /// duplicate revision.
    pub fn validate(&self) -> StorageResult<()> {
        let mut seen = BTreeSet::new();
        for chain in &self.chains {
            for migration in &chain.migrations {
                if !seen.insert(migration.revision.as_str()) {
                    return Err(StorageError::MigrationConflict(format!(
                        "duplicate revision id '{}' in chain '{}'",
                        migration.revision, chain.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// The chains in execution order.
    #[must_use]
    pub fn chains(&self) -> &[MigrationChain] {
        &self.chains
    }
}

/// Executes a [`MigrationPlan`] against one butler schema.
#[derive(Debug)]
pub struct MigrationRunner<'a> {
    db: &'a Database,
}

impl<'a> MigrationRunner<'a> {
    /// Create a runner for the butler's database.
    #[must_use]
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Apply the plan. Idempotent across restarts: revisions already in
    /// `schema_migrations` are skipped.
    ///
    /// # Errors
    ///
    /// Fails fast on duplicate revisions (before any SQL), and on the
    /// first failing migration (the failing revision is not recorded).
    pub async fn apply(&self, plan: &MigrationPlan) -> StorageResult<usize> {
        plan.validate()?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                revision TEXT PRIMARY KEY,
                chain TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(self.db.pool())
        .await?;

        let mut applied = 0usize;
        for chain in plan.chains() {
            for migration in &chain.migrations {
                let already: Option<(String,)> = sqlx::query_as(
                    "SELECT revision FROM schema_migrations WHERE revision = $1",
                )
                .bind(&migration.revision)
                .fetch_optional(self.db.pool())
                .await?;

                if already.is_some() {
                    debug!(revision = %migration.revision, "already applied, skipping");
                    continue;
                }

                let mut tx = self.db.pool().begin().await?;
                sqlx::raw_sql(migration.sql.as_str()).execute(&mut *tx).await?;
                sqlx::query(
                    "INSERT INTO schema_migrations (revision, chain) VALUES ($1, $2)",
                )
                .bind(&migration.revision)
                .bind(&chain.name)
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;

                info!(
                    schema = self.db.schema(),
                    chain = %chain.name,
                    revision = %migration.revision,
                    "applied migration"
                );
                applied = applied.saturating_add(1);
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_revision_fails_validation() {
        let plan = MigrationPlan::default()
            .then(MigrationChain::new(
                "core",
                vec![Migration::new("core_0001", "SELECT 1")],
            ))
            .then(MigrationChain::new(
                "memory",
                vec![Migration::new("core_0001", "SELECT 2")],
            ));
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, StorageError::MigrationConflict(msg) if msg.contains("core_0001")));
    }

    #[test]
    fn duplicate_within_one_chain_fails() {
        let plan = MigrationPlan::default().then(MigrationChain::new(
            "mod",
            vec![
                Migration::new("mod_0001", "SELECT 1"),
                Migration::new("mod_0001", "SELECT 2"),
            ],
        ));
        assert!(plan.validate().is_err());
    }

    #[test]
    fn core_plan_is_internally_consistent() {
        MigrationPlan::with_core().validate().unwrap();
    }

    #[test]
    fn chains_preserve_declaration_order() {
        let plan = MigrationPlan::with_core()
            .then(MigrationChain::new("health", vec![]))
            .then(MigrationChain::new("memory", vec![]));
        let names: Vec<&str> = plan.chains().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["core", "health", "memory"]);
    }
}
