//! Postgres pool pinned to one butler schema.

use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use crate::error::{StorageError, StorageResult};

/// Default pool size per butler.
const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// A connection pool whose `search_path` is fixed to a single butler
/// schema at connect time.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    schema: String,
}

impl Database {
    /// Connect to the shared database, pinning `search_path` to the
    /// butler's schema. The schema is created if absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Connection`] on a malformed URL or
    /// unreachable server.
    pub async fn connect(database_url: &str, schema: &str) -> StorageResult<Self> {
        if !is_valid_schema_name(schema) {
            return Err(StorageError::Connection(format!(
                "invalid schema name: {schema}"
            )));
        }

        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .options([("search_path", schema)]);

        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        // Schema names cannot be bound as parameters; validated above.
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            schema: schema.to_owned(),
        })
    }

    /// Build a pool without dialing the server.
    ///
    /// Connections are established on first use; useful for tests and
    /// tools that may never run a query. Does not create the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Connection`] on a malformed URL or
    /// invalid schema name.
    pub fn connect_lazy(database_url: &str, schema: &str) -> StorageResult<Self> {
        if !is_valid_schema_name(schema) {
            return Err(StorageError::Connection(format!(
                "invalid schema name: {schema}"
            )));
        }
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .options([("search_path", schema)]);
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect_lazy_with(options);
        Ok(Self {
            pool,
            schema: schema.to_owned(),
        })
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The schema this pool is pinned to.
    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Schema names are interpolated into DDL, so they are restricted to a
/// conservative identifier alphabet.
fn is_valid_schema_name(schema: &str) -> bool {
    !schema.is_empty()
        && schema.len() <= 63
        && schema
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && schema
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_name_validation() {
        assert!(is_valid_schema_name("health"));
        assert!(is_valid_schema_name("switchboard"));
        assert!(is_valid_schema_name("_internal"));
        assert!(!is_valid_schema_name(""));
        assert!(!is_valid_schema_name("9lives"));
        assert!(!is_valid_schema_name("public; DROP TABLE sessions"));
        assert!(!is_valid_schema_name("Mixed"));
        assert!(!is_valid_schema_name(&"a".repeat(64)));
    }
}
