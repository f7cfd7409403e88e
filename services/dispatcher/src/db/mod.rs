//! Postgres access for the scheduler.
//!
//! [`Database`] owns the pool; the scheduler only ever sees it through the
//! [`PgSchedulerStore`] it hands out. Queries are checked at runtime.

mod error;
mod store;

pub use error::DbError;
pub use store::PgSchedulerStore;

use std::path::Path;
use std::time::Duration;

use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Migrations shipped with this crate.
const MIGRATIONS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/migrations");

/// Table whose presence shows the scheduling schema is installed.
const SCHEMA_MARKER: &str = "public.work_items";

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a pass waits for a connection before giving up.
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/jobplane".to_string(),
            max_connections: 4,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable values fall back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let number = |key: &str| lookup(key).and_then(|s| s.parse::<u64>().ok());

        Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: number("DB_MAX_CONNECTIONS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.max_connections),
            min_connections: number("DB_MIN_CONNECTIONS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(defaults.min_connections),
            acquire_timeout: number("DB_ACQUIRE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.acquire_timeout),
        }
    }

    /// The minimum is clamped to the maximum.
    pub fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections.min(self.max_connections))
            .acquire_timeout(self.acquire_timeout)
    }
}

/// Connection pool for the scheduling schema.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            acquire_timeout_secs = config.acquire_timeout.as_secs(),
            "Connecting to database"
        );
        let pool = config
            .pool_options()
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;
        Ok(Self { pool })
    }

    /// Fail unless the scheduling tables exist.
    pub async fn check_schema(&self) -> Result<(), DbError> {
        let installed: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(SCHEMA_MARKER)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::Query)?;
        if installed {
            Ok(())
        } else {
            Err(DbError::SchemaMissing(SCHEMA_MARKER))
        }
    }

    /// Apply the crate's migrations.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let migrator = Migrator::new(Path::new(MIGRATIONS_DIR))
            .await
            .map_err(DbError::Migration)?;
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;
        info!(migrations = migrator.iter().count(), "Database migrations applied");
        Ok(())
    }

    pub fn scheduler_store(&self) -> PgSchedulerStore {
        PgSchedulerStore::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> DbConfig {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        DbConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_db_config_from_lookup() {
        let config = lookup(&[
            ("DATABASE_URL", "postgres://db.internal/jobs"),
            ("DB_MAX_CONNECTIONS", "32"),
            ("DB_MIN_CONNECTIONS", "lots"),
            ("DB_ACQUIRE_TIMEOUT_SECS", "2"),
        ]);

        assert_eq!(config.database_url, "postgres://db.internal/jobs");
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.acquire_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_pool_options_follow_config() {
        let config = lookup(&[("DB_MAX_CONNECTIONS", "2"), ("DB_MIN_CONNECTIONS", "8")]);
        let options = config.pool_options();

        assert_eq!(options.get_max_connections(), 2);
        assert_eq!(options.get_min_connections(), 2);
        assert_eq!(options.get_acquire_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_migrations_dir_is_shipped() {
        assert!(Path::new(MIGRATIONS_DIR).join("0001_scheduling.sql").is_file());
    }
}
