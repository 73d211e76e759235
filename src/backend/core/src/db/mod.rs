//! Database layer for Lingua.
//!
//! Owns the PostgreSQL pool and the schema migrations. RBAC queries live in
//! [`crate::rbac::store::PgStore`], which borrows the pool from here.

use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::DatabaseConfig;
use crate::error::{ErrorCode, LinguaError, Result};

/// Migration status reported by [`Database::migration_status`].
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub applied: Vec<String>,
    pub pending: Vec<String>,
}

impl MigrationStatus {
    pub fn is_current(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Pool sizes for diagnostics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub max_connections: u32,
}

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    max_connections: u32,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to the database");
                LinguaError::from(e)
            })?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database pool created"
        );

        Ok(Self {
            pool,
            max_connections: config.max_connections,
        })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        let max_connections = pool.options().get_max_connections();
        Self { pool, max_connections }
    }

    /// Run pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations...");
        let start = Instant::now();
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Database migration failed");
                LinguaError::from(sqlx::Error::Migrate(Box::new(e)))
            })?;
        info!(
            duration_ms = start.elapsed().as_millis() as u64,
            "Database migrations completed"
        );
        Ok(())
    }

    /// Compare the applied migrations with the embedded ones.
    pub async fn migration_status(&self) -> Result<MigrationStatus> {
        let migrator = sqlx::migrate!("./migrations");
        let applied: Vec<String> = match sqlx::query_scalar(
            "SELECT description FROM _sqlx_migrations WHERE success ORDER BY version",
        )
        .fetch_all(&self.pool)
        .await
        {
            Ok(applied) => applied,
            // No migration table yet.
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("42P01") => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let pending = migrator
            .iter()
            .map(|m| m.description.to_string())
            .filter(|m| !applied.contains(m))
            .collect::<Vec<_>>();

        if !pending.is_empty() {
            warn!(pending = pending.len(), "Database has pending migrations");
        }
        Ok(MigrationStatus { applied, pending })
    }

    /// Migrate, then refuse to continue if anything is still pending.
    pub async fn startup_validation(&self, auto_migrate: bool) -> Result<()> {
        if auto_migrate {
            self.migrate().await?;
        }
        let status = self.migration_status().await?;
        if !status.is_current() {
            return Err(LinguaError::new(
                ErrorCode::DatabaseError,
                format!(
                    "Database has {} pending migrations; run `lingua-admin migrate`",
                    status.pending.len()
                ),
            ));
        }
        self.ping().await?;
        Ok(())
    }

    /// Round-trip a trivial query and return its latency.
    pub async fn ping(&self) -> Result<Duration> {
        let start = Instant::now();
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        let latency = start.elapsed();
        if latency > Duration::from_millis(100) {
            warn!(
                latency_ms = latency.as_millis() as u64,
                "Database connectivity check latency is high"
            );
        }
        Ok(latency)
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle() as u32,
            max_connections: self.max_connections,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}
