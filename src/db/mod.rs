mod agents;
mod checkpoints;
mod cursors;
mod event_log;
mod mappers;
mod messages;
mod projections;
mod replay;
mod reservations;

#[cfg(test)]
mod event_log_behaviors;
#[cfg(test)]
mod reservation_behaviors;

pub use event_log::EventFilter;

use crate::canonical_schema::{CANONICAL_COORDINATOR_SCHEMA, CANONICAL_COORDINATOR_SCHEMA_PATH};
use crate::error::{Result, SwarmError};
use crate::types::{ProjectKey, StoreStats};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use std::pin::Pin;
use tap::TapFallible;
use tracing::{info, warn};

pub(crate) type TxFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 't>>;

/// Handle to one coordination store. Cheap to clone; all clones share the
/// same connection pool. There is no process-wide singleton: callers own
/// the lifecycle and pass the handle by reference.
#[derive(Clone)]
pub struct SwarmDb {
    pool: PgPool,
}

impl SwarmDb {
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the connection cannot be
    /// established.
    pub async fn new(database_url: &str) -> Result<Self> {
        let max_connections = resolve_pool_max_connections();

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|error| {
                SwarmError::DatabaseError(format!("Failed to connect to database: {error}"))
            })?;

        info!(
            url = %crate::config::redact_database_url(database_url),
            "Connected to PostgreSQL coordination store"
        );
        Ok(Self { pool })
    }

    /// Create a store with an existing pool (for testing).
    #[must_use]
    pub fn new_with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the canonical schema. Idempotent; every statement is
    /// `IF NOT EXISTS`.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when DDL execution fails.
    pub async fn initialize_schema(&self) -> Result<()> {
        sqlx::raw_sql(CANONICAL_COORDINATOR_SCHEMA)
            .execute(self.pool())
            .await
            .map(|_| info!(schema = CANONICAL_COORDINATOR_SCHEMA_PATH, "Applied canonical schema"))
            .map_err(|error| {
                SwarmError::DatabaseError(format!("Failed to initialize schema: {error}"))
            })
    }

    /// Run one unit of work inside a transaction: BEGIN, work, COMMIT.
    ///
    /// This is the only atomicity mechanism in the store; every multi-step
    /// write (sequence assignment, dual writes, reservation grants) goes
    /// through here. Failures are never retried internally.
    ///
    /// # Errors
    /// Propagates the work's error after ROLLBACK. A failed commit surfaces
    /// as [`SwarmError::TransactionError`]; a failed rollback surfaces as
    /// [`SwarmError::RollbackFailed`] carrying both causes.
    pub async fn with_transaction<T, F>(&self, work: F) -> Result<T>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut Transaction<'static, Postgres>) -> TxFuture<'t, T> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to begin transaction: {error}"))
        })?;

        match work(&mut tx).await {
            Ok(value) => tx
                .commit()
                .await
                .map(|()| value)
                .map_err(|error| SwarmError::TransactionError(format!("Commit failed: {error}")))
                .tap_err(|error| warn!(%error, "Transaction commit failed")),
            Err(source) => match tx.rollback().await {
                Ok(()) => Err(source),
                Err(rollback) => Err(SwarmError::RollbackFailed {
                    source: Box::new(source),
                    rollback: rollback.to_string(),
                }),
            },
        }
    }

    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when the probe query fails.
    pub async fn is_healthy(&self) -> Result<bool> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(self.pool())
            .await
            .map(|one| one == 1)
            .map_err(|error| SwarmError::DatabaseError(format!("Health probe failed: {error}")))
    }

    /// Store-wide counters, optionally scoped to one project. Counts run in
    /// parallel on separate pool connections.
    ///
    /// # Errors
    /// Returns [`SwarmError::DatabaseError`] when any count query fails.
    pub async fn get_stats(&self, project_key: Option<&ProjectKey>) -> Result<StoreStats> {
        let (event_count, agent_count, message_count, active_reservation_count, checkpoint_count) =
            futures_util::try_join!(
                self.count_rows("agent_events", project_key),
                self.count_rows("agents", project_key),
                self.count_rows("messages", project_key),
                self.count_active_reservations(project_key),
                self.count_rows("swarm_contexts", project_key),
            )?;

        let latest_sequence = match project_key {
            Some(project) => self.get_latest_sequence(project).await?,
            None => sqlx::query_scalar::<_, Option<i64>>(
                "SELECT MAX(last_sequence) FROM event_sequences",
            )
            .fetch_one(self.pool())
            .await
            .map(|value| value.unwrap_or(0))
            .map_err(|error| {
                SwarmError::DatabaseError(format!("Failed to read latest sequence: {error}"))
            })?,
        };

        Ok(StoreStats {
            project_key: project_key.cloned(),
            event_count,
            latest_sequence,
            agent_count,
            message_count,
            active_reservation_count,
            checkpoint_count,
        })
    }

    async fn count_rows(&self, table: &str, project_key: Option<&ProjectKey>) -> Result<i64> {
        // `table` only ever comes from the fixed list in get_stats.
        let (sql, bound) = match project_key {
            Some(project) => (
                format!("SELECT COUNT(*) FROM {table} WHERE project_key = $1"),
                Some(project.value().to_string()),
            ),
            None => (format!("SELECT COUNT(*) FROM {table}"), None),
        };

        let query = sqlx::query_scalar::<_, i64>(&sql);
        let query = match &bound {
            Some(project) => query.bind(project),
            None => query,
        };

        query.fetch_one(self.pool()).await.map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to count {table}: {error}"))
        })
    }

    async fn count_active_reservations(&self, project_key: Option<&ProjectKey>) -> Result<i64> {
        let query = match project_key {
            Some(project) => sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM file_reservations
                 WHERE project_key = $1 AND released_at IS NULL AND expires_at > NOW()",
            )
            .bind(project.value().to_string()),
            None => sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM file_reservations
                 WHERE released_at IS NULL AND expires_at > NOW()",
            ),
        };

        query.fetch_one(self.pool()).await.map_err(|error| {
            SwarmError::DatabaseError(format!("Failed to count active reservations: {error}"))
        })
    }

    /// Close the pool. Further operations on any clone of this handle fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn resolve_pool_max_connections() -> u32 {
    resolve_pool_max_connections_from(|key| std::env::var(key).ok())
}

fn resolve_pool_max_connections_from<F>(env_lookup: F) -> u32
where
    F: Fn(&str) -> Option<String>,
{
    env_lookup("SWARM_DB_MAX_CONNECTIONS")
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or_else(|| {
            let agent_count = env_lookup("SWARM_MAX_AGENTS")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(12);

            32_u32.max(agent_count.saturating_mul(3))
        })
}

#[cfg(test)]
pub(crate) async fn test_db() -> SwarmDb {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });

    let url = std::env::var("SWARM_TEST_DATABASE_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| {
            unreachable!("Set SWARM_TEST_DATABASE_URL or DATABASE_URL for DB integration tests")
        });

    PgPoolOptions::new()
        .max_connections(16)
        .connect(&url)
        .await
        .map(SwarmDb::new_with_pool)
        .unwrap_or_else(|e| unreachable!("Failed to connect test database: {}", e))
}

#[cfg(test)]
pub(crate) async fn setup_schema(db: &SwarmDb) {
    db.initialize_schema()
        .await
        .unwrap_or_else(|e| unreachable!("failed to initialize schema: {}", e));
}

/// Tests isolate through fresh project keys instead of truncation so the
/// ignored DB suite can run in parallel against one database.
#[cfg(test)]
pub(crate) fn unique_project(prefix: &str) -> ProjectKey {
    ProjectKey::new(format!("{}-{}", prefix, uuid::Uuid::new_v4()))
}
