//! # Queue Store Handle
//!
//! Opens the SQLite file behind the Durable Queue and hands out repositories.
//!
//! ```text
//!   DbConfig ──► Database::new ──► connect_options() + pool_options()
//!                      │                     │
//!                      │                     ▼
//!                      │            SqlitePool (WAL, busy_timeout)
//!                      ▼
//!              migrations::run_migrations (optional)
//!                      │
//!        ┌─────────────┼──────────────────┐
//!        ▼             ▼                  ▼
//!    samples()      cursor()        preferences()
//! ```
//!
//! A committed enqueue is on disk when the call returns: the default
//! configuration runs WAL with `synchronous = FULL`. SQLite admits one writer
//! at a time, so the pool size only affects concurrent readers.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::cursor::SyncCursorRepository;
use crate::repository::preferences::ServicePreferencesRepository;
use crate::repository::queue::SampleQueueRepository;

const IN_MEMORY: &str = ":memory:";

/// How to open the queue store.
///
/// ```rust,ignore
/// let config = DbConfig::new(data_dir.join("geotrack.db")).busy_timeout(Duration::from_secs(2));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite file, created on first open. `:memory:` for a throwaway store.
    pub database_path: PathBuf,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Longest wait for a free connection before `PoolExhausted`.
    pub connect_timeout: Duration,
    /// `None` keeps connections open for the life of the pool.
    pub idle_timeout: Option<Duration>,
    /// Longest wait on SQLite's write lock.
    pub busy_timeout: Duration,
    /// `synchronous = FULL` when set, `NORMAL` otherwise.
    pub durable: bool,
    pub run_migrations: bool,
}

impl DbConfig {
    /// File-backed store with durable writes.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 4,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            busy_timeout: Duration::from_secs(5),
            durable: true,
            run_migrations: true,
        }
    }

    /// Private in-memory store for tests.
    ///
    /// Pinned to one connection that never idles out, since the data vanishes
    /// with the connection that created it.
    pub fn in_memory() -> Self {
        DbConfig {
            max_connections: 1,
            connect_timeout: Duration::from_secs(5),
            idle_timeout: None,
            durable: false,
            ..DbConfig::new(IN_MEMORY)
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    fn synchronous(&self) -> SqliteSynchronous {
        if self.durable {
            SqliteSynchronous::Full
        } else {
            SqliteSynchronous::Normal
        }
    }

    fn connect_options(&self) -> DbResult<SqliteConnectOptions> {
        let url = format!("sqlite://{}?mode=rwc", self.database_path.display());
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| DbError::ConnectionFailed(format!("{url}: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(self.synchronous())
            .busy_timeout(self.busy_timeout)
            .foreign_keys(true);
        Ok(options)
    }

    fn pool_options(&self) -> SqlitePoolOptions {
        let options = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections.min(self.max_connections))
            .acquire_timeout(self.connect_timeout)
            .idle_timeout(self.idle_timeout);
        match self.idle_timeout {
            Some(_) => options,
            None => options.max_lifetime(None::<Duration>),
        }
    }
}

/// Shared handle to the queue store. Clones share one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the store and, unless disabled, brings the schema up to date.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(path = %config.database_path.display(), durable = config.durable, "Opening queue store");

        let pool = config
            .pool_options()
            .connect_with(config.connect_options()?)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
        debug!(
            max = config.max_connections,
            min = config.min_connections,
            "Connection pool ready"
        );

        let db = Database { pool };
        if config.run_migrations {
            db.run_migrations().await?;
        }
        Ok(db)
    }

    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The Durable Queue itself.
    pub fn samples(&self) -> SampleQueueRepository {
        SampleQueueRepository::new(self.pool.clone())
    }

    pub fn cursor(&self) -> SyncCursorRepository {
        SyncCursorRepository::new(self.pool.clone())
    }

    pub fn preferences(&self) -> ServicePreferencesRepository {
        ServicePreferencesRepository::new(self.pool.clone())
    }

    /// Waits for checked-out connections and closes the pool. Every
    /// repository call made afterwards fails with `ConnectionFailed`.
    pub async fn close(&self) {
        debug!("Closing queue store");
        self.pool.close().await;
    }

    /// Round-trips a trivial statement.
    pub async fn health_check(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_is_migrated() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        assert!(db.health_check().await);

        let (total, applied) = migrations::migration_status(db.pool()).await.unwrap();
        assert!(total > 0);
        assert_eq!(total, applied);
    }

    #[test]
    fn test_memory_config_keeps_one_connection() {
        let config = DbConfig::in_memory();
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.idle_timeout, None);
        assert!(!config.durable);
        assert_eq!(config.database_path, PathBuf::from(":memory:"));
    }

    #[test]
    fn test_durability_maps_to_synchronous_mode() {
        let durable = DbConfig::new("/tmp/queue.db");
        assert!(matches!(durable.synchronous(), SqliteSynchronous::Full));

        let relaxed = DbConfig::new("/tmp/queue.db").durable(false).max_connections(2);
        assert!(matches!(relaxed.synchronous(), SqliteSynchronous::Normal));
        assert_eq!(relaxed.max_connections, 2);
    }

    #[tokio::test]
    async fn test_closed_store_is_unhealthy() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.close().await;
        assert!(!db.health_check().await);
        assert!(db.samples().count_pending().await.is_err());
    }
}
