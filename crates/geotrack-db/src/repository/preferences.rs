//! # Service Preferences Repository
//!
//! Two flags that outlive the process and decide whether tracking comes back
//! by itself after a reboot:
//!
//! | Flag | Set by | Cleared by |
//! |------|--------|------------|
//! | `service_running` | starting tracking | explicit user stop |
//! | `auto_start_enabled` | configuration / user | configuration / user |
//!
//! A crash or a plain process shutdown leaves `service_running` as it was,
//! which is exactly what makes the boot restart work.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use super::{from_ms, now_ms};
use crate::error::DbResult;

/// Persisted service flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServicePreferences {
    pub service_running: bool,
    pub auto_start_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl ServicePreferences {
    /// Tracking should resume on boot only when it was running and the user
    /// allows automatic start.
    pub fn should_resume_on_boot(&self) -> bool {
        self.service_running && self.auto_start_enabled
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ServicePreferencesRow {
    service_running: bool,
    auto_start_enabled: bool,
    updated_at_ms: i64,
}

/// Repository for the service preference flags.
#[derive(Debug, Clone)]
pub struct ServicePreferencesRepository {
    pool: SqlitePool,
}

impl ServicePreferencesRepository {
    /// Creates a new ServicePreferencesRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ServicePreferencesRepository { pool }
    }

    /// Reads the current flags.
    pub async fn get(&self) -> DbResult<ServicePreferences> {
        let row: ServicePreferencesRow = sqlx::query_as(
            "SELECT service_running, auto_start_enabled, updated_at_ms FROM service_preferences WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ServicePreferences {
            service_running: row.service_running,
            auto_start_enabled: row.auto_start_enabled,
            updated_at: from_ms("service_preferences.updated_at_ms", row.updated_at_ms)?,
        })
    }

    /// Records whether tracking is (supposed to be) running.
    pub async fn set_service_running(&self, running: bool) -> DbResult<()> {
        debug!(running, "Persisting service_running");

        sqlx::query("UPDATE service_preferences SET service_running = ?1, updated_at_ms = ?2 WHERE id = 1")
            .bind(running)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Enables or disables automatic start on boot.
    pub async fn set_auto_start(&self, enabled: bool) -> DbResult<()> {
        debug!(enabled, "Persisting auto_start_enabled");

        sqlx::query("UPDATE service_preferences SET auto_start_enabled = ?1, updated_at_ms = ?2 WHERE id = 1")
            .bind(enabled)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Resets both flags to their defaults (not running, auto start on).
    pub async fn clear(&self) -> DbResult<()> {
        sqlx::query(
            "UPDATE service_preferences SET service_running = 0, auto_start_enabled = 1, updated_at_ms = ?1 WHERE id = 1",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Database, DbConfig};

    #[tokio::test]
    async fn test_defaults_do_not_resume() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let prefs = db.preferences().get().await.unwrap();

        assert!(!prefs.service_running);
        assert!(prefs.auto_start_enabled);
        assert!(!prefs.should_resume_on_boot());
    }

    #[tokio::test]
    async fn test_resume_requires_both_flags() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.preferences();

        repo.set_service_running(true).await.unwrap();
        assert!(repo.get().await.unwrap().should_resume_on_boot());

        repo.set_auto_start(false).await.unwrap();
        assert!(!repo.get().await.unwrap().should_resume_on_boot());

        repo.clear().await.unwrap();
        let prefs = repo.get().await.unwrap();
        assert!(!prefs.service_running);
        assert!(prefs.auto_start_enabled);
    }
}
