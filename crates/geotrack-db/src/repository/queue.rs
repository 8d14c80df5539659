//! # Sample Queue Repository
//!
//! The Durable Queue: every accepted fix is a row here until it is delivered
//! and old enough to purge.
//!
//! ## Ownership of a Sample
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  enqueue()            INSERT ... RETURNING        (one statement)      │
//! │     │                                                                   │
//! │     ▼                                                                   │
//! │  Pending ◄──────────────────────────────┐                              │
//! │     │                                   │ release_in_flight()          │
//! │     │ select_batch()                    │ recover_on_startup()         │
//! │     │ UPDATE ... WHERE id IN            │ record_transport_failure()   │
//! │     │   (oldest pending LIMIT n)        │   (attempts + 1)             │
//! │     │ RETURNING ...  (one statement)    │                              │
//! │     ▼                                   │                              │
//! │  InFlight ──────────────────────────────┘                              │
//! │     │                                                                   │
//! │     ├── mark_delivered() ──► Delivered ──► purge_delivered()           │
//! │     ├── mark_failed() ─────► Failed(BackendRejection)                  │
//! │     └── budget spent ──────► Failed(RetryExhausted)                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Guarantees
//! - Ids come from `AUTOINCREMENT`: strictly increasing, never reused.
//! - Selection and InFlight marking are one write, so two concurrent
//!   selections can never both see the same sample.
//! - Every state change checks the expected current state in its `WHERE`
//!   clause; a stale id is skipped, not forced.
//! - Terminal transitions and the cursor move in the same transaction.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use geotrack_core::{
    DeliveryState, FailureReason, LocationSample, Position, QueueStats, RetryOutcome, SampleId,
};

use super::{cursor, from_ms, now_ms};
use crate::error::{DbError, DbResult};

const SAMPLE_COLUMNS: &str = "id, captured_at_ms, latitude, longitude, accuracy_m, provider, \
    speed_mps, altitude_m, bearing_deg, delivery_state, attempts, failure_reason, last_error, \
    created_at_ms, updated_at_ms, delivered_at_ms";

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct SampleRow {
    id: i64,
    captured_at_ms: i64,
    latitude: f64,
    longitude: f64,
    accuracy_m: f64,
    provider: Option<String>,
    speed_mps: Option<f64>,
    altitude_m: Option<f64>,
    bearing_deg: Option<f64>,
    delivery_state: DeliveryState,
    attempts: i64,
    failure_reason: Option<FailureReason>,
    last_error: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
    delivered_at_ms: Option<i64>,
}

impl TryFrom<SampleRow> for LocationSample {
    type Error = DbError;

    fn try_from(row: SampleRow) -> DbResult<Self> {
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| DbError::Corrupt(format!("sample {}: attempts {}", row.id, row.attempts)))?;

        Ok(LocationSample {
            id: row.id,
            captured_at: from_ms("captured_at_ms", row.captured_at_ms)?,
            latitude: row.latitude,
            longitude: row.longitude,
            accuracy_m: row.accuracy_m,
            provider: row.provider,
            speed_mps: row.speed_mps,
            altitude_m: row.altitude_m,
            bearing_deg: row.bearing_deg,
            delivery_state: row.delivery_state,
            attempts,
            failure_reason: row.failure_reason,
            last_error: row.last_error,
            created_at: from_ms("created_at_ms", row.created_at_ms)?,
            updated_at: from_ms("updated_at_ms", row.updated_at_ms)?,
            delivered_at: row
                .delivered_at_ms
                .map(|ms| from_ms("delivered_at_ms", ms))
                .transpose()?,
        })
    }
}

fn into_samples(rows: Vec<SampleRow>) -> DbResult<Vec<LocationSample>> {
    rows.into_iter().map(LocationSample::try_from).collect()
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the Durable Queue.
#[derive(Debug, Clone)]
pub struct SampleQueueRepository {
    pool: SqlitePool,
}

impl SampleQueueRepository {
    /// Creates a new SampleQueueRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SampleQueueRepository { pool }
    }

    /// Appends a new Pending sample and returns it with its assigned id.
    ///
    /// A single INSERT: after a crash the row is either fully there or not
    /// there at all.
    pub async fn enqueue(&self, position: &Position) -> DbResult<LocationSample> {
        let now = now_ms();
        let sql = format!(
            r#"
            INSERT INTO location_samples (
                captured_at_ms, latitude, longitude, accuracy_m, provider,
                speed_mps, altitude_m, bearing_deg,
                delivery_state, attempts, created_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', 0, ?9, ?9)
            RETURNING {SAMPLE_COLUMNS}
            "#
        );

        let row: SampleRow = sqlx::query_as(&sql)
            .bind(position.captured_at.timestamp_millis())
            .bind(position.latitude)
            .bind(position.longitude)
            .bind(position.accuracy_m)
            .bind(position.provider.as_deref())
            .bind(position.speed_mps)
            .bind(position.altitude_m)
            .bind(position.bearing_deg)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        debug!(sample_id = row.id, "Sample enqueued");

        row.try_into()
    }

    /// Selects up to `max_size` Pending samples, oldest id first, and marks
    /// them InFlight in the same statement.
    ///
    /// ## Release Rule
    /// A batch is released only when it is worth sending:
    /// - at least `max_size` samples are pending, or
    /// - the oldest pending sample has waited `max_age` or longer.
    ///
    /// `max_age = 0` releases whatever is pending. Returns an empty vec when
    /// nothing is ready.
    pub async fn select_batch(
        &self,
        max_size: u32,
        max_age: Duration,
    ) -> DbResult<Vec<LocationSample>> {
        if max_size == 0 {
            return Ok(Vec::new());
        }

        let (pending, oldest_ms): (i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), MIN(created_at_ms) FROM location_samples WHERE delivery_state = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;

        let Some(oldest_ms) = oldest_ms else {
            return Ok(Vec::new());
        };

        let now = now_ms();
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let full = pending >= i64::from(max_size);
        let aged = now.saturating_sub(oldest_ms) >= max_age_ms;

        if !full && !aged {
            debug!(pending, "Batch not ready yet");
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            UPDATE location_samples SET
                delivery_state = 'in_flight',
                updated_at_ms = ?1
            WHERE id IN (
                SELECT id FROM location_samples
                WHERE delivery_state = 'pending'
                AND id > (SELECT last_delivered_id FROM sync_cursor WHERE id = 1)
                ORDER BY id ASC
                LIMIT ?2
            )
            RETURNING {SAMPLE_COLUMNS}
            "#
        );

        let rows: Vec<SampleRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(i64::from(max_size))
            .fetch_all(&self.pool)
            .await?;

        // RETURNING order is unspecified
        let mut samples = into_samples(rows)?;
        samples.sort_by_key(|s| s.id);

        if let (Some(first), Some(last)) = (samples.first(), samples.last()) {
            debug!(
                count = samples.len(),
                first_id = first.id,
                last_id = last.id,
                "Batch selected"
            );
        }

        Ok(samples)
    }

    /// InFlight → Delivered for each id, then advances the cursor.
    ///
    /// Returns how many samples actually transitioned.
    pub async fn mark_delivered(&self, ids: &[SampleId]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;

        for &id in ids {
            let result = sqlx::query(
                r#"
                UPDATE location_samples SET
                    delivery_state = 'delivered',
                    delivered_at_ms = ?2,
                    updated_at_ms = ?2,
                    last_error = NULL
                WHERE id = ?1 AND delivery_state = 'in_flight'
                "#,
            )
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                warn!(sample_id = id, "Not in flight, delivery not recorded");
            }
            changed += result.rows_affected();
        }

        let cursor = cursor::advance(&mut tx).await?;
        tx.commit().await?;

        debug!(count = changed, cursor, "Samples delivered");
        Ok(changed)
    }

    /// InFlight → Failed with `reason`, then advances the cursor.
    ///
    /// `detail` is the backend's explanation, kept in `last_error`.
    pub async fn mark_failed(
        &self,
        ids: &[SampleId],
        reason: FailureReason,
        detail: Option<&str>,
    ) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;

        for &id in ids {
            let result = sqlx::query(
                r#"
                UPDATE location_samples SET
                    delivery_state = 'failed',
                    failure_reason = ?2,
                    last_error = COALESCE(?3, last_error),
                    updated_at_ms = ?4
                WHERE id = ?1 AND delivery_state = 'in_flight'
                "#,
            )
            .bind(id)
            .bind(reason)
            .bind(detail)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 0 {
                warn!(sample_id = id, %reason, "Not in flight, failure not recorded");
            }
            changed += result.rows_affected();
        }

        cursor::advance(&mut tx).await?;
        tx.commit().await?;

        warn!(count = changed, %reason, "Samples marked failed");
        Ok(changed)
    }

    /// Returns InFlight samples to Pending after a failed attempt, counting
    /// the attempt. Samples whose count reaches `max_attempts` become
    /// `Failed(RetryExhausted)` instead.
    pub async fn record_transport_failure(
        &self,
        ids: &[SampleId],
        error: &str,
        max_attempts: u32,
    ) -> DbResult<RetryOutcome> {
        let mut outcome = RetryOutcome::default();
        if ids.is_empty() {
            return Ok(outcome);
        }

        let now = now_ms();
        let max_attempts = i64::from(max_attempts.max(1));
        let mut tx = self.pool.begin().await?;

        for &id in ids {
            let updated: Option<(i64, DeliveryState)> = sqlx::query_as(
                r#"
                UPDATE location_samples SET
                    attempts = attempts + 1,
                    last_error = ?2,
                    updated_at_ms = ?3,
                    delivery_state = CASE
                        WHEN attempts + 1 >= ?4 THEN 'failed'
                        ELSE 'pending'
                    END,
                    failure_reason = CASE
                        WHEN attempts + 1 >= ?4 THEN 'retry_exhausted'
                        ELSE failure_reason
                    END
                WHERE id = ?1 AND delivery_state = 'in_flight'
                RETURNING id, delivery_state
                "#,
            )
            .bind(id)
            .bind(error)
            .bind(now)
            .bind(max_attempts)
            .fetch_optional(&mut *tx)
            .await?;

            match updated {
                Some((id, DeliveryState::Failed)) => outcome.exhausted.push(id),
                Some((id, _)) => outcome.requeued.push(id),
                None => warn!(sample_id = id, "Not in flight, failure not counted"),
            }
        }

        if !outcome.exhausted.is_empty() {
            cursor::advance(&mut tx).await?;
        }
        tx.commit().await?;

        if !outcome.exhausted.is_empty() {
            warn!(
                count = outcome.exhausted.len(),
                first_id = outcome.exhausted[0],
                "Retry budget exhausted"
            );
        }
        debug!(count = outcome.requeued.len(), "Samples requeued");

        Ok(outcome)
    }

    /// Returns InFlight samples to Pending without counting an attempt.
    ///
    /// Used when the cycle failed for a reason that is not the samples'
    /// fault (account revoked, local storage error).
    pub async fn release_in_flight(&self, ids: &[SampleId]) -> DbResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let now = now_ms();
        let mut tx = self.pool.begin().await?;
        let mut changed = 0;

        for &id in ids {
            let result = sqlx::query(
                "UPDATE location_samples SET delivery_state = 'pending', updated_at_ms = ?2 \
                 WHERE id = ?1 AND delivery_state = 'in_flight'",
            )
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            changed += result.rows_affected();
        }

        tx.commit().await?;

        debug!(count = changed, "In-flight samples released");
        Ok(changed)
    }

    /// Resets every sample left InFlight by a previous process to Pending.
    ///
    /// Call once at startup, before the first sync cycle.
    pub async fn recover_on_startup(&self) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE location_samples SET delivery_state = 'pending', updated_at_ms = ?1 \
             WHERE delivery_state = 'in_flight'",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            info!(count = recovered, "Recovered in-flight samples from previous run");
        }
        Ok(recovered)
    }

    /// Deletes Delivered samples enqueued more than `older_than` ago.
    pub async fn purge_delivered(&self, older_than: Duration) -> DbResult<u64> {
        let horizon = chrono::Duration::from_std(older_than)
            .map_err(|e| DbError::Internal(format!("retention horizon: {e}")))?;
        let cutoff = Utc::now() - horizon;
        self.purge_delivered_before(cutoff).await
    }

    /// Deletes Delivered samples enqueued strictly before `cutoff`.
    ///
    /// Pending, InFlight and Failed samples are never touched.
    pub async fn purge_delivered_before(&self, cutoff: chrono::DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM location_samples WHERE delivery_state = 'delivered' AND created_at_ms < ?1",
        )
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!(count = purged, "Purged delivered samples");
        }
        Ok(purged)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Gets one sample by id.
    pub async fn get(&self, id: SampleId) -> DbResult<LocationSample> {
        let sql = format!("SELECT {SAMPLE_COLUMNS} FROM location_samples WHERE id = ?1");

        let row: Option<SampleRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or_else(|| DbError::not_found("Sample", id))?
            .try_into()
    }

    /// Counts samples per delivery state.
    pub async fn stats(&self) -> DbResult<QueueStats> {
        let rows: Vec<(DeliveryState, i64)> = sqlx::query_as(
            "SELECT delivery_state, COUNT(*) FROM location_samples GROUP BY delivery_state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (state, count) in rows {
            match state {
                DeliveryState::Pending => stats.pending = count,
                DeliveryState::InFlight => stats.in_flight = count,
                DeliveryState::Delivered => stats.delivered = count,
                DeliveryState::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    /// Number of samples waiting for a cycle.
    pub async fn count_pending(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM location_samples WHERE delivery_state = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// Failed samples, newest first, for inspection.
    pub async fn list_failed(&self, limit: u32) -> DbResult<Vec<LocationSample>> {
        let sql = format!(
            "SELECT {SAMPLE_COLUMNS} FROM location_samples WHERE delivery_state = 'failed' \
             ORDER BY id DESC LIMIT ?1"
        );

        let rows: Vec<SampleRow> = sqlx::query_as(&sql)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        into_samples(rows)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
