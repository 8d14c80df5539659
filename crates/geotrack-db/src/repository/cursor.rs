//! # Sync Cursor Repository
//!
//! The cursor is a low watermark: every sample with `id <= last_delivered_id`
//! is terminal, and `last_delivered_id` itself was delivered. On restart the
//! queue never has to look below it.
//!
//! ```text
//!   id:     1   2   3   4   5   6   7
//!   state:  D   D   F   D   P   D   P
//!                       ▲
//!                       cursor = 4  (5 is still pending, 6 can't count yet)
//! ```
//!
//! The cursor only moves inside the transaction that made samples terminal,
//! so it can never point past a sample that is still owed a delivery.

use sqlx::{SqliteConnection, SqlitePool};

use geotrack_core::SyncCursor;

use super::{from_ms, now_ms};
use crate::error::DbResult;

/// Repository for the delivery watermark.
#[derive(Debug, Clone)]
pub struct SyncCursorRepository {
    pool: SqlitePool,
}

impl SyncCursorRepository {
    /// Creates a new SyncCursorRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncCursorRepository { pool }
    }

    /// Reads the persisted cursor.
    pub async fn get(&self) -> DbResult<SyncCursor> {
        let (last_delivered_id, updated_at_ms): (i64, i64) = sqlx::query_as(
            "SELECT last_delivered_id, updated_at_ms FROM sync_cursor WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(SyncCursor {
            last_delivered_id,
            updated_at: from_ms("sync_cursor.updated_at_ms", updated_at_ms)?,
        })
    }
}

/// Moves the watermark up to the highest delivered id that has no
/// non-terminal sample below it. Never moves it down.
///
/// Must run on the connection of the transaction that changed sample states.
pub(crate) async fn advance(conn: &mut SqliteConnection) -> DbResult<i64> {
    let (last_delivered_id,): (i64,) = sqlx::query_as(
        r#"
        UPDATE sync_cursor SET
            last_delivered_id = MAX(
                last_delivered_id,
                COALESCE((
                    SELECT MAX(id) FROM location_samples
                    WHERE delivery_state = 'delivered'
                    AND id < COALESCE((
                        SELECT MIN(id) FROM location_samples
                        WHERE delivery_state IN ('pending', 'in_flight')
                    ), 9223372036854775807)
                ), 0)
            ),
            updated_at_ms = ?1
        WHERE id = 1
        RETURNING last_delivered_id
        "#,
    )
    .bind(now_ms())
    .fetch_one(&mut *conn)
    .await?;

    Ok(last_delivered_id)
}
