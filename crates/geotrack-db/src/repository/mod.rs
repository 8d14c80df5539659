//! # Repository Module
//!
//! Database repositories for the location pipeline.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Who touches which table                              │
//! │                                                                         │
//! │  SampleSource ──► SampleQueueRepository.enqueue()                      │
//! │                                                                         │
//! │  SyncEngine   ──► SampleQueueRepository                                │
//! │                   ├── select_batch()          pending → in_flight      │
//! │                   ├── mark_delivered()        in_flight → delivered ┐  │
//! │                   ├── mark_failed()           in_flight → failed    ├─►│ sync_cursor
//! │                   ├── record_transport_failure()                    ┘  │ (same tx)
//! │                   └── release_in_flight()     in_flight → pending      │
//! │                                                                         │
//! │  Supervisor   ──► recover_on_startup(), purge_delivered()              │
//! │               ──► ServicePreferencesRepository                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`SampleQueueRepository`](queue::SampleQueueRepository) - Durable Queue
//! - [`SyncCursorRepository`](cursor::SyncCursorRepository) - Delivery watermark
//! - [`ServicePreferencesRepository`](preferences::ServicePreferencesRepository) - Boot restart flags

pub mod cursor;
pub mod preferences;
pub mod queue;

use chrono::{DateTime, Utc};

use crate::error::{DbError, DbResult};

/// Current instant as stored in the database.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Converts a stored epoch-millisecond column back to a timestamp.
pub(crate) fn from_ms(column: &str, ms: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::Corrupt(format!("{column} out of range: {ms}")))
}
