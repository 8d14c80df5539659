//! # geotrack-db: Durable Queue for the Location Pipeline
//!
//! Every captured sample lands here before anything tries to send it, so a
//! process kill between capture and delivery never loses data.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Location Pipeline Data Flow                      │
//! │                                                                         │
//! │  SampleSource ──enqueue──┐            ┌──select/mark── SyncEngine       │
//! │                          ▼            ▼                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   geotrack-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────────┐  ┌────────────┐  │   │
//! │  │   │   Database    │    │    Repositories    │  │ Migrations │  │   │
//! │  │   │   (pool.rs)   │    │                    │  │ (embedded) │  │   │
//! │  │   │               │    │ SampleQueueRepo    │  │            │  │   │
//! │  │   │ SqlitePool    │◄───│ SyncCursorRepo     │  │ 001_init   │  │   │
//! │  │   │ WAL journal   │    │ ServicePrefsRepo   │  │            │  │   │
//! │  │   └───────────────┘    └────────────────────┘  └────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   <data dir>/geotrack/geotrack.db                               │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Queue, cursor and preferences repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use geotrack_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/geotrack.db")).await?;
//! db.samples().recover_on_startup().await?;
//!
//! let sample = db.samples().enqueue(&position).await?;
//! let batch = db.samples().select_batch(50, Duration::from_secs(60)).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::cursor::SyncCursorRepository;
pub use repository::preferences::{ServicePreferences, ServicePreferencesRepository};
pub use repository::queue::SampleQueueRepository;
