//! # Storage Errors
//!
//! Everything the queue store can fail with. The pipeline treats any
//! [`DbError`] as a persistence failure: the current cycle gives its batch
//! back and the next cycle tries again. A storage error never drops a sample.
//!
//! ```text
//!   sqlx::Error / MigrateError
//!            │  From impls below
//!            ▼
//!        DbError ──────────► SyncError::Persistence (geotrack-sync)
//!                                   │
//!                                   ▼
//!                      batch released, status.last_error set
//! ```

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// A lookup by id found nothing, usually because the row was purged.
    #[error("no {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// A row with the same key already exists (`column` as SQLite names it).
    #[error("{column} already taken")]
    UniqueViolation { column: String },

    /// The database file could not be opened or the pool is gone.
    #[error("cannot open queue store: {0}")]
    ConnectionFailed(String),

    /// The embedded schema could not be applied. Also raised when the file
    /// was written by a newer build with migrations this one lacks.
    #[error("schema migration failed: {0}")]
    MigrationFailed(String),

    /// SQLite rejected a statement (locked database, constraint, disk full).
    #[error("statement failed: {0}")]
    QueryFailed(String),

    /// A stored value does not map back to a domain type.
    #[error("corrupt queue row: {0}")]
    Corrupt(String),

    /// No connection became free within the acquire timeout.
    #[error("timed out waiting for a database connection")]
    PoolExhausted,

    #[error("storage error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("row", "?"),
            sqlx::Error::Database(db_err) => {
                let message = db_err.message();
                match message.strip_prefix("UNIQUE constraint failed: ") {
                    Some(column) => DbError::UniqueViolation {
                        column: column.to_string(),
                    },
                    None => DbError::QueryFailed(message.to_string()),
                }
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::Corrupt(format!("column {index}: {source}"))
            }
            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool closed".into()),
            sqlx::Error::Io(io) => DbError::ConnectionFailed(io.to_string()),
            other => DbError::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;
