//! Error types for the PostgreSQL task store.

use sqlx_core::error::Error as SqlxError;
use taskhub_storage::StorageError;

/// PostgreSQL error code for unique constraint violation (23505).
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// Checks if a sqlx error has a specific PostgreSQL error code.
pub fn has_pg_error_code(err: &SqlxError, code: &str) -> bool {
    if let SqlxError::Database(db_err) = err {
        db_err.code().as_deref() == Some(code)
    } else {
        false
    }
}

/// Maps a query error onto the storage taxonomy.
pub fn storage_error(err: SqlxError) -> StorageError {
    if has_pg_error_code(&err, PG_UNIQUE_VIOLATION) {
        return StorageError::already_exists(err.to_string());
    }
    match err {
        SqlxError::PoolTimedOut | SqlxError::PoolClosed | SqlxError::Io(_) => {
            StorageError::connection_error(err.to_string())
        }
        other => StorageError::internal(other.to_string()),
    }
}

/// Errors specific to the PostgreSQL task store.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(#[from] SqlxError),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),
}

impl From<PostgresError> for StorageError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Connection(e) => StorageError::connection_error(e.to_string()),
            PostgresError::Migration(e) => StorageError::internal(format!("Migration error: {e}")),
        }
    }
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;
