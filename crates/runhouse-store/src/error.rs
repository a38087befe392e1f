//! Store Error Types
//!
//! Every backend returns `Result<T>` aliased to `Result<T, StoreError>` so
//! `?` propagates cleanly across backends.
//!
//! ## Error Categories
//!
//! - `NotFound`: no document for the requested uid / datum id
//! - `Malformed`: a line or page failed to parse as the expected structure
//! - `Database`: the underlying SQLite operation failed
//! - `Io`: file system failure in the append-log backend
//! - `Misconfigured`: connection string or path pattern is unusable

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no {kind} with id {id:?}")]
    NotFound { kind: &'static str, id: String },

    #[error("malformed document: {0}")]
    Malformed(#[from] runhouse_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("misconfigured store: {0}")]
    Misconfigured(String),
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> StoreError {
        StoreError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::Migration(e.to_string())
    }
}
