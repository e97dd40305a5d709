//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid stored value: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<DbError> for hangar_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => hangar_core::Error::NotFound(what),
            DbError::Duplicate(what) => hangar_core::Error::Conflict(what),
            other => hangar_core::Error::Storage(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
