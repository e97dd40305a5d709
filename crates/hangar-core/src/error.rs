//! Error types for Hangar.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient {resource} on node {node}: requested {requested}, free {free}")]
    InsufficientCapacity {
        node: String,
        resource: &'static str,
        requested: u64,
        free: f64,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the store rejected a write because its view of a record moved on.
    pub fn is_stale_view(&self) -> bool {
        matches!(self, Error::Conflict(_) | Error::InsufficientCapacity { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
