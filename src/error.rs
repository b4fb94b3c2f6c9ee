// src/error.rs
// Crate-wide error taxonomy shared by intake, storage, the executor and the API.

use thiserror::Error;

/// Errors a pool operation can surface.
///
/// `Validation` rejects bad submissions before anything is persisted,
/// `NotFound` covers lookups with unknown ids, `Dispatch` wraps outbound
/// HTTP failures captured per transaction, and `Persistence` wraps storage
/// faults from either backend.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

impl From<rusqlite::Error> for PoolError {
    fn from(e: rusqlite::Error) -> Self {
        PoolError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(e: serde_json::Error) -> Self {
        PoolError::Persistence(format!("json (de)serialization failed: {}", e))
    }
}
