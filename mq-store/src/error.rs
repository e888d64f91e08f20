//! Store error types.
//!
//! Transient driver errors are retried with jittered backoff by the
//! sharded front-end; constraint violations surface as distinct
//! variants and are never retried.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("idempotency key {key} already consumed with a different payload")]
    IdempotencyMismatch { key: String },

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("schema version {found} does not match expected {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("transient store error: {0}")]
    Transient(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Only transient errors are safe to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
