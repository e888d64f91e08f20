//! Engine error taxonomy, aligned with the transport status mapping:
//! Validation → 400, Unauthenticated → 401, Forbidden → 403,
//! NotFound → 404, Conflict → 409, RateLimited → 429,
//! Busy/Transient → 503, Internal → 500.

use thiserror::Error;

use mq_auth::AuthError;
use mq_core::CoreError;
use mq_store::StoreError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthenticated")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("busy")]
    Busy,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::AlreadyExists(what) => EngineError::Conflict(what),
            StoreError::VersionConflict { .. } => {
                EngineError::Conflict("concurrent update".to_string())
            }
            StoreError::IdempotencyMismatch { key } => EngineError::Conflict(format!(
                "idempotency key {key} was used with a different payload"
            )),
            StoreError::Constraint(what) => EngineError::Validation(what),
            StoreError::SchemaMismatch { .. } => EngineError::Internal(err.to_string()),
            StoreError::Transient(what) => EngineError::Transient(what),
            StoreError::Serialization(what) => EngineError::Internal(what),
        }
    }
}

impl From<AuthError> for EngineError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Locked { until } => {
                let retry = (until - chrono::Utc::now()).num_seconds().max(0) as u64;
                EngineError::RateLimited {
                    retry_after_secs: retry,
                }
            }
            AuthError::Validation(what) | AuthError::WeakPassword(what) => {
                EngineError::Validation(what)
            }
            AuthError::NotFound(what) => EngineError::NotFound(what),
            AuthError::AlreadyExists(what) => EngineError::Conflict(what),
            AuthError::Store(err) => err.into(),
            AuthError::Hash(what) => EngineError::Internal(what),
            other => EngineError::Unauthenticated(other.to_string()),
        }
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Validation(what) => EngineError::Validation(what),
            CoreError::InvalidStateTransition(what) => EngineError::Conflict(what),
            CoreError::InvalidPolicy(what) => EngineError::Internal(format!("policy: {what}")),
            CoreError::Serialization(err) => EngineError::Internal(err.to_string()),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
