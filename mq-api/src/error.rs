//! API error mapping.
//!
//! User-visible messages are short and never reveal internal state;
//! the full error is logged with the authenticated subject where one
//! exists.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use mq_auth::AuthError;
use mq_engine::EngineError;
use mq_store::StoreError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("service unavailable")]
    Unavailable,

    #[error("internal error")]
    Internal(String),
}

/// Error response body.
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, retry_after) = match &self {
            ApiError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone(), None)
            }
            ApiError::Unauthenticated => (
                StatusCode::UNAUTHORIZED,
                "UNAUTHENTICATED",
                "authentication required".to_string(),
                None,
            ),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "FORBIDDEN",
                "insufficient permissions".to_string(),
                None,
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone(), None),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone(), None),
            ApiError::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMITED",
                "rate limit exceeded".to_string(),
                Some(*retry_after_secs),
            ),
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "UNAVAILABLE",
                "temporarily unavailable".to_string(),
                Some(1),
            ),
            ApiError::Internal(detail) => {
                tracing::error!(detail, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "internal error".to_string(),
                    None,
                )
            }
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }
        response
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(msg) => ApiError::BadRequest(msg),
            EngineError::Unauthenticated(_) => ApiError::Unauthenticated,
            EngineError::Forbidden(_) => ApiError::Forbidden,
            EngineError::NotFound(msg) => ApiError::NotFound(msg),
            EngineError::Conflict(msg) => ApiError::Conflict(msg),
            EngineError::RateLimited { retry_after_secs } => {
                ApiError::RateLimited { retry_after_secs }
            }
            EngineError::Busy | EngineError::Transient(_) => ApiError::Unavailable,
            EngineError::Internal(detail) => ApiError::Internal(detail),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Validation(msg) | AuthError::WeakPassword(msg) => {
                ApiError::BadRequest(msg)
            }
            AuthError::Locked { until } => ApiError::RateLimited {
                retry_after_secs: (until - chrono::Utc::now()).num_seconds().max(0) as u64,
            },
            AuthError::NotFound(msg) => ApiError::NotFound(msg),
            AuthError::AlreadyExists(msg) => ApiError::Conflict(msg),
            AuthError::Store(err) => err.into(),
            AuthError::Hash(detail) => ApiError::Internal(detail),
            // All remaining auth failures are opaque 401s.
            _ => ApiError::Unauthenticated,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => ApiError::NotFound(msg),
            StoreError::AlreadyExists(msg) => ApiError::Conflict(msg),
            StoreError::VersionConflict { .. } => {
                ApiError::Conflict("concurrent update".to_string())
            }
            StoreError::IdempotencyMismatch { key } => {
                ApiError::Conflict(format!("idempotency key {key} reused"))
            }
            StoreError::Constraint(msg) => ApiError::BadRequest(msg),
            StoreError::Transient(_) => ApiError::Unavailable,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
