//! Auth error types.
//!
//! `InvalidCredentials` covers both unknown users and wrong passwords;
//! responses never disclose whether an account exists.

use chrono::{DateTime, Utc};
use thiserror::Error;

use mq_store::StoreError;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("password does not meet requirements: {0}")]
    WeakPassword(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("multi-factor code required")]
    MfaRequired,

    #[error("invalid multi-factor code")]
    MfaInvalid,

    #[error("account locked until {until}")]
    Locked { until: DateTime<Utc> },

    #[error("invalid token: {0}")]
    TokenInvalid(String),

    #[error("token expired")]
    TokenExpired,

    #[error("token revoked")]
    TokenRevoked,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("hashing failure: {0}")]
    Hash(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Whether this error maps to 401 rather than 400/423/5xx.
    pub fn is_unauthenticated(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredentials
                | AuthError::MfaRequired
                | AuthError::MfaInvalid
                | AuthError::TokenInvalid(_)
                | AuthError::TokenExpired
                | AuthError::TokenRevoked
        )
    }
}

pub type AuthResult<T> = Result<T, AuthError>;
