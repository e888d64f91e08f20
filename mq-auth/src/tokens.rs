//! Access-token issuance and verification.
//!
//! Access tokens are HS256 JWTs signed with a symmetric secret held in
//! configuration. Rotation keeps the previous secret valid for one
//! token lifetime: verification tries the current secret, then the
//! previous one. Refresh tokens are opaque 32-byte random values; only
//! their SHA-256 hashes are persisted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use mq_core::types::{Role, TenantId, UserId};

use crate::error::{AuthError, AuthResult};

/// JWT claim set carried by access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Tenant id.
    pub tenant: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
    /// Token id; unique per issued token.
    pub jti: String,
}

impl Claims {
    pub fn user_id(&self) -> UserId {
        UserId::new(self.sub.clone())
    }

    pub fn tenant_id(&self) -> TenantId {
        TenantId::new(self.tenant.clone())
    }
}

/// SHA-256 hex of a token; the session table stores hashes only.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Opaque URL-safe refresh token.
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Signs and verifies access tokens.
#[derive(Clone)]
pub struct TokenSigner {
    secret: String,
    previous_secret: Option<String>,
    access_ttl_secs: i64,
}

impl TokenSigner {
    pub fn new(secret: impl Into<String>, previous_secret: Option<String>, access_ttl_secs: i64) -> Self {
        Self {
            secret: secret.into(),
            previous_secret,
            access_ttl_secs,
        }
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl_secs
    }

    /// Issue an access token for a user.
    pub fn issue(
        &self,
        tenant: &TenantId,
        user: &UserId,
        role: Role,
        now: DateTime<Utc>,
    ) -> AuthResult<(String, Claims)> {
        let claims = Claims {
            sub: user.as_str().to_string(),
            tenant: tenant.as_str().to_string(),
            role,
            iat: now.timestamp(),
            exp: now.timestamp() + self.access_ttl_secs,
            jti: Uuid::new_v4().to_string(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AuthError::Hash(e.to_string()))?;
        Ok((token, claims))
    }

    /// Verify signature and expiry. Tries the current secret first,
    /// then the previous one (rotation window).
    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        match self.verify_with(token, &self.secret) {
            Err(AuthError::TokenInvalid(_)) if self.previous_secret.is_some() => {
                let previous = self.previous_secret.as_ref().unwrap();
                self.verify_with(token, previous)
            }
            other => other,
        }
    }

    fn verify_with(&self, token: &str, secret: &str) -> AuthResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        match decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        ) {
            Ok(data) => Ok(data.claims),
            Err(err) => match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(AuthError::TokenExpired),
                _ => Err(AuthError::TokenInvalid(err.to_string())),
            },
        }
    }
}
