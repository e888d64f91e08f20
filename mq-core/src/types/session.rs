//! Live authenticated sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::{SessionId, TenantId, UserId};

/// One issued token pair. Lookup is by `token_hash` (SHA-256 of the
/// access token); revocation is final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    /// SHA-256 hex of the access token.
    pub token_hash: String,
    /// SHA-256 hex of the paired refresh token.
    pub refresh_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Refresh-token expiry; the session row lives until this passes.
    pub refresh_expires_at: DateTime<Utc>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub revoked: bool,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_expires_at
    }
}
