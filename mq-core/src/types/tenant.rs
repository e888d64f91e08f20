//! Tenant (mall) records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::TenantId;
use crate::policy::TenantPolicy;

/// A mall instance. The host domain is unique and maps
/// deterministically to exactly one tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    /// Host domain used to route inbound requests.
    pub host: String,
    /// Branding blob forwarded to clients untouched.
    #[serde(default)]
    pub branding: serde_json::Value,
    /// Policy in force. Receipts persist the reward snapshot they were
    /// computed with, so policy edits never rewrite history.
    pub policy: TenantPolicy,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(
        id: TenantId,
        name: impl Into<String>,
        host: impl Into<String>,
        policy: TenantPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            host: host.into(),
            branding: serde_json::Value::Null,
            policy,
            created_at: now,
        }
    }
}
