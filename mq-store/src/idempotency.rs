//! Idempotency records: `(tenant, user, key)` → request hash and the
//! stored response.
//!
//! A retried submission with the same key and payload is served the
//! stored response unchanged; the same key with a different payload is
//! a conflict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One consumed idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    /// SHA-256 hex of the canonicalized request body.
    pub request_hash: String,
    /// The exact response body served for this key.
    pub response: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(
        key: impl Into<String>,
        request_hash: impl Into<String>,
        response: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.into(),
            request_hash: request_hash.into(),
            response,
            created_at: now,
        }
    }

    pub fn matches_request(&self, request_hash: &str) -> bool {
        self.request_hash == request_hash
    }
}

/// Hash a request body for idempotency comparison.
///
/// `serde_json::Value` serializes maps in key order, so equal payloads
/// hash equally regardless of field order on the wire.
pub fn request_hash(body: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(body).unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_hash_is_field_order_independent() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"amount": 100, "store": "X"}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"store": "X", "amount": 100}"#).unwrap();
        assert_eq!(request_hash(&a), request_hash(&b));
    }

    #[test]
    fn test_request_hash_detects_payload_change() {
        assert_ne!(
            request_hash(&json!({"amount": 100})),
            request_hash(&json!({"amount": 101}))
        );
    }

    #[test]
    fn test_record_match() {
        let body = json!({"amount": 100});
        let record = IdempotencyRecord::new("k1", request_hash(&body), json!({}), Utc::now());
        assert!(record.matches_request(&request_hash(&body)));
        assert!(!record.matches_request("different"));
    }
}
