//! Tenant-scoped temporal multiplier windows.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::common::{EventId, TenantId, VipTier};
use super::user::User;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    FlashSale,
    HappyHour,
    Seasonal,
}

/// Who and what an event applies to. Empty constraints match everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEligibility {
    /// Restrict to these receipt categories when non-empty.
    #[serde(default)]
    pub categories: BTreeSet<String>,
    /// Minimum VIP tier, if any.
    #[serde(default)]
    pub min_vip: Option<VipTier>,
}

/// A multiplier window. Overlapping events compose multiplicatively up
/// to the policy cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MallEvent {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub kind: EventKind,
    pub name: String,
    pub multiplier: Decimal,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub eligibility: EventEligibility,
}

impl MallEvent {
    pub fn new(
        tenant_id: TenantId,
        kind: EventKind,
        name: impl Into<String>,
        multiplier: Decimal,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> CoreResult<Self> {
        if ends_at <= starts_at {
            return Err(CoreError::Validation(
                "event must end after it starts".to_string(),
            ));
        }
        if multiplier <= Decimal::ZERO {
            return Err(CoreError::Validation(
                "event multiplier must be positive".to_string(),
            ));
        }
        Ok(Self {
            id: EventId::generate(),
            tenant_id,
            kind,
            name: name.into(),
            multiplier,
            starts_at,
            ends_at,
            eligibility: EventEligibility::default(),
        })
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now >= self.starts_at && now < self.ends_at
    }

    /// Whether this event's multiplier applies to the given receipt.
    pub fn eligible(&self, user: &User, category: &str) -> bool {
        if !self.eligibility.categories.is_empty()
            && !self.eligibility.categories.contains(category)
        {
            return false;
        }
        if let Some(min) = self.eligibility.min_vip {
            if user.vip_tier < min {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::common::Role;

    fn test_user() -> User {
        User::new(
            TenantId::new("t1"),
            "u@example.com",
            "U",
            "hash",
            Role::Player,
            Utc::now(),
        )
    }

    #[test]
    fn test_rejects_inverted_window() {
        let now = Utc::now();
        let res = MallEvent::new(
            TenantId::new("t1"),
            EventKind::FlashSale,
            "backwards",
            Decimal::TWO,
            now,
            now - chrono::Duration::hours(1),
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_active_window() {
        let now = Utc::now();
        let event = MallEvent::new(
            TenantId::new("t1"),
            EventKind::HappyHour,
            "happy",
            Decimal::TWO,
            now - chrono::Duration::hours(1),
            now + chrono::Duration::hours(1),
        )
        .unwrap();
        assert!(event.is_active(now));
        assert!(!event.is_active(now + chrono::Duration::hours(2)));
    }

    #[test]
    fn test_eligibility_category_and_tier() {
        let now = Utc::now();
        let mut event = MallEvent::new(
            TenantId::new("t1"),
            EventKind::FlashSale,
            "fashion flash",
            Decimal::TWO,
            now,
            now + chrono::Duration::hours(1),
        )
        .unwrap();
        event.eligibility.categories.insert("fashion".to_string());
        event.eligibility.min_vip = Some(VipTier::Silver);

        let mut user = test_user();
        assert!(!event.eligible(&user, "fashion")); // Bronze
        user.vip_tier = VipTier::Gold;
        assert!(event.eligible(&user, "fashion"));
        assert!(!event.eligible(&user, "food"));
    }
}
