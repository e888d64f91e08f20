//! Player records and progression totals.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::common::{Role, TenantId, UserId, VipTier};

/// Consecutive-day activity streak.
///
/// `last_day` is a calendar day in the tenant timezone. The day the
/// streak last advanced, not the last time the user was seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakState {
    pub days: u32,
    pub last_day: Option<NaiveDate>,
}

impl StreakState {
    /// Advance the streak for activity on `today`.
    ///
    /// Returns the new state and whether the counter changed. Same-day
    /// activity is a no-op; a one-day gap extends, anything longer
    /// resets to 1.
    pub fn advanced(&self, today: NaiveDate) -> (StreakState, bool) {
        match self.last_day {
            Some(last) if last == today => (self.clone(), false),
            Some(last) if today == last + chrono::Duration::days(1) => (
                StreakState {
                    days: self.days + 1,
                    last_day: Some(today),
                },
                true,
            ),
            _ => (
                StreakState {
                    days: 1,
                    last_day: Some(today),
                },
                true,
            ),
        }
    }
}

/// TOTP enrollment state for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfaEnrollment {
    /// Base32-encoded TOTP secret.
    pub secret: String,
    /// Hashes of unused single-use backup codes.
    pub backup_code_hashes: Vec<String>,
    /// Set once the user has confirmed a code; unconfirmed enrollments
    /// do not gate login.
    pub confirmed: bool,
}

/// A player within a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub email: String,
    pub display_name: String,
    /// BCP-47 language tag, e.g. "en" or "ar".
    pub language: String,
    /// PHC-formatted Argon2id hash.
    pub password_hash: String,
    pub role: Role,
    pub mfa: Option<MfaEnrollment>,

    pub coins: u64,
    pub xp: u64,
    pub level: u32,
    pub vip_tier: VipTier,
    pub vip_points: u64,
    pub achievement_points: u64,
    pub social_score: u64,
    pub total_spent: Decimal,
    pub total_purchases: u64,

    pub streak: StreakState,
    pub visited_categories: BTreeSet<String>,
    pub friends: BTreeSet<UserId>,
    pub team_id: Option<String>,

    /// Open-ended client metadata; never interpreted by the core.
    #[serde(default)]
    pub attributes: serde_json::Value,

    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped on every committed delta.
    pub version: u64,
}

impl User {
    pub fn new(
        tenant_id: TenantId,
        email: impl Into<String>,
        display_name: impl Into<String>,
        password_hash: impl Into<String>,
        role: Role,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: UserId::generate(),
            tenant_id,
            email: email.into(),
            display_name: display_name.into(),
            language: "en".to_string(),
            password_hash: password_hash.into(),
            role,
            mfa: None,
            coins: 0,
            xp: 0,
            level: 1,
            vip_tier: VipTier::Bronze,
            vip_points: 0,
            achievement_points: 0,
            social_score: 0,
            total_spent: Decimal::ZERO,
            total_purchases: 0,
            streak: StreakState::default(),
            visited_categories: BTreeSet::new(),
            friends: BTreeSet::new(),
            team_id: None,
            attributes: serde_json::Value::Null,
            created_at: now,
            last_active: now,
            version: 0,
        }
    }

    /// Whether MFA gates this user's login.
    pub fn mfa_enabled(&self) -> bool {
        self.mfa.as_ref().map(|m| m.confirmed).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_streak_first_activity() {
        let (next, changed) = StreakState::default().advanced(day(2026, 3, 1));
        assert!(changed);
        assert_eq!(next.days, 1);
        assert_eq!(next.last_day, Some(day(2026, 3, 1)));
    }

    #[test]
    fn test_streak_same_day_noop() {
        let state = StreakState {
            days: 4,
            last_day: Some(day(2026, 3, 1)),
        };
        let (next, changed) = state.advanced(day(2026, 3, 1));
        assert!(!changed);
        assert_eq!(next.days, 4);
    }

    #[test]
    fn test_streak_consecutive_day_extends() {
        let state = StreakState {
            days: 4,
            last_day: Some(day(2026, 3, 1)),
        };
        let (next, changed) = state.advanced(day(2026, 3, 2));
        assert!(changed);
        assert_eq!(next.days, 5);
    }

    #[test]
    fn test_streak_gap_resets() {
        let state = StreakState {
            days: 9,
            last_day: Some(day(2026, 3, 1)),
        };
        let (next, _) = state.advanced(day(2026, 3, 4));
        assert_eq!(next.days, 1);
        assert_eq!(next.last_day, Some(day(2026, 3, 4)));
    }

    #[test]
    fn test_new_user_defaults() {
        let user = User::new(
            TenantId::new("t1"),
            "visitor@example.com",
            "Visitor",
            "$argon2id$fake",
            Role::Player,
            Utc::now(),
        );
        assert_eq!(user.level, 1);
        assert_eq!(user.vip_tier, VipTier::Bronze);
        assert_eq!(user.version, 0);
        assert!(!user.mfa_enabled());
    }
}
