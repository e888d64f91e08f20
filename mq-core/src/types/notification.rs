//! Queued per-user messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::{NotificationId, UserId};

/// Default notification retention.
pub const NOTIFICATION_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    CoinCollected,
    MissionReady,
    MissionExpired,
    LevelUp,
    VipTierUp,
    AchievementUnlocked,
    EmpireIncomeReady,
    DeerHungry,
    DeerBored,
    Security,
    System,
}

/// Drop order under pressure: low first, then normal, then high.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
}

/// A queued message for one user. `read` and `dismissed` are monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub kind: NotificationKind,
    pub priority: NotificationPriority,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub read: bool,
    pub dismissed: bool,
}

impl Notification {
    pub fn new(
        user_id: UserId,
        kind: NotificationKind,
        priority: NotificationPriority,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: NotificationId::generate(),
            user_id,
            kind,
            priority,
            payload,
            created_at: now,
            expires_at: now + chrono::Duration::days(NOTIFICATION_TTL_DAYS),
            read: false,
            dismissed: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn mark_read(&mut self) {
        self.read = true;
    }

    pub fn dismiss(&mut self) {
        self.read = true;
        self.dismissed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_expiry_is_seven_days() {
        let now = Utc::now();
        let n = Notification::new(
            UserId::new("u1"),
            NotificationKind::MissionReady,
            NotificationPriority::Normal,
            serde_json::json!({}),
            now,
        );
        assert_eq!(n.expires_at - now, chrono::Duration::days(7));
        assert!(!n.is_expired(now));
        assert!(n.is_expired(now + chrono::Duration::days(8)));
    }

    #[test]
    fn test_flags_monotonic() {
        let mut n = Notification::new(
            UserId::new("u1"),
            NotificationKind::System,
            NotificationPriority::Low,
            serde_json::json!({}),
            Utc::now(),
        );
        n.dismiss();
        assert!(n.read);
        assert!(n.dismissed);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(NotificationPriority::Low < NotificationPriority::Normal);
        assert!(NotificationPriority::Normal < NotificationPriority::High);
    }
}
