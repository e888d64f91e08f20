//! Persistent one-time unlocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::common::UserId;

/// Achievement families. `(user, kind)` is unique; insertion is
/// idempotent by `name()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AchievementKind {
    FirstReceipt,
    FirstInCategory { category: String },
    LevelMilestone { level: u32 },
    StreakMilestone { days: u32 },
    CoinCollector { coins: u64 },
}

impl AchievementKind {
    /// Stable name used for uniqueness and client display keys.
    pub fn name(&self) -> String {
        match self {
            AchievementKind::FirstReceipt => "first_receipt".to_string(),
            AchievementKind::FirstInCategory { category } => {
                format!("first_in_category:{category}")
            }
            AchievementKind::LevelMilestone { level } => format!("level_{level}"),
            AchievementKind::StreakMilestone { days } => format!("streak_{days}"),
            AchievementKind::CoinCollector { coins } => format!("coin_collector_{coins}"),
        }
    }

    /// Achievement points awarded; these feed VIP points.
    pub fn points(&self) -> u64 {
        match self {
            AchievementKind::FirstReceipt => 10,
            AchievementKind::FirstInCategory { .. } => 5,
            AchievementKind::LevelMilestone { level } => match level {
                10 => 20,
                25 => 50,
                _ => 100,
            },
            AchievementKind::StreakMilestone { days } => match days {
                7 => 15,
                _ => 60,
            },
            AchievementKind::CoinCollector { coins } => match coins {
                1_000 => 25,
                _ => 75,
            },
        }
    }
}

/// A recorded unlock on one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Achievement {
    pub id: Uuid,
    pub user_id: UserId,
    pub kind: AchievementKind,
    pub points: u64,
    pub earned_at: DateTime<Utc>,
}

impl Achievement {
    pub fn new(user_id: UserId, kind: AchievementKind, now: DateTime<Utc>) -> Self {
        let points = kind.points();
        Self {
            id: Uuid::new_v4(),
            user_id,
            kind,
            points,
            earned_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_stable() {
        assert_eq!(AchievementKind::FirstReceipt.name(), "first_receipt");
        assert_eq!(
            AchievementKind::FirstInCategory {
                category: "fashion".to_string()
            }
            .name(),
            "first_in_category:fashion"
        );
        assert_eq!(AchievementKind::LevelMilestone { level: 25 }.name(), "level_25");
        assert_eq!(
            AchievementKind::CoinCollector { coins: 10_000 }.name(),
            "coin_collector_10000"
        );
    }

    #[test]
    fn test_points_table() {
        assert_eq!(AchievementKind::FirstReceipt.points(), 10);
        assert_eq!(AchievementKind::StreakMilestone { days: 30 }.points(), 60);
        assert_eq!(AchievementKind::CoinCollector { coins: 1_000 }.points(), 25);
    }
}
