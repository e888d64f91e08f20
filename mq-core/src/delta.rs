//! The composite mutation applied to one user in a single shard-local
//! transaction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::achievement::Achievement;
use crate::types::common::{FacilityId, MissionId, UserId, VipTier};
use crate::types::companion::Companion;
use crate::types::empire::Facility;
use crate::types::mission::{Mission, MissionStatus};
use crate::types::notification::Notification;
use crate::types::receipt::Receipt;
use crate::types::user::StreakState;

/// Progress/status update for one existing mission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionUpdate {
    pub mission_id: MissionId,
    pub progress: u64,
    pub status: MissionStatus,
}

/// Mutation of one empire facility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FacilityOp {
    /// Purchase: insert the facility and debit its cost.
    Add { facility: Facility, cost: u64 },
    /// Level increment, debiting `cost` atomically.
    Upgrade { id: FacilityId, cost: u64 },
    /// Move pending income into coins.
    Collect { id: FacilityId },
    /// Background accrual: add pending income and advance the cursor.
    Accrue {
        id: FacilityId,
        pending_add: u64,
        collected_at: DateTime<Utc>,
    },
}

/// Mutation of one companion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompanionOp {
    Add { companion: Companion },
    /// Care action: the post-interaction companion (stats already
    /// clamped) and the coin cost to debit.
    Replace { companion: Companion, cost: u64 },
    /// Background decay applied to every companion.
    DecayAll { amount: u8 },
}

/// Atomic composite delta. `Default` is a no-op; builders fill in only
/// what a given flow touches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserDelta {
    pub coins_add: u64,
    /// Explicit debits (facility purchases, companion care). The store
    /// rejects the whole delta when the balance is insufficient.
    pub coins_sub: u64,
    pub xp_add: u64,
    pub vip_points_add: u64,
    pub achievement_points_add: u64,
    pub social_score_add: u64,
    pub spending_add: Decimal,
    pub purchases_add: u64,

    pub set_level: Option<u32>,
    pub set_vip_tier: Option<VipTier>,
    pub set_streak: Option<StreakState>,
    pub add_visited_category: Option<String>,

    pub receipt: Option<Receipt>,
    pub achievements: Vec<Achievement>,
    pub mission_updates: Vec<MissionUpdate>,
    pub new_missions: Vec<Mission>,
    pub notifications: Vec<Notification>,
    pub facility_ops: Vec<FacilityOp>,
    pub companion_ops: Vec<CompanionOp>,

    pub touch_last_active: Option<DateTime<Utc>>,
}

impl UserDelta {
    /// A delta that only refreshes `last_active`.
    pub fn touch(now: DateTime<Utc>) -> Self {
        Self {
            touch_last_active: Some(now),
            ..Default::default()
        }
    }

    /// Whether applying this delta changes anything beyond the
    /// activity timestamp.
    pub fn is_material(&self) -> bool {
        self.coins_add != 0
            || self.coins_sub != 0
            || self.xp_add != 0
            || self.vip_points_add != 0
            || self.achievement_points_add != 0
            || self.social_score_add != 0
            || !self.spending_add.is_zero()
            || self.purchases_add != 0
            || self.set_level.is_some()
            || self.set_vip_tier.is_some()
            || self.set_streak.is_some()
            || self.add_visited_category.is_some()
            || self.receipt.is_some()
            || !self.achievements.is_empty()
            || !self.mission_updates.is_empty()
            || !self.new_missions.is_empty()
            || !self.notifications.is_empty()
            || !self.facility_ops.is_empty()
            || !self.companion_ops.is_empty()
    }

    /// Sanity check used by the store before applying.
    pub fn validate_owner(&self, user_id: &UserId) -> bool {
        if let Some(receipt) = &self.receipt {
            if &receipt.user_id != user_id {
                return false;
            }
        }
        self.achievements.iter().all(|a| &a.user_id == user_id)
            && self.new_missions.iter().all(|m| &m.user_id == user_id)
            && self.notifications.iter().all(|n| &n.user_id == user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delta_is_immaterial() {
        let delta = UserDelta::default();
        assert!(!delta.is_material());
        let touch = UserDelta::touch(Utc::now());
        assert!(!touch.is_material());
    }

    #[test]
    fn test_coin_delta_is_material() {
        let delta = UserDelta {
            coins_add: 13,
            ..Default::default()
        };
        assert!(delta.is_material());
    }
}
