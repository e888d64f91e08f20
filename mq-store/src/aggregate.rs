//! The single-shard unit of storage: one user and everything it owns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mq_core::delta::{CompanionOp, FacilityOp, UserDelta};
use mq_core::types::{
    Achievement, Companion, Facility, Mission, MissionStatus, Notification, Receipt, User,
};

use crate::error::{StoreError, StoreResult};

/// One user's complete persisted state. All of it lives on one shard
/// and mutates in one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAggregate {
    pub user: User,
    pub receipts: Vec<Receipt>,
    pub missions: Vec<Mission>,
    pub achievements: Vec<Achievement>,
    pub facilities: Vec<Facility>,
    pub companions: Vec<Companion>,
    pub notifications: Vec<Notification>,
}

impl UserAggregate {
    pub fn new(user: User) -> Self {
        Self {
            user,
            receipts: Vec::new(),
            missions: Vec::new(),
            achievements: Vec::new(),
            facilities: Vec::new(),
            companions: Vec::new(),
            notifications: Vec::new(),
        }
    }

    /// Count receipts for one store newer than `since`. Feeds the
    /// rapid-repeat fraud heuristic.
    pub fn receipts_for_store_since(&self, store: &str, since: DateTime<Utc>) -> u32 {
        self.receipts
            .iter()
            .filter(|r| r.store == store && r.submitted_at >= since)
            .count() as u32
    }

    /// The active mission occupying a template slot, if any.
    pub fn active_mission_in_slot(&self, template_id: &str) -> Option<&Mission> {
        self.missions
            .iter()
            .find(|m| m.template_id == template_id && m.status == MissionStatus::Active)
    }

    /// Apply a composite delta in place. Validates ownership, balance
    /// and uniqueness constraints before touching anything, then
    /// mutates and bumps the user version exactly once.
    pub fn apply_delta(&mut self, delta: &UserDelta) -> StoreResult<()> {
        if !delta.validate_owner(&self.user.id) {
            return Err(StoreError::Constraint(
                "delta rows belong to a different user".to_string(),
            ));
        }

        // Total debits, including costs embedded in facility and
        // companion operations.
        let mut debits = delta.coins_sub;
        let mut credits = delta.coins_add;
        for op in &delta.facility_ops {
            match op {
                FacilityOp::Add { cost, .. } | FacilityOp::Upgrade { cost, .. } => {
                    debits += *cost;
                }
                FacilityOp::Collect { id } => {
                    let facility = self
                        .facilities
                        .iter()
                        .find(|f| &f.id == id)
                        .ok_or_else(|| StoreError::NotFound(format!("facility {id}")))?;
                    credits += facility.pending_income;
                }
                FacilityOp::Accrue { .. } => {}
            }
        }
        for op in &delta.companion_ops {
            if let CompanionOp::Replace { cost, .. } = op {
                debits += *cost;
            }
        }
        if self.user.coins + credits < debits {
            return Err(StoreError::Constraint("insufficient coins".to_string()));
        }

        if let Some(receipt) = &delta.receipt {
            if self
                .receipts
                .iter()
                .any(|r| r.idempotency_key == receipt.idempotency_key)
            {
                return Err(StoreError::AlreadyExists(format!(
                    "receipt with idempotency key {}",
                    receipt.idempotency_key
                )));
            }
        }
        for mission in &delta.new_missions {
            if self.active_mission_in_slot(&mission.template_id).is_some() {
                return Err(StoreError::AlreadyExists(format!(
                    "active mission in slot {}",
                    mission.template_id
                )));
            }
        }

        // Validation passed; mutate.
        self.user.coins = self.user.coins + credits - debits;
        self.user.xp += delta.xp_add;
        self.user.vip_points += delta.vip_points_add;
        self.user.achievement_points += delta.achievement_points_add;
        self.user.social_score += delta.social_score_add;
        self.user.total_spent += delta.spending_add;
        self.user.total_purchases += delta.purchases_add;

        if let Some(level) = delta.set_level {
            self.user.level = self.user.level.max(level);
        }
        if let Some(tier) = delta.set_vip_tier {
            self.user.vip_tier = self.user.vip_tier.max(tier);
        }
        if let Some(streak) = &delta.set_streak {
            self.user.streak = streak.clone();
        }
        if let Some(category) = &delta.add_visited_category {
            self.user
                .visited_categories
                .insert(category.to_ascii_lowercase());
        }

        if let Some(receipt) = &delta.receipt {
            self.receipts.push(receipt.clone());
        }
        for achievement in &delta.achievements {
            let name = achievement.kind.name();
            // (user, kind) is unique; re-insertion is a no-op.
            if !self.achievements.iter().any(|a| a.kind.name() == name) {
                self.achievements.push(achievement.clone());
            }
        }
        for update in &delta.mission_updates {
            if let Some(mission) = self.missions.iter_mut().find(|m| m.id == update.mission_id)
            {
                mission.progress = mission.progress.max(update.progress);
                if status_rank(update.status) > status_rank(mission.status) {
                    mission.status = update.status;
                }
            }
        }
        for mission in &delta.new_missions {
            self.missions.push(mission.clone());
        }
        for notification in &delta.notifications {
            self.notifications.push(notification.clone());
        }

        for op in &delta.facility_ops {
            match op {
                FacilityOp::Add { facility, .. } => self.facilities.push(facility.clone()),
                FacilityOp::Upgrade { id, .. } => {
                    if let Some(facility) = self.facilities.iter_mut().find(|f| &f.id == id) {
                        facility.level += 1;
                    }
                }
                FacilityOp::Collect { id } => {
                    if let Some(facility) = self.facilities.iter_mut().find(|f| &f.id == id) {
                        facility.collect();
                    }
                }
                FacilityOp::Accrue {
                    id,
                    pending_add,
                    collected_at,
                } => {
                    if let Some(facility) = self.facilities.iter_mut().find(|f| &f.id == id) {
                        facility.pending_income += pending_add;
                        facility.last_collected_at = *collected_at;
                    }
                }
            }
        }
        for op in &delta.companion_ops {
            match op {
                CompanionOp::Add { companion } => self.companions.push(companion.clone()),
                CompanionOp::Replace { companion, .. } => {
                    if let Some(slot) =
                        self.companions.iter_mut().find(|c| c.id == companion.id)
                    {
                        *slot = companion.clone();
                    }
                }
                CompanionOp::DecayAll { amount } => {
                    for companion in &mut self.companions {
                        companion.decay(*amount);
                    }
                }
            }
        }

        if let Some(at) = delta.touch_last_active {
            self.user.last_active = at;
        }
        self.user.version += 1;
        Ok(())
    }

    /// Drop expired notifications; returns how many were removed.
    pub fn sweep_notifications(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.notifications.len();
        self.notifications.retain(|n| !n.is_expired(now));
        before - self.notifications.len()
    }
}

fn status_rank(status: MissionStatus) -> u8 {
    match status {
        MissionStatus::Active => 0,
        MissionStatus::ReadyToClaim => 1,
        MissionStatus::Completed => 2,
        MissionStatus::Expired => 3,
    }
}
