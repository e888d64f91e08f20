//! Companion pets with decaying care stats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::{CompanionId, UserId};

/// Stats fall toward this threshold before care alerts fire.
pub const CARE_ALERT_THRESHOLD: u8 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanionType {
    Fawn,
    Stag,
    Doe,
}

impl CompanionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompanionType::Fawn => "fawn",
            CompanionType::Stag => "stag",
            CompanionType::Doe => "doe",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fawn" => Some(CompanionType::Fawn),
            "stag" => Some(CompanionType::Stag),
            "doe" => Some(CompanionType::Doe),
            _ => None,
        }
    }

    /// Starting stats (health, happiness, energy).
    pub fn base_stats(&self) -> (u8, u8, u8) {
        match self {
            CompanionType::Fawn => (100, 80, 90),
            CompanionType::Stag => (100, 75, 85),
            CompanionType::Doe => (85, 90, 95),
        }
    }
}

/// Each stat lives in [0, 100].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanionStats {
    pub health: u8,
    pub happiness: u8,
    pub energy: u8,
    pub xp: u32,
    pub level: u32,
}

/// Care alert emitted when a stat crosses the threshold downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompanionAlert {
    Hungry,
    Bored,
}

/// A feedable item: stat boosts and a coin cost.
#[derive(Debug, Clone)]
pub struct FoodItem {
    pub name: &'static str,
    pub health: u8,
    pub happiness: u8,
    pub energy: u8,
    pub cost: u64,
}

/// Feeding catalog.
pub fn food_catalog() -> Vec<FoodItem> {
    vec![
        FoodItem { name: "fresh_grass", health: 8, happiness: 8, energy: 10, cost: 8 },
        FoodItem { name: "mountain_herbs", health: 15, happiness: 3, energy: 12, cost: 12 },
        FoodItem { name: "fruits", health: 4, happiness: 15, energy: 5, cost: 9 },
        FoodItem { name: "premium_feed", health: 25, happiness: 20, energy: 25, cost: 25 },
    ]
}

/// An entertainment activity: happiness up, energy down, coin cost.
#[derive(Debug, Clone)]
pub struct Activity {
    pub name: &'static str,
    pub happiness: u8,
    pub energy_cost: u8,
    pub cost: u64,
}

/// Entertainment catalog.
pub fn activity_catalog() -> Vec<Activity> {
    vec![
        Activity { name: "star_gazing", happiness: 25, energy_cost: 2, cost: 5 },
        Activity { name: "herd_gathering", happiness: 20, energy_cost: 3, cost: 8 },
        Activity { name: "racing_games", happiness: 18, energy_cost: 10, cost: 15 },
        Activity { name: "social_play", happiness: 30, energy_cost: 6, cost: 10 },
    ]
}

fn clamp_add(stat: u8, delta: u8) -> u8 {
    stat.saturating_add(delta).min(100)
}

fn clamp_sub(stat: u8, delta: u8) -> u8 {
    stat.saturating_sub(delta)
}

/// A pet owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Companion {
    pub id: CompanionId,
    pub user_id: UserId,
    pub name: String,
    pub companion_type: CompanionType,
    pub stats: CompanionStats,
    pub last_interaction_at: DateTime<Utc>,
    pub shelter: Option<String>,
}

impl Companion {
    pub fn new(
        user_id: UserId,
        name: impl Into<String>,
        companion_type: CompanionType,
        now: DateTime<Utc>,
    ) -> Self {
        let (health, happiness, energy) = companion_type.base_stats();
        Self {
            id: CompanionId::generate(),
            user_id,
            name: name.into(),
            companion_type,
            stats: CompanionStats {
                health,
                happiness,
                energy,
                xp: 0,
                level: 1,
            },
            last_interaction_at: now,
            shelter: None,
        }
    }

    /// Feeding clamps every stat at 100.
    pub fn feed(&mut self, food: &FoodItem, now: DateTime<Utc>) {
        self.stats.health = clamp_add(self.stats.health, food.health);
        self.stats.happiness = clamp_add(self.stats.happiness, food.happiness);
        self.stats.energy = clamp_add(self.stats.energy, food.energy);
        self.stats.xp += 5;
        self.level_up();
        self.last_interaction_at = now;
    }

    /// Entertainment trades energy for happiness.
    pub fn entertain(&mut self, activity: &Activity, now: DateTime<Utc>) {
        self.stats.happiness = clamp_add(self.stats.happiness, activity.happiness);
        self.stats.energy = clamp_sub(self.stats.energy, activity.energy_cost);
        self.stats.xp += 8;
        self.level_up();
        self.last_interaction_at = now;
    }

    /// Periodic stat decay, clamped at 0. Returns alerts for stats
    /// that crossed the care threshold on this tick.
    pub fn decay(&mut self, amount: u8) -> Vec<CompanionAlert> {
        let mut alerts = Vec::new();
        let health_before = self.stats.health;
        let happiness_before = self.stats.happiness;

        self.stats.health = clamp_sub(self.stats.health, amount);
        self.stats.happiness = clamp_sub(self.stats.happiness, amount);
        self.stats.energy = clamp_sub(self.stats.energy, amount);

        if health_before >= CARE_ALERT_THRESHOLD && self.stats.health < CARE_ALERT_THRESHOLD {
            alerts.push(CompanionAlert::Hungry);
        }
        if happiness_before >= CARE_ALERT_THRESHOLD
            && self.stats.happiness < CARE_ALERT_THRESHOLD
        {
            alerts.push(CompanionAlert::Bored);
        }
        alerts
    }

    fn level_up(&mut self) {
        // 50 XP per companion level.
        let level = 1 + self.stats.xp / 50;
        if level > self.stats.level {
            self.stats.level = level;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn companion() -> Companion {
        Companion::new(UserId::new("u1"), "Koinko", CompanionType::Fawn, Utc::now())
    }

    #[test]
    fn test_feed_clamps_at_100() {
        let mut c = companion();
        let premium = &food_catalog()[3];
        c.feed(premium, Utc::now());
        assert_eq!(c.stats.health, 100);
        assert_eq!(c.stats.happiness, 100);
        assert_eq!(c.stats.energy, 100);
    }

    #[test]
    fn test_entertain_costs_energy() {
        let mut c = companion();
        let racing = &activity_catalog()[2];
        c.entertain(racing, Utc::now());
        assert_eq!(c.stats.energy, 80);
        assert_eq!(c.stats.happiness, 98);
    }

    #[test]
    fn test_decay_clamps_at_zero() {
        let mut c = companion();
        for _ in 0..100 {
            c.decay(2);
        }
        assert_eq!(c.stats.health, 0);
        assert_eq!(c.stats.energy, 0);
    }

    #[test]
    fn test_decay_alerts_fire_once_at_threshold() {
        let mut c = companion();
        c.stats.health = 31;
        c.stats.happiness = 90;
        let alerts = c.decay(2);
        assert_eq!(alerts, vec![CompanionAlert::Hungry]);
        // Already below threshold; no repeat alert.
        assert!(c.decay(2).is_empty());
    }

    #[test]
    fn test_companion_levels_from_xp() {
        let mut c = companion();
        let grass = &food_catalog()[0];
        for _ in 0..10 {
            c.feed(grass, Utc::now());
        }
        assert_eq!(c.stats.xp, 50);
        assert_eq!(c.stats.level, 2);
    }
}
