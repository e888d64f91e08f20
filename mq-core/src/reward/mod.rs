//! The deterministic reward engine and its fraud screen.
//!
//! `evaluate` is a pure function: the same `(snapshot, receipt, policy,
//! events, now)` always yields the same outcome. All side effects —
//! persisting the delta, withholding credit for suspicious receipts,
//! fanning out notifications — belong to the coordinator.

mod engine;
mod fraud;

pub use engine::{evaluate, RewardInput, RewardOutcome};
pub use fraud::{screen, FraudSignal};

use serde::{Deserialize, Serialize};

use crate::types::common::VipTier;

/// Events derived from one committed delta, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivedEvent {
    ReceiptVerified,
    StreakExtended { days: u32 },
    LevelUp { from: u32, to: u32 },
    VipTierUp { from: VipTier, to: VipTier },
    AchievementUnlocked { name: String },
    MissionReady { mission_id: String },
}
