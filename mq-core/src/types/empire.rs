//! Empire facilities: user-owned assets that accrue passive income.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::common::{FacilityId, UserId};

/// Income accrues in whole-hour ticks.
pub const ACCRUAL_INTERVAL_SECS: i64 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilityType {
    Kiosk,
    Cafe,
    Boutique,
    Arcade,
    Cinema,
    DepartmentStore,
}

impl FacilityType {
    pub fn all() -> [FacilityType; 6] {
        [
            FacilityType::Kiosk,
            FacilityType::Cafe,
            FacilityType::Boutique,
            FacilityType::Arcade,
            FacilityType::Cinema,
            FacilityType::DepartmentStore,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FacilityType::Kiosk => "kiosk",
            FacilityType::Cafe => "cafe",
            FacilityType::Boutique => "boutique",
            FacilityType::Arcade => "arcade",
            FacilityType::Cinema => "cinema",
            FacilityType::DepartmentStore => "department_store",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "kiosk" => Some(FacilityType::Kiosk),
            "cafe" => Some(FacilityType::Cafe),
            "boutique" => Some(FacilityType::Boutique),
            "arcade" => Some(FacilityType::Arcade),
            "cinema" => Some(FacilityType::Cinema),
            "department_store" => Some(FacilityType::DepartmentStore),
            _ => None,
        }
    }

    /// Minimum user level to purchase.
    pub fn unlock_level(&self) -> u32 {
        match self {
            FacilityType::Kiosk => 5,
            FacilityType::Cafe => 8,
            FacilityType::Boutique => 12,
            FacilityType::Arcade => 10,
            FacilityType::Cinema => 15,
            FacilityType::DepartmentStore => 18,
        }
    }

    /// Purchase cost in coins.
    pub fn base_cost(&self) -> u64 {
        match self {
            FacilityType::Kiosk => 1_000,
            FacilityType::Cafe => 2_000,
            FacilityType::Boutique => 3_000,
            FacilityType::Arcade => 2_500,
            FacilityType::Cinema => 4_000,
            FacilityType::DepartmentStore => 5_000,
        }
    }

    /// Level-1 income per hour.
    pub fn base_income_per_hour(&self) -> u64 {
        match self {
            FacilityType::Kiosk => 50,
            FacilityType::Cafe => 80,
            FacilityType::Boutique => 120,
            FacilityType::Arcade => 100,
            FacilityType::Cinema => 150,
            FacilityType::DepartmentStore => 200,
        }
    }

    /// Per-level upgrade cost multiplier.
    pub fn upgrade_cost_multiplier(&self) -> Decimal {
        match self {
            FacilityType::Kiosk => Decimal::new(15, 1),
            FacilityType::Cafe => Decimal::new(18, 1),
            FacilityType::Boutique => Decimal::TWO,
            FacilityType::Arcade => Decimal::new(17, 1),
            FacilityType::Cinema => Decimal::new(22, 1),
            FacilityType::DepartmentStore => Decimal::new(25, 1),
        }
    }

    /// Level cap; cheaper facilities upgrade further.
    pub fn max_level(&self) -> u32 {
        match self {
            FacilityType::Kiosk => 10,
            FacilityType::Cafe => 8,
            FacilityType::Boutique => 6,
            FacilityType::Arcade => 7,
            FacilityType::Cinema => 5,
            FacilityType::DepartmentStore => 4,
        }
    }
}

/// A revenue-generating asset owned by a user.
///
/// Accrued income lands in `pending_income`; coins move only when the
/// user collects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Facility {
    pub id: FacilityId,
    pub user_id: UserId,
    pub facility_type: FacilityType,
    pub level: u32,
    pub pending_income: u64,
    pub last_collected_at: DateTime<Utc>,
    pub purchased_at: DateTime<Utc>,
}

impl Facility {
    pub fn new(user_id: UserId, facility_type: FacilityType, now: DateTime<Utc>) -> Self {
        Self {
            id: FacilityId::generate(),
            user_id,
            facility_type,
            level: 1,
            pending_income: 0,
            last_collected_at: now,
            purchased_at: now,
        }
    }

    /// Each upgrade raises income 30%, truncated to whole coins.
    pub fn income_per_hour(&self) -> u64 {
        let mut income = self.facility_type.base_income_per_hour();
        for _ in 1..self.level {
            income = income * 13 / 10;
        }
        income
    }

    /// Cost of upgrading from the current level to the next:
    /// `base_cost × multiplier^(level − 1)`, truncated to whole coins.
    /// `None` once the type's level cap is reached.
    pub fn upgrade_cost(&self) -> Option<u64> {
        if self.level >= self.facility_type.max_level() {
            return None;
        }
        let mut cost = Decimal::from(self.facility_type.base_cost());
        let mult = self.facility_type.upgrade_cost_multiplier();
        for _ in 1..self.level {
            cost *= mult;
        }
        cost.trunc().to_u64()
    }

    /// Credit pending income for every whole accrual interval elapsed.
    /// Returns the amount credited; `last_collected_at` advances only
    /// by the hours actually credited so partial hours carry over.
    pub fn accrue(&mut self, now: DateTime<Utc>) -> u64 {
        let elapsed = (now - self.last_collected_at).num_seconds();
        if elapsed < ACCRUAL_INTERVAL_SECS {
            return 0;
        }
        let intervals = (elapsed / ACCRUAL_INTERVAL_SECS) as u64;
        let credited = intervals * self.income_per_hour();
        self.pending_income += credited;
        self.last_collected_at += chrono::Duration::seconds(intervals as i64 * ACCRUAL_INTERVAL_SECS);
        credited
    }

    /// Move pending income out; the caller credits coins atomically.
    pub fn collect(&mut self) -> u64 {
        std::mem::take(&mut self.pending_income)
    }
}
