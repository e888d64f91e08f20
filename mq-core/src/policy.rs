//! Tenant reward policy: multiplier tables, VIP step functions and
//! validation thresholds.
//!
//! Defaults mirror production mall policy; every field can be
//! overridden per tenant at onboarding and from configuration.

use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc, Weekday};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{CoreError, CoreResult};
use crate::types::common::VipTier;

/// Reward time bucket; weekend takes precedence over the hour bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    Morning,
    Afternoon,
    Evening,
    Night,
    Weekend,
}

/// Per-bucket coin multipliers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeMultipliers {
    pub morning: Decimal,
    pub afternoon: Decimal,
    pub evening: Decimal,
    pub night: Decimal,
    pub weekend: Decimal,
}

impl Default for TimeMultipliers {
    fn default() -> Self {
        Self {
            morning: Decimal::new(11, 1),   // 06–12
            afternoon: Decimal::ONE,        // 12–18
            evening: Decimal::new(13, 1),   // 18–22
            night: Decimal::new(8, 1),      // 22–06
            weekend: Decimal::new(12, 1),
        }
    }
}

impl TimeMultipliers {
    pub fn get(&self, bucket: TimeBucket) -> Decimal {
        match bucket {
            TimeBucket::Morning => self.morning,
            TimeBucket::Afternoon => self.afternoon,
            TimeBucket::Evening => self.evening,
            TimeBucket::Night => self.night,
            TimeBucket::Weekend => self.weekend,
        }
    }
}

/// Fixed benefits per VIP tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VipBenefits {
    pub coin_multiplier: Decimal,
    /// Daily login bonus in coins.
    pub daily_bonus: u64,
    /// One-time bonus credited on upgrade into this tier.
    pub tier_up_bonus: u64,
}

impl VipTier {
    pub fn benefits(&self) -> VipBenefits {
        match self {
            VipTier::Bronze => VipBenefits {
                coin_multiplier: Decimal::ONE,
                daily_bonus: 5,
                tier_up_bonus: 0,
            },
            VipTier::Silver => VipBenefits {
                coin_multiplier: Decimal::new(12, 1),
                daily_bonus: 10,
                tier_up_bonus: 50,
            },
            VipTier::Gold => VipBenefits {
                coin_multiplier: Decimal::new(15, 1),
                daily_bonus: 20,
                tier_up_bonus: 100,
            },
            VipTier::Platinum => VipBenefits {
                coin_multiplier: Decimal::TWO,
                daily_bonus: 50,
                tier_up_bonus: 200,
            },
            VipTier::Diamond => VipBenefits {
                coin_multiplier: Decimal::new(25, 1),
                daily_bonus: 100,
                tier_up_bonus: 500,
            },
        }
    }
}

/// Tenant-scoped reward and validation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantPolicy {
    /// Coins per currency unit.
    pub base_rate: Decimal,
    /// XP per currency unit.
    pub xp_rate: Decimal,
    pub xp_per_level: u64,
    pub level_cap: u32,

    pub category_multipliers: BTreeMap<String, Decimal>,
    pub time_multipliers: TimeMultipliers,

    /// Composed event multipliers clip here.
    pub event_multiplier_cap: Decimal,

    /// VIP point thresholds for Silver, Gold, Platinum, Diamond.
    pub vip_thresholds: [u64; 4],

    pub max_receipt_amount: Decimal,
    pub suspicious_amount: Decimal,
    /// Repeat-store heuristic: flag at `duplicate_max_submissions`
    /// receipts for the same store within `duplicate_window_mins`.
    pub duplicate_max_submissions: u32,
    pub duplicate_window_mins: i64,

    /// Empty set admits every store name.
    pub store_allow_list: BTreeSet<String>,
    pub enforce_wifi_presence: bool,
    pub wifi_ssids: BTreeSet<String>,

    /// Large-amount bonus thresholds (amount, coins), checked high to
    /// low, first match wins.
    pub bonus_tiers: Vec<(Decimal, u64)>,
    /// Bonus for the first receipt in a category.
    pub first_category_bonus: u64,

    /// Fixed UTC offset like "+04:00"; tenant-local days derive from it.
    pub timezone: String,
}

impl Default for TenantPolicy {
    fn default() -> Self {
        let mut category_multipliers = BTreeMap::new();
        for (category, mult) in [
            ("fashion", Decimal::new(13, 1)),
            ("electronics", Decimal::new(12, 1)),
            ("food", Decimal::new(8, 1)),
            ("luxury", Decimal::new(15, 1)),
            ("books", Decimal::new(14, 1)),
            ("sports", Decimal::new(11, 1)),
            ("beauty", Decimal::new(125, 2)),
            ("home", Decimal::new(115, 2)),
        ] {
            category_multipliers.insert(category.to_string(), mult);
        }

        Self {
            base_rate: Decimal::new(10, 2),
            xp_rate: Decimal::new(20, 2),
            xp_per_level: 100,
            level_cap: 100,
            category_multipliers,
            time_multipliers: TimeMultipliers::default(),
            event_multiplier_cap: Decimal::new(30, 1),
            vip_thresholds: [500, 2_000, 5_000, 10_000],
            max_receipt_amount: Decimal::from(10_000),
            suspicious_amount: Decimal::from(5_000),
            duplicate_max_submissions: 3,
            duplicate_window_mins: 10,
            store_allow_list: BTreeSet::new(),
            enforce_wifi_presence: false,
            wifi_ssids: BTreeSet::new(),
            bonus_tiers: vec![
                (Decimal::from(1_000), 50),
                (Decimal::from(500), 20),
            ],
            first_category_bonus: 0,
            timezone: "+04:00".to_string(),
        }
    }
}

impl TenantPolicy {
    /// Reject policies that would break the multiplier pipeline.
    pub fn validate(&self) -> CoreResult<()> {
        if self.base_rate <= Decimal::ZERO || self.xp_rate <= Decimal::ZERO {
            return Err(CoreError::InvalidPolicy(
                "base_rate and xp_rate must be positive".to_string(),
            ));
        }
        if self.xp_per_level == 0 {
            return Err(CoreError::InvalidPolicy(
                "xp_per_level must be positive".to_string(),
            ));
        }
        for (category, mult) in &self.category_multipliers {
            if *mult <= Decimal::ZERO {
                return Err(CoreError::InvalidPolicy(format!(
                    "non-positive multiplier for category {category}"
                )));
            }
        }
        for mult in [
            self.time_multipliers.morning,
            self.time_multipliers.afternoon,
            self.time_multipliers.evening,
            self.time_multipliers.night,
            self.time_multipliers.weekend,
            self.event_multiplier_cap,
        ] {
            if mult <= Decimal::ZERO {
                return Err(CoreError::InvalidPolicy(
                    "non-positive time or event multiplier".to_string(),
                ));
            }
        }
        if !self.vip_thresholds.windows(2).all(|w| w[0] < w[1]) {
            return Err(CoreError::InvalidPolicy(
                "vip thresholds must be strictly increasing".to_string(),
            ));
        }
        Ok(())
    }

    pub fn category_multiplier(&self, category: &str) -> Decimal {
        self.category_multipliers
            .get(&category.to_ascii_lowercase())
            .copied()
            .unwrap_or(Decimal::ONE)
    }

    /// Known categories; unknown submissions fall back to the default
    /// multiplier but are still accepted.
    pub fn known_category(&self, category: &str) -> bool {
        self.category_multipliers
            .contains_key(&category.to_ascii_lowercase())
    }

    /// Tenant-local offset; malformed configuration falls back to UTC.
    pub fn tz_offset(&self) -> FixedOffset {
        parse_offset(&self.timezone).unwrap_or_else(|| Utc.fix())
    }

    /// Tenant-local calendar day for streak arithmetic.
    pub fn local_day(&self, now: DateTime<Utc>) -> chrono::NaiveDate {
        now.with_timezone(&self.tz_offset()).date_naive()
    }

    /// Bucket an instant in tenant-local time.
    pub fn time_bucket(&self, now: DateTime<Utc>) -> TimeBucket {
        let local = now.with_timezone(&self.tz_offset());
        match local.weekday() {
            Weekday::Sat | Weekday::Sun => return TimeBucket::Weekend,
            _ => {}
        }
        match local.hour() {
            6..=11 => TimeBucket::Morning,
            12..=17 => TimeBucket::Afternoon,
            18..=21 => TimeBucket::Evening,
            _ => TimeBucket::Night,
        }
    }

    pub fn time_multiplier(&self, now: DateTime<Utc>) -> Decimal {
        self.time_multipliers.get(self.time_bucket(now))
    }

    /// VIP tier step function.
    pub fn vip_tier_for(&self, points: u64) -> VipTier {
        let [silver, gold, platinum, diamond] = self.vip_thresholds;
        if points >= diamond {
            VipTier::Diamond
        } else if points >= platinum {
            VipTier::Platinum
        } else if points >= gold {
            VipTier::Gold
        } else if points >= silver {
            VipTier::Silver
        } else {
            VipTier::Bronze
        }
    }

    /// Flat bonus coins for a receipt.
    pub fn bonus_coins(&self, amount: Decimal, first_in_category: bool) -> u64 {
        let mut bonus = 0;
        for (threshold, coins) in &self.bonus_tiers {
            if amount >= *threshold {
                bonus = *coins;
                break;
            }
        }
        if first_in_category {
            bonus += self.first_category_bonus;
        }
        bonus
    }

    /// Level as a function of XP, capped.
    pub fn level_for_xp(&self, xp: u64) -> u32 {
        let level = 1 + (xp / self.xp_per_level) as u32;
        level.min(self.level_cap)
    }
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let (sign, rest) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => (1, s),
    };
    let mut parts = rest.splitn(2, ':');
    let hours: i32 = parts.next()?.parse().ok()?;
    let minutes: i32 = parts.next().unwrap_or("0").parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3_600 + minutes * 60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_policy_validates() {
        TenantPolicy::default().validate().unwrap();
    }

    #[test]
    fn test_category_multiplier_lookup() {
        let policy = TenantPolicy::default();
        assert_eq!(policy.category_multiplier("fashion"), Decimal::new(13, 1));
        assert_eq!(policy.category_multiplier("Fashion"), Decimal::new(13, 1));
        assert_eq!(policy.category_multiplier("unknown"), Decimal::ONE);
    }

    #[test]
    fn test_vip_step_function() {
        let policy = TenantPolicy::default();
        assert_eq!(policy.vip_tier_for(0), VipTier::Bronze);
        assert_eq!(policy.vip_tier_for(499), VipTier::Bronze);
        assert_eq!(policy.vip_tier_for(500), VipTier::Silver);
        assert_eq!(policy.vip_tier_for(2_000), VipTier::Gold);
        assert_eq!(policy.vip_tier_for(5_000), VipTier::Platinum);
        assert_eq!(policy.vip_tier_for(99_999), VipTier::Diamond);
    }

    #[test]
    fn test_time_buckets_local_offset() {
        let mut policy = TenantPolicy::default();
        policy.timezone = "+04:00".to_string();
        // 2026-03-04 is a Wednesday. 05:00 UTC is 09:00 local.
        let morning = Utc.with_ymd_and_hms(2026, 3, 4, 5, 0, 0).unwrap();
        assert_eq!(policy.time_bucket(morning), TimeBucket::Morning);
        // 19:00 UTC is 23:00 local.
        let night = Utc.with_ymd_and_hms(2026, 3, 4, 19, 0, 0).unwrap();
        assert_eq!(policy.time_bucket(night), TimeBucket::Night);
        // 2026-03-07 is a Saturday everywhere in +04:00 daytime.
        let weekend = Utc.with_ymd_and_hms(2026, 3, 7, 8, 0, 0).unwrap();
        assert_eq!(policy.time_bucket(weekend), TimeBucket::Weekend);
    }

    #[test]
    fn test_bonus_tiers_first_match_wins() {
        let policy = TenantPolicy::default();
        assert_eq!(policy.bonus_coins(Decimal::from(1_500), false), 50);
        assert_eq!(policy.bonus_coins(Decimal::from(600), false), 20);
        assert_eq!(policy.bonus_coins(Decimal::from(100), false), 0);
        // First-category bonus is off by default.
        assert_eq!(policy.bonus_coins(Decimal::from(100), true), 0);

        let mut generous = TenantPolicy::default();
        generous.first_category_bonus = 10;
        assert_eq!(generous.bonus_coins(Decimal::from(100), true), 10);
        assert_eq!(generous.bonus_coins(Decimal::from(1_500), true), 60);
    }

    #[test]
    fn test_level_for_xp() {
        let policy = TenantPolicy::default();
        assert_eq!(policy.level_for_xp(0), 1);
        assert_eq!(policy.level_for_xp(99), 1);
        assert_eq!(policy.level_for_xp(122), 2);
        assert_eq!(policy.level_for_xp(1_000_000), 100);
    }

    #[test]
    fn test_rejects_nonpositive_multiplier() {
        let mut policy = TenantPolicy::default();
        policy
            .category_multipliers
            .insert("cursed".to_string(), Decimal::ZERO);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_offset_parsing_fallback() {
        let mut policy = TenantPolicy::default();
        policy.timezone = "not-an-offset".to_string();
        assert_eq!(policy.tz_offset().local_minus_utc(), 0);
        policy.timezone = "-05:30".to_string();
        assert_eq!(policy.tz_offset().local_minus_utc(), -(5 * 3600 + 30 * 60));
    }
}
