//! Reward computation pipeline:
//! 1. Base coins/XP from the receipt amount
//! 2. Multiplier application (category, time, VIP, events, streak)
//! 3. Rounding (half-to-even, once, at the end)
//! 4. Flat bonuses
//! 5. Streak, level, VIP-tier and achievement transitions
//! 6. Fraud screen

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use super::fraud::{screen, FraudSignal};
use super::DerivedEvent;
use crate::error::{CoreError, CoreResult};
use crate::policy::TenantPolicy;
use crate::types::achievement::AchievementKind;
use crate::types::common::{EventId, VipTier};
use crate::types::event::MallEvent;
use crate::types::receipt::{MultiplierBreakdown, ReceiptSource};
use crate::types::user::{StreakState, User};

/// Streak multiplier saturates here; the counter itself keeps going.
const STREAK_MULTIPLIER_CAP_DAYS: u32 = 60;

const LEVEL_MILESTONES: [u32; 3] = [10, 25, 50];
const STREAK_MILESTONES: [u32; 2] = [7, 30];
const COIN_MILESTONES: [u64; 2] = [1_000, 10_000];

/// One validated receipt submission, paired with the owning user's
/// committed snapshot.
#[derive(Debug, Clone)]
pub struct RewardInput<'a> {
    pub user: &'a User,
    /// Non-negative, normalized to two decimal places.
    pub amount: Decimal,
    pub store: &'a str,
    /// Lowercased by the caller or here; table lookups are
    /// case-insensitive either way.
    pub category: &'a str,
    pub declared_ssid: Option<&'a str>,
    /// Prior submissions for this store within the duplicate window.
    pub recent_same_store: u32,
    pub source: ReceiptSource,
}

/// Everything the coordinator needs to build the committed delta and
/// the client response.
#[derive(Debug, Clone)]
pub struct RewardOutcome {
    pub coins: u64,
    pub xp: u64,
    pub bonus_coins: u64,
    /// VIP points from spending plus achievement points.
    pub vip_points: u64,
    pub multipliers: MultiplierBreakdown,
    /// Events whose multiplier participated.
    pub applied_event_ids: Vec<EventId>,

    pub streak: StreakState,
    pub streak_extended: bool,

    pub level_before: u32,
    pub level_after: u32,
    pub tier_before: VipTier,
    pub tier_after: VipTier,
    /// One-time bonus credited alongside a tier upgrade.
    pub tier_bonus: u64,

    pub achievements: Vec<AchievementKind>,
    pub achievement_points: u64,

    /// Ordered derived events for the response and notifications.
    pub events: Vec<DerivedEvent>,
    /// Non-empty means the receipt is suspicious and credit must be
    /// withheld pending review.
    pub fraud: Vec<FraudSignal>,
}

impl RewardOutcome {
    /// Total coins this outcome credits when applied in full.
    pub fn total_coins(&self) -> u64 {
        self.coins + self.bonus_coins + self.tier_bonus
    }
}

fn round_half_even(value: Decimal) -> u64 {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
        .to_u64()
        .unwrap_or(0)
}

/// Compute the reward for one receipt. Pure: no clocks, no I/O, no
/// randomness — `now` is an input.
pub fn evaluate(
    input: &RewardInput<'_>,
    policy: &TenantPolicy,
    active_events: &[MallEvent],
    now: DateTime<Utc>,
) -> CoreResult<RewardOutcome> {
    policy.validate()?;
    if input.amount <= Decimal::ZERO {
        return Err(CoreError::Validation(
            "receipt amount must be positive".to_string(),
        ));
    }

    let user = input.user;
    let category = input.category.to_ascii_lowercase();

    let category_m = policy.category_multiplier(&category);
    let time_m = policy.time_multiplier(now);
    let vip_m = user.vip_tier.benefits().coin_multiplier;

    let mut event_m = Decimal::ONE;
    let mut applied_event_ids = Vec::new();
    for event in active_events {
        if event.is_active(now) && event.eligible(user, &category) {
            event_m *= event.multiplier;
            applied_event_ids.push(event.id);
        }
    }
    if event_m > policy.event_multiplier_cap {
        event_m = policy.event_multiplier_cap;
    }
    if event_m <= Decimal::ZERO {
        return Err(CoreError::InvalidPolicy(
            "composed event multiplier is non-positive".to_string(),
        ));
    }

    let streak_m = Decimal::ONE
        + Decimal::from(user.streak.days.min(STREAK_MULTIPLIER_CAP_DAYS)) / Decimal::ONE_HUNDRED;

    let base_coins = input.amount * policy.base_rate;
    let base_xp = input.amount * policy.xp_rate;

    let coins = round_half_even(base_coins * category_m * time_m * vip_m * event_m * streak_m);
    let xp = round_half_even(base_xp * category_m * vip_m * event_m);

    let first_in_category = !user.visited_categories.contains(&category);
    let bonus_coins = policy.bonus_coins(input.amount, first_in_category);

    let today = policy.local_day(now);
    let (streak, streak_extended) = user.streak.advanced(today);

    let xp_after = user.xp + xp;
    let level_before = user.level;
    let level_after = policy.level_for_xp(xp_after).max(level_before);

    // Milestones look at coins earned before the tier bonus; the tier
    // itself depends on achievement points, so the bonus cannot feed
    // back into collector milestones.
    let coins_after = user.coins + coins + bonus_coins;

    let mut achievements = Vec::new();
    if user.total_purchases == 0 {
        achievements.push(AchievementKind::FirstReceipt);
    }
    if first_in_category {
        achievements.push(AchievementKind::FirstInCategory {
            category: category.clone(),
        });
    }
    for milestone in LEVEL_MILESTONES {
        if level_before < milestone && level_after >= milestone {
            achievements.push(AchievementKind::LevelMilestone { level: milestone });
        }
    }
    if streak_extended {
        for milestone in STREAK_MILESTONES {
            if user.streak.days < milestone && streak.days >= milestone {
                achievements.push(AchievementKind::StreakMilestone { days: milestone });
            }
        }
    }
    for milestone in COIN_MILESTONES {
        if user.coins < milestone && coins_after >= milestone {
            achievements.push(AchievementKind::CoinCollector { coins: milestone });
        }
    }

    let achievement_points: u64 = achievements.iter().map(|kind| kind.points()).sum();
    let spending_points = (input.amount / Decimal::ONE_HUNDRED)
        .trunc()
        .to_u64()
        .unwrap_or(0);
    let vip_points = spending_points + achievement_points;

    let tier_before = user.vip_tier;
    let tier_after = policy.vip_tier_for(user.vip_points + vip_points).max(tier_before);
    let tier_bonus = if tier_after > tier_before {
        tier_after.benefits().tier_up_bonus
    } else {
        0
    };

    let mut events = vec![DerivedEvent::ReceiptVerified];
    if streak_extended {
        events.push(DerivedEvent::StreakExtended { days: streak.days });
    }
    if level_after > level_before {
        events.push(DerivedEvent::LevelUp {
            from: level_before,
            to: level_after,
        });
    }
    if tier_after > tier_before {
        events.push(DerivedEvent::VipTierUp {
            from: tier_before,
            to: tier_after,
        });
    }
    for kind in &achievements {
        events.push(DerivedEvent::AchievementUnlocked { name: kind.name() });
    }

    let fraud = screen(input, policy);

    Ok(RewardOutcome {
        coins,
        xp,
        bonus_coins,
        vip_points,
        multipliers: MultiplierBreakdown {
            category: category_m,
            time: time_m,
            vip: vip_m,
            event: event_m,
            streak: streak_m,
        },
        applied_event_ids,
        streak,
        streak_extended,
        level_before,
        level_after,
        tier_before,
        tier_after,
        tier_bonus,
        achievements,
        achievement_points,
        events,
        fraud,
    })
}
