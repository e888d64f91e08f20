//! Personalized mission generation.
//!
//! Targets and rewards scale with the user's level and lifetime
//! spending, drawn from the template's base range.

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use mq_core::types::{
    mission::template_catalog, Mission, MissionId, MissionReward, MissionStatus,
    MissionTemplate, User,
};
use mq_store::UserAggregate;

/// First template slot without an active mission, if any.
pub fn pick_template(aggregate: &UserAggregate) -> Option<MissionTemplate> {
    template_catalog()
        .into_iter()
        .find(|template| aggregate.active_mission_in_slot(template.slot).is_none())
}

fn level_multiplier(user: &User) -> f64 {
    1.0 + (user.level.saturating_sub(1) as f64) * 0.1
}

fn spending_multiplier(user: &User) -> f64 {
    let spent = user.total_spent.to_f64().unwrap_or(0.0);
    if spent > 10_000.0 {
        1.3
    } else if spent > 5_000.0 {
        1.1
    } else {
        1.0
    }
}

/// Build a mission instance from a template for this user.
pub fn generate(template: &MissionTemplate, user: &User, now: DateTime<Utc>) -> Mission {
    let mut rng = rand::thread_rng();
    let scale = level_multiplier(user) * spending_multiplier(user);

    let (target_min, target_max) = template.target_range;
    let base_target = rng.gen_range(target_min..=target_max);
    let target = ((base_target as f64) * scale).round().max(1.0) as u64;

    let (reward_min, reward_max) = template.reward_range;
    let base_reward = rng.gen_range(reward_min..=reward_max);
    let coins = ((base_reward as f64) * scale).round().max(1.0) as u64;

    Mission {
        id: MissionId::generate(),
        user_id: user.id.clone(),
        kind: template.kind,
        template_id: template.slot.to_string(),
        objective: template.objective.clone(),
        target,
        progress: 0,
        reward: MissionReward {
            coins,
            xp: coins / 2,
        },
        status: MissionStatus::Active,
        created_at: now,
        expires_at: now + template.kind.duration(),
    }
}

/// Progress contribution of one verified receipt against every active
/// mission. Returns the updated missions paired with whether each one
/// just became ready to claim.
pub fn evaluate_receipt(
    aggregate: &UserAggregate,
    amount: Decimal,
    category: &str,
    first_visit_of_category: bool,
    now: DateTime<Utc>,
) -> Vec<(Mission, bool)> {
    let mut updates = Vec::new();
    for mission in &aggregate.missions {
        if mission.status != MissionStatus::Active || mission.is_expired(now) {
            continue;
        }
        let progress = mission.progress_for(amount, category, first_visit_of_category);
        if progress == 0 {
            continue;
        }
        let mut updated = mission.clone();
        let became_ready = updated.advance(progress);
        updates.push((updated, became_ready));
    }
    updates
}
