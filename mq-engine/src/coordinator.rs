//! The progression coordinator: the only component that writes.
//!
//! Request path: admission (rate limit) → load through cache →
//! compute (pure reward engine) → atomic apply with idempotency and
//! optimistic version retry → write-through cache refresh →
//! best-effort notification fan-out. All mutating operations on a
//! given user serialize behind a keyed mutex; the row version makes
//! the transaction correct even if the mutex is bypassed by another
//! process.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use mq_auth::AuthSubject;
use mq_core::delta::{CompanionOp, FacilityOp, MissionUpdate, UserDelta};
use mq_core::reward::{self, DerivedEvent, RewardInput};
use mq_core::types::{
    companion, Achievement, Companion, CompanionId, CompanionType, Facility, FacilityId,
    FacilityType, MallEvent, Mission, MissionId, MissionReward, MissionStatus, MultiplierBreakdown,
    Notification, NotificationId, NotificationKind, NotificationPriority, Receipt, ReceiptId,
    ReceiptSource, Role, Tenant, TenantId, UserId, VerificationState, VipTier,
};
use mq_store::{
    request_hash, IdempotencyRecord, LeaderboardEntry, LeaderboardKind, ShardedStore, Store,
    StoreError, UserAggregate,
};
use rust_decimal::prelude::ToPrimitive;

use crate::cache::SmartCache;
use crate::error::{EngineError, EngineResult};
use crate::missions;
use crate::notify::{NotificationHub, PushMessage};
use crate::rate_limit::RateLimiter;

/// Version-conflict retries before surfacing `conflict`.
const MAX_VERSION_RETRIES: u32 = 3;

/// Per-user mutex acquisition bound; beyond it the request is `busy`.
const BUSY_TIMEOUT: Duration = Duration::from_millis(500);

const USER_CACHE_CAPACITY: usize = 1_000;
const USER_CACHE_TTL: Duration = Duration::from_secs(60);
const TEMPLATE_CACHE_CAPACITY: usize = 1_000;
const TEMPLATE_CACHE_TTL: Duration = Duration::from_secs(600);

/// Maximum companions per user.
const COMPANION_LIMIT: usize = 3;

/// A validated receipt submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiptSubmission {
    pub amount: Decimal,
    pub store: String,
    pub category: Option<String>,
    pub ssid: Option<String>,
    pub idempotency_key: String,
    pub source: ReceiptSource,
}

/// Post-commit totals returned to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTotals {
    pub coins: u64,
    pub xp: u64,
    pub level: u32,
    pub vip_tier: VipTier,
    pub vip_points: u64,
    pub streak: u32,
}

impl UserTotals {
    fn of(aggregate: &UserAggregate) -> Self {
        let user = &aggregate.user;
        Self {
            coins: user.coins,
            xp: user.xp,
            level: user.level,
            vip_tier: user.vip_tier,
            vip_points: user.vip_points,
            streak: user.streak.days,
        }
    }
}

/// Reward portion of a receipt response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSummary {
    pub coins: u64,
    pub xp: u64,
    pub bonus: u64,
    pub multipliers: MultiplierBreakdown,
}

/// Receipt submission response; persisted verbatim in the idempotency
/// record so retries are byte-identical.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptOutcome {
    pub receipt_id: ReceiptId,
    pub status: VerificationState,
    pub reward: RewardSummary,
    pub user: UserTotals,
    pub events: Vec<DerivedEvent>,
}

/// Mission claim response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissionOutcome {
    pub mission_id: MissionId,
    pub reward: MissionReward,
    pub user: UserTotals,
    pub events: Vec<DerivedEvent>,
}

/// First qualifying activity of a tenant-local day: coins and XP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyBonus {
    pub coins: u64,
    pub xp: u64,
    pub streak_days: u32,
}

/// Dashboard snapshot for `GET /api/user/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub user_id: UserId,
    pub display_name: String,
    pub language: String,
    pub totals: UserTotals,
    pub achievement_points: u64,
    pub missions: Vec<Mission>,
    pub achievements: Vec<Achievement>,
    pub facilities: Vec<Facility>,
    pub companions: Vec<Companion>,
    pub notifications: Vec<Notification>,
    pub recent_receipts: Vec<Receipt>,
}

enum Applied<R> {
    Fresh(Box<UserAggregate>, R),
    Replayed(R),
}

/// The orchestrating state machine.
pub struct Coordinator {
    store: Arc<ShardedStore>,
    rate_limiter: Arc<RateLimiter>,
    hub: Arc<NotificationHub>,
    user_cache: Arc<SmartCache<UserAggregate>>,
    template_cache: Arc<SmartCache<serde_json::Value>>,
    user_locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<ShardedStore>,
        rate_limiter: Arc<RateLimiter>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            store,
            rate_limiter,
            hub,
            user_cache: Arc::new(SmartCache::new(USER_CACHE_CAPACITY, USER_CACHE_TTL)),
            template_cache: Arc::new(SmartCache::new(
                TEMPLATE_CACHE_CAPACITY,
                TEMPLATE_CACHE_TTL,
            )),
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a distributed second cache tier.
    pub fn with_cache_tier(mut self, tier: Arc<dyn crate::cache::CacheTier>) -> Self {
        self.user_cache = Arc::new(
            SmartCache::new(USER_CACHE_CAPACITY, USER_CACHE_TTL).with_second_tier(tier.clone()),
        );
        self.template_cache = Arc::new(
            SmartCache::new(TEMPLATE_CACHE_CAPACITY, TEMPLATE_CACHE_TTL).with_second_tier(tier),
        );
        self
    }

    pub fn store(&self) -> &Arc<ShardedStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn user_cache(&self) -> &Arc<SmartCache<UserAggregate>> {
        &self.user_cache
    }

    pub fn template_cache(&self) -> &Arc<SmartCache<serde_json::Value>> {
        &self.template_cache
    }

    // ==================== Receipt path ====================

    /// Canonical receipt submission flow.
    pub async fn submit_receipt(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        submission: ReceiptSubmission,
    ) -> EngineResult<ReceiptOutcome> {
        self.rate_limiter
            .check(&subject_key(&subject.user_id), "submit_receipt")
            .await?;
        self.submit_receipt_for(tenant, &subject.user_id, submission)
            .await
    }

    /// POS-originated receipt: a service token submits on behalf of a
    /// player.
    pub async fn pos_purchase(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        target_user: &UserId,
        mut submission: ReceiptSubmission,
    ) -> EngineResult<ReceiptOutcome> {
        if !subject.role.is_service() {
            return Err(EngineError::Forbidden(
                "POS submissions require a service token".to_string(),
            ));
        }
        self.rate_limiter
            .check(&subject_key(&subject.user_id), "pos_purchase")
            .await?;
        submission.source = ReceiptSource::Pos;
        self.submit_receipt_for(tenant, target_user, submission).await
    }

    async fn submit_receipt_for(
        &self,
        tenant: &Tenant,
        user_id: &UserId,
        mut submission: ReceiptSubmission,
    ) -> EngineResult<ReceiptOutcome> {
        validate_submission(tenant, &mut submission)?;
        let hash = request_hash(
            &serde_json::to_value(&submission)
                .map_err(|e| EngineError::Internal(e.to_string()))?,
        );

        let _guard = self.lock_user(&tenant.id, user_id).await?;

        let events = self.active_events(&tenant.id).await?;
        let key = submission.idempotency_key.clone();
        let applied = self
            .apply_idempotent(&tenant.id, user_id, &key, &hash, |aggregate| {
                build_receipt_delta(tenant, aggregate, &submission, &events, Utc::now())
            })
            .await?;

        match applied {
            Applied::Fresh(_, outcome) => {
                self.fan_out_receipt(&tenant.id, user_id, &outcome).await;
                metrics::counter!("mallquest_receipts_total").increment(1);
                Ok(outcome)
            }
            Applied::Replayed(outcome) => Ok(outcome),
        }
    }

    async fn fan_out_receipt(
        &self,
        tenant: &TenantId,
        user: &UserId,
        outcome: &ReceiptOutcome,
    ) {
        if outcome.status != VerificationState::Verified {
            return;
        }
        self.hub
            .push(
                tenant,
                user,
                NotificationPriority::Normal,
                PushMessage::CoinCollected {
                    coins: outcome.reward.coins + outcome.reward.bonus,
                    xp: outcome.reward.xp,
                },
            )
            .await;
        for event in &outcome.events {
            let push = match event {
                DerivedEvent::LevelUp { from, to } => {
                    Some(PushMessage::LevelUp { from: *from, to: *to })
                }
                DerivedEvent::VipTierUp { from, to } => {
                    Some(PushMessage::VipTierUp { from: *from, to: *to })
                }
                DerivedEvent::MissionReady { mission_id } => MissionId::parse(mission_id)
                    .map(|mission_id| PushMessage::MissionReady { mission_id }),
                _ => None,
            };
            if let Some(message) = push {
                self.hub
                    .push(tenant, user, NotificationPriority::High, message)
                    .await;
            }
        }
    }

    // ==================== Missions ====================

    /// Create a personalized mission in the first free template slot.
    pub async fn generate_mission(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
    ) -> EngineResult<Mission> {
        self.rate_limiter
            .check(&subject_key(&subject.user_id), "gen_mission")
            .await?;
        let user_id = subject.user_id.clone();
        let _guard = self.lock_user(&tenant.id, &user_id).await?;

        let (_, mission) = self
            .apply_plain(&tenant.id, &user_id, |aggregate| {
                let template = missions::pick_template(aggregate).ok_or_else(|| {
                    EngineError::Conflict("all mission slots are active".to_string())
                })?;
                let mission = missions::generate(&template, &aggregate.user, Utc::now());
                let delta = UserDelta {
                    new_missions: vec![mission.clone()],
                    touch_last_active: Some(Utc::now()),
                    ..Default::default()
                };
                Ok((delta, mission))
            })
            .await?;
        Ok(mission)
    }

    /// Claim a ready-to-claim mission. Claiming debits nothing and
    /// credits the mission reward under the same delta machinery; a
    /// repeated claim returns the stored outcome.
    pub async fn claim_mission(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        mission_id: &MissionId,
        idempotency_key: Option<String>,
    ) -> EngineResult<MissionOutcome> {
        self.rate_limiter
            .check(&subject_key(&subject.user_id), "claim_mission")
            .await?;
        let user_id = subject.user_id.clone();
        let key = idempotency_key.unwrap_or_else(|| format!("claim-{mission_id}"));
        validate_idempotency_key(&key)?;
        let hash = request_hash(&serde_json::json!({
            "op": "claim_mission",
            "mission_id": mission_id.to_string(),
        }));

        let _guard = self.lock_user(&tenant.id, &user_id).await?;
        let policy = &tenant.policy;

        let applied = self
            .apply_idempotent(&tenant.id, &user_id, &key, &hash, |aggregate| {
                let mission = aggregate
                    .missions
                    .iter()
                    .find(|m| &m.id == mission_id)
                    .ok_or_else(|| EngineError::NotFound(format!("mission {mission_id}")))?;
                match mission.status {
                    MissionStatus::ReadyToClaim => {}
                    MissionStatus::Completed => {
                        return Err(EngineError::Conflict("mission already claimed".to_string()))
                    }
                    MissionStatus::Active => {
                        return Err(EngineError::Validation(
                            "mission is not ready to claim".to_string(),
                        ))
                    }
                    MissionStatus::Expired => {
                        return Err(EngineError::Validation("mission expired".to_string()))
                    }
                }

                let user = &aggregate.user;
                let reward = mission.reward;
                let xp_after = user.xp + reward.xp;
                let level_after = policy.level_for_xp(xp_after).max(user.level);
                let mut events = Vec::new();
                if level_after > user.level {
                    events.push(DerivedEvent::LevelUp {
                        from: user.level,
                        to: level_after,
                    });
                }

                let now = Utc::now();
                let delta = UserDelta {
                    coins_add: reward.coins,
                    xp_add: reward.xp,
                    set_level: Some(level_after),
                    mission_updates: vec![MissionUpdate {
                        mission_id: *mission_id,
                        progress: mission.progress,
                        status: MissionStatus::Completed,
                    }],
                    touch_last_active: Some(now),
                    ..Default::default()
                };
                let outcome = MissionOutcome {
                    mission_id: *mission_id,
                    reward,
                    user: UserTotals {
                        coins: user.coins + reward.coins,
                        xp: xp_after,
                        level: level_after,
                        vip_tier: user.vip_tier,
                        vip_points: user.vip_points,
                        streak: user.streak.days,
                    },
                    events,
                };
                Ok((delta, outcome))
            })
            .await?;

        let outcome = match applied {
            Applied::Fresh(_, outcome) => {
                self.hub
                    .push(
                        &tenant.id,
                        &user_id,
                        NotificationPriority::Normal,
                        PushMessage::CoinCollected {
                            coins: outcome.reward.coins,
                            xp: outcome.reward.xp,
                        },
                    )
                    .await;
                outcome
            }
            Applied::Replayed(outcome) => outcome,
        };
        Ok(outcome)
    }

    // ==================== Login progression ====================

    /// Streak and daily bonus for the first qualifying activity of a
    /// tenant-local day. Returns `None` when today already counted.
    pub async fn record_login(
        &self,
        tenant: &Tenant,
        user_id: &UserId,
    ) -> EngineResult<Option<DailyBonus>> {
        let _guard = self.lock_user(&tenant.id, user_id).await?;
        let policy = tenant.policy.clone();

        let (_, bonus) = self
            .apply_plain(&tenant.id, user_id, |aggregate| {
                let now = Utc::now();
                let today = policy.local_day(now);
                let (streak, changed) = aggregate.user.streak.advanced(today);
                if !changed {
                    return Ok((UserDelta::touch(now), None));
                }
                let benefits = aggregate.user.vip_tier.benefits();
                let streak_bonus = (streak.days as u64 * 2).min(20);
                let coins = (Decimal::from(benefits.daily_bonus + streak_bonus)
                    * benefits.coin_multiplier)
                    .round()
                    .to_u64()
                    .unwrap_or(0);
                // Base 10 XP plus 2 per streak day.
                let xp = 10 + streak.days as u64 * 2;
                let level_after = policy
                    .level_for_xp(aggregate.user.xp + xp)
                    .max(aggregate.user.level);
                let delta = UserDelta {
                    coins_add: coins,
                    xp_add: xp,
                    set_level: Some(level_after),
                    set_streak: Some(streak.clone()),
                    touch_last_active: Some(now),
                    ..Default::default()
                };
                Ok((
                    delta,
                    Some(DailyBonus {
                        coins,
                        xp,
                        streak_days: streak.days,
                    }),
                ))
            })
            .await?;

        if let Some(bonus) = &bonus {
            self.hub
                .push(
                    &tenant.id,
                    user_id,
                    NotificationPriority::Normal,
                    PushMessage::CoinCollected {
                        coins: bonus.coins,
                        xp: bonus.xp,
                    },
                )
                .await;
        }
        Ok(bonus)
    }

    // ==================== Reads ====================

    /// Dashboard snapshot; self or support staff only.
    pub async fn get_dashboard(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        target: &UserId,
    ) -> EngineResult<DashboardView> {
        if &subject.user_id != target
            && !matches!(subject.role, Role::Admin | Role::CustomerService)
        {
            return Err(EngineError::Forbidden(
                "cannot read another user's dashboard".to_string(),
            ));
        }
        self.rate_limiter
            .check(&subject_key(&subject.user_id), "read_user")
            .await?;

        let aggregate = self.load_aggregate(&tenant.id, target, false).await?;
        let now = Utc::now();
        let mut recent: Vec<Receipt> = aggregate.receipts.clone();
        recent.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        recent.truncate(10);

        Ok(DashboardView {
            user_id: aggregate.user.id.clone(),
            display_name: aggregate.user.display_name.clone(),
            language: aggregate.user.language.clone(),
            totals: UserTotals::of(&aggregate),
            achievement_points: aggregate.user.achievement_points,
            missions: aggregate.missions.clone(),
            achievements: aggregate.achievements.clone(),
            facilities: aggregate.facilities.clone(),
            companions: aggregate.companions.clone(),
            notifications: aggregate
                .notifications
                .iter()
                .filter(|n| !n.dismissed && !n.is_expired(now))
                .cloned()
                .collect(),
            recent_receipts: recent,
        })
    }

    /// Top-K leaderboard for a kind string from the URL.
    pub async fn leaderboard(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        kind: &str,
        k: usize,
    ) -> EngineResult<Vec<LeaderboardEntry>> {
        self.rate_limiter
            .check(&subject_key(&subject.user_id), "read_board")
            .await?;
        let kind = LeaderboardKind::from_str(kind)
            .ok_or_else(|| EngineError::Validation(format!("unknown leaderboard kind {kind}")))?;
        Ok(self.store.leaderboard(&tenant.id, kind, k).await?)
    }

    /// Undismissed, unexpired notifications, newest first.
    pub async fn list_notifications(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
    ) -> EngineResult<Vec<Notification>> {
        let aggregate = self
            .load_aggregate(&tenant.id, &subject.user_id, false)
            .await?;
        let now = Utc::now();
        let mut notifications: Vec<Notification> = aggregate
            .notifications
            .into_iter()
            .filter(|n| !n.dismissed && !n.is_expired(now))
            .collect();
        notifications.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notifications)
    }

    /// Mark a notification read, optionally dismissing it.
    pub async fn mark_notification(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        notification: &NotificationId,
        dismiss: bool,
    ) -> EngineResult<()> {
        let updated = self
            .store
            .update_notification(&tenant.id, &subject.user_id, notification, true, dismiss)
            .await?;
        if !updated {
            return Err(EngineError::NotFound(format!(
                "notification {notification}"
            )));
        }
        self.invalidate_user(&tenant.id, &subject.user_id).await;
        Ok(())
    }

    // ==================== Empire ====================

    /// Buy a facility: level gate plus an atomic coin debit.
    pub async fn purchase_facility(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        type_name: &str,
    ) -> EngineResult<Facility> {
        let facility_type = FacilityType::from_str(type_name)
            .ok_or_else(|| EngineError::Validation(format!("unknown facility type {type_name}")))?;
        let user_id = subject.user_id.clone();
        let _guard = self.lock_user(&tenant.id, &user_id).await?;

        let (_, facility) = self
            .apply_plain(&tenant.id, &user_id, |aggregate| {
                let user = &aggregate.user;
                if user.level < facility_type.unlock_level() {
                    return Err(EngineError::Validation(format!(
                        "level {} required to unlock {}",
                        facility_type.unlock_level(),
                        facility_type.as_str()
                    )));
                }
                let cost = facility_type.base_cost();
                if user.coins < cost {
                    return Err(EngineError::Validation("insufficient coins".to_string()));
                }
                let now = Utc::now();
                let facility = Facility::new(user.id.clone(), facility_type, now);
                let delta = UserDelta {
                    facility_ops: vec![FacilityOp::Add {
                        facility: facility.clone(),
                        cost,
                    }],
                    touch_last_active: Some(now),
                    ..Default::default()
                };
                Ok((delta, facility))
            })
            .await?;
        Ok(facility)
    }

    /// Upgrade a facility one level, debiting the upgrade cost
    /// atomically with the level increment.
    pub async fn upgrade_facility(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        facility_id: &FacilityId,
    ) -> EngineResult<Facility> {
        let user_id = subject.user_id.clone();
        let _guard = self.lock_user(&tenant.id, &user_id).await?;

        let (aggregate, _) = self
            .apply_plain(&tenant.id, &user_id, |aggregate| {
                let facility = aggregate
                    .facilities
                    .iter()
                    .find(|f| &f.id == facility_id)
                    .ok_or_else(|| EngineError::NotFound(format!("facility {facility_id}")))?;
                let cost = facility.upgrade_cost().ok_or_else(|| {
                    EngineError::Validation("facility is at max level".to_string())
                })?;
                if aggregate.user.coins < cost {
                    return Err(EngineError::Validation("insufficient coins".to_string()));
                }
                let delta = UserDelta {
                    facility_ops: vec![FacilityOp::Upgrade {
                        id: *facility_id,
                        cost,
                    }],
                    touch_last_active: Some(Utc::now()),
                    ..Default::default()
                };
                Ok((delta, ()))
            })
            .await?;

        aggregate
            .facilities
            .iter()
            .find(|f| &f.id == facility_id)
            .cloned()
            .ok_or_else(|| EngineError::Internal("facility vanished after upgrade".to_string()))
    }

    /// Move a facility's pending income into coins.
    pub async fn collect_facility(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        facility_id: &FacilityId,
    ) -> EngineResult<u64> {
        let user_id = subject.user_id.clone();
        let _guard = self.lock_user(&tenant.id, &user_id).await?;

        let (_, collected) = self
            .apply_plain(&tenant.id, &user_id, |aggregate| {
                let facility = aggregate
                    .facilities
                    .iter()
                    .find(|f| &f.id == facility_id)
                    .ok_or_else(|| EngineError::NotFound(format!("facility {facility_id}")))?;
                let pending = facility.pending_income;
                if pending == 0 {
                    return Ok((UserDelta::touch(Utc::now()), 0));
                }
                let delta = UserDelta {
                    facility_ops: vec![FacilityOp::Collect { id: *facility_id }],
                    touch_last_active: Some(Utc::now()),
                    ..Default::default()
                };
                Ok((delta, pending))
            })
            .await?;
        Ok(collected)
    }

    // ==================== Companions ====================

    pub async fn adopt_companion(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        name: &str,
        type_name: &str,
    ) -> EngineResult<Companion> {
        let companion_type = CompanionType::from_str(type_name).ok_or_else(|| {
            EngineError::Validation(format!("unknown companion type {type_name}"))
        })?;
        let name = name.trim();
        if name.is_empty() || name.chars().count() > 40 {
            return Err(EngineError::Validation(
                "companion name must be 1-40 characters".to_string(),
            ));
        }
        let user_id = subject.user_id.clone();
        let _guard = self.lock_user(&tenant.id, &user_id).await?;

        let (_, companion) = self
            .apply_plain(&tenant.id, &user_id, |aggregate| {
                if aggregate.companions.len() >= COMPANION_LIMIT {
                    return Err(EngineError::Validation(format!(
                        "at most {COMPANION_LIMIT} companions"
                    )));
                }
                let now = Utc::now();
                let companion =
                    Companion::new(aggregate.user.id.clone(), name, companion_type, now);
                let delta = UserDelta {
                    companion_ops: vec![CompanionOp::Add {
                        companion: companion.clone(),
                    }],
                    touch_last_active: Some(now),
                    ..Default::default()
                };
                Ok((delta, companion))
            })
            .await?;
        Ok(companion)
    }

    pub async fn feed_companion(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        companion_id: &CompanionId,
        food_name: &str,
    ) -> EngineResult<Companion> {
        let food = companion::food_catalog()
            .into_iter()
            .find(|f| f.name == food_name)
            .ok_or_else(|| EngineError::Validation(format!("unknown food {food_name}")))?;
        self.care_for_companion(tenant, subject, companion_id, move |companion, now| {
            companion.feed(&food, now);
            food.cost
        })
        .await
    }

    pub async fn entertain_companion(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        companion_id: &CompanionId,
        activity_name: &str,
    ) -> EngineResult<Companion> {
        let activity = companion::activity_catalog()
            .into_iter()
            .find(|a| a.name == activity_name)
            .ok_or_else(|| EngineError::Validation(format!("unknown activity {activity_name}")))?;
        self.care_for_companion(tenant, subject, companion_id, move |companion, now| {
            companion.entertain(&activity, now);
            activity.cost
        })
        .await
    }

    async fn care_for_companion(
        &self,
        tenant: &Tenant,
        subject: &AuthSubject,
        companion_id: &CompanionId,
        action: impl Fn(&mut Companion, DateTime<Utc>) -> u64,
    ) -> EngineResult<Companion> {
        let user_id = subject.user_id.clone();
        let _guard = self.lock_user(&tenant.id, &user_id).await?;

        let (_, companion) = self
            .apply_plain(&tenant.id, &user_id, |aggregate| {
                let companion = aggregate
                    .companions
                    .iter()
                    .find(|c| &c.id == companion_id)
                    .ok_or_else(|| EngineError::NotFound(format!("companion {companion_id}")))?;
                let now = Utc::now();
                let mut updated = companion.clone();
                let cost = action(&mut updated, now);
                if aggregate.user.coins < cost {
                    return Err(EngineError::Validation("insufficient coins".to_string()));
                }
                let delta = UserDelta {
                    companion_ops: vec![CompanionOp::Replace {
                        companion: updated.clone(),
                        cost,
                    }],
                    touch_last_active: Some(now),
                    ..Default::default()
                };
                Ok((delta, updated))
            })
            .await?;
        Ok(companion)
    }

    // ==================== Internals ====================

    async fn lock_user(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> EngineResult<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.user_locks.lock().await;
            locks
                .entry((tenant.as_str().to_string(), user.as_str().to_string()))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        match tokio::time::timeout(BUSY_TIMEOUT, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                metrics::counter!("mallquest_busy_rejections_total").increment(1);
                Err(EngineError::Busy)
            }
        }
    }

    fn cache_key(tenant: &TenantId, user: &UserId) -> String {
        format!("user:{}:{}", tenant.as_str(), user.as_str())
    }

    async fn load_aggregate(
        &self,
        tenant: &TenantId,
        user: &UserId,
        bypass_cache: bool,
    ) -> EngineResult<UserAggregate> {
        let key = Self::cache_key(tenant, user);
        if !bypass_cache {
            if let Some(aggregate) = self.user_cache.get(&key).await {
                return Ok(aggregate);
            }
        }
        let aggregate = self
            .store
            .load_user(tenant, user)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {user}")))?;
        self.user_cache.put(&key, aggregate.clone()).await;
        Ok(aggregate)
    }

    async fn invalidate_user(&self, tenant: &TenantId, user: &UserId) {
        self.user_cache
            .invalidate(&Self::cache_key(tenant, user))
            .await;
    }

    async fn cache_put(&self, aggregate: &UserAggregate) {
        let key = Self::cache_key(&aggregate.user.tenant_id, &aggregate.user.id);
        self.user_cache.put(&key, aggregate.clone()).await;
    }

    async fn active_events(&self, tenant: &TenantId) -> EngineResult<Vec<MallEvent>> {
        let now = Utc::now();
        let events = self.store.list_events(tenant).await?;
        Ok(events.into_iter().filter(|e| e.is_active(now)).collect())
    }

    /// Optimistic apply loop without idempotency (mission generation,
    /// empire, companions). The builder re-runs against a fresh
    /// snapshot on every version conflict.
    async fn apply_plain<R>(
        &self,
        tenant: &TenantId,
        user: &UserId,
        build: impl Fn(&UserAggregate) -> EngineResult<(UserDelta, R)>,
    ) -> EngineResult<(UserAggregate, R)> {
        let mut attempts = 0u32;
        loop {
            let aggregate = self.load_aggregate(tenant, user, attempts > 0).await?;
            let (delta, outcome) = build(&aggregate)?;
            if !delta.is_material() && delta.touch_last_active.is_none() {
                return Ok((aggregate, outcome));
            }
            match self
                .store
                .apply_user_delta(tenant, user, &delta, Some(aggregate.user.version), None)
                .await
            {
                Ok(updated) => {
                    self.cache_put(&updated).await;
                    return Ok((updated, outcome));
                }
                Err(StoreError::VersionConflict { .. }) if attempts < MAX_VERSION_RETRIES => {
                    attempts += 1;
                    self.invalidate_user(tenant, user).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Optimistic apply loop with an idempotency record committed in
    /// the same transaction. A replay under the same key and payload
    /// returns the stored response unchanged.
    async fn apply_idempotent<R>(
        &self,
        tenant: &TenantId,
        user: &UserId,
        key: &str,
        request_hash: &str,
        build: impl Fn(&UserAggregate) -> EngineResult<(UserDelta, R)>,
    ) -> EngineResult<Applied<R>>
    where
        R: Serialize + DeserializeOwned,
    {
        if let Some(record) = self.store.get_idempotency(tenant, user, key).await? {
            if record.matches_request(request_hash) {
                let outcome = serde_json::from_value(record.response.clone())
                    .map_err(|e| EngineError::Internal(e.to_string()))?;
                return Ok(Applied::Replayed(outcome));
            }
            return Err(EngineError::Conflict(format!(
                "idempotency key {key} was used with a different payload"
            )));
        }

        let mut attempts = 0u32;
        loop {
            let aggregate = self.load_aggregate(tenant, user, attempts > 0).await?;
            let (delta, outcome) = build(&aggregate)?;
            let response = serde_json::to_value(&outcome)
                .map_err(|e| EngineError::Internal(e.to_string()))?;
            let record = IdempotencyRecord::new(key, request_hash, response, Utc::now());
            match self
                .store
                .apply_user_delta(tenant, user, &delta, Some(aggregate.user.version), Some(record))
                .await
            {
                Ok(updated) => {
                    self.cache_put(&updated).await;
                    return Ok(Applied::Fresh(Box::new(updated), outcome));
                }
                Err(StoreError::VersionConflict { .. }) if attempts < MAX_VERSION_RETRIES => {
                    attempts += 1;
                    self.invalidate_user(tenant, user).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn subject_key(user: &UserId) -> String {
    format!("user:{user}")
}

fn validate_idempotency_key(key: &str) -> EngineResult<()> {
    if key.is_empty() || key.len() > 128 {
        return Err(EngineError::Validation(
            "idempotency key must be 1-128 characters".to_string(),
        ));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(EngineError::Validation(
            "idempotency key contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

/// HTML-escape a store name; the stored value is render-safe.
fn sanitize_store_name(store: &str) -> String {
    let mut out = String::with_capacity(store.len());
    for c in store.trim().chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Guess a category from the store name when the client omits one.
fn infer_category(store: &str) -> String {
    let lowered = store.to_ascii_lowercase();
    for category in [
        "fashion",
        "electronics",
        "food",
        "luxury",
        "books",
        "sports",
        "beauty",
        "home",
    ] {
        if lowered.contains(category) {
            return category.to_string();
        }
    }
    "general".to_string()
}

fn validate_submission(
    tenant: &Tenant,
    submission: &mut ReceiptSubmission,
) -> EngineResult<()> {
    let policy = &tenant.policy;
    if submission.amount <= Decimal::ZERO {
        return Err(EngineError::Validation(
            "amount must be positive".to_string(),
        ));
    }
    submission.amount = submission.amount.round_dp(2);
    if submission.amount > policy.max_receipt_amount {
        return Err(EngineError::Validation(format!(
            "amount exceeds the {} maximum",
            policy.max_receipt_amount
        )));
    }
    let trimmed = submission.store.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation("store name is required".to_string()));
    }
    if trimmed.chars().count() > 100 {
        return Err(EngineError::Validation(
            "store name must be at most 100 characters".to_string(),
        ));
    }
    submission.store = sanitize_store_name(trimmed);
    submission.category = Some(match submission.category.take() {
        Some(category) if !category.trim().is_empty() => category.trim().to_ascii_lowercase(),
        _ => infer_category(&submission.store),
    });
    validate_idempotency_key(&submission.idempotency_key)
}

fn build_receipt_delta(
    tenant: &Tenant,
    aggregate: &UserAggregate,
    submission: &ReceiptSubmission,
    events: &[MallEvent],
    now: DateTime<Utc>,
) -> EngineResult<(UserDelta, ReceiptOutcome)> {
    let policy = &tenant.policy;
    let user = &aggregate.user;
    let category = submission
        .category
        .clone()
        .unwrap_or_else(|| "general".to_string());

    let window = chrono::Duration::minutes(policy.duplicate_window_mins);
    let recent_same_store = aggregate.receipts_for_store_since(&submission.store, now - window);

    let input = RewardInput {
        user,
        amount: submission.amount,
        store: &submission.store,
        category: &category,
        declared_ssid: submission.ssid.as_deref(),
        recent_same_store,
        source: submission.source,
    };
    let computed = reward::evaluate(&input, policy, events, now)?;

    let suspicious = !computed.fraud.is_empty();
    let state = if suspicious {
        VerificationState::Suspicious
    } else {
        VerificationState::Verified
    };

    let receipt = Receipt {
        id: ReceiptId::generate(),
        tenant_id: tenant.id.clone(),
        user_id: user.id.clone(),
        store: submission.store.clone(),
        category: category.clone(),
        amount: submission.amount,
        currency: "AED".to_string(),
        submitted_at: now,
        idempotency_key: submission.idempotency_key.clone(),
        source: submission.source,
        state,
        reward: Some(mq_core::types::RewardSnapshot {
            coins: computed.coins,
            xp: computed.xp,
            bonus_coins: computed.bonus_coins,
            vip_points: computed.vip_points,
            multipliers: computed.multipliers.clone(),
            event_ids: computed.applied_event_ids.clone(),
        }),
    };
    let receipt_id = receipt.id;

    let reward_summary = RewardSummary {
        coins: computed.coins,
        xp: computed.xp,
        bonus: computed.bonus_coins,
        multipliers: computed.multipliers.clone(),
    };

    if suspicious {
        tracing::warn!(
            tenant_id = %tenant.id,
            user_id = %user.id,
            receipt_id = %receipt_id,
            signals = ?computed.fraud,
            "receipt flagged suspicious; credit withheld"
        );
        // Credit withheld pending review: persist the receipt and its
        // audit snapshot, nothing else.
        let delta = UserDelta {
            receipt: Some(receipt),
            touch_last_active: Some(now),
            ..Default::default()
        };
        let outcome = ReceiptOutcome {
            receipt_id,
            status: state,
            reward: reward_summary,
            user: UserTotals::of(aggregate),
            events: Vec::new(),
        };
        return Ok((delta, outcome));
    }

    // Mission progress rides in the same transaction.
    let first_visit = !user.visited_categories.contains(&category);
    let mission_updates =
        missions::evaluate_receipt(aggregate, submission.amount, &category, first_visit, now);

    let mut events_out = computed.events.clone();
    let mut notifications = Vec::new();
    let mut updates = Vec::new();
    for (mission, became_ready) in &mission_updates {
        updates.push(MissionUpdate {
            mission_id: mission.id,
            progress: mission.progress,
            status: mission.status,
        });
        if *became_ready {
            events_out.push(DerivedEvent::MissionReady {
                mission_id: mission.id.to_string(),
            });
            notifications.push(Notification::new(
                user.id.clone(),
                NotificationKind::MissionReady,
                NotificationPriority::High,
                serde_json::json!({ "mission_id": mission.id, "template": mission.template_id }),
                now,
            ));
        }
    }

    for event in &computed.events {
        let (kind, priority, payload) = match event {
            DerivedEvent::LevelUp { from, to } => (
                NotificationKind::LevelUp,
                NotificationPriority::High,
                serde_json::json!({ "from": from, "to": to }),
            ),
            DerivedEvent::VipTierUp { from, to } => (
                NotificationKind::VipTierUp,
                NotificationPriority::High,
                serde_json::json!({ "from": from, "to": to }),
            ),
            DerivedEvent::AchievementUnlocked { name } => (
                NotificationKind::AchievementUnlocked,
                NotificationPriority::Normal,
                serde_json::json!({ "name": name }),
            ),
            _ => continue,
        };
        notifications.push(Notification::new(user.id.clone(), kind, priority, payload, now));
    }

    let achievements = computed
        .achievements
        .iter()
        .map(|kind| Achievement::new(user.id.clone(), kind.clone(), now))
        .collect();

    let delta = UserDelta {
        coins_add: computed.total_coins(),
        xp_add: computed.xp,
        vip_points_add: computed.vip_points,
        achievement_points_add: computed.achievement_points,
        spending_add: submission.amount,
        purchases_add: 1,
        set_level: Some(computed.level_after),
        set_vip_tier: Some(computed.tier_after),
        set_streak: Some(computed.streak.clone()),
        add_visited_category: Some(category),
        receipt: Some(receipt),
        achievements,
        mission_updates: updates,
        notifications,
        touch_last_active: Some(now),
        ..Default::default()
    };

    let outcome = ReceiptOutcome {
        receipt_id,
        status: state,
        reward: reward_summary,
        user: UserTotals {
            coins: user.coins + computed.total_coins(),
            xp: user.xp + computed.xp,
            level: computed.level_after,
            vip_tier: computed.tier_after,
            vip_points: user.vip_points + computed.vip_points,
            streak: computed.streak.days,
        },
        events: events_out,
    };
    Ok((delta, outcome))
}

#[cfg(test)]
mod tests;
