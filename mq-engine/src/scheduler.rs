//! Background scheduler: a cooperative loop with per-job cadences.
//!
//! One task drives every job from a single `select` loop, so a job can
//! never overlap with itself. Each job is restartable and idempotent
//! at the granularity of its work unit; a version conflict on one user
//! just leaves that user for the next tick.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info};

use mq_core::delta::{CompanionOp, FacilityOp, MissionUpdate, UserDelta};
use mq_core::types::mission::template_catalog;
use mq_core::types::{
    CompanionAlert, MissionStatus, Notification, NotificationKind, NotificationPriority,
};
use mq_store::{ShardedStore, Store, StoreError, StoreResult, UserAggregate};

use crate::cache::SmartCache;
use crate::coordinator::Coordinator;
use crate::notify::{NotificationHub, PushMessage};

/// Job cadences and batch bounds.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub empire_interval_secs: u64,
    pub mission_expiry_interval_secs: u64,
    pub streak_reset_interval_secs: u64,
    pub notification_sweep_interval_secs: u64,
    pub session_cleanup_interval_secs: u64,
    pub cache_refresh_interval_secs: u64,
    pub companion_decay_interval_secs: u64,
    /// Users visited per job tick.
    pub batch_size: usize,
    /// Companion stat decay per tick.
    pub decay_amount: u8,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            empire_interval_secs: 60,
            mission_expiry_interval_secs: 300,
            streak_reset_interval_secs: 300,
            notification_sweep_interval_secs: 3_600,
            session_cleanup_interval_secs: 900,
            cache_refresh_interval_secs: 600,
            companion_decay_interval_secs: 600,
            batch_size: 500,
            decay_amount: 2,
        }
    }
}

/// Periodic worker over the sharded store.
pub struct BackgroundScheduler {
    store: Arc<ShardedStore>,
    hub: Arc<NotificationHub>,
    user_cache: Arc<SmartCache<UserAggregate>>,
    template_cache: Arc<SmartCache<serde_json::Value>>,
    config: SchedulerConfig,
}

impl BackgroundScheduler {
    pub fn new(
        store: Arc<ShardedStore>,
        hub: Arc<NotificationHub>,
        user_cache: Arc<SmartCache<UserAggregate>>,
        template_cache: Arc<SmartCache<serde_json::Value>>,
    ) -> Self {
        Self {
            store,
            hub,
            user_cache,
            template_cache,
            config: SchedulerConfig::default(),
        }
    }

    /// Share the coordinator's caches and hub.
    pub fn for_coordinator(coordinator: &Coordinator) -> Self {
        Self::new(
            coordinator.store().clone(),
            coordinator.hub().clone(),
            coordinator.user_cache().clone(),
            coordinator.template_cache().clone(),
        )
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the scheduler loop.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let running = Arc::new(RwLock::new(true));
        let running_loop = running.clone();

        let Self {
            store,
            hub,
            user_cache,
            template_cache,
            config,
        } = self;

        tokio::spawn(async move {
            let mut empire_timer = interval(Duration::from_secs(config.empire_interval_secs));
            let mut mission_timer =
                interval(Duration::from_secs(config.mission_expiry_interval_secs));
            let mut streak_timer =
                interval(Duration::from_secs(config.streak_reset_interval_secs));
            let mut sweep_timer =
                interval(Duration::from_secs(config.notification_sweep_interval_secs));
            let mut session_timer =
                interval(Duration::from_secs(config.session_cleanup_interval_secs));
            let mut cache_timer =
                interval(Duration::from_secs(config.cache_refresh_interval_secs));
            let mut decay_timer =
                interval(Duration::from_secs(config.companion_decay_interval_secs));

            info!("background scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("background scheduler received shutdown signal");
                        break;
                    }
                    _ = empire_timer.tick() => {
                        if *running_loop.read().await {
                            log_job("empire_accrual",
                                jobs::accrue_empire_income(&store, &hub, config.batch_size, Utc::now()).await);
                        }
                    }
                    _ = mission_timer.tick() => {
                        if *running_loop.read().await {
                            log_job("mission_expiry",
                                jobs::expire_missions(&store, config.batch_size, Utc::now()).await);
                        }
                    }
                    _ = streak_timer.tick() => {
                        if *running_loop.read().await {
                            log_job("streak_reset",
                                jobs::reset_streaks(&store, config.batch_size, Utc::now()).await);
                        }
                    }
                    _ = sweep_timer.tick() => {
                        if *running_loop.read().await {
                            log_job("notification_sweep",
                                jobs::sweep_notifications(&store, config.batch_size, Utc::now()).await);
                        }
                    }
                    _ = session_timer.tick() => {
                        if *running_loop.read().await {
                            log_job("session_cleanup",
                                jobs::cleanup_sessions(&store, Utc::now()).await);
                        }
                    }
                    _ = cache_timer.tick() => {
                        if *running_loop.read().await {
                            log_job("cache_refresh",
                                jobs::refresh_caches(&store, &user_cache, &template_cache).await);
                        }
                    }
                    _ = decay_timer.tick() => {
                        if *running_loop.read().await {
                            log_job("companion_decay",
                                jobs::decay_companions(&store, config.batch_size, config.decay_amount, Utc::now()).await);
                        }
                    }
                }
            }
            info!("background scheduler stopped");
        });

        SchedulerHandle {
            shutdown_tx,
            running,
        }
    }
}

fn log_job(name: &str, result: StoreResult<u64>) {
    match result {
        Ok(0) => {}
        Ok(processed) => {
            debug!(job = name, processed, "background job finished");
            metrics::counter!("mallquest_scheduler_work_units_total", "job" => name.to_string())
                .increment(processed);
        }
        Err(err) => error!(job = name, error = %err, "background job failed"),
    }
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    running: Arc<RwLock<bool>>,
}

impl SchedulerHandle {
    pub async fn stop(self) {
        *self.running.write().await = false;
        let _ = self.shutdown_tx.send(()).await;
    }

    pub async fn pause(&self) {
        *self.running.write().await = false;
    }

    pub async fn resume(&self) {
        *self.running.write().await = true;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// The individual jobs, callable directly so tests drive single ticks.
pub mod jobs {
    use super::*;

    /// Credit pending empire income for facilities that are due.
    /// Coins move only when the user collects.
    pub async fn accrue_empire_income(
        store: &Arc<ShardedStore>,
        hub: &Arc<NotificationHub>,
        batch: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut processed = 0;
        for aggregate in store.scan_users(None, batch).await? {
            if aggregate.facilities.is_empty() {
                continue;
            }
            let mut ops = Vec::new();
            let mut pushes = Vec::new();
            for facility in &aggregate.facilities {
                let mut projected = facility.clone();
                let credited = projected.accrue(now);
                if credited > 0 {
                    ops.push(FacilityOp::Accrue {
                        id: facility.id,
                        pending_add: credited,
                        collected_at: projected.last_collected_at,
                    });
                    pushes.push(PushMessage::EmpireIncomeReady {
                        facility_id: facility.id,
                        pending: projected.pending_income,
                    });
                }
            }
            if ops.is_empty() {
                continue;
            }
            let delta = UserDelta {
                facility_ops: ops,
                ..Default::default()
            };
            match store
                .apply_user_delta(
                    &aggregate.user.tenant_id,
                    &aggregate.user.id,
                    &delta,
                    Some(aggregate.user.version),
                    None,
                )
                .await
            {
                Ok(_) => {
                    for push in pushes {
                        hub.push(
                            &aggregate.user.tenant_id,
                            &aggregate.user.id,
                            NotificationPriority::Low,
                            push,
                        )
                        .await;
                    }
                    processed += 1;
                }
                Err(StoreError::VersionConflict { .. }) => {
                    // A live request won the race; next tick catches up.
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(processed)
    }

    /// Transition active missions past their expiry.
    pub async fn expire_missions(
        store: &Arc<ShardedStore>,
        batch: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut processed = 0;
        for aggregate in store.scan_users(None, batch).await? {
            let expired: Vec<_> = aggregate
                .missions
                .iter()
                .filter(|m| m.is_expired(now))
                .collect();
            if expired.is_empty() {
                continue;
            }
            let mut updates = Vec::new();
            let mut notifications = Vec::new();
            for mission in expired {
                updates.push(MissionUpdate {
                    mission_id: mission.id,
                    progress: mission.progress,
                    status: MissionStatus::Expired,
                });
                notifications.push(Notification::new(
                    aggregate.user.id.clone(),
                    NotificationKind::MissionExpired,
                    NotificationPriority::Low,
                    json!({ "mission_id": mission.id, "template": mission.template_id }),
                    now,
                ));
            }
            let delta = UserDelta {
                mission_updates: updates,
                notifications,
                ..Default::default()
            };
            match store
                .apply_user_delta(
                    &aggregate.user.tenant_id,
                    &aggregate.user.id,
                    &delta,
                    Some(aggregate.user.version),
                    None,
                )
                .await
            {
                Ok(_) => processed += 1,
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(processed)
    }

    /// Reset streaks for users who skipped a day, using each tenant's
    /// local calendar.
    pub async fn reset_streaks(
        store: &Arc<ShardedStore>,
        batch: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut processed = 0;
        for tenant in store.list_tenants().await? {
            let today = tenant.policy.local_day(now);
            for aggregate in store.scan_users(Some(&tenant.id), batch).await? {
                let streak = &aggregate.user.streak;
                if streak.days == 0 {
                    continue;
                }
                let broken = match streak.last_day {
                    Some(last) => today - last > chrono::Duration::days(1),
                    None => true,
                };
                if !broken {
                    continue;
                }
                let delta = UserDelta {
                    set_streak: Some(mq_core::types::StreakState {
                        days: 0,
                        last_day: streak.last_day,
                    }),
                    ..Default::default()
                };
                match store
                    .apply_user_delta(
                        &tenant.id,
                        &aggregate.user.id,
                        &delta,
                        Some(aggregate.user.version),
                        None,
                    )
                    .await
                {
                    Ok(_) => processed += 1,
                    Err(StoreError::VersionConflict { .. }) => continue,
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(processed)
    }

    /// Delete notifications past their expiry.
    pub async fn sweep_notifications(
        store: &Arc<ShardedStore>,
        batch: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut removed = 0;
        for aggregate in store.scan_users(None, batch).await? {
            if aggregate.notifications.is_empty() {
                continue;
            }
            removed += store
                .sweep_notifications(&aggregate.user.tenant_id, &aggregate.user.id, now)
                .await? as u64;
        }
        Ok(removed)
    }

    /// Delete sessions past their refresh expiry and stale rate
    /// buckets.
    pub async fn cleanup_sessions(
        store: &Arc<ShardedStore>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let sessions = store.delete_expired_sessions(now).await?;
        // Buckets older than an hour can no longer influence any
        // window decision.
        let buckets = store.prune_rate_buckets(now.timestamp() - 3_600).await?;
        Ok(sessions + buckets)
    }

    /// Re-materialize the mission-template cache per tenant and purge
    /// expired user snapshots.
    pub async fn refresh_caches(
        store: &Arc<ShardedStore>,
        user_cache: &Arc<SmartCache<UserAggregate>>,
        template_cache: &Arc<SmartCache<serde_json::Value>>,
    ) -> StoreResult<u64> {
        let mut refreshed = 0;
        for tenant in store.list_tenants().await? {
            let rendered: Vec<serde_json::Value> = template_catalog()
                .iter()
                .map(|template| {
                    json!({
                        "slot": template.slot,
                        "kind": template.kind,
                        "target_range": [template.target_range.0, template.target_range.1],
                        "reward_range": [template.reward_range.0, template.reward_range.1],
                    })
                })
                .collect();
            template_cache
                .put(
                    &format!("templates:{}", tenant.id),
                    serde_json::Value::Array(rendered),
                )
                .await;
            refreshed += 1;
        }
        user_cache.purge_expired().await;
        Ok(refreshed)
    }

    /// Decay companion stats and persist care alerts when a stat
    /// crosses its threshold.
    pub async fn decay_companions(
        store: &Arc<ShardedStore>,
        batch: usize,
        amount: u8,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut processed = 0;
        for aggregate in store.scan_users(None, batch).await? {
            if aggregate.companions.is_empty() {
                continue;
            }
            let mut notifications = Vec::new();
            for companion in &aggregate.companions {
                let mut projected = companion.clone();
                for alert in projected.decay(amount) {
                    let kind = match alert {
                        CompanionAlert::Hungry => NotificationKind::DeerHungry,
                        CompanionAlert::Bored => NotificationKind::DeerBored,
                    };
                    notifications.push(Notification::new(
                        aggregate.user.id.clone(),
                        kind,
                        NotificationPriority::Normal,
                        json!({ "companion_id": companion.id, "name": companion.name }),
                        now,
                    ));
                }
            }
            let delta = UserDelta {
                companion_ops: vec![CompanionOp::DecayAll { amount }],
                notifications,
                ..Default::default()
            };
            match store
                .apply_user_delta(
                    &aggregate.user.tenant_id,
                    &aggregate.user.id,
                    &delta,
                    Some(aggregate.user.version),
                    None,
                )
                .await
            {
                Ok(_) => processed += 1,
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(processed)
    }
}
