//! The sharded store front-end.
//!
//! Routes each operation to its owning shard, retries transient
//! driver errors with jittered backoff, and implements gather-scatter
//! reads (leaderboards) with a per-shard cap and a merge step.
//!
//! Routing: user rows shard by `hash(tenant, user) mod N`; registry
//! tables (tenants, events) and the session table live on the first
//! shard; rate-limit buckets shard by subject.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use mq_core::delta::UserDelta;
use mq_core::types::{
    MallEvent, NotificationId, Session, Tenant, TenantId, User, UserId,
};

use crate::aggregate::UserAggregate;
use crate::backend::memory::MemoryStore;
use crate::backend::sled::SledStore;
use crate::backend::{Store, StoreStats};
use crate::error::StoreResult;
use crate::idempotency::IdempotencyRecord;
use crate::shard::{key_shard, shard_of};

/// Gather-scatter reads pull at most this many rows per shard.
const PER_SHARD_SCAN_CAP: usize = 100;

/// Jittered backoff for transient errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            jitter_ms: 25,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay_ms * 2u64.pow(attempt.saturating_sub(1));
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(backoff + jitter)
    }
}

/// Leaderboard kinds exposed by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderboardKind {
    Coins,
    Xp,
    Streak,
    Achievements,
    Spending,
}

impl LeaderboardKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "coins" => Some(Self::Coins),
            "xp" => Some(Self::Xp),
            "streak" => Some(Self::Streak),
            "achievements" => Some(Self::Achievements),
            "spending" => Some(Self::Spending),
            _ => None,
        }
    }

    fn score(&self, aggregate: &UserAggregate) -> u64 {
        match self {
            Self::Coins => aggregate.user.coins,
            Self::Xp => aggregate.user.xp,
            Self::Streak => aggregate.user.streak.days as u64,
            Self::Achievements => aggregate.user.achievement_points,
            Self::Spending => aggregate.user.total_spent.trunc().to_u64().unwrap_or(0),
        }
    }
}

/// One merged leaderboard row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LeaderboardEntry {
    pub user_id: UserId,
    pub display_name: String,
    pub level: u32,
    pub value: u64,
}

/// Shard router plus retry wrapper. Implements [`Store`] so callers
/// never see shard topology.
pub struct ShardedStore {
    shards: Vec<Arc<dyn Store>>,
    retry: RetryPolicy,
}

impl ShardedStore {
    pub fn new(shards: Vec<Arc<dyn Store>>) -> Self {
        assert!(!shards.is_empty(), "at least one shard is required");
        Self {
            shards,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// All-memory topology for tests and development.
    pub fn in_memory(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Arc::new(MemoryStore::new()) as Arc<dyn Store>)
            .collect();
        Self::new(shards)
    }

    /// Sled topology: one database per shard under `data_dir`.
    pub fn open_sled<P: AsRef<Path>>(data_dir: P, shard_count: usize) -> StoreResult<Self> {
        let mut shards: Vec<Arc<dyn Store>> = Vec::new();
        for index in 0..shard_count.max(1) {
            let path = data_dir.as_ref().join(format!("shard-{index}"));
            shards.push(Arc::new(SledStore::open(path)?));
        }
        Ok(Self::new(shards))
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn user_shard(&self, tenant: &TenantId, user: &UserId) -> &Arc<dyn Store> {
        &self.shards[shard_of(tenant, user, self.shards.len())]
    }

    fn subject_shard(&self, subject: &str) -> &Arc<dyn Store> {
        &self.shards[key_shard(subject, self.shards.len())]
    }

    /// Registry tables live on the first shard.
    fn registry(&self) -> &Arc<dyn Store> {
        &self.shards[0]
    }

    async fn retrying<T, F, Fut>(&self, mut op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    tracing::warn!(
                        attempt,
                        error = %err,
                        "transient store error, retrying"
                    );
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Top-K across all shards: bounded per-shard scan, score, merge.
    pub async fn leaderboard(
        &self,
        tenant: &TenantId,
        kind: LeaderboardKind,
        k: usize,
    ) -> StoreResult<Vec<LeaderboardEntry>> {
        let k = k.min(PER_SHARD_SCAN_CAP);
        let mut entries = Vec::new();
        for shard in &self.shards {
            let aggregates = self
                .retrying(|| shard.scan_users(Some(tenant), PER_SHARD_SCAN_CAP))
                .await?;
            for aggregate in aggregates {
                entries.push(LeaderboardEntry {
                    user_id: aggregate.user.id.clone(),
                    display_name: aggregate.user.display_name.clone(),
                    level: aggregate.user.level,
                    value: kind.score(&aggregate),
                });
            }
        }
        entries.sort_by(|a, b| b.value.cmp(&a.value).then(a.user_id.cmp(&b.user_id)));
        entries.truncate(k);
        Ok(entries)
    }

    /// Run a shard-local closure against every shard in turn; used by
    /// background jobs that walk the whole keyspace.
    pub fn shards(&self) -> &[Arc<dyn Store>] {
        &self.shards
    }
}

#[async_trait]
impl Store for ShardedStore {
    async fn create_user(&self, aggregate: UserAggregate) -> StoreResult<()> {
        let shard = self
            .user_shard(&aggregate.user.tenant_id, &aggregate.user.id)
            .clone();
        self.retrying(|| shard.create_user(aggregate.clone())).await
    }

    async fn load_user(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> StoreResult<Option<UserAggregate>> {
        let shard = self.user_shard(tenant, user).clone();
        self.retrying(|| shard.load_user(tenant, user)).await
    }

    async fn find_user_by_email(
        &self,
        tenant: &TenantId,
        email: &str,
    ) -> StoreResult<Option<UserAggregate>> {
        // Email → user id lives on the user's shard, which we cannot
        // compute from the email alone; ask each shard in turn.
        for shard in &self.shards {
            if let Some(found) = self
                .retrying(|| shard.find_user_by_email(tenant, email))
                .await?
            {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    async fn update_user(&self, user: User) -> StoreResult<UserAggregate> {
        let shard = self.user_shard(&user.tenant_id, &user.id).clone();
        self.retrying(|| shard.update_user(user.clone())).await
    }

    async fn apply_user_delta(
        &self,
        tenant: &TenantId,
        user: &UserId,
        delta: &UserDelta,
        expected_version: Option<u64>,
        idem: Option<IdempotencyRecord>,
    ) -> StoreResult<UserAggregate> {
        let shard = self.user_shard(tenant, user).clone();
        self.retrying(|| {
            shard.apply_user_delta(tenant, user, delta, expected_version, idem.clone())
        })
        .await
    }

    async fn get_idempotency(
        &self,
        tenant: &TenantId,
        user: &UserId,
        key: &str,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let shard = self.user_shard(tenant, user).clone();
        self.retrying(|| shard.get_idempotency(tenant, user, key))
            .await
    }

    async fn update_notification(
        &self,
        tenant: &TenantId,
        user: &UserId,
        notification: &NotificationId,
        read: bool,
        dismissed: bool,
    ) -> StoreResult<bool> {
        let shard = self.user_shard(tenant, user).clone();
        self.retrying(|| shard.update_notification(tenant, user, notification, read, dismissed))
            .await
    }

    async fn sweep_notifications(
        &self,
        tenant: &TenantId,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let shard = self.user_shard(tenant, user).clone();
        self.retrying(|| shard.sweep_notifications(tenant, user, now))
            .await
    }

    async fn record_session(&self, session: Session) -> StoreResult<()> {
        let shard = self.registry().clone();
        self.retrying(|| shard.record_session(session.clone())).await
    }

    async fn get_session_by_token(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        let shard = self.registry().clone();
        self.retrying(|| shard.get_session_by_token(token_hash))
            .await
    }

    async fn get_session_by_refresh(&self, refresh_hash: &str) -> StoreResult<Option<Session>> {
        let shard = self.registry().clone();
        self.retrying(|| shard.get_session_by_refresh(refresh_hash))
            .await
    }

    async fn revoke_session(&self, token_hash: &str) -> StoreResult<bool> {
        let shard = self.registry().clone();
        self.retrying(|| shard.revoke_session(token_hash)).await
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let shard = self.registry().clone();
        self.retrying(|| shard.delete_expired_sessions(now)).await
    }

    async fn rate_limit_incr(
        &self,
        subject: &str,
        action: &str,
        window_start: i64,
        by: u32,
    ) -> StoreResult<u64> {
        let shard = self.subject_shard(subject).clone();
        self.retrying(|| shard.rate_limit_incr(subject, action, window_start, by))
            .await
    }

    async fn prune_rate_buckets(&self, before_window_start: i64) -> StoreResult<u64> {
        let mut pruned = 0;
        for shard in &self.shards {
            pruned += self
                .retrying(|| shard.prune_rate_buckets(before_window_start))
                .await?;
        }
        Ok(pruned)
    }

    async fn upsert_tenant(&self, tenant: Tenant) -> StoreResult<()> {
        let shard = self.registry().clone();
        self.retrying(|| shard.upsert_tenant(tenant.clone())).await
    }

    async fn get_tenant(&self, id: &TenantId) -> StoreResult<Option<Tenant>> {
        let shard = self.registry().clone();
        self.retrying(|| shard.get_tenant(id)).await
    }

    async fn get_tenant_by_host(&self, host: &str) -> StoreResult<Option<Tenant>> {
        let shard = self.registry().clone();
        self.retrying(|| shard.get_tenant_by_host(host)).await
    }

    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        let shard = self.registry().clone();
        self.retrying(|| shard.list_tenants()).await
    }

    async fn put_event(&self, event: MallEvent) -> StoreResult<()> {
        let shard = self.registry().clone();
        self.retrying(|| shard.put_event(event.clone())).await
    }

    async fn list_events(&self, tenant: &TenantId) -> StoreResult<Vec<MallEvent>> {
        let shard = self.registry().clone();
        self.retrying(|| shard.list_events(tenant)).await
    }

    async fn scan_users(
        &self,
        tenant: Option<&TenantId>,
        limit: usize,
    ) -> StoreResult<Vec<UserAggregate>> {
        let mut users = Vec::new();
        for shard in &self.shards {
            let remaining = limit.saturating_sub(users.len());
            if remaining == 0 {
                break;
            }
            users.extend(self.retrying(|| shard.scan_users(tenant, remaining)).await?);
        }
        Ok(users)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let mut total = StoreStats::default();
        for shard in &self.shards {
            let stats = self.retrying(|| shard.stats()).await?;
            total.users += stats.users;
            total.receipts += stats.receipts;
            total.sessions += stats.sessions;
            total.tenants += stats.tenants;
            total.events += stats.events;
            total.rate_buckets += stats.rate_buckets;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mq_core::types::Role;

    fn user(tenant: &str, email: &str) -> User {
        User::new(
            TenantId::new(tenant),
            email,
            email.split('@').next().unwrap_or("u"),
            "hash",
            Role::Player,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_user_lands_on_exactly_one_shard() {
        let store = ShardedStore::in_memory(4);
        let u = user("t1", "a@example.com");
        let tenant = u.tenant_id.clone();
        let id = u.id.clone();
        store.create_user(UserAggregate::new(u)).await.unwrap();

        let mut hits = 0;
        for shard in store.shards() {
            if shard.load_user(&tenant, &id).await.unwrap().is_some() {
                hits += 1;
            }
        }
        assert_eq!(hits, 1);
        // The front-end still finds it.
        assert!(store.load_user(&tenant, &id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_find_by_email_across_shards() {
        let store = ShardedStore::in_memory(4);
        for i in 0..8 {
            let u = user("t1", &format!("user{i}@example.com"));
            store.create_user(UserAggregate::new(u)).await.unwrap();
        }
        let tenant = TenantId::new("t1");
        let found = store
            .find_user_by_email(&tenant, "user5@example.com")
            .await
            .unwrap();
        assert!(found.is_some());
        assert!(store
            .find_user_by_email(&tenant, "nobody@example.com")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_leaderboard_merges_shards() {
        let store = ShardedStore::in_memory(4);
        let tenant = TenantId::new("t1");
        for i in 0..12 {
            let mut u = user("t1", &format!("user{i}@example.com"));
            u.coins = (i as u64) * 10;
            store.create_user(UserAggregate::new(u)).await.unwrap();
        }
        let board = store
            .leaderboard(&tenant, LeaderboardKind::Coins, 5)
            .await
            .unwrap();
        assert_eq!(board.len(), 5);
        assert_eq!(board[0].value, 110);
        assert!(board.windows(2).all(|w| w[0].value >= w[1].value));
    }

    #[tokio::test]
    async fn test_leaderboard_kind_parsing() {
        assert_eq!(
            LeaderboardKind::from_str("coins"),
            Some(LeaderboardKind::Coins)
        );
        assert_eq!(
            LeaderboardKind::from_str("spending"),
            Some(LeaderboardKind::Spending)
        );
        assert_eq!(LeaderboardKind::from_str("fame"), None);
    }

    #[tokio::test]
    async fn test_retry_policy_backoff_grows() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 50,
            jitter_ms: 0,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(100));
    }
}
