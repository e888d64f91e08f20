//! Fixed-window rate limiting keyed by (subject, action).
//!
//! The Store holds the authoritative window counters; a local
//! per-process buffer absorbs bursts so the Store increment is
//! amortized (flushed at least once a second or every 100 increments
//! per key). When the Store is unavailable the limiter falls back to
//! the local counter; after a grace period, sensitive actions
//! fail-closed and read-mostly ones fail-open.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use mq_core::config::RateLimitSetting;
use mq_store::Store;

use crate::error::{EngineError, EngineResult};

/// Flush the local buffer after this many increments per key.
const FLUSH_EVERY: u32 = 100;
/// Or after this long, whichever comes first.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// What to do when the Store stays unreachable past the grace period.
/// Declared per action, never inferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Open,
    Closed,
}

/// Sensitive actions reject when the authoritative counter cannot be
/// consulted.
pub fn fail_mode(action: &str) -> FailMode {
    match action {
        "login" | "refresh" | "mfa_setup" | "mfa_verify" | "admin" => FailMode::Closed,
        _ => FailMode::Open,
    }
}

struct LocalBucket {
    window_start: i64,
    /// Count confirmed by the Store for this window.
    known: u64,
    /// Local increments not yet flushed.
    pending: u32,
    last_flush: Instant,
}

/// Sliding fixed-window limiter with a local absorb buffer.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    limits: HashMap<String, RateLimitSetting>,
    buckets: Mutex<HashMap<(String, String), LocalBucket>>,
    /// Set while the Store is erroring; cleared on first success.
    store_down_since: Mutex<Option<Instant>>,
    grace: Duration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn Store>,
        limits: impl IntoIterator<Item = (String, RateLimitSetting)>,
    ) -> Self {
        Self {
            store,
            limits: limits.into_iter().collect(),
            buckets: Mutex::new(HashMap::new()),
            store_down_since: Mutex::new(None),
            grace: Duration::from_secs(10),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Admit or reject one request. Unknown actions are unlimited.
    pub async fn check(&self, subject: &str, action: &str) -> EngineResult<()> {
        let Some(setting) = self.limits.get(action) else {
            return Ok(());
        };
        let now_unix = chrono::Utc::now().timestamp();
        let window = setting.window_secs.max(1) as i64;
        let window_start = (now_unix / window) * window;
        let retry_after_secs = ((window_start + window) - now_unix).max(1) as u64;

        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry((subject.to_string(), action.to_string()))
            .or_insert_with(|| LocalBucket {
                window_start,
                known: 0,
                pending: 0,
                last_flush: Instant::now(),
            });
        if bucket.window_start != window_start {
            bucket.window_start = window_start;
            bucket.known = 0;
            bucket.pending = 0;
        }
        bucket.pending += 1;

        let due = bucket.pending >= FLUSH_EVERY
            || bucket.last_flush.elapsed() >= FLUSH_INTERVAL
            || bucket.known == 0;
        if due {
            let flush = bucket.pending;
            match self
                .store
                .rate_limit_incr(subject, action, window_start, flush)
                .await
            {
                Ok(count) => {
                    bucket.known = count;
                    bucket.pending = 0;
                    bucket.last_flush = Instant::now();
                    *self.store_down_since.lock().await = None;
                }
                Err(err) => {
                    tracing::warn!(subject, action, error = %err, "rate-limit store increment failed");
                    let mut down_since = self.store_down_since.lock().await;
                    let since = down_since.get_or_insert_with(Instant::now);
                    if fail_mode(action) == FailMode::Closed && since.elapsed() >= self.grace {
                        return Err(EngineError::RateLimited { retry_after_secs });
                    }
                    // Fail-open (or within grace): decide on the local
                    // estimate alone.
                }
            }
        }

        let total = bucket.known + bucket.pending as u64;
        if total > setting.max_requests as u64 {
            return Err(EngineError::RateLimited { retry_after_secs });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use mq_store::{MemoryStore, StoreError, StoreResult, UserAggregate};

    fn limiter(max: u32) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryStore::new()),
            [(
                "submit_receipt".to_string(),
                RateLimitSetting::new(max, 60),
            )],
        )
    }

    #[tokio::test]
    async fn test_allows_up_to_cap_then_rejects() {
        let limiter = limiter(10);
        for _ in 0..10 {
            limiter.check("user:u1", "submit_receipt").await.unwrap();
        }
        let err = limiter.check("user:u1", "submit_receipt").await.unwrap_err();
        assert!(matches!(err, EngineError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_subjects_are_independent() {
        let limiter = limiter(2);
        limiter.check("user:a", "submit_receipt").await.unwrap();
        limiter.check("user:a", "submit_receipt").await.unwrap();
        assert!(limiter.check("user:a", "submit_receipt").await.is_err());
        // A different subject still has budget.
        limiter.check("user:b", "submit_receipt").await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_action_is_unlimited() {
        let limiter = limiter(1);
        for _ in 0..50 {
            limiter.check("user:a", "uncapped_action").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_fail_modes() {
        assert_eq!(fail_mode("login"), FailMode::Closed);
        assert_eq!(fail_mode("mfa_verify"), FailMode::Closed);
        assert_eq!(fail_mode("submit_receipt"), FailMode::Open);
        assert_eq!(fail_mode("read_board"), FailMode::Open);
    }

    /// A store whose rate-limit increments always fail.
    struct BrokenRateStore(MemoryStore);

    #[async_trait]
    impl Store for BrokenRateStore {
        async fn rate_limit_incr(
            &self,
            _subject: &str,
            _action: &str,
            _window_start: i64,
            _by: u32,
        ) -> StoreResult<u64> {
            Err(StoreError::Transient("store down".to_string()))
        }

        // Everything else delegates to the in-memory store.
        async fn create_user(&self, a: UserAggregate) -> StoreResult<()> {
            self.0.create_user(a).await
        }
        async fn load_user(
            &self,
            t: &mq_core::types::TenantId,
            u: &mq_core::types::UserId,
        ) -> StoreResult<Option<UserAggregate>> {
            self.0.load_user(t, u).await
        }
        async fn find_user_by_email(
            &self,
            t: &mq_core::types::TenantId,
            e: &str,
        ) -> StoreResult<Option<UserAggregate>> {
            self.0.find_user_by_email(t, e).await
        }
        async fn update_user(&self, u: mq_core::types::User) -> StoreResult<UserAggregate> {
            self.0.update_user(u).await
        }
        async fn apply_user_delta(
            &self,
            t: &mq_core::types::TenantId,
            u: &mq_core::types::UserId,
            d: &mq_core::delta::UserDelta,
            v: Option<u64>,
            i: Option<mq_store::IdempotencyRecord>,
        ) -> StoreResult<UserAggregate> {
            self.0.apply_user_delta(t, u, d, v, i).await
        }
        async fn get_idempotency(
            &self,
            t: &mq_core::types::TenantId,
            u: &mq_core::types::UserId,
            k: &str,
        ) -> StoreResult<Option<mq_store::IdempotencyRecord>> {
            self.0.get_idempotency(t, u, k).await
        }
        async fn update_notification(
            &self,
            t: &mq_core::types::TenantId,
            u: &mq_core::types::UserId,
            n: &mq_core::types::NotificationId,
            r: bool,
            d: bool,
        ) -> StoreResult<bool> {
            self.0.update_notification(t, u, n, r, d).await
        }
        async fn sweep_notifications(
            &self,
            t: &mq_core::types::TenantId,
            u: &mq_core::types::UserId,
            now: DateTime<Utc>,
        ) -> StoreResult<usize> {
            self.0.sweep_notifications(t, u, now).await
        }
        async fn record_session(&self, s: mq_core::types::Session) -> StoreResult<()> {
            self.0.record_session(s).await
        }
        async fn get_session_by_token(
            &self,
            h: &str,
        ) -> StoreResult<Option<mq_core::types::Session>> {
            self.0.get_session_by_token(h).await
        }
        async fn get_session_by_refresh(
            &self,
            h: &str,
        ) -> StoreResult<Option<mq_core::types::Session>> {
            self.0.get_session_by_refresh(h).await
        }
        async fn revoke_session(&self, h: &str) -> StoreResult<bool> {
            self.0.revoke_session(h).await
        }
        async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
            self.0.delete_expired_sessions(now).await
        }
        async fn prune_rate_buckets(&self, b: i64) -> StoreResult<u64> {
            self.0.prune_rate_buckets(b).await
        }
        async fn upsert_tenant(&self, t: mq_core::types::Tenant) -> StoreResult<()> {
            self.0.upsert_tenant(t).await
        }
        async fn get_tenant(
            &self,
            id: &mq_core::types::TenantId,
        ) -> StoreResult<Option<mq_core::types::Tenant>> {
            self.0.get_tenant(id).await
        }
        async fn get_tenant_by_host(
            &self,
            h: &str,
        ) -> StoreResult<Option<mq_core::types::Tenant>> {
            self.0.get_tenant_by_host(h).await
        }
        async fn list_tenants(&self) -> StoreResult<Vec<mq_core::types::Tenant>> {
            self.0.list_tenants().await
        }
        async fn put_event(&self, e: mq_core::types::MallEvent) -> StoreResult<()> {
            self.0.put_event(e).await
        }
        async fn list_events(
            &self,
            t: &mq_core::types::TenantId,
        ) -> StoreResult<Vec<mq_core::types::MallEvent>> {
            self.0.list_events(t).await
        }
        async fn scan_users(
            &self,
            t: Option<&mq_core::types::TenantId>,
            l: usize,
        ) -> StoreResult<Vec<UserAggregate>> {
            self.0.scan_users(t, l).await
        }
        async fn stats(&self) -> StoreResult<mq_store::StoreStats> {
            self.0.stats().await
        }
    }

    #[tokio::test]
    async fn test_store_outage_fails_open_for_reads_closed_for_login() {
        let store = Arc::new(BrokenRateStore(MemoryStore::new()));
        let limiter = RateLimiter::new(
            store,
            [
                ("login".to_string(), RateLimitSetting::new(5, 300)),
                ("read_board".to_string(), RateLimitSetting::new(3, 60)),
            ],
        )
        .with_grace(Duration::from_millis(0));

        // Read-only action: local counter still enforces the cap.
        limiter.check("ip:1", "read_board").await.unwrap();
        limiter.check("ip:1", "read_board").await.unwrap();
        limiter.check("ip:1", "read_board").await.unwrap();
        assert!(limiter.check("ip:1", "read_board").await.is_err());

        // Sensitive action past the grace period: fail-closed.
        assert!(matches!(
            limiter.check("ip:1", "login").await.unwrap_err(),
            EngineError::RateLimited { .. }
        ));
    }
}
