//! Storage backends.
//!
//! The [`Store`] trait is the shard-local contract: every method is a
//! single-shard operation. Cross-shard routing, retries and
//! gather-scatter reads live in [`crate::sharded::ShardedStore`].

pub mod memory;
pub mod sled;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mq_core::delta::UserDelta;
use mq_core::types::{MallEvent, NotificationId, Session, Tenant, TenantId, User, UserId};

use crate::aggregate::UserAggregate;
use crate::error::StoreResult;
use crate::idempotency::IdempotencyRecord;

/// Shard-local storage contract.
#[async_trait]
pub trait Store: Send + Sync {
    // ==================== Users ====================

    /// Insert a new user aggregate. Fails with `AlreadyExists` when the
    /// user id or email is taken within the tenant.
    async fn create_user(&self, aggregate: UserAggregate) -> StoreResult<()>;

    async fn load_user(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> StoreResult<Option<UserAggregate>>;

    async fn find_user_by_email(
        &self,
        tenant: &TenantId,
        email: &str,
    ) -> StoreResult<Option<UserAggregate>>;

    /// Replace the user row (credentials, MFA enrollment, profile).
    /// The caller passes the version it read; a mismatch is a
    /// `VersionConflict`.
    async fn update_user(&self, user: User) -> StoreResult<UserAggregate>;

    /// Apply an atomic composite delta.
    ///
    /// With `expected_version`, the write is optimistic: a stored
    /// version mismatch aborts with `VersionConflict`. With an
    /// idempotency record, the record is consumed in the same
    /// transaction; a second apply under the same key returns
    /// `IdempotencyMismatch` when the request hash differs and the
    /// current aggregate unchanged when it matches.
    async fn apply_user_delta(
        &self,
        tenant: &TenantId,
        user: &UserId,
        delta: &UserDelta,
        expected_version: Option<u64>,
        idem: Option<IdempotencyRecord>,
    ) -> StoreResult<UserAggregate>;

    async fn get_idempotency(
        &self,
        tenant: &TenantId,
        user: &UserId,
        key: &str,
    ) -> StoreResult<Option<IdempotencyRecord>>;

    /// Flip notification flags; both are monotonic. Returns false when
    /// the notification does not exist.
    async fn update_notification(
        &self,
        tenant: &TenantId,
        user: &UserId,
        notification: &NotificationId,
        read: bool,
        dismissed: bool,
    ) -> StoreResult<bool>;

    /// Delete expired notifications for one user.
    async fn sweep_notifications(
        &self,
        tenant: &TenantId,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<usize>;

    // ==================== Sessions ====================

    async fn record_session(&self, session: Session) -> StoreResult<()>;

    async fn get_session_by_token(&self, token_hash: &str) -> StoreResult<Option<Session>>;

    async fn get_session_by_refresh(&self, refresh_hash: &str) -> StoreResult<Option<Session>>;

    /// Mark a session revoked. Returns false when no session matches.
    async fn revoke_session(&self, token_hash: &str) -> StoreResult<bool>;

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    // ==================== Rate limits ====================

    /// Atomically add `by` to a window bucket and return the new count.
    async fn rate_limit_incr(
        &self,
        subject: &str,
        action: &str,
        window_start: i64,
        by: u32,
    ) -> StoreResult<u64>;

    async fn prune_rate_buckets(&self, before_window_start: i64) -> StoreResult<u64>;

    // ==================== Tenants & events ====================

    async fn upsert_tenant(&self, tenant: Tenant) -> StoreResult<()>;

    async fn get_tenant(&self, id: &TenantId) -> StoreResult<Option<Tenant>>;

    async fn get_tenant_by_host(&self, host: &str) -> StoreResult<Option<Tenant>>;

    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>>;

    async fn put_event(&self, event: MallEvent) -> StoreResult<()>;

    async fn list_events(&self, tenant: &TenantId) -> StoreResult<Vec<MallEvent>>;

    // ==================== Scans ====================

    /// Bounded shard-local scan, used by background jobs and the
    /// leaderboard gather step.
    async fn scan_users(
        &self,
        tenant: Option<&TenantId>,
        limit: usize,
    ) -> StoreResult<Vec<UserAggregate>>;

    async fn stats(&self) -> StoreResult<StoreStats>;
}

/// Shard-local counters for health reporting.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StoreStats {
    pub users: u64,
    pub receipts: u64,
    pub sessions: u64,
    pub tenants: u64,
    pub events: u64,
    pub rate_buckets: u64,
}
