//! In-memory backend: a single `RwLock` over the shard state, so every
//! mutating call is trivially one transaction. Used for tests and
//! development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use mq_core::delta::UserDelta;
use mq_core::types::{
    EventId, MallEvent, NotificationId, Session, Tenant, TenantId, User, UserId,
};

use super::{Store, StoreStats};
use crate::aggregate::UserAggregate;
use crate::error::{StoreError, StoreResult};
use crate::idempotency::IdempotencyRecord;

#[derive(Default)]
struct Inner {
    /// (tenant, user id) → aggregate.
    users: HashMap<(String, String), UserAggregate>,
    /// (tenant, lowercased email) → user id.
    email_index: HashMap<(String, String), UserId>,
    /// (tenant, user id, idem key) → consumed record.
    idempotency: HashMap<(String, String, String), IdempotencyRecord>,
    /// token hash → session.
    sessions: HashMap<String, Session>,
    /// refresh hash → token hash.
    refresh_index: HashMap<String, String>,
    /// (subject, action, window start) → count.
    rate: HashMap<(String, String, i64), u64>,
    tenants: HashMap<String, Tenant>,
    /// host → tenant id.
    hosts: HashMap<String, String>,
    events: HashMap<EventId, MallEvent>,
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn user_key(tenant: &TenantId, user: &UserId) -> (String, String) {
    (tenant.as_str().to_string(), user.as_str().to_string())
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_user(&self, aggregate: UserAggregate) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let key = user_key(&aggregate.user.tenant_id, &aggregate.user.id);
        if inner.users.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!(
                "user {}",
                aggregate.user.id
            )));
        }
        let email_key = (
            aggregate.user.tenant_id.as_str().to_string(),
            aggregate.user.email.to_ascii_lowercase(),
        );
        if inner.email_index.contains_key(&email_key) {
            return Err(StoreError::AlreadyExists(format!(
                "email {}",
                aggregate.user.email
            )));
        }
        inner.email_index.insert(email_key, aggregate.user.id.clone());
        inner.users.insert(key, aggregate);
        Ok(())
    }

    async fn load_user(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> StoreResult<Option<UserAggregate>> {
        let inner = self.inner.read().await;
        Ok(inner.users.get(&user_key(tenant, user)).cloned())
    }

    async fn find_user_by_email(
        &self,
        tenant: &TenantId,
        email: &str,
    ) -> StoreResult<Option<UserAggregate>> {
        let inner = self.inner.read().await;
        let email_key = (
            tenant.as_str().to_string(),
            email.to_ascii_lowercase(),
        );
        let Some(user_id) = inner.email_index.get(&email_key) else {
            return Ok(None);
        };
        Ok(inner
            .users
            .get(&(email_key.0, user_id.as_str().to_string()))
            .cloned())
    }

    async fn update_user(&self, user: User) -> StoreResult<UserAggregate> {
        let mut inner = self.inner.write().await;
        let key = user_key(&user.tenant_id, &user.id);
        let aggregate = inner
            .users
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", user.id)))?;
        if aggregate.user.version != user.version {
            return Err(StoreError::VersionConflict {
                expected: user.version,
                actual: aggregate.user.version,
            });
        }
        let mut user = user;
        user.version += 1;
        aggregate.user = user;
        Ok(aggregate.clone())
    }

    async fn apply_user_delta(
        &self,
        tenant: &TenantId,
        user: &UserId,
        delta: &UserDelta,
        expected_version: Option<u64>,
        idem: Option<IdempotencyRecord>,
    ) -> StoreResult<UserAggregate> {
        let mut inner = self.inner.write().await;

        if let Some(record) = &idem {
            let idem_key = (
                tenant.as_str().to_string(),
                user.as_str().to_string(),
                record.key.clone(),
            );
            if let Some(existing) = inner.idempotency.get(&idem_key) {
                if existing.matches_request(&record.request_hash) {
                    // Already applied; serve current state.
                    return inner
                        .users
                        .get(&user_key(tenant, user))
                        .cloned()
                        .ok_or_else(|| StoreError::NotFound(format!("user {user}")));
                }
                return Err(StoreError::IdempotencyMismatch {
                    key: record.key.clone(),
                });
            }
        }

        let aggregate = inner
            .users
            .get_mut(&user_key(tenant, user))
            .ok_or_else(|| StoreError::NotFound(format!("user {user}")))?;

        if let Some(expected) = expected_version {
            if aggregate.user.version != expected {
                return Err(StoreError::VersionConflict {
                    expected,
                    actual: aggregate.user.version,
                });
            }
        }

        aggregate.apply_delta(delta)?;
        let snapshot = aggregate.clone();

        if let Some(record) = idem {
            inner.idempotency.insert(
                (
                    tenant.as_str().to_string(),
                    user.as_str().to_string(),
                    record.key.clone(),
                ),
                record,
            );
        }

        Ok(snapshot)
    }

    async fn get_idempotency(
        &self,
        tenant: &TenantId,
        user: &UserId,
        key: &str,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .idempotency
            .get(&(
                tenant.as_str().to_string(),
                user.as_str().to_string(),
                key.to_string(),
            ))
            .cloned())
    }

    async fn update_notification(
        &self,
        tenant: &TenantId,
        user: &UserId,
        notification: &NotificationId,
        read: bool,
        dismissed: bool,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        let Some(aggregate) = inner.users.get_mut(&user_key(tenant, user)) else {
            return Ok(false);
        };
        let Some(entry) = aggregate
            .notifications
            .iter_mut()
            .find(|n| &n.id == notification)
        else {
            return Ok(false);
        };
        if read {
            entry.mark_read();
        }
        if dismissed {
            entry.dismiss();
        }
        Ok(true)
    }

    async fn sweep_notifications(
        &self,
        tenant: &TenantId,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let Some(aggregate) = inner.users.get_mut(&user_key(tenant, user)) else {
            return Ok(0);
        };
        Ok(aggregate.sweep_notifications(now))
    }

    async fn record_session(&self, session: Session) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.sessions.contains_key(&session.token_hash) {
            return Err(StoreError::AlreadyExists("session token".to_string()));
        }
        inner
            .refresh_index
            .insert(session.refresh_hash.clone(), session.token_hash.clone());
        inner.sessions.insert(session.token_hash.clone(), session);
        Ok(())
    }

    async fn get_session_by_token(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        let inner = self.inner.read().await;
        Ok(inner.sessions.get(token_hash).cloned())
    }

    async fn get_session_by_refresh(&self, refresh_hash: &str) -> StoreResult<Option<Session>> {
        let inner = self.inner.read().await;
        let Some(token_hash) = inner.refresh_index.get(refresh_hash) else {
            return Ok(None);
        };
        Ok(inner.sessions.get(token_hash).cloned())
    }

    async fn revoke_session(&self, token_hash: &str) -> StoreResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.sessions.get_mut(token_hash) {
            Some(session) => {
                session.revoked = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.token_hash.clone())
            .collect();
        for token_hash in &expired {
            if let Some(session) = inner.sessions.remove(token_hash) {
                inner.refresh_index.remove(&session.refresh_hash);
            }
        }
        Ok(expired.len() as u64)
    }

    async fn rate_limit_incr(
        &self,
        subject: &str,
        action: &str,
        window_start: i64,
        by: u32,
    ) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let count = inner
            .rate
            .entry((subject.to_string(), action.to_string(), window_start))
            .or_insert(0);
        *count += by as u64;
        Ok(*count)
    }

    async fn prune_rate_buckets(&self, before_window_start: i64) -> StoreResult<u64> {
        let mut inner = self.inner.write().await;
        let before = inner.rate.len();
        inner.rate.retain(|(_, _, window), _| *window >= before_window_start);
        Ok((before - inner.rate.len()) as u64)
    }

    async fn upsert_tenant(&self, tenant: Tenant) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(existing_id) = inner.hosts.get(&tenant.host) {
            if existing_id != tenant.id.as_str() {
                return Err(StoreError::AlreadyExists(format!(
                    "host {} is mapped to tenant {existing_id}",
                    tenant.host
                )));
            }
        }
        if let Some(previous) = inner.tenants.get(tenant.id.as_str()) {
            if previous.host != tenant.host {
                let stale = previous.host.clone();
                inner.hosts.remove(&stale);
            }
        }
        inner
            .hosts
            .insert(tenant.host.clone(), tenant.id.as_str().to_string());
        inner
            .tenants
            .insert(tenant.id.as_str().to_string(), tenant);
        Ok(())
    }

    async fn get_tenant(&self, id: &TenantId) -> StoreResult<Option<Tenant>> {
        let inner = self.inner.read().await;
        Ok(inner.tenants.get(id.as_str()).cloned())
    }

    async fn get_tenant_by_host(&self, host: &str) -> StoreResult<Option<Tenant>> {
        let inner = self.inner.read().await;
        let Some(id) = inner.hosts.get(host) else {
            return Ok(None);
        };
        Ok(inner.tenants.get(id).cloned())
    }

    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        let inner = self.inner.read().await;
        let mut tenants: Vec<Tenant> = inner.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }

    async fn put_event(&self, event: MallEvent) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner.events.insert(event.id, event);
        Ok(())
    }

    async fn list_events(&self, tenant: &TenantId) -> StoreResult<Vec<MallEvent>> {
        let inner = self.inner.read().await;
        let mut events: Vec<MallEvent> = inner
            .events
            .values()
            .filter(|e| &e.tenant_id == tenant)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.starts_at);
        Ok(events)
    }

    async fn scan_users(
        &self,
        tenant: Option<&TenantId>,
        limit: usize,
    ) -> StoreResult<Vec<UserAggregate>> {
        let inner = self.inner.read().await;
        let mut users: Vec<UserAggregate> = inner
            .users
            .values()
            .filter(|a| tenant.map(|t| &a.user.tenant_id == t).unwrap_or(true))
            .cloned()
            .collect();
        users.sort_by(|a, b| a.user.id.cmp(&b.user.id));
        users.truncate(limit);
        Ok(users)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let inner = self.inner.read().await;
        Ok(StoreStats {
            users: inner.users.len() as u64,
            receipts: inner.users.values().map(|a| a.receipts.len() as u64).sum(),
            sessions: inner.sessions.len() as u64,
            tenants: inner.tenants.len() as u64,
            events: inner.events.len() as u64,
            rate_buckets: inner.rate.len() as u64,
        })
    }
}
