//! Sled persistent backend.
//!
//! Layout: one tree per table, one JSON blob per row. The user
//! aggregate is a single row, so delta application commits in one
//! sled transaction over the `users` and `idempotency` trees.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;

use mq_core::delta::UserDelta;
use mq_core::types::{
    MallEvent, NotificationId, Session, Tenant, TenantId, User, UserId,
};

use super::{Store, StoreStats};
use crate::aggregate::UserAggregate;
use crate::error::{StoreError, StoreResult};
use crate::idempotency::IdempotencyRecord;

/// Bump on any persisted-layout change; `migrate` rewrites the marker.
pub const SCHEMA_VERSION: u32 = 1;

const USERS_TREE: &str = "users";
const EMAILS_TREE: &str = "emails";
const IDEMPOTENCY_TREE: &str = "idempotency";
const SESSIONS_TREE: &str = "sessions";
const REFRESH_TREE: &str = "refresh_index";
const RATE_TREE: &str = "rate_buckets";
const TENANTS_TREE: &str = "tenants";
const HOSTS_TREE: &str = "hosts";
const EVENTS_TREE: &str = "events";
const META_TREE: &str = "meta";

const SCHEMA_KEY: &[u8] = b"schema_version";

fn transient(err: sled::Error) -> StoreError {
    StoreError::Transient(err.to_string())
}

fn to_bytes<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn user_key(tenant: &TenantId, user: &UserId) -> Vec<u8> {
    format!("{}\u{0}{}", tenant.as_str(), user.as_str()).into_bytes()
}

fn email_key(tenant: &TenantId, email: &str) -> Vec<u8> {
    format!("{}\u{0}{}", tenant.as_str(), email.to_ascii_lowercase()).into_bytes()
}

fn idem_key(tenant: &TenantId, user: &UserId, key: &str) -> Vec<u8> {
    format!("{}\u{0}{}\u{0}{}", tenant.as_str(), user.as_str(), key).into_bytes()
}

fn rate_key(subject: &str, action: &str, window_start: i64) -> Vec<u8> {
    let mut key = format!("{subject}\u{0}{action}\u{0}").into_bytes();
    key.extend_from_slice(&window_start.to_be_bytes());
    key
}

/// Sled-backed shard.
#[derive(Clone, Debug)]
pub struct SledStore {
    db: sled::Db,
    users: sled::Tree,
    emails: sled::Tree,
    idempotency: sled::Tree,
    sessions: sled::Tree,
    refresh_index: sled::Tree,
    rate: sled::Tree,
    tenants: sled::Tree,
    hosts: sled::Tree,
    events: sled::Tree,
    meta: sled::Tree,
}

impl SledStore {
    /// Open a shard database, verifying the schema marker. A fresh
    /// database is stamped with the current version.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let store = Self::open_unchecked(path)?;
        match store.schema_version()? {
            None => {
                store.write_schema_version(SCHEMA_VERSION)?;
                Ok(store)
            }
            Some(found) if found == SCHEMA_VERSION => Ok(store),
            Some(found) => Err(StoreError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION,
            }),
        }
    }

    /// Open without a schema check; used by `migrate`.
    pub fn open_unchecked<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let db = sled::open(path).map_err(transient)?;
        let open_tree = |name: &str| db.open_tree(name).map_err(transient);
        Ok(Self {
            users: open_tree(USERS_TREE)?,
            emails: open_tree(EMAILS_TREE)?,
            idempotency: open_tree(IDEMPOTENCY_TREE)?,
            sessions: open_tree(SESSIONS_TREE)?,
            refresh_index: open_tree(REFRESH_TREE)?,
            rate: open_tree(RATE_TREE)?,
            tenants: open_tree(TENANTS_TREE)?,
            hosts: open_tree(HOSTS_TREE)?,
            events: open_tree(EVENTS_TREE)?,
            meta: open_tree(META_TREE)?,
            db,
        })
    }

    pub fn schema_version(&self) -> StoreResult<Option<u32>> {
        let Some(bytes) = self.meta.get(SCHEMA_KEY).map_err(transient)? else {
            return Ok(None);
        };
        if bytes.len() != 4 {
            return Err(StoreError::Serialization(
                "malformed schema marker".to_string(),
            ));
        }
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes);
        Ok(Some(u32::from_be_bytes(buf)))
    }

    /// Stamp the schema marker; idempotent.
    pub fn write_schema_version(&self, version: u32) -> StoreResult<()> {
        self.meta
            .insert(SCHEMA_KEY, &version.to_be_bytes())
            .map_err(transient)?;
        self.meta.flush().map_err(transient)?;
        Ok(())
    }

    pub fn flush(&self) -> StoreResult<()> {
        self.db.flush().map_err(transient)?;
        Ok(())
    }
}

#[async_trait]
impl Store for SledStore {
    async fn create_user(&self, aggregate: UserAggregate) -> StoreResult<()> {
        let ukey = user_key(&aggregate.user.tenant_id, &aggregate.user.id);
        let ekey = email_key(&aggregate.user.tenant_id, &aggregate.user.email);
        let bytes = to_bytes(&aggregate)?;
        let user_id = aggregate.user.id.as_str().as_bytes().to_vec();

        (&self.users, &self.emails)
            .transaction(|(users, emails)| {
                if users.get(&ukey)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        StoreError::AlreadyExists(format!("user {}", aggregate.user.id)),
                    ));
                }
                if emails.get(&ekey)?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        StoreError::AlreadyExists(format!("email {}", aggregate.user.email)),
                    ));
                }
                users.insert(ukey.as_slice(), bytes.as_slice())?;
                emails.insert(ekey.as_slice(), user_id.as_slice())?;
                Ok(())
            })
            .map_err(unwrap_tx)
    }

    async fn load_user(
        &self,
        tenant: &TenantId,
        user: &UserId,
    ) -> StoreResult<Option<UserAggregate>> {
        match self.users.get(user_key(tenant, user)).map_err(transient)? {
            Some(bytes) => Ok(Some(from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn find_user_by_email(
        &self,
        tenant: &TenantId,
        email: &str,
    ) -> StoreResult<Option<UserAggregate>> {
        let Some(id_bytes) = self
            .emails
            .get(email_key(tenant, email))
            .map_err(transient)?
        else {
            return Ok(None);
        };
        let user_id = UserId::new(String::from_utf8_lossy(&id_bytes).to_string());
        self.load_user(tenant, &user_id).await
    }

    async fn update_user(&self, user: User) -> StoreResult<UserAggregate> {
        let ukey = user_key(&user.tenant_id, &user.id);
        let tenant = user.tenant_id.clone();

        let updated = (&self.users, &self.emails)
            .transaction(|(users, emails)| {
                let bytes = users.get(&ukey)?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(StoreError::NotFound(format!(
                        "user {}",
                        user.id
                    )))
                })?;
                let mut aggregate: UserAggregate = from_bytes(&bytes)
                    .map_err(ConflictableTransactionError::Abort)?;
                if aggregate.user.version != user.version {
                    return Err(ConflictableTransactionError::Abort(
                        StoreError::VersionConflict {
                            expected: user.version,
                            actual: aggregate.user.version,
                        },
                    ));
                }
                if !aggregate.user.email.eq_ignore_ascii_case(&user.email) {
                    let old_key = email_key(&tenant, &aggregate.user.email);
                    let new_key = email_key(&tenant, &user.email);
                    if emails.get(&new_key)?.is_some() {
                        return Err(ConflictableTransactionError::Abort(
                            StoreError::AlreadyExists(format!("email {}", user.email)),
                        ));
                    }
                    emails.remove(old_key)?;
                    emails.insert(new_key, user.id.as_str().as_bytes())?;
                }
                let mut user = user.clone();
                user.version += 1;
                aggregate.user = user;
                let new_bytes =
                    to_bytes(&aggregate).map_err(ConflictableTransactionError::Abort)?;
                users.insert(ukey.as_slice(), new_bytes)?;
                Ok(aggregate)
            })
            .map_err(unwrap_tx)?;
        Ok(updated)
    }

    async fn apply_user_delta(
        &self,
        tenant: &TenantId,
        user: &UserId,
        delta: &UserDelta,
        expected_version: Option<u64>,
        idem: Option<IdempotencyRecord>,
    ) -> StoreResult<UserAggregate> {
        let ukey = user_key(tenant, user);
        let ikey = idem
            .as_ref()
            .map(|record| idem_key(tenant, user, &record.key));

        let applied = (&self.users, &self.idempotency)
            .transaction(|(users, idem_tree)| {
                if let (Some(record), Some(ikey)) = (&idem, &ikey) {
                    if let Some(existing_bytes) = idem_tree.get(ikey.as_slice())? {
                        let existing: IdempotencyRecord = from_bytes(&existing_bytes)
                            .map_err(ConflictableTransactionError::Abort)?;
                        if existing.matches_request(&record.request_hash) {
                            let bytes = users.get(&ukey)?.ok_or_else(|| {
                                ConflictableTransactionError::Abort(StoreError::NotFound(
                                    format!("user {user}"),
                                ))
                            })?;
                            let aggregate: UserAggregate = from_bytes(&bytes)
                                .map_err(ConflictableTransactionError::Abort)?;
                            return Ok(aggregate);
                        }
                        return Err(ConflictableTransactionError::Abort(
                            StoreError::IdempotencyMismatch {
                                key: record.key.clone(),
                            },
                        ));
                    }
                }

                let bytes = users.get(&ukey)?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(StoreError::NotFound(format!(
                        "user {user}"
                    )))
                })?;
                let mut aggregate: UserAggregate =
                    from_bytes(&bytes).map_err(ConflictableTransactionError::Abort)?;

                if let Some(expected) = expected_version {
                    if aggregate.user.version != expected {
                        return Err(ConflictableTransactionError::Abort(
                            StoreError::VersionConflict {
                                expected,
                                actual: aggregate.user.version,
                            },
                        ));
                    }
                }

                aggregate
                    .apply_delta(delta)
                    .map_err(ConflictableTransactionError::Abort)?;

                let new_bytes =
                    to_bytes(&aggregate).map_err(ConflictableTransactionError::Abort)?;
                users.insert(ukey.as_slice(), new_bytes)?;

                if let (Some(record), Some(ikey)) = (&idem, &ikey) {
                    let record_bytes =
                        to_bytes(record).map_err(ConflictableTransactionError::Abort)?;
                    idem_tree.insert(ikey.as_slice(), record_bytes)?;
                }

                Ok(aggregate)
            })
            .map_err(unwrap_tx)?;
        Ok(applied)
    }

    async fn get_idempotency(
        &self,
        tenant: &TenantId,
        user: &UserId,
        key: &str,
    ) -> StoreResult<Option<IdempotencyRecord>> {
        match self
            .idempotency
            .get(idem_key(tenant, user, key))
            .map_err(transient)?
        {
            Some(bytes) => Ok(Some(from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn update_notification(
        &self,
        tenant: &TenantId,
        user: &UserId,
        notification: &NotificationId,
        read: bool,
        dismissed: bool,
    ) -> StoreResult<bool> {
        let Some(mut aggregate) = self.load_user(tenant, user).await? else {
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
        self.users
            .insert(user_key(tenant, user), to_bytes(&aggregate)?)
            .map_err(transient)?;
        Ok(true)
    }

    async fn sweep_notifications(
        &self,
        tenant: &TenantId,
        user: &UserId,
        now: DateTime<Utc>,
    ) -> StoreResult<usize> {
        let Some(mut aggregate) = self.load_user(tenant, user).await? else {
            return Ok(0);
        };
        let removed = aggregate.sweep_notifications(now);
        if removed > 0 {
            self.users
                .insert(user_key(tenant, user), to_bytes(&aggregate)?)
                .map_err(transient)?;
        }
        Ok(removed)
    }

    async fn record_session(&self, session: Session) -> StoreResult<()> {
        if self
            .sessions
            .get(session.token_hash.as_bytes())
            .map_err(transient)?
            .is_some()
        {
            return Err(StoreError::AlreadyExists("session token".to_string()));
        }
        self.refresh_index
            .insert(
                session.refresh_hash.as_bytes(),
                session.token_hash.as_bytes(),
            )
            .map_err(transient)?;
        self.sessions
            .insert(session.token_hash.as_bytes(), to_bytes(&session)?)
            .map_err(transient)?;
        Ok(())
    }

    async fn get_session_by_token(&self, token_hash: &str) -> StoreResult<Option<Session>> {
        match self
            .sessions
            .get(token_hash.as_bytes())
            .map_err(transient)?
        {
            Some(bytes) => Ok(Some(from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_session_by_refresh(&self, refresh_hash: &str) -> StoreResult<Option<Session>> {
        let Some(token_bytes) = self
            .refresh_index
            .get(refresh_hash.as_bytes())
            .map_err(transient)?
        else {
            return Ok(None);
        };
        let token_hash = String::from_utf8_lossy(&token_bytes).to_string();
        self.get_session_by_token(&token_hash).await
    }

    async fn revoke_session(&self, token_hash: &str) -> StoreResult<bool> {
        let Some(mut session) = self.get_session_by_token(token_hash).await? else {
            return Ok(false);
        };
        session.revoked = true;
        self.sessions
            .insert(token_hash.as_bytes(), to_bytes(&session)?)
            .map_err(transient)?;
        Ok(true)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut removed = 0u64;
        for entry in self.sessions.iter() {
            let (key, bytes) = entry.map_err(transient)?;
            let session: Session = from_bytes(&bytes)?;
            if session.is_expired(now) {
                self.sessions.remove(&key).map_err(transient)?;
                self.refresh_index
                    .remove(session.refresh_hash.as_bytes())
                    .map_err(transient)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn rate_limit_incr(
        &self,
        subject: &str,
        action: &str,
        window_start: i64,
        by: u32,
    ) -> StoreResult<u64> {
        let key = rate_key(subject, action, window_start);
        let result = self
            .rate
            .update_and_fetch(key, |old| {
                let current = old
                    .and_then(|bytes| {
                        let mut buf = [0u8; 8];
                        (bytes.len() == 8).then(|| {
                            buf.copy_from_slice(bytes);
                            u64::from_be_bytes(buf)
                        })
                    })
                    .unwrap_or(0);
                Some((current + by as u64).to_be_bytes().to_vec())
            })
            .map_err(transient)?;
        let bytes = result.ok_or_else(|| {
            StoreError::Transient("rate bucket disappeared during increment".to_string())
        })?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes);
        Ok(u64::from_be_bytes(buf))
    }

    async fn prune_rate_buckets(&self, before_window_start: i64) -> StoreResult<u64> {
        let mut removed = 0u64;
        for entry in self.rate.iter() {
            let (key, _) = entry.map_err(transient)?;
            if key.len() >= 8 {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&key[key.len() - 8..]);
                if i64::from_be_bytes(buf) < before_window_start {
                    self.rate.remove(&key).map_err(transient)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn upsert_tenant(&self, tenant: Tenant) -> StoreResult<()> {
        if let Some(existing) = self
            .hosts
            .get(tenant.host.as_bytes())
            .map_err(transient)?
        {
            if existing.as_ref() != tenant.id.as_str().as_bytes() {
                return Err(StoreError::AlreadyExists(format!(
                    "host {} is mapped to tenant {}",
                    tenant.host,
                    String::from_utf8_lossy(&existing)
                )));
            }
        }
        if let Some(bytes) = self
            .tenants
            .get(tenant.id.as_str().as_bytes())
            .map_err(transient)?
        {
            let previous: Tenant = from_bytes(&bytes)?;
            if previous.host != tenant.host {
                self.hosts
                    .remove(previous.host.as_bytes())
                    .map_err(transient)?;
            }
        }
        self.hosts
            .insert(tenant.host.as_bytes(), tenant.id.as_str().as_bytes())
            .map_err(transient)?;
        self.tenants
            .insert(tenant.id.as_str().as_bytes(), to_bytes(&tenant)?)
            .map_err(transient)?;
        Ok(())
    }

    async fn get_tenant(&self, id: &TenantId) -> StoreResult<Option<Tenant>> {
        match self
            .tenants
            .get(id.as_str().as_bytes())
            .map_err(transient)?
        {
            Some(bytes) => Ok(Some(from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_tenant_by_host(&self, host: &str) -> StoreResult<Option<Tenant>> {
        let Some(id_bytes) = self.hosts.get(host.as_bytes()).map_err(transient)? else {
            return Ok(None);
        };
        let id = TenantId::new(String::from_utf8_lossy(&id_bytes).to_string());
        self.get_tenant(&id).await
    }

    async fn list_tenants(&self) -> StoreResult<Vec<Tenant>> {
        let mut tenants = Vec::new();
        for entry in self.tenants.iter() {
            let (_, bytes) = entry.map_err(transient)?;
            tenants.push(from_bytes(&bytes)?);
        }
        Ok(tenants)
    }

    async fn put_event(&self, event: MallEvent) -> StoreResult<()> {
        self.events
            .insert(event.id.0.as_bytes(), to_bytes(&event)?)
            .map_err(transient)?;
        Ok(())
    }

    async fn list_events(&self, tenant: &TenantId) -> StoreResult<Vec<MallEvent>> {
        let mut events: Vec<MallEvent> = Vec::new();
        for entry in self.events.iter() {
            let (_, bytes) = entry.map_err(transient)?;
            let event: MallEvent = from_bytes(&bytes)?;
            if &event.tenant_id == tenant {
                events.push(event);
            }
        }
        events.sort_by_key(|e| e.starts_at);
        Ok(events)
    }

    async fn scan_users(
        &self,
        tenant: Option<&TenantId>,
        limit: usize,
    ) -> StoreResult<Vec<UserAggregate>> {
        let mut users = Vec::new();
        let iter: Box<dyn Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>> =
            match tenant {
                Some(tenant) => Box::new(
                    self.users
                        .scan_prefix(format!("{}\u{0}", tenant.as_str()).into_bytes()),
                ),
                None => Box::new(self.users.iter()),
            };
        for entry in iter {
            if users.len() >= limit {
                break;
            }
            let (_, bytes) = entry.map_err(transient)?;
            users.push(from_bytes(&bytes)?);
        }
        Ok(users)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        Ok(StoreStats {
            users: self.users.len() as u64,
            receipts: 0,
            sessions: self.sessions.len() as u64,
            tenants: self.tenants.len() as u64,
            events: self.events.len() as u64,
            rate_buckets: self.rate.len() as u64,
        })
    }
}

fn unwrap_tx(err: TransactionError<StoreError>) -> StoreError {
    match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => StoreError::Transient(err.to_string()),
    }
}
