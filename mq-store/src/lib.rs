//! Sharded persistence for MallQuest.
//!
//! All state owned by one user — the user row plus its receipts,
//! missions, achievements, facilities, companions and notifications —
//! lives in a single [`UserAggregate`] on a single shard, so every
//! user-mutating operation is one shard-local transaction. Registry
//! tables (tenants, events) and the session table live on the first
//! shard; rate-limit buckets shard by subject.

pub mod aggregate;
pub mod backend;
pub mod error;
pub mod idempotency;
pub mod shard;
pub mod sharded;

pub use aggregate::UserAggregate;
pub use backend::memory::MemoryStore;
pub use backend::sled::{SledStore, SCHEMA_VERSION};
pub use backend::{Store, StoreStats};
pub use error::{StoreError, StoreResult};
pub use idempotency::{request_hash, IdempotencyRecord};
pub use shard::shard_of;
pub use sharded::{LeaderboardEntry, LeaderboardKind, RetryPolicy, ShardedStore};
