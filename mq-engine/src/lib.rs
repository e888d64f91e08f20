//! The progression engine: everything between the transport layer and
//! the store.
//!
//! [`Coordinator`] is the only component that writes. It admits
//! requests through the rate limiter, loads users through the cache,
//! invokes the pure reward engine, applies deltas atomically under a
//! per-user mutex with optimistic version retry, and fans out
//! notifications best-effort. [`BackgroundScheduler`] runs the
//! periodic jobs.

pub mod cache;
pub mod coordinator;
pub mod error;
pub mod missions;
pub mod notify;
pub mod rate_limit;
pub mod scheduler;

pub use cache::{CacheTier, LruTtlCache, MemoryTier, SmartCache};
pub use coordinator::{
    Coordinator, DailyBonus, DashboardView, MissionOutcome, ReceiptOutcome, ReceiptSubmission,
};
pub use error::{EngineError, EngineResult};
pub use notify::{NotificationHub, PushMessage};
pub use rate_limit::{FailMode, RateLimiter};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerHandle};
