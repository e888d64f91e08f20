//! Route handlers.

pub mod auth;
pub mod companion;
pub mod empire;
pub mod health;
pub mod mission;
pub mod notification;
pub mod receipt;
pub mod user;

pub use auth::{login, logout, mfa_setup, mfa_verify, refresh, register};
pub use companion::{adopt_companion, entertain_companion, feed_companion};
pub use empire::{collect_facility, purchase_facility, upgrade_facility};
pub use health::{health_check, performance_metrics};
pub use mission::{claim_mission, generate_mission};
pub use notification::{dismiss_notification, list_notifications, read_notification};
pub use receipt::{leaderboard, pos_purchase, submit_receipt};
pub use user::get_user;

use axum::http::{header, HeaderMap};
use std::sync::Arc;

use mq_core::types::Tenant;

use crate::error::ApiResult;
use crate::state::AppState;

/// Header carrying the client idempotency key.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Resolve the tenant for this request from the Host header.
pub(crate) async fn tenant_of(state: &Arc<AppState>, headers: &HeaderMap) -> ApiResult<Tenant> {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok());
    state.resolve_tenant(host).await
}

/// Client idempotency key, if supplied.
pub(crate) fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Best-effort client address for unauthenticated rate limiting.
pub(crate) fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
