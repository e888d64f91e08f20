//! Route table and middleware layering.

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Per-request deadline. A request that commits but loses the
/// response path is safe: the client retries under the same
/// idempotency key and receives the stored outcome.
const REQUEST_DEADLINE: Duration = Duration::from_secs(5);

use crate::handlers::*;
use crate::metrics::metrics_middleware;
use crate::middleware::auth_middleware;
use crate::state::AppState;
use crate::ws::ws_handler;

/// Build the full application router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let enable_cors = state.config.enable_cors;

    let mut router = Router::new()
        .route("/", get(|| async { "MallQuest API" }))
        .route("/health", get(health_check))
        // Identity
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/mfa/setup", post(mfa_setup))
        .route("/mfa/verify", post(mfa_verify))
        // Receipts
        .route("/api/receipt", post(submit_receipt))
        .route("/api/pos/purchase", post(pos_purchase))
        // Users and boards
        .route("/api/user/:id", get(get_user))
        .route("/api/leaderboard/:kind", get(leaderboard))
        // Missions
        .route("/api/mission/generate", post(generate_mission))
        .route("/api/mission/:id/claim", post(claim_mission))
        // Notifications
        .route("/api/notifications", get(list_notifications))
        .route("/api/notifications/:id/read", post(read_notification))
        .route("/api/notifications/:id/dismiss", post(dismiss_notification))
        // Empire
        .route("/api/empire/purchase", post(purchase_facility))
        .route("/api/empire/:id/upgrade", post(upgrade_facility))
        .route("/api/empire/:id/collect", post(collect_facility))
        // Companions
        .route("/api/companion/adopt", post(adopt_companion))
        .route("/api/companion/:id/feed", post(feed_companion))
        .route("/api/companion/:id/entertain", post(entertain_companion))
        // Observability
        .route("/api/performance-metrics", get(performance_metrics))
        // Push channel
        .route("/ws", get(ws_handler))
        .with_state(state.clone());

    router = router
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TimeoutLayer::new(REQUEST_DEADLINE));

    if enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.layer(TraceLayer::new_for_http())
}
