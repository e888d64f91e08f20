//! Liveness and runtime metrics.

use axum::{extract::State, Extension, Json};
use std::sync::Arc;

use mq_auth::AuthSubject;
use mq_core::types::Role;
use mq_store::Store;

use crate::dto::{HealthComponent, HealthResponse};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// GET /health — liveness plus component status.
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<HealthResponse>> {
    let mut components = Vec::new();
    let mut status = "healthy";

    match state.store.stats().await {
        Ok(stats) => components.push(HealthComponent {
            name: "store".to_string(),
            status: "healthy".to_string(),
            detail: Some(format!(
                "{} shards, {} users, {} sessions",
                state.store.shard_count(),
                stats.users,
                stats.sessions
            )),
        }),
        Err(err) => {
            status = "degraded";
            components.push(HealthComponent {
                name: "store".to_string(),
                status: "unhealthy".to_string(),
                detail: Some(err.to_string()),
            });
        }
    }
    components.push(HealthComponent {
        name: "scheduler".to_string(),
        status: "healthy".to_string(),
        detail: None,
    });

    Ok(Json(HealthResponse {
        status: status.to_string(),
        service: state.config.service_name.clone(),
        version: state.config.version.clone(),
        uptime_secs: state.uptime_secs(),
        components,
    }))
}

/// GET /api/performance-metrics — Prometheus exposition; admin only.
pub async fn performance_metrics(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
) -> ApiResult<String> {
    if subject.role != Role::Admin {
        return Err(ApiError::Forbidden);
    }
    match &state.prometheus {
        Some(handle) => Ok(handle.render()),
        None => Ok(format!(
            "# metrics recorder not installed\nmallquest_uptime_seconds {}\n",
            state.uptime_secs()
        )),
    }
}
