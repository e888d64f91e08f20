//! Dashboard snapshot.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Extension, Json,
};
use std::sync::Arc;

use mq_auth::AuthSubject;
use mq_core::types::UserId;
use mq_engine::DashboardView;

use super::tenant_of;
use crate::error::ApiResult;
use crate::state::AppState;

/// GET /api/user/{id} — self or support staff only.
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> ApiResult<Json<DashboardView>> {
    let tenant = tenant_of(&state, &headers).await?;
    let target = UserId::new(user_id);
    let view = state
        .coordinator
        .get_dashboard(&tenant, &subject, &target)
        .await?;
    Ok(Json(view))
}
