//! Mission generation and claiming.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use std::sync::Arc;

use mq_auth::AuthSubject;
use mq_core::types::{Mission, MissionId};
use mq_engine::MissionOutcome;

use super::{idempotency_key, tenant_of};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /api/mission/generate — personalized mission in the first
/// free slot.
pub async fn generate_mission(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
) -> ApiResult<(StatusCode, Json<Mission>)> {
    let tenant = tenant_of(&state, &headers).await?;
    let mission = state
        .coordinator
        .generate_mission(&tenant, &subject)
        .await?;
    Ok((StatusCode::CREATED, Json(mission)))
}

/// POST /api/mission/{id}/claim — idempotent claim of a ready
/// mission.
pub async fn claim_mission(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Path(mission_id): Path<String>,
) -> ApiResult<Json<MissionOutcome>> {
    let tenant = tenant_of(&state, &headers).await?;
    let mission_id = MissionId::parse(&mission_id)
        .ok_or_else(|| ApiError::BadRequest("malformed mission id".to_string()))?;
    let outcome = state
        .coordinator
        .claim_mission(&tenant, &subject, &mission_id, idempotency_key(&headers))
        .await?;
    Ok(Json(outcome))
}
