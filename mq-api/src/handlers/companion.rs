//! Companion care endpoints.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use std::sync::Arc;

use mq_auth::AuthSubject;
use mq_core::types::{Companion, CompanionId};

use super::tenant_of;
use crate::dto::{AdoptCompanionRequest, EntertainCompanionRequest, FeedCompanionRequest};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn parse_companion_id(raw: &str) -> ApiResult<CompanionId> {
    CompanionId::parse(raw)
        .ok_or_else(|| ApiError::BadRequest("malformed companion id".to_string()))
}

/// POST /api/companion/adopt.
pub async fn adopt_companion(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Json(body): Json<AdoptCompanionRequest>,
) -> ApiResult<(StatusCode, Json<Companion>)> {
    let tenant = tenant_of(&state, &headers).await?;
    let companion = state
        .coordinator
        .adopt_companion(&tenant, &subject, &body.name, &body.companion_type)
        .await?;
    Ok((StatusCode::CREATED, Json(companion)))
}

/// POST /api/companion/{id}/feed.
pub async fn feed_companion(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Path(companion_id): Path<String>,
    Json(body): Json<FeedCompanionRequest>,
) -> ApiResult<Json<Companion>> {
    let tenant = tenant_of(&state, &headers).await?;
    let companion_id = parse_companion_id(&companion_id)?;
    let companion = state
        .coordinator
        .feed_companion(&tenant, &subject, &companion_id, &body.food)
        .await?;
    Ok(Json(companion))
}

/// POST /api/companion/{id}/entertain.
pub async fn entertain_companion(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Path(companion_id): Path<String>,
    Json(body): Json<EntertainCompanionRequest>,
) -> ApiResult<Json<Companion>> {
    let tenant = tenant_of(&state, &headers).await?;
    let companion_id = parse_companion_id(&companion_id)?;
    let companion = state
        .coordinator
        .entertain_companion(&tenant, &subject, &companion_id, &body.activity)
        .await?;
    Ok(Json(companion))
}
