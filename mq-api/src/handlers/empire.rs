//! Empire facility endpoints.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use std::sync::Arc;

use mq_auth::AuthSubject;
use mq_core::types::{Facility, FacilityId};

use super::tenant_of;
use crate::dto::{CollectResponse, PurchaseFacilityRequest};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn parse_facility_id(raw: &str) -> ApiResult<FacilityId> {
    FacilityId::parse(raw).ok_or_else(|| ApiError::BadRequest("malformed facility id".to_string()))
}

/// POST /api/empire/purchase.
pub async fn purchase_facility(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Json(body): Json<PurchaseFacilityRequest>,
) -> ApiResult<(StatusCode, Json<Facility>)> {
    let tenant = tenant_of(&state, &headers).await?;
    let facility = state
        .coordinator
        .purchase_facility(&tenant, &subject, &body.facility_type)
        .await?;
    Ok((StatusCode::CREATED, Json(facility)))
}

/// POST /api/empire/{id}/upgrade.
pub async fn upgrade_facility(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Path(facility_id): Path<String>,
) -> ApiResult<Json<Facility>> {
    let tenant = tenant_of(&state, &headers).await?;
    let facility_id = parse_facility_id(&facility_id)?;
    let facility = state
        .coordinator
        .upgrade_facility(&tenant, &subject, &facility_id)
        .await?;
    Ok(Json(facility))
}

/// POST /api/empire/{id}/collect — move pending income into coins.
pub async fn collect_facility(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Path(facility_id): Path<String>,
) -> ApiResult<Json<CollectResponse>> {
    let tenant = tenant_of(&state, &headers).await?;
    let facility_id = parse_facility_id(&facility_id)?;
    let collected = state
        .coordinator
        .collect_facility(&tenant, &subject, &facility_id)
        .await?;
    Ok(Json(CollectResponse { collected }))
}
