//! Notification tray endpoints.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use std::sync::Arc;

use mq_auth::AuthSubject;
use mq_core::types::{Notification, NotificationId};

use super::tenant_of;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn parse_notification_id(raw: &str) -> ApiResult<NotificationId> {
    NotificationId::parse(raw)
        .ok_or_else(|| ApiError::BadRequest("malformed notification id".to_string()))
}

/// GET /api/notifications — undismissed, unexpired, newest first.
pub async fn list_notifications(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Notification>>> {
    let tenant = tenant_of(&state, &headers).await?;
    let notifications = state
        .coordinator
        .list_notifications(&tenant, &subject)
        .await?;
    Ok(Json(notifications))
}

/// POST /api/notifications/{id}/read.
pub async fn read_notification(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Path(notification_id): Path<String>,
) -> ApiResult<StatusCode> {
    let tenant = tenant_of(&state, &headers).await?;
    let id = parse_notification_id(&notification_id)?;
    state
        .coordinator
        .mark_notification(&tenant, &subject, &id, false)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/notifications/{id}/dismiss.
pub async fn dismiss_notification(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Path(notification_id): Path<String>,
) -> ApiResult<StatusCode> {
    let tenant = tenant_of(&state, &headers).await?;
    let id = parse_notification_id(&notification_id)?;
    state
        .coordinator
        .mark_notification(&tenant, &subject, &id, true)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
