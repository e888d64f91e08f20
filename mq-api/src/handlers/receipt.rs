//! Receipt submission, POS push and leaderboards.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use std::sync::Arc;
use uuid::Uuid;

use mq_auth::AuthSubject;
use mq_core::types::{ReceiptSource, UserId};
use mq_engine::{ReceiptOutcome, ReceiptSubmission};
use mq_store::LeaderboardEntry;

use super::{idempotency_key, tenant_of};
use crate::dto::{LeaderboardQuery, PosPurchaseRequest, ReceiptRequest};
use crate::error::ApiResult;
use crate::state::AppState;

/// POST /api/receipt — the canonical receipt path.
pub async fn submit_receipt(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Json(body): Json<ReceiptRequest>,
) -> ApiResult<(StatusCode, Json<ReceiptOutcome>)> {
    let tenant = tenant_of(&state, &headers).await?;
    let submission = ReceiptSubmission {
        amount: body.amount,
        store: body.store,
        category: body.category,
        ssid: body.ssid,
        idempotency_key: idempotency_key(&headers).unwrap_or_else(fresh_key),
        source: ReceiptSource::Mobile,
    };
    let outcome = state
        .coordinator
        .submit_receipt(&tenant, &subject, submission)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// POST /api/pos/purchase — POS-originated receipt for a player.
pub async fn pos_purchase(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Json(body): Json<PosPurchaseRequest>,
) -> ApiResult<(StatusCode, Json<ReceiptOutcome>)> {
    let tenant = tenant_of(&state, &headers).await?;
    let target = UserId::new(body.user_id);
    let submission = ReceiptSubmission {
        amount: body.amount,
        store: body.store,
        category: body.category,
        ssid: None,
        idempotency_key: idempotency_key(&headers).unwrap_or_else(fresh_key),
        source: ReceiptSource::Pos,
    };
    let outcome = state
        .coordinator
        .pos_purchase(&tenant, &subject, &target, submission)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// GET /api/leaderboard/{kind}.
pub async fn leaderboard(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    headers: HeaderMap,
    Path(kind): Path<String>,
    Query(query): Query<LeaderboardQuery>,
) -> ApiResult<Json<Vec<LeaderboardEntry>>> {
    let tenant = tenant_of(&state, &headers).await?;
    let board = state
        .coordinator
        .leaderboard(&tenant, &subject, &kind, query.limit)
        .await?;
    Ok(Json(board))
}

/// Server-side key for clients that omit the header; retries from
/// such clients are not idempotent.
fn fresh_key() -> String {
    Uuid::new_v4().simple().to_string()
}
