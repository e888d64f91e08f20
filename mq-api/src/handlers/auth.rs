//! Identity endpoints: register, login, refresh, logout, MFA.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use std::sync::Arc;

use mq_auth::AuthSubject;
use mq_core::types::Role;
use mq_store::Store;

use super::{client_ip, tenant_of};
use crate::dto::{
    LoginRequest, LoginResponse, MfaSetupResponse, MfaVerifyRequest, RefreshRequest,
    RegisterRequest, RegisterResponse,
};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /register — create a player account.
pub async fn register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let tenant = tenant_of(&state, &headers).await?;
    state
        .rate_limiter
        .check(&format!("ip:{}", client_ip(&headers)), "login")
        .await
        .map_err(ApiError::from)?;

    let display_name = body
        .display_name
        .clone()
        .unwrap_or_else(|| body.email.split('@').next().unwrap_or("visitor").to_string());
    let user = state
        .gate
        .register(&tenant.id, &body.email, &display_name, &body.password, Role::Player)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: user.id.to_string(),
            email: user.email,
        }),
    ))
}

/// POST /login — issue a token pair; may require an MFA code.
pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> ApiResult<(StatusCode, Json<LoginResponse>)> {
    let tenant = tenant_of(&state, &headers).await?;
    let ip = client_ip(&headers);
    state
        .rate_limiter
        .check(&format!("ip:{ip}"), "login")
        .await
        .map_err(ApiError::from)?;

    let tokens = state
        .gate
        .login(
            &tenant.id,
            &body.email,
            &body.password,
            body.mfa_code.as_deref(),
            Some(ip),
            headers
                .get("User-Agent")
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        )
        .await?;

    // First qualifying activity of the day advances the streak and
    // pays the VIP daily bonus. Best-effort; login still succeeds if
    // the progression write loses a race.
    let daily_bonus = state
        .coordinator
        .record_login(&tenant, &tokens.user_id)
        .await
        .unwrap_or_else(|err| {
            tracing::warn!(error = %err, "daily login progression failed");
            None
        });

    Ok((
        StatusCode::CREATED,
        Json(LoginResponse {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            access_expires_at: tokens.access_expires_at,
            refresh_expires_at: tokens.refresh_expires_at,
            daily_bonus,
        }),
    ))
}

/// POST /refresh — rotate the access token.
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<RefreshRequest>,
) -> ApiResult<Json<LoginResponse>> {
    state
        .rate_limiter
        .check(&format!("ip:{}", client_ip(&headers)), "refresh")
        .await
        .map_err(ApiError::from)?;

    let tokens = state
        .gate
        .refresh(&body.refresh_token, Some(client_ip(&headers)), None)
        .await?;
    Ok(Json(LoginResponse {
        access_token: tokens.access_token,
        refresh_token: tokens.refresh_token,
        access_expires_at: tokens.access_expires_at,
        refresh_expires_at: tokens.refresh_expires_at,
        daily_bonus: None,
    }))
}

/// POST /logout — revoke the presented session.
pub async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
) -> ApiResult<StatusCode> {
    state.store.revoke_session(&subject.token_hash).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /mfa/setup — enroll TOTP; returns the provisioning URI and
/// single-use backup codes exactly once.
pub async fn mfa_setup(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
) -> ApiResult<Json<MfaSetupResponse>> {
    state
        .rate_limiter
        .check(&format!("user:{}", subject.user_id), "mfa_setup")
        .await
        .map_err(ApiError::from)?;

    let setup = state
        .gate
        .setup_mfa(&subject.tenant_id, &subject.user_id)
        .await?;
    Ok(Json(MfaSetupResponse {
        secret: setup.secret,
        provisioning_uri: setup.provisioning_uri,
        backup_codes: setup.backup_codes,
    }))
}

/// POST /mfa/verify — confirm enrollment with a live code.
pub async fn mfa_verify(
    State(state): State<Arc<AppState>>,
    Extension(subject): Extension<AuthSubject>,
    Json(body): Json<MfaVerifyRequest>,
) -> ApiResult<StatusCode> {
    state
        .rate_limiter
        .check(&format!("user:{}", subject.user_id), "mfa_verify")
        .await
        .map_err(ApiError::from)?;

    state
        .gate
        .confirm_mfa(&subject.tenant_id, &subject.user_id, &body.code)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
