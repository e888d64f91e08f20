//! Authentication middleware.
//!
//! Verifies the bearer token, attaches the [`AuthSubject`] to request
//! extensions, and lets public paths through untouched. Tenant
//! resolution happens per handler from the request host.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::error::ApiError;
use crate::state::AppState;

/// Paths reachable without a token.
const PUBLIC_PATHS: &[&str] = &["/", "/health", "/login", "/register", "/refresh", "/ws"];

fn is_public(path: &str) -> bool {
    PUBLIC_PATHS.contains(&path)
}

/// Extract the bearer token from an Authorization header value.
pub fn bearer_token(value: &str) -> Option<&str> {
    value.strip_prefix("Bearer ").map(str::trim)
}

/// Require a valid access token on everything that is not public.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if is_public(request.uri().path()) {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(bearer_token);

    let Some(token) = token else {
        return ApiError::Unauthenticated.into_response();
    };

    match state.gate.verify(token).await {
        Ok(subject) => {
            request.extensions_mut().insert(subject);
            next.run(request).await
        }
        Err(err) => {
            tracing::debug!(error = %err, "token verification failed");
            ApiError::from(err).into_response()
        }
    }
}
