//! End-to-end tests over the HTTP surface.

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

use mq_api::{build_app, AppState};
use mq_core::types::{Tenant, TenantId};
use mq_core::{MallConfig, TenantPolicy};
use mq_store::{ShardedStore, Store};

const PASSWORD: &str = "Correct1Horse!";

/// Time multipliers pinned to 1.0 so reward expectations do not
/// depend on the wall clock.
fn flat_time_policy() -> TenantPolicy {
    let mut policy = TenantPolicy::default();
    policy.time_multipliers.morning = Decimal::ONE;
    policy.time_multipliers.afternoon = Decimal::ONE;
    policy.time_multipliers.evening = Decimal::ONE;
    policy.time_multipliers.night = Decimal::ONE;
    policy.time_multipliers.weekend = Decimal::ONE;
    policy
}

async fn test_app() -> Router {
    let mut config = MallConfig::default();
    config.auth_secret = Some("integration-test-secret".to_string());

    let store = Arc::new(ShardedStore::in_memory(2));
    store
        .upsert_tenant(Tenant::new(
            TenantId::new("deerfields"),
            "Deerfields Mall",
            "deerfields.example.com",
            flat_time_policy(),
            Utc::now(),
        ))
        .await
        .unwrap();

    let state = AppState::from_config(&config, store).unwrap();
    build_app(Arc::new(state))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::HOST, "deerfields.example.com")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed_post(path: &str, token: &str, idem: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::HOST, "deerfields.example.com")
        .header(header::AUTHORIZATION, format!("Bearer {token}"));
    if let Some(idem) = idem {
        builder = builder.header("Idempotency-Key", idem);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn authed_get(path: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header(header::HOST, "deerfields.example.com")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

/// Register and log in one player, returning (access token, user id).
async fn register_and_login(app: &Router, email: &str) -> (String, String) {
    let response = app
        .clone()
        .oneshot(post_json(
            "/register",
            json!({"email": email, "password": PASSWORD}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let registered = body_json(response).await;
    let user_id = registered["user_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            "/login",
            json!({"email": email, "password": PASSWORD}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let tokens = body_json(response).await;
    (
        tokens["access_token"].as_str().unwrap().to_string(),
        user_id,
    )
}

#[tokio::test]
async fn test_health_is_public() {
    let app = test_app().await;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_receipt_requires_auth() {
    let app = test_app().await;
    let response = app
        .oneshot(post_json("/api/receipt", json!({"amount": 100, "store": "X"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_rejects_wrong_password() {
    let app = test_app().await;
    register_and_login(&app, "visitor@example.com").await;

    let response = app
        .oneshot(post_json(
            "/login",
            json!({"email": "visitor@example.com", "password": "Wrong1Pass!"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_receipt_flow_with_idempotent_retry() {
    let app = test_app().await;
    let (token, _) = register_and_login(&app, "shopper@example.com").await;

    let body = json!({"amount": 100.00, "store": "Deerfields Fashion", "category": "fashion"});
    let response = app
        .clone()
        .oneshot(authed_post("/api/receipt", &token, Some("k1"), body.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let first = body_json(response).await;
    assert_eq!(first["status"], "verified");
    assert_eq!(first["reward"]["coins"], 13);
    assert_eq!(first["reward"]["xp"], 26);

    // Retry under the same key returns the stored outcome unchanged.
    let response = app
        .clone()
        .oneshot(authed_post("/api/receipt", &token, Some("k1"), body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let second = body_json(response).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_receipt_validation_errors() {
    let app = test_app().await;
    let (token, _) = register_and_login(&app, "val@example.com").await;

    let response = app
        .clone()
        .oneshot(authed_post(
            "/api/receipt",
            &token,
            Some("k1"),
            json!({"amount": -5, "store": "X"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(authed_post(
            "/api/receipt",
            &token,
            Some("k2"),
            json!({"amount": 99999.00, "store": "X"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_idempotency_conflict_on_payload_change() {
    let app = test_app().await;
    let (token, _) = register_and_login(&app, "conflict@example.com").await;

    let response = app
        .clone()
        .oneshot(authed_post(
            "/api/receipt",
            &token,
            Some("k1"),
            json!({"amount": 100.00, "store": "Deerfields Fashion"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(authed_post(
            "/api/receipt",
            &token,
            Some("k1"),
            json!({"amount": 250.00, "store": "Deerfields Fashion"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_dashboard_self_and_forbidden() {
    let app = test_app().await;
    let (token, user_id) = register_and_login(&app, "dash@example.com").await;
    let (other_token, _) = register_and_login(&app, "other@example.com").await;

    let response = app
        .clone()
        .oneshot(authed_get(&format!("/api/user/{user_id}"), &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["user_id"].as_str().unwrap(), user_id);

    let response = app
        .clone()
        .oneshot(authed_get(&format!("/api/user/{user_id}"), &other_token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_mission_generate_and_premature_claim() {
    let app = test_app().await;
    let (token, _) = register_and_login(&app, "quests@example.com").await;

    let response = app
        .clone()
        .oneshot(authed_post("/api/mission/generate", &token, None, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let mission = body_json(response).await;
    let mission_id = mission["id"].as_str().unwrap().to_string();
    assert_eq!(mission["status"], "active");

    let response = app
        .clone()
        .oneshot(authed_post(
            &format!("/api/mission/{mission_id}/claim"),
            &token,
            None,
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_leaderboard_kinds() {
    let app = test_app().await;
    let (token, _) = register_and_login(&app, "board@example.com").await;

    let response = app
        .clone()
        .oneshot(authed_get("/api/leaderboard/coins", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let board = body_json(response).await;
    assert!(board.as_array().unwrap().len() >= 1);

    let response = app
        .clone()
        .oneshot(authed_get("/api/leaderboard/fame", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_requires_admin() {
    let app = test_app().await;
    let (token, _) = register_and_login(&app, "player@example.com").await;

    let response = app
        .clone()
        .oneshot(authed_get("/api/performance-metrics", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_logout_revokes_session() {
    let app = test_app().await;
    let (token, user_id) = register_and_login(&app, "bye@example.com").await;

    let response = app
        .clone()
        .oneshot(authed_post("/logout", &token, None, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Session finality: the revoked token no longer verifies.
    let response = app
        .clone()
        .oneshot(authed_get(&format!("/api/user/{user_id}"), &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_empire_purchase_requires_coins() {
    let app = test_app().await;
    let (token, _) = register_and_login(&app, "tycoon@example.com").await;

    let response = app
        .clone()
        .oneshot(authed_post(
            "/api/empire/purchase",
            &token,
            None,
            json!({"type": "kiosk"}),
        ))
        .await
        .unwrap();
    // A fresh player is below the kiosk's level-5 unlock (and could
    // not afford its 1000-coin cost either).
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_route_behind_auth() {
    let app = test_app().await;
    // Unknown paths are not public, so the gate answers first.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (token, _) = register_and_login(&app, "lost@example.com").await;
    let response = app
        .oneshot(authed_get("/api/does-not-exist", &token))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
