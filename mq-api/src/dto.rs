//! Request and response bodies for the public HTTP surface.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use mq_engine::DailyBonus;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub mfa_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_bonus: Option<DailyBonus>,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct MfaSetupResponse {
    pub secret: String,
    pub provisioning_uri: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct MfaVerifyRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct ReceiptRequest {
    pub amount: Decimal,
    pub store: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub ssid: Option<String>,
    /// Client-declared purchase time; informational only, the server
    /// clock drives reward computation.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct PosPurchaseRequest {
    pub user_id: String,
    pub amount: Decimal,
    pub store: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseFacilityRequest {
    #[serde(rename = "type")]
    pub facility_type: String,
}

#[derive(Debug, Serialize)]
pub struct CollectResponse {
    pub collected: u64,
}

#[derive(Debug, Deserialize)]
pub struct AdoptCompanionRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub companion_type: String,
}

#[derive(Debug, Deserialize)]
pub struct FeedCompanionRequest {
    pub food: String,
}

#[derive(Debug, Deserialize)]
pub struct EntertainCompanionRequest {
    pub activity: String,
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    #[serde(default = "default_board_limit")]
    pub limit: usize,
}

fn default_board_limit() -> usize {
    10
}

#[derive(Debug, Serialize)]
pub struct HealthComponent {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub uptime_secs: u64,
    pub components: Vec<HealthComponent>,
}
