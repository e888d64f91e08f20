//! Purchase receipts and their reward audit trail.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::common::{EventId, ReceiptId, TenantId, UserId};

/// How a receipt reached the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptSource {
    Mobile,
    Pos,
    Manual,
}

/// Verification state of a receipt.
///
/// Verified receipts are append-only; a reversal is a compensating
/// record, never an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Pending,
    Verified,
    Rejected,
    Suspicious,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationState::Pending => "pending",
            VerificationState::Verified => "verified",
            VerificationState::Rejected => "rejected",
            VerificationState::Suspicious => "suspicious",
        }
    }
}

/// The multipliers that went into one reward computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplierBreakdown {
    pub category: Decimal,
    pub time: Decimal,
    pub vip: Decimal,
    pub event: Decimal,
    pub streak: Decimal,
}

/// Computed reward, persisted with the receipt for auditability even
/// when credit is withheld.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSnapshot {
    pub coins: u64,
    pub xp: u64,
    pub bonus_coins: u64,
    pub vip_points: u64,
    pub multipliers: MultiplierBreakdown,
    /// Events whose multiplier was applied.
    pub event_ids: Vec<EventId>,
}

/// A customer's proof of purchase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Receipt {
    pub id: ReceiptId,
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub store: String,
    pub category: String,
    pub amount: Decimal,
    pub currency: String,
    pub submitted_at: DateTime<Utc>,
    pub idempotency_key: String,
    pub source: ReceiptSource,
    pub state: VerificationState,
    pub reward: Option<RewardSnapshot>,
}
