//! Fraud heuristics. All O(1) table lookups; the coordinator supplies
//! the recent-submission count so the screen itself stays pure.

use serde::{Deserialize, Serialize};

use super::engine::RewardInput;
use crate::policy::TenantPolicy;
use crate::types::receipt::ReceiptSource;

/// Why a receipt was flagged. Flagged receipts still compute a reward;
/// credit is withheld pending review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudSignal {
    /// Amount above the tenant's suspicious threshold.
    AmountAboveThreshold,
    /// Too many receipts for the same store in a short window.
    RapidRepeatStore,
    /// Store not on the tenant allow-list.
    StoreNotAllowed,
    /// Declared Wi-Fi SSID missing or not the mall's.
    WifiMismatch,
}

impl FraudSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            FraudSignal::AmountAboveThreshold => "amount_above_threshold",
            FraudSignal::RapidRepeatStore => "rapid_repeat_store",
            FraudSignal::StoreNotAllowed => "store_not_allowed",
            FraudSignal::WifiMismatch => "wifi_mismatch",
        }
    }
}

/// Run every heuristic against one submission.
pub fn screen(input: &RewardInput<'_>, policy: &TenantPolicy) -> Vec<FraudSignal> {
    let mut signals = Vec::new();

    if input.amount > policy.suspicious_amount {
        signals.push(FraudSignal::AmountAboveThreshold);
    }

    // recent_same_store counts prior submissions within the window, so
    // this one makes recent + 1.
    if input.recent_same_store + 1 >= policy.duplicate_max_submissions {
        signals.push(FraudSignal::RapidRepeatStore);
    }

    if !policy.store_allow_list.is_empty() && !policy.store_allow_list.contains(input.store) {
        signals.push(FraudSignal::StoreNotAllowed);
    }

    // POS-originated receipts arrive from inside the mall; the SSID
    // check applies to mobile uploads only.
    if policy.enforce_wifi_presence && input.source == ReceiptSource::Mobile {
        let on_mall_wifi = input
            .declared_ssid
            .map(|ssid| policy.wifi_ssids.contains(ssid))
            .unwrap_or(false);
        if !on_mall_wifi {
            signals.push(FraudSignal::WifiMismatch);
        }
    }

    signals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::common::{Role, TenantId};
    use crate::types::user::User;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn test_user() -> User {
        User::new(
            TenantId::new("t1"),
            "u@example.com",
            "U",
            "hash",
            Role::Player,
            Utc::now(),
        )
    }

    fn input<'a>(user: &'a User, amount: i64) -> RewardInput<'a> {
        RewardInput {
            user,
            amount: Decimal::from(amount),
            store: "Deerfields Fashion",
            category: "fashion",
            declared_ssid: None,
            recent_same_store: 0,
            source: ReceiptSource::Mobile,
        }
    }

    #[test]
    fn test_clean_receipt_has_no_signals() {
        let user = test_user();
        let policy = TenantPolicy::default();
        assert!(screen(&input(&user, 100), &policy).is_empty());
    }

    #[test]
    fn test_large_amount_flagged() {
        let user = test_user();
        let policy = TenantPolicy::default();
        let signals = screen(&input(&user, 9_500), &policy);
        assert_eq!(signals, vec![FraudSignal::AmountAboveThreshold]);
    }

    #[test]
    fn test_rapid_repeat_flagged_at_threshold() {
        let user = test_user();
        let policy = TenantPolicy::default();
        let mut i = input(&user, 100);
        i.recent_same_store = 1;
        assert!(screen(&i, &policy).is_empty());
        i.recent_same_store = 2;
        assert_eq!(screen(&i, &policy), vec![FraudSignal::RapidRepeatStore]);
    }

    #[test]
    fn test_allow_list_enforced_when_present() {
        let user = test_user();
        let mut policy = TenantPolicy::default();
        policy
            .store_allow_list
            .insert("Deerfields Fashion".to_string());
        assert!(screen(&input(&user, 100), &policy).is_empty());

        let mut i = input(&user, 100);
        i.store = "Pop-up Stall";
        assert_eq!(screen(&i, &policy), vec![FraudSignal::StoreNotAllowed]);
    }

    #[test]
    fn test_wifi_check_mobile_only() {
        let user = test_user();
        let mut policy = TenantPolicy::default();
        policy.enforce_wifi_presence = true;
        policy.wifi_ssids.insert("Deerfields-Guest".to_string());

        // Missing SSID on mobile is a mismatch.
        assert_eq!(
            screen(&input(&user, 100), &policy),
            vec![FraudSignal::WifiMismatch]
        );

        let mut ok = input(&user, 100);
        ok.declared_ssid = Some("Deerfields-Guest");
        assert!(screen(&ok, &policy).is_empty());

        let mut pos = input(&user, 100);
        pos.source = ReceiptSource::Pos;
        assert!(screen(&pos, &policy).is_empty());
    }
}
