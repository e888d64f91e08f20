use super::*;
use mq_core::config::default_rate_limits;
use mq_core::policy::TenantPolicy;
use mq_core::types::User;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Default policy with time multipliers pinned to 1.0 so expectations
/// do not depend on the wall clock.
fn flat_time_policy() -> TenantPolicy {
    let mut policy = TenantPolicy::default();
    policy.time_multipliers.morning = Decimal::ONE;
    policy.time_multipliers.afternoon = Decimal::ONE;
    policy.time_multipliers.evening = Decimal::ONE;
    policy.time_multipliers.night = Decimal::ONE;
    policy.time_multipliers.weekend = Decimal::ONE;
    policy
}

fn test_tenant() -> Tenant {
    Tenant::new(
        TenantId::new("deerfields"),
        "Deerfields Mall",
        "deerfields.example.com",
        flat_time_policy(),
        Utc::now(),
    )
}

struct Harness {
    coordinator: Coordinator,
    tenant: Tenant,
    subject: AuthSubject,
}

async fn harness() -> Harness {
    harness_with_coins(0).await
}

async fn harness_with_coins(coins: u64) -> Harness {
    harness_with(coins, 1).await
}

async fn harness_with(coins: u64, level: u32) -> Harness {
    let store = Arc::new(ShardedStore::in_memory(4));
    let dyn_store: Arc<dyn Store> = store.clone();
    let rate_limiter = Arc::new(RateLimiter::new(dyn_store, default_rate_limits()));
    let hub = Arc::new(NotificationHub::default());
    let coordinator = Coordinator::new(store.clone(), rate_limiter, hub);
    let tenant = test_tenant();

    let mut user = User::new(
        tenant.id.clone(),
        "u1@example.com",
        "u1",
        "hash",
        Role::Player,
        Utc::now(),
    );
    user.coins = coins;
    user.level = level;
    let subject = AuthSubject {
        tenant_id: tenant.id.clone(),
        user_id: user.id.clone(),
        role: Role::Player,
        token_hash: "test-token-hash".to_string(),
    };
    store
        .create_user(UserAggregate::new(user))
        .await
        .unwrap();

    Harness {
        coordinator,
        tenant,
        subject,
    }
}

fn submission(amount: &str, store: &str, category: &str, idem: &str) -> ReceiptSubmission {
    ReceiptSubmission {
        amount: Decimal::from_str(amount).unwrap(),
        store: store.to_string(),
        category: Some(category.to_string()),
        ssid: None,
        idempotency_key: idem.to_string(),
        source: ReceiptSource::Mobile,
    }
}

#[tokio::test]
async fn test_basic_receipt() {
    let h = harness().await;
    let outcome = h
        .coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            submission("100.00", "Deerfields Fashion", "fashion", "k1"),
        )
        .await
        .unwrap();

    // coins = round(100 × 0.10 × 1.3) = 13, xp = round(100 × 0.20 × 1.3) = 26.
    assert_eq!(outcome.status, VerificationState::Verified);
    assert_eq!(outcome.reward.coins, 13);
    assert_eq!(outcome.reward.xp, 26);
    assert_eq!(outcome.user.coins, 13);
    assert_eq!(outcome.user.xp, 26);
    assert_eq!(outcome.user.level, 1);
    assert_eq!(outcome.events[0], DerivedEvent::ReceiptVerified);
    assert!(!outcome
        .events
        .iter()
        .any(|e| matches!(e, DerivedEvent::LevelUp { .. })));
}

#[tokio::test]
async fn test_idempotent_retry() {
    let h = harness().await;
    let body = submission("100.00", "Deerfields Fashion", "fashion", "k1");

    let first = h
        .coordinator
        .submit_receipt(&h.tenant, &h.subject, body.clone())
        .await
        .unwrap();
    let second = h
        .coordinator
        .submit_receipt(&h.tenant, &h.subject, body)
        .await
        .unwrap();

    assert_eq!(first, second);

    let aggregate = h
        .coordinator
        .store()
        .load_user(&h.tenant.id, &h.subject.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.receipts.len(), 1);
    assert_eq!(aggregate.user.coins, 13);
}

#[tokio::test]
async fn test_idempotency_key_with_different_payload_conflicts() {
    let h = harness().await;
    h.coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            submission("100.00", "Deerfields Fashion", "fashion", "k1"),
        )
        .await
        .unwrap();

    let err = h
        .coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            submission("200.00", "Deerfields Fashion", "fashion", "k1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn test_level_up() {
    let h = harness().await;
    h.coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            submission("100.00", "Deerfields Fashion", "fashion", "k1"),
        )
        .await
        .unwrap();

    let outcome = h
        .coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            submission("400.00", "Deerfields Electronics", "electronics", "k2"),
        )
        .await
        .unwrap();

    // xp += round(400 × 0.20 × 1.2) = 96; 26 + 96 = 122 → level 2.
    assert_eq!(outcome.reward.xp, 96);
    assert_eq!(outcome.user.xp, 122);
    assert_eq!(outcome.user.level, 2);
    assert!(outcome
        .events
        .contains(&DerivedEvent::LevelUp { from: 1, to: 2 }));
}

#[tokio::test]
async fn test_rate_limit_caps_submissions() {
    let h = harness().await;
    let mut committed = 0;
    let mut rejected = 0;
    for i in 0..11 {
        let result = h
            .coordinator
            .submit_receipt(
                &h.tenant,
                &h.subject,
                submission("10.00", "Deerfields Cafe", "food", &format!("k{i}")),
            )
            .await;
        match result {
            Ok(_) => committed += 1,
            Err(EngineError::RateLimited { .. }) => rejected += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(committed, 10);
    assert_eq!(rejected, 1);

    let aggregate = h
        .coordinator
        .store()
        .load_user(&h.tenant.id, &h.subject.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.receipts.len(), 10);
}

#[tokio::test]
async fn test_amount_above_max_is_rejected_outright() {
    let h = harness().await;
    let err = h
        .coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            submission("99999.00", "Deerfields Luxury", "luxury", "k1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let aggregate = h
        .coordinator
        .store()
        .load_user(&h.tenant.id, &h.subject.user_id)
        .await
        .unwrap()
        .unwrap();
    assert!(aggregate.receipts.is_empty());
}

#[tokio::test]
async fn test_amount_boundaries() {
    let h = harness().await;
    // Exactly at the maximum is accepted.
    h.coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            submission("10000.00", "Deerfields Luxury", "luxury", "k-max"),
        )
        .await
        .unwrap();
    // One minor unit above is rejected.
    let err = h
        .coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            submission("10000.01", "Deerfields Luxury", "luxury", "k-over"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_suspicious_receipt_withholds_credit() {
    let h = harness().await;
    let outcome = h
        .coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            submission("9500.00", "Deerfields Luxury", "luxury", "k1"),
        )
        .await
        .unwrap();

    assert_eq!(outcome.status, VerificationState::Suspicious);
    // The reward was computed for audit but not credited.
    assert!(outcome.reward.coins > 0);
    assert_eq!(outcome.user.coins, 0);
    assert_eq!(outcome.user.xp, 0);
    assert!(outcome.events.is_empty());

    let aggregate = h
        .coordinator
        .store()
        .load_user(&h.tenant.id, &h.subject.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.user.coins, 0);
    assert_eq!(aggregate.receipts.len(), 1);
    let receipt = &aggregate.receipts[0];
    assert_eq!(receipt.state, VerificationState::Suspicious);
    assert!(receipt.reward.is_some());
}

#[tokio::test]
async fn test_concurrent_writers_both_commit() {
    let h = Arc::new(harness().await);

    let a = {
        let h = h.clone();
        tokio::spawn(async move {
            h.coordinator
                .submit_receipt(
                    &h.tenant,
                    &h.subject,
                    submission("100.00", "Deerfields Fashion", "fashion", "ka"),
                )
                .await
        })
    };
    let b = {
        let h = h.clone();
        tokio::spawn(async move {
            h.coordinator
                .submit_receipt(
                    &h.tenant,
                    &h.subject,
                    submission("100.00", "Deerfields Fashion", "fashion", "kb"),
                )
                .await
        })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    let aggregate = h
        .coordinator
        .store()
        .load_user(&h.tenant.id, &h.subject.user_id)
        .await
        .unwrap()
        .unwrap();
    // Conservation: final totals are exactly the sum of both rewards.
    assert_eq!(
        aggregate.user.coins,
        totals_coins(&a) + totals_coins(&b)
    );
    assert_eq!(aggregate.receipts.len(), 2);
}

/// Coins credited by one outcome, including any tier bonus implied by
/// the difference between response totals.
fn totals_coins(outcome: &ReceiptOutcome) -> u64 {
    outcome.reward.coins + outcome.reward.bonus
}

#[tokio::test]
async fn test_mission_lifecycle_generate_progress_claim() {
    let h = harness().await;
    let mission = h
        .coordinator
        .generate_mission(&h.tenant, &h.subject)
        .await
        .unwrap();
    assert_eq!(mission.status, MissionStatus::Active);
    assert_eq!(mission.template_id, "daily_spend");

    // Spend enough to satisfy any daily_spend target in one receipt.
    let outcome = h
        .coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            submission("900.00", "Deerfields Fashion", "fashion", "k1"),
        )
        .await
        .unwrap();
    assert!(outcome
        .events
        .iter()
        .any(|e| matches!(e, DerivedEvent::MissionReady { .. })));

    let claim = h
        .coordinator
        .claim_mission(&h.tenant, &h.subject, &mission.id, None)
        .await
        .unwrap();
    assert_eq!(claim.reward, mission.reward);

    // Second claim replays the stored outcome.
    let replay = h
        .coordinator
        .claim_mission(&h.tenant, &h.subject, &mission.id, None)
        .await
        .unwrap();
    assert_eq!(claim, replay);

    let aggregate = h
        .coordinator
        .store()
        .load_user(&h.tenant.id, &h.subject.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.missions[0].status, MissionStatus::Completed);
    assert_eq!(aggregate.user.coins, outcome.user.coins + claim.reward.coins);
}

#[tokio::test]
async fn test_claim_unready_mission_rejected() {
    let h = harness().await;
    let mission = h
        .coordinator
        .generate_mission(&h.tenant, &h.subject)
        .await
        .unwrap();
    let err = h
        .coordinator
        .claim_mission(&h.tenant, &h.subject, &mission.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_mission_slots_fill_up() {
    let h = harness().await;
    for _ in 0..4 {
        h.coordinator
            .generate_mission(&h.tenant, &h.subject)
            .await
            .unwrap();
    }
    let err = h
        .coordinator
        .generate_mission(&h.tenant, &h.subject)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
}

#[tokio::test]
async fn test_daily_login_bonus_once_per_day() {
    let h = harness().await;
    let first = h
        .coordinator
        .record_login(&h.tenant, &h.subject.user_id)
        .await
        .unwrap();
    let bonus = first.expect("first login of the day pays a bonus");
    // Bronze daily bonus 5 + streak bonus 2 at one day, plus
    // 10 + 2-per-streak-day login XP.
    assert_eq!(bonus.coins, 7);
    assert_eq!(bonus.xp, 12);
    assert_eq!(bonus.streak_days, 1);

    let aggregate = h
        .coordinator
        .store()
        .load_user(&h.tenant.id, &h.subject.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.user.coins, 7);
    assert_eq!(aggregate.user.xp, 12);

    let second = h
        .coordinator
        .record_login(&h.tenant, &h.subject.user_id)
        .await
        .unwrap();
    assert!(second.is_none());
}

#[tokio::test]
async fn test_empire_purchase_upgrade_collect() {
    let h = harness_with(2_500, 5).await;

    let facility = h
        .coordinator
        .purchase_facility(&h.tenant, &h.subject, "kiosk")
        .await
        .unwrap();
    let aggregate = h
        .coordinator
        .store()
        .load_user(&h.tenant.id, &h.subject.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.user.coins, 1_500);

    let upgraded = h
        .coordinator
        .upgrade_facility(&h.tenant, &h.subject, &facility.id)
        .await
        .unwrap();
    assert_eq!(upgraded.level, 2);
    let aggregate = h
        .coordinator
        .store()
        .load_user(&h.tenant.id, &h.subject.user_id)
        .await
        .unwrap()
        .unwrap();
    // First upgrade costs the base 1000.
    assert_eq!(aggregate.user.coins, 500);

    // Nothing accrued yet.
    assert_eq!(
        h.coordinator
            .collect_facility(&h.tenant, &h.subject, &facility.id)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_empire_requires_level_and_coins() {
    // Plenty of coins, but a department store unlocks at level 18.
    let h = harness_with(10_000, 1).await;
    let err = h
        .coordinator
        .purchase_facility(&h.tenant, &h.subject, "department_store")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // Level gate satisfied, coins short of the 1000 kiosk cost.
    let broke = harness_with(10, 5).await;
    let err = broke
        .coordinator
        .purchase_facility(&broke.tenant, &broke.subject, "kiosk")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_companion_adopt_and_feed() {
    let h = harness_with_coins(100).await;
    let companion = h
        .coordinator
        .adopt_companion(&h.tenant, &h.subject, "Koinko", "fawn")
        .await
        .unwrap();

    let fed = h
        .coordinator
        .feed_companion(&h.tenant, &h.subject, &companion.id, "premium_feed")
        .await
        .unwrap();
    assert_eq!(fed.stats.health, 100);

    let aggregate = h
        .coordinator
        .store()
        .load_user(&h.tenant.id, &h.subject.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.user.coins, 75);
    assert_eq!(aggregate.companions.len(), 1);
}

#[tokio::test]
async fn test_dashboard_authorization() {
    let h = harness().await;
    let view = h
        .coordinator
        .get_dashboard(&h.tenant, &h.subject, &h.subject.user_id)
        .await
        .unwrap();
    assert_eq!(view.user_id, h.subject.user_id);

    let stranger = AuthSubject {
        tenant_id: h.tenant.id.clone(),
        user_id: UserId::new("someone-else"),
        role: Role::Player,
        token_hash: "other".to_string(),
    };
    let err = h
        .coordinator
        .get_dashboard(&h.tenant, &stranger, &h.subject.user_id)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let admin = AuthSubject {
        tenant_id: h.tenant.id.clone(),
        user_id: UserId::new("admin-user"),
        role: Role::Admin,
        token_hash: "admin".to_string(),
    };
    h.coordinator
        .get_dashboard(&h.tenant, &admin, &h.subject.user_id)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_pos_purchase_requires_service_role() {
    let h = harness().await;
    let err = h
        .coordinator
        .pos_purchase(
            &h.tenant,
            &h.subject,
            &h.subject.user_id.clone(),
            submission("50.00", "Deerfields Cafe", "food", "pos-1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden(_)));

    let pos = AuthSubject {
        tenant_id: h.tenant.id.clone(),
        user_id: UserId::new("pos-terminal-1"),
        role: Role::Shopkeeper,
        token_hash: "pos".to_string(),
    };
    let outcome = h
        .coordinator
        .pos_purchase(
            &h.tenant,
            &pos,
            &h.subject.user_id.clone(),
            submission("50.00", "Deerfields Cafe", "food", "pos-1"),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, VerificationState::Verified);

    let aggregate = h
        .coordinator
        .store()
        .load_user(&h.tenant.id, &h.subject.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(aggregate.receipts[0].source, ReceiptSource::Pos);
}

#[tokio::test]
async fn test_unknown_category_inferred_from_store() {
    let h = harness().await;
    let outcome = h
        .coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            ReceiptSubmission {
                amount: Decimal::from(100),
                store: "Deerfields Electronics Hub".to_string(),
                category: None,
                ssid: None,
                idempotency_key: "k1".to_string(),
                source: ReceiptSource::Mobile,
            },
        )
        .await
        .unwrap();
    // Inferred "electronics" → 1.2 multiplier.
    assert_eq!(outcome.reward.coins, 12);
}

#[tokio::test]
async fn test_store_name_is_sanitized() {
    let h = harness().await;
    h.coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            submission("50.00", "<script>Mall</script>", "food", "k1"),
        )
        .await
        .unwrap();
    let aggregate = h
        .coordinator
        .store()
        .load_user(&h.tenant.id, &h.subject.user_id)
        .await
        .unwrap()
        .unwrap();
    assert!(!aggregate.receipts[0].store.contains('<'));
    assert!(aggregate.receipts[0].store.contains("&lt;script&gt;"));
}

#[tokio::test]
async fn test_notifications_mark_and_dismiss() {
    let h = harness().await;
    // Level up generates a persisted notification.
    h.coordinator
        .submit_receipt(
            &h.tenant,
            &h.subject,
            submission("600.00", "Deerfields Fashion", "fashion", "k1"),
        )
        .await
        .unwrap();

    let notifications = h
        .coordinator
        .list_notifications(&h.tenant, &h.subject)
        .await
        .unwrap();
    assert!(!notifications.is_empty());

    let target = notifications[0].id;
    h.coordinator
        .mark_notification(&h.tenant, &h.subject, &target, true)
        .await
        .unwrap();
    let remaining = h
        .coordinator
        .list_notifications(&h.tenant, &h.subject)
        .await
        .unwrap();
    assert!(remaining.iter().all(|n| n.id != target));
}
