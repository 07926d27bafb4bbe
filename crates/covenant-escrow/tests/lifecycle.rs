mod common;

use std::sync::atomic::Ordering;

use chrono::Duration;
use common::{harness, harness_with, key, receipt, request};
use covenant_escrow::{EscrowConfig, EvidenceInput, TreasuryAccount};
use covenant_risk::{FraudRule, FraudRuleType, RiskConfig, RuleAction};
use covenant_types::{
    AccountId, Clock, CommissionLedgerEntry, CommissionStatus, Currency, EscrowStatus, ProofType,
    ReleaseCondition,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_create_and_release_moves_funds() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();

    let created = h
        .manager
        .create(request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual), &key("c-1"))
        .await
        .unwrap();
    assert!(!created.is_replay());
    let escrow = created.value;
    assert_eq!(escrow.status, EscrowStatus::Held);
    assert_eq!(escrow.commission.tier_name, "standard");
    assert_eq!(escrow.commission.giver_pays, dec!(1060));
    assert_eq!(escrow.commission.receiver_gets, dec!(960));
    assert_eq!(h.wallet(&sender, Currency::EUR).await, dec!(940));
    assert_eq!(h.held(&escrow.id).await, dec!(1060));

    let released = h
        .manager
        .release(&escrow.id, &sender, &key("r-1"))
        .await
        .unwrap()
        .value;
    assert_eq!(released.status, EscrowStatus::Released);
    assert_eq!(released.released_by, Some(sender.clone()));
    assert_eq!(h.wallet(&recipient, Currency::EUR).await, dec!(960));
    assert_eq!(h.held(&escrow.id).await, dec!(100));

    let entry = h.manager.commission_entry(&escrow.id).unwrap();
    assert_eq!(entry.status, CommissionStatus::Pending);
    assert_eq!(entry.platform_revenue, dec!(100));
    assert_eq!(h.treasury.total(Currency::EUR), dec!(2000));
}

#[tokio::test]
async fn test_replay_moves_funds_once() {
    let h = harness();
    let sender = h.funded_account(dec!(5000)).await;
    let recipient = AccountId::new();
    let req = request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual);

    let first = h.manager.create(req.clone(), &key("c-1")).await.unwrap();
    let second = h.manager.create(req, &key("c-1")).await.unwrap();
    assert!(second.is_replay());
    assert_eq!(
        serde_json::to_vec(&first.value).unwrap(),
        serde_json::to_vec(&second.value).unwrap()
    );
    assert_eq!(h.wallet(&sender, Currency::EUR).await, dec!(3940));

    let id = first.value.id;
    let r1 = h.manager.release(&id, &sender, &key("r-1")).await.unwrap();
    let r2 = h.manager.release(&id, &sender, &key("r-1")).await.unwrap();
    assert!(r2.is_replay());
    assert_eq!(r1.value, r2.value);
    assert_eq!(h.wallet(&recipient, Currency::EUR).await, dec!(960));
    assert_eq!(h.commissions.len(), 1);
}

#[tokio::test]
async fn test_key_reuse_with_different_request_is_rejected() {
    let h = harness();
    let sender = h.funded_account(dec!(5000)).await;
    let recipient = AccountId::new();

    h.manager
        .create(request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual), &key("c-1"))
        .await
        .unwrap();
    let err = h
        .manager
        .create(request(&sender, &recipient, dec!(1200), ReleaseCondition::Manual), &key("c-1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
    assert_eq!(h.wallet(&sender, Currency::EUR).await, dec!(3940));
}

#[tokio::test]
async fn test_terminal_state_is_immutable() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();
    let escrow = h
        .manager
        .create(request(&sender, &recipient, dec!(500), ReleaseCondition::Manual), &key("c-1"))
        .await
        .unwrap()
        .value;
    h.manager.release(&escrow.id, &sender, &key("r-1")).await.unwrap();

    let err = h.manager.release(&escrow.id, &sender, &key("r-2")).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");
    let err = h.manager.refund(&escrow.id, "changed mind", &key("f-1")).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");
    let err = h.manager.cancel(&escrow.id, &sender, &key("x-1")).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");

    let stored = h.manager.get(&escrow.id).await.unwrap();
    assert_eq!(stored.status, EscrowStatus::Released);
}

#[tokio::test]
async fn test_create_validation() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();

    let err = h
        .manager
        .create(request(&sender, &recipient, dec!(0.5), ReleaseCondition::Manual), &key("c-1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "LIMIT_EXCEEDED");

    let err = h
        .manager
        .create(request(&sender, &recipient, dec!(100.001), ReleaseCondition::Manual), &key("c-2"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_AMOUNT");

    let err = h
        .manager
        .create(request(&sender, &recipient, dec!(-5), ReleaseCondition::Manual), &key("c-3"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_AMOUNT");

    let err = h
        .manager
        .create(request(&sender, &sender, dec!(100), ReleaseCondition::Manual), &key("c-4"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
    assert_eq!(h.wallet(&sender, Currency::EUR).await, dec!(2000));
}

#[tokio::test]
async fn test_insufficient_funds_cancels_record() {
    let h = harness();
    let sender = h.funded_account(dec!(100)).await;
    let recipient = AccountId::new();

    let err = h
        .manager
        .create(request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual), &key("c-1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
    assert_eq!(h.wallet(&sender, Currency::EUR).await, dec!(100));

    let cancelled = h.manager.list_by_status(EscrowStatus::Cancelled).await.unwrap();
    assert_eq!(cancelled.len(), 1);
    assert!(cancelled[0].closing_reason.as_deref().unwrap().starts_with("funding failed"));
}

#[tokio::test]
async fn test_fraud_block_prevents_creation() {
    let risk = RiskConfig {
        rules: vec![FraudRule::new(
            "hard_cap",
            FraudRuleType::AmountThreshold {
                threshold: dec!(5000),
            },
            90,
            RuleAction::Block,
        )],
        ..RiskConfig::default()
    };
    let h = harness_with(risk, EscrowConfig::default());
    let sender = h.funded_account(dec!(10000)).await;
    let recipient = AccountId::new();

    let err = h
        .manager
        .create(request(&sender, &recipient, dec!(6000), ReleaseCondition::Manual), &key("c-1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "FRAUD_BLOCKED");
    assert_eq!(h.alerts.delivered().len(), 1);
    assert_eq!(h.wallet(&sender, Currency::EUR).await, dec!(10000));
    assert!(h.manager.list_by_status(EscrowStatus::Held).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_creates_do_not_count_toward_velocity() {
    let risk = RiskConfig {
        rules: vec![FraudRule::new(
            "rapid_fire",
            FraudRuleType::VelocityCount {
                max_count: 2,
                window_secs: 3600,
            },
            40,
            RuleAction::Block,
        )],
        ..RiskConfig::default()
    };
    let h = harness_with(risk, EscrowConfig::default());
    let sender = h.funded_account(dec!(100)).await;
    let recipient = AccountId::new();

    for attempt in 1..=3 {
        let err = h
            .manager
            .create(
                request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual),
                &key(&format!("short-{attempt}")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
    }
    assert_eq!(h.risk.event_count(), 0);

    h.manager.deposit(&sender, dec!(5000), Currency::EUR).await.unwrap();
    for tag in ["c-1", "c-2"] {
        h.manager
            .create(request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual), &key(tag))
            .await
            .unwrap();
    }
    assert_eq!(h.risk.event_count(), 2);

    let err = h
        .manager
        .create(request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual), &key("c-3"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "FRAUD_BLOCKED");
}

#[tokio::test]
async fn test_proof_flow() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();
    let escrow = h
        .manager
        .create(
            request(&sender, &recipient, dec!(500), ReleaseCondition::ProofRequired),
            &key("c-1"),
        )
        .await
        .unwrap()
        .value;
    assert!(escrow.proof_required);
    assert_eq!(escrow.required_proof, Some(ProofType::Receipt));
    assert_eq!(escrow.transfer_delay_hours, 48);

    let err = h.manager.release(&escrow.id, &sender, &key("r-1")).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");

    let err = h
        .manager
        .submit_proof(&escrow.id, &sender, receipt(), &key("p-1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "UNAUTHORIZED");

    let photo = vec![EvidenceInput {
        proof_type: Some(ProofType::ExperiencePhoto),
        reference: "s3://proofs/photo.jpg".to_string(),
        note: None,
    }];
    let err = h
        .manager
        .submit_proof(&escrow.id, &recipient, photo, &key("p-2"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");

    let pending = h
        .manager
        .submit_proof(&escrow.id, &recipient, receipt(), &key("p-3"))
        .await
        .unwrap()
        .value;
    assert_eq!(pending.status, EscrowStatus::ProofPending);
    assert_eq!(pending.proof_evidence[0].submitted_by, recipient);

    let err = h
        .manager
        .verify_proof(&escrow.id, &recipient, &key("v-1"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "UNAUTHORIZED");

    let verified = h
        .manager
        .verify_proof(&escrow.id, &sender, &key("v-2"))
        .await
        .unwrap()
        .value;
    assert_eq!(verified.status, EscrowStatus::ProofVerified);

    h.manager.release(&escrow.id, &sender, &key("r-2")).await.unwrap();
    assert_eq!(h.wallet(&recipient, Currency::EUR).await, dec!(480));
}

#[tokio::test]
async fn test_proof_rejection_limit() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();
    let escrow = h
        .manager
        .create(
            request(&sender, &recipient, dec!(500), ReleaseCondition::ProofRequired),
            &key("c-1"),
        )
        .await
        .unwrap()
        .value;

    for round in 0..3 {
        h.manager
            .submit_proof(&escrow.id, &recipient, receipt(), &key(&format!("p-{round}")))
            .await
            .unwrap();
        let rejected = h
            .manager
            .reject_proof(&escrow.id, &sender, "unreadable", &key(&format!("j-{round}")))
            .await
            .unwrap()
            .value;
        assert_eq!(rejected.status, EscrowStatus::Held);
        assert_eq!(rejected.proof_rejections, round + 1);
    }

    h.manager
        .submit_proof(&escrow.id, &recipient, receipt(), &key("p-9"))
        .await
        .unwrap();
    let err = h
        .manager
        .reject_proof(&escrow.id, &sender, "unreadable", &key("j-9"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_score_proof_thresholds() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();
    let escrow = h
        .manager
        .create(
            request(&sender, &recipient, dec!(500), ReleaseCondition::ProofRequired),
            &key("c-1"),
        )
        .await
        .unwrap()
        .value;
    h.manager
        .submit_proof(&escrow.id, &recipient, receipt(), &key("p-1"))
        .await
        .unwrap();

    let undecided = h.manager.score_proof(&escrow.id, dec!(0.5), &key("s-1")).await.unwrap();
    assert_eq!(undecided.value.status, EscrowStatus::ProofPending);

    let low = h.manager.score_proof(&escrow.id, dec!(0.2), &key("s-2")).await.unwrap();
    assert_eq!(low.value.status, EscrowStatus::Held);
    assert_eq!(low.value.proof_rejections, 1);

    h.manager
        .submit_proof(&escrow.id, &recipient, receipt(), &key("p-2"))
        .await
        .unwrap();
    let high = h.manager.score_proof(&escrow.id, dec!(0.9), &key("s-3")).await.unwrap();
    assert_eq!(high.value.status, EscrowStatus::ProofVerified);

    let err = h.manager.score_proof(&escrow.id, dec!(1.5), &key("s-4")).await.unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_full_refund_returns_everything() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();
    let escrow = h
        .manager
        .create(request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual), &key("c-1"))
        .await
        .unwrap()
        .value;

    let refunded = h
        .manager
        .refund(&escrow.id, "order cancelled", &key("f-1"))
        .await
        .unwrap()
        .value;
    assert_eq!(refunded.status, EscrowStatus::Refunded);
    assert_eq!(refunded.refunded_amount, dec!(1000));
    assert_eq!(refunded.commission_returned, dec!(60));
    assert_eq!(refunded.released_amount, Decimal::ZERO);
    assert_eq!(refunded.closing_reason.as_deref(), Some("order cancelled"));
    assert_eq!(h.wallet(&sender, Currency::EUR).await, dec!(2000));
    assert_eq!(h.held(&escrow.id).await, Decimal::ZERO);
    assert!(h.manager.commission_entry(&escrow.id).is_none());
}

#[tokio::test]
async fn test_partial_refund_sums() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();
    let escrow = h
        .manager
        .create(request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual), &key("c-1"))
        .await
        .unwrap()
        .value;

    let settled = h
        .manager
        .partial_refund(&escrow.id, dec!(400), dec!(10), &key("pr-1"))
        .await
        .unwrap()
        .value;
    assert_eq!(settled.status, EscrowStatus::PartiallyRefunded);

    // remainder 600 at 6% / 4%: giver 36, receiver 24
    assert_eq!(h.wallet(&sender, Currency::EUR).await, dec!(940) + dec!(414));
    assert_eq!(h.wallet(&recipient, Currency::EUR).await, dec!(576));
    assert_eq!(h.held(&escrow.id).await, dec!(70));

    let entry = h.manager.commission_entry(&escrow.id).unwrap();
    assert_eq!(entry.platform_revenue, dec!(70));
    assert_eq!(entry.base_amount, dec!(600));
    assert_eq!(h.treasury.total(Currency::EUR), dec!(2000));

    let err = h
        .manager
        .partial_refund(&escrow.id, dec!(100), dec!(0), &key("pr-2"))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");
}

#[tokio::test]
async fn test_failed_commit_reverses_legs() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();
    let escrow = h
        .manager
        .create(request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual), &key("c-1"))
        .await
        .unwrap()
        .value;

    h.store.fail_commits.store(true, Ordering::SeqCst);
    let err = h.manager.release(&escrow.id, &sender, &key("r-1")).await.unwrap_err();
    assert_eq!(err.error_code(), "STORAGE_ERROR");
    assert_eq!(h.wallet(&recipient, Currency::EUR).await, Decimal::ZERO);
    assert_eq!(h.held(&escrow.id).await, dec!(1060));
    assert_eq!(h.manager.get(&escrow.id).await.unwrap().status, EscrowStatus::Held);
    assert!(h.manager.commission_entry(&escrow.id).is_none());
    assert!(h.commissions.is_empty());

    // Failures are not cached: the same key succeeds once storage recovers
    h.store.fail_commits.store(false, Ordering::SeqCst);
    let released = h.manager.release(&escrow.id, &sender, &key("r-1")).await.unwrap();
    assert!(!released.is_replay());
    assert_eq!(h.wallet(&recipient, Currency::EUR).await, dec!(960));
}

#[tokio::test]
async fn test_failed_commission_record_reverses_settlement() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();
    let escrow = h
        .manager
        .create(request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual), &key("c-1"))
        .await
        .unwrap()
        .value;

    // An entry already on the ledger for this escrow makes the append fail
    let stray = CommissionLedgerEntry::pending(escrow.id.clone(), &escrow.commission, h.clock.now());
    h.commissions.append(stray.clone()).unwrap();

    let err = h.manager.release(&escrow.id, &sender, &key("r-1")).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");
    assert_eq!(h.wallet(&recipient, Currency::EUR).await, Decimal::ZERO);
    assert_eq!(h.held(&escrow.id).await, dec!(1060));
    assert_eq!(h.manager.get(&escrow.id).await.unwrap().status, EscrowStatus::Held);
    assert_eq!(h.manager.commission_entry(&escrow.id).unwrap().id, stray.id);

    h.commissions.retract(&stray.id).unwrap();
    let released = h.manager.release(&escrow.id, &sender, &key("r-1")).await.unwrap();
    assert_eq!(released.value.status, EscrowStatus::Released);
    assert_ne!(h.manager.commission_entry(&escrow.id).unwrap().id, stray.id);
}

#[tokio::test]
async fn test_settled_shares_stay_within_amount() {
    let h = harness();
    let sender = h.funded_account(dec!(10000)).await;
    let recipient = AccountId::new();
    let create = |amount, tag: &str| {
        let req = request(&sender, &recipient, amount, ReleaseCondition::Manual);
        let manager = h.manager.clone();
        let k = key(tag);
        async move { manager.create(req, &k).await.unwrap().value }
    };

    let a = create(dec!(1000), "c-release").await;
    let released = h.manager.release(&a.id, &sender, &key("r-1")).await.unwrap().value;
    assert_eq!(released.released_amount, dec!(1000));
    assert_eq!(released.refunded_amount, Decimal::ZERO);

    let b = create(dec!(1000), "c-refund").await;
    let refunded = h.manager.refund(&b.id, "not delivered", &key("f-1")).await.unwrap().value;

    let c = create(dec!(1000), "c-partial").await;
    let partial = h
        .manager
        .partial_refund(&c.id, dec!(400), dec!(10), &key("pr-1"))
        .await
        .unwrap()
        .value;
    assert_eq!(partial.refunded_amount, dec!(400));
    assert_eq!(partial.released_amount, dec!(600));

    let d = create(dec!(500), "c-cancel").await;
    let cancelled = h.manager.cancel(&d.id, &sender, &key("x-1")).await.unwrap().value;
    assert_eq!(cancelled.refunded_amount, dec!(500));

    let mut req = request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual);
    req.settlement_currency = Some(Currency::TRY);
    let e = h.manager.create(req, &key("c-fx")).await.unwrap().value;
    let fx_released = h.manager.release(&e.id, &sender, &key("r-2")).await.unwrap().value;
    assert_eq!(fx_released.released_amount, dec!(1000));
    assert_eq!(fx_released.settlement_amount, dec!(33600));

    for settled in [&released, &refunded, &partial, &cancelled, &fx_released] {
        assert!(
            settled.settled_within_amount(),
            "{} released {} refunded {} of {}",
            settled.status,
            settled.released_amount,
            settled.refunded_amount,
            settled.amount
        );
    }
}

#[tokio::test]
async fn test_cross_currency_release() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();
    let mut req = request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual);
    req.settlement_currency = Some(Currency::TRY);

    let escrow = h.manager.create(req, &key("c-1")).await.unwrap().value;
    assert_eq!(escrow.exchange_rate_used, dec!(35));
    assert_eq!(escrow.settlement_amount, dec!(33600));

    h.manager.release(&escrow.id, &sender, &key("r-1")).await.unwrap();
    assert_eq!(h.wallet(&recipient, Currency::TRY).await, dec!(33600));
    assert_eq!(h.wallet(&recipient, Currency::EUR).await, Decimal::ZERO);
    assert_eq!(
        h.manager.balance(&TreasuryAccount::FxPool, Currency::EUR).await.unwrap(),
        dec!(960)
    );
    assert_eq!(
        h.manager.balance(&TreasuryAccount::FxPool, Currency::TRY).await.unwrap(),
        dec!(-33600)
    );
}

#[tokio::test]
async fn test_unknown_buffer_profile_is_rejected() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let mut req = request(&sender, &AccountId::new(), dec!(1000), ReleaseCondition::Manual);
    req.settlement_currency = Some(Currency::USD);
    req.buffer_profile = Some("nonexistent".to_string());

    let err = h.manager.create(req, &key("c-1")).await.unwrap_err();
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
    assert_eq!(h.wallet(&sender, Currency::EUR).await, dec!(2000));
}

#[tokio::test]
async fn test_stale_rate_rejects_cross_currency_create() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    h.clock.advance(Duration::hours(2));

    let mut req = request(&sender, &AccountId::new(), dec!(1000), ReleaseCondition::Manual);
    req.settlement_currency = Some(Currency::TRY);
    let err = h.manager.create(req, &key("c-1")).await.unwrap_err();
    assert_eq!(err.error_code(), "STALE_EXCHANGE_RATE");
}

#[tokio::test]
async fn test_cancel_before_proof() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();
    let escrow = h
        .manager
        .create(
            request(&sender, &recipient, dec!(500), ReleaseCondition::ProofRequired),
            &key("c-1"),
        )
        .await
        .unwrap()
        .value;

    let err = h.manager.cancel(&escrow.id, &recipient, &key("x-1")).await.unwrap_err();
    assert_eq!(err.error_code(), "UNAUTHORIZED");

    let cancelled = h
        .manager
        .cancel(&escrow.id, &sender, &key("x-2"))
        .await
        .unwrap()
        .value;
    assert_eq!(cancelled.status, EscrowStatus::Cancelled);
    assert_eq!(h.wallet(&sender, Currency::EUR).await, dec!(2000));

    let second = h
        .manager
        .create(
            request(&sender, &recipient, dec!(500), ReleaseCondition::ProofRequired),
            &key("c-2"),
        )
        .await
        .unwrap()
        .value;
    h.manager
        .submit_proof(&second.id, &recipient, receipt(), &key("p-1"))
        .await
        .unwrap();
    let err = h.manager.cancel(&second.id, &sender, &key("x-3")).await.unwrap_err();
    assert_eq!(err.error_code(), "INVALID_STATE");
}

#[tokio::test]
async fn test_concurrent_release_and_refund_settle_once() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();
    let escrow = h
        .manager
        .create(request(&sender, &recipient, dec!(1000), ReleaseCondition::Manual), &key("c-1"))
        .await
        .unwrap()
        .value;

    let release_key = key("r-1");
    let refund_key = key("f-1");
    let (released, refunded) = tokio::join!(
        h.manager.release(&escrow.id, &sender, &release_key),
        h.manager.refund(&escrow.id, "buyer request", &refund_key),
    );
    assert!(released.is_ok() ^ refunded.is_ok());

    let sender_balance = h.wallet(&sender, Currency::EUR).await;
    let recipient_balance = h.wallet(&recipient, Currency::EUR).await;
    let held = h.held(&escrow.id).await;
    assert_eq!(sender_balance + recipient_balance + held, dec!(2000));
    if released.is_ok() {
        assert_eq!(recipient_balance, dec!(960));
    } else {
        assert_eq!(sender_balance, dec!(2000));
    }
}

#[tokio::test]
async fn test_override_applies_custom_duration_and_fast_release() {
    let h = harness();
    let sender = h.funded_account(dec!(2000)).await;
    let recipient = AccountId::new();
    let now = h.manager.now();
    h.manager
        .commission_engine()
        .set_override(covenant_types::UserCommissionOverride {
            account: recipient.clone(),
            custom_rate_enabled: true,
            giver_share: dec!(0.03),
            receiver_share: dec!(0.02),
            total_rate: dec!(0.05),
            fast_release_enabled: true,
            custom_escrow_hours: Some(6),
            active: true,
            valid_from: Some(now - Duration::days(1)),
            valid_until: None,
        })
        .unwrap();

    let escrow = h
        .manager
        .create(
            request(&sender, &recipient, dec!(1000), ReleaseCondition::ProofRequired),
            &key("c-1"),
        )
        .await
        .unwrap()
        .value;
    assert!(!escrow.proof_required);
    assert_eq!(escrow.transfer_delay_hours, 6);
    assert_eq!(escrow.commission.giver_pays, dec!(1030));
    assert!(escrow.commission.is_override());

    h.manager.release(&escrow.id, &sender, &key("r-1")).await.unwrap();
    assert_eq!(h.wallet(&recipient, Currency::EUR).await, dec!(980));
    assert!(h.manager.commission_entry(&escrow.id).unwrap().is_vip);
}
