#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use covenant_commission::{CommissionConfig, CommissionEngine, CommissionLedger};
use covenant_escrow::{
    EscrowConfig, EscrowManager, EscrowServices, EvidenceInput, InMemorySettlementStore,
    InMemoryTreasury, SettlementStore, Treasury, TreasuryAccount, Write,
};
use covenant_fx::{ConversionService, ExchangeRate, FxConfig, RateBook};
use covenant_idempotency::{IdempotencyConfig, IdempotencyLedger, InMemoryIdempotencyStore};
use covenant_risk::{InMemoryAlertSink, RiskConfig, RuleBasedRiskGate};
use covenant_types::{
    AccountId, Clock, CovenantError, CreateEscrowRequest, Currency, Dispute, DisputeId, EscrowId,
    EscrowStatus, EscrowTransaction, IdempotencyKey, ManualClock, ProofType, ReleaseCondition,
    Result,
};
use rust_decimal::Decimal;

/// Store whose commits can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemorySettlementStore,
    pub fail_commits: AtomicBool,
}

#[async_trait]
impl SettlementStore for FlakyStore {
    async fn commit(&self, writes: Vec<Write>) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(CovenantError::Storage {
                message: "disk full".to_string(),
            });
        }
        self.inner.commit(writes).await
    }

    async fn escrow(&self, id: &EscrowId) -> Result<Option<EscrowTransaction>> {
        self.inner.escrow(id).await
    }

    async fn escrows_by_status(&self, status: EscrowStatus) -> Result<Vec<EscrowTransaction>> {
        self.inner.escrows_by_status(status).await
    }

    async fn dispute(&self, id: &DisputeId) -> Result<Option<Dispute>> {
        self.inner.dispute(id).await
    }

    async fn disputes_for_escrow(&self, escrow_id: &EscrowId) -> Result<Vec<Dispute>> {
        self.inner.disputes_for_escrow(escrow_id).await
    }

    async fn open_disputes(&self) -> Result<Vec<Dispute>> {
        self.inner.open_disputes().await
    }
}

pub struct Harness {
    pub manager: Arc<EscrowManager>,
    pub treasury: Arc<InMemoryTreasury>,
    pub store: Arc<FlakyStore>,
    pub rates: Arc<RateBook>,
    pub commissions: Arc<CommissionLedger>,
    pub risk: Arc<RuleBasedRiskGate>,
    pub alerts: Arc<InMemoryAlertSink>,
    pub clock: ManualClock,
}

pub fn harness() -> Harness {
    harness_with(RiskConfig::default(), EscrowConfig::default())
}

pub fn harness_with(risk_config: RiskConfig, escrow_config: EscrowConfig) -> Harness {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
    let rates = Arc::new(RateBook::new());
    rates
        .record_rate(ExchangeRate::new(
            Currency::EUR,
            Currency::TRY,
            Decimal::new(35, 0),
            clock.now(),
        ))
        .unwrap();
    rates
        .record_rate(ExchangeRate::new(
            Currency::EUR,
            Currency::USD,
            Decimal::new(108, 2),
            clock.now(),
        ))
        .unwrap();

    let fx = Arc::new(ConversionService::new(rates.clone(), FxConfig::default()));
    let commission = Arc::new(CommissionEngine::new(fx.clone(), CommissionConfig::default()).unwrap());
    let commissions = Arc::new(CommissionLedger::new());
    let alerts = Arc::new(InMemoryAlertSink::new("test"));
    let risk = Arc::new(RuleBasedRiskGate::new(risk_config, alerts.clone()).unwrap());
    let treasury = Arc::new(InMemoryTreasury::new());
    let store = Arc::new(FlakyStore::default());
    let idempotency = Arc::new(IdempotencyLedger::new(
        Arc::new(InMemoryIdempotencyStore::new()),
        Arc::new(clock.clone()),
        IdempotencyConfig::default(),
    ));

    let manager = EscrowManager::new(
        EscrowServices {
            store: store.clone(),
            treasury: treasury.clone(),
            idempotency,
            commission,
            commissions: commissions.clone(),
            fx,
            risk: risk.clone(),
            clock: Arc::new(clock.clone()),
        },
        escrow_config,
    )
    .unwrap();

    Harness {
        manager: Arc::new(manager),
        treasury,
        store,
        rates,
        commissions,
        risk,
        alerts,
        clock,
    }
}

pub fn key(s: &str) -> IdempotencyKey {
    IdempotencyKey::new(s).unwrap()
}

pub fn request(
    sender: &AccountId,
    recipient: &AccountId,
    amount: Decimal,
    condition: ReleaseCondition,
) -> CreateEscrowRequest {
    CreateEscrowRequest {
        sender: sender.clone(),
        recipient: recipient.clone(),
        amount,
        currency: Currency::EUR,
        settlement_currency: None,
        release_condition: condition,
        buffer_profile: None,
    }
}

pub fn receipt() -> Vec<EvidenceInput> {
    vec![EvidenceInput {
        proof_type: Some(ProofType::Receipt),
        reference: "s3://proofs/receipt-1.jpg".to_string(),
        note: None,
    }]
}

impl Harness {
    pub async fn funded_account(&self, amount: Decimal) -> AccountId {
        let account = AccountId::new();
        self.manager
            .deposit(&account, amount, Currency::EUR)
            .await
            .unwrap();
        account
    }

    pub async fn wallet(&self, account: &AccountId, currency: Currency) -> Decimal {
        self.treasury
            .balance(&TreasuryAccount::Wallet(account.clone()), currency)
            .await
            .unwrap()
    }

    pub async fn held(&self, escrow_id: &EscrowId) -> Decimal {
        self.treasury
            .balance(&TreasuryAccount::Escrow(escrow_id.clone()), Currency::EUR)
            .await
            .unwrap()
    }
}
