//! Escrow lifecycle manager
//!
//! Every mutation runs inside the idempotency ledger under the entity lock of
//! the escrow (or the sender, for creation). Funds only move through code
//! that holds a [`SettlementPermit`]: treasury legs are applied first, the
//! commission entry is recorded next, records are committed last, and a
//! failure at any step undoes the earlier ones so the escrow stays in its
//! prior state.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use covenant_commission::{CommissionEngine, CommissionLedger};
use covenant_fx::ConversionService;
use covenant_idempotency::{fingerprint, Executed, IdempotencyLedger, SettlementPermit};
use covenant_risk::{evaluate_with_timeout, RiskContext, RiskGate};
use covenant_types::{
    AccountId, BatchId, Clock, CommissionEntryId, CommissionLedgerEntry, CommissionStatus,
    CovenantError, CreateEscrowRequest, Currency, Dispute, DisputeId, DisputeReason,
    DisputeStatus, EscrowId, EscrowStatus, EscrowTransaction, Evidence, IdempotencyKey,
    ProofType, ReleaseCondition, Result,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::EscrowConfig;
use crate::store::{SettlementStore, Write};
use crate::treasury::{Leg, Treasury, TreasuryAccount};

pub(crate) const OP_CREATE: &str = "create_escrow";
pub(crate) const OP_SUBMIT_PROOF: &str = "submit_proof";
pub(crate) const OP_VERIFY_PROOF: &str = "verify_proof";
pub(crate) const OP_REJECT_PROOF: &str = "reject_proof";
pub(crate) const OP_SCORE_PROOF: &str = "score_proof";
pub(crate) const OP_RELEASE: &str = "release";
pub(crate) const OP_REFUND: &str = "refund";
pub(crate) const OP_PARTIAL_REFUND: &str = "partial_refund";
pub(crate) const OP_CANCEL: &str = "cancel_escrow";
pub(crate) const OP_OPEN_DISPUTE: &str = "open_dispute";
pub(crate) const OP_EXPIRE_UNFUNDED: &str = "expire_unfunded";
pub(crate) const OP_SETTLE_EXPIRED: &str = "settle_expired";
pub(crate) const OP_COLLECT_COMMISSION: &str = "collect_commission";

/// Evidence as supplied by a caller; the submitter and time are stamped on receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceInput {
    #[serde(default)]
    pub proof_type: Option<ProofType>,
    pub reference: String,
    #[serde(default)]
    pub note: Option<String>,
}

impl EvidenceInput {
    pub fn into_evidence(self, submitted_by: &AccountId, now: DateTime<Utc>) -> Evidence {
        Evidence {
            submitted_by: submitted_by.clone(),
            proof_type: self.proof_type,
            reference: self.reference,
            note: self.note,
            submitted_at: now,
        }
    }
}

pub(crate) fn check_evidence(evidence: &[EvidenceInput]) -> Result<()> {
    if evidence.iter().any(|e| e.reference.trim().is_empty()) {
        return Err(CovenantError::validation(
            "evidence.reference",
            "must not be empty",
        ));
    }
    Ok(())
}

/// Request to open a dispute on an escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenDisputeRequest {
    pub raised_by: AccountId,
    pub reason: DisputeReason,
    pub description: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceInput>,
}

/// Collaborators the manager is wired with
#[derive(Clone)]
pub struct EscrowServices {
    pub store: Arc<dyn SettlementStore>,
    pub treasury: Arc<dyn Treasury>,
    pub idempotency: Arc<IdempotencyLedger>,
    pub commission: Arc<CommissionEngine>,
    pub commissions: Arc<CommissionLedger>,
    pub fx: Arc<ConversionService>,
    pub risk: Arc<dyn RiskGate>,
    pub clock: Arc<dyn Clock>,
}

/// Prepared outcome of a money-moving transition
pub(crate) struct Settlement {
    pub escrow: EscrowTransaction,
    pub legs: Vec<Leg>,
    pub commission: Option<CommissionLedgerEntry>,
}

/// Escrow lifecycle manager
pub struct EscrowManager {
    pub(crate) store: Arc<dyn SettlementStore>,
    pub(crate) treasury: Arc<dyn Treasury>,
    pub(crate) idempotency: Arc<IdempotencyLedger>,
    pub(crate) commission: Arc<CommissionEngine>,
    pub(crate) commissions: Arc<CommissionLedger>,
    pub(crate) fx: Arc<ConversionService>,
    pub(crate) risk: Arc<dyn RiskGate>,
    pub(crate) clock: Arc<dyn Clock>,
    config: RwLock<EscrowConfig>,
}

impl EscrowManager {
    pub fn new(services: EscrowServices, config: EscrowConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: services.store,
            treasury: services.treasury,
            idempotency: services.idempotency,
            commission: services.commission,
            commissions: services.commissions,
            fx: services.fx,
            risk: services.risk,
            clock: services.clock,
            config: RwLock::new(config),
        })
    }

    pub fn config(&self) -> EscrowConfig {
        self.config.read().clone()
    }

    /// Swap limits, proof tiers and dispute windows at runtime
    pub fn update_config(&self, config: EscrowConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config;
        info!("Escrow configuration updated");
        Ok(())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ========================================================================
    // Creation
    // ========================================================================

    /// Create and fund an escrow
    pub async fn create(
        &self,
        request: CreateEscrowRequest,
        key: &IdempotencyKey,
    ) -> Result<Executed<EscrowTransaction>> {
        validate_request(&request)?;
        let fp = fingerprint(&request)?;
        let entity = request.sender.to_string();
        self.idempotency
            .execute(OP_CREATE, &entity, key, &fp, |permit| {
                self.create_guarded(permit, request)
            })
            .await
    }

    async fn create_guarded(
        &self,
        permit: SettlementPermit,
        request: CreateEscrowRequest,
    ) -> Result<EscrowTransaction> {
        let now = permit.issued_at();
        let config = self.config();

        let normalized = self
            .commission
            .normalize(request.amount, request.currency, now)
            .await?;
        if normalized < config.min_amount || normalized > config.max_amount {
            return Err(CovenantError::LimitExceeded {
                amount: normalized.to_string(),
                min: config.min_amount.to_string(),
                max: config.max_amount.to_string(),
            });
        }

        let ctx = RiskContext {
            account: request.sender.clone(),
            operation: OP_CREATE.to_string(),
            amount: request.amount,
            currency: request.currency,
            normalized_amount: normalized,
            at: now,
        };
        let decision = evaluate_with_timeout(self.risk.as_ref(), &ctx, config.risk_timeout())
            .await?
            .into_result()?;

        let split = self
            .commission
            .resolve(
                request.amount,
                request.currency,
                &request.sender,
                &request.recipient,
                now,
            )
            .await?;

        let settlement_currency = request.settlement_currency.unwrap_or(request.currency);
        let conversion = self
            .fx
            .convert_with_buffer(
                split.receiver_gets,
                request.currency,
                settlement_currency,
                now,
                request.buffer_profile.as_deref(),
            )
            .await?;
        if conversion.is_stale {
            return Err(CovenantError::StaleExchangeRate {
                from: request.currency.to_string(),
                to: settlement_currency.to_string(),
            });
        }

        let tier = config
            .proof_tier_for(normalized)
            .ok_or_else(|| CovenantError::internal("no proof tier configured"))?;
        let recipient_override = self.commission.active_override(&request.recipient, now);
        let fast_release = recipient_override
            .as_ref()
            .map_or(false, |ov| ov.fast_release_enabled);
        let proof_required =
            request.release_condition == ReleaseCondition::ProofRequired && !fast_release;
        let transfer_delay_hours = recipient_override
            .as_ref()
            .and_then(|ov| ov.custom_escrow_hours)
            .unwrap_or(tier.transfer_delay_hours);

        let mut escrow = EscrowTransaction {
            id: EscrowId::new(),
            sender: request.sender.clone(),
            recipient: request.recipient.clone(),
            amount: request.amount,
            currency: request.currency,
            settlement_currency,
            settlement_amount: conversion.converted_amount,
            exchange_rate_used: conversion.rate_used,
            release_condition: request.release_condition,
            required_proof: if proof_required { tier.required_proof } else { None },
            proof_required,
            transfer_delay_hours,
            expires_at: now + Duration::hours(transfer_delay_hours as i64),
            proof_submitted: false,
            proof_verified: false,
            proof_evidence: Vec::new(),
            proof_rejections: 0,
            last_rejection_reason: None,
            status: EscrowStatus::Created,
            released_by: None,
            released_amount: Decimal::ZERO,
            refunded_amount: Decimal::ZERO,
            commission_returned: Decimal::ZERO,
            service_fee_retained: Decimal::ZERO,
            closing_reason: None,
            commission: split,
            status_before_dispute: None,
            active_dispute: None,
            dispute_count: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.commit(vec![Write::escrow(&mut escrow)]).await?;

        let funding = vec![Leg::new(
            TreasuryAccount::Wallet(escrow.sender.clone()),
            TreasuryAccount::Escrow(escrow.id.clone()),
            escrow.held_amount(),
            escrow.currency,
        )];
        let batch = match self.apply_legs(&permit, funding).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(escrow_id = %escrow.id, error = %e, "Escrow funding failed");
                escrow.status = EscrowStatus::Cancelled;
                escrow.closing_reason = Some(format!("funding failed: {e}"));
                if let Err(commit_err) = self.store.commit(vec![Write::escrow(&mut escrow)]).await {
                    error!(escrow_id = %escrow.id, error = %commit_err, "Failed to record funding failure");
                }
                return Err(e);
            }
        };

        escrow.status = EscrowStatus::Held;
        if let Err(e) = self.store.commit(vec![Write::escrow(&mut escrow)]).await {
            if let Some(batch) = batch {
                self.rollback(&batch).await;
            }
            return Err(e);
        }
        self.risk.record(&ctx).await;

        info!(
            escrow_id = %escrow.id,
            sender = %escrow.sender,
            recipient = %escrow.recipient,
            amount = %escrow.amount,
            currency = %escrow.currency,
            held = %escrow.held_amount(),
            tier = %escrow.commission.tier_name,
            risk_score = decision.risk_score,
            "Escrow created and funded"
        );
        Ok(escrow)
    }

    // ========================================================================
    // Proof
    // ========================================================================

    /// Recipient submits proof: `Held -> ProofPending`
    pub async fn submit_proof(
        &self,
        escrow_id: &EscrowId,
        submitted_by: &AccountId,
        evidence: Vec<EvidenceInput>,
        key: &IdempotencyKey,
    ) -> Result<Executed<EscrowTransaction>> {
        if evidence.is_empty() {
            return Err(CovenantError::validation("evidence", "at least one item is required"));
        }
        check_evidence(&evidence)?;
        let fp = fingerprint(&json!({
            "escrow_id": escrow_id,
            "submitted_by": submitted_by,
            "evidence": evidence,
        }))?;
        self.idempotency
            .execute(OP_SUBMIT_PROOF, &escrow_id.to_string(), key, &fp, |permit| async move {
                let now = permit.issued_at();
                let mut escrow = self.load_guarded(&permit, escrow_id).await?;
                if escrow.status != EscrowStatus::Held {
                    return Err(CovenantError::invalid_state("escrow", escrow.status, OP_SUBMIT_PROOF));
                }
                if submitted_by != &escrow.recipient {
                    return Err(CovenantError::unauthorized("only the recipient may submit proof"));
                }
                if let Some(required) = escrow.required_proof {
                    if !evidence.iter().any(|e| e.proof_type == Some(required)) {
                        return Err(CovenantError::validation(
                            "evidence.proof_type",
                            format!("{required:?} proof is required"),
                        ));
                    }
                }

                escrow
                    .proof_evidence
                    .extend(evidence.into_iter().map(|e| e.into_evidence(submitted_by, now)));
                escrow.proof_submitted = true;
                escrow.status = EscrowStatus::ProofPending;
                escrow.updated_at = now;
                self.store.commit(vec![Write::escrow(&mut escrow)]).await?;

                info!(escrow_id = %escrow.id, items = escrow.proof_evidence.len(), "Proof submitted");
                Ok(escrow)
            })
            .await
    }

    /// `ProofPending -> ProofVerified`
    pub async fn verify_proof(
        &self,
        escrow_id: &EscrowId,
        verified_by: &AccountId,
        key: &IdempotencyKey,
    ) -> Result<Executed<EscrowTransaction>> {
        let fp = fingerprint(&json!({ "escrow_id": escrow_id, "verified_by": verified_by }))?;
        self.idempotency
            .execute(OP_VERIFY_PROOF, &escrow_id.to_string(), key, &fp, |permit| async move {
                let now = permit.issued_at();
                let mut escrow = self.load_guarded(&permit, escrow_id).await?;
                if verified_by == &escrow.recipient {
                    return Err(CovenantError::unauthorized("the recipient cannot verify its own proof"));
                }
                mark_verified(&mut escrow, now)?;
                self.store.commit(vec![Write::escrow(&mut escrow)]).await?;
                info!(escrow_id = %escrow.id, verified_by = %verified_by, "Proof verified");
                Ok(escrow)
            })
            .await
    }

    /// `ProofPending -> Held`, counting the rejection
    pub async fn reject_proof(
        &self,
        escrow_id: &EscrowId,
        rejected_by: &AccountId,
        reason: &str,
        key: &IdempotencyKey,
    ) -> Result<Executed<EscrowTransaction>> {
        if reason.trim().is_empty() {
            return Err(CovenantError::validation("reason", "must not be empty"));
        }
        let fp = fingerprint(&json!({
            "escrow_id": escrow_id,
            "rejected_by": rejected_by,
            "reason": reason,
        }))?;
        self.idempotency
            .execute(OP_REJECT_PROOF, &escrow_id.to_string(), key, &fp, |permit| async move {
                let now = permit.issued_at();
                let mut escrow = self.load_guarded(&permit, escrow_id).await?;
                if rejected_by == &escrow.recipient {
                    return Err(CovenantError::unauthorized("the recipient cannot reject its own proof"));
                }
                let max = self.config.read().max_proof_rejections;
                mark_rejected(&mut escrow, reason, max, now)?;
                self.store.commit(vec![Write::escrow(&mut escrow)]).await?;
                info!(
                    escrow_id = %escrow.id,
                    rejections = escrow.proof_rejections,
                    "Proof rejected"
                );
                Ok(escrow)
            })
            .await
    }

    /// Apply an automated proof-quality score in `[0, 1]`
    ///
    /// At or above the approve threshold the proof is verified; below the
    /// review threshold it is rejected; in between it stays pending for a
    /// manual decision.
    pub async fn score_proof(
        &self,
        escrow_id: &EscrowId,
        score: Decimal,
        key: &IdempotencyKey,
    ) -> Result<Executed<EscrowTransaction>> {
        if score < Decimal::ZERO || score > Decimal::ONE {
            return Err(CovenantError::validation("score", "must be within [0, 1]"));
        }
        let fp = fingerprint(&json!({ "escrow_id": escrow_id, "score": score }))?;
        self.idempotency
            .execute(OP_SCORE_PROOF, &escrow_id.to_string(), key, &fp, |permit| async move {
                let now = permit.issued_at();
                let mut escrow = self.load_guarded(&permit, escrow_id).await?;
                let config = self.config();
                let scoring = &config.proof_scoring;

                if score >= scoring.approve_threshold {
                    mark_verified(&mut escrow, now)?;
                } else if score < scoring.review_threshold {
                    let reason = format!("proof score {score} below {}", scoring.review_threshold);
                    mark_rejected(&mut escrow, &reason, config.max_proof_rejections, now)?;
                } else {
                    if escrow.status != EscrowStatus::ProofPending {
                        return Err(CovenantError::invalid_state("escrow", escrow.status, OP_SCORE_PROOF));
                    }
                    debug!(escrow_id = %escrow.id, score = %score, "Proof left for manual review");
                    return Ok(escrow);
                }

                self.store.commit(vec![Write::escrow(&mut escrow)]).await?;
                info!(escrow_id = %escrow.id, score = %score, status = %escrow.status, "Proof scored");
                Ok(escrow)
            })
            .await
    }

    // ========================================================================
    // Settlement
    // ========================================================================

    /// Release the held funds to the recipient
    pub async fn release(
        &self,
        escrow_id: &EscrowId,
        released_by: &AccountId,
        key: &IdempotencyKey,
    ) -> Result<Executed<EscrowTransaction>> {
        let fp = fingerprint(&json!({ "escrow_id": escrow_id, "released_by": released_by }))?;
        self.idempotency
            .execute(OP_RELEASE, &escrow_id.to_string(), key, &fp, |permit| async move {
                let escrow = self.load_guarded(&permit, escrow_id).await?;
                if !escrow.is_releasable() {
                    return Err(CovenantError::invalid_state("escrow", escrow.status, OP_RELEASE));
                }
                if released_by != &escrow.sender {
                    return Err(CovenantError::unauthorized("only the sender may release"));
                }
                let plan = plan_release(escrow, Some(released_by.clone()), permit.issued_at());
                self.execute_settlement(&permit, plan, Vec::new()).await
            })
            .await
    }

    /// Return all held funds to the sender
    pub async fn refund(
        &self,
        escrow_id: &EscrowId,
        reason: &str,
        key: &IdempotencyKey,
    ) -> Result<Executed<EscrowTransaction>> {
        let fp = fingerprint(&json!({ "escrow_id": escrow_id, "reason": reason }))?;
        self.idempotency
            .execute(OP_REFUND, &escrow_id.to_string(), key, &fp, |permit| async move {
                let escrow = self.load_guarded(&permit, escrow_id).await?;
                if !escrow.status.can_refund() {
                    return Err(CovenantError::invalid_state("escrow", escrow.status, OP_REFUND));
                }
                let plan = plan_refund(
                    escrow,
                    EscrowStatus::Refunded,
                    reason.to_string(),
                    permit.issued_at(),
                );
                self.execute_settlement(&permit, plan, Vec::new()).await
            })
            .await
    }

    /// Refund part of the base amount, release the rest
    pub async fn partial_refund(
        &self,
        escrow_id: &EscrowId,
        refund_amount: Decimal,
        service_fee_retained: Decimal,
        key: &IdempotencyKey,
    ) -> Result<Executed<EscrowTransaction>> {
        let fp = fingerprint(&json!({
            "escrow_id": escrow_id,
            "refund_amount": refund_amount,
            "service_fee_retained": service_fee_retained,
        }))?;
        self.idempotency
            .execute(OP_PARTIAL_REFUND, &escrow_id.to_string(), key, &fp, |permit| async move {
                let escrow = self.load_guarded(&permit, escrow_id).await?;
                if !escrow.status.can_refund() {
                    return Err(CovenantError::invalid_state("escrow", escrow.status, OP_PARTIAL_REFUND));
                }
                let plan = plan_partial_refund(
                    escrow,
                    refund_amount,
                    service_fee_retained,
                    permit.issued_at(),
                )?;
                self.execute_settlement(&permit, plan, Vec::new()).await
            })
            .await
    }

    /// Sender withdraws a funded escrow before any proof arrives
    pub async fn cancel(
        &self,
        escrow_id: &EscrowId,
        cancelled_by: &AccountId,
        key: &IdempotencyKey,
    ) -> Result<Executed<EscrowTransaction>> {
        let fp = fingerprint(&json!({ "escrow_id": escrow_id, "cancelled_by": cancelled_by }))?;
        self.idempotency
            .execute(OP_CANCEL, &escrow_id.to_string(), key, &fp, |permit| async move {
                let escrow = self.load_guarded(&permit, escrow_id).await?;
                if escrow.status != EscrowStatus::Held || escrow.proof_submitted {
                    return Err(CovenantError::invalid_state("escrow", escrow.status, OP_CANCEL));
                }
                if cancelled_by != &escrow.sender {
                    return Err(CovenantError::unauthorized("only the sender may cancel"));
                }
                let plan = plan_refund(
                    escrow,
                    EscrowStatus::Cancelled,
                    "cancelled by sender".to_string(),
                    permit.issued_at(),
                );
                self.execute_settlement(&permit, plan, Vec::new()).await
            })
            .await
    }

    // ========================================================================
    // Disputes
    // ========================================================================

    /// Open a dispute and freeze the escrow
    pub async fn open_dispute(
        &self,
        escrow_id: &EscrowId,
        request: OpenDisputeRequest,
        key: &IdempotencyKey,
    ) -> Result<Executed<Dispute>> {
        if request.description.trim().is_empty() {
            return Err(CovenantError::validation("description", "must not be empty"));
        }
        check_evidence(&request.evidence)?;
        let fp = fingerprint(&json!({ "escrow_id": escrow_id, "request": request }))?;
        self.idempotency
            .execute(OP_OPEN_DISPUTE, &escrow_id.to_string(), key, &fp, |permit| async move {
                let now = permit.issued_at();
                let mut escrow = self.load_guarded(&permit, escrow_id).await?;
                if !escrow.status.can_dispute() || escrow.active_dispute.is_some() {
                    return Err(CovenantError::invalid_state("escrow", escrow.status, OP_OPEN_DISPUTE));
                }
                let respondent = escrow
                    .counterparty(&request.raised_by)
                    .cloned()
                    .ok_or_else(|| CovenantError::unauthorized("only a party may open a dispute"))?;
                let disputes = self.config.read().disputes.clone();
                if escrow.dispute_count >= disputes.max_disputes_per_escrow {
                    return Err(CovenantError::DisputeLimitReached {
                        escrow_id: escrow.id.to_string(),
                        max: disputes.max_disputes_per_escrow,
                    });
                }

                let raised_by = request.raised_by.clone();
                let mut dispute = Dispute {
                    id: DisputeId::new(),
                    escrow_id: escrow.id.clone(),
                    reason: request.reason,
                    description: request.description,
                    status: DisputeStatus::Pending,
                    opened_by: raised_by.clone(),
                    respondent,
                    evidence: request
                        .evidence
                        .into_iter()
                        .map(|e| e.into_evidence(&raised_by, now))
                        .collect(),
                    response: None,
                    responded_at: None,
                    response_deadline: now + disputes.response_window(),
                    review_deadline: now + disputes.review_window(),
                    resolution: None,
                    refund_amount: None,
                    resolved_by: None,
                    resolved_at: None,
                    version: 0,
                    created_at: now,
                    updated_at: now,
                };

                escrow.status_before_dispute = Some(escrow.status);
                escrow.status = EscrowStatus::Disputed;
                escrow.active_dispute = Some(dispute.id.clone());
                escrow.dispute_count += 1;
                escrow.updated_at = now;
                self.store
                    .commit(vec![Write::escrow(&mut escrow), Write::dispute(&mut dispute)])
                    .await?;

                info!(
                    escrow_id = %escrow.id,
                    dispute_id = %dispute.id,
                    opened_by = %dispute.opened_by,
                    reason = ?dispute.reason,
                    "Dispute opened"
                );
                Ok(dispute)
            })
            .await
    }

    // ========================================================================
    // Sweep entry points
    // ========================================================================

    /// Expire a `Created` escrow whose funding never completed
    pub async fn expire_unfunded(
        &self,
        escrow_id: &EscrowId,
        key: &IdempotencyKey,
    ) -> Result<Executed<EscrowTransaction>> {
        let fp = fingerprint(&json!({ "escrow_id": escrow_id }))?;
        self.idempotency
            .execute(OP_EXPIRE_UNFUNDED, &escrow_id.to_string(), key, &fp, |permit| async move {
                let now = permit.issued_at();
                let mut escrow = self.load_guarded(&permit, escrow_id).await?;
                if escrow.status != EscrowStatus::Created || !escrow.is_expired_at(now) {
                    return Err(CovenantError::invalid_state("escrow", escrow.status, OP_EXPIRE_UNFUNDED));
                }
                escrow.status = EscrowStatus::Expired;
                escrow.closing_reason = Some("funding never completed".to_string());
                escrow.updated_at = now;
                self.store.commit(vec![Write::escrow(&mut escrow)]).await?;
                info!(escrow_id = %escrow.id, "Unfunded escrow expired");
                Ok(escrow)
            })
            .await
    }

    /// Auto-release or auto-refund an escrow past its expiry
    pub async fn settle_expired(
        &self,
        escrow_id: &EscrowId,
        key: &IdempotencyKey,
    ) -> Result<Executed<EscrowTransaction>> {
        let fp = fingerprint(&json!({ "escrow_id": escrow_id }))?;
        self.idempotency
            .execute(OP_SETTLE_EXPIRED, &escrow_id.to_string(), key, &fp, |permit| async move {
                let now = permit.issued_at();
                let escrow = self.load_guarded(&permit, escrow_id).await?;
                let eligible = matches!(
                    escrow.status,
                    EscrowStatus::Held | EscrowStatus::ProofPending | EscrowStatus::ProofVerified
                );
                if !eligible || !escrow.is_expired_at(now) {
                    return Err(CovenantError::invalid_state("escrow", escrow.status, OP_SETTLE_EXPIRED));
                }

                let plan = if escrow.auto_releases_on_expiry() {
                    plan_release(escrow, None, now)
                } else {
                    plan_refund(
                        escrow,
                        EscrowStatus::Refunded,
                        "expired without release".to_string(),
                        now,
                    )
                };
                self.execute_settlement(&permit, plan, Vec::new()).await
            })
            .await
    }

    /// Move a pending commission from the escrow account to platform revenue
    pub async fn collect_commission(
        &self,
        entry_id: &CommissionEntryId,
        key: &IdempotencyKey,
    ) -> Result<Executed<CommissionLedgerEntry>> {
        let entry = self
            .commissions
            .get(entry_id)
            .ok_or_else(|| CovenantError::not_found("commission_entry", entry_id))?;
        let entity = entry.escrow_id.to_string();
        let fp = fingerprint(&json!({ "entry_id": entry_id }))?;
        self.idempotency
            .execute(OP_COLLECT_COMMISSION, &entity, key, &fp, |permit| async move {
                let entry = self
                    .commissions
                    .get(entry_id)
                    .ok_or_else(|| CovenantError::not_found("commission_entry", entry_id))?;
                if entry.status != CommissionStatus::Pending {
                    return Err(CovenantError::invalid_state(
                        "commission_entry",
                        entry.status,
                        OP_COLLECT_COMMISSION,
                    ));
                }
                let legs = vec![Leg::new(
                    TreasuryAccount::Escrow(entry.escrow_id.clone()),
                    TreasuryAccount::Platform,
                    entry.platform_revenue,
                    entry.currency,
                )];
                let batch = self.apply_legs(&permit, legs).await?;
                match self.commissions.collect(entry_id, permit.issued_at()) {
                    Ok(collected) => Ok(collected),
                    Err(e) => {
                        if let Some(batch) = batch {
                            self.rollback(&batch).await;
                        }
                        Err(e)
                    }
                }
            })
            .await
    }

    /// Record that collected revenue left the platform account
    pub fn transfer_commission(&self, entry_id: &CommissionEntryId) -> Result<CommissionLedgerEntry> {
        self.commissions.mark_transferred(entry_id, self.clock.now())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get(&self, escrow_id: &EscrowId) -> Result<EscrowTransaction> {
        self.store
            .escrow(escrow_id)
            .await?
            .ok_or_else(|| CovenantError::not_found("escrow", escrow_id))
    }

    pub async fn list_by_status(&self, status: EscrowStatus) -> Result<Vec<EscrowTransaction>> {
        self.store.escrows_by_status(status).await
    }

    pub async fn balance(&self, account: &TreasuryAccount, currency: Currency) -> Result<Decimal> {
        self.treasury.balance(account, currency).await
    }

    /// Credit a wallet from outside the system
    pub async fn deposit(&self, account: &AccountId, amount: Decimal, currency: Currency) -> Result<()> {
        check_amount(amount, currency)?;
        self.treasury
            .deposit(TreasuryAccount::Wallet(account.clone()), amount, currency)
            .await?;
        info!(account = %account, amount = %amount, currency = %currency, "Wallet credited");
        Ok(())
    }

    pub async fn dispute(&self, dispute_id: &DisputeId) -> Result<Dispute> {
        self.store
            .dispute(dispute_id)
            .await?
            .ok_or_else(|| CovenantError::not_found("dispute", dispute_id))
    }

    pub async fn disputes_for_escrow(&self, escrow_id: &EscrowId) -> Result<Vec<Dispute>> {
        self.store.disputes_for_escrow(escrow_id).await
    }

    pub async fn open_disputes(&self) -> Result<Vec<Dispute>> {
        self.store.open_disputes().await
    }

    pub fn commission_entry(&self, escrow_id: &EscrowId) -> Option<CommissionLedgerEntry> {
        self.commissions.for_escrow(escrow_id)
    }

    pub fn pending_commissions(&self) -> Vec<CommissionLedgerEntry> {
        self.commissions.pending_entries()
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyLedger> {
        &self.idempotency
    }

    pub fn commission_engine(&self) -> &Arc<CommissionEngine> {
        &self.commission
    }

    // ========================================================================
    // Internals
    // ========================================================================

    pub(crate) async fn load_guarded(
        &self,
        permit: &SettlementPermit,
        escrow_id: &EscrowId,
    ) -> Result<EscrowTransaction> {
        permit.ensure_entity(&escrow_id.to_string())?;
        self.get(escrow_id).await
    }

    /// Commit a prepared settlement together with its commission entry
    ///
    /// Legs are applied first, then the entry is recorded, then the records
    /// are committed. A failure at any step undoes the steps before it.
    pub(crate) async fn execute_settlement(
        &self,
        permit: &SettlementPermit,
        plan: Settlement,
        mut writes: Vec<Write>,
    ) -> Result<EscrowTransaction> {
        let Settlement {
            mut escrow,
            legs,
            commission,
        } = plan;
        writes.push(Write::escrow(&mut escrow));

        let batch = self.apply_legs(permit, legs).await?;

        let recorded = match commission.map(|entry| self.commissions.append(entry)).transpose() {
            Ok(recorded) => recorded,
            Err(e) => {
                error!(escrow_id = %escrow.id, error = %e, "Failed to record commission entry");
                if let Some(batch) = batch {
                    self.rollback(&batch).await;
                }
                return Err(e);
            }
        };

        if let Err(e) = self.store.commit(writes).await {
            if let Some(entry) = recorded {
                if let Err(retract_err) = self.commissions.retract(&entry.id) {
                    error!(entry_id = %entry.id, error = %retract_err, "Failed to retract commission entry");
                }
            }
            if let Some(batch) = batch {
                self.rollback(&batch).await;
            }
            return Err(e);
        }

        info!(
            escrow_id = %escrow.id,
            operation = permit.operation(),
            status = %escrow.status,
            released = %escrow.released_amount,
            refunded = %escrow.refunded_amount,
            "Escrow settled"
        );
        Ok(escrow)
    }

    async fn apply_legs(&self, permit: &SettlementPermit, legs: Vec<Leg>) -> Result<Option<BatchId>> {
        let legs: Vec<Leg> = legs
            .into_iter()
            .filter(|leg| leg.amount > Decimal::ZERO)
            .collect();
        if legs.is_empty() {
            return Ok(None);
        }
        debug!(
            operation = permit.operation(),
            entity_id = permit.entity_id(),
            legs = legs.len(),
            "Applying treasury legs"
        );
        self.treasury.apply(legs).await.map(Some)
    }

    async fn rollback(&self, batch: &BatchId) {
        match self.treasury.reverse(batch).await {
            Ok(()) => warn!(batch_id = %batch, "Settlement failed; treasury batch reversed"),
            Err(e) => error!(batch_id = %batch, error = %e, "Failed to reverse treasury batch"),
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

pub(crate) fn check_amount(amount: Decimal, currency: Currency) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(CovenantError::InvalidAmount {
            amount: amount.to_string(),
            currency: currency.to_string(),
            reason: "must be positive".to_string(),
        });
    }
    if !currency.is_representable(amount) {
        return Err(CovenantError::InvalidAmount {
            amount: amount.to_string(),
            currency: currency.to_string(),
            reason: format!("more than {} decimal places", currency.minor_units()),
        });
    }
    Ok(())
}

fn validate_request(request: &CreateEscrowRequest) -> Result<()> {
    check_amount(request.amount, request.currency)?;
    if request.sender == request.recipient {
        return Err(CovenantError::validation(
            "recipient",
            "sender and recipient must differ",
        ));
    }
    Ok(())
}

fn mark_verified(escrow: &mut EscrowTransaction, now: DateTime<Utc>) -> Result<()> {
    if escrow.status != EscrowStatus::ProofPending {
        return Err(CovenantError::invalid_state("escrow", escrow.status, OP_VERIFY_PROOF));
    }
    escrow.proof_verified = true;
    escrow.status = EscrowStatus::ProofVerified;
    escrow.updated_at = now;
    Ok(())
}

fn mark_rejected(
    escrow: &mut EscrowTransaction,
    reason: &str,
    max_rejections: u32,
    now: DateTime<Utc>,
) -> Result<()> {
    if escrow.status != EscrowStatus::ProofPending {
        return Err(CovenantError::invalid_state("escrow", escrow.status, OP_REJECT_PROOF));
    }
    if escrow.proof_rejections >= max_rejections {
        return Err(CovenantError::validation(
            "proof",
            format!("proof already rejected {max_rejections} times"),
        ));
    }
    escrow.proof_rejections += 1;
    escrow.last_rejection_reason = Some(reason.to_string());
    escrow.proof_submitted = false;
    escrow.status = EscrowStatus::Held;
    escrow.updated_at = now;
    Ok(())
}

// ============================================================================
// Settlement plans
// ============================================================================

/// Legs paying `net` (escrow currency) to the recipient as `settled` in the
/// settlement currency, routed through the FX pool when they differ
fn payout_legs(escrow: &EscrowTransaction, net: Decimal, settled: Decimal) -> Vec<Leg> {
    let from = TreasuryAccount::Escrow(escrow.id.clone());
    let to = TreasuryAccount::Wallet(escrow.recipient.clone());
    if escrow.settlement_currency == escrow.currency {
        return vec![Leg::new(from, to, net, escrow.currency)];
    }
    vec![
        Leg::new(from, TreasuryAccount::FxPool, net, escrow.currency),
        Leg::new(TreasuryAccount::FxPool, to, settled, escrow.settlement_currency),
    ]
}

pub(crate) fn plan_release(
    mut escrow: EscrowTransaction,
    released_by: Option<AccountId>,
    now: DateTime<Utc>,
) -> Settlement {
    let legs = payout_legs(
        &escrow,
        escrow.commission.receiver_gets,
        escrow.settlement_amount,
    );
    let commission = CommissionLedgerEntry::pending(escrow.id.clone(), &escrow.commission, now);

    escrow.released_amount = escrow.amount;
    escrow.released_by = released_by;
    escrow.status = EscrowStatus::Released;
    escrow.active_dispute = None;
    escrow.updated_at = now;
    Settlement {
        escrow,
        legs,
        commission: Some(commission),
    }
}

pub(crate) fn plan_refund(
    mut escrow: EscrowTransaction,
    status: EscrowStatus,
    reason: String,
    now: DateTime<Utc>,
) -> Settlement {
    let held = escrow.held_amount();
    let legs = vec![Leg::new(
        TreasuryAccount::Escrow(escrow.id.clone()),
        TreasuryAccount::Wallet(escrow.sender.clone()),
        held,
        escrow.currency,
    )];

    escrow.refunded_amount = escrow.amount;
    escrow.commission_returned = held - escrow.amount;
    escrow.closing_reason = Some(reason);
    escrow.status = status;
    escrow.active_dispute = None;
    escrow.updated_at = now;
    Settlement {
        escrow,
        legs,
        commission: None,
    }
}

/// Refund `refund_amount` of the base amount and release the remainder
///
/// The remainder's commission is recomputed at the frozen rates. The sender
/// gets back the refunded part less the retained fee, plus the giver
/// commission it no longer owes. The fee stays with the platform.
pub(crate) fn plan_partial_refund(
    mut escrow: EscrowTransaction,
    refund_amount: Decimal,
    service_fee_retained: Decimal,
    now: DateTime<Utc>,
) -> Result<Settlement> {
    check_amount(refund_amount, escrow.currency)?;
    if refund_amount >= escrow.amount {
        return Err(CovenantError::validation(
            "refund_amount",
            "must be less than the escrow amount",
        ));
    }
    if service_fee_retained < Decimal::ZERO
        || service_fee_retained > refund_amount
        || !escrow.currency.is_representable(service_fee_retained)
    {
        return Err(CovenantError::validation(
            "service_fee_retained",
            "must be between zero and the refund amount",
        ));
    }

    let remainder = escrow.amount - refund_amount;
    let portion = escrow.commission.for_portion(remainder);
    let commission_returned = escrow.commission.giver_commission - portion.giver_commission;
    let to_sender = refund_amount - service_fee_retained + commission_returned;
    let to_recipient = portion.receiver_gets;
    let settled = if escrow.settlement_currency == escrow.currency {
        to_recipient
    } else {
        escrow
            .settlement_currency
            .round(to_recipient * escrow.exchange_rate_used)
    };

    let mut legs = vec![Leg::new(
        TreasuryAccount::Escrow(escrow.id.clone()),
        TreasuryAccount::Wallet(escrow.sender.clone()),
        to_sender,
        escrow.currency,
    )];
    legs.extend(payout_legs(&escrow, to_recipient, settled));

    let mut commission = CommissionLedgerEntry::pending(escrow.id.clone(), &portion, now);
    commission.platform_revenue += service_fee_retained;

    escrow.refunded_amount = refund_amount;
    escrow.released_amount = remainder;
    escrow.commission_returned = commission_returned;
    escrow.service_fee_retained = service_fee_retained;
    escrow.status = EscrowStatus::PartiallyRefunded;
    escrow.active_dispute = None;
    escrow.updated_at = now;
    Ok(Settlement {
        escrow,
        legs,
        commission: Some(commission),
    })
}
