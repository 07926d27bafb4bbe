//! Dispute workflow
//!
//! Disputes share the escrow's entity scope in the idempotency ledger, so a
//! resolution and any concurrent release or refund on the same escrow
//! serialize.

use chrono::{DateTime, Utc};
use covenant_idempotency::{fingerprint, Executed, SettlementPermit};
use covenant_types::{
    AccountId, CovenantError, Dispute, DisputeId, DisputeStatus, EscrowStatus, EscrowTransaction,
    IdempotencyKey, ResolutionType, Result,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::lifecycle::{
    check_evidence, plan_partial_refund, plan_refund, plan_release, EscrowManager, EvidenceInput,
};
use crate::store::Write;

const OP_BEGIN_REVIEW: &str = "dispute_begin_review";
const OP_REQUEST_RESPONSE: &str = "dispute_request_response";
const OP_RESPOND: &str = "dispute_respond";
const OP_ADD_EVIDENCE: &str = "dispute_add_evidence";
const OP_RESOLVE: &str = "dispute_resolve";
const OP_CANCEL: &str = "dispute_cancel";
const OP_FORFEIT: &str = "dispute_forfeit";
const OP_EXPIRE: &str = "dispute_expire";

/// A dispute together with the escrow it settled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeOutcome {
    pub dispute: Dispute,
    pub escrow: EscrowTransaction,
}

/// Put a disputed escrow back where it was before the dispute
fn restore_escrow(escrow: &mut EscrowTransaction, now: DateTime<Utc>) {
    escrow.status = escrow
        .status_before_dispute
        .take()
        .unwrap_or(EscrowStatus::Held);
    escrow.active_dispute = None;
    escrow.updated_at = now;
}

fn ensure_open(dispute: &Dispute, operation: &str) -> Result<()> {
    if dispute.status.is_terminal() {
        return Err(CovenantError::invalid_state("dispute", dispute.status, operation));
    }
    Ok(())
}

fn ensure_adjudicator(escrow: &EscrowTransaction, adjudicator: &AccountId) -> Result<()> {
    if escrow.is_party(adjudicator) {
        return Err(CovenantError::unauthorized(
            "a party to the escrow cannot adjudicate its dispute",
        ));
    }
    Ok(())
}

impl EscrowManager {
    /// Entity scope of a dispute: its escrow
    async fn dispute_scope(&self, dispute_id: &DisputeId) -> Result<String> {
        Ok(self.dispute(dispute_id).await?.escrow_id.to_string())
    }

    async fn load_dispute_guarded(
        &self,
        permit: &SettlementPermit,
        dispute_id: &DisputeId,
    ) -> Result<(Dispute, EscrowTransaction)> {
        let dispute = self.dispute(dispute_id).await?;
        let escrow = self.load_guarded(permit, &dispute.escrow_id).await?;
        Ok((dispute, escrow))
    }

    /// Record-only dispute transition under the escrow's scope
    async fn transition_dispute<F>(
        &self,
        operation: &'static str,
        dispute_id: &DisputeId,
        key: &IdempotencyKey,
        fp: &str,
        f: F,
    ) -> Result<Executed<Dispute>>
    where
        F: FnOnce(&mut Dispute, &EscrowTransaction, DateTime<Utc>) -> Result<()> + Send,
    {
        let entity = self.dispute_scope(dispute_id).await?;
        self.idempotency
            .execute(operation, &entity, key, fp, |permit| async move {
                let now = permit.issued_at();
                let (mut dispute, escrow) = self.load_dispute_guarded(&permit, dispute_id).await?;
                ensure_open(&dispute, operation)?;
                f(&mut dispute, &escrow, now)?;
                dispute.updated_at = now;
                self.store.commit(vec![Write::dispute(&mut dispute)]).await?;
                info!(
                    dispute_id = %dispute.id,
                    escrow_id = %dispute.escrow_id,
                    operation,
                    status = ?dispute.status,
                    "Dispute updated"
                );
                Ok(dispute)
            })
            .await
    }

    /// `Pending -> UnderReview`
    pub async fn begin_review(
        &self,
        dispute_id: &DisputeId,
        adjudicator: &AccountId,
        key: &IdempotencyKey,
    ) -> Result<Executed<Dispute>> {
        let fp = fingerprint(&json!({ "dispute_id": dispute_id, "adjudicator": adjudicator }))?;
        self.transition_dispute(OP_BEGIN_REVIEW, dispute_id, key, &fp, |dispute, escrow, _| {
            ensure_adjudicator(escrow, adjudicator)?;
            if dispute.status != DisputeStatus::Pending {
                return Err(CovenantError::invalid_state("dispute", dispute.status, OP_BEGIN_REVIEW));
            }
            dispute.status = DisputeStatus::UnderReview;
            Ok(())
        })
        .await
    }

    /// `UnderReview -> AwaitingResponse`, extending the response deadline
    pub async fn request_response(
        &self,
        dispute_id: &DisputeId,
        adjudicator: &AccountId,
        key: &IdempotencyKey,
    ) -> Result<Executed<Dispute>> {
        let fp = fingerprint(&json!({ "dispute_id": dispute_id, "adjudicator": adjudicator }))?;
        let window = self.config().disputes.response_window();
        self.transition_dispute(OP_REQUEST_RESPONSE, dispute_id, key, &fp, |dispute, escrow, now| {
            ensure_adjudicator(escrow, adjudicator)?;
            if dispute.status != DisputeStatus::UnderReview {
                return Err(CovenantError::invalid_state(
                    "dispute",
                    dispute.status,
                    OP_REQUEST_RESPONSE,
                ));
            }
            dispute.response_deadline = dispute.response_deadline.max(now) + window;
            dispute.status = DisputeStatus::AwaitingResponse;
            Ok(())
        })
        .await
    }

    /// The opposing party answers before the deadline
    pub async fn respond(
        &self,
        dispute_id: &DisputeId,
        respondent: &AccountId,
        text: &str,
        evidence: Vec<EvidenceInput>,
        key: &IdempotencyKey,
    ) -> Result<Executed<Dispute>> {
        if text.trim().is_empty() {
            return Err(CovenantError::validation("response", "must not be empty"));
        }
        check_evidence(&evidence)?;
        let fp = fingerprint(&json!({
            "dispute_id": dispute_id,
            "respondent": respondent,
            "text": text,
            "evidence": evidence,
        }))?;
        self.transition_dispute(OP_RESPOND, dispute_id, key, &fp, move |dispute, _, now| {
            if respondent != &dispute.respondent {
                return Err(CovenantError::unauthorized(
                    "only the opposing party may respond",
                ));
            }
            if !dispute.status.accepts_response() {
                return Err(CovenantError::invalid_state("dispute", dispute.status, OP_RESPOND));
            }
            if now >= dispute.response_deadline {
                return Err(CovenantError::DisputeWindowExpired {
                    dispute_id: dispute.id.to_string(),
                    deadline: dispute.response_deadline.to_rfc3339(),
                });
            }
            dispute.response = Some(text.to_string());
            dispute.responded_at = Some(now);
            dispute
                .evidence
                .extend(evidence.into_iter().map(|e| e.into_evidence(respondent, now)));
            dispute.status = DisputeStatus::UnderReview;
            Ok(())
        })
        .await
    }

    /// Either party attaches more evidence to an open dispute
    pub async fn add_evidence(
        &self,
        dispute_id: &DisputeId,
        submitted_by: &AccountId,
        evidence: Vec<EvidenceInput>,
        key: &IdempotencyKey,
    ) -> Result<Executed<Dispute>> {
        if evidence.is_empty() {
            return Err(CovenantError::validation("evidence", "at least one item is required"));
        }
        check_evidence(&evidence)?;
        let fp = fingerprint(&json!({
            "dispute_id": dispute_id,
            "submitted_by": submitted_by,
            "evidence": evidence,
        }))?;
        self.transition_dispute(OP_ADD_EVIDENCE, dispute_id, key, &fp, move |dispute, escrow, now| {
            if !escrow.is_party(submitted_by) {
                return Err(CovenantError::unauthorized("only a party may add evidence"));
            }
            dispute
                .evidence
                .extend(evidence.into_iter().map(|e| e.into_evidence(submitted_by, now)));
            Ok(())
        })
        .await
    }

    /// Adjudicate a dispute and settle the escrow accordingly
    pub async fn resolve_dispute(
        &self,
        dispute_id: &DisputeId,
        adjudicator: &AccountId,
        resolution: ResolutionType,
        refund_amount: Option<Decimal>,
        key: &IdempotencyKey,
    ) -> Result<Executed<DisputeOutcome>> {
        let refund_amount = match (resolution, refund_amount) {
            (ResolutionType::PartialRefund, None) => {
                return Err(CovenantError::validation(
                    "refund_amount",
                    "required for a partial refund",
                ))
            }
            (ResolutionType::PartialRefund, amount) => amount,
            (_, Some(_)) => {
                return Err(CovenantError::validation(
                    "refund_amount",
                    "only valid for a partial refund",
                ))
            }
            (_, None) => None,
        };
        let fp = fingerprint(&json!({
            "dispute_id": dispute_id,
            "adjudicator": adjudicator,
            "resolution": resolution,
            "refund_amount": refund_amount,
        }))?;
        let entity = self.dispute_scope(dispute_id).await?;
        self.idempotency
            .execute(OP_RESOLVE, &entity, key, &fp, |permit| async move {
                let now = permit.issued_at();
                let (mut dispute, mut escrow) =
                    self.load_dispute_guarded(&permit, dispute_id).await?;
                ensure_open(&dispute, OP_RESOLVE)?;
                ensure_adjudicator(&escrow, adjudicator)?;
                if escrow.active_dispute.as_ref() != Some(&dispute.id) {
                    return Err(CovenantError::invalid_state("escrow", escrow.status, OP_RESOLVE));
                }
                escrow.status_before_dispute = None;

                let plan = match resolution {
                    ResolutionType::Release => plan_release(escrow, Some(adjudicator.clone()), now),
                    ResolutionType::Refund => plan_refund(
                        escrow,
                        EscrowStatus::Refunded,
                        format!("dispute {} resolved for the sender", dispute.id),
                        now,
                    ),
                    ResolutionType::PartialRefund => plan_partial_refund(
                        escrow,
                        refund_amount.unwrap_or(Decimal::ZERO),
                        Decimal::ZERO,
                        now,
                    )?,
                };

                dispute.status = resolution.status();
                dispute.resolution = Some(resolution);
                dispute.refund_amount = match resolution {
                    ResolutionType::Release => None,
                    _ => Some(plan.escrow.refunded_amount),
                };
                dispute.resolved_by = Some(adjudicator.clone());
                dispute.resolved_at = Some(now);
                dispute.updated_at = now;

                let writes = vec![Write::dispute(&mut dispute)];
                let escrow = self.execute_settlement(&permit, plan, writes).await?;
                info!(
                    dispute_id = %dispute.id,
                    escrow_id = %escrow.id,
                    resolution = ?resolution,
                    "Dispute resolved"
                );
                Ok(DisputeOutcome { dispute, escrow })
            })
            .await
    }

    /// The opener withdraws; the escrow returns to its pre-dispute status
    pub async fn cancel_dispute(
        &self,
        dispute_id: &DisputeId,
        cancelled_by: &AccountId,
        key: &IdempotencyKey,
    ) -> Result<Executed<DisputeOutcome>> {
        let fp = fingerprint(&json!({ "dispute_id": dispute_id, "cancelled_by": cancelled_by }))?;
        let entity = self.dispute_scope(dispute_id).await?;
        self.idempotency
            .execute(OP_CANCEL, &entity, key, &fp, |permit| async move {
                let now = permit.issued_at();
                let (mut dispute, mut escrow) =
                    self.load_dispute_guarded(&permit, dispute_id).await?;
                ensure_open(&dispute, OP_CANCEL)?;
                if cancelled_by != &dispute.opened_by {
                    return Err(CovenantError::unauthorized(
                        "only the opener may cancel a dispute",
                    ));
                }
                dispute.status = DisputeStatus::Cancelled;
                dispute.resolved_by = Some(cancelled_by.clone());
                dispute.resolved_at = Some(now);
                dispute.updated_at = now;
                restore_escrow(&mut escrow, now);
                self.store
                    .commit(vec![Write::dispute(&mut dispute), Write::escrow(&mut escrow)])
                    .await?;
                info!(dispute_id = %dispute.id, escrow_id = %escrow.id, "Dispute cancelled");
                Ok(DisputeOutcome { dispute, escrow })
            })
            .await
    }

    /// Settle a dispute whose respondent missed the response deadline
    ///
    /// The opener wins: a sender gets a refund, a recipient gets the release.
    pub async fn forfeit_dispute(
        &self,
        dispute_id: &DisputeId,
        key: &IdempotencyKey,
    ) -> Result<Executed<DisputeOutcome>> {
        let fp = fingerprint(&json!({ "dispute_id": dispute_id }))?;
        let entity = self.dispute_scope(dispute_id).await?;
        self.idempotency
            .execute(OP_FORFEIT, &entity, key, &fp, |permit| async move {
                let now = permit.issued_at();
                let (mut dispute, mut escrow) =
                    self.load_dispute_guarded(&permit, dispute_id).await?;
                if !dispute.response_overdue_at(now) {
                    return Err(CovenantError::invalid_state("dispute", dispute.status, OP_FORFEIT));
                }
                escrow.status_before_dispute = None;

                let (resolution, plan) = if dispute.opened_by == escrow.sender {
                    let reason = format!("dispute {} forfeited by the recipient", dispute.id);
                    (
                        ResolutionType::Refund,
                        plan_refund(escrow, EscrowStatus::Refunded, reason, now),
                    )
                } else {
                    (ResolutionType::Release, plan_release(escrow, None, now))
                };

                dispute.status = resolution.status();
                dispute.resolution = Some(resolution);
                if resolution == ResolutionType::Refund {
                    dispute.refund_amount = Some(plan.escrow.refunded_amount);
                }
                dispute.resolved_at = Some(now);
                dispute.updated_at = now;

                let writes = vec![Write::dispute(&mut dispute)];
                let escrow = self.execute_settlement(&permit, plan, writes).await?;
                info!(
                    dispute_id = %dispute.id,
                    escrow_id = %escrow.id,
                    resolution = ?resolution,
                    "Dispute forfeited"
                );
                Ok(DisputeOutcome { dispute, escrow })
            })
            .await
    }

    /// Close a dispute whose review window lapsed; the escrow is restored
    pub async fn expire_dispute(
        &self,
        dispute_id: &DisputeId,
        key: &IdempotencyKey,
    ) -> Result<Executed<DisputeOutcome>> {
        let fp = fingerprint(&json!({ "dispute_id": dispute_id }))?;
        let entity = self.dispute_scope(dispute_id).await?;
        self.idempotency
            .execute(OP_EXPIRE, &entity, key, &fp, |permit| async move {
                let now = permit.issued_at();
                let (mut dispute, mut escrow) =
                    self.load_dispute_guarded(&permit, dispute_id).await?;
                if !dispute.review_overdue_at(now) {
                    return Err(CovenantError::invalid_state("dispute", dispute.status, OP_EXPIRE));
                }
                dispute.status = DisputeStatus::Expired;
                dispute.resolved_at = Some(now);
                dispute.updated_at = now;
                restore_escrow(&mut escrow, now);
                self.store
                    .commit(vec![Write::dispute(&mut dispute), Write::escrow(&mut escrow)])
                    .await?;
                info!(
                    dispute_id = %dispute.id,
                    escrow_id = %escrow.id,
                    restored = %escrow.status,
                    "Dispute expired"
                );
                Ok(DisputeOutcome { dispute, escrow })
            })
            .await
    }
}
