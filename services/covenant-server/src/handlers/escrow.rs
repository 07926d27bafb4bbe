//! Escrow lifecycle endpoints

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::Response,
    Json,
};
use covenant_escrow::{EvidenceInput, OpenDisputeRequest};
use covenant_types::{
    AccountId, CommissionLedgerEntry, CovenantError, CreateEscrowRequest, Dispute, EscrowStatus,
    EscrowTransaction,
};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::settled;
use crate::error::{ApiError, ApiResult};
use crate::extractors::{escrow_id, IdempotencyKeyHeader};
use crate::state::AppState;

// =============================================================================
// Request bodies
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitProofBody {
    pub submitted_by: AccountId,
    pub evidence: Vec<EvidenceInput>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyProofBody {
    pub verified_by: AccountId,
}

#[derive(Debug, Deserialize)]
pub struct RejectProofBody {
    pub rejected_by: AccountId,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ScoreProofBody {
    pub score: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseBody {
    pub released_by: AccountId,
}

#[derive(Debug, Deserialize)]
pub struct RefundBody {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct PartialRefundBody {
    pub refund_amount: Decimal,
    #[serde(default)]
    pub service_fee_retained: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub cancelled_by: AccountId,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub status: EscrowStatus,
}

// =============================================================================
// Mutations
// =============================================================================

pub async fn create_escrow(
    State(state): State<Arc<AppState>>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(request): Json<CreateEscrowRequest>,
) -> ApiResult<Response> {
    Ok(settled(state.manager.create(request, &key).await?))
}

pub async fn submit_proof(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<SubmitProofBody>,
) -> ApiResult<Response> {
    let id = escrow_id(&id)?;
    let executed = state
        .manager
        .submit_proof(&id, &body.submitted_by, body.evidence, &key)
        .await?;
    Ok(settled(executed))
}

pub async fn verify_proof(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<VerifyProofBody>,
) -> ApiResult<Response> {
    let id = escrow_id(&id)?;
    Ok(settled(state.manager.verify_proof(&id, &body.verified_by, &key).await?))
}

pub async fn reject_proof(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<RejectProofBody>,
) -> ApiResult<Response> {
    let id = escrow_id(&id)?;
    let executed = state
        .manager
        .reject_proof(&id, &body.rejected_by, &body.reason, &key)
        .await?;
    Ok(settled(executed))
}

pub async fn score_proof(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<ScoreProofBody>,
) -> ApiResult<Response> {
    let id = escrow_id(&id)?;
    Ok(settled(state.manager.score_proof(&id, body.score, &key).await?))
}

pub async fn release(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<ReleaseBody>,
) -> ApiResult<Response> {
    let id = escrow_id(&id)?;
    Ok(settled(state.manager.release(&id, &body.released_by, &key).await?))
}

pub async fn refund(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<RefundBody>,
) -> ApiResult<Response> {
    let id = escrow_id(&id)?;
    Ok(settled(state.manager.refund(&id, &body.reason, &key).await?))
}

pub async fn partial_refund(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<PartialRefundBody>,
) -> ApiResult<Response> {
    let id = escrow_id(&id)?;
    let executed = state
        .manager
        .partial_refund(&id, body.refund_amount, body.service_fee_retained, &key)
        .await?;
    Ok(settled(executed))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<CancelBody>,
) -> ApiResult<Response> {
    let id = escrow_id(&id)?;
    Ok(settled(state.manager.cancel(&id, &body.cancelled_by, &key).await?))
}

pub async fn open_dispute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(request): Json<OpenDisputeRequest>,
) -> ApiResult<Response> {
    let id = escrow_id(&id)?;
    Ok(settled(state.manager.open_dispute(&id, request, &key).await?))
}

// =============================================================================
// Reads
// =============================================================================

pub async fn get_escrow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<EscrowTransaction>> {
    let id = escrow_id(&id)?;
    Ok(Json(state.manager.get(&id).await?))
}

pub async fn list_escrows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> ApiResult<Json<Vec<EscrowTransaction>>> {
    Ok(Json(state.manager.list_by_status(query.status).await?))
}

pub async fn escrow_disputes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Dispute>>> {
    let id = escrow_id(&id)?;
    Ok(Json(state.manager.disputes_for_escrow(&id).await?))
}

pub async fn escrow_commission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CommissionLedgerEntry>> {
    let id = escrow_id(&id)?;
    state
        .manager
        .commission_entry(&id)
        .map(Json)
        .ok_or_else(|| ApiError::from(CovenantError::not_found("commission_entry", &id)))
}
