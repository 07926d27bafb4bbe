//! Dispute endpoints

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use covenant_escrow::EvidenceInput;
use covenant_types::{AccountId, Dispute, ResolutionType};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::settled;
use crate::error::ApiResult;
use crate::extractors::{dispute_id, IdempotencyKeyHeader};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AdjudicatorBody {
    pub adjudicator: AccountId,
}

#[derive(Debug, Deserialize)]
pub struct RespondBody {
    pub respondent: AccountId,
    pub text: String,
    #[serde(default)]
    pub evidence: Vec<EvidenceInput>,
}

#[derive(Debug, Deserialize)]
pub struct EvidenceBody {
    pub submitted_by: AccountId,
    pub evidence: Vec<EvidenceInput>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveBody {
    pub adjudicator: AccountId,
    pub resolution: ResolutionType,
    /// Required for `partial_refund`
    #[serde(default)]
    pub refund_amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct CancelDisputeBody {
    pub cancelled_by: AccountId,
}

pub async fn begin_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<AdjudicatorBody>,
) -> ApiResult<Response> {
    let id = dispute_id(&id)?;
    Ok(settled(state.manager.begin_review(&id, &body.adjudicator, &key).await?))
}

pub async fn request_response(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<AdjudicatorBody>,
) -> ApiResult<Response> {
    let id = dispute_id(&id)?;
    let executed = state
        .manager
        .request_response(&id, &body.adjudicator, &key)
        .await?;
    Ok(settled(executed))
}

pub async fn respond(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<RespondBody>,
) -> ApiResult<Response> {
    let id = dispute_id(&id)?;
    let executed = state
        .manager
        .respond(&id, &body.respondent, &body.text, body.evidence, &key)
        .await?;
    Ok(settled(executed))
}

pub async fn add_evidence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<EvidenceBody>,
) -> ApiResult<Response> {
    let id = dispute_id(&id)?;
    let executed = state
        .manager
        .add_evidence(&id, &body.submitted_by, body.evidence, &key)
        .await?;
    Ok(settled(executed))
}

pub async fn resolve(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<ResolveBody>,
) -> ApiResult<Response> {
    let id = dispute_id(&id)?;
    let executed = state
        .manager
        .resolve_dispute(&id, &body.adjudicator, body.resolution, body.refund_amount, &key)
        .await?;
    Ok(settled(executed))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    IdempotencyKeyHeader(key): IdempotencyKeyHeader,
    Json(body): Json<CancelDisputeBody>,
) -> ApiResult<Response> {
    let id = dispute_id(&id)?;
    let executed = state
        .manager
        .cancel_dispute(&id, &body.cancelled_by, &key)
        .await?;
    Ok(settled(executed))
}

pub async fn get_dispute(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Dispute>> {
    let id = dispute_id(&id)?;
    Ok(Json(state.manager.dispute(&id).await?))
}

pub async fn open_disputes(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Dispute>>> {
    Ok(Json(state.manager.open_disputes().await?))
}
