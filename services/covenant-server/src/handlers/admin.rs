//! Operator endpoints
//!
//! Rate feeds, commission overrides, fraud alert review and platform revenue.
//! These are upserts or guarded state transitions rather than money movements,
//! so they do not go through the idempotency ledger.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use covenant_escrow::TreasuryAccount;
use covenant_fx::ExchangeRate;
use covenant_risk::{AlertReviewStatus, FraudAlert};
use covenant_types::{
    AccountId, CommissionLedgerEntry, CommissionStatus, CovenantError, Currency,
    UserCommissionOverride,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::extractors::{account_id, alert_id, commission_entry_id};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    #[serde(default = "open_alerts")]
    pub status: AlertReviewStatus,
}

fn open_alerts() -> AlertReviewStatus {
    AlertReviewStatus::Open
}

#[derive(Debug, Deserialize)]
pub struct ReviewBody {
    pub reviewer: AccountId,
}

#[derive(Debug, Deserialize)]
pub struct CommissionQuery {
    pub status: CommissionStatus,
}

#[derive(Debug, Deserialize)]
pub struct DepositBody {
    pub amount: Decimal,
    pub currency: Currency,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account: AccountId,
    pub currency: Currency,
    pub balance: Decimal,
}

// =============================================================================
// Rates
// =============================================================================

pub async fn record_rate(
    State(state): State<Arc<AppState>>,
    Json(rate): Json<ExchangeRate>,
) -> ApiResult<StatusCode> {
    state.rates.record_rate(rate)?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Commission overrides
// =============================================================================

pub async fn put_override(
    State(state): State<Arc<AppState>>,
    Path(account): Path<String>,
    Json(ov): Json<UserCommissionOverride>,
) -> ApiResult<Json<UserCommissionOverride>> {
    let account = account_id(&account)?;
    if ov.account != account {
        return Err(ApiError::invalid("override account", ov.account.to_string()));
    }
    state.manager.commission_engine().set_override(ov.clone())?;
    Ok(Json(ov))
}

pub async fn get_override(
    State(state): State<Arc<AppState>>,
    Path(account): Path<String>,
) -> ApiResult<Json<UserCommissionOverride>> {
    let account = account_id(&account)?;
    state
        .manager
        .commission_engine()
        .override_for(&account)
        .map(Json)
        .ok_or_else(|| CovenantError::not_found("commission_override", &account).into())
}

pub async fn delete_override(
    State(state): State<Arc<AppState>>,
    Path(account): Path<String>,
) -> ApiResult<StatusCode> {
    let account = account_id(&account)?;
    match state.manager.commission_engine().remove_override(&account) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(CovenantError::not_found("commission_override", &account).into()),
    }
}

// =============================================================================
// Fraud alerts
// =============================================================================

pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertQuery>,
) -> Json<Vec<FraudAlert>> {
    Json(state.risk.alerts(query.status))
}

pub async fn clear_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> ApiResult<Json<FraudAlert>> {
    let id = alert_id(&id)?;
    let now = state.manager.now();
    Ok(Json(state.risk.clear_alert(&id, &body.reviewer, now)?))
}

pub async fn confirm_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> ApiResult<Json<FraudAlert>> {
    let id = alert_id(&id)?;
    let now = state.manager.now();
    Ok(Json(state.risk.confirm_alert(&id, &body.reviewer, now)?))
}

// =============================================================================
// Commissions
// =============================================================================

pub async fn list_commissions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CommissionQuery>,
) -> Json<Vec<CommissionLedgerEntry>> {
    Json(state.commissions.with_status(query.status))
}

pub async fn revenue(State(state): State<Arc<AppState>>) -> Json<BTreeMap<Currency, Decimal>> {
    Json(state.commissions.revenue_by_currency())
}

/// Mark a collected entry as paid out of the platform account
pub async fn transfer_commission(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<CommissionLedgerEntry>> {
    let id = commission_entry_id(&id)?;
    Ok(Json(state.manager.transfer_commission(&id)?))
}

// =============================================================================
// Accounts
// =============================================================================

pub async fn balance(
    State(state): State<Arc<AppState>>,
    Path((account, currency)): Path<(String, String)>,
) -> ApiResult<Json<BalanceResponse>> {
    let account = account_id(&account)?;
    let currency: Currency = currency.parse()?;
    let balance = state
        .manager
        .balance(&TreasuryAccount::Wallet(account.clone()), currency)
        .await?;
    Ok(Json(BalanceResponse {
        account,
        currency,
        balance,
    }))
}

/// Credit a wallet directly; only mounted in development mode
pub async fn deposit(
    State(state): State<Arc<AppState>>,
    Path(account): Path<String>,
    Json(body): Json<DepositBody>,
) -> ApiResult<Json<BalanceResponse>> {
    if !state.dev_mode {
        return Err(ApiError::Disabled("deposits"));
    }
    let account = account_id(&account)?;
    state
        .manager
        .deposit(&account, body.amount, body.currency)
        .await?;
    let balance = state
        .manager
        .balance(&TreasuryAccount::Wallet(account.clone()), body.currency)
        .await?;
    Ok(Json(BalanceResponse {
        account,
        currency: body.currency,
        balance,
    }))
}
