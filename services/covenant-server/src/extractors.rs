//! Request extractors

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use covenant_types::{AccountId, AlertId, CommissionEntryId, DisputeId, EscrowId, IdempotencyKey};

use crate::error::ApiError;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// The caller-supplied `Idempotency-Key` header
#[derive(Debug, Clone)]
pub struct IdempotencyKeyHeader(pub IdempotencyKey);

#[async_trait]
impl<S> FromRequestParts<S> for IdempotencyKeyHeader
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .ok_or(ApiError::MissingIdempotencyKey)?
            .to_str()
            .map_err(|_| ApiError::invalid("idempotency key", "non-ASCII header value"))?;
        Ok(Self(IdempotencyKey::new(raw)?))
    }
}

// Path ids accept both the prefixed display form and a bare UUID

pub fn escrow_id(raw: &str) -> Result<EscrowId, ApiError> {
    EscrowId::parse(raw).map_err(|_| ApiError::invalid("escrow id", raw))
}

pub fn dispute_id(raw: &str) -> Result<DisputeId, ApiError> {
    DisputeId::parse(raw).map_err(|_| ApiError::invalid("dispute id", raw))
}

pub fn account_id(raw: &str) -> Result<AccountId, ApiError> {
    AccountId::parse(raw).map_err(|_| ApiError::invalid("account id", raw))
}

pub fn commission_entry_id(raw: &str) -> Result<CommissionEntryId, ApiError> {
    CommissionEntryId::parse(raw).map_err(|_| ApiError::invalid("commission entry id", raw))
}

pub fn alert_id(raw: &str) -> Result<AlertId, ApiError> {
    AlertId::parse(raw).map_err(|_| ApiError::invalid("alert id", raw))
}
