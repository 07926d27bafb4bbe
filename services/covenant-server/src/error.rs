//! RPC error handling
//!
//! Maps the settlement error taxonomy onto HTTP status codes with a stable
//! machine-readable code in the body.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use covenant_types::CovenantError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RPC result type
pub type ApiResult<T> = Result<T, ApiError>;

/// Errors surfaced by the RPC layer
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Settlement(#[from] CovenantError),

    #[error("Missing Idempotency-Key header")]
    MissingIdempotencyKey,

    #[error("Invalid {what}: {value}")]
    InvalidParameter { what: &'static str, value: String },

    #[error("Not available: {0}")]
    Disabled(&'static str),
}

impl ApiError {
    pub fn invalid(what: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidParameter {
            what,
            value: value.into(),
        }
    }

    /// Machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Settlement(e) => e.error_code(),
            Self::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            Self::InvalidParameter { .. } => "INVALID_PARAMETER",
            Self::Disabled(_) => "DISABLED",
        }
    }

    /// HTTP status code
    pub fn status_code(&self) -> StatusCode {
        let e = match self {
            Self::Settlement(e) => e,
            Self::MissingIdempotencyKey | Self::InvalidParameter { .. } => {
                return StatusCode::BAD_REQUEST
            }
            Self::Disabled(_) => return StatusCode::NOT_FOUND,
        };

        match e {
            // 400 Bad Request
            CovenantError::ValidationError { .. } | CovenantError::InvalidAmount { .. } => {
                StatusCode::BAD_REQUEST
            }

            // 403 Forbidden
            CovenantError::Unauthorized { .. } | CovenantError::FraudBlocked { .. } => {
                StatusCode::FORBIDDEN
            }

            // 404 Not Found
            CovenantError::NotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            CovenantError::InvalidState { .. }
            | CovenantError::ConcurrencyConflict { .. }
            | CovenantError::DisputeLimitReached { .. } => StatusCode::CONFLICT,

            // 410 Gone
            CovenantError::DisputeWindowExpired { .. } => StatusCode::GONE,

            // 422 Unprocessable Entity
            CovenantError::LimitExceeded { .. } | CovenantError::InsufficientFunds { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }

            // 503 Service Unavailable
            CovenantError::StaleExchangeRate { .. } | CovenantError::Unavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 500 Internal Server Error
            CovenantError::InvalidTierConfiguration { .. }
            | CovenantError::Storage { .. }
            | CovenantError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Settlement(e) => e.is_retriable(),
            _ => false,
        }
    }
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub msg: String,
    /// Whether retrying with the same idempotency key may succeed
    pub retriable: bool,
}

impl From<&ApiError> for ErrorResponse {
    fn from(err: &ApiError) -> Self {
        // Operator-facing details stay in the logs
        let msg = match err {
            ApiError::Settlement(e) if e.is_operator_facing() => "Internal error".to_string(),
            _ => err.to_string(),
        };
        Self {
            code: err.error_code().to_string(),
            msg,
            retriable: err.is_retriable(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.error_code(), "Request failed");
        } else {
            tracing::debug!(error = %self, code = self.error_code(), "Request rejected");
        }
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}
