//! Error types for Covenant
//!
//! Every failure is surfaced as a structured result. A replayed idempotent
//! call is not an error and therefore has no variant here.

use thiserror::Error;

/// Result type for Covenant operations
pub type Result<T> = std::result::Result<T, CovenantError>;

/// Covenant error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CovenantError {
    // ========================================================================
    // Input Errors (rejected before any side effect)
    // ========================================================================

    /// Malformed input
    #[error("Validation failed: {field} - {reason}")]
    ValidationError { field: String, reason: String },

    /// Amount is non-positive or finer than the currency's minor unit
    #[error("Invalid amount {amount} {currency}: {reason}")]
    InvalidAmount {
        amount: String,
        currency: String,
        reason: String,
    },

    /// Amount outside the configured per-escrow limits
    #[error("Amount {amount} outside limits [{min}, {max}]")]
    LimitExceeded {
        amount: String,
        min: String,
        max: String,
    },

    /// Caller is not a party allowed to perform the action
    #[error("Unauthorized: {reason}")]
    Unauthorized { reason: String },

    // ========================================================================
    // State Errors
    // ========================================================================

    /// Entity not found
    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: String },

    /// Operation not valid from the current lifecycle state
    #[error("{operation} is not valid for {entity} in state {state}")]
    InvalidState {
        entity: String,
        state: String,
        operation: String,
    },

    /// Insufficient funds in a treasury account
    #[error("Insufficient funds in {account}: requested {requested}, available {available}")]
    InsufficientFunds {
        account: String,
        requested: String,
        available: String,
    },

    // ========================================================================
    // Risk & Pricing Errors
    // ========================================================================

    /// Risk gate rejected the operation (recoverable via manual review)
    #[error("Blocked by risk gate: score {risk_score}, rules [{}]", .triggered_rules.join(", "))]
    FraudBlocked {
        risk_score: u32,
        triggered_rules: Vec<String>,
    },

    /// No sufficiently fresh exchange rate
    #[error("Exchange rate {from}/{to} is stale or unavailable")]
    StaleExchangeRate { from: String, to: String },

    /// Commission tier table is discontinuous, overlapping or malformed
    #[error("Invalid commission tier configuration: {reason}")]
    InvalidTierConfiguration { reason: String },

    // ========================================================================
    // Dispute Errors
    // ========================================================================

    /// Response submitted after the deadline
    #[error("Dispute {dispute_id} response window closed at {deadline}")]
    DisputeWindowExpired { dispute_id: String, deadline: String },

    /// Escrow already reached the maximum number of disputes
    #[error("Escrow {escrow_id} reached the maximum of {max} disputes")]
    DisputeLimitReached { escrow_id: String, max: u32 },

    // ========================================================================
    // Infrastructure Errors
    // ========================================================================

    /// Lock contention or optimistic version conflict
    #[error("Concurrency conflict on {entity}: {reason}")]
    ConcurrencyConflict { entity: String, reason: String },

    /// A collaborator did not answer within its time budget
    #[error("{component} unavailable: {reason}")]
    Unavailable { component: String, reason: String },

    /// Persistence failure
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CovenantError {
    /// Create a validation error
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(
        entity: impl Into<String>,
        state: impl std::fmt::Debug,
        operation: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            entity: entity.into(),
            state: format!("{:?}", state),
            operation: operation.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Create a concurrency conflict error
    pub fn conflict(entity: impl ToString, reason: impl Into<String>) -> Self {
        Self::ConcurrencyConflict {
            entity: entity.to_string(),
            reason: reason.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the caller may retry (with backoff)
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. }
                | Self::Unavailable { .. }
                | Self::StaleExchangeRate { .. }
                | Self::Storage { .. }
        )
    }

    /// Get an error code for RPC responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::InvalidAmount { .. } => "INVALID_AMOUNT",
            Self::LimitExceeded { .. } => "LIMIT_EXCEEDED",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::FraudBlocked { .. } => "FRAUD_BLOCKED",
            Self::StaleExchangeRate { .. } => "STALE_EXCHANGE_RATE",
            Self::InvalidTierConfiguration { .. } => "INVALID_TIER_CONFIGURATION",
            Self::DisputeWindowExpired { .. } => "DISPUTE_WINDOW_EXPIRED",
            Self::DisputeLimitReached { .. } => "DISPUTE_LIMIT_REACHED",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::Unavailable { .. } => "UNAVAILABLE",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Whether the error should be shown to operators rather than end users
    pub fn is_operator_facing(&self) -> bool {
        matches!(
            self,
            Self::InvalidTierConfiguration { .. } | Self::Storage { .. } | Self::Internal { .. }
        )
    }
}

impl From<serde_json::Error> for CovenantError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(format!("serialization: {e}"))
    }
}
