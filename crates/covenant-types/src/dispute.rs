//! Dispute types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, DisputeId, EscrowId, Evidence};

/// Why a party opened a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeReason {
    NotDelivered,
    NotAsDescribed,
    ProofInvalid,
    Unauthorized,
    Other,
}

/// State of a dispute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Pending,
    UnderReview,
    AwaitingResponse,
    ResolvedRefund,
    ResolvedPartial,
    ResolvedRelease,
    Cancelled,
    Expired,
}

impl DisputeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ResolvedRefund
                | Self::ResolvedPartial
                | Self::ResolvedRelease
                | Self::Cancelled
                | Self::Expired
        )
    }

    /// States in which the respondent may still answer
    pub fn accepts_response(&self) -> bool {
        matches!(self, Self::Pending | Self::AwaitingResponse)
    }
}

/// Adjudicated outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    Refund,
    PartialRefund,
    Release,
}

impl ResolutionType {
    /// Terminal dispute status for this outcome
    pub fn status(&self) -> DisputeStatus {
        match self {
            Self::Refund => DisputeStatus::ResolvedRefund,
            Self::PartialRefund => DisputeStatus::ResolvedPartial,
            Self::Release => DisputeStatus::ResolvedRelease,
        }
    }
}

/// A dispute raised against an escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispute {
    pub id: DisputeId,
    pub escrow_id: EscrowId,
    pub reason: DisputeReason,
    pub description: String,
    pub status: DisputeStatus,
    pub opened_by: AccountId,
    pub respondent: AccountId,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    pub response: Option<String>,
    pub responded_at: Option<DateTime<Utc>>,
    pub response_deadline: DateTime<Utc>,
    pub review_deadline: DateTime<Utc>,
    pub resolution: Option<ResolutionType>,
    pub refund_amount: Option<Decimal>,
    pub resolved_by: Option<AccountId>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dispute {
    /// Whether the respondent let the response window lapse
    pub fn response_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.status.accepts_response() && now >= self.response_deadline
    }

    /// Whether the review window lapsed without a resolution
    pub fn review_overdue_at(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now >= self.review_deadline
    }
}
