//! Escrow types for Covenant
//!
//! An escrow holds the payer's funds in trust until it is released to the
//! payee, refunded, or settled through a dispute. The commission split is
//! frozen on the record when the escrow is created.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{AccountId, CommissionSplit, Currency, DisputeId, EscrowId};

/// How an escrow becomes releasable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseCondition {
    /// Released automatically when the hold expires
    Auto,
    /// Recipient must submit proof that gets verified
    ProofRequired,
    /// Released only by an explicit release call
    Manual,
}

/// Kind of proof a recipient submits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofType {
    SelfieWithId,
    ExperiencePhoto,
    Receipt,
    LocationCheck,
    VideoProof,
}

/// A piece of evidence attached to an escrow or a dispute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// Who submitted this evidence
    pub submitted_by: AccountId,
    /// Proof category, when the evidence is a proof submission
    #[serde(default)]
    pub proof_type: Option<ProofType>,
    /// Opaque reference to the stored asset
    pub reference: String,
    #[serde(default)]
    pub note: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Lifecycle state of an escrow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Persisted, funding not yet applied
    Created,
    /// Funds are held in the escrow account
    Held,
    /// Proof submitted, awaiting verification
    ProofPending,
    /// Proof verified, ready for release
    ProofVerified,
    /// Funds released to the recipient
    Released,
    /// Funds returned to the sender
    Refunded,
    /// Split between sender and recipient
    PartiallyRefunded,
    /// Frozen by an active dispute
    Disputed,
    /// Withdrawn by the sender or funding failed
    Cancelled,
    /// Never funded before its expiry
    Expired,
}

impl EscrowStatus {
    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Released
                | Self::Refunded
                | Self::PartiallyRefunded
                | Self::Cancelled
                | Self::Expired
        )
    }

    /// Check if funds are sitting in the escrow account
    pub fn is_holding(&self) -> bool {
        matches!(
            self,
            Self::Held | Self::ProofPending | Self::ProofVerified | Self::Disputed
        )
    }

    /// States from which a dispute may be opened
    pub fn can_dispute(&self) -> bool {
        matches!(self, Self::Held | Self::ProofPending | Self::ProofVerified)
    }

    /// States from which a refund or partial refund may be issued
    pub fn can_refund(&self) -> bool {
        matches!(self, Self::Held | Self::ProofPending)
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Held => "held",
            Self::ProofPending => "proof_pending",
            Self::ProofVerified => "proof_verified",
            Self::Released => "released",
            Self::Refunded => "refunded",
            Self::PartiallyRefunded => "partially_refunded",
            Self::Disputed => "disputed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// An escrowed payment between two accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowTransaction {
    pub id: EscrowId,
    /// Account that funded the escrow
    pub sender: AccountId,
    /// Account paid on release
    pub recipient: AccountId,
    /// Base amount before commission, in `currency`
    pub amount: Decimal,
    pub currency: Currency,
    /// Currency the recipient is paid in
    pub settlement_currency: Currency,
    /// What the recipient receives on full release, in `settlement_currency`
    pub settlement_amount: Decimal,
    /// Effective conversion rate fixed at creation (buffer included)
    pub exchange_rate_used: Decimal,
    pub release_condition: ReleaseCondition,
    pub required_proof: Option<ProofType>,
    pub proof_required: bool,
    pub transfer_delay_hours: u32,
    pub expires_at: DateTime<Utc>,
    pub proof_submitted: bool,
    pub proof_verified: bool,
    #[serde(default)]
    pub proof_evidence: Vec<Evidence>,
    pub proof_rejections: u32,
    pub last_rejection_reason: Option<String>,
    pub status: EscrowStatus,
    pub released_by: Option<AccountId>,
    /// Share of `amount` paid out to the recipient, in `currency`
    pub released_amount: Decimal,
    /// Share of `amount` returned to the sender, in `currency`
    pub refunded_amount: Decimal,
    /// Giver commission handed back to the sender with a refund
    #[serde(default)]
    pub commission_returned: Decimal,
    pub service_fee_retained: Decimal,
    /// Why the escrow was refunded, cancelled or expired
    #[serde(default)]
    pub closing_reason: Option<String>,
    /// Commission split frozen at creation
    pub commission: CommissionSplit,
    pub status_before_dispute: Option<EscrowStatus>,
    pub active_dispute: Option<DisputeId>,
    pub dispute_count: u32,
    /// Optimistic concurrency version, bumped on every commit
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscrowTransaction {
    /// Total held in the escrow account while funded
    pub fn held_amount(&self) -> Decimal {
        self.commission.giver_pays
    }

    /// Released and refunded shares never exceed the base amount
    pub fn settled_within_amount(&self) -> bool {
        self.released_amount >= Decimal::ZERO
            && self.refunded_amount >= Decimal::ZERO
            && self.released_amount + self.refunded_amount <= self.amount
    }

    /// Whether the hold has run past its expiry
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether a release is currently allowed by the proof rules
    pub fn is_releasable(&self) -> bool {
        match self.status {
            EscrowStatus::ProofVerified => true,
            EscrowStatus::Held => !self.proof_required,
            _ => false,
        }
    }

    /// Whether the expiry sweep should release rather than refund
    pub fn auto_releases_on_expiry(&self) -> bool {
        self.status == EscrowStatus::ProofVerified
            || (self.release_condition == ReleaseCondition::Auto && !self.proof_required)
    }

    pub fn is_party(&self, account: &AccountId) -> bool {
        &self.sender == account || &self.recipient == account
    }

    /// The other party of the escrow, if `account` is one of them
    pub fn counterparty(&self, account: &AccountId) -> Option<&AccountId> {
        if &self.sender == account {
            Some(&self.recipient)
        } else if &self.recipient == account {
            Some(&self.sender)
        } else {
            None
        }
    }
}

/// Request to create an escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateEscrowRequest {
    pub sender: AccountId,
    pub recipient: AccountId,
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(default)]
    pub settlement_currency: Option<Currency>,
    pub release_condition: ReleaseCondition,
    #[serde(default)]
    pub buffer_profile: Option<String>,
}
