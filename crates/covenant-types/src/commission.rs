//! Commission records
//!
//! Tier definitions, per-account overrides, the computed split, and the
//! immutable ledger entry appended once a transaction settles.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{AccountId, CommissionEntryId, Currency, EscrowId};

/// One amount band of the commission schedule
///
/// Covers `[min_amount, max_amount)` of the base-currency amount. A missing
/// `max_amount` means the band is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionTier {
    pub name: String,
    pub min_amount: Decimal,
    #[serde(default)]
    pub max_amount: Option<Decimal>,
    pub giver_share: Decimal,
    pub receiver_share: Decimal,
    pub total_rate: Decimal,
}

impl CommissionTier {
    /// Whether the tier's range contains the amount
    pub fn contains(&self, amount: Decimal) -> bool {
        amount >= self.min_amount && self.max_amount.map_or(true, |max| amount < max)
    }
}

/// Per-account custom commission arrangement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCommissionOverride {
    pub account: AccountId,
    pub custom_rate_enabled: bool,
    pub giver_share: Decimal,
    pub receiver_share: Decimal,
    pub total_rate: Decimal,
    /// Lifts the proof requirement for escrows paid to this account
    pub fast_release_enabled: bool,
    /// Replaces the proof tier's transfer delay
    pub custom_escrow_hours: Option<u32>,
    pub active: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl UserCommissionOverride {
    /// Whether the override applies at the given instant
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.valid_from.map_or(true, |from| now >= from)
            && self.valid_until.map_or(true, |until| now < until)
    }

    /// Whether the override replaces the tier rates
    pub fn supersedes_rates_at(&self, now: DateTime<Utc>) -> bool {
        self.custom_rate_enabled && self.is_active_at(now)
    }
}

/// Where the applied rates came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RateBasis {
    TierLookup { tier: String },
    Override { account: AccountId },
}

/// Computed commission split for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSplit {
    pub tier_name: String,
    pub base_amount: Decimal,
    pub currency: Currency,
    /// Amount in the engine's base currency used for tier selection
    pub normalized_amount: Decimal,
    pub giver_share: Decimal,
    pub receiver_share: Decimal,
    pub total_rate: Decimal,
    pub giver_commission: Decimal,
    pub receiver_commission: Decimal,
    pub total_commission: Decimal,
    pub platform_revenue: Decimal,
    /// `total_commission - round(base_amount * total_rate)`, absorbed by the platform
    pub rounding_residual: Decimal,
    pub giver_pays: Decimal,
    pub receiver_gets: Decimal,
    pub basis: RateBasis,
}

impl CommissionSplit {
    pub fn is_override(&self) -> bool {
        matches!(self.basis, RateBasis::Override { .. })
    }

    /// Recompute the split for part of the base amount at the frozen rates
    pub fn for_portion(&self, portion: Decimal) -> CommissionSplit {
        let giver_commission = self.currency.round(portion * self.giver_share);
        let receiver_commission = self.currency.round(portion * self.receiver_share);
        let total_commission = giver_commission + receiver_commission;
        CommissionSplit {
            base_amount: portion,
            giver_commission,
            receiver_commission,
            total_commission,
            platform_revenue: total_commission,
            rounding_residual: total_commission - self.currency.round(portion * self.total_rate),
            giver_pays: portion + giver_commission,
            receiver_gets: portion - receiver_commission,
            ..self.clone()
        }
    }
}

/// Lifecycle of a commission ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionStatus {
    Pending,
    Collected,
    Transferred,
}

/// Immutable record of a settled commission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionLedgerEntry {
    pub id: CommissionEntryId,
    pub escrow_id: EscrowId,
    pub base_amount: Decimal,
    pub currency: Currency,
    pub giver_commission: Decimal,
    pub receiver_commission: Decimal,
    pub platform_revenue: Decimal,
    pub rounding_residual: Decimal,
    pub tier_name: String,
    pub is_vip: bool,
    pub status: CommissionStatus,
    pub created_at: DateTime<Utc>,
    pub collected_at: Option<DateTime<Utc>>,
    pub transferred_at: Option<DateTime<Utc>>,
}

impl CommissionLedgerEntry {
    /// Create a pending entry from a settled split
    pub fn pending(escrow_id: EscrowId, split: &CommissionSplit, now: DateTime<Utc>) -> Self {
        Self {
            id: CommissionEntryId::new(),
            escrow_id,
            base_amount: split.base_amount,
            currency: split.currency,
            giver_commission: split.giver_commission,
            receiver_commission: split.receiver_commission,
            platform_revenue: split.platform_revenue,
            rounding_residual: split.rounding_residual,
            tier_name: split.tier_name.clone(),
            is_vip: split.is_override(),
            status: CommissionStatus::Pending,
            created_at: now,
            collected_at: None,
            transferred_at: None,
        }
    }
}
