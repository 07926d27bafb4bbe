//! Covenant Commission Engine
//!
//! Tiered, currency-aware commission math for escrowed payments.
//!
//! The giver pays `amount + giver_commission`, the receiver gets
//! `amount - receiver_commission`, and the platform keeps the difference.
//! Both commissions are rounded separately to the currency's minor unit with
//! banker's rounding; the residual against the rounded total rate is recorded
//! on every split.

pub mod engine;
pub mod ledger;
pub mod tiers;

pub use engine::{compute_split, CommissionConfig, CommissionEngine};
pub use ledger::CommissionLedger;
pub use tiers::{default_tiers, select_tier, validate_tiers};
