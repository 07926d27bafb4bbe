//! Covenant Escrow - Escrow lifecycle, disputes and treasury movements
//!
//! Funds never move directly between parties. The sender's payment is held in
//! a per-escrow treasury account and leaves it only through a settlement:
//!
//! - **Release**: the recipient is paid net of its commission share
//! - **Refund**: the sender gets everything back
//! - **Partial refund**: split between both, commission recomputed on the remainder
//!
//! Every mutation is idempotent and serialized per escrow by the
//! [`covenant_idempotency::IdempotencyLedger`].

pub mod config;
pub mod dispute;
pub mod lifecycle;
pub mod store;
pub mod treasury;

pub use config::{DisputeConfig, EscrowConfig, ProofRequirementTier, ProofScoring};
pub use dispute::DisputeOutcome;
pub use lifecycle::{EscrowManager, EscrowServices, EvidenceInput, OpenDisputeRequest};
pub use store::{InMemorySettlementStore, SettlementStore, Write};
pub use treasury::{InMemoryTreasury, Leg, Treasury, TreasuryAccount};
