//! Covenant Types - Shared domain types for the escrow settlement engine
//!
//! This crate has no dependencies on other covenant crates. It defines:
//!
//! - Identity types (EscrowId, DisputeId, AccountId, ...)
//! - Currencies and minor-unit rounding
//! - Escrow, dispute and commission records
//! - The error taxonomy shared by every component
//! - The clock abstraction used for deadlines
//!
//! # Settlement Flow
//!
//! ```text
//! create → risk gate → commission split → FX fixing → hold
//!        → release | refund | partial refund | dispute → resolution
//! ```

pub mod clock;
pub mod commission;
pub mod currency;
pub mod dispute;
pub mod error;
pub mod escrow;
pub mod identity;

pub use clock::*;
pub use commission::*;
pub use currency::*;
pub use dispute::*;
pub use error::*;
pub use escrow::*;
pub use identity::*;
