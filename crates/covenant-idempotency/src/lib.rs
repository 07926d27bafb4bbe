//! Covenant Idempotency Ledger
//!
//! Every money-moving operation runs through [`IdempotencyLedger::execute`]:
//!
//! 1. acquire the per-entity lock (bounded wait)
//! 2. replay the cached result if the key was seen with the same request
//! 3. otherwise run the operation once with a [`SettlementPermit`]
//! 4. persist the serialized success; failures are never cached

pub mod ledger;
pub mod store;

pub use ledger::{
    fingerprint, Disposition, Executed, IdempotencyConfig, IdempotencyLedger, SettlementPermit,
};
pub use store::{IdempotencyRecord, IdempotencyStore, InMemoryIdempotencyStore};
