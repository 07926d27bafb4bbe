//! Covenant Reconciler - time-driven settlement sweeps
//!
//! Each sweep expires unfunded escrows, settles escrows past their hold,
//! enforces dispute deadlines, collects pending commission, and trims the
//! idempotency and risk logs.

pub mod sweep;

pub use sweep::{Reconciler, ReconcilerConfig, SweepReport};
