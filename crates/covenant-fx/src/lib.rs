//! Covenant FX - Currency conversion for escrow settlement
//!
//! - [`RateBook`]: in-memory store of rate snapshots
//! - [`RateSource`]: async seam for external rate providers
//! - [`ConversionService`]: direct/inverse lookup, staleness, buffered fixing

pub mod rates;
pub mod service;

pub use rates::{ExchangeRate, RateBook, RateSource};
pub use service::{Conversion, ConversionService, CurrencyBufferConfig, FxConfig};
