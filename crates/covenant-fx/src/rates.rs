//! Exchange rate snapshots and rate sources

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use covenant_types::{CovenantError, Currency, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A rate observation for one currency pair
///
/// `mid` converts one unit of `base` into `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub base: Currency,
    pub target: Currency,
    pub mid: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub as_of: DateTime<Utc>,
}

impl ExchangeRate {
    pub fn new(base: Currency, target: Currency, mid: Decimal, as_of: DateTime<Utc>) -> Self {
        Self {
            base,
            target,
            mid,
            bid: mid,
            ask: mid,
            as_of,
        }
    }

    /// Reject non-positive prices and crossed quotes
    pub fn validate(&self) -> Result<()> {
        if self.base == self.target {
            return Err(CovenantError::validation("rate", "base and target are the same"));
        }
        if self.mid <= Decimal::ZERO || self.bid <= Decimal::ZERO || self.ask <= Decimal::ZERO {
            return Err(CovenantError::validation("rate", "rates must be positive"));
        }
        if self.bid > self.ask {
            return Err(CovenantError::validation("rate", "bid exceeds ask"));
        }
        Ok(())
    }

    /// The same observation quoted the other way round
    pub fn inverted(&self) -> Self {
        Self {
            base: self.target,
            target: self.base,
            mid: Decimal::ONE / self.mid,
            bid: Decimal::ONE / self.ask,
            ask: Decimal::ONE / self.bid,
            as_of: self.as_of,
        }
    }
}

/// Provider of rate snapshots
#[async_trait]
pub trait RateSource: Send + Sync {
    /// Newest snapshot for the exact pair at or before `as_of`
    async fn latest(
        &self,
        base: Currency,
        target: Currency,
        as_of: DateTime<Utc>,
    ) -> Result<Option<ExchangeRate>>;
}

/// In-memory rate store retaining every snapshot
#[derive(Debug, Default)]
pub struct RateBook {
    snapshots: RwLock<HashMap<(Currency, Currency), Vec<ExchangeRate>>>,
}

impl RateBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a snapshot, keeping each pair ordered by time
    pub fn record_rate(&self, rate: ExchangeRate) -> Result<()> {
        rate.validate()?;
        let mut snapshots = self.snapshots.write();
        let series = snapshots.entry((rate.base, rate.target)).or_default();
        let idx = series.partition_point(|r| r.as_of <= rate.as_of);
        series.insert(idx, rate);
        Ok(())
    }

    /// Newest snapshot at or before `as_of`
    pub fn latest_at(
        &self,
        base: Currency,
        target: Currency,
        as_of: DateTime<Utc>,
    ) -> Option<ExchangeRate> {
        let snapshots = self.snapshots.read();
        let series = snapshots.get(&(base, target))?;
        let idx = series.partition_point(|r| r.as_of <= as_of);
        idx.checked_sub(1).map(|i| series[i].clone())
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl RateSource for RateBook {
    async fn latest(
        &self,
        base: Currency,
        target: Currency,
        as_of: DateTime<Utc>,
    ) -> Result<Option<ExchangeRate>> {
        Ok(self.latest_at(base, target, as_of))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn test_latest_at_ignores_future_snapshots() {
        let book = RateBook::new();
        let t0 = Utc::now();
        book.record_rate(ExchangeRate::new(Currency::EUR, Currency::TRY, dec!(35), t0))
            .unwrap();
        book.record_rate(ExchangeRate::new(
            Currency::EUR,
            Currency::TRY,
            dec!(36),
            t0 + Duration::hours(1),
        ))
        .unwrap();

        let rate = book
            .latest_at(Currency::EUR, Currency::TRY, t0 + Duration::minutes(30))
            .unwrap();
        assert_eq!(rate.mid, dec!(35));
        assert!(book
            .latest_at(Currency::EUR, Currency::TRY, t0 - Duration::minutes(1))
            .is_none());
    }

    #[test]
    fn test_rejects_crossed_quote() {
        let book = RateBook::new();
        let mut rate = ExchangeRate::new(Currency::USD, Currency::EUR, dec!(0.9), Utc::now());
        rate.bid = dec!(0.95);
        rate.ask = dec!(0.91);
        assert!(book.record_rate(rate).is_err());
        assert_eq!(book.snapshot_count(), 0);
    }

    #[test]
    fn test_inverted_swaps_sides() {
        let mut rate = ExchangeRate::new(Currency::EUR, Currency::USD, dec!(1.25), Utc::now());
        rate.bid = dec!(1.0);
        rate.ask = dec!(2.0);
        let inv = rate.inverted();
        assert_eq!(inv.base, Currency::USD);
        assert_eq!(inv.mid, dec!(0.8));
        assert_eq!(inv.bid, dec!(0.5));
        assert_eq!(inv.ask, dec!(1));
    }
}
