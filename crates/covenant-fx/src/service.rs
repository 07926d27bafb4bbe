//! Currency Conversion Service
//!
//! Looks up the freshest rate for a pair (direct quote first, inverse quote
//! second), flags stale observations, and fixes buffered settlement amounts.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use covenant_types::{CovenantError, Currency, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::rates::{ExchangeRate, RateSource};

/// Safety margin applied when fixing a settlement amount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyBufferConfig {
    pub profile: String,
    /// Fraction added on top of the rate, e.g. 0.02 for 2%
    pub buffer_percentage: Decimal,
}

/// Conversion service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FxConfig {
    /// Currency commission tiers and escrow limits are expressed in
    #[serde(default = "default_base_currency")]
    pub base_currency: Currency,

    /// Rates older than this are flagged stale
    #[serde(default = "default_staleness_secs")]
    pub staleness_window_secs: u64,

    /// Time budget for a single rate lookup
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,

    /// Lookup attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay, doubled on each attempt
    #[serde(default = "default_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default)]
    pub buffer_profiles: Vec<CurrencyBufferConfig>,
}

fn default_base_currency() -> Currency {
    Currency::EUR
}

fn default_staleness_secs() -> u64 {
    900
}

fn default_lookup_timeout_ms() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    50
}

impl Default for FxConfig {
    fn default() -> Self {
        Self {
            base_currency: default_base_currency(),
            staleness_window_secs: default_staleness_secs(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_backoff_ms(),
            buffer_profiles: Vec::new(),
        }
    }
}

impl FxConfig {
    pub fn staleness_window(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.staleness_window_secs as i64)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.initial_backoff_ms.saturating_mul(factor))
    }

    pub fn buffer_for(&self, profile: &str) -> Option<Decimal> {
        self.buffer_profiles
            .iter()
            .find(|p| p.profile == profile)
            .map(|p| p.buffer_percentage)
    }
}

/// Result of a conversion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    /// Amount in the target currency, rounded to its minor unit
    pub converted_amount: Decimal,
    /// Effective rate applied (buffer included)
    pub rate_used: Decimal,
    /// Whether the underlying rate is older than the staleness window
    pub is_stale: bool,
    pub rate_as_of: DateTime<Utc>,
}

/// Currency conversion over a pluggable rate source
pub struct ConversionService {
    source: Arc<dyn RateSource>,
    config: RwLock<FxConfig>,
}

impl ConversionService {
    pub fn new(source: Arc<dyn RateSource>, config: FxConfig) -> Self {
        Self {
            source,
            config: RwLock::new(config),
        }
    }

    pub fn base_currency(&self) -> Currency {
        self.config.read().base_currency
    }

    /// Swap the configuration (buffer profiles, budgets) at runtime
    pub fn update_config(&self, config: FxConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> FxConfig {
        self.config.read().clone()
    }

    /// Convert at the freshest mid rate at or before `as_of`
    pub async fn convert(
        &self,
        amount: Decimal,
        from: Currency,
        to: Currency,
        as_of: DateTime<Utc>,
    ) -> Result<Conversion> {
        self.convert_inner(amount, from, to, as_of, Decimal::ZERO).await
    }

    /// Convert and add the named profile's buffer on top of the rate
    ///
    /// No profile means no buffer. An unknown profile is rejected before any
    /// rate lookup.
    pub async fn convert_with_buffer(
        &self,
        amount: Decimal,
        from: Currency,
        to: Currency,
        as_of: DateTime<Utc>,
        profile: Option<&str>,
    ) -> Result<Conversion> {
        let buffer = match profile {
            Some(name) => self.config.read().buffer_for(name).ok_or_else(|| {
                CovenantError::validation("buffer_profile", format!("unknown profile {name}"))
            })?,
            None => Decimal::ZERO,
        };
        self.convert_inner(amount, from, to, as_of, buffer).await
    }

    async fn convert_inner(
        &self,
        amount: Decimal,
        from: Currency,
        to: Currency,
        as_of: DateTime<Utc>,
        buffer: Decimal,
    ) -> Result<Conversion> {
        if from == to {
            return Ok(Conversion {
                converted_amount: amount,
                rate_used: Decimal::ONE,
                is_stale: false,
                rate_as_of: as_of,
            });
        }

        let rate = self.lookup(from, to, as_of).await?;
        let staleness = self.config.read().staleness_window();
        let is_stale = as_of - rate.as_of > staleness;
        if is_stale {
            warn!(
                from = %from,
                to = %to,
                rate_as_of = %rate.as_of,
                "Using stale exchange rate"
            );
        }

        let rate_used = rate.mid * (Decimal::ONE + buffer);
        Ok(Conversion {
            converted_amount: to.round(amount * rate_used),
            rate_used,
            is_stale,
            rate_as_of: rate.as_of,
        })
    }

    /// Freshest rate for the pair across the direct and inverse quotes
    ///
    /// Ties go to the direct quote. A failed lookup in one direction is
    /// tolerated when the other direction produced a rate.
    pub async fn lookup(
        &self,
        from: Currency,
        to: Currency,
        as_of: DateTime<Utc>,
    ) -> Result<ExchangeRate> {
        let direct = self.fetch(from, to, as_of).await;
        let inverse = self
            .fetch(to, from, as_of)
            .await
            .map(|rate| rate.map(|r| r.inverted()));

        match (direct, inverse) {
            (Ok(Some(direct)), Ok(Some(inverse))) => {
                if inverse.as_of > direct.as_of {
                    debug!(from = %from, to = %to, "Inverse quote is fresher");
                    Ok(inverse)
                } else {
                    Ok(direct)
                }
            }
            (Ok(Some(direct)), _) => Ok(direct),
            (_, Ok(Some(inverse))) => {
                debug!(from = %from, to = %to, "Using inverse quote");
                Ok(inverse)
            }
            (Err(e), _) | (_, Err(e)) => Err(e),
            (Ok(None), Ok(None)) => Err(stale(from, to)),
        }
    }

    /// One pair lookup with timeout and exponential backoff
    async fn fetch(
        &self,
        base: Currency,
        target: Currency,
        as_of: DateTime<Utc>,
    ) -> Result<Option<ExchangeRate>> {
        let config = self.config();
        let attempts = config.max_attempts.max(1);

        for attempt in 1..=attempts {
            let outcome =
                tokio::time::timeout(config.lookup_timeout(), self.source.latest(base, target, as_of))
                    .await;
            match outcome {
                Ok(Ok(rate)) => return Ok(rate),
                Ok(Err(e)) if !e.is_retriable() => return Err(e),
                Ok(Err(e)) => {
                    warn!(base = %base, target = %target, attempt, error = %e, "Rate lookup failed");
                }
                Err(_) => {
                    warn!(base = %base, target = %target, attempt, "Rate lookup timed out");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(config.backoff_for_attempt(attempt)).await;
            }
        }

        Err(stale(base, target))
    }
}

fn stale(from: Currency, to: Currency) -> CovenantError {
    CovenantError::StaleExchangeRate {
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rates::RateBook;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn service_with(book: Arc<RateBook>) -> ConversionService {
        let config = FxConfig {
            buffer_profiles: vec![CurrencyBufferConfig {
                profile: "standard".to_string(),
                buffer_percentage: dec!(0.02),
            }],
            ..FxConfig::default()
        };
        ConversionService::new(book, config)
    }

    #[tokio::test]
    async fn test_same_currency_is_identity() {
        let service = service_with(Arc::new(RateBook::new()));
        let conv = service
            .convert(dec!(12.34), Currency::EUR, Currency::EUR, Utc::now())
            .await
            .unwrap();
        assert_eq!(conv.converted_amount, dec!(12.34));
        assert_eq!(conv.rate_used, Decimal::ONE);
        assert!(!conv.is_stale);
    }

    #[tokio::test]
    async fn test_inverse_pair_and_staleness() {
        let book = Arc::new(RateBook::new());
        let now = Utc::now();
        book.record_rate(ExchangeRate::new(
            Currency::USD,
            Currency::EUR,
            dec!(0.8),
            now - ChronoDuration::hours(2),
        ))
        .unwrap();
        let service = service_with(book);

        let conv = service
            .convert(dec!(100), Currency::EUR, Currency::USD, now)
            .await
            .unwrap();
        assert_eq!(conv.converted_amount, dec!(125.00));
        assert!(conv.is_stale);
    }

    #[tokio::test]
    async fn test_fresher_inverse_quote_wins_over_stale_direct() {
        let book = Arc::new(RateBook::new());
        let now = Utc::now();
        book.record_rate(ExchangeRate::new(
            Currency::EUR,
            Currency::USD,
            dec!(1.00),
            now - ChronoDuration::hours(24),
        ))
        .unwrap();
        book.record_rate(ExchangeRate::new(Currency::USD, Currency::EUR, dec!(0.8), now))
            .unwrap();
        let service = service_with(book);

        let conv = service
            .convert(dec!(100), Currency::EUR, Currency::USD, now)
            .await
            .unwrap();
        assert_eq!(conv.converted_amount, dec!(125.00));
        assert_eq!(conv.rate_as_of, now);
        assert!(!conv.is_stale);
    }

    #[tokio::test]
    async fn test_fresher_direct_quote_wins_over_inverse() {
        let book = Arc::new(RateBook::new());
        let now = Utc::now();
        book.record_rate(ExchangeRate::new(
            Currency::USD,
            Currency::EUR,
            dec!(0.8),
            now - ChronoDuration::hours(24),
        ))
        .unwrap();
        book.record_rate(ExchangeRate::new(Currency::EUR, Currency::USD, dec!(1.10), now))
            .unwrap();
        let service = service_with(book);

        let conv = service
            .convert(dec!(100), Currency::EUR, Currency::USD, now)
            .await
            .unwrap();
        assert_eq!(conv.converted_amount, dec!(110.00));
        assert!(!conv.is_stale);
    }

    #[tokio::test]
    async fn test_buffer_applied_and_rounded() {
        let book = Arc::new(RateBook::new());
        let now = Utc::now();
        book.record_rate(ExchangeRate::new(Currency::EUR, Currency::TRY, dec!(35), now))
            .unwrap();
        let service = service_with(book);

        let conv = service
            .convert_with_buffer(dec!(10), Currency::EUR, Currency::TRY, now, Some("standard"))
            .await
            .unwrap();
        assert_eq!(conv.converted_amount, dec!(357.00));
        assert_eq!(conv.rate_used, dec!(35.70));

        let err = service
            .convert_with_buffer(dec!(10), Currency::EUR, Currency::TRY, now, Some("vip"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_missing_rate_is_stale_error() {
        let service = service_with(Arc::new(RateBook::new()));
        let err = service
            .convert(dec!(1), Currency::GBP, Currency::JPY, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CovenantError::StaleExchangeRate { .. }));
    }

    struct FlakySource {
        failures: AtomicU32,
        book: RateBook,
    }

    #[async_trait]
    impl RateSource for FlakySource {
        async fn latest(
            &self,
            base: Currency,
            target: Currency,
            as_of: DateTime<Utc>,
        ) -> Result<Option<ExchangeRate>> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                return Err(CovenantError::unavailable("rates", "upstream reset"));
            }
            self.book.latest(base, target, as_of).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let now = Utc::now();
        let book = RateBook::new();
        book.record_rate(ExchangeRate::new(Currency::EUR, Currency::GBP, dec!(0.85), now))
            .unwrap();
        let source = Arc::new(FlakySource {
            failures: AtomicU32::new(2),
            book,
        });
        let service = ConversionService::new(source, FxConfig::default());

        let conv = service
            .convert(dec!(100), Currency::EUR, Currency::GBP, now)
            .await
            .unwrap();
        assert_eq!(conv.converted_amount, dec!(85.00));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_surface_stale() {
        let source = Arc::new(FlakySource {
            failures: AtomicU32::new(10),
            book: RateBook::new(),
        });
        let service = ConversionService::new(source, FxConfig::default());
        let err = service
            .convert(dec!(100), Currency::EUR, Currency::GBP, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, CovenantError::StaleExchangeRate { .. }));
    }
}
