//! Currency types and minor-unit rounding
//!
//! Every settlement amount is rounded to the minor unit of its currency using
//! banker's rounding (round half to even).

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CovenantError;

/// Settlement currencies (ISO 4217)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Currency {
    USD,
    EUR,
    GBP,
    TRY,
    CHF,
    JPY,
    KRW,
    CAD,
    AUD,
    SEK,
    NOK,
    AED,
    KWD,
    BHD,
}

impl Currency {
    /// All supported currencies
    pub const ALL: [Currency; 14] = [
        Self::USD,
        Self::EUR,
        Self::GBP,
        Self::TRY,
        Self::CHF,
        Self::JPY,
        Self::KRW,
        Self::CAD,
        Self::AUD,
        Self::SEK,
        Self::NOK,
        Self::AED,
        Self::KWD,
        Self::BHD,
    ];

    /// Number of decimal places of the minor unit
    pub fn minor_units(&self) -> u32 {
        match self {
            Self::JPY | Self::KRW => 0,
            Self::KWD | Self::BHD => 3,
            _ => 2,
        }
    }

    /// Get the ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Self::USD => "USD",
            Self::EUR => "EUR",
            Self::GBP => "GBP",
            Self::TRY => "TRY",
            Self::CHF => "CHF",
            Self::JPY => "JPY",
            Self::KRW => "KRW",
            Self::CAD => "CAD",
            Self::AUD => "AUD",
            Self::SEK => "SEK",
            Self::NOK => "NOK",
            Self::AED => "AED",
            Self::KWD => "KWD",
            Self::BHD => "BHD",
        }
    }

    /// Round a value to this currency's minor unit (banker's rounding)
    pub fn round(&self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(self.minor_units(), RoundingStrategy::MidpointNearestEven)
    }

    /// One minor unit, e.g. 0.01 for EUR
    pub fn minor_unit(&self) -> Decimal {
        Decimal::new(1, self.minor_units())
    }

    /// Whether the value is representable without sub-minor-unit fractions
    pub fn is_representable(&self, value: Decimal) -> bool {
        value.normalize().scale() <= self.minor_units()
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = CovenantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.code() == upper)
            .ok_or_else(|| CovenantError::validation("currency", format!("unsupported currency {s}")))
    }
}

/// An amount tagged with its currency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount: Decimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::new(Decimal::ZERO, currency)
    }

    /// Round to the minor unit of the currency
    pub fn rounded(self) -> Self {
        Self::new(self.currency.round(self.amount), self.currency)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.*} {}",
            self.currency.minor_units() as usize,
            self.amount,
            self.currency
        )
    }
}
