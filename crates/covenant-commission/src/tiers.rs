//! Commission tier tables
//!
//! | Tier       | Amount (base ccy) | Giver | Receiver | Total |
//! |------------|-------------------|-------|----------|-------|
//! | micro      | < 100             | 7%    | 5%       | 12%   |
//! | standard   | 100 - 5K          | 6%    | 4%       | 10%   |
//! | premium    | 5K - 50K          | 5%    | 3%       | 8%    |
//! | enterprise | > 50K             | 3.5%  | 2.5%     | 6%    |

use covenant_types::{CommissionTier, CovenantError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;

/// The schedule used when no tiers are configured
pub fn default_tiers() -> Vec<CommissionTier> {
    vec![
        tier("micro", dec!(0), Some(dec!(100)), dec!(0.07), dec!(0.05)),
        tier("standard", dec!(100), Some(dec!(5000)), dec!(0.06), dec!(0.04)),
        tier("premium", dec!(5000), Some(dec!(50000)), dec!(0.05), dec!(0.03)),
        tier("enterprise", dec!(50000), None, dec!(0.035), dec!(0.025)),
    ]
}

fn tier(
    name: &str,
    min: Decimal,
    max: Option<Decimal>,
    giver: Decimal,
    receiver: Decimal,
) -> CommissionTier {
    CommissionTier {
        name: name.to_string(),
        min_amount: min,
        max_amount: max,
        giver_share: giver,
        receiver_share: receiver,
        total_rate: giver + receiver,
    }
}

/// Check that a rate is a fraction in `[0, 1)`
pub(crate) fn check_share(field: &str, value: Decimal) -> std::result::Result<(), String> {
    if value < Decimal::ZERO || value >= Decimal::ONE {
        return Err(format!("{field} {value} must be within [0, 1)"));
    }
    Ok(())
}

/// Check that `total == giver + receiver`
pub(crate) fn check_total(
    giver: Decimal,
    receiver: Decimal,
    total: Decimal,
) -> std::result::Result<(), String> {
    if giver + receiver != total {
        return Err(format!(
            "total_rate {total} does not equal giver {giver} + receiver {receiver}"
        ));
    }
    Ok(())
}

/// Validate a tier table
///
/// Tiers must start at zero, be ordered, contiguous and non-overlapping.
/// Only the last tier may be unbounded.
pub fn validate_tiers(tiers: &[CommissionTier]) -> Result<()> {
    let invalid = |reason: String| CovenantError::InvalidTierConfiguration { reason };

    let first = tiers
        .first()
        .ok_or_else(|| invalid("tier table is empty".to_string()))?;
    if first.min_amount != Decimal::ZERO {
        return Err(invalid(format!(
            "first tier {} starts at {} instead of 0",
            first.name, first.min_amount
        )));
    }

    let mut names = HashSet::new();
    for (idx, t) in tiers.iter().enumerate() {
        if !names.insert(t.name.as_str()) {
            return Err(invalid(format!("duplicate tier name {}", t.name)));
        }
        check_share("giver_share", t.giver_share).map_err(invalid)?;
        check_share("receiver_share", t.receiver_share).map_err(invalid)?;
        check_total(t.giver_share, t.receiver_share, t.total_rate)
            .map_err(|r| invalid(format!("tier {}: {r}", t.name)))?;

        let is_last = idx + 1 == tiers.len();
        match (t.max_amount, tiers.get(idx + 1)) {
            (Some(max), _) if max <= t.min_amount => {
                return Err(invalid(format!("tier {} has an empty range", t.name)));
            }
            (Some(max), Some(next)) if next.min_amount != max => {
                return Err(invalid(format!(
                    "gap or overlap between {} (ends {}) and {} (starts {})",
                    t.name, max, next.name, next.min_amount
                )));
            }
            (None, _) if !is_last => {
                return Err(invalid(format!(
                    "tier {} is unbounded but is not the last tier",
                    t.name
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

/// Tier whose range contains the amount; amounts above every bound use the
/// highest tier
pub fn select_tier(tiers: &[CommissionTier], amount: Decimal) -> Option<&CommissionTier> {
    tiers
        .iter()
        .find(|t| t.contains(amount))
        .or_else(|| tiers.last())
}
