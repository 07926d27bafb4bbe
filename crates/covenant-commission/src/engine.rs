//! Commission Rules Engine
//!
//! Resolves the rate basis for a transaction (payee override or amount tier)
//! and computes the giver/receiver split with banker's rounding in the
//! transaction currency.

use chrono::{DateTime, Utc};
use covenant_fx::ConversionService;
use covenant_types::{
    AccountId, CommissionSplit, CommissionTier, CovenantError, Currency, RateBasis, Result,
    UserCommissionOverride,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::tiers::{check_share, check_total, default_tiers, select_tier, validate_tiers};

/// Commission engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionConfig {
    #[serde(default = "default_tiers")]
    pub tiers: Vec<CommissionTier>,

    /// Accept a stale normalization rate for tier selection
    #[serde(default)]
    pub accept_stale_normalization: bool,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            accept_stale_normalization: false,
        }
    }
}

/// Compute a split for the given rates
///
/// `platform_revenue = giver_pays - receiver_gets = total_commission`. The
/// rounding residual against `round(amount * total_rate)` is recorded.
#[allow(clippy::too_many_arguments)]
pub fn compute_split(
    amount: Decimal,
    currency: Currency,
    normalized_amount: Decimal,
    tier_name: &str,
    giver_share: Decimal,
    receiver_share: Decimal,
    total_rate: Decimal,
    basis: RateBasis,
) -> CommissionSplit {
    let giver_commission = currency.round(amount * giver_share);
    let receiver_commission = currency.round(amount * receiver_share);
    let total_commission = giver_commission + receiver_commission;
    let giver_pays = amount + giver_commission;
    let receiver_gets = amount - receiver_commission;

    CommissionSplit {
        tier_name: tier_name.to_string(),
        base_amount: amount,
        currency,
        normalized_amount,
        giver_share,
        receiver_share,
        total_rate,
        giver_commission,
        receiver_commission,
        total_commission,
        platform_revenue: giver_pays - receiver_gets,
        rounding_residual: total_commission - currency.round(amount * total_rate),
        giver_pays,
        receiver_gets,
        basis,
    }
}

/// Tiered commission engine with per-account overrides
pub struct CommissionEngine {
    fx: Arc<ConversionService>,
    tiers: RwLock<Arc<Vec<CommissionTier>>>,
    overrides: RwLock<HashMap<AccountId, UserCommissionOverride>>,
    accept_stale_normalization: RwLock<bool>,
}

impl CommissionEngine {
    /// Create an engine, validating the tier table up front
    pub fn new(fx: Arc<ConversionService>, config: CommissionConfig) -> Result<Self> {
        validate_tiers(&config.tiers)?;
        Ok(Self {
            fx,
            tiers: RwLock::new(Arc::new(config.tiers)),
            overrides: RwLock::new(HashMap::new()),
            accept_stale_normalization: RwLock::new(config.accept_stale_normalization),
        })
    }

    /// Swap the tier table at runtime
    ///
    /// An invalid table is rejected and the current one stays in force.
    pub fn replace_tiers(&self, tiers: Vec<CommissionTier>) -> Result<()> {
        validate_tiers(&tiers)?;
        info!(count = tiers.len(), "Replacing commission tiers");
        *self.tiers.write() = Arc::new(tiers);
        Ok(())
    }

    /// Apply a reloaded configuration
    pub fn reload(&self, config: CommissionConfig) -> Result<()> {
        self.replace_tiers(config.tiers)?;
        *self.accept_stale_normalization.write() = config.accept_stale_normalization;
        Ok(())
    }

    pub fn tiers(&self) -> Arc<Vec<CommissionTier>> {
        self.tiers.read().clone()
    }

    /// Register or replace an account's override
    pub fn set_override(&self, ov: UserCommissionOverride) -> Result<()> {
        let invalid = |reason: String| CovenantError::validation("override", reason);
        check_share("giver_share", ov.giver_share).map_err(invalid)?;
        check_share("receiver_share", ov.receiver_share).map_err(invalid)?;
        check_total(ov.giver_share, ov.receiver_share, ov.total_rate).map_err(invalid)?;
        if let (Some(from), Some(until)) = (ov.valid_from, ov.valid_until) {
            if until <= from {
                return Err(invalid("valid_until must be after valid_from".to_string()));
            }
        }

        info!(account = %ov.account, total_rate = %ov.total_rate, "Setting commission override");
        self.overrides.write().insert(ov.account.clone(), ov);
        Ok(())
    }

    pub fn remove_override(&self, account: &AccountId) -> Option<UserCommissionOverride> {
        self.overrides.write().remove(account)
    }

    /// The stored override for an account, active or not
    pub fn override_for(&self, account: &AccountId) -> Option<UserCommissionOverride> {
        self.overrides.read().get(account).cloned()
    }

    /// The override in force for an account at `now`
    pub fn active_override(
        &self,
        account: &AccountId,
        now: DateTime<Utc>,
    ) -> Option<UserCommissionOverride> {
        self.override_for(account).filter(|ov| ov.is_active_at(now))
    }

    /// Amount expressed in the base currency for tier and limit checks
    pub async fn normalize(
        &self,
        amount: Decimal,
        currency: Currency,
        now: DateTime<Utc>,
    ) -> Result<Decimal> {
        let base = self.fx.base_currency();
        let conversion = self.fx.convert(amount, currency, base, now).await?;
        if conversion.is_stale && !*self.accept_stale_normalization.read() {
            return Err(CovenantError::StaleExchangeRate {
                from: currency.to_string(),
                to: base.to_string(),
            });
        }
        Ok(conversion.converted_amount)
    }

    /// Resolve the commission split for a transaction
    pub async fn resolve(
        &self,
        amount: Decimal,
        currency: Currency,
        payer: &AccountId,
        payee: &AccountId,
        now: DateTime<Utc>,
    ) -> Result<CommissionSplit> {
        if amount <= Decimal::ZERO {
            return Err(CovenantError::InvalidAmount {
                amount: amount.to_string(),
                currency: currency.to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let normalized = self.normalize(amount, currency, now).await?;
        let tiers = self.tiers();
        let tier = select_tier(&tiers, normalized).ok_or_else(|| {
            CovenantError::InvalidTierConfiguration {
                reason: "tier table is empty".to_string(),
            }
        })?;

        let split = match self
            .override_for(payee)
            .filter(|ov| ov.supersedes_rates_at(now))
        {
            Some(ov) => compute_split(
                amount,
                currency,
                normalized,
                &tier.name,
                ov.giver_share,
                ov.receiver_share,
                ov.total_rate,
                RateBasis::Override {
                    account: ov.account.clone(),
                },
            ),
            None => compute_split(
                amount,
                currency,
                normalized,
                &tier.name,
                tier.giver_share,
                tier.receiver_share,
                tier.total_rate,
                RateBasis::TierLookup {
                    tier: tier.name.clone(),
                },
            ),
        };

        debug!(
            payer = %payer,
            payee = %payee,
            tier = %split.tier_name,
            total_commission = %split.total_commission,
            is_override = split.is_override(),
            "Resolved commission split"
        );
        Ok(split)
    }
}
