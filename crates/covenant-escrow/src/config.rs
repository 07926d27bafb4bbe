//! Escrow configuration

use chrono::Duration;
use covenant_types::{CovenantError, ProofType, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Proof requirement band over the base-currency amount `[min, max)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRequirementTier {
    pub min_amount: Decimal,
    #[serde(default)]
    pub max_amount: Option<Decimal>,
    #[serde(default)]
    pub required_proof: Option<ProofType>,
    /// Hold period before the escrow expires
    pub transfer_delay_hours: u32,
}

impl ProofRequirementTier {
    pub fn contains(&self, amount: Decimal) -> bool {
        amount >= self.min_amount && self.max_amount.map_or(true, |max| amount < max)
    }
}

fn default_proof_tiers() -> Vec<ProofRequirementTier> {
    vec![
        ProofRequirementTier {
            min_amount: dec!(0),
            max_amount: Some(dec!(100)),
            required_proof: None,
            transfer_delay_hours: 24,
        },
        ProofRequirementTier {
            min_amount: dec!(100),
            max_amount: Some(dec!(1000)),
            required_proof: Some(ProofType::Receipt),
            transfer_delay_hours: 48,
        },
        ProofRequirementTier {
            min_amount: dec!(1000),
            max_amount: Some(dec!(10000)),
            required_proof: Some(ProofType::ExperiencePhoto),
            transfer_delay_hours: 72,
        },
        ProofRequirementTier {
            min_amount: dec!(10000),
            max_amount: None,
            required_proof: Some(ProofType::SelfieWithId),
            transfer_delay_hours: 120,
        },
    ]
}

/// Dispute windows and limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisputeConfig {
    #[serde(default = "default_response_window_hours")]
    pub response_window_hours: u32,

    #[serde(default = "default_review_window_hours")]
    pub review_window_hours: u32,

    #[serde(default = "default_max_disputes")]
    pub max_disputes_per_escrow: u32,
}

fn default_response_window_hours() -> u32 {
    48
}

fn default_review_window_hours() -> u32 {
    7 * 24
}

fn default_max_disputes() -> u32 {
    2
}

impl Default for DisputeConfig {
    fn default() -> Self {
        Self {
            response_window_hours: default_response_window_hours(),
            review_window_hours: default_review_window_hours(),
            max_disputes_per_escrow: default_max_disputes(),
        }
    }
}

impl DisputeConfig {
    pub fn response_window(&self) -> Duration {
        Duration::hours(self.response_window_hours as i64)
    }

    pub fn review_window(&self) -> Duration {
        Duration::hours(self.review_window_hours as i64)
    }
}

/// Proof-quality score thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofScoring {
    /// At or above: verified
    #[serde(default = "default_approve_threshold")]
    pub approve_threshold: Decimal,

    /// Below: rejected; in between stays pending for manual review
    #[serde(default = "default_review_threshold")]
    pub review_threshold: Decimal,
}

fn default_approve_threshold() -> Decimal {
    dec!(0.6)
}

fn default_review_threshold() -> Decimal {
    dec!(0.4)
}

impl Default for ProofScoring {
    fn default() -> Self {
        Self {
            approve_threshold: default_approve_threshold(),
            review_threshold: default_review_threshold(),
        }
    }
}

/// Escrow lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowConfig {
    /// Smallest escrow in the base currency
    #[serde(default = "default_min_amount")]
    pub min_amount: Decimal,

    /// Largest escrow in the base currency
    #[serde(default = "default_max_amount")]
    pub max_amount: Decimal,

    #[serde(default = "default_proof_tiers")]
    pub proof_tiers: Vec<ProofRequirementTier>,

    #[serde(default = "default_max_proof_rejections")]
    pub max_proof_rejections: u32,

    #[serde(default)]
    pub proof_scoring: ProofScoring,

    #[serde(default)]
    pub disputes: DisputeConfig,

    /// Time budget for the risk gate; exceeding it fails closed
    #[serde(default = "default_risk_timeout_ms")]
    pub risk_timeout_ms: u64,
}

fn default_min_amount() -> Decimal {
    dec!(1)
}

fn default_max_amount() -> Decimal {
    dec!(100000)
}

fn default_max_proof_rejections() -> u32 {
    3
}

fn default_risk_timeout_ms() -> u64 {
    1_000
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            min_amount: default_min_amount(),
            max_amount: default_max_amount(),
            proof_tiers: default_proof_tiers(),
            max_proof_rejections: default_max_proof_rejections(),
            proof_scoring: ProofScoring::default(),
            disputes: DisputeConfig::default(),
            risk_timeout_ms: default_risk_timeout_ms(),
        }
    }
}

impl EscrowConfig {
    pub fn risk_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.risk_timeout_ms)
    }

    /// Proof tier for a base-currency amount; above every bound uses the last tier
    pub fn proof_tier_for(&self, amount: Decimal) -> Option<&ProofRequirementTier> {
        self.proof_tiers
            .iter()
            .find(|t| t.contains(amount))
            .or_else(|| self.proof_tiers.last())
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_amount <= Decimal::ZERO || self.max_amount < self.min_amount {
            return Err(CovenantError::validation(
                "escrow.limits",
                "limits must be positive with min <= max",
            ));
        }
        if self.proof_tiers.is_empty() {
            return Err(CovenantError::validation(
                "escrow.proof_tiers",
                "at least one proof tier is required",
            ));
        }
        if self.proof_scoring.review_threshold > self.proof_scoring.approve_threshold {
            return Err(CovenantError::validation(
                "escrow.proof_scoring",
                "review threshold must not exceed approve threshold",
            ));
        }
        if self.disputes.response_window_hours == 0 || self.disputes.review_window_hours == 0 {
            return Err(CovenantError::validation(
                "escrow.disputes",
                "dispute windows must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(EscrowConfig::default().validate().is_ok());
    }

    #[test]
    fn test_proof_tier_lookup() {
        let config = EscrowConfig::default();
        assert_eq!(config.proof_tier_for(dec!(50)).unwrap().required_proof, None);
        assert_eq!(
            config.proof_tier_for(dec!(1000)).unwrap().required_proof,
            Some(ProofType::ExperiencePhoto)
        );
        assert_eq!(
            config.proof_tier_for(dec!(500000)).unwrap().transfer_delay_hours,
            120
        );
    }
}
