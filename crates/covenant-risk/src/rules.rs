//! Fraud rules
//!
//! Amounts in rules are expressed in the engine's base currency.

use chrono::Duration;
use covenant_types::{CovenantError, FraudRuleId, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// What a triggered rule does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    /// Contribute to the score only
    Flag,
    /// Deny regardless of the total score
    Block,
}

/// Types of fraud rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FraudRuleType {
    /// Single operation at or above the threshold
    AmountThreshold { threshold: Decimal },
    /// More than `max_count` operations inside the window
    VelocityCount { max_count: u32, window_secs: u64 },
    /// Summed volume inside the window above `max_volume`
    VelocityVolume { max_volume: Decimal, window_secs: u64 },
    /// Reportable single amount
    AmlThreshold { threshold: Decimal },
}

impl FraudRuleType {
    /// Look-back window for velocity rules
    pub fn window(&self) -> Option<Duration> {
        match self {
            Self::VelocityCount { window_secs, .. } | Self::VelocityVolume { window_secs, .. } => {
                Some(Duration::seconds(*window_secs as i64))
            }
            _ => None,
        }
    }
}

/// A fraud rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudRule {
    #[serde(default)]
    pub id: FraudRuleId,
    pub name: String,
    pub rule_type: FraudRuleType,
    /// Added to the risk score when triggered
    pub risk_score: u32,
    pub action: RuleAction,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl FraudRule {
    pub fn new(
        name: impl Into<String>,
        rule_type: FraudRuleType,
        risk_score: u32,
        action: RuleAction,
    ) -> Self {
        Self {
            id: FraudRuleId::new(),
            name: name.into(),
            rule_type,
            risk_score,
            action,
            active: true,
        }
    }
}

/// Rules used when none are configured
pub fn default_rules() -> Vec<FraudRule> {
    vec![
        FraudRule::new(
            "large_amount",
            FraudRuleType::AmountThreshold {
                threshold: dec!(10000),
            },
            30,
            RuleAction::Flag,
        ),
        FraudRule::new(
            "aml_threshold",
            FraudRuleType::AmlThreshold {
                threshold: dec!(15000),
            },
            50,
            RuleAction::Flag,
        ),
        FraudRule::new(
            "rapid_fire",
            FraudRuleType::VelocityCount {
                max_count: 10,
                window_secs: 3600,
            },
            40,
            RuleAction::Block,
        ),
        FraudRule::new(
            "volume_spike",
            FraudRuleType::VelocityVolume {
                max_volume: dec!(50000),
                window_secs: 86400,
            },
            50,
            RuleAction::Flag,
        ),
    ]
}

/// Reject unnamed, duplicate or malformed rules
pub fn validate_rules(rules: &[FraudRule]) -> Result<()> {
    let mut names = HashSet::new();
    for rule in rules {
        if rule.name.trim().is_empty() {
            return Err(CovenantError::validation("rules", "rule name must not be empty"));
        }
        if !names.insert(rule.name.as_str()) {
            return Err(CovenantError::validation(
                "rules",
                format!("duplicate rule {}", rule.name),
            ));
        }
        let malformed = match &rule.rule_type {
            FraudRuleType::AmountThreshold { threshold } | FraudRuleType::AmlThreshold { threshold } => {
                *threshold <= Decimal::ZERO
            }
            FraudRuleType::VelocityCount { window_secs, .. } => *window_secs == 0,
            FraudRuleType::VelocityVolume {
                max_volume,
                window_secs,
            } => *window_secs == 0 || *max_volume <= Decimal::ZERO,
        };
        if malformed {
            return Err(CovenantError::validation(
                "rules",
                format!("rule {} has a non-positive threshold or window", rule.name),
            ));
        }
    }
    Ok(())
}
