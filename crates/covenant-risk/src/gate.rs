//! Fraud/Risk Gate
//!
//! Scores an operation against the active rules. The operation is appended
//! to the velocity log before any rule reads it. Triggered scores are summed;
//! a triggered `block` rule or a sum above the ceiling denies the operation
//! and raises a [`FraudAlert`]. The gate never touches escrow state.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use covenant_types::{AccountId, AlertId, CovenantError, Currency, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::alerts::{AlertReviewStatus, AlertSink, FraudAlert};
use crate::events::{EventLog, RiskEvent};
use crate::rules::{default_rules, validate_rules, FraudRule, FraudRuleType, RuleAction};

/// Risk gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_rules")]
    pub rules: Vec<FraudRule>,

    /// Summed score above this denies the operation
    #[serde(default = "default_score_ceiling")]
    pub score_ceiling: u32,

    /// Time budget for one evaluation; exceeding it fails closed
    #[serde(default = "default_evaluation_timeout_ms")]
    pub evaluation_timeout_ms: u64,

    /// Velocity events older than this are pruned
    #[serde(default = "default_event_retention_secs")]
    pub event_retention_secs: u64,
}

fn default_score_ceiling() -> u32 {
    100
}

fn default_evaluation_timeout_ms() -> u64 {
    1_000
}

fn default_event_retention_secs() -> u64 {
    30 * 24 * 3600
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            score_ceiling: default_score_ceiling(),
            evaluation_timeout_ms: default_evaluation_timeout_ms(),
            event_retention_secs: default_event_retention_secs(),
        }
    }
}

impl RiskConfig {
    pub fn evaluation_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.evaluation_timeout_ms)
    }

    pub fn event_retention(&self) -> Duration {
        Duration::seconds(self.event_retention_secs as i64)
    }
}

/// The operation being scored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskContext {
    pub account: AccountId,
    pub operation: String,
    pub amount: Decimal,
    pub currency: Currency,
    /// Amount in the base currency, compared against rule thresholds
    pub normalized_amount: Decimal,
    pub at: DateTime<Utc>,
}

/// Outcome of an evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskDecision {
    pub allow: bool,
    pub risk_score: u32,
    pub triggered_rules: Vec<String>,
    /// Alert raised for a denied operation
    pub alert_id: Option<AlertId>,
}

impl RiskDecision {
    /// Convert a denial into `FraudBlocked`
    pub fn into_result(self) -> Result<RiskDecision> {
        if self.allow {
            Ok(self)
        } else {
            Err(CovenantError::FraudBlocked {
                risk_score: self.risk_score,
                triggered_rules: self.triggered_rules,
            })
        }
    }
}

/// Risk gate trait
///
/// `evaluate` scores a request as if it were about to happen; `record` adds
/// it to the velocity history once the operation has actually completed.
#[async_trait]
pub trait RiskGate: Send + Sync {
    async fn evaluate(&self, ctx: &RiskContext) -> Result<RiskDecision>;

    async fn record(&self, ctx: &RiskContext);
}

/// Evaluate under a time budget; a timeout is a denial
pub async fn evaluate_with_timeout(
    gate: &dyn RiskGate,
    ctx: &RiskContext,
    timeout: StdDuration,
) -> Result<RiskDecision> {
    match tokio::time::timeout(timeout, gate.evaluate(ctx)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(account = %ctx.account, operation = %ctx.operation, "Risk evaluation timed out");
            Err(CovenantError::unavailable(
                "risk_gate",
                "evaluation timed out; failing closed",
            ))
        }
    }
}

/// Rule-based gate over the in-memory event log
pub struct RuleBasedRiskGate {
    rules: RwLock<Arc<Vec<FraudRule>>>,
    score_ceiling: RwLock<u32>,
    events: EventLog,
    alerts: RwLock<HashMap<AlertId, FraudAlert>>,
    sink: Arc<dyn AlertSink>,
}

impl RuleBasedRiskGate {
    pub fn new(config: RiskConfig, sink: Arc<dyn AlertSink>) -> Result<Self> {
        validate_rules(&config.rules)?;
        Ok(Self {
            rules: RwLock::new(Arc::new(config.rules)),
            score_ceiling: RwLock::new(config.score_ceiling),
            events: EventLog::new(),
            alerts: RwLock::new(HashMap::new()),
            sink,
        })
    }

    /// Swap the rule set at runtime
    pub fn replace_rules(&self, rules: Vec<FraudRule>) -> Result<()> {
        validate_rules(&rules)?;
        info!(count = rules.len(), "Replacing fraud rules");
        *self.rules.write() = Arc::new(rules);
        Ok(())
    }

    /// Apply a reloaded configuration
    pub fn reload(&self, config: RiskConfig) -> Result<()> {
        self.replace_rules(config.rules)?;
        *self.score_ceiling.write() = config.score_ceiling;
        Ok(())
    }

    pub fn rules(&self) -> Arc<Vec<FraudRule>> {
        self.rules.read().clone()
    }

    fn triggered(&self, rule: &FraudRule, ctx: &RiskContext) -> bool {
        match &rule.rule_type {
            FraudRuleType::AmountThreshold { threshold } | FraudRuleType::AmlThreshold { threshold } => {
                ctx.normalized_amount >= *threshold
            }
            // The request under evaluation counts toward its own window
            FraudRuleType::VelocityCount { max_count, .. } => {
                let since = ctx.at - rule.rule_type.window().unwrap_or_else(Duration::zero);
                let stats = self.events.window(&ctx.account, since, ctx.at);
                stats.count.saturating_add(1) > *max_count
            }
            FraudRuleType::VelocityVolume { max_volume, .. } => {
                let since = ctx.at - rule.rule_type.window().unwrap_or_else(Duration::zero);
                let stats = self.events.window(&ctx.account, since, ctx.at);
                stats.volume + ctx.normalized_amount > *max_volume
            }
        }
    }

    pub fn get_alert(&self, id: &AlertId) -> Option<FraudAlert> {
        self.alerts.read().get(id).cloned()
    }

    /// Alerts in the given review state, newest first
    pub fn alerts(&self, status: AlertReviewStatus) -> Vec<FraudAlert> {
        let mut alerts: Vec<_> = self
            .alerts
            .read()
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    /// Mark an open alert as a false positive
    pub fn clear_alert(
        &self,
        id: &AlertId,
        reviewer: &AccountId,
        now: DateTime<Utc>,
    ) -> Result<FraudAlert> {
        self.review(id, reviewer, AlertReviewStatus::Cleared, now)
    }

    /// Confirm an open alert as fraud
    pub fn confirm_alert(
        &self,
        id: &AlertId,
        reviewer: &AccountId,
        now: DateTime<Utc>,
    ) -> Result<FraudAlert> {
        self.review(id, reviewer, AlertReviewStatus::Confirmed, now)
    }

    fn review(
        &self,
        id: &AlertId,
        reviewer: &AccountId,
        outcome: AlertReviewStatus,
        now: DateTime<Utc>,
    ) -> Result<FraudAlert> {
        let mut alerts = self.alerts.write();
        let alert = alerts
            .get_mut(id)
            .ok_or_else(|| CovenantError::not_found("fraud_alert", id))?;
        if alert.status != AlertReviewStatus::Open {
            return Err(CovenantError::invalid_state("fraud_alert", alert.status, "review"));
        }
        alert.status = outcome;
        alert.reviewed_by = Some(reviewer.clone());
        alert.reviewed_at = Some(now);
        info!(alert_id = %id, outcome = ?outcome, "Fraud alert reviewed");
        Ok(alert.clone())
    }

    /// Trim the velocity log
    pub fn prune_events(&self, older_than: DateTime<Utc>) -> usize {
        let removed = self.events.prune(older_than);
        if removed > 0 {
            debug!(removed, "Pruned risk events");
        }
        removed
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

#[async_trait]
impl RiskGate for RuleBasedRiskGate {
    async fn evaluate(&self, ctx: &RiskContext) -> Result<RiskDecision> {
        let rules = self.rules();
        let mut risk_score = 0u32;
        let mut blocked = false;
        let mut triggered_rules = Vec::new();
        for rule in rules.iter().filter(|r| r.active) {
            if self.triggered(rule, ctx) {
                risk_score = risk_score.saturating_add(rule.risk_score);
                blocked |= rule.action == RuleAction::Block;
                triggered_rules.push(rule.name.clone());
            }
        }

        let ceiling = *self.score_ceiling.read();
        let allow = !blocked && risk_score <= ceiling;
        if allow {
            if !triggered_rules.is_empty() {
                debug!(account = %ctx.account, risk_score, rules = ?triggered_rules, "Risk flags raised");
            }
            return Ok(RiskDecision {
                allow,
                risk_score,
                triggered_rules,
                alert_id: None,
            });
        }

        let alert = FraudAlert {
            id: AlertId::new(),
            account: ctx.account.clone(),
            operation: ctx.operation.clone(),
            amount: ctx.amount,
            currency: ctx.currency,
            risk_score,
            triggered_rules: triggered_rules.clone(),
            created_at: ctx.at,
            status: AlertReviewStatus::Open,
            reviewed_by: None,
            reviewed_at: None,
        };
        warn!(
            account = %ctx.account,
            operation = %ctx.operation,
            risk_score,
            rules = ?triggered_rules,
            "Operation blocked by risk gate"
        );
        self.alerts.write().insert(alert.id.clone(), alert.clone());
        if let Err(e) = self.sink.send(&alert).await {
            warn!(sink = self.sink.name(), error = %e, "Failed to deliver fraud alert");
        }

        Ok(RiskDecision {
            allow,
            risk_score,
            triggered_rules,
            alert_id: Some(alert.id),
        })
    }

    async fn record(&self, ctx: &RiskContext) {
        self.events.append(RiskEvent {
            account: ctx.account.clone(),
            operation: ctx.operation.clone(),
            amount: ctx.normalized_amount,
            at: ctx.at,
        });
    }
}
