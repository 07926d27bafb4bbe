//! Fraud alerts for human review

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use covenant_types::{AccountId, AlertId, Currency, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Review state of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertReviewStatus {
    Open,
    /// Reviewer judged the block a false positive
    Cleared,
    /// Reviewer confirmed fraud
    Confirmed,
}

/// Raised whenever the gate denies an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudAlert {
    pub id: AlertId,
    pub account: AccountId,
    pub operation: String,
    pub amount: Decimal,
    pub currency: Currency,
    pub risk_score: u32,
    pub triggered_rules: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub status: AlertReviewStatus,
    pub reviewed_by: Option<AccountId>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

/// Delivery channel for fraud alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &FraudAlert) -> Result<()>;

    fn name(&self) -> &str;
}

/// In-memory alert sink for testing and single-node deployments
pub struct InMemoryAlertSink {
    name: String,
    delivered: RwLock<Vec<FraudAlert>>,
}

impl InMemoryAlertSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delivered: RwLock::new(Vec::new()),
        }
    }

    pub fn delivered(&self) -> Vec<FraudAlert> {
        self.delivered.read().clone()
    }
}

#[async_trait]
impl AlertSink for InMemoryAlertSink {
    async fn send(&self, alert: &FraudAlert) -> Result<()> {
        self.delivered.write().push(alert.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
