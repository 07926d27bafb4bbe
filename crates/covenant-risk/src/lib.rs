//! Covenant Risk Gate
//!
//! Scores money-moving requests before any funds are held.
//!
//! # Rule Types
//!
//! - **Amount threshold**: single operation at or above a limit
//! - **Velocity count**: too many operations inside a window
//! - **Velocity volume**: too much volume inside a window
//! - **AML threshold**: reportable single amount
//!
//! Denied operations raise a [`FraudAlert`] for human review.

pub mod alerts;
pub mod events;
pub mod gate;
pub mod rules;

pub use alerts::{AlertReviewStatus, AlertSink, FraudAlert, InMemoryAlertSink};
pub use events::{EventLog, RiskEvent, WindowStats};
pub use gate::{
    evaluate_with_timeout, RiskConfig, RiskContext, RiskDecision, RiskGate, RuleBasedRiskGate,
};
pub use rules::{default_rules, validate_rules, FraudRule, FraudRuleType, RuleAction};
