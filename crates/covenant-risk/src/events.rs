//! Append-only velocity event log
//!
//! Every evaluated operation is appended before any rule reads the log, so
//! concurrent evaluations for the same account always see each other.

use chrono::{DateTime, Utc};
use covenant_types::AccountId;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One evaluated operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub account: AccountId,
    pub operation: String,
    /// Amount in the base currency
    pub amount: Decimal,
    pub at: DateTime<Utc>,
}

/// Aggregate of an account's events inside a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowStats {
    pub count: u32,
    pub volume: Decimal,
}

/// Per-account append-only log
#[derive(Debug, Default)]
pub struct EventLog {
    events: DashMap<AccountId, Vec<RiskEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, event: RiskEvent) {
        self.events
            .entry(event.account.clone())
            .or_default()
            .push(event);
    }

    /// Events in `(since, until]` for the account
    pub fn window(&self, account: &AccountId, since: DateTime<Utc>, until: DateTime<Utc>) -> WindowStats {
        let Some(events) = self.events.get(account) else {
            return WindowStats::default();
        };
        events
            .iter()
            .filter(|e| e.at > since && e.at <= until)
            .fold(WindowStats::default(), |mut acc, e| {
                acc.count += 1;
                acc.volume += e.amount;
                acc
            })
    }

    /// Drop events older than the cutoff, returning how many were removed
    pub fn prune(&self, older_than: DateTime<Utc>) -> usize {
        let mut removed = 0;
        self.events.retain(|_, events| {
            let before = events.len();
            events.retain(|e| e.at >= older_than);
            removed += before - events.len();
            !events.is_empty()
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.events.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
