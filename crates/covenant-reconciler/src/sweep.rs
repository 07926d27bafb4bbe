//! Periodic reconciliation sweep

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use covenant_escrow::EscrowManager;
use covenant_idempotency::Executed;
use covenant_risk::RuleBasedRiskGate;
use covenant_types::{CovenantError, EscrowStatus, IdempotencyKey, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Sweep worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Seconds between sweeps
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Risk events older than this are pruned
    #[serde(default = "default_event_retention_secs")]
    pub event_retention_secs: u64,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_event_retention_secs() -> u64 {
    30 * 24 * 3600
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            event_retention_secs: default_event_retention_secs(),
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn event_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.event_retention_secs as i64)
    }
}

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired_unfunded: u32,
    pub auto_released: u32,
    pub auto_refunded: u32,
    pub disputes_forfeited: u32,
    pub disputes_expired: u32,
    pub commissions_collected: u32,
    pub idempotency_reaped: usize,
    pub risk_events_pruned: usize,
    /// Lost races and actions another sweep already performed
    pub skipped: u32,
    pub failed: u32,
}

impl SweepReport {
    /// Escrow and dispute actions performed by this sweep
    pub fn actions(&self) -> u32 {
        self.expired_unfunded
            + self.auto_released
            + self.auto_refunded
            + self.disputes_forfeited
            + self.disputes_expired
            + self.commissions_collected
    }

    pub fn is_idle(&self) -> bool {
        self.actions() == 0 && self.skipped == 0 && self.failed == 0
    }
}

/// Outcome of one sweep action
enum Step<T> {
    Done(T),
    Skipped,
    Failed,
}

/// Classify an action result; lost races are not failures
fn classify<T>(
    result: Result<Executed<T>>,
    what: &str,
    id: &str,
) -> Step<T> {
    match result {
        Ok(executed) if executed.is_replay() => {
            debug!(action = what, id, "Already performed by another sweep");
            Step::Skipped
        }
        Ok(executed) => Step::Done(executed.value),
        Err(CovenantError::InvalidState { .. }) | Err(CovenantError::ConcurrencyConflict { .. }) => {
            debug!(action = what, id, "Lost race; skipping");
            Step::Skipped
        }
        Err(e) => {
            error!(action = what, id, error = %e, "Sweep action failed");
            Step::Failed
        }
    }
}

fn sweep_key(at: DateTime<Utc>) -> Result<IdempotencyKey> {
    IdempotencyKey::new(format!("sweep:{}", at.to_rfc3339()))
}

/// Drives time-based transitions the request path never triggers
pub struct Reconciler {
    manager: Arc<EscrowManager>,
    risk: Arc<RuleBasedRiskGate>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        manager: Arc<EscrowManager>,
        risk: Arc<RuleBasedRiskGate>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            manager,
            risk,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run every sweep stage once against `now`
    ///
    /// Safe to run from several workers at once: every action goes through
    /// the idempotency ledger with a key derived from the deadline it acts on.
    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        if let Err(e) = self.expire_unfunded(now, &mut report).await {
            error!(error = %e, "Unfunded escrow sweep failed");
            report.failed += 1;
        }
        if let Err(e) = self.settle_expired(now, &mut report).await {
            error!(error = %e, "Expired escrow sweep failed");
            report.failed += 1;
        }
        if let Err(e) = self.sweep_disputes(now, &mut report).await {
            error!(error = %e, "Dispute sweep failed");
            report.failed += 1;
        }
        self.collect_commissions(&mut report).await;

        match self.manager.idempotency().reap_expired(now).await {
            Ok(removed) => report.idempotency_reaped = removed,
            Err(e) => {
                error!(error = %e, "Idempotency reaping failed");
                report.failed += 1;
            }
        }
        report.risk_events_pruned = self
            .risk
            .prune_events(now - self.config.event_retention());

        if report.failed > 0 {
            warn!(?report, "Sweep finished with failures");
        } else if !report.is_idle() {
            info!(
                released = report.auto_released,
                refunded = report.auto_refunded,
                forfeited = report.disputes_forfeited,
                expired = report.disputes_expired + report.expired_unfunded,
                collected = report.commissions_collected,
                skipped = report.skipped,
                "Sweep finished"
            );
        }
        report
    }

    async fn expire_unfunded(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        for escrow in self.manager.list_by_status(EscrowStatus::Created).await? {
            if !escrow.is_expired_at(now) {
                continue;
            }
            let key = sweep_key(escrow.expires_at)?;
            let result = self.manager.expire_unfunded(&escrow.id, &key).await;
            match classify(result, "expire_unfunded", &escrow.id.to_string()) {
                Step::Done(_) => report.expired_unfunded += 1,
                Step::Skipped => report.skipped += 1,
                Step::Failed => report.failed += 1,
            }
        }
        Ok(())
    }

    async fn settle_expired(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        for status in [
            EscrowStatus::Held,
            EscrowStatus::ProofPending,
            EscrowStatus::ProofVerified,
        ] {
            for escrow in self.manager.list_by_status(status).await? {
                if !escrow.is_expired_at(now) {
                    continue;
                }
                let key = sweep_key(escrow.expires_at)?;
                let result = self.manager.settle_expired(&escrow.id, &key).await;
                match classify(result, "settle_expired", &escrow.id.to_string()) {
                    Step::Done(settled) if settled.status == EscrowStatus::Released => {
                        report.auto_released += 1
                    }
                    Step::Done(_) => report.auto_refunded += 1,
                    Step::Skipped => report.skipped += 1,
                    Step::Failed => report.failed += 1,
                }
            }
        }
        Ok(())
    }

    async fn sweep_disputes(&self, now: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        for dispute in self.manager.open_disputes().await? {
            let id = dispute.id.to_string();
            if dispute.response_overdue_at(now) {
                let key = sweep_key(dispute.response_deadline)?;
                let result = self.manager.forfeit_dispute(&dispute.id, &key).await;
                match classify(result, "forfeit_dispute", &id) {
                    Step::Done(_) => report.disputes_forfeited += 1,
                    Step::Skipped => report.skipped += 1,
                    Step::Failed => report.failed += 1,
                }
            } else if dispute.review_overdue_at(now) {
                let key = sweep_key(dispute.review_deadline)?;
                let result = self.manager.expire_dispute(&dispute.id, &key).await;
                match classify(result, "expire_dispute", &id) {
                    Step::Done(_) => report.disputes_expired += 1,
                    Step::Skipped => report.skipped += 1,
                    Step::Failed => report.failed += 1,
                }
            }
        }
        Ok(())
    }

    async fn collect_commissions(&self, report: &mut SweepReport) {
        for entry in self.manager.pending_commissions() {
            let key = match sweep_key(entry.created_at) {
                Ok(key) => key,
                Err(e) => {
                    error!(error = %e, "Invalid sweep key");
                    report.failed += 1;
                    continue;
                }
            };
            let result = self.manager.collect_commission(&entry.id, &key).await;
            match classify(result, "collect_commission", &entry.id.to_string()) {
                Step::Done(_) => report.commissions_collected += 1,
                Step::Skipped => report.skipped += 1,
                Step::Failed => report.failed += 1,
            }
        }
    }

    /// Run sweeps every `period` until `shutdown` flips to `true`
    pub fn spawn(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = period.as_secs(), "Sweep worker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.run_once(self.manager.now()).await;
                        debug!(actions = report.actions(), "Sweep tick");
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Sweep worker stopped");
        })
    }
}
