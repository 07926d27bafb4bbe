//! Application state shared across handlers

use std::sync::Arc;

use covenant_commission::{CommissionEngine, CommissionLedger};
use covenant_escrow::{
    EscrowManager, EscrowServices, InMemorySettlementStore, InMemoryTreasury,
};
use covenant_fx::{ConversionService, RateBook};
use covenant_idempotency::{IdempotencyLedger, InMemoryIdempotencyStore};
use covenant_reconciler::Reconciler;
use covenant_risk::{InMemoryAlertSink, RuleBasedRiskGate};
use covenant_types::Clock;

use crate::config::ServerConfig;

/// Shared application state
pub struct AppState {
    pub manager: Arc<EscrowManager>,
    pub risk: Arc<RuleBasedRiskGate>,
    pub rates: Arc<RateBook>,
    pub commissions: Arc<CommissionLedger>,
    pub reconciler: Arc<Reconciler>,
    /// Enables the funding endpoint
    pub dev_mode: bool,
}

impl AppState {
    /// Wire every settlement component from configuration
    pub fn build(config: &ServerConfig, clock: Arc<dyn Clock>, dev_mode: bool) -> anyhow::Result<Self> {
        let rates = Arc::new(RateBook::new());
        let fx = Arc::new(ConversionService::new(rates.clone(), config.fx.clone()));
        let commission = Arc::new(CommissionEngine::new(fx.clone(), config.commission.clone())?);
        let commissions = Arc::new(CommissionLedger::new());
        let risk = Arc::new(RuleBasedRiskGate::new(
            config.risk.clone(),
            Arc::new(InMemoryAlertSink::new("risk-review")),
        )?);
        let idempotency = Arc::new(IdempotencyLedger::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            clock.clone(),
            config.idempotency.clone(),
        ));

        let manager = Arc::new(EscrowManager::new(
            EscrowServices {
                store: Arc::new(InMemorySettlementStore::new()),
                treasury: Arc::new(InMemoryTreasury::new()),
                idempotency,
                commission,
                commissions: commissions.clone(),
                fx,
                risk: risk.clone(),
                clock,
            },
            config.escrow.clone(),
        )?);
        let reconciler = Arc::new(Reconciler::new(
            manager.clone(),
            risk.clone(),
            config.reconciler.clone(),
        ));

        tracing::info!(
            tiers = config.commission.tiers.len(),
            rules = config.risk.rules.len(),
            base_currency = %config.fx.base_currency,
            "Settlement components initialized"
        );

        Ok(Self {
            manager,
            risk,
            rates,
            commissions,
            reconciler,
            dev_mode,
        })
    }

    /// Apply the hot-reloadable parts of a fresh configuration
    ///
    /// Commission tiers and fraud rules are swapped independently; an invalid
    /// section keeps the one currently in force.
    pub fn reload(&self, config: &ServerConfig) -> anyhow::Result<()> {
        let tiers = self
            .manager
            .commission_engine()
            .reload(config.commission.clone());
        let rules = self.risk.reload(config.risk.clone());

        match (tiers, rules) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), _) => Err(anyhow::anyhow!("commission tiers not reloaded: {e}")),
            (_, Err(e)) => Err(anyhow::anyhow!("fraud rules not reloaded: {e}")),
        }
    }
}
