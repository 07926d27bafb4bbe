//! Treasury - balances and atomic leg batches
//!
//! Funds only move as batches of legs applied all-or-nothing. A batch can be
//! reversed when the records it backs fail to commit.

use async_trait::async_trait;
use covenant_types::{AccountId, BatchId, CovenantError, Currency, EscrowId, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::{info, warn};

/// A balance holder
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum TreasuryAccount {
    /// A user's wallet
    Wallet(AccountId),
    /// Holding account of one escrow
    Escrow(EscrowId),
    /// Platform revenue
    Platform,
    /// Counterparty for cross-currency settlement
    FxPool,
}

impl TreasuryAccount {
    /// House accounts may run a negative balance
    pub fn is_house(&self) -> bool {
        matches!(self, Self::FxPool)
    }
}

impl fmt::Display for TreasuryAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wallet(id) => write!(f, "wallet:{id}"),
            Self::Escrow(id) => write!(f, "escrow:{id}"),
            Self::Platform => f.write_str("platform"),
            Self::FxPool => f.write_str("fx_pool"),
        }
    }
}

/// One movement of funds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leg {
    pub from: TreasuryAccount,
    pub to: TreasuryAccount,
    pub amount: Decimal,
    pub currency: Currency,
}

impl Leg {
    pub fn new(from: TreasuryAccount, to: TreasuryAccount, amount: Decimal, currency: Currency) -> Self {
        Self {
            from,
            to,
            amount,
            currency,
        }
    }
}

/// Treasury operations
#[async_trait]
pub trait Treasury: Send + Sync {
    /// Apply all legs or none
    async fn apply(&self, legs: Vec<Leg>) -> Result<BatchId>;

    /// Undo a previously applied batch
    async fn reverse(&self, batch: &BatchId) -> Result<()>;

    async fn balance(&self, account: &TreasuryAccount, currency: Currency) -> Result<Decimal>;

    /// Credit funds from outside the system (top-ups)
    async fn deposit(&self, account: TreasuryAccount, amount: Decimal, currency: Currency) -> Result<()>;
}

#[derive(Default)]
struct TreasuryInner {
    balances: HashMap<(TreasuryAccount, Currency), Decimal>,
    batches: HashMap<BatchId, Vec<Leg>>,
}

impl TreasuryInner {
    fn balance(&self, account: &TreasuryAccount, currency: Currency) -> Decimal {
        self.balances
            .get(&(account.clone(), currency))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Net effect of legs, checked against current balances
    fn check(&self, legs: &[Leg]) -> Result<HashMap<(TreasuryAccount, Currency), Decimal>> {
        let mut deltas: HashMap<(TreasuryAccount, Currency), Decimal> = HashMap::new();
        for leg in legs {
            if leg.amount <= Decimal::ZERO {
                return Err(CovenantError::internal(format!(
                    "non-positive leg {} from {} to {}",
                    leg.amount, leg.from, leg.to
                )));
            }
            *deltas.entry((leg.from.clone(), leg.currency)).or_default() -= leg.amount;
            *deltas.entry((leg.to.clone(), leg.currency)).or_default() += leg.amount;
        }
        for ((account, currency), delta) in &deltas {
            let available = self.balance(account, *currency);
            if !account.is_house() && available + *delta < Decimal::ZERO {
                return Err(CovenantError::InsufficientFunds {
                    account: account.to_string(),
                    requested: (-*delta).to_string(),
                    available: available.to_string(),
                });
            }
        }
        Ok(deltas)
    }

    fn commit(&mut self, deltas: HashMap<(TreasuryAccount, Currency), Decimal>) {
        for (key, delta) in deltas {
            *self.balances.entry(key).or_default() += delta;
        }
    }
}

/// In-memory treasury under a single write lock
#[derive(Default)]
pub struct InMemoryTreasury {
    inner: RwLock<TreasuryInner>,
}

impl InMemoryTreasury {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all balances in a currency; zero unless funds entered from outside
    pub fn total(&self, currency: Currency) -> Decimal {
        self.inner
            .read()
            .balances
            .iter()
            .filter(|((_, c), _)| *c == currency)
            .map(|(_, v)| *v)
            .sum()
    }
}

#[async_trait]
impl Treasury for InMemoryTreasury {
    async fn apply(&self, legs: Vec<Leg>) -> Result<BatchId> {
        let mut inner = self.inner.write();
        let deltas = inner.check(&legs)?;
        inner.commit(deltas);

        let batch_id = BatchId::new();
        info!(batch_id = %batch_id, legs = legs.len(), "Treasury batch applied");
        inner.batches.insert(batch_id.clone(), legs);
        Ok(batch_id)
    }

    async fn reverse(&self, batch: &BatchId) -> Result<()> {
        let mut inner = self.inner.write();
        let legs = inner
            .batches
            .remove(batch)
            .ok_or_else(|| CovenantError::not_found("treasury_batch", batch))?;

        let reversed: Vec<Leg> = legs
            .into_iter()
            .map(|l| Leg::new(l.to, l.from, l.amount, l.currency))
            .collect();
        let deltas = match inner.check(&reversed) {
            Ok(deltas) => deltas,
            Err(e) => {
                // Put the batch back so the reversal can be retried
                let original = reversed
                    .into_iter()
                    .map(|l| Leg::new(l.to, l.from, l.amount, l.currency))
                    .collect();
                inner.batches.insert(batch.clone(), original);
                return Err(e);
            }
        };
        inner.commit(deltas);
        warn!(batch_id = %batch, "Treasury batch reversed");
        Ok(())
    }

    async fn balance(&self, account: &TreasuryAccount, currency: Currency) -> Result<Decimal> {
        Ok(self.inner.read().balance(account, currency))
    }

    async fn deposit(&self, account: TreasuryAccount, amount: Decimal, currency: Currency) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(CovenantError::InvalidAmount {
                amount: amount.to_string(),
                currency: currency.to_string(),
                reason: "deposit must be positive".to_string(),
            });
        }
        let mut inner = self.inner.write();
        *inner.balances.entry((account, currency)).or_default() += amount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let treasury = InMemoryTreasury::new();
        let alice = TreasuryAccount::Wallet(AccountId::new());
        let escrow = TreasuryAccount::Escrow(EscrowId::new());
        treasury.deposit(alice.clone(), dec!(100), Currency::EUR).await.unwrap();

        let err = treasury
            .apply(vec![
                Leg::new(alice.clone(), escrow.clone(), dec!(60), Currency::EUR),
                Leg::new(alice.clone(), TreasuryAccount::Platform, dec!(50), Currency::EUR),
            ])
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INSUFFICIENT_FUNDS");
        assert_eq!(treasury.balance(&alice, Currency::EUR).await.unwrap(), dec!(100));
        assert_eq!(treasury.balance(&escrow, Currency::EUR).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_reverse_restores_balances() {
        let treasury = InMemoryTreasury::new();
        let alice = TreasuryAccount::Wallet(AccountId::new());
        let escrow = TreasuryAccount::Escrow(EscrowId::new());
        treasury.deposit(alice.clone(), dec!(100), Currency::EUR).await.unwrap();

        let batch = treasury
            .apply(vec![Leg::new(alice.clone(), escrow.clone(), dec!(60), Currency::EUR)])
            .await
            .unwrap();
        treasury.reverse(&batch).await.unwrap();
        assert_eq!(treasury.balance(&alice, Currency::EUR).await.unwrap(), dec!(100));
        assert!(treasury.reverse(&batch).await.is_err());
    }

    #[tokio::test]
    async fn test_fx_pool_may_go_negative() {
        let treasury = InMemoryTreasury::new();
        let bob = TreasuryAccount::Wallet(AccountId::new());
        treasury
            .apply(vec![Leg::new(TreasuryAccount::FxPool, bob.clone(), dec!(350), Currency::TRY)])
            .await
            .unwrap();
        assert_eq!(
            treasury.balance(&TreasuryAccount::FxPool, Currency::TRY).await.unwrap(),
            dec!(-350)
        );
    }
}
