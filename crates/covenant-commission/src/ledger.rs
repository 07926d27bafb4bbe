//! Commission ledger
//!
//! Append-only record of settled commissions. After the append only the
//! status moves, strictly `pending -> collected -> transferred`. A pending
//! entry is retracted only when the settlement that recorded it fails.

use chrono::{DateTime, Utc};
use covenant_types::{
    CommissionEntryId, CommissionLedgerEntry, CommissionStatus, CovenantError, Currency, EscrowId,
    Result,
};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

#[derive(Default)]
struct LedgerInner {
    entries: Vec<CommissionLedgerEntry>,
    by_id: HashMap<CommissionEntryId, usize>,
    by_escrow: HashMap<EscrowId, usize>,
}

/// In-memory commission ledger
#[derive(Default)]
pub struct CommissionLedger {
    inner: RwLock<LedgerInner>,
}

impl CommissionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a pending entry; one entry per escrow
    pub fn append(&self, entry: CommissionLedgerEntry) -> Result<CommissionLedgerEntry> {
        let mut inner = self.inner.write();
        if inner.by_escrow.contains_key(&entry.escrow_id) {
            return Err(CovenantError::invalid_state(
                "commission_entry",
                "Recorded",
                "append",
            ));
        }
        if entry.status != CommissionStatus::Pending {
            return Err(CovenantError::invalid_state(
                "commission_entry",
                entry.status,
                "append",
            ));
        }

        let idx = inner.entries.len();
        inner.by_id.insert(entry.id.clone(), idx);
        inner.by_escrow.insert(entry.escrow_id.clone(), idx);
        inner.entries.push(entry.clone());

        info!(
            entry_id = %entry.id,
            escrow_id = %entry.escrow_id,
            platform_revenue = %entry.platform_revenue,
            currency = %entry.currency,
            "Commission entry recorded"
        );
        Ok(entry)
    }

    /// Remove a pending entry whose settlement failed to commit
    pub fn retract(&self, id: &CommissionEntryId) -> Result<CommissionLedgerEntry> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let idx = *inner
            .by_id
            .get(id)
            .ok_or_else(|| CovenantError::not_found("commission_entry", id))?;
        if inner.entries[idx].status != CommissionStatus::Pending {
            return Err(CovenantError::invalid_state(
                "commission_entry",
                inner.entries[idx].status,
                "retract",
            ));
        }

        let entry = inner.entries.remove(idx);
        inner.by_id.remove(&entry.id);
        inner.by_escrow.remove(&entry.escrow_id);
        for slot in inner.by_id.values_mut().chain(inner.by_escrow.values_mut()) {
            if *slot > idx {
                *slot -= 1;
            }
        }

        warn!(entry_id = %entry.id, escrow_id = %entry.escrow_id, "Commission entry retracted");
        Ok(entry)
    }

    /// `pending -> collected`
    pub fn collect(
        &self,
        id: &CommissionEntryId,
        now: DateTime<Utc>,
    ) -> Result<CommissionLedgerEntry> {
        self.advance(id, CommissionStatus::Pending, CommissionStatus::Collected, now)
    }

    /// `collected -> transferred`
    pub fn mark_transferred(
        &self,
        id: &CommissionEntryId,
        now: DateTime<Utc>,
    ) -> Result<CommissionLedgerEntry> {
        self.advance(
            id,
            CommissionStatus::Collected,
            CommissionStatus::Transferred,
            now,
        )
    }

    fn advance(
        &self,
        id: &CommissionEntryId,
        from: CommissionStatus,
        to: CommissionStatus,
        now: DateTime<Utc>,
    ) -> Result<CommissionLedgerEntry> {
        let mut inner = self.inner.write();
        let idx = *inner
            .by_id
            .get(id)
            .ok_or_else(|| CovenantError::not_found("commission_entry", id))?;
        let entry = &mut inner.entries[idx];
        if entry.status != from {
            return Err(CovenantError::invalid_state(
                "commission_entry",
                entry.status,
                format!("{:?}", to).to_lowercase(),
            ));
        }

        entry.status = to;
        match to {
            CommissionStatus::Collected => entry.collected_at = Some(now),
            CommissionStatus::Transferred => entry.transferred_at = Some(now),
            CommissionStatus::Pending => {}
        }
        info!(entry_id = %id, status = ?to, "Commission entry advanced");
        Ok(entry.clone())
    }

    pub fn get(&self, id: &CommissionEntryId) -> Option<CommissionLedgerEntry> {
        let inner = self.inner.read();
        inner.by_id.get(id).map(|&idx| inner.entries[idx].clone())
    }

    pub fn for_escrow(&self, escrow_id: &EscrowId) -> Option<CommissionLedgerEntry> {
        let inner = self.inner.read();
        inner
            .by_escrow
            .get(escrow_id)
            .map(|&idx| inner.entries[idx].clone())
    }

    /// Entries not yet collected, oldest first
    pub fn pending_entries(&self) -> Vec<CommissionLedgerEntry> {
        self.with_status(CommissionStatus::Pending)
    }

    pub fn with_status(&self, status: CommissionStatus) -> Vec<CommissionLedgerEntry> {
        self.inner
            .read()
            .entries
            .iter()
            .filter(|e| e.status == status)
            .cloned()
            .collect()
    }

    /// Platform revenue per currency across all entries
    pub fn revenue_by_currency(&self) -> BTreeMap<Currency, Decimal> {
        let mut totals = BTreeMap::new();
        for entry in self.inner.read().entries.iter() {
            *totals.entry(entry.currency).or_insert(Decimal::ZERO) += entry.platform_revenue;
        }
        totals
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
