//! Escrow and dispute persistence
//!
//! Writes are committed in groups under optimistic versioning: every write
//! names the version it expects to replace, and the whole group fails if any
//! expectation does not hold.

use async_trait::async_trait;
use covenant_types::{
    CovenantError, Dispute, DisputeId, EscrowId, EscrowStatus, EscrowTransaction, Result,
};
use parking_lot::RwLock;
use std::collections::HashMap;

/// One record write
#[derive(Debug, Clone)]
pub enum Write {
    /// `expected_version` of 0 means the record must not exist yet
    Escrow {
        record: EscrowTransaction,
        expected_version: u64,
    },
    Dispute {
        record: Dispute,
        expected_version: u64,
    },
}

impl Write {
    /// Stage an escrow write; the caller's copy moves to the committed version
    pub fn escrow(record: &mut EscrowTransaction) -> Self {
        let expected_version = record.version;
        record.version += 1;
        Self::Escrow {
            record: record.clone(),
            expected_version,
        }
    }

    /// Stage a dispute write; the caller's copy moves to the committed version
    pub fn dispute(record: &mut Dispute) -> Self {
        let expected_version = record.version;
        record.version += 1;
        Self::Dispute {
            record: record.clone(),
            expected_version,
        }
    }
}

/// Record storage for escrows and disputes
#[async_trait]
pub trait SettlementStore: Send + Sync {
    /// Apply all writes atomically or none
    async fn commit(&self, writes: Vec<Write>) -> Result<()>;

    async fn escrow(&self, id: &EscrowId) -> Result<Option<EscrowTransaction>>;

    async fn escrows_by_status(&self, status: EscrowStatus) -> Result<Vec<EscrowTransaction>>;

    async fn dispute(&self, id: &DisputeId) -> Result<Option<Dispute>>;

    async fn disputes_for_escrow(&self, escrow_id: &EscrowId) -> Result<Vec<Dispute>>;

    /// Disputes not yet in a terminal state
    async fn open_disputes(&self) -> Result<Vec<Dispute>>;
}

#[derive(Default)]
struct StoreInner {
    escrows: HashMap<EscrowId, EscrowTransaction>,
    disputes: HashMap<DisputeId, Dispute>,
}

/// In-memory store; one write lock per commit
#[derive(Default)]
pub struct InMemorySettlementStore {
    inner: RwLock<StoreInner>,
}

impl InMemorySettlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn version_conflict(entity: impl ToString, expected: u64, found: u64) -> CovenantError {
    CovenantError::conflict(
        entity,
        format!("expected version {expected}, found {found}"),
    )
}

#[async_trait]
impl SettlementStore for InMemorySettlementStore {
    async fn commit(&self, writes: Vec<Write>) -> Result<()> {
        let mut inner = self.inner.write();

        for write in &writes {
            match write {
                Write::Escrow {
                    record,
                    expected_version,
                } => {
                    let found = inner.escrows.get(&record.id).map_or(0, |e| e.version);
                    if found != *expected_version {
                        return Err(version_conflict(&record.id, *expected_version, found));
                    }
                }
                Write::Dispute {
                    record,
                    expected_version,
                } => {
                    let found = inner.disputes.get(&record.id).map_or(0, |d| d.version);
                    if found != *expected_version {
                        return Err(version_conflict(&record.id, *expected_version, found));
                    }
                }
            }
        }

        for write in writes {
            match write {
                Write::Escrow { record, .. } => {
                    inner.escrows.insert(record.id.clone(), record);
                }
                Write::Dispute { record, .. } => {
                    inner.disputes.insert(record.id.clone(), record);
                }
            }
        }
        Ok(())
    }

    async fn escrow(&self, id: &EscrowId) -> Result<Option<EscrowTransaction>> {
        Ok(self.inner.read().escrows.get(id).cloned())
    }

    async fn escrows_by_status(&self, status: EscrowStatus) -> Result<Vec<EscrowTransaction>> {
        let mut escrows: Vec<_> = self
            .inner
            .read()
            .escrows
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        escrows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(escrows)
    }

    async fn dispute(&self, id: &DisputeId) -> Result<Option<Dispute>> {
        Ok(self.inner.read().disputes.get(id).cloned())
    }

    async fn disputes_for_escrow(&self, escrow_id: &EscrowId) -> Result<Vec<Dispute>> {
        let mut disputes: Vec<_> = self
            .inner
            .read()
            .disputes
            .values()
            .filter(|d| &d.escrow_id == escrow_id)
            .cloned()
            .collect();
        disputes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(disputes)
    }

    async fn open_disputes(&self) -> Result<Vec<Dispute>> {
        let mut disputes: Vec<_> = self
            .inner
            .read()
            .disputes
            .values()
            .filter(|d| !d.status.is_terminal())
            .cloned()
            .collect();
        disputes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(disputes)
    }
}
