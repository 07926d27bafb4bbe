//! Idempotency record storage

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use covenant_types::{IdempotencyKey, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Cached outcome of one idempotent operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub operation: String,
    pub entity_id: String,
    pub key: IdempotencyKey,
    /// SHA-256 of the canonical request
    pub fingerprint: String,
    /// Serialized successful result
    pub result: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Persistence for idempotency records
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(
        &self,
        operation: &str,
        entity_id: &str,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>>;

    /// Insert or overwrite the record for its `(operation, entity, key)`
    async fn put(&self, record: IdempotencyRecord) -> Result<()>;

    /// Delete records expired at `now`, returning how many were removed
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

type RecordKey = (String, String, String);

/// DashMap-backed store
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<RecordKey, IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn record_key(operation: &str, entity_id: &str, key: &IdempotencyKey) -> RecordKey {
    (
        operation.to_string(),
        entity_id.to_string(),
        key.as_str().to_string(),
    )
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(
        &self,
        operation: &str,
        entity_id: &str,
        key: &IdempotencyKey,
    ) -> Result<Option<IdempotencyRecord>> {
        Ok(self
            .records
            .get(&record_key(operation, entity_id, key))
            .map(|r| r.value().clone()))
    }

    async fn put(&self, record: IdempotencyRecord) -> Result<()> {
        let k = record_key(&record.operation, &record.entity_id, &record.key);
        self.records.insert(k, record);
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let before = self.records.len();
        self.records.retain(|_, r| !r.is_expired_at(now));
        Ok(before.saturating_sub(self.records.len()))
    }
}
