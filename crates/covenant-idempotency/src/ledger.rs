//! Idempotency Ledger
//!
//! Serializes all mutating work per entity and guarantees that a request
//! carrying the same idempotency key runs its side effects at most once.
//! Successful results are cached as serialized bytes and replayed verbatim.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use covenant_types::{Clock, CovenantError, IdempotencyKey, Result};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::{IdempotencyRecord, IdempotencyStore};

/// Idempotency ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// How long cached results are replayed
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Bounded wait for the per-entity lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_retention_secs() -> u64 {
    7 * 24 * 3600
}

fn default_lock_timeout_ms() -> u64 {
    2_000
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl IdempotencyConfig {
    pub fn retention(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.retention_secs as i64)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Whether the result was produced now or replayed from the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Executed,
    /// Same key seen before; the original result is returned unchanged
    Replayed,
}

/// Outcome of an idempotent execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Executed<T> {
    pub value: T,
    pub disposition: Disposition,
}

impl<T> Executed<T> {
    pub fn is_replay(&self) -> bool {
        self.disposition == Disposition::Replayed
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Executed<U> {
        Executed {
            value: f(self.value),
            disposition: self.disposition,
        }
    }
}

/// Proof that the holder runs inside the ledger under the entity lock
///
/// Only the ledger can construct one, so money-moving code that demands a
/// permit cannot be reached outside an idempotent execution.
#[derive(Debug)]
pub struct SettlementPermit {
    operation: String,
    entity_id: String,
    key: IdempotencyKey,
    issued_at: DateTime<Utc>,
}

impl SettlementPermit {
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    /// Instant the execution started; used as "now" by the guarded work
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Fail unless the permit guards the given entity
    pub fn ensure_entity(&self, entity_id: &str) -> Result<()> {
        if self.entity_id != entity_id {
            return Err(CovenantError::internal(format!(
                "permit for {} used on {}",
                self.entity_id, entity_id
            )));
        }
        Ok(())
    }
}

/// SHA-256 over the canonical JSON form of a request
///
/// Object keys are sorted, so field order does not change the fingerprint.
pub fn fingerprint<T: Serialize>(request: &T) -> Result<String> {
    let canonical = serde_json::to_value(request)?;
    let bytes = serde_json::to_vec(&canonical)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Exactly-once executor with per-entity exclusion
pub struct IdempotencyLedger {
    store: Arc<dyn IdempotencyStore>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

impl IdempotencyLedger {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        clock: Arc<dyn Clock>,
        config: IdempotencyConfig,
    ) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            clock,
            config,
        }
    }

    fn entity_lock(&self, entity_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(entity_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` at most once for `(operation, entity_id, key)`
    ///
    /// `f` must not call back into the ledger for the same entity; the
    /// entity lock is not re-entrant.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        entity_id: &str,
        key: &IdempotencyKey,
        fingerprint: &str,
        f: F,
    ) -> Result<Executed<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(SettlementPermit) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.entity_lock(entity_id);
        let _guard = tokio::time::timeout(self.config.lock_timeout(), lock.lock_owned())
            .await
            .map_err(|_| {
                warn!(operation, entity_id, "Timed out waiting for entity lock");
                CovenantError::conflict(entity_id, "timed out waiting for entity lock")
            })?;

        let now = self.clock.now();
        if let Some(record) = self.store.get(operation, entity_id, key).await? {
            if !record.is_expired_at(now) {
                if record.fingerprint != fingerprint {
                    return Err(CovenantError::validation(
                        "idempotency_key",
                        format!("key {key} was already used with different parameters"),
                    ));
                }
                debug!(operation, entity_id, key = %key, "Replaying cached result");
                let value = serde_json::from_slice(&record.result)?;
                return Ok(Executed {
                    value,
                    disposition: Disposition::Replayed,
                });
            }
        }

        let permit = SettlementPermit {
            operation: operation.to_string(),
            entity_id: entity_id.to_string(),
            key: key.clone(),
            issued_at: now,
        };
        let value = f(permit).await?;

        let record = IdempotencyRecord {
            operation: operation.to_string(),
            entity_id: entity_id.to_string(),
            key: key.clone(),
            fingerprint: fingerprint.to_string(),
            result: serde_json::to_vec(&value)?,
            created_at: now,
            expires_at: now + self.config.retention(),
        };
        self.store.put(record).await?;

        Ok(Executed {
            value,
            disposition: Disposition::Executed,
        })
    }

    /// Cached result bytes for a key, if still retained
    pub async fn cached_result(
        &self,
        operation: &str,
        entity_id: &str,
        key: &IdempotencyKey,
    ) -> Result<Option<Vec<u8>>> {
        let now = self.clock.now();
        Ok(self
            .store
            .get(operation, entity_id, key)
            .await?
            .filter(|r| !r.is_expired_at(now))
            .map(|r| r.result))
    }

    /// Delete expired records and drop idle entity locks
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.store.delete_expired(now).await?;
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        if removed > 0 {
            info!(removed, "Reaped expired idempotency records");
        }
        Ok(removed)
    }
}
