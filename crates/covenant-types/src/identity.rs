//! Identity types for Covenant
//!
//! All identity types are strongly typed wrappers around UUIDs so that an
//! escrow id can never be passed where a dispute id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate ID types with common implementations
macro_rules! define_id_type {
    ($name:ident, $prefix:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random ID
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse from a string (with or without prefix)
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                let s = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the inner UUID
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

define_id_type!(AccountId, "acct", "Unique identifier for a platform user account");
define_id_type!(EscrowId, "escrow", "Unique identifier for an escrow transaction");
define_id_type!(DisputeId, "dispute", "Unique identifier for a dispute case");
define_id_type!(CommissionEntryId, "comm", "Unique identifier for a commission ledger entry");
define_id_type!(FraudRuleId, "rule", "Unique identifier for a fraud rule");
define_id_type!(AlertId, "alert", "Unique identifier for a fraud alert");
define_id_type!(BatchId, "batch", "Unique identifier for a treasury leg batch");

/// Caller-supplied token that makes a retried request side-effect free
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Maximum accepted key length
    pub const MAX_LEN: usize = 255;

    /// Create a key, rejecting empty or oversized tokens
    pub fn new(key: impl Into<String>) -> crate::Result<Self> {
        let key = key.into();
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(crate::CovenantError::validation(
                "idempotency_key",
                "must not be empty",
            ));
        }
        if trimmed.len() > Self::MAX_LEN {
            return Err(crate::CovenantError::validation(
                "idempotency_key",
                format!("must be at most {} characters", Self::MAX_LEN),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_display_round_trips() {
        let id = EscrowId::new();
        let text = id.to_string();
        assert!(text.starts_with("escrow_"));
        assert_eq!(EscrowId::parse(&text).unwrap(), id);
    }

    #[test]
    fn test_idempotency_key_validation() {
        assert!(IdempotencyKey::new("  ").is_err());
        assert!(IdempotencyKey::new("x".repeat(300)).is_err());
        assert_eq!(IdempotencyKey::new(" abc ").unwrap().as_str(), "abc");
    }
}
