// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache entry format shared by tier 1 and tier 2.
//!
//! Tier 2 stores entries as JSON documents:
//! ```json
//! {
//!   "key": "org:t1:1000001",
//!   "payload": {"code": "1000001", "name": "Engineering", ...},
//!   "metadata": {
//!     "tenant_id": "t1", "entity_kind": "organization", "entity_id": "1000001",
//!     "version": 1754827200000, "last_modified": "2025-08-10T12:00:00Z",
//!     "source": "smart-update"
//!   },
//!   "tags": ["tenant:t1", "tenant:t1:kind:organization", "tenant:t1:org:1000001"],
//!   "created_at": "...", "expires_at": "..."
//! }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::keys::CacheKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Organization,
    List,
    Stats,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organization => "organization",
            Self::List => "list",
            Self::Stats => "stats",
        }
    }
}

/// Where a cached payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// Written while applying a change event
    Cdc,
    /// Filled on a read-through miss
    Query,
    /// Write-through of the applied row
    SmartUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub tenant_id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    /// Logical clock: epoch millis of the source row or of the fill
    pub version: i64,
    pub last_modified: DateTime<Utc>,
    pub source: Provenance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Serialized result
    pub payload: Value,
    pub metadata: CacheMetadata,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(
        key: &CacheKey,
        payload: Value,
        source: Provenance,
        version: i64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.render(),
            payload,
            metadata: CacheMetadata {
                tenant_id: key.tenant_id().to_string(),
                entity_kind: key.kind(),
                entity_id: key.entity_id(),
                version,
                last_modified: now,
                source,
            },
            tags: key.tags(),
            created_at: now,
            expires_at: expiry(now, ttl),
        }
    }

    /// Copy with its own expiry, for the other tier.
    #[must_use]
    pub fn with_ttl(&self, ttl: Duration, now: DateTime<Utc>) -> Self {
        let mut copy = self.clone();
        copy.expires_at = expiry(now, ttl);
        copy
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn payload_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.payload)
    }

    /// Seconds left before expiry, at least one.
    #[must_use]
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(1) as u64
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_carries_key_metadata_and_tags() {
        let now = Utc::now();
        let key = CacheKey::organization("t1", "1000001");
        let entry = CacheEntry::new(&key, json!({"name": "Engineering"}), Provenance::SmartUpdate, 7, Duration::from_secs(60), now);

        assert_eq!(entry.key, "org:t1:1000001");
        assert_eq!(entry.metadata.entity_kind, EntityKind::Organization);
        assert_eq!(entry.metadata.entity_id, "1000001");
        assert_eq!(entry.metadata.version, 7);
        assert!(entry.tags.contains(&"tenant:t1".to_string()));
        assert!(entry.tags.contains(&"tenant:t1:org:1000001".to_string()));
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn test_provenance_wire_names() {
        assert_eq!(serde_json::to_string(&Provenance::SmartUpdate).unwrap(), "\"smart-update\"");
        assert_eq!(serde_json::to_string(&Provenance::Cdc).unwrap(), "\"cdc\"");
        assert_eq!(serde_json::to_string(&EntityKind::Stats).unwrap(), "\"stats\"");
    }

    #[test]
    fn test_with_ttl_only_changes_expiry() {
        let now = Utc::now();
        let key = CacheKey::stats("t1");
        let entry = CacheEntry::new(&key, json!({"total_count": 1}), Provenance::Query, 1, Duration::from_secs(1800), now);
        let local = entry.with_ttl(Duration::from_secs(300), now);

        assert_eq!(local.payload, entry.payload);
        assert_eq!(local.key, entry.key);
        assert!(local.expires_at < entry.expires_at);
        assert_eq!(local.remaining_secs(now), 300);
    }
}
