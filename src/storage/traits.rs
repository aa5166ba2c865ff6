// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage seams: the replica the applier writes, the primary the checker
//! counts, the source-of-truth queries behind tier 3, and the shared
//! cache tier.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::cache::entry::CacheEntry;
use crate::org_unit::{ListParams, NaturalKey, OrgStats, OrgUnit, OrgUnitImage};

#[derive(Error, Debug)]
pub enum StorageError {
    /// Connection-level failure; the same call may succeed later.
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// The backend refused the statement itself (constraint, type, syntax).
    #[error("Storage backend rejected the operation: {0}")]
    Rejected(String),
    #[error("Stored row for '{key}' is unreadable: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Result of the best-effort parent edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeOutcome {
    /// The change named no parent.
    NotRequested,
    /// Edge exists (created now or earlier).
    Linked,
    /// Parent not replicated yet. The child was written without the edge.
    ParentMissing,
}

/// The graph-shaped query replica.
///
/// Every write is keyed on the natural key and atomic at the store level;
/// callers take no locks.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    async fn get(&self, key: &NaturalKey) -> Result<Option<OrgUnit>, StorageError>;

    /// Insert `seed` if the key is new; otherwise overwrite only the fields
    /// present in `patch`. `today` drives the current-flag guard.
    async fn upsert(&self, seed: &OrgUnit, patch: &OrgUnitImage, today: NaiveDate) -> Result<(), StorageError>;

    /// Patch an existing row. `Ok(false)` when the key is unknown.
    async fn update(&self, key: &NaturalKey, patch: &OrgUnitImage, today: NaiveDate) -> Result<bool, StorageError>;

    /// Ensure a `HAS_CHILD` edge from parent to child.
    async fn link_parent(&self, tenant_id: &str, parent_code: &str, child_code: &str) -> Result<EdgeOutcome, StorageError>;

    /// Mark INACTIVE and stamp `updated_at`. `Ok(false)` when the key is unknown.
    async fn soft_delete(&self, key: &NaturalKey, at: DateTime<Utc>) -> Result<bool, StorageError>;

    /// Detach every edge touching the unit and remove it. `Ok(false)` when the key is unknown.
    async fn hard_delete(&self, key: &NaturalKey) -> Result<bool, StorageError>;

    /// Child codes linked under `parent_code`, sorted.
    async fn children(&self, tenant_id: &str, parent_code: &str) -> Result<Vec<String>, StorageError>;

    /// Current ACTIVE units of a tenant. Must match [`PrimaryStore::count_active`] semantics.
    async fn count_active(&self, tenant_id: &str) -> Result<u64, StorageError>;
}

/// The relational system of record, read only.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Distinct current ACTIVE units of a tenant.
    async fn count_active(&self, tenant_id: &str) -> Result<u64, StorageError>;
}

/// Tier-3 queries served on a full cache miss.
#[async_trait]
pub trait SourceOfTruth: Send + Sync {
    async fn organization(&self, key: &NaturalKey) -> Result<Option<OrgUnit>, StorageError>;

    /// Units of a tenant ordered by `sort_order, code`. A non-empty search
    /// matches a substring of name or code.
    async fn organizations(&self, tenant_id: &str, params: &ListParams) -> Result<Vec<OrgUnit>, StorageError>;

    async fn organization_stats(&self, tenant_id: &str) -> Result<OrgStats, StorageError>;
}

/// Shared (tier-2) cache with a tag index.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError>;

    /// Store `entry` for `ttl` and index it under each of its tags.
    async fn put(&self, entry: &CacheEntry, ttl: Duration) -> Result<(), StorageError>;

    /// Remove keys. Returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StorageError>;

    /// Keys indexed under every tag in `tags`.
    async fn tagged(&self, tags: &[String]) -> Result<Vec<String>, StorageError>;

    async fn ping(&self) -> bool;
}
