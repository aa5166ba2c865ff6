// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory replica and shared cache, for tests and single-process demos.
//!
//! Both follow the SQL and Redis backends closely enough that the pipeline
//! behaves the same over either: merge-patch upserts with the current-flag
//! guard, one parent edge per child, tag sets intersected per query.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::traits::{EdgeOutcome, ReplicaStore, SharedCache, SourceOfTruth, StorageError};
use crate::cache::entry::CacheEntry;
use crate::org_unit::{ListParams, NaturalKey, OrgStats, OrgUnit, OrgUnitImage, STATUS_INACTIVE};

pub struct InMemoryReplica {
    units: DashMap<NaturalKey, OrgUnit>,
    /// child key → parent code
    parents: DashMap<NaturalKey, String>,
}

impl InMemoryReplica {
    #[must_use]
    pub fn new() -> Self {
        Self {
            units: DashMap::new(),
            parents: DashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    fn tenant_units(&self, tenant_id: &str) -> Vec<OrgUnit> {
        self.units
            .iter()
            .filter(|u| u.tenant_id == tenant_id)
            .map(|u| u.value().clone())
            .collect()
    }
}

impl Default for InMemoryReplica {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReplicaStore for InMemoryReplica {
    async fn get(&self, key: &NaturalKey) -> Result<Option<OrgUnit>, StorageError> {
        Ok(self.units.get(key).map(|u| u.value().clone()))
    }

    async fn upsert(&self, seed: &OrgUnit, patch: &OrgUnitImage, today: NaiveDate) -> Result<(), StorageError> {
        match self.units.entry(seed.key()) {
            Entry::Occupied(mut existing) => existing.get_mut().merge(patch, today),
            Entry::Vacant(slot) => {
                slot.insert(seed.clone());
            }
        }
        Ok(())
    }

    async fn update(&self, key: &NaturalKey, patch: &OrgUnitImage, today: NaiveDate) -> Result<bool, StorageError> {
        match self.units.get_mut(key) {
            Some(mut unit) => {
                unit.merge(patch, today);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn link_parent(&self, tenant_id: &str, parent_code: &str, child_code: &str) -> Result<EdgeOutcome, StorageError> {
        if !self.units.contains_key(&NaturalKey::new(tenant_id, parent_code)) {
            return Ok(EdgeOutcome::ParentMissing);
        }
        self.parents
            .insert(NaturalKey::new(tenant_id, child_code), parent_code.to_string());
        Ok(EdgeOutcome::Linked)
    }

    async fn soft_delete(&self, key: &NaturalKey, at: DateTime<Utc>) -> Result<bool, StorageError> {
        match self.units.get_mut(key) {
            Some(mut unit) => {
                unit.status = STATUS_INACTIVE.to_string();
                unit.updated_at = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hard_delete(&self, key: &NaturalKey) -> Result<bool, StorageError> {
        self.parents.remove(key);
        self.parents
            .retain(|child, parent| !(child.tenant_id == key.tenant_id && *parent == key.code));
        Ok(self.units.remove(key).is_some())
    }

    async fn children(&self, tenant_id: &str, parent_code: &str) -> Result<Vec<String>, StorageError> {
        let children: BTreeSet<String> = self
            .parents
            .iter()
            .filter(|e| e.key().tenant_id == tenant_id && e.value() == parent_code)
            .map(|e| e.key().code.clone())
            .collect();
        Ok(children.into_iter().collect())
    }

    async fn count_active(&self, tenant_id: &str) -> Result<u64, StorageError> {
        Ok(self
            .units
            .iter()
            .filter(|u| u.tenant_id == tenant_id && u.is_current && u.is_active())
            .count() as u64)
    }
}

#[async_trait]
impl SourceOfTruth for InMemoryReplica {
    async fn organization(&self, key: &NaturalKey) -> Result<Option<OrgUnit>, StorageError> {
        ReplicaStore::get(self, key).await
    }

    async fn organizations(&self, tenant_id: &str, params: &ListParams) -> Result<Vec<OrgUnit>, StorageError> {
        let needle = params.search_text.to_lowercase();
        let mut units: Vec<OrgUnit> = self
            .tenant_units(tenant_id)
            .into_iter()
            .filter(|u| {
                needle.is_empty()
                    || u.name.to_lowercase().contains(&needle)
                    || u.code.to_lowercase().contains(&needle)
            })
            .collect();
        units.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.code.cmp(&b.code)));

        Ok(units
            .into_iter()
            .skip(params.offset as usize)
            .take(params.first as usize)
            .collect())
    }

    async fn organization_stats(&self, tenant_id: &str) -> Result<OrgStats, StorageError> {
        Ok(OrgStats::from_units(&self.tenant_units(tenant_id)))
    }
}

/// Shared-tier stand-in with per-entry expiry and a tag index.
///
/// Tag members carry their entry's expiry, like the scores of the Redis
/// sorted sets, and expired members are pruned whenever a set is touched.
pub struct InMemorySharedCache {
    entries: DashMap<String, (CacheEntry, DateTime<Utc>)>,
    tags: DashMap<String, BTreeMap<String, DateTime<Utc>>>,
}

impl InMemorySharedCache {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            tags: DashMap::new(),
        }
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| e.1 > Utc::now())
            .unwrap_or(false)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Members currently held by a tag set, live or not yet pruned.
    #[must_use]
    pub fn tag_size(&self, tag: &str) -> usize {
        self.tags.get(tag).map(|m| m.len()).unwrap_or(0)
    }

    /// Replace a stored entry without touching its expiry or tags.
    pub fn overwrite(&self, entry: CacheEntry) {
        if let Some(mut stored) = self.entries.get_mut(&entry.key) {
            stored.0 = entry;
        }
    }
}

impl Default for InMemorySharedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let now = Utc::now();
        let hit = self
            .entries
            .get(key)
            .filter(|e| e.1 > now)
            .map(|e| e.0.clone());
        if hit.is_none() {
            self.entries.remove_if(key, |_, e| e.1 <= now);
        }
        Ok(hit)
    }

    async fn put(&self, entry: &CacheEntry, ttl: Duration) -> Result<(), StorageError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let now = Utc::now();
        let expires = now + ttl;
        self.entries.insert(entry.key.clone(), (entry.clone(), expires));
        for tag in &entry.tags {
            let mut members = self.tags.entry(tag.clone()).or_default();
            members.retain(|_, until| *until > now);
            members.insert(entry.key.clone(), expires);
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in keys {
            if let Some((_, (entry, _))) = self.entries.remove(key) {
                removed += 1;
                for tag in &entry.tags {
                    if let Some(mut members) = self.tags.get_mut(tag) {
                        members.remove(key);
                    }
                }
            }
        }
        Ok(removed)
    }

    async fn tagged(&self, tags: &[String]) -> Result<Vec<String>, StorageError> {
        let now = Utc::now();
        let mut keys: Option<Vec<String>> = None;
        for tag in tags {
            let live: Vec<String> = match self.tags.get_mut(tag) {
                Some(mut members) => {
                    members.retain(|_, until| *until > now);
                    members.keys().cloned().collect()
                }
                None => Vec::new(),
            };
            keys = Some(match keys {
                None => live,
                Some(mut acc) => {
                    acc.retain(|k| live.contains(k));
                    acc
                }
            });
        }
        Ok(keys.unwrap_or_default())
    }

    async fn ping(&self) -> bool {
        true
    }
}
