// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache coherence for organization reads.
//!
//! ```text
//! get(key) ──► tier 1 (LocalCache) ──hit──► bytes
//!                 │ miss
//!                 ▼
//!              tier 2 (SharedCache) ──hit──► backfill tier 1 ──► bytes
//!                 │ miss / error
//!                 ▼
//!              tier 3 (SourceOfTruth) ──► populate tier 2, then tier 1 ──► bytes
//! ```
//!
//! After the applier writes a change, [`CacheManager::on_change`] brings the
//! tiers back in line with the replica, either by writing the new row
//! through (default) or by evicting everything the change could affect.
//! Cache failures never reach the applier: they are logged, counted and
//! reported in the returned [`CoherenceReport`].
//!
//! A tier-3 read can overlap a change. Each tenant carries a change
//! generation that `on_change` advances before touching the tiers; a fill
//! whose read started under an older generation is not cached, and one that
//! was written while the generation moved is evicted again. Organization
//! entries are also versioned by the row's `updated_at`, and tier 1 never
//! replaces a live entry with an older version.
//!
//! [`CacheManager::check_tiers`] samples keys and reports where tier 1 and
//! tier 2 disagree.

pub mod entry;
pub mod keys;
pub mod local;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::applier::AppliedChange;
use crate::cdc::Operation;
use crate::config::SyncConfig;
use crate::metrics;
use crate::org_unit::{ListParams, NaturalKey, OrgStats, OrgUnit};
use crate::storage::traits::{SharedCache, SourceOfTruth, StorageError};

use entry::{CacheEntry, EntityKind, Provenance};
use keys::{enumerated_list_keys, kind_tag, org_tag, CacheKey};
use local::{L1Stats, LocalCache};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("source of truth query failed: {0}")]
    Source(#[from] StorageError),
    #[error("cached payload could not be (de)serialized: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoherenceMode {
    WriteThrough,
    Traditional,
}

impl CoherenceMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WriteThrough => "write_through",
            Self::Traditional => "traditional",
        }
    }
}

/// What one `on_change` did to the tiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoherenceReport {
    pub mode: CoherenceMode,
    /// The entity was written into the tiers
    pub written: bool,
    /// Keys targeted for eviction
    pub targeted: usize,
    pub l1_evicted: usize,
    pub l2_evicted: usize,
    /// Tier-2 calls that failed and were skipped
    pub errors: usize,
}

/// How a sampled key disagrees between tier 1 and tier 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TierIssue {
    /// Present in one tier only
    Presence,
    /// Present in both with different payloads
    Content,
}

impl TierIssue {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Presence => "presence",
            Self::Content => "content",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierMismatch {
    pub key: String,
    pub issue: TierIssue,
    pub l1_exists: bool,
    pub l2_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l1_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub l2_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierCheckReport {
    pub total_checked: usize,
    pub mismatches: Vec<TierMismatch>,
    /// Keys skipped because tier 2 could not be read
    pub unreachable: usize,
    pub checked_at: DateTime<Utc>,
}

impl TierCheckReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.unreachable == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub l1: L1Stats,
    pub l2_connected: bool,
    pub mode: CoherenceMode,
}

pub struct CacheManager {
    local: LocalCache,
    shared: Arc<dyn SharedCache>,
    source: Arc<dyn SourceOfTruth>,
    l1_ttl: Duration,
    l2_ttl: Duration,
    write_through: bool,
    /// tenant → number of changes brought in line so far
    generations: DashMap<String, u64>,
}

impl CacheManager {
    pub fn new(config: &SyncConfig, shared: Arc<dyn SharedCache>, source: Arc<dyn SourceOfTruth>) -> Self {
        Self {
            local: LocalCache::new(config.l1_max_entries),
            shared,
            source,
            l1_ttl: config.l1_ttl(),
            l2_ttl: config.l2_ttl(),
            write_through: config.write_through,
            generations: DashMap::new(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> CoherenceMode {
        if self.write_through {
            CoherenceMode::WriteThrough
        } else {
            CoherenceMode::Traditional
        }
    }

    #[must_use]
    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    /// Read a rendered key through all tiers, returning the JSON payload.
    ///
    /// Entity and stats keys can be recomputed from tier 3. List keys only
    /// encode a hash of their parameters, so a list miss here returns
    /// `None`; use [`Self::list_organizations`] to fill them.
    #[tracing::instrument(skip(self), fields(tier))]
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let _timer = metrics::LatencyTimer::new("cache_get");

        if let Some(entry) = self.cached(key).await {
            return Ok(Some(entry.payload_bytes()?));
        }
        match CacheKey::parse(key) {
            Some(parsed) => match self.load(&parsed).await? {
                Some(entry) => Ok(Some(entry.payload_bytes()?)),
                None => Ok(None),
            },
            None => {
                debug!("Key not routable to the source of truth");
                Ok(None)
            }
        }
    }

    /// Read a typed key through all tiers.
    pub async fn fetch(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        if let Some(entry) = self.cached(&key.render()).await {
            return Ok(Some(entry));
        }
        self.load(key).await
    }

    pub async fn get_organization(&self, tenant_id: &str, code: &str) -> Result<Option<OrgUnit>, CacheError> {
        match self.fetch(&CacheKey::organization(tenant_id, code)).await? {
            Some(entry) => Ok(Some(serde_json::from_value(entry.payload)?)),
            None => Ok(None),
        }
    }

    pub async fn list_organizations(&self, tenant_id: &str, params: &ListParams) -> Result<Vec<OrgUnit>, CacheError> {
        match self.fetch(&CacheKey::list(tenant_id, params.clone())).await? {
            Some(entry) => Ok(serde_json::from_value(entry.payload)?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn organization_stats(&self, tenant_id: &str) -> Result<OrgStats, CacheError> {
        match self.fetch(&CacheKey::stats(tenant_id)).await? {
            Some(entry) => Ok(serde_json::from_value(entry.payload)?),
            None => Ok(OrgStats::default()),
        }
    }

    /// Tiers 1 and 2 only. Tier-2 failures count as a miss.
    async fn cached(&self, key: &str) -> Option<CacheEntry> {
        let now = Utc::now();

        if let Some(entry) = self.local.get(key, now) {
            tracing::Span::current().record("tier", "L1");
            metrics::record_cache_operation("L1", "get", "hit");
            return Some(entry);
        }
        metrics::record_cache_operation("L1", "get", "miss");

        match self.shared.get(key).await {
            Ok(Some(entry)) => {
                tracing::Span::current().record("tier", "L2");
                metrics::record_cache_operation("L2", "get", "hit");
                let ttl = self.l1_ttl.min(Duration::from_secs(entry.remaining_secs(now)));
                self.local.put(entry.with_ttl(ttl, now), now);
                debug!("L2 hit, backfilled L1");
                Some(entry)
            }
            Ok(None) => {
                metrics::record_cache_operation("L2", "get", "miss");
                None
            }
            Err(e) => {
                warn!(key, error = %e, "L2 lookup failed, falling through");
                metrics::record_cache_error("L2", "get");
                None
            }
        }
    }

    fn generation(&self, tenant_id: &str) -> u64 {
        self.generations.get(tenant_id).map(|g| *g).unwrap_or(0)
    }

    fn advance_generation(&self, tenant_id: &str) {
        *self.generations.entry(tenant_id.to_string()).or_insert(0) += 1;
    }

    /// Tier 3, then populate tier 2 and tier 1. Absent entities are not cached.
    ///
    /// The result is always returned to the caller, but it is only cached
    /// when no change to the tenant was brought in line during the read.
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let tenant = key.tenant_id();
        let started = self.generation(tenant);
        let read_at = Utc::now();

        let (payload, version): (Value, i64) = match key {
            CacheKey::Organization { tenant_id, code } => {
                match self.source.organization(&NaturalKey::new(tenant_id.clone(), code.clone())).await? {
                    Some(unit) => {
                        let version = unit.updated_at.timestamp_millis();
                        (serde_json::to_value(unit)?, version)
                    }
                    None => {
                        metrics::record_cache_operation("L3", "get", "miss");
                        return Ok(None);
                    }
                }
            }
            CacheKey::List { tenant_id, params } => (
                serde_json::to_value(self.source.organizations(tenant_id, params).await?)?,
                read_at.timestamp_millis(),
            ),
            CacheKey::Stats { tenant_id } => (
                serde_json::to_value(self.source.organization_stats(tenant_id).await?)?,
                read_at.timestamp_millis(),
            ),
        };
        tracing::Span::current().record("tier", "L3");
        metrics::record_cache_operation("L3", "get", "hit");

        let now = Utc::now();
        let entry = CacheEntry::new(key, payload, Provenance::Query, version, self.l2_ttl, now);
        if self.generation(tenant) != started {
            debug!(key = %entry.key, "Change applied during tier-3 read, fill not cached");
            metrics::record_superseded_fill();
            return Ok(Some(entry));
        }

        self.populate(&entry, now).await;
        if self.generation(tenant) != started {
            // The change may have been written before this fill landed
            debug!(key = %entry.key, "Change applied while filling, evicting fill");
            metrics::record_superseded_fill();
            self.evict(tenant, vec![entry.key.clone()], |_| false).await;
        }
        Ok(Some(entry))
    }

    /// Write to tier 2, then tier 1. Returns false when tier 2 refused.
    async fn populate(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let stored = match self.shared.put(entry, self.l2_ttl).await {
            Ok(()) => {
                metrics::record_cache_operation("L2", "put", "ok");
                true
            }
            Err(e) => {
                warn!(key = %entry.key, error = %e, "L2 write failed");
                metrics::record_cache_error("L2", "put");
                false
            }
        };
        self.local.put(entry.with_ttl(self.l1_ttl, now), now);
        metrics::record_cache_operation("L1", "put", "ok");
        stored
    }

    /// Bring the tiers in line with an applied change.
    #[tracing::instrument(
        skip(self, change),
        fields(tenant = %change.key.tenant_id, code = %change.key.code, op = %change.operation)
    )]
    pub async fn on_change(&self, change: &AppliedChange) -> CoherenceReport {
        let _timer = metrics::LatencyTimer::new("cache_coherence");
        self.advance_generation(&change.key.tenant_id);
        let report = if self.write_through {
            self.write_through(change).await
        } else {
            self.invalidate_related(change).await
        };

        metrics::record_cache_invalidation(report.mode.as_str(), report.targeted);
        debug!(
            written = report.written,
            targeted = report.targeted,
            l1_evicted = report.l1_evicted,
            l2_evicted = report.l2_evicted,
            errors = report.errors,
            "Cache brought in line"
        );
        report
    }

    async fn write_through(&self, change: &AppliedChange) -> CoherenceReport {
        let tenant = change.key.tenant_id.as_str();
        let entity = CacheKey::for_unit(&change.key);
        let mut errors = 0;
        let mut written = false;
        let mut targets: BTreeSet<String> = enumerated_list_keys(tenant).into_iter().collect();
        targets.insert(CacheKey::stats(tenant).render());

        match (&change.unit, change.operation) {
            (Some(unit), op) if op != Operation::Delete => match serde_json::to_value(unit) {
                Ok(payload) => {
                    let now = Utc::now();
                    let entry = CacheEntry::new(
                        &entity,
                        payload,
                        Provenance::SmartUpdate,
                        unit.updated_at.timestamp_millis(),
                        self.l2_ttl,
                        now,
                    );
                    if self.populate(&entry, now).await {
                        written = true;
                    } else {
                        // Tier 2 would keep serving the old row
                        errors += 1;
                        targets.insert(entity.render());
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Applied row not serializable, evicting instead");
                    errors += 1;
                    targets.insert(entity.render());
                }
            },
            _ => {
                targets.insert(entity.render());
            }
        }

        match self.shared.tagged(&[kind_tag(tenant, EntityKind::List)]).await {
            Ok(keys) => targets.extend(keys),
            Err(e) => {
                warn!(error = %e, "L2 tag lookup failed, searched lists may stay stale until TTL");
                metrics::record_cache_error("L2", "tagged");
                errors += 1;
            }
        }

        let (l1_evicted, l2_evicted, evict_errors) = self.evict(tenant, targets.iter().cloned().collect(), |e| {
            e.metadata.entity_kind == EntityKind::List
        })
        .await;

        CoherenceReport {
            mode: CoherenceMode::WriteThrough,
            written,
            targeted: targets.len(),
            l1_evicted,
            l2_evicted,
            errors: errors + evict_errors,
        }
    }

    async fn invalidate_related(&self, change: &AppliedChange) -> CoherenceReport {
        let tenant = change.key.tenant_id.as_str();
        let code = change.key.code.as_str();
        let mut errors = 0;
        let mut targets: BTreeSet<String> = BTreeSet::new();
        targets.insert(CacheKey::for_unit(&change.key).render());
        targets.insert(CacheKey::stats(tenant).render());

        for tag in [org_tag(tenant, code), kind_tag(tenant, EntityKind::List)] {
            match self.shared.tagged(std::slice::from_ref(&tag)).await {
                Ok(keys) => targets.extend(keys),
                Err(e) => {
                    warn!(error = %e, tag = %tag, "L2 tag lookup failed");
                    metrics::record_cache_error("L2", "tagged");
                    errors += 1;
                }
            }
        }

        let (l1_evicted, l2_evicted, evict_errors) = self.evict(tenant, targets.iter().cloned().collect(), |e| {
            e.metadata.entity_kind == EntityKind::List
                || (e.metadata.entity_kind == EntityKind::Organization && e.metadata.entity_id == code)
        })
        .await;

        CoherenceReport {
            mode: CoherenceMode::Traditional,
            written: false,
            targeted: targets.len(),
            l1_evicted,
            l2_evicted,
            errors: errors + evict_errors,
        }
    }

    /// Evict `keys` from both tiers, plus tier-1 entries of `tenant` matching
    /// `also_local`. Returns `(l1_evicted, l2_evicted, errors)`.
    async fn evict<F>(&self, tenant: &str, keys: Vec<String>, also_local: F) -> (usize, usize, usize)
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let mut l1 = self.local.remove_many(&keys);
        l1 += self
            .local
            .remove_where(|e| e.metadata.tenant_id == tenant && also_local(e));

        match self.shared.delete(&keys).await {
            Ok(removed) => (l1, removed, 0),
            Err(e) => {
                warn!(tenant, keys = keys.len(), error = %e, "L2 eviction failed, entries expire by TTL");
                metrics::record_cache_error("L2", "delete");
                (l1, 0, 1)
            }
        }
    }

    /// Manually evict cached results.
    ///
    /// `Organization` evicts the unit `id`; `Stats` ignores `id`; `List`
    /// evicts the list with params hash `id`, or every list of the tenant
    /// when `id` is empty. Returns the number of keys evicted across tiers.
    pub async fn refresh(&self, tenant_id: &str, kind: EntityKind, id: &str) -> usize {
        let keys: Vec<String> = match kind {
            EntityKind::Organization => vec![CacheKey::organization(tenant_id, id).render()],
            EntityKind::Stats => vec![CacheKey::stats(tenant_id).render()],
            EntityKind::List if !id.is_empty() => vec![format!("orgs:{}:{}", tenant_id, id)],
            EntityKind::List => {
                let mut keys: BTreeSet<String> = enumerated_list_keys(tenant_id).into_iter().collect();
                match self.shared.tagged(&[kind_tag(tenant_id, EntityKind::List)]).await {
                    Ok(tagged) => keys.extend(tagged),
                    Err(e) => {
                        warn!(tenant = tenant_id, error = %e, "L2 tag lookup failed during refresh");
                        metrics::record_cache_error("L2", "tagged");
                    }
                }
                keys.into_iter().collect()
            }
        };

        let whole_kind = kind == EntityKind::List && id.is_empty();
        let (l1, l2, _) = self
            .evict(tenant_id, keys, |e| whole_kind && e.metadata.entity_kind == EntityKind::List)
            .await;
        metrics::record_cache_invalidation("refresh", l1 + l2);
        l1 + l2
    }

    /// Compare `sample_keys` between tier 1 and tier 2.
    ///
    /// A key held by neither tier is consistent. A key held by one tier only
    /// is a presence mismatch, and a key held by both is compared by payload
    /// hash. Keys whose tier-2 read fails are counted as unreachable.
    pub async fn check_tiers(&self, sample_keys: &[String]) -> TierCheckReport {
        let now = Utc::now();
        let mut mismatches = Vec::new();
        let mut unreachable = 0;

        for key in sample_keys {
            let l1 = self.local.peek(key, now);
            let l2 = match self.shared.get(key).await {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(key, error = %e, "L2 read failed during tier check");
                    metrics::record_cache_error("L2", "check");
                    unreachable += 1;
                    continue;
                }
            };

            let l1_hash = l1.as_ref().map(payload_hash);
            let l2_hash = l2.as_ref().map(payload_hash);
            let issue = match (&l1_hash, &l2_hash) {
                (None, None) => None,
                (Some(a), Some(b)) if a == b => None,
                (Some(_), Some(_)) => Some(TierIssue::Content),
                _ => Some(TierIssue::Presence),
            };
            if let Some(issue) = issue {
                mismatches.push(TierMismatch {
                    key: key.clone(),
                    issue,
                    l1_exists: l1_hash.is_some(),
                    l2_exists: l2_hash.is_some(),
                    l1_hash,
                    l2_hash,
                });
            }
        }

        for issue in [TierIssue::Presence, TierIssue::Content] {
            let count = mismatches.iter().filter(|m| m.issue == issue).count();
            if count > 0 {
                metrics::record_tier_mismatches(issue.as_str(), count);
            }
        }
        if !mismatches.is_empty() {
            warn!(
                checked = sample_keys.len(),
                mismatches = mismatches.len(),
                "Tier 1 and tier 2 disagree"
            );
        }

        TierCheckReport {
            total_checked: sample_keys.len(),
            mismatches,
            unreachable,
            checked_at: now,
        }
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            l1: self.local.stats(),
            l2_connected: self.shared.ping().await,
            mode: self.mode(),
        }
    }
}

/// 16 hex digits of SHA-256 over the serialized payload.
fn payload_hash(entry: &CacheEntry) -> String {
    let digest = Sha256::digest(entry.payload.to_string().as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::SyncApplier;
    use crate::cdc::ChangeRecord;
    use crate::config::DeletePolicy;
    use crate::org_unit::OrgUnitImage;
    use crate::storage::memory::{InMemoryReplica, InMemorySharedCache};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    struct Harness {
        replica: Arc<InMemoryReplica>,
        shared: Arc<InMemorySharedCache>,
        applier: SyncApplier,
        cache: CacheManager,
    }

    fn harness(write_through: bool) -> Harness {
        let config = SyncConfig {
            write_through,
            ..SyncConfig::default()
        };
        let replica = Arc::new(InMemoryReplica::new());
        let shared = Arc::new(InMemorySharedCache::new());
        let applier = SyncApplier::new(replica.clone(), DeletePolicy::Soft);
        let cache = CacheManager::new(&config, shared.clone(), replica.clone());
        Harness {
            replica,
            shared,
            applier,
            cache,
        }
    }

    fn record(op: Operation, code: &str, name: Option<&str>) -> ChangeRecord {
        let image = OrgUnitImage {
            tenant_id: Some("t1".into()),
            code: Some(code.into()),
            name: name.map(String::from),
            ..Default::default()
        };
        if op == Operation::Delete {
            ChangeRecord::new(op, Some(image), None, "t0").unwrap()
        } else {
            ChangeRecord::new(op, None, Some(image), "t0").unwrap()
        }
    }

    async fn apply(h: &Harness, op: Operation, code: &str, name: Option<&str>) -> CoherenceReport {
        let applied = h.applier.apply(&record(op, code, name)).await.unwrap();
        h.cache.on_change(&applied).await
    }

    fn name_of(bytes: &[u8]) -> String {
        let value: Value = serde_json::from_slice(bytes).unwrap();
        value["name"].as_str().unwrap_or_default().to_string()
    }

    #[tokio::test]
    async fn test_read_through_populates_both_tiers() {
        let h = harness(true);
        h.applier.apply(&record(Operation::Create, "1000001", Some("Engineering"))).await.unwrap();

        let bytes = h.cache.get("org:t1:1000001").await.unwrap().unwrap();
        assert_eq!(name_of(&bytes), "Engineering");
        assert!(h.shared.contains("org:t1:1000001"));
        assert!(h.cache.local().contains("org:t1:1000001"));

        // Second read is a tier-1 hit
        h.cache.get("org:t1:1000001").await.unwrap();
        let stats = h.cache.stats().await;
        assert_eq!(stats.l1.hit_count, 1);
        assert!(stats.l2_connected);
    }

    #[tokio::test]
    async fn test_unknown_entity_is_not_cached() {
        let h = harness(true);
        assert!(h.cache.get("org:t1:ghost").await.unwrap().is_none());
        assert!(!h.shared.contains("org:t1:ghost"));
        assert!(h.cache.get("not-a-key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tier_two_hit_backfills_tier_one() {
        let h = harness(true);
        h.applier.apply(&record(Operation::Create, "1000001", Some("Engineering"))).await.unwrap();
        h.cache.get("org:t1:1000001").await.unwrap();
        h.cache.local().clear();

        let unit = h.cache.get_organization("t1", "1000001").await.unwrap().unwrap();
        assert_eq!(unit.name, "Engineering");
        assert!(h.cache.local().contains("org:t1:1000001"));
    }

    #[tokio::test]
    async fn test_write_through_update_is_visible() {
        let h = harness(true);
        apply(&h, Operation::Create, "1000001", Some("Engineering")).await;
        h.cache.get("org:t1:1000001").await.unwrap();

        let report = apply(&h, Operation::Update, "1000001", Some("Platform")).await;
        assert!(report.written);
        assert_eq!(report.mode, CoherenceMode::WriteThrough);

        let bytes = h.cache.get("org:t1:1000001").await.unwrap().unwrap();
        assert_eq!(name_of(&bytes), "Platform");
        let entry = h.shared.get("org:t1:1000001").await.unwrap().unwrap();
        assert_eq!(entry.metadata.source, Provenance::SmartUpdate);
    }

    #[tokio::test]
    async fn test_write_through_delete_evicts_entity() {
        let h = harness(true);
        apply(&h, Operation::Create, "1000001", Some("Engineering")).await;
        assert!(h.shared.contains("org:t1:1000001"));

        let report = apply(&h, Operation::Delete, "1000001", None).await;
        assert!(!report.written);
        assert!(!h.shared.contains("org:t1:1000001"));
        assert!(!h.cache.local().contains("org:t1:1000001"));

        // Soft-deleted row is recomputed from the replica
        let unit = h.cache.get_organization("t1", "1000001").await.unwrap().unwrap();
        assert_eq!(unit.status, "INACTIVE");
    }

    #[tokio::test]
    async fn test_any_change_invalidates_every_cached_list_of_tenant() {
        for write_through in [true, false] {
            let h = harness(write_through);
            apply(&h, Operation::Create, "a", Some("Alpha")).await;

            let page = ListParams::page(50, 0);
            let searched = ListParams::page(20, 0).with_search("alp");
            assert_eq!(h.cache.list_organizations("t1", &page).await.unwrap().len(), 1);
            assert_eq!(h.cache.list_organizations("t1", &searched).await.unwrap().len(), 1);
            assert_eq!(h.cache.organization_stats("t1").await.unwrap().total_count, 1);

            apply(&h, Operation::Create, "alpine", Some("Alpine")).await;

            assert_eq!(h.cache.list_organizations("t1", &page).await.unwrap().len(), 2);
            assert_eq!(h.cache.list_organizations("t1", &searched).await.unwrap().len(), 2);
            assert_eq!(h.cache.organization_stats("t1").await.unwrap().total_count, 2);
        }
    }

    #[tokio::test]
    async fn test_invalidation_stays_within_tenant() {
        let h = harness(true);
        let other = CacheKey::list("t2", ListParams::default());
        h.cache.fetch(&other).await.unwrap();
        assert!(h.shared.contains(&other.render()));

        apply(&h, Operation::Create, "a", Some("Alpha")).await;
        assert!(h.shared.contains(&other.render()));
        assert!(h.cache.local().contains(&other.render()));
    }

    #[tokio::test]
    async fn test_traditional_mode_evicts_instead_of_writing() {
        let h = harness(false);
        apply(&h, Operation::Create, "1000001", Some("Engineering")).await;
        h.cache.get("org:t1:1000001").await.unwrap();
        assert!(h.shared.contains("org:t1:1000001"));

        let report = apply(&h, Operation::Update, "1000001", Some("Platform")).await;
        assert_eq!(report.mode, CoherenceMode::Traditional);
        assert!(!report.written);
        assert!(report.l2_evicted >= 1);
        assert!(!h.shared.contains("org:t1:1000001"));

        let bytes = h.cache.get("org:t1:1000001").await.unwrap().unwrap();
        assert_eq!(name_of(&bytes), "Platform");
    }

    #[tokio::test]
    async fn test_refresh_evicts_requested_entries() {
        let h = harness(true);
        apply(&h, Operation::Create, "1000001", Some("Engineering")).await;
        h.cache.organization_stats("t1").await.unwrap();
        h.cache.list_organizations("t1", &ListParams::page(10, 0)).await.unwrap();

        assert!(h.cache.refresh("t1", EntityKind::Organization, "1000001").await >= 1);
        assert!(!h.shared.contains("org:t1:1000001"));

        assert!(h.cache.refresh("t1", EntityKind::Stats, "").await >= 1);
        assert!(!h.shared.contains("stats:t1"));

        assert!(h.cache.refresh("t1", EntityKind::List, "").await >= 1);
        let list = CacheKey::list("t1", ListParams::page(10, 0)).render();
        assert!(!h.shared.contains(&list));
        assert!(!h.cache.local().contains(&list));
    }

    /// Tier 2 that fails every call.
    struct DownCache;

    #[async_trait]
    impl SharedCache for DownCache {
        async fn get(&self, _key: &str) -> Result<Option<CacheEntry>, StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
        async fn put(&self, _entry: &CacheEntry, _ttl: Duration) -> Result<(), StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
        async fn delete(&self, _keys: &[String]) -> Result<usize, StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
        async fn tagged(&self, _tags: &[String]) -> Result<Vec<String>, StorageError> {
            Err(StorageError::Backend("connection refused".into()))
        }
        async fn ping(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_tier_check_reports_presence_and_content_mismatches() {
        let h = harness(true);
        apply(&h, Operation::Create, "a", Some("Alpha")).await;
        apply(&h, Operation::Create, "b", Some("Beta")).await;
        apply(&h, Operation::Create, "c", Some("Gamma")).await;
        let keys: Vec<String> = ["a", "b", "c", "ghost"].iter().map(|c| format!("org:t1:{}", c)).collect();

        assert!(h.cache.check_tiers(&keys).await.is_consistent());

        let mut drifted = h.shared.get("org:t1:b").await.unwrap().unwrap();
        drifted.payload["name"] = json!("Corrupted");
        h.shared.overwrite(drifted);
        h.cache.local().remove("org:t1:c");

        let report = h.cache.check_tiers(&keys).await;
        assert_eq!(report.total_checked, 4);
        assert_eq!(report.unreachable, 0);
        assert_eq!(report.mismatches.len(), 2);

        let b = report.mismatches.iter().find(|m| m.key == "org:t1:b").unwrap();
        assert_eq!(b.issue, TierIssue::Content);
        assert!(b.l1_exists && b.l2_exists);
        assert_ne!(b.l1_hash, b.l2_hash);

        let c = report.mismatches.iter().find(|m| m.key == "org:t1:c").unwrap();
        assert_eq!(c.issue, TierIssue::Presence);
        assert!(!c.l1_exists && c.l2_exists);
        assert!(c.l1_hash.is_none());

        // Checking does not disturb the hit counters
        assert_eq!(h.cache.stats().await.l1.hit_count, 0);
    }

    /// Source that parks the first organization read after fetching the row.
    struct ParkedSource {
        inner: Arc<InMemoryReplica>,
        park: AtomicBool,
        fetched: Notify,
        resume: Notify,
    }

    impl ParkedSource {
        fn new(inner: Arc<InMemoryReplica>) -> Self {
            Self {
                inner,
                park: AtomicBool::new(true),
                fetched: Notify::new(),
                resume: Notify::new(),
            }
        }
    }

    #[async_trait]
    impl SourceOfTruth for ParkedSource {
        async fn organization(&self, key: &NaturalKey) -> Result<Option<OrgUnit>, StorageError> {
            let unit = self.inner.organization(key).await?;
            if self.park.swap(false, Ordering::SeqCst) {
                self.fetched.notify_one();
                self.resume.notified().await;
            }
            Ok(unit)
        }
        async fn organizations(&self, tenant_id: &str, params: &ListParams) -> Result<Vec<OrgUnit>, StorageError> {
            self.inner.organizations(tenant_id, params).await
        }
        async fn organization_stats(&self, tenant_id: &str) -> Result<OrgStats, StorageError> {
            self.inner.organization_stats(tenant_id).await
        }
    }

    /// Tier 2 that parks the first read-through fill before storing it.
    struct ParkedShared {
        inner: Arc<InMemorySharedCache>,
        park: AtomicBool,
        reached: Notify,
        resume: Notify,
    }

    #[async_trait]
    impl SharedCache for ParkedShared {
        async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
            self.inner.get(key).await
        }
        async fn put(&self, entry: &CacheEntry, ttl: Duration) -> Result<(), StorageError> {
            if entry.metadata.source == Provenance::Query && self.park.swap(false, Ordering::SeqCst) {
                self.reached.notify_one();
                self.resume.notified().await;
            }
            self.inner.put(entry, ttl).await
        }
        async fn delete(&self, keys: &[String]) -> Result<usize, StorageError> {
            self.inner.delete(keys).await
        }
        async fn tagged(&self, tags: &[String]) -> Result<Vec<String>, StorageError> {
            self.inner.tagged(tags).await
        }
        async fn ping(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_change_during_tier_three_read_is_not_overwritten() {
        for write_through in [true, false] {
            let config = SyncConfig {
                write_through,
                ..SyncConfig::default()
            };
            let replica = Arc::new(InMemoryReplica::new());
            let shared = Arc::new(InMemorySharedCache::new());
            let source = Arc::new(ParkedSource::new(replica.clone()));
            let applier = SyncApplier::new(replica.clone(), DeletePolicy::Soft);
            let cache = Arc::new(CacheManager::new(&config, shared.clone(), source.clone()));

            applier.apply(&record(Operation::Create, "1000001", Some("Engineering"))).await.unwrap();
            let reader = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_organization("t1", "1000001").await.unwrap() })
            };
            source.fetched.notified().await;

            let applied = applier.apply(&record(Operation::Update, "1000001", Some("Platform"))).await.unwrap();
            cache.on_change(&applied).await;
            source.resume.notify_one();

            // The overlapping read may answer with the row it fetched...
            assert_eq!(reader.await.unwrap().unwrap().name, "Engineering");
            // ...but never leaves it behind in either tier
            if let Some(entry) = shared.get("org:t1:1000001").await.unwrap() {
                assert_eq!(entry.payload["name"], "Platform");
            }
            let unit = cache.get_organization("t1", "1000001").await.unwrap().unwrap();
            assert_eq!(unit.name, "Platform", "write_through={}", write_through);
            assert_eq!(shared.get("org:t1:1000001").await.unwrap().unwrap().payload["name"], "Platform");
        }
    }

    #[tokio::test]
    async fn test_change_while_fill_is_written_evicts_the_fill() {
        for write_through in [true, false] {
            let config = SyncConfig {
                write_through,
                ..SyncConfig::default()
            };
            let replica = Arc::new(InMemoryReplica::new());
            let shared = Arc::new(ParkedShared {
                inner: Arc::new(InMemorySharedCache::new()),
                park: AtomicBool::new(true),
                reached: Notify::new(),
                resume: Notify::new(),
            });
            let applier = SyncApplier::new(replica.clone(), DeletePolicy::Soft);
            let cache = Arc::new(CacheManager::new(&config, shared.clone(), replica.clone()));

            applier.apply(&record(Operation::Create, "1000001", Some("Engineering"))).await.unwrap();
            let reader = {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_organization("t1", "1000001").await.unwrap() })
            };
            shared.reached.notified().await;

            let applied = applier.apply(&record(Operation::Update, "1000001", Some("Platform"))).await.unwrap();
            cache.on_change(&applied).await;
            shared.resume.notify_one();
            reader.await.unwrap();

            assert!(!shared.inner.contains("org:t1:1000001"));
            assert!(!cache.local().contains("org:t1:1000001"));
            let unit = cache.get_organization("t1", "1000001").await.unwrap().unwrap();
            assert_eq!(unit.name, "Platform", "write_through={}", write_through);
        }
    }

    #[tokio::test]
    async fn test_tier_two_outage_is_absorbed() {
        let replica = Arc::new(InMemoryReplica::new());
        let applier = SyncApplier::new(replica.clone(), DeletePolicy::Soft);
        let cache = CacheManager::new(&SyncConfig::default(), Arc::new(DownCache), replica.clone());

        let applied = applier.apply(&record(Operation::Create, "1000001", Some("Engineering"))).await.unwrap();
        let report = cache.on_change(&applied).await;
        assert!(report.errors > 0);
        assert!(!report.written);

        let unit = cache.get_organization("t1", "1000001").await.unwrap().unwrap();
        assert_eq!(unit.name, "Engineering");
        assert!(!cache.stats().await.l2_connected);
        assert_eq!(cache.check_tiers(&["org:t1:1000001".to_string()]).await.unreachable, 1);
        assert_eq!(replica.len(), 1);
    }
}
