// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Tier 1: process-local cache.
//!
//! A DashMap of entries with per-entry expiry and an entry cap. Nothing is
//! persisted, so a restart empties it. Expired entries are dropped lazily on
//! read and eagerly when the cap is reached. At the cap, the soonest-expiring
//! sixteenth of the entries goes in one pass, so a full cache scans once per
//! batch of inserts rather than once per insert.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

use super::entry::CacheEntry;

/// Tier-1 counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct L1Stats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub size: usize,
    pub hit_rate: f64,
}

pub struct LocalCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LocalCache {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        let found = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value().clone()),
            Some(_) => {
                // Guard dropped at end of arm; remove after
                None
            }
            None => None,
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Like [`Self::get`] but leaves the hit and miss counters alone.
    #[must_use]
    pub fn peek(&self, key: &str, now: DateTime<Utc>) -> Option<CacheEntry> {
        self.entries
            .get(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| e.value().clone())
    }

    /// Store `entry` unless a live entry with a newer version holds the key.
    /// Returns whether it was stored.
    pub fn put(&self, entry: CacheEntry, now: DateTime<Utc>) -> bool {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&entry.key) {
            self.make_room(now);
        }
        let stored = match self.entries.entry(entry.key.clone()) {
            Entry::Occupied(resident)
                if !resident.get().is_expired(now) && resident.get().metadata.version > entry.metadata.version =>
            {
                false
            }
            Entry::Occupied(mut resident) => {
                resident.insert(entry);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        };
        crate::metrics::set_l1_entries(self.entries.len());
        stored
    }

    /// Drop expired entries; if still full, drop the soonest-expiring batch.
    fn make_room(&self, now: DateTime<Utc>) {
        self.entries.retain(|_, e| !e.is_expired(now));
        if self.entries.len() < self.max_entries {
            return;
        }
        let batch = (self.max_entries / 16).max(1) + self.entries.len() - self.max_entries;
        let mut by_expiry: Vec<(DateTime<Utc>, String)> =
            self.entries.iter().map(|e| (e.expires_at, e.key().clone())).collect();
        if batch < by_expiry.len() {
            by_expiry.select_nth_unstable(batch - 1);
            by_expiry.truncate(batch);
        }
        for (_, key) in by_expiry {
            self.entries.remove(&key);
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove `keys`, returning how many were present.
    pub fn remove_many(&self, keys: &[String]) -> usize {
        keys.iter().filter(|k| self.remove(k)).count()
    }

    /// Remove every entry matching `predicate`.
    pub fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, e| !predicate(e));
        let removed = before.saturating_sub(self.entries.len());
        crate::metrics::set_l1_entries(self.entries.len());
        removed
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn stats(&self) -> L1Stats {
        let hit_count = self.hits.load(Ordering::Relaxed);
        let miss_count = self.misses.load(Ordering::Relaxed);
        let total = hit_count + miss_count;
        L1Stats {
            hit_count,
            miss_count,
            size: self.entries.len(),
            hit_rate: if total == 0 { 0.0 } else { hit_count as f64 / total as f64 },
        }
    }
}
