// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Organization unit data structures.
//!
//! [`OrgUnitImage`] is a possibly partial row image as carried by a change
//! event: every field is optional and absent fields mean "keep what the
//! replica already has". [`OrgUnit`] is the full, defaulted row the replica
//! stores and the cache serves.
//!
//! # Example
//!
//! ```
//! use org_sync::{NaturalKey, OrgUnit, OrgUnitImage};
//! use chrono::Utc;
//!
//! let key = NaturalKey::new("t1", "1000001");
//! let image = OrgUnitImage { name: Some("Engineering".into()), ..Default::default() };
//!
//! let unit = OrgUnit::seed(&key, &image, None, Utc::now());
//! assert_eq!(unit.name, "Engineering");
//! assert_eq!(unit.unit_type, "DEPARTMENT");
//! assert_eq!(unit.path, "/1000001");
//! assert_eq!(unit.level, 1);
//! ```

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cdc::date;

pub const STATUS_ACTIVE: &str = "ACTIVE";
pub const STATUS_INACTIVE: &str = "INACTIVE";
pub const DEFAULT_UNIT_TYPE: &str = "DEPARTMENT";

/// Relationship label stored on hierarchy edges.
pub const EDGE_HAS_CHILD: &str = "HAS_CHILD";

/// `(tenant_id, code)`: identifies a unit across the primary, the replica and the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub tenant_id: String,
    pub code: String,
}

impl NaturalKey {
    pub fn new(tenant_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            code: code.into(),
        }
    }

    /// Deterministic graph node id. Re-applying a change never mints a new node.
    #[must_use]
    pub fn node_id(&self) -> Uuid {
        let name = format!("{}:{}", self.tenant_id, self.code);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}

impl std::fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.code)
    }
}

/// Possibly partial row image from a change event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrgUnitImage {
    pub tenant_id: Option<String>,
    pub code: Option<String>,
    pub parent_code: Option<String>,
    pub name: Option<String>,
    pub unit_type: Option<String>,
    pub status: Option<String>,
    pub level: Option<i64>,
    pub path: Option<String>,
    pub sort_order: Option<i64>,
    pub description: Option<String>,
    #[serde(deserialize_with = "date::optional_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "date::optional_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "date::optional_date")]
    pub effective_date: Option<NaiveDate>,
    #[serde(deserialize_with = "date::optional_date")]
    pub end_date: Option<NaiveDate>,
    pub is_current: Option<bool>,
    pub is_temporal: Option<bool>,
    pub change_reason: Option<String>,
    pub version: Option<i64>,
}

impl OrgUnitImage {
    /// Parent code, treating an empty string as no parent.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        self.parent_code.as_deref().filter(|p| !p.is_empty())
    }
}

/// Full replica row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgUnit {
    pub node_id: Uuid,
    pub tenant_id: String,
    pub code: String,
    pub parent_code: Option<String>,
    pub name: String,
    pub unit_type: String,
    pub status: String,
    pub level: i64,
    pub path: String,
    pub sort_order: i64,
    pub description: String,
    pub effective_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub is_current: bool,
    pub is_temporal: bool,
    pub change_reason: String,
    pub version: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// System time the replica first saw this unit
    pub valid_from: DateTime<Utc>,
    /// Open-ended system time bound
    pub valid_to: DateTime<Utc>,
}

/// Upper bound for open system-time validity: 9999-12-31T23:59:59Z.
#[must_use]
pub fn open_valid_to() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Level and path for a unit that doesn't carry them.
///
/// Known parent: one level below it. Parent named but not yet replicated:
/// assume it is a root, so level 2 and `/<parent>/<code>`. No parent: root.
#[must_use]
pub fn derive_hierarchy(code: &str, parent_code: Option<&str>, parent: Option<&OrgUnit>) -> (i64, String) {
    match (parent_code, parent) {
        (Some(_), Some(p)) => (p.level + 1, format!("{}/{}", p.path.trim_end_matches('/'), code)),
        (Some(pc), None) => (2, format!("/{}/{}", pc, code)),
        (None, _) => (1, format!("/{}", code)),
    }
}

/// `is_current` holds only while `end_date` is absent or after `today`.
#[must_use]
pub fn current_flag(is_current: bool, end_date: Option<NaiveDate>, today: NaiveDate) -> bool {
    match end_date {
        Some(end) if end <= today => false,
        _ => is_current,
    }
}

impl OrgUnit {
    /// Build the row written on first insert: `image` over explicit defaults.
    ///
    /// `parent` is the replica's current row for `image.parent_code`, used to
    /// derive level and path when the image has none.
    pub fn seed(key: &NaturalKey, image: &OrgUnitImage, parent: Option<&OrgUnit>, now: DateTime<Utc>) -> Self {
        let parent_code = image.parent().map(String::from);
        let (derived_level, derived_path) = derive_hierarchy(&key.code, parent_code.as_deref(), parent);
        let today = now.date_naive();
        let end_date = image.end_date;

        Self {
            node_id: key.node_id(),
            tenant_id: key.tenant_id.clone(),
            code: key.code.clone(),
            parent_code,
            name: image.name.clone().unwrap_or_default(),
            unit_type: image.unit_type.clone().unwrap_or_else(|| DEFAULT_UNIT_TYPE.to_string()),
            status: image.status.clone().unwrap_or_else(|| STATUS_ACTIVE.to_string()),
            level: image.level.unwrap_or(derived_level),
            path: image.path.clone().filter(|p| !p.is_empty()).unwrap_or(derived_path),
            sort_order: image.sort_order.unwrap_or(0),
            description: image.description.clone().unwrap_or_default(),
            effective_date: Some(image.effective_date.unwrap_or(today)),
            end_date,
            is_current: current_flag(image.is_current.unwrap_or(true), end_date, today),
            is_temporal: image.is_temporal.unwrap_or(false),
            change_reason: image.change_reason.clone().unwrap_or_default(),
            version: image.version,
            created_at: image.created_at.unwrap_or(now),
            updated_at: image.updated_at.unwrap_or(now),
            valid_from: now,
            valid_to: open_valid_to(),
        }
    }

    /// Overwrite only the fields present in `patch`, then re-check the current flag.
    pub fn merge(&mut self, patch: &OrgUnitImage, today: NaiveDate) {
        if let Some(ref v) = patch.parent_code {
            self.parent_code = Some(v.clone()).filter(|p| !p.is_empty());
        }
        if let Some(ref v) = patch.name {
            self.name = v.clone();
        }
        if let Some(ref v) = patch.unit_type {
            self.unit_type = v.clone();
        }
        if let Some(ref v) = patch.status {
            self.status = v.clone();
        }
        if let Some(v) = patch.level {
            self.level = v;
        }
        if let Some(ref v) = patch.path {
            if !v.is_empty() {
                self.path = v.clone();
            }
        }
        if let Some(v) = patch.sort_order {
            self.sort_order = v;
        }
        if let Some(ref v) = patch.description {
            self.description = v.clone();
        }
        if let Some(v) = patch.created_at {
            self.created_at = v;
        }
        if let Some(v) = patch.updated_at {
            self.updated_at = v;
        }
        if let Some(v) = patch.effective_date {
            self.effective_date = Some(v);
        }
        if let Some(v) = patch.end_date {
            self.end_date = Some(v);
        }
        if let Some(v) = patch.is_current {
            self.is_current = v;
        }
        if let Some(v) = patch.is_temporal {
            self.is_temporal = v;
        }
        if let Some(ref v) = patch.change_reason {
            self.change_reason = v.clone();
        }
        if let Some(v) = patch.version {
            self.version = Some(v);
        }
        self.is_current = current_flag(self.is_current, self.end_date, today);
    }

    #[must_use]
    pub fn key(&self) -> NaturalKey {
        NaturalKey::new(self.tenant_id.clone(), self.code.clone())
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == STATUS_ACTIVE
    }
}

/// Paging and search for organization lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListParams {
    pub first: u32,
    pub offset: u32,
    #[serde(default)]
    pub search_text: String,
}

impl ListParams {
    pub fn page(first: u32, offset: u32) -> Self {
        Self {
            first,
            offset,
            search_text: String::new(),
        }
    }

    pub fn with_search(mut self, text: impl Into<String>) -> Self {
        self.search_text = text.into();
        self
    }
}

impl Default for ListParams {
    fn default() -> Self {
        Self::page(50, 0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCount {
    pub unit_type: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelCount {
    pub level: i64,
    pub count: u64,
}

/// Per-tenant aggregate served under the stats cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgStats {
    pub total_count: u64,
    pub by_type: Vec<TypeCount>,
    pub by_status: Vec<StatusCount>,
    pub by_level: Vec<LevelCount>,
}

impl OrgStats {
    /// Aggregate a tenant's units. Buckets come out sorted by key.
    pub fn from_units<'a>(units: impl IntoIterator<Item = &'a OrgUnit>) -> Self {
        use std::collections::BTreeMap;

        let mut by_type: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_status: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_level: BTreeMap<i64, u64> = BTreeMap::new();
        let mut total = 0u64;

        for unit in units {
            total += 1;
            *by_type.entry(unit.unit_type.clone()).or_default() += 1;
            *by_status.entry(unit.status.clone()).or_default() += 1;
            *by_level.entry(unit.level).or_default() += 1;
        }

        Self {
            total_count: total,
            by_type: by_type.into_iter().map(|(unit_type, count)| TypeCount { unit_type, count }).collect(),
            by_status: by_status.into_iter().map(|(status, count)| StatusCount { status, count }).collect(),
            by_level: by_level.into_iter().map(|(level, count)| LevelCount { level, count }).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_node_id_is_deterministic_per_key() {
        let a = NaturalKey::new("t1", "1000001");
        let b = NaturalKey::new("t1", "1000001");
        let c = NaturalKey::new("t2", "1000001");
        assert_eq!(a.node_id(), b.node_id());
        assert_ne!(a.node_id(), c.node_id());
    }

    #[test]
    fn test_seed_applies_defaults() {
        let key = NaturalKey::new("t1", "1000001");
        let unit = OrgUnit::seed(&key, &OrgUnitImage::default(), None, now());

        assert_eq!(unit.unit_type, DEFAULT_UNIT_TYPE);
        assert_eq!(unit.status, STATUS_ACTIVE);
        assert_eq!(unit.level, 1);
        assert_eq!(unit.path, "/1000001");
        assert_eq!(unit.sort_order, 0);
        assert_eq!(unit.description, "");
        assert_eq!(unit.change_reason, "");
        assert!(unit.is_current);
        assert_eq!(unit.effective_date, Some(now().date_naive()));
        assert_eq!(unit.valid_to, open_valid_to());
    }

    #[test]
    fn test_seed_derives_hierarchy_from_parent() {
        let parent_key = NaturalKey::new("t1", "1000000");
        let mut parent = OrgUnit::seed(&parent_key, &OrgUnitImage::default(), None, now());
        parent.level = 2;
        parent.path = "/root/1000000".into();

        let image = OrgUnitImage {
            parent_code: Some("1000000".into()),
            ..Default::default()
        };
        let child = OrgUnit::seed(&NaturalKey::new("t1", "1000001"), &image, Some(&parent), now());
        assert_eq!(child.level, 3);
        assert_eq!(child.path, "/root/1000000/1000001");

        let orphan = OrgUnit::seed(&NaturalKey::new("t1", "1000002"), &image, None, now());
        assert_eq!(orphan.level, 2);
        assert_eq!(orphan.path, "/1000000/1000002");
    }

    #[test]
    fn test_explicit_level_and_path_win() {
        let image = OrgUnitImage {
            parent_code: Some("1000000".into()),
            level: Some(5),
            path: Some("/a/b/c/d/x".into()),
            ..Default::default()
        };
        let unit = OrgUnit::seed(&NaturalKey::new("t1", "x"), &image, None, now());
        assert_eq!(unit.level, 5);
        assert_eq!(unit.path, "/a/b/c/d/x");
    }

    #[test]
    fn test_merge_only_touches_present_fields() {
        let key = NaturalKey::new("t1", "1000001");
        let image = OrgUnitImage {
            name: Some("Engineering".into()),
            description: Some("builds things".into()),
            sort_order: Some(7),
            ..Default::default()
        };
        let mut unit = OrgUnit::seed(&key, &image, None, now());
        let before = unit.clone();

        unit.merge(
            &OrgUnitImage {
                name: Some("Platform".into()),
                ..Default::default()
            },
            now().date_naive(),
        );

        assert_eq!(unit.name, "Platform");
        assert_eq!(unit.description, before.description);
        assert_eq!(unit.sort_order, before.sort_order);
        assert_eq!(unit.status, before.status);
        assert_eq!(unit.path, before.path);
    }

    #[test]
    fn test_past_end_date_clears_current_flag() {
        let today = now().date_naive();
        let ended = NaiveDate::from_ymd_opt(2025, 8, 10).unwrap();
        let future = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();

        assert!(!current_flag(true, Some(ended), today));
        assert!(current_flag(true, Some(future), today));
        assert!(current_flag(true, None, today));
        assert!(!current_flag(false, None, today));
    }

    #[test]
    fn test_stats_from_units() {
        let mk = |code: &str, unit_type: &str, status: &str, level: i64| {
            let mut u = OrgUnit::seed(&NaturalKey::new("t1", code), &OrgUnitImage::default(), None, now());
            u.unit_type = unit_type.into();
            u.status = status.into();
            u.level = level;
            u
        };
        let units = vec![
            mk("a", "DEPARTMENT", STATUS_ACTIVE, 1),
            mk("b", "DEPARTMENT", STATUS_INACTIVE, 2),
            mk("c", "COMPANY", STATUS_ACTIVE, 2),
        ];

        let stats = OrgStats::from_units(&units);
        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.by_type, vec![
            TypeCount { unit_type: "COMPANY".into(), count: 1 },
            TypeCount { unit_type: "DEPARTMENT".into(), count: 2 },
        ]);
        assert_eq!(stats.by_status.len(), 2);
        assert_eq!(stats.by_level, vec![
            LevelCount { level: 1, count: 1 },
            LevelCount { level: 2, count: 2 },
        ]);
    }
}
