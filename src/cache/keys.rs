// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deterministic cache keys and tags.
//!
//! ```text
//! org:{tenant}:{code}          single organization
//! orgs:{tenant}:{params-hash}  one page of a list query
//! stats:{tenant}               per-tenant aggregate
//! ```
//!
//! The shared tier prepends the configured namespace (`org_v1:`), so keys
//! here are namespace-free. List keys hash their parameters with SHA-256
//! so any `(first, offset, search)` combination maps to one stable key.

use sha2::{Digest, Sha256};

use super::entry::EntityKind;
use crate::org_unit::{ListParams, NaturalKey};

/// Page sizes the query layer uses by default.
pub const ENUMERATED_PAGE_SIZES: [u32; 2] = [50, 100];

/// Pages per size covered by invalidation-by-enumeration.
pub const ENUMERATED_PAGES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Organization { tenant_id: String, code: String },
    List { tenant_id: String, params: ListParams },
    Stats { tenant_id: String },
}

impl CacheKey {
    pub fn organization(tenant_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self::Organization {
            tenant_id: tenant_id.into(),
            code: code.into(),
        }
    }

    pub fn list(tenant_id: impl Into<String>, params: ListParams) -> Self {
        Self::List {
            tenant_id: tenant_id.into(),
            params,
        }
    }

    pub fn stats(tenant_id: impl Into<String>) -> Self {
        Self::Stats {
            tenant_id: tenant_id.into(),
        }
    }

    pub fn for_unit(key: &NaturalKey) -> Self {
        Self::organization(key.tenant_id.clone(), key.code.clone())
    }

    #[must_use]
    pub fn render(&self) -> String {
        match self {
            Self::Organization { tenant_id, code } => format!("org:{}:{}", tenant_id, code),
            Self::List { tenant_id, params } => format!("orgs:{}:{}", tenant_id, params_hash(params)),
            Self::Stats { tenant_id } => format!("stats:{}", tenant_id),
        }
    }

    /// Recover a key from its rendered form.
    ///
    /// List keys are one-way (hashed parameters) and yield `None`.
    #[must_use]
    pub fn parse(rendered: &str) -> Option<Self> {
        if let Some(rest) = rendered.strip_prefix("org:") {
            let (tenant, code) = rest.split_once(':')?;
            if tenant.is_empty() || code.is_empty() {
                return None;
            }
            return Some(Self::organization(tenant, code));
        }
        if let Some(tenant) = rendered.strip_prefix("stats:") {
            if tenant.is_empty() || tenant.contains(':') {
                return None;
            }
            return Some(Self::stats(tenant));
        }
        None
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Organization { .. } => EntityKind::Organization,
            Self::List { .. } => EntityKind::List,
            Self::Stats { .. } => EntityKind::Stats,
        }
    }

    #[must_use]
    pub fn tenant_id(&self) -> &str {
        match self {
            Self::Organization { tenant_id, .. }
            | Self::List { tenant_id, .. }
            | Self::Stats { tenant_id } => tenant_id,
        }
    }

    #[must_use]
    pub fn entity_id(&self) -> String {
        match self {
            Self::Organization { code, .. } => code.clone(),
            Self::List { params, .. } => format!("list_{}_{}", params.first, params.offset),
            Self::Stats { .. } => "stats".to_string(),
        }
    }

    /// Tags indexing this key in the shared tier, sorted. Every tag is
    /// scoped to the key's tenant.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        let tenant = self.tenant_id();
        let mut tags = vec![tenant_tag(tenant), kind_tag(tenant, self.kind())];
        if let Self::Organization { code, .. } = self {
            tags.push(org_tag(tenant, code));
        }
        tags.sort();
        tags
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

pub fn tenant_tag(tenant_id: &str) -> String {
    format!("tenant:{}", tenant_id)
}

pub fn org_tag(tenant_id: &str, code: &str) -> String {
    format!("tenant:{}:org:{}", tenant_id, code)
}

pub fn kind_tag(tenant_id: &str, kind: EntityKind) -> String {
    format!("tenant:{}:kind:{}", tenant_id, kind.as_str())
}

/// Tags of a rendered key, without needing its entry.
///
/// List keys are recognized by their `orgs:` prefix. Unknown shapes have no tags.
#[must_use]
pub fn tags_of(rendered: &str) -> Vec<String> {
    if let Some(key) = CacheKey::parse(rendered) {
        return key.tags();
    }
    match rendered.strip_prefix("orgs:").and_then(|rest| rest.split_once(':')) {
        Some((tenant, _)) => vec![tenant_tag(tenant), kind_tag(tenant, EntityKind::List)],
        None => Vec::new(),
    }
}

/// Stable 16-hex-digit hash of list parameters.
#[must_use]
pub fn params_hash(params: &ListParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params.first.to_be_bytes());
    hasher.update(params.offset.to_be_bytes());
    hasher.update(params.search_text.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

/// The bounded universe of list keys plausibly cached for a tenant:
/// every enumerated page size × page index with no search text.
#[must_use]
pub fn enumerated_list_keys(tenant_id: &str) -> Vec<String> {
    ENUMERATED_PAGE_SIZES
        .iter()
        .flat_map(|&size| {
            (0..ENUMERATED_PAGES).map(move |page| {
                CacheKey::list(tenant_id, ListParams::page(size, page * size)).render()
            })
        })
        .collect()
}
