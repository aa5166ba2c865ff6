// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change Data Capture (CDC) decoding.
//!
//! Turns raw transport payloads into typed [`ChangeRecord`]s. Two inbound
//! shapes are supported:
//!
//! ## Table-change envelope (raw CDC topic)
//! ```text
//! {
//!   "op": "c" | "u" | "d" | "r",
//!   "before": { ...row image... } | null,
//!   "after":  { ...row image... } | null,
//!   "source": { "connector": "postgresql", "db": "...", "table": "organization_units", ... },
//!   "ts_ms": 1754827200000
//! }
//! ```
//! optionally wrapped as `{"schema": {...}, "payload": {...envelope...}}`.
//!
//! ## Domain events (domain-event topic)
//! `OrganizationCreated` / `OrganizationUpdated` / `OrganizationDeleted`,
//! the type carried in the `event-type` header. See [`domain`].
//!
//! # Compression
//!
//! Producers may zstd-compress payloads. Data starting with the zstd magic
//! bytes is inflated before parsing; anything else is parsed as-is.
//!
//! # Errors
//!
//! Every [`DecodeError`] is permanent: the payload itself is malformed, so the
//! ingestion loop commits past it instead of retrying.

pub mod date;
pub mod domain;
pub mod envelope;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::io::Read;
use thiserror::Error;

use crate::org_unit::{NaturalKey, OrgUnitImage};

pub use domain::{DomainEventDecoder, DomainEventKind, EVENT_TYPE_HEADER};
pub use envelope::EnvelopeDecoder;

/// zstd magic bytes: 0x28 0xB5 0x2F 0xFD
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("payload is empty (tombstone)")]
    EmptyPayload,
    #[error("payload could not be decompressed: {0}")]
    Decompress(#[from] std::io::Error),
    #[error("payload is not a valid change event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown operation code '{0}'")]
    UnknownOperation(String),
    #[error("{op} change is missing its '{image}' image")]
    MissingImage { op: Operation, image: &'static str },
    #[error("change image has no natural key code")]
    MissingCode,
}

/// Kind of change carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Initial snapshot read. Applied exactly like Create.
    Snapshot,
}

impl Operation {
    /// Map a connector op code (`c`, `u`, `d`, `r`).
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "c" => Some(Self::Create),
            "u" => Some(Self::Update),
            "d" => Some(Self::Delete),
            "r" => Some(Self::Snapshot),
            _ => None,
        }
    }

    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Snapshot => "snapshot",
        }
    }

    /// Create, Update or Snapshot: the `after` image governs.
    #[must_use]
    pub fn is_upsert(&self) -> bool {
        !matches!(self, Self::Delete)
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin metadata attached by the connector. Logged, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SourceInfo {
    pub version: Option<String>,
    pub connector: Option<String>,
    pub name: Option<String>,
    pub db: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub ts_ms: Option<i64>,
}

/// One decoded unit of work.
///
/// Construction guarantees the governing image is present (`after` for
/// upserts, `before` for deletes) and that the natural key is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    operation: Operation,
    key: NaturalKey,
    image: OrgUnitImage,
    counterpart: Option<OrgUnitImage>,
    source_timestamp: Option<DateTime<Utc>>,
    source: Option<SourceInfo>,
}

impl ChangeRecord {
    /// Validate images and resolve the natural key.
    ///
    /// Images without a tenant take `default_tenant`; the resolved tenant is
    /// written back into the governing image.
    pub fn new(
        operation: Operation,
        before: Option<OrgUnitImage>,
        after: Option<OrgUnitImage>,
        default_tenant: &str,
    ) -> Result<Self, DecodeError> {
        let (image, counterpart, image_name) = if operation.is_upsert() {
            (after, before, "after")
        } else {
            (before, after, "before")
        };
        let mut image = image.ok_or(DecodeError::MissingImage { op: operation, image: image_name })?;

        let code = image
            .code
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or(DecodeError::MissingCode)?;
        let tenant = image
            .tenant_id
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| default_tenant.to_string());
        image.tenant_id = Some(tenant.clone());

        Ok(Self {
            operation,
            key: NaturalKey::new(tenant, code),
            image,
            counterpart,
            source_timestamp: None,
            source: None,
        })
    }

    pub fn with_source_timestamp(mut self, ts: Option<DateTime<Utc>>) -> Self {
        self.source_timestamp = ts;
        self
    }

    pub fn with_source(mut self, source: Option<SourceInfo>) -> Self {
        self.source = source;
        self
    }

    #[must_use]
    pub fn operation(&self) -> Operation {
        self.operation
    }

    #[must_use]
    pub fn key(&self) -> &NaturalKey {
        &self.key
    }

    /// The governing image: `after` for upserts, `before` for deletes.
    #[must_use]
    pub fn image(&self) -> &OrgUnitImage {
        &self.image
    }

    #[must_use]
    pub fn before(&self) -> Option<&OrgUnitImage> {
        if self.operation.is_upsert() {
            self.counterpart.as_ref()
        } else {
            Some(&self.image)
        }
    }

    #[must_use]
    pub fn after(&self) -> Option<&OrgUnitImage> {
        if self.operation.is_upsert() {
            Some(&self.image)
        } else {
            self.counterpart.as_ref()
        }
    }

    /// Origin commit time. For logs and metrics only, never for ordering.
    #[must_use]
    pub fn source_timestamp(&self) -> Option<DateTime<Utc>> {
        self.source_timestamp
    }

    #[must_use]
    pub fn source(&self) -> Option<&SourceInfo> {
        self.source.as_ref()
    }
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    if is_zstd_compressed(data) {
        let mut decoder = zstd::Decoder::new(data)?;
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Check if data appears to be zstd-compressed
pub fn is_zstd_compressed(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Inflate and trim a payload, rejecting tombstones.
pub(crate) fn prepare_payload(raw: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let data = maybe_decompress(raw)?;
    let trimmed = data.trim_ascii();
    if trimmed.is_empty() || trimmed == b"null" {
        return Err(DecodeError::EmptyPayload);
    }
    Ok(trimmed.to_vec())
}
