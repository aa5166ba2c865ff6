// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Domain-event decoder.
//!
//! The command side publishes typed business events. They carry no
//! before/after pair, so each kind is mapped onto the change record the
//! table-change path would have produced:
//!
//! | Event                 | Operation | Governing image                                  |
//! |-----------------------|-----------|--------------------------------------------------|
//! | `OrganizationCreated` | Create    | name, unit type, parent, created_at              |
//! | `OrganizationUpdated` | Update    | the `changes` map, typed                         |
//! | `OrganizationDeleted` | Delete    | key plus `deleted_at`                            |

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::date::optional_timestamp;
use super::{prepare_payload, ChangeRecord, DecodeError, Operation};
use crate::org_unit::OrgUnitImage;

/// Transport header naming the event type.
pub const EVENT_TYPE_HEADER: &str = "event-type";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainEventKind {
    Created,
    Updated,
    Deleted,
}

impl DomainEventKind {
    /// Parse the `event-type` header. Unknown types are `None` and ignored upstream.
    #[must_use]
    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type.trim() {
            "OrganizationCreated" => Some(Self::Created),
            "OrganizationUpdated" => Some(Self::Updated),
            "OrganizationDeleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "OrganizationCreated",
            Self::Updated => "OrganizationUpdated",
            Self::Deleted => "OrganizationDeleted",
        }
    }
}

#[derive(Debug, Deserialize)]
struct OrganizationCreated {
    aggregate_id: String,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    unit_type: Option<String>,
    #[serde(default)]
    parent_code: Option<String>,
    #[serde(default, deserialize_with = "optional_timestamp")]
    created_at: Option<DateTime<Utc>>,
}

/// Fields an update event may change. Unlisted keys are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct OrganizationChanges {
    name: Option<String>,
    unit_type: Option<String>,
    status: Option<String>,
    description: Option<String>,
    sort_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct OrganizationUpdated {
    aggregate_id: String,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    changes: OrganizationChanges,
    #[serde(default, deserialize_with = "optional_timestamp")]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct OrganizationDeleted {
    aggregate_id: String,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default, deserialize_with = "optional_timestamp")]
    deleted_at: Option<DateTime<Utc>>,
}

/// Decodes domain events for one configured default tenant.
#[derive(Debug, Clone)]
pub struct DomainEventDecoder {
    default_tenant: String,
}

impl DomainEventDecoder {
    pub fn new(default_tenant: impl Into<String>) -> Self {
        Self {
            default_tenant: default_tenant.into(),
        }
    }

    pub fn decode(&self, kind: DomainEventKind, raw: &[u8]) -> Result<ChangeRecord, DecodeError> {
        let payload = prepare_payload(raw)?;

        let (operation, image, stamp) = match kind {
            DomainEventKind::Created => {
                let event: OrganizationCreated = serde_json::from_slice(&payload)?;
                let image = OrgUnitImage {
                    tenant_id: event.tenant_id,
                    code: Some(event.aggregate_id),
                    parent_code: event.parent_code.filter(|p| !p.is_empty()),
                    name: event.name,
                    unit_type: event.unit_type.filter(|t| !t.is_empty()),
                    created_at: event.created_at,
                    updated_at: event.created_at,
                    ..Default::default()
                };
                (Operation::Create, image, event.created_at)
            }
            DomainEventKind::Updated => {
                let event: OrganizationUpdated = serde_json::from_slice(&payload)?;
                let changes = event.changes;
                let image = OrgUnitImage {
                    tenant_id: event.tenant_id,
                    code: Some(event.aggregate_id),
                    name: changes.name,
                    unit_type: changes.unit_type,
                    status: changes.status,
                    description: changes.description,
                    sort_order: changes.sort_order,
                    updated_at: event.updated_at,
                    ..Default::default()
                };
                (Operation::Update, image, event.updated_at)
            }
            DomainEventKind::Deleted => {
                let event: OrganizationDeleted = serde_json::from_slice(&payload)?;
                let image = OrgUnitImage {
                    tenant_id: event.tenant_id,
                    code: Some(event.aggregate_id),
                    updated_at: event.deleted_at,
                    ..Default::default()
                };
                (Operation::Delete, image, event.deleted_at)
            }
        };

        let record = if operation.is_upsert() {
            ChangeRecord::new(operation, None, Some(image), &self.default_tenant)?
        } else {
            ChangeRecord::new(operation, Some(image), None, &self.default_tenant)?
        };
        Ok(record.with_source_timestamp(stamp))
    }
}
