// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync applier: turns one [`ChangeRecord`] into replica writes.
//!
//! One parameterized applier serves both the table-change and domain-event
//! paths. Every write is keyed on the natural key and idempotent, so an
//! at-least-once transport can redeliver freely:
//!
//! | Operation          | Replica effect                                         |
//! |--------------------|--------------------------------------------------------|
//! | Create / Snapshot  | merge-patch upsert, then best-effort parent edge       |
//! | Update             | merge-patch of an existing row, unknown key is refused |
//! | Delete (soft)      | `status = INACTIVE`, row and edges kept                |
//! | Delete (hard)      | edges detached, row removed                            |
//!
//! Connection-level store failures come back as [`ApplyError::Transient`]
//! and the ingestion loop leaves the message uncommitted. Everything else,
//! including a statement the replica refused, is permanent.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cdc::{ChangeRecord, Operation};
use crate::config::DeletePolicy;
use crate::metrics;
use crate::org_unit::{derive_hierarchy, NaturalKey, OrgUnit, OrgUnitImage};
use crate::storage::traits::{EdgeOutcome, ReplicaStore, StorageError};

#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("replica unavailable while applying {operation} to {key}: {source}")]
    Transient {
        operation: Operation,
        key: NaturalKey,
        #[source]
        source: StorageError,
    },
    #[error("{operation} refers to unknown unit {key}")]
    UnknownKey { operation: Operation, key: NaturalKey },
    #[error("change for {key} rejected: {reason}")]
    Invalid { key: NaturalKey, reason: String },
    #[error("replica refused {operation} for {key}: {source}")]
    Refused {
        operation: Operation,
        key: NaturalKey,
        #[source]
        source: StorageError,
    },
}

impl ApplyError {
    /// Transient failures are retried by redelivery; the rest are skipped.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// What an applied change left behind, handed to the cache manager.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub operation: Operation,
    pub key: NaturalKey,
    /// Row as stored after the change. `None` once removed or never present.
    pub unit: Option<OrgUnit>,
    pub edge: EdgeOutcome,
    /// Deletes only: whether the key existed.
    pub found: bool,
    pub source_timestamp: Option<DateTime<Utc>>,
}

pub struct SyncApplier {
    replica: Arc<dyn ReplicaStore>,
    delete_policy: DeletePolicy,
}

impl SyncApplier {
    pub fn new(replica: Arc<dyn ReplicaStore>, delete_policy: DeletePolicy) -> Self {
        Self { replica, delete_policy }
    }

    #[must_use]
    pub fn delete_policy(&self) -> DeletePolicy {
        self.delete_policy
    }

    /// Apply `record` at the current processing time.
    pub async fn apply(&self, record: &ChangeRecord) -> Result<AppliedChange, ApplyError> {
        self.apply_at(record, Utc::now()).await
    }

    /// Apply `record` as if processed at `now`.
    ///
    /// `now` fixes the default effective date, `valid_from`, soft-delete
    /// stamps and the current-flag guard.
    #[tracing::instrument(
        skip(self, record),
        fields(tenant = %record.key().tenant_id, code = %record.key().code, op = %record.operation())
    )]
    pub async fn apply_at(&self, record: &ChangeRecord, now: DateTime<Utc>) -> Result<AppliedChange, ApplyError> {
        validate(record)?;

        let applied = match record.operation() {
            Operation::Create | Operation::Snapshot => self.upsert(record, now).await?,
            Operation::Update => self.update(record, now).await?,
            Operation::Delete => self.delete(record, now).await?,
        };

        debug!(found = applied.found, edge = ?applied.edge, "Change applied");
        Ok(applied)
    }

    async fn upsert(&self, record: &ChangeRecord, now: DateTime<Utc>) -> Result<AppliedChange, ApplyError> {
        let key = record.key();
        let failed = store_failure(record);
        let image = record.image();

        let parent = self.parent_row(key, image).await.map_err(&failed)?;
        let seed = OrgUnit::seed(key, image, parent.as_ref(), now);
        let patch = hierarchy_patch(key, image, parent.as_ref());

        self.replica
            .upsert(&seed, &patch, now.date_naive())
            .await
            .map_err(&failed)?;
        let edge = self.link_parent(key, image).await.map_err(&failed)?;
        let unit = self.replica.get(key).await.map_err(&failed)?;

        Ok(AppliedChange {
            operation: record.operation(),
            key: key.clone(),
            unit,
            edge,
            found: true,
            source_timestamp: record.source_timestamp(),
        })
    }

    async fn update(&self, record: &ChangeRecord, now: DateTime<Utc>) -> Result<AppliedChange, ApplyError> {
        let key = record.key();
        let failed = store_failure(record);
        let image = record.image();

        let parent = self.parent_row(key, image).await.map_err(&failed)?;
        let patch = hierarchy_patch(key, image, parent.as_ref());

        let found = self
            .replica
            .update(key, &patch, now.date_naive())
            .await
            .map_err(&failed)?;
        if !found {
            return Err(ApplyError::UnknownKey {
                operation: record.operation(),
                key: key.clone(),
            });
        }

        let edge = self.link_parent(key, image).await.map_err(&failed)?;
        let unit = self.replica.get(key).await.map_err(&failed)?;

        Ok(AppliedChange {
            operation: record.operation(),
            key: key.clone(),
            unit,
            edge,
            found,
            source_timestamp: record.source_timestamp(),
        })
    }

    async fn delete(&self, record: &ChangeRecord, now: DateTime<Utc>) -> Result<AppliedChange, ApplyError> {
        let key = record.key();
        let failed = store_failure(record);

        let (found, unit) = match self.delete_policy {
            DeletePolicy::Soft => {
                let found = self.replica.soft_delete(key, now).await.map_err(&failed)?;
                let unit = if found {
                    self.replica.get(key).await.map_err(&failed)?
                } else {
                    None
                };
                (found, unit)
            }
            DeletePolicy::Hard => (self.replica.hard_delete(key).await.map_err(&failed)?, None),
        };

        if !found {
            debug!("Delete for unknown unit, nothing to do");
        }

        Ok(AppliedChange {
            operation: record.operation(),
            key: key.clone(),
            unit,
            edge: EdgeOutcome::NotRequested,
            found,
            source_timestamp: record.source_timestamp(),
        })
    }

    async fn parent_row(&self, key: &NaturalKey, image: &OrgUnitImage) -> Result<Option<OrgUnit>, StorageError> {
        match image.parent() {
            Some(parent_code) => {
                self.replica
                    .get(&NaturalKey::new(key.tenant_id.clone(), parent_code))
                    .await
            }
            None => Ok(None),
        }
    }

    async fn link_parent(&self, key: &NaturalKey, image: &OrgUnitImage) -> Result<EdgeOutcome, StorageError> {
        let Some(parent_code) = image.parent() else {
            return Ok(EdgeOutcome::NotRequested);
        };

        let outcome = self
            .replica
            .link_parent(&key.tenant_id, parent_code, &key.code)
            .await?;
        if outcome == EdgeOutcome::ParentMissing {
            warn!(
                tenant = %key.tenant_id,
                code = %key.code,
                parent = %parent_code,
                "Parent not replicated yet, unit written without its edge"
            );
            metrics::record_orphan_edge();
        }
        Ok(outcome)
    }
}

fn store_failure(record: &ChangeRecord) -> impl Fn(StorageError) -> ApplyError + '_ {
    move |source| {
        metrics::record_store_error("replica", record.operation().as_str());
        let (operation, key) = (record.operation(), record.key().clone());
        if source.is_transient() {
            ApplyError::Transient { operation, key, source }
        } else {
            ApplyError::Refused { operation, key, source }
        }
    }
}

fn validate(record: &ChangeRecord) -> Result<(), ApplyError> {
    let key = record.key();
    let image = record.image();

    if key.tenant_id.contains(':') {
        return Err(ApplyError::Invalid {
            key: key.clone(),
            reason: "tenant id may not contain ':'".into(),
        });
    }
    if image.parent() == Some(key.code.as_str()) {
        return Err(ApplyError::Invalid {
            key: key.clone(),
            reason: "unit cannot be its own parent".into(),
        });
    }
    if matches!(image.level, Some(level) if level < 1) {
        return Err(ApplyError::Invalid {
            key: key.clone(),
            reason: format!("level must be at least 1, got {:?}", image.level),
        });
    }
    Ok(())
}

/// The image as a patch, with level and path derived when it names a
/// parent but carries neither. Keeps a moved unit's hierarchy in step.
fn hierarchy_patch(key: &NaturalKey, image: &OrgUnitImage, parent: Option<&OrgUnit>) -> OrgUnitImage {
    let mut patch = image.clone();
    let parent_code = image.parent();
    if parent_code.is_some() {
        let (level, path) = derive_hierarchy(&key.code, parent_code, parent);
        patch.level.get_or_insert(level);
        if patch.path.as_deref().map_or(true, str::is_empty) {
            patch.path = Some(path);
        }
    }
    patch
}
