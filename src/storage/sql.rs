// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL replica: the graph-shaped read model as two tables.
//!
//! Units are rows keyed on the natural key; hierarchy edges live in their
//! own table so children can be listed and a hard delete can detach a unit
//! in both directions:
//!
//! ```sql
//! CREATE TABLE org_units (
//!   tenant_id, code,            -- natural key (PRIMARY KEY)
//!   node_id,                    -- UUIDv5 of "tenant:code"
//!   parent_code, name, unit_type, status, level, path, sort_order,
//!   description, effective_date, end_date, is_current, is_temporal,
//!   change_reason, version,
//!   created_at, updated_at,     -- source timestamps, RFC 3339
//!   valid_from, valid_to        -- system-time validity, RFC 3339
//! )
//! CREATE TABLE org_edges (tenant_id, parent_code, child_code, rel, created_at)
//! ```
//!
//! ## Merge-patch in one statement
//!
//! A change image only overwrites the fields it carries. Rather than read,
//! merge and write back (racy across workers), every absent field binds
//! `NULL` and the statement keeps the stored value with `COALESCE(?, col)`.
//! The current-flag guard runs in the same statement, so a row whose
//! `end_date` is on or before the processing date is never stored current.
//!
//! ## sqlx Any Driver Quirks
//!
//! Dates are `YYYY-MM-DD` text and timestamps RFC 3339 text so lexical and
//! chronological order agree on both backends. MySQL returns TEXT columns
//! as bytes through `Any`, so strings are read as `String` first, then as
//! `Vec<u8>`. Booleans are stored as integers.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row};
use std::sync::Once;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::traits::{EdgeOutcome, ReplicaStore, SourceOfTruth, StorageError};
use crate::cdc::date;
use crate::org_unit::{
    LevelCount, ListParams, NaturalKey, OrgStats, OrgUnit, OrgUnitImage, StatusCount, TypeCount,
    EDGE_HAS_CHILD, STATUS_ACTIVE, STATUS_INACTIVE,
};
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

type AnyQuery<'q> = sqlx::query::Query<'q, Any, AnyArguments<'q>>;

/// Classify a driver error: connection trouble and lock contention are
/// worth retrying, anything the database refused outright is not.
pub(crate) fn backend(e: sqlx::Error) -> StorageError {
    if is_transient_sql(&e) {
        StorageError::Backend(e.to_string())
    } else {
        StorageError::Rejected(e.to_string())
    }
}

fn is_transient_sql(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // Serialization failure / deadlock (SQLSTATE), SQLITE_BUSY and SQLITE_LOCKED
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001" | "40P01" | "5" | "6")),
        _ => false,
    }
}

/// Open an `Any` pool with startup-mode retry (fails fast if config is wrong).
pub(crate) async fn connect(connection_string: &str, max_connections: u32) -> Result<AnyPool, StorageError> {
    install_drivers();

    retry("sql_connect", &RetryConfig::startup(), || async {
        AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect(connection_string)
            .await
            .map_err(backend)
    })
    .await
}

/// Read a text column: SQLite yields `String`, MySQL TEXT comes back as bytes.
pub(crate) fn text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

pub(crate) fn int(row: &AnyRow, column: &str) -> Option<i64> {
    row.try_get::<i64, _>(column)
        .ok()
        .or_else(|| row.try_get::<i32, _>(column).ok().map(i64::from))
}

fn flag(row: &AnyRow, column: &str) -> Option<bool> {
    int(row, column)
        .map(|v| v != 0)
        .or_else(|| row.try_get::<bool, _>(column).ok())
}

fn stamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_stamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|ts| ts.with_timezone(&Utc))
}

const UNIT_COLUMNS: &str = "tenant_id, code, node_id, parent_code, name, unit_type, status, level, path, \
    sort_order, description, effective_date, end_date, is_current, is_temporal, change_reason, version, \
    created_at, updated_at, valid_from, valid_to";

const UNIT_PLACEHOLDERS: &str = "?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?";

/// Assignments applied to an existing row. Bound by [`PatchBinds::bind`].
///
/// `is_current` is assigned before `end_date`: MySQL evaluates assignments
/// left to right, SQLite against the old row, and both then agree.
const PATCH_SET: &str = "
    parent_code = NULLIF(COALESCE(?, parent_code), ''),
    name = COALESCE(?, name),
    unit_type = COALESCE(?, unit_type),
    status = COALESCE(?, status),
    level = COALESCE(?, level),
    path = COALESCE(?, path),
    sort_order = COALESCE(?, sort_order),
    description = COALESCE(?, description),
    effective_date = COALESCE(?, effective_date),
    is_current = CASE
        WHEN COALESCE(?, end_date) IS NOT NULL AND COALESCE(?, end_date) <= ? THEN 0
        ELSE COALESCE(?, is_current)
    END,
    end_date = COALESCE(?, end_date),
    is_temporal = COALESCE(?, is_temporal),
    change_reason = COALESCE(?, change_reason),
    version = COALESCE(?, version),
    created_at = COALESCE(?, created_at),
    updated_at = COALESCE(?, updated_at)";

/// Owned bind values for a full row insert.
#[derive(Clone)]
struct SeedBinds {
    tenant_id: String,
    code: String,
    node_id: String,
    parent_code: Option<String>,
    name: String,
    unit_type: String,
    status: String,
    level: i64,
    path: String,
    sort_order: i64,
    description: String,
    effective_date: Option<String>,
    end_date: Option<String>,
    is_current: i64,
    is_temporal: i64,
    change_reason: String,
    version: Option<i64>,
    created_at: String,
    updated_at: String,
    valid_from: String,
    valid_to: String,
}

impl SeedBinds {
    fn new(unit: &OrgUnit) -> Self {
        Self {
            tenant_id: unit.tenant_id.clone(),
            code: unit.code.clone(),
            node_id: unit.node_id.to_string(),
            parent_code: unit.parent_code.clone(),
            name: unit.name.clone(),
            unit_type: unit.unit_type.clone(),
            status: unit.status.clone(),
            level: unit.level,
            path: unit.path.clone(),
            sort_order: unit.sort_order,
            description: unit.description.clone(),
            effective_date: unit.effective_date.as_ref().map(date::canonical),
            end_date: unit.end_date.as_ref().map(date::canonical),
            is_current: i64::from(unit.is_current),
            is_temporal: i64::from(unit.is_temporal),
            change_reason: unit.change_reason.clone(),
            version: unit.version,
            created_at: stamp(&unit.created_at),
            updated_at: stamp(&unit.updated_at),
            valid_from: stamp(&unit.valid_from),
            valid_to: stamp(&unit.valid_to),
        }
    }

    fn bind(self, query: AnyQuery<'_>) -> AnyQuery<'_> {
        query
            .bind(self.tenant_id)
            .bind(self.code)
            .bind(self.node_id)
            .bind(self.parent_code)
            .bind(self.name)
            .bind(self.unit_type)
            .bind(self.status)
            .bind(self.level)
            .bind(self.path)
            .bind(self.sort_order)
            .bind(self.description)
            .bind(self.effective_date)
            .bind(self.end_date)
            .bind(self.is_current)
            .bind(self.is_temporal)
            .bind(self.change_reason)
            .bind(self.version)
            .bind(self.created_at)
            .bind(self.updated_at)
            .bind(self.valid_from)
            .bind(self.valid_to)
    }
}

/// Owned bind values for [`PATCH_SET`]. `None` keeps the stored value.
#[derive(Clone)]
struct PatchBinds {
    parent_code: Option<String>,
    name: Option<String>,
    unit_type: Option<String>,
    status: Option<String>,
    level: Option<i64>,
    path: Option<String>,
    sort_order: Option<i64>,
    description: Option<String>,
    effective_date: Option<String>,
    end_date: Option<String>,
    is_current: Option<i64>,
    is_temporal: Option<i64>,
    change_reason: Option<String>,
    version: Option<i64>,
    created_at: Option<String>,
    updated_at: Option<String>,
    today: String,
}

impl PatchBinds {
    fn new(patch: &OrgUnitImage, today: NaiveDate) -> Self {
        Self {
            parent_code: patch.parent_code.clone(),
            name: patch.name.clone(),
            unit_type: patch.unit_type.clone(),
            status: patch.status.clone(),
            level: patch.level,
            path: patch.path.clone().filter(|p| !p.is_empty()),
            sort_order: patch.sort_order,
            description: patch.description.clone(),
            effective_date: patch.effective_date.as_ref().map(date::canonical),
            end_date: patch.end_date.as_ref().map(date::canonical),
            is_current: patch.is_current.map(i64::from),
            is_temporal: patch.is_temporal.map(i64::from),
            change_reason: patch.change_reason.clone(),
            version: patch.version,
            created_at: patch.created_at.as_ref().map(stamp),
            updated_at: patch.updated_at.as_ref().map(stamp),
            today: date::canonical(&today),
        }
    }

    fn bind(self, query: AnyQuery<'_>) -> AnyQuery<'_> {
        query
            .bind(self.parent_code)
            .bind(self.name)
            .bind(self.unit_type)
            .bind(self.status)
            .bind(self.level)
            .bind(self.path)
            .bind(self.sort_order)
            .bind(self.description)
            .bind(self.effective_date)
            .bind(self.end_date.clone())
            .bind(self.end_date.clone())
            .bind(self.today)
            .bind(self.is_current)
            .bind(self.end_date)
            .bind(self.is_temporal)
            .bind(self.change_reason)
            .bind(self.version)
            .bind(self.created_at)
            .bind(self.updated_at)
    }
}

fn row_to_unit(row: &AnyRow) -> Result<OrgUnit, StorageError> {
    let tenant_id = text(row, "tenant_id").ok_or_else(|| StorageError::Corrupt {
        key: "?".into(),
        reason: "tenant_id is missing".into(),
    })?;
    let code = text(row, "code").ok_or_else(|| StorageError::Corrupt {
        key: tenant_id.clone(),
        reason: "code is missing".into(),
    })?;
    let key = NaturalKey::new(tenant_id, code);
    let corrupt = |reason: &str| StorageError::Corrupt {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    let required_stamp = |column: &str| {
        text(row, column)
            .as_deref()
            .and_then(parse_stamp)
            .ok_or_else(|| corrupt(&format!("{} is not RFC 3339", column)))
    };

    let node_id = text(row, "node_id")
        .and_then(|s| Uuid::parse_str(&s).ok())
        .unwrap_or_else(|| key.node_id());

    Ok(OrgUnit {
        node_id,
        parent_code: text(row, "parent_code").filter(|p| !p.is_empty()),
        name: text(row, "name").unwrap_or_default(),
        unit_type: text(row, "unit_type").ok_or_else(|| corrupt("unit_type is missing"))?,
        status: text(row, "status").ok_or_else(|| corrupt("status is missing"))?,
        level: int(row, "level").unwrap_or(1),
        path: text(row, "path").unwrap_or_default(),
        sort_order: int(row, "sort_order").unwrap_or(0),
        description: text(row, "description").unwrap_or_default(),
        effective_date: text(row, "effective_date").as_deref().and_then(date::parse_canonical),
        end_date: text(row, "end_date").as_deref().and_then(date::parse_canonical),
        is_current: flag(row, "is_current").unwrap_or(true),
        is_temporal: flag(row, "is_temporal").unwrap_or(false),
        change_reason: text(row, "change_reason").unwrap_or_default(),
        version: int(row, "version"),
        created_at: required_stamp("created_at")?,
        updated_at: required_stamp("updated_at")?,
        valid_from: required_stamp("valid_from")?,
        valid_to: required_stamp("valid_to")?,
        tenant_id: key.tenant_id.clone(),
        code: key.code.clone(),
    })
}

pub struct SqlReplica {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlReplica {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let is_sqlite = connection_string.starts_with("sqlite:");
        let pool = connect(connection_string, 20).await?;

        let store = Self { pool, is_sqlite };
        if is_sqlite {
            store.enable_wal_mode().await?;
        }
        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool for sharing with other stores.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS org_units (
                    tenant_id TEXT NOT NULL,
                    code TEXT NOT NULL,
                    node_id TEXT NOT NULL,
                    parent_code TEXT,
                    name TEXT NOT NULL DEFAULT '',
                    unit_type TEXT NOT NULL DEFAULT 'DEPARTMENT',
                    status TEXT NOT NULL DEFAULT 'ACTIVE',
                    level INTEGER NOT NULL DEFAULT 1,
                    path TEXT NOT NULL DEFAULT '',
                    sort_order INTEGER NOT NULL DEFAULT 0,
                    description TEXT NOT NULL DEFAULT '',
                    effective_date TEXT,
                    end_date TEXT,
                    is_current INTEGER NOT NULL DEFAULT 1,
                    is_temporal INTEGER NOT NULL DEFAULT 0,
                    change_reason TEXT NOT NULL DEFAULT '',
                    version INTEGER,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    valid_from TEXT NOT NULL,
                    valid_to TEXT NOT NULL,
                    PRIMARY KEY (tenant_id, code)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_org_units_active ON org_units (tenant_id, status, is_current)",
                r#"
                CREATE TABLE IF NOT EXISTS org_edges (
                    tenant_id TEXT NOT NULL,
                    parent_code TEXT NOT NULL,
                    child_code TEXT NOT NULL,
                    rel TEXT NOT NULL DEFAULT 'HAS_CHILD',
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (tenant_id, parent_code, child_code)
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_org_edges_child ON org_edges (tenant_id, child_code)",
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS org_units (
                    tenant_id VARCHAR(64) NOT NULL,
                    code VARCHAR(64) NOT NULL,
                    node_id CHAR(36) NOT NULL,
                    parent_code VARCHAR(64),
                    name VARCHAR(255) NOT NULL DEFAULT '',
                    unit_type VARCHAR(32) NOT NULL DEFAULT 'DEPARTMENT',
                    status VARCHAR(16) NOT NULL DEFAULT 'ACTIVE',
                    level BIGINT NOT NULL DEFAULT 1,
                    path VARCHAR(1024) NOT NULL DEFAULT '',
                    sort_order BIGINT NOT NULL DEFAULT 0,
                    description TEXT,
                    effective_date CHAR(10),
                    end_date CHAR(10),
                    is_current TINYINT NOT NULL DEFAULT 1,
                    is_temporal TINYINT NOT NULL DEFAULT 0,
                    change_reason TEXT,
                    version BIGINT,
                    created_at VARCHAR(40) NOT NULL,
                    updated_at VARCHAR(40) NOT NULL,
                    valid_from VARCHAR(40) NOT NULL,
                    valid_to VARCHAR(40) NOT NULL,
                    PRIMARY KEY (tenant_id, code),
                    INDEX idx_org_units_active (tenant_id, status, is_current)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS org_edges (
                    tenant_id VARCHAR(64) NOT NULL,
                    parent_code VARCHAR(64) NOT NULL,
                    child_code VARCHAR(64) NOT NULL,
                    rel VARCHAR(32) NOT NULL DEFAULT 'HAS_CHILD',
                    created_at VARCHAR(40) NOT NULL,
                    PRIMARY KEY (tenant_id, parent_code, child_code),
                    INDEX idx_org_edges_child (tenant_id, child_code)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(backend)
            })
            .await?;
        }

        Ok(())
    }

    async fn exists(&self, tenant_id: &str, code: &str) -> Result<bool, StorageError> {
        retry("sql_exists", &RetryConfig::query(), || async {
            let row = sqlx::query("SELECT 1 AS found FROM org_units WHERE tenant_id = ? AND code = ? LIMIT 1")
                .bind(tenant_id)
                .bind(code)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
            Ok(row.is_some())
        })
        .await
    }

    async fn bucket_counts(&self, column: &str, tenant_id: &str) -> Result<Vec<AnyRow>, StorageError> {
        let sql = format!(
            "SELECT {col} AS bucket, COUNT(*) AS cnt FROM org_units WHERE tenant_id = ? GROUP BY {col} ORDER BY {col}",
            col = column
        );
        retry("sql_stats", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await
    }
}

#[async_trait]
impl ReplicaStore for SqlReplica {
    async fn get(&self, key: &NaturalKey) -> Result<Option<OrgUnit>, StorageError> {
        let sql = format!("SELECT {} FROM org_units WHERE tenant_id = ? AND code = ?", UNIT_COLUMNS);

        let row = retry("sql_get", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(&key.tenant_id)
                .bind(&key.code)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        row.as_ref().map(row_to_unit).transpose()
    }

    async fn upsert(&self, seed: &OrgUnit, patch: &OrgUnitImage, today: NaiveDate) -> Result<(), StorageError> {
        let conflict = if self.is_sqlite {
            "ON CONFLICT(tenant_id, code) DO UPDATE SET"
        } else {
            "ON DUPLICATE KEY UPDATE"
        };
        let sql = format!(
            "INSERT INTO org_units ({}) VALUES ({}) {} {}",
            UNIT_COLUMNS, UNIT_PLACEHOLDERS, conflict, PATCH_SET
        );
        let seed_binds = SeedBinds::new(seed);
        let patch_binds = PatchBinds::new(patch, today);

        retry("sql_upsert", &RetryConfig::query(), || {
            let query = patch_binds.clone().bind(seed_binds.clone().bind(sqlx::query(&sql)));
            async move {
                query.execute(&self.pool).await.map_err(backend)?;
                Ok(())
            }
        })
        .await?;

        debug!(tenant = %seed.tenant_id, code = %seed.code, "Replica row upserted");
        Ok(())
    }

    async fn update(&self, key: &NaturalKey, patch: &OrgUnitImage, today: NaiveDate) -> Result<bool, StorageError> {
        let sql = format!("UPDATE org_units SET {} WHERE tenant_id = ? AND code = ?", PATCH_SET);
        let patch_binds = PatchBinds::new(patch, today);

        let affected = retry("sql_update", &RetryConfig::query(), || {
            let query = patch_binds
                .clone()
                .bind(sqlx::query(&sql))
                .bind(key.tenant_id.clone())
                .bind(key.code.clone());
            async move {
                let result = query.execute(&self.pool).await.map_err(backend)?;
                Ok(result.rows_affected())
            }
        })
        .await?;

        // MySQL reports zero affected rows when nothing changed
        if affected > 0 {
            Ok(true)
        } else {
            self.exists(&key.tenant_id, &key.code).await
        }
    }

    async fn link_parent(&self, tenant_id: &str, parent_code: &str, child_code: &str) -> Result<EdgeOutcome, StorageError> {
        if !self.exists(tenant_id, parent_code).await? {
            return Ok(EdgeOutcome::ParentMissing);
        }

        let insert = if self.is_sqlite {
            "INSERT INTO org_edges (tenant_id, parent_code, child_code, rel, created_at) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(tenant_id, parent_code, child_code) DO NOTHING"
        } else {
            "INSERT IGNORE INTO org_edges (tenant_id, parent_code, child_code, rel, created_at) VALUES (?, ?, ?, ?, ?)"
        };
        let created_at = stamp(&Utc::now());

        retry("sql_link_parent", &RetryConfig::query(), || async {
            let mut tx = self.pool.begin().await.map_err(backend)?;
            // A unit hangs under one parent at a time
            sqlx::query("DELETE FROM org_edges WHERE tenant_id = ? AND child_code = ? AND parent_code <> ?")
                .bind(tenant_id)
                .bind(child_code)
                .bind(parent_code)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            sqlx::query(insert)
                .bind(tenant_id)
                .bind(parent_code)
                .bind(child_code)
                .bind(EDGE_HAS_CHILD)
                .bind(&created_at)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            tx.commit().await.map_err(backend)
        })
        .await?;

        Ok(EdgeOutcome::Linked)
    }

    async fn soft_delete(&self, key: &NaturalKey, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let updated_at = stamp(&at);

        let affected = retry("sql_soft_delete", &RetryConfig::query(), || async {
            let result = sqlx::query("UPDATE org_units SET status = ?, updated_at = ? WHERE tenant_id = ? AND code = ?")
                .bind(STATUS_INACTIVE)
                .bind(&updated_at)
                .bind(&key.tenant_id)
                .bind(&key.code)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected > 0 {
            Ok(true)
        } else {
            self.exists(&key.tenant_id, &key.code).await
        }
    }

    async fn hard_delete(&self, key: &NaturalKey) -> Result<bool, StorageError> {
        retry("sql_hard_delete", &RetryConfig::query(), || async {
            let mut tx = self.pool.begin().await.map_err(backend)?;
            sqlx::query("DELETE FROM org_edges WHERE tenant_id = ? AND (parent_code = ? OR child_code = ?)")
                .bind(&key.tenant_id)
                .bind(&key.code)
                .bind(&key.code)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            let result = sqlx::query("DELETE FROM org_units WHERE tenant_id = ? AND code = ?")
                .bind(&key.tenant_id)
                .bind(&key.code)
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
            tx.commit().await.map_err(backend)?;
            Ok(result.rows_affected() > 0)
        })
        .await
    }

    async fn children(&self, tenant_id: &str, parent_code: &str) -> Result<Vec<String>, StorageError> {
        let rows = retry("sql_children", &RetryConfig::query(), || async {
            sqlx::query("SELECT child_code FROM org_edges WHERE tenant_id = ? AND parent_code = ? ORDER BY child_code")
                .bind(tenant_id)
                .bind(parent_code)
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        Ok(rows.iter().filter_map(|row| text(row, "child_code")).collect())
    }

    async fn count_active(&self, tenant_id: &str) -> Result<u64, StorageError> {
        let row = retry("sql_count_active", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT COUNT(DISTINCT code) AS cnt FROM org_units WHERE tenant_id = ? AND is_current = 1 AND status = ?",
            )
            .bind(tenant_id)
            .bind(STATUS_ACTIVE)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)
        })
        .await?;

        Ok(int(&row, "cnt").unwrap_or(0).max(0) as u64)
    }
}

/// Make `%` and `_` match themselves under `ESCAPE '!'`.
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '!' | '%' | '_') {
            escaped.push('!');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl SourceOfTruth for SqlReplica {
    async fn organization(&self, key: &NaturalKey) -> Result<Option<OrgUnit>, StorageError> {
        ReplicaStore::get(self, key).await
    }

    async fn organizations(&self, tenant_id: &str, params: &ListParams) -> Result<Vec<OrgUnit>, StorageError> {
        let sql = format!(
            "SELECT {} FROM org_units WHERE tenant_id = ? \
             AND (? = '' OR name LIKE ? ESCAPE '!' OR code LIKE ? ESCAPE '!') \
             ORDER BY sort_order, code LIMIT ? OFFSET ?",
            UNIT_COLUMNS
        );
        let pattern = format!("%{}%", escape_like(&params.search_text));

        let rows = retry("sql_list", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(tenant_id)
                .bind(&params.search_text)
                .bind(&pattern)
                .bind(&pattern)
                .bind(i64::from(params.first))
                .bind(i64::from(params.offset))
                .fetch_all(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        rows.iter().map(row_to_unit).collect()
    }

    async fn organization_stats(&self, tenant_id: &str) -> Result<OrgStats, StorageError> {
        let total = retry("sql_stats", &RetryConfig::query(), || async {
            sqlx::query("SELECT COUNT(*) AS cnt FROM org_units WHERE tenant_id = ?")
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await
                .map_err(backend)
        })
        .await?;

        let count = |row: &AnyRow| int(row, "cnt").unwrap_or(0).max(0) as u64;

        let by_type = self
            .bucket_counts("unit_type", tenant_id)
            .await?
            .iter()
            .map(|row| TypeCount {
                unit_type: text(row, "bucket").unwrap_or_default(),
                count: count(row),
            })
            .collect();
        let by_status = self
            .bucket_counts("status", tenant_id)
            .await?
            .iter()
            .map(|row| StatusCount {
                status: text(row, "bucket").unwrap_or_default(),
                count: count(row),
            })
            .collect();
        let by_level = self
            .bucket_counts("level", tenant_id)
            .await?
            .iter()
            .map(|row| LevelCount {
                level: int(row, "bucket").unwrap_or(0),
                count: count(row),
            })
            .collect();

        Ok(OrgStats {
            total_count: count(&total),
            by_type,
            by_status,
            by_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn replica() -> (tempfile::TempDir, SqlReplica) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("replica.db").display());
        let store = SqlReplica::new(&url).await.unwrap();
        (dir, store)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 10, 12, 0, 0).unwrap()
    }

    fn today() -> NaiveDate {
        now().date_naive()
    }

    fn image(name: &str) -> OrgUnitImage {
        OrgUnitImage {
            name: Some(name.into()),
            description: Some("original".into()),
            sort_order: Some(3),
            ..Default::default()
        }
    }

    async fn insert(store: &SqlReplica, tenant: &str, code: &str, patch: &OrgUnitImage) -> OrgUnit {
        let seed = OrgUnit::seed(&NaturalKey::new(tenant, code), patch, None, now());
        store.upsert(&seed, patch, today()).await.unwrap();
        seed
    }

    #[tokio::test]
    async fn test_upsert_then_get_round_trips_row() {
        let (_dir, store) = replica().await;
        let seed = insert(&store, "t1", "1000001", &image("Engineering")).await;

        let got = store.get(&NaturalKey::new("t1", "1000001")).await.unwrap().unwrap();
        assert_eq!(got, seed);
        assert_eq!(got.effective_date, Some(today()));
        assert!(got.is_current);
    }

    #[tokio::test]
    async fn test_repeated_upsert_is_idempotent() {
        let (_dir, store) = replica().await;
        let patch = image("Engineering");
        insert(&store, "t1", "1000001", &patch).await;
        let first = store.get(&NaturalKey::new("t1", "1000001")).await.unwrap();

        for _ in 0..3 {
            insert(&store, "t1", "1000001", &patch).await;
        }
        let again = store.get(&NaturalKey::new("t1", "1000001")).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(store.count_active("t1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_conflict_only_overwrites_present_fields() {
        let (_dir, store) = replica().await;
        insert(&store, "t1", "1000001", &image("Engineering")).await;

        let rename = OrgUnitImage {
            name: Some("Platform".into()),
            ..Default::default()
        };
        insert(&store, "t1", "1000001", &rename).await;

        let got = store.get(&NaturalKey::new("t1", "1000001")).await.unwrap().unwrap();
        assert_eq!(got.name, "Platform");
        assert_eq!(got.description, "original");
        assert_eq!(got.sort_order, 3);
    }

    #[tokio::test]
    async fn test_update_merges_and_reports_unknown_keys() {
        let (_dir, store) = replica().await;
        insert(&store, "t1", "1000001", &image("Engineering")).await;
        let key = NaturalKey::new("t1", "1000001");

        let patch = OrgUnitImage {
            name: Some("Platform".into()),
            ..Default::default()
        };
        assert!(store.update(&key, &patch, today()).await.unwrap());
        // Same values again: still reported as found
        assert!(store.update(&key, &patch, today()).await.unwrap());

        let got = store.get(&key).await.unwrap().unwrap();
        assert_eq!(got.name, "Platform");
        assert_eq!(got.description, "original");

        let missing = NaturalKey::new("t1", "9999999");
        assert!(!store.update(&missing, &patch, today()).await.unwrap());
        assert!(store.get(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_past_end_date_forces_not_current() {
        let (_dir, store) = replica().await;
        insert(&store, "t1", "1000001", &image("Engineering")).await;
        let key = NaturalKey::new("t1", "1000001");

        let patch = OrgUnitImage {
            end_date: NaiveDate::from_ymd_opt(2025, 8, 10),
            is_current: Some(true),
            ..Default::default()
        };
        store.update(&key, &patch, today()).await.unwrap();

        let got = store.get(&key).await.unwrap().unwrap();
        assert!(!got.is_current);
        assert_eq!(got.end_date, NaiveDate::from_ymd_opt(2025, 8, 10));
        assert_eq!(store.count_active("t1").await.unwrap(), 0);

        // A later patch without end_date cannot flip it back
        let flip = OrgUnitImage {
            is_current: Some(true),
            ..Default::default()
        };
        store.update(&key, &flip, today()).await.unwrap();
        assert!(!store.get(&key).await.unwrap().unwrap().is_current);
    }

    #[tokio::test]
    async fn test_future_end_date_keeps_current() {
        let (_dir, store) = replica().await;
        let patch = OrgUnitImage {
            end_date: NaiveDate::from_ymd_opt(2030, 1, 1),
            ..image("Engineering")
        };
        insert(&store, "t1", "1000001", &patch).await;
        assert!(store.get(&NaturalKey::new("t1", "1000001")).await.unwrap().unwrap().is_current);
    }

    #[tokio::test]
    async fn test_link_parent() {
        let (_dir, store) = replica().await;
        insert(&store, "t1", "child", &image("Child")).await;

        let outcome = store.link_parent("t1", "parent", "child").await.unwrap();
        assert_eq!(outcome, EdgeOutcome::ParentMissing);
        assert!(store.children("t1", "parent").await.unwrap().is_empty());

        insert(&store, "t1", "parent", &image("Parent")).await;
        assert_eq!(store.link_parent("t1", "parent", "child").await.unwrap(), EdgeOutcome::Linked);
        assert_eq!(store.link_parent("t1", "parent", "child").await.unwrap(), EdgeOutcome::Linked);
        assert_eq!(store.children("t1", "parent").await.unwrap(), vec!["child".to_string()]);

        // Re-parenting moves the edge
        insert(&store, "t1", "other", &image("Other")).await;
        store.link_parent("t1", "other", "child").await.unwrap();
        assert!(store.children("t1", "parent").await.unwrap().is_empty());
        assert_eq!(store.children("t1", "other").await.unwrap(), vec!["child".to_string()]);
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_row() {
        let (_dir, store) = replica().await;
        insert(&store, "t1", "1000001", &image("Engineering")).await;
        let key = NaturalKey::new("t1", "1000001");
        let at = now() + chrono::Duration::hours(1);

        assert!(store.soft_delete(&key, at).await.unwrap());
        let got = store.get(&key).await.unwrap().unwrap();
        assert_eq!(got.status, STATUS_INACTIVE);
        assert_eq!(got.updated_at, at);
        assert_eq!(store.count_active("t1").await.unwrap(), 0);

        assert!(!store.soft_delete(&NaturalKey::new("t1", "nope"), at).await.unwrap());
    }

    #[tokio::test]
    async fn test_hard_delete_detaches_edges() {
        let (_dir, store) = replica().await;
        insert(&store, "t1", "root", &image("Root")).await;
        insert(&store, "t1", "mid", &image("Mid")).await;
        insert(&store, "t1", "leaf", &image("Leaf")).await;
        store.link_parent("t1", "root", "mid").await.unwrap();
        store.link_parent("t1", "mid", "leaf").await.unwrap();

        assert!(store.hard_delete(&NaturalKey::new("t1", "mid")).await.unwrap());
        assert!(store.get(&NaturalKey::new("t1", "mid")).await.unwrap().is_none());
        assert!(store.children("t1", "root").await.unwrap().is_empty());
        assert!(store.children("t1", "mid").await.unwrap().is_empty());
        assert!(store.get(&NaturalKey::new("t1", "leaf")).await.unwrap().is_some());

        assert!(!store.hard_delete(&NaturalKey::new("t1", "mid")).await.unwrap());
    }

    #[tokio::test]
    async fn test_count_active_is_tenant_scoped() {
        let (_dir, store) = replica().await;
        insert(&store, "t1", "a", &image("A")).await;
        insert(&store, "t1", "b", &image("B")).await;
        insert(&store, "t2", "a", &image("A")).await;

        assert_eq!(store.count_active("t1").await.unwrap(), 2);
        assert_eq!(store.count_active("t2").await.unwrap(), 1);
        assert_eq!(store.count_active("t3").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_organizations_order_paging_and_search() {
        let (_dir, store) = replica().await;
        for (code, name, sort) in [("c", "Sales", 1), ("a", "Engineering", 2), ("b", "Finance", 1)] {
            let patch = OrgUnitImage {
                name: Some(name.into()),
                sort_order: Some(sort),
                ..Default::default()
            };
            insert(&store, "t1", code, &patch).await;
        }

        let all = store.organizations("t1", &ListParams::page(50, 0)).await.unwrap();
        let codes: Vec<_> = all.iter().map(|u| u.code.as_str()).collect();
        assert_eq!(codes, vec!["b", "c", "a"]);

        let page = store.organizations("t1", &ListParams::page(1, 1)).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].code, "c");

        let found = store
            .organizations("t1", &ListParams::page(50, 0).with_search("ngin"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Engineering");

        assert!(store.organizations("t2", &ListParams::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_wildcards_match_literally() {
        let (_dir, store) = replica().await;
        for (code, name) in [("a", "R&D 100%"), ("b", "Research"), ("c", "Ops_East"), ("d", "OpsXEast")] {
            let patch = OrgUnitImage {
                name: Some(name.into()),
                ..Default::default()
            };
            insert(&store, "t1", code, &patch).await;
        }

        let search = |text: &str| ListParams::page(50, 0).with_search(text);
        let percent = store.organizations("t1", &search("%")).await.unwrap();
        assert_eq!(percent.iter().map(|u| u.code.as_str()).collect::<Vec<_>>(), vec!["a"]);

        let underscore = store.organizations("t1", &search("s_E")).await.unwrap();
        assert_eq!(underscore.iter().map(|u| u.code.as_str()).collect::<Vec<_>>(), vec!["c"]);
        assert!(store.organizations("t1", &search("!")).await.unwrap().is_empty());
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off!"), "50!%!_off!!");
        assert_eq!(escape_like("plain"), "plain");
    }

    #[tokio::test]
    async fn test_organization_stats() {
        let (_dir, store) = replica().await;
        insert(&store, "t1", "a", &image("A")).await;
        insert(&store, "t1", "b", &image("B")).await;
        store.soft_delete(&NaturalKey::new("t1", "b"), now()).await.unwrap();

        let stats = store.organization_stats("t1").await.unwrap();
        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.by_type, vec![TypeCount { unit_type: "DEPARTMENT".into(), count: 2 }]);
        assert_eq!(stats.by_status, vec![
            StatusCount { status: STATUS_ACTIVE.into(), count: 1 },
            StatusCount { status: STATUS_INACTIVE.into(), count: 1 },
        ]);
        assert_eq!(stats.by_level, vec![LevelCount { level: 1, count: 2 }]);
    }
}
