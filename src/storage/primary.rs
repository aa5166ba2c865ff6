// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-only view of the primary relational store.
//!
//! The `organization_units` table is owned by the command side; this module
//! only counts what the replica should hold. Postgres uses numbered
//! placeholders, which the `Any` driver does not rewrite.

use async_trait::async_trait;
use sqlx::AnyPool;

use super::sql::{backend, connect, int};
use super::traits::{PrimaryStore, StorageError};
use crate::org_unit::STATUS_ACTIVE;
use crate::resilience::retry::{retry, RetryConfig};

pub struct SqlPrimaryStore {
    pool: AnyPool,
    is_postgres: bool,
}

impl SqlPrimaryStore {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let is_postgres = connection_string.starts_with("postgres:") || connection_string.starts_with("postgresql:");
        let pool = connect(connection_string, 4).await?;
        Ok(Self { pool, is_postgres })
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }
}

#[async_trait]
impl PrimaryStore for SqlPrimaryStore {
    async fn count_active(&self, tenant_id: &str) -> Result<u64, StorageError> {
        let sql = if self.is_postgres {
            "SELECT COUNT(DISTINCT code) AS cnt FROM organization_units \
             WHERE tenant_id::text = $1 AND is_current = TRUE AND status = $2"
        } else {
            "SELECT COUNT(DISTINCT code) AS cnt FROM organization_units \
             WHERE tenant_id = ? AND is_current = TRUE AND status = ?"
        };

        let row = retry("primary_count_active", &RetryConfig::query(), || async {
            sqlx::query(sql)
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

#[cfg(test)]
mod tests {
    use super::*;

    async fn primary() -> (tempfile::TempDir, SqlPrimaryStore) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("primary.db").display());
        let store = SqlPrimaryStore::new(&url).await.unwrap();
        sqlx::query(
            "CREATE TABLE organization_units (
                tenant_id TEXT NOT NULL,
                code TEXT NOT NULL,
                status TEXT NOT NULL,
                is_current INTEGER NOT NULL,
                effective_date TEXT NOT NULL
            )",
        )
        .execute(&store.pool())
        .await
        .unwrap();
        (dir, store)
    }

    async fn row(store: &SqlPrimaryStore, tenant: &str, code: &str, status: &str, current: i64, effective: &str) {
        sqlx::query("INSERT INTO organization_units VALUES (?, ?, ?, ?, ?)")
            .bind(tenant)
            .bind(code)
            .bind(status)
            .bind(current)
            .bind(effective)
            .execute(&store.pool())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_counts_distinct_current_active_codes() {
        let (_dir, store) = primary().await;
        // Two temporal versions of one unit, only one current
        row(&store, "t1", "a", "ACTIVE", 1, "2025-01-01").await;
        row(&store, "t1", "a", "ACTIVE", 0, "2024-01-01").await;
        row(&store, "t1", "b", "ACTIVE", 1, "2025-01-01").await;
        row(&store, "t1", "c", "INACTIVE", 1, "2025-01-01").await;
        row(&store, "t2", "a", "ACTIVE", 1, "2025-01-01").await;

        assert_eq!(store.count_active("t1").await.unwrap(), 2);
        assert_eq!(store.count_active("t2").await.unwrap(), 1);
        assert_eq!(store.count_active("t3").await.unwrap(), 0);
    }
}
