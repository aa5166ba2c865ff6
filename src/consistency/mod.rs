// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic drift audit between the primary and the replica.
//!
//! Counts distinct current ACTIVE units per tenant on both sides and
//! exports the difference. A non-zero drift is a signal only: nothing here
//! repairs the replica.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::metrics;
use crate::storage::traits::{PrimaryStore, ReplicaStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub tenant_id: String,
    pub primary_count: u64,
    pub replica_count: u64,
    /// `|primary - replica|`
    pub drift: u64,
    /// `primary - replica`: positive when the replica is missing units
    pub signed_difference: i64,
    pub checked_at: DateTime<Utc>,
    pub reconciliation_suggested: bool,
}

impl ConsistencyReport {
    fn new(tenant_id: &str, primary_count: u64, replica_count: u64, checked_at: DateTime<Utc>) -> Self {
        let drift = primary_count.abs_diff(replica_count);
        Self {
            tenant_id: tenant_id.to_string(),
            primary_count,
            replica_count,
            drift,
            signed_difference: primary_count as i64 - replica_count as i64,
            checked_at,
            reconciliation_suggested: drift != 0,
        }
    }

    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.drift == 0
    }
}

/// Shortest period between audits. Smaller intervals, zero included, are raised to it.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

pub struct ConsistencyChecker {
    primary: Arc<dyn PrimaryStore>,
    replica: Arc<dyn ReplicaStore>,
    tenants: Vec<String>,
    interval: Duration,
}

impl ConsistencyChecker {
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        replica: Arc<dyn ReplicaStore>,
        tenants: Vec<String>,
        interval: Duration,
    ) -> Self {
        Self {
            primary,
            replica,
            tenants,
            interval: interval.max(MIN_CHECK_INTERVAL),
        }
    }

    pub fn from_config(config: &SyncConfig, primary: Arc<dyn PrimaryStore>, replica: Arc<dyn ReplicaStore>) -> Self {
        Self::new(primary, replica, config.audited_tenants(), config.consistency_check_interval())
    }

    #[must_use]
    pub fn tenants(&self) -> &[String] {
        &self.tenants
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[tracing::instrument(skip(self))]
    pub async fn check_once(&self, tenant_id: &str) -> Result<ConsistencyReport, StorageError> {
        let _timer = metrics::LatencyTimer::new("consistency_check");

        let counts = tokio::try_join!(self.primary.count_active(tenant_id), self.replica.count_active(tenant_id));
        let (primary_count, replica_count) = match counts {
            Ok(counts) => counts,
            Err(e) => {
                metrics::record_consistency_check("error");
                return Err(e);
            }
        };

        let report = ConsistencyReport::new(tenant_id, primary_count, replica_count, Utc::now());
        metrics::set_consistency(tenant_id, primary_count, replica_count, report.drift);

        if report.is_consistent() {
            metrics::record_consistency_check("consistent");
            debug!(primary_count, replica_count, "Replica consistent with primary");
        } else {
            metrics::record_consistency_check("drift");
            warn!(
                primary_count,
                replica_count,
                drift = report.drift,
                signed_difference = report.signed_difference,
                "Replica drifted from primary, reconciliation suggested"
            );
        }
        Ok(report)
    }

    /// Check every configured tenant once. Failed tenants are logged and skipped.
    pub async fn check_all(&self) -> Vec<ConsistencyReport> {
        let mut reports = Vec::with_capacity(self.tenants.len());
        for tenant in &self.tenants {
            match self.check_once(tenant).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(tenant = %tenant, error = %e, "Consistency check failed"),
            }
        }
        reports
    }

    /// Check on every tick until `shutdown` flips to true or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(tenants = ?self.tenants, interval_secs = self.interval.as_secs(), "Consistency checker running");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.check_all().await;
                }
            }
        }
        info!("Consistency checker stopped");
    }
}
