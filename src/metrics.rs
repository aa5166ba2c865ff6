// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for org-sync.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The embedding
//! daemon picks the exporter (Prometheus, OTEL, a debugging recorder, ...).
//!
//! # Metric Naming Convention
//! - `org_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `source`: cdc, domain
//! - `operation`: create, update, delete, snapshot
//! - `status`: per-message outcome (applied, skipped_malformed, ...)
//! - `stage`: decode, apply, cache, commit, message
//! - `tier`: L1, L2, L3
//! - `tenant`: tenant scope for consistency metrics

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Count one processed message by source, operation and outcome.
pub fn record_event(source: &str, operation: &str, status: &str) {
    counter!(
        "org_sync_events_total",
        "source" => source.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record how long one pipeline stage took.
pub fn record_stage_latency(stage: &str, duration: Duration) {
    histogram!(
        "org_sync_stage_seconds",
        "stage" => stage.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an offset commit attempt.
pub fn record_commit(partition: &str, success: bool) {
    counter!(
        "org_sync_commits_total",
        "partition" => partition.to_string(),
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record a transport poll failure.
pub fn record_poll_error(partition: &str) {
    counter!(
        "org_sync_poll_errors_total",
        "partition" => partition.to_string()
    )
    .increment(1);
}

/// Record a cache lookup or write on one tier.
pub fn record_cache_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "org_sync_cache_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record keys evicted by a coherence pass.
pub fn record_cache_invalidation(mode: &str, keys: usize) {
    counter!(
        "org_sync_cache_invalidations_total",
        "mode" => mode.to_string()
    )
    .increment(keys as u64);
}

/// Record a swallowed cache failure.
pub fn record_cache_error(tier: &str, operation: &str) {
    counter!(
        "org_sync_cache_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// A tier-3 fill was dropped because a change landed while it was read.
pub fn record_superseded_fill() {
    counter!("org_sync_cache_superseded_fills_total").increment(1);
}

/// Keys found out of step between tier 1 and tier 2 by a tier check.
pub fn record_tier_mismatches(issue: &str, count: usize) {
    counter!("org_sync_cache_tier_mismatches_total", "issue" => issue.to_string()).increment(count as u64);
}

/// Set tier-1 entry count.
pub fn set_l1_entries(count: usize) {
    gauge!("org_sync_l1_cache_entries").set(count as f64);
}

/// A child was written before its parent existed.
pub fn record_orphan_edge() {
    counter!("org_sync_orphan_edges_total").increment(1);
}

/// Record a replica or primary store failure.
pub fn record_store_error(store: &str, operation: &str) {
    counter!(
        "org_sync_store_errors_total",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// A store or transport call is being retried.
pub fn record_retry(operation: &str) {
    counter!("org_sync_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Export one consistency check result.
pub fn set_consistency(tenant: &str, primary: u64, replica: u64, drift: u64) {
    gauge!("org_sync_consistency_drift", "tenant" => tenant.to_string()).set(drift as f64);
    gauge!("org_sync_primary_units", "tenant" => tenant.to_string()).set(primary as f64);
    gauge!("org_sync_replica_units", "tenant" => tenant.to_string()).set(replica as f64);
}

/// Record a consistency check run.
pub fn record_consistency_check(status: &str) {
    counter!(
        "org_sync_consistency_checks_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Set the number of running ingestion workers.
pub fn set_active_partitions(count: usize) {
    gauge!("org_sync_active_partitions").set(count as f64);
}

/// A timing guard that records a stage latency on drop
pub struct LatencyTimer {
    stage: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_stage_latency(self.stage, self.start.elapsed());
    }
}
