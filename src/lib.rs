// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Org Sync
//!
//! Keeps a graph-shaped query replica of an organization hierarchy, and a
//! three-tier read cache in front of it, in line with a relational primary
//! by consuming its change stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Ingestion (one task per partition)         │
//! │  • MessageSource: Redis Streams consumer group / in-memory  │
//! │  • Routes raw CDC envelopes and domain events by topic      │
//! │  • Commits unless the replica was unavailable               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  ChangeRecord
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Sync Applier                          │
//! │  • Idempotent merge-patch upsert keyed on (tenant, code)    │
//! │  • Best-effort HAS_CHILD edge, soft or hard delete          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  AppliedChange
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Cache Coherence Manager                     │
//! │  • L1: DashMap, per-entry TTL, bounded                      │
//! │  • L2: Redis, tag-indexed for selective invalidation        │
//! │  • L3: replica queries (unit, list, stats)                  │
//! └─────────────────────────────────────────────────────────────┘
//!
//!          Consistency Checker: primary vs replica counts, per tenant
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use org_sync::{OrgSyncService, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::from_env()?;
//!     let mut service = OrgSyncService::connect(config).await?;
//!     service.subscribe().await?;
//!
//!     if let Some(unit) = service.cache().get_organization("t1", "1000001").await? {
//!         println!("{} is {}", unit.code, unit.name);
//!     }
//!
//!     tokio::signal::ctrl_c().await?;
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`cdc`]: Envelope and domain-event decoding into [`ChangeRecord`]
//! - [`applier`]: Replica writes for one change
//! - [`cache`]: Tiered reads and coherence after a change
//! - [`consistency`]: Drift audit between primary and replica
//! - [`ingest`]: Transport seam and the per-partition loop
//! - [`storage`]: Replica, primary and tier-2 backends (SQL, Redis, memory)
//! - [`service`]: Wiring and lifecycle

pub mod applier;
pub mod cache;
pub mod cdc;
pub mod config;
pub mod consistency;
pub mod ingest;
pub mod metrics;
pub mod org_unit;
pub mod resilience;
pub mod service;
pub mod storage;

pub use applier::{AppliedChange, ApplyError, SyncApplier};
pub use cache::entry::{CacheEntry, EntityKind, Provenance};
pub use cache::keys::CacheKey;
pub use cache::{
    CacheError, CacheManager, CacheStats, CoherenceMode, CoherenceReport, TierCheckReport, TierIssue, TierMismatch,
};
pub use cdc::{ChangeRecord, DecodeError, DomainEventDecoder, DomainEventKind, EnvelopeDecoder, Operation};
pub use config::{ConfigError, DeletePolicy, SyncConfig};
pub use consistency::{ConsistencyChecker, ConsistencyReport};
pub use ingest::{
    IngestionLoop, InMemorySource, MessageOutcome, MessageSource, PartitionSummary, Pipeline, RawMessage,
    RedisStreamSource, SourceError, TopicKind,
};
pub use metrics::LatencyTimer;
pub use org_unit::{ListParams, NaturalKey, OrgStats, OrgUnit, OrgUnitImage};
pub use resilience::retry::RetryConfig;
pub use service::{OrgSyncService, ServiceError, ServiceState};
pub use storage::traits::{EdgeOutcome, PrimaryStore, ReplicaStore, SharedCache, SourceOfTruth, StorageError};
