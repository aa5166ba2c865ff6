// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service lifecycle: connect backends, spawn workers, shut down cleanly.
//!
//! Startup order:
//! 1. Replica (SQL, or in-memory when no URL is configured)
//! 2. Tier-2 cache (Redis, or in-memory)
//! 3. Primary, only when configured; without it no drift audit runs
//! 4. One ingestion task per subscribed topic, plus the consistency checker
//!
//! Shutdown flips one shared flag. Every partition finishes its in-flight
//! message, closes its source and returns a [`PartitionSummary`].

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::applier::SyncApplier;
use crate::cache::CacheManager;
use crate::config::{ConfigError, SyncConfig};
use crate::consistency::ConsistencyChecker;
use crate::ingest::{IngestionLoop, MessageSource, PartitionSummary, Pipeline, RedisStreamSource, SourceError};
use crate::storage::memory::{InMemoryReplica, InMemorySharedCache};
use crate::storage::primary::SqlPrimaryStore;
use crate::storage::redis::RedisSharedCache;
use crate::storage::sql::SqlReplica;
use crate::storage::traits::{PrimaryStore, ReplicaStore, SharedCache, SourceOfTruth, StorageError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

pub struct OrgSyncService {
    config: SyncConfig,
    state: watch::Sender<ServiceState>,
    shutdown: watch::Sender<bool>,
    replica: Arc<dyn ReplicaStore>,
    cache: Arc<CacheManager>,
    applier: Arc<SyncApplier>,
    checker: Option<Arc<ConsistencyChecker>>,
    ingestion: IngestionLoop,
    workers: Vec<JoinHandle<PartitionSummary>>,
    checker_task: Option<JoinHandle<()>>,
}

impl OrgSyncService {
    /// Connect every configured backend.
    #[tracing::instrument(skip(config), fields(has_redis = config.redis_url.is_some(), has_sql = config.replica_sql_url.is_some()))]
    pub async fn connect(config: SyncConfig) -> Result<Self, ServiceError> {
        config.validate()?;

        let shared: Arc<dyn SharedCache> = match config.redis_url {
            Some(ref url) => {
                info!("Connecting tier-2 cache to Redis");
                Arc::new(RedisSharedCache::new(url, &config.cache_namespace).await?)
            }
            None => {
                warn!("No Redis URL configured, tier-2 cache is process-local");
                Arc::new(InMemorySharedCache::new())
            }
        };

        let primary: Option<Arc<dyn PrimaryStore>> = match config.primary_sql_url {
            Some(ref url) => Some(Arc::new(SqlPrimaryStore::new(url).await?)),
            None => {
                warn!("No primary URL configured, drift audit disabled");
                None
            }
        };

        match config.replica_sql_url.clone() {
            Some(url) => {
                info!("Connecting replica");
                let replica = Arc::new(SqlReplica::new(&url).await?);
                Ok(Self::from_parts(config, replica, shared, primary))
            }
            None => {
                warn!("No replica URL configured, replica is process-local");
                Ok(Self::from_parts(config, Arc::new(InMemoryReplica::new()), shared, primary))
            }
        }
    }

    /// Assemble from already-connected stores.
    pub fn from_parts<R>(
        config: SyncConfig,
        replica: Arc<R>,
        shared: Arc<dyn SharedCache>,
        primary: Option<Arc<dyn PrimaryStore>>,
    ) -> Self
    where
        R: ReplicaStore + SourceOfTruth + 'static,
    {
        let (state, _) = watch::channel(ServiceState::Created);
        let (shutdown, _) = watch::channel(false);

        let applier = Arc::new(SyncApplier::new(replica.clone(), config.delete_policy));
        let cache = Arc::new(CacheManager::new(&config, shared, replica.clone()));
        let pipeline = Arc::new(Pipeline::new(&config, applier.clone(), Some(cache.clone())));
        let ingestion = IngestionLoop::new(pipeline, &config);
        let checker = primary.map(|p| Arc::new(ConsistencyChecker::from_config(&config, p, replica.clone())));

        Self {
            config,
            state,
            shutdown,
            replica,
            cache,
            applier,
            checker,
            ingestion,
            workers: Vec::new(),
            checker_task: None,
        }
    }

    /// Join the consumer group on every configured topic and start consuming.
    pub async fn subscribe(&mut self) -> Result<usize, ServiceError> {
        let Some(url) = self.config.redis_url.clone() else {
            warn!("No Redis URL configured, nothing to subscribe to");
            return Ok(0);
        };

        let topics: Vec<String> = self
            .config
            .cdc_topics
            .iter()
            .chain(&self.config.domain_event_topics)
            .cloned()
            .collect();
        let mut sources: Vec<Box<dyn MessageSource>> = Vec::with_capacity(topics.len());
        for topic in &topics {
            let source = RedisStreamSource::new(&url, topic, &self.config.consumer_group, &self.config.consumer_name).await?;
            sources.push(Box::new(source));
        }

        let count = sources.len();
        self.start_sources(sources);
        Ok(count)
    }

    /// Spawn one ingestion task per source, and the checker if not yet running.
    pub fn start_sources(&mut self, sources: Vec<Box<dyn MessageSource>>) {
        for source in sources {
            info!(source = %source.describe(), "Starting partition worker");
            self.workers.push(self.ingestion.spawn(source, self.shutdown.subscribe()));
        }
        self.start_checker();
        self.state.send_replace(ServiceState::Running);
    }

    fn start_checker(&mut self) {
        if self.checker_task.is_some() {
            return;
        }
        if self.config.consistency_check_interval_secs == 0 {
            info!("Consistency check interval is 0, periodic audit disabled");
            return;
        }
        if let Some(checker) = self.checker.clone() {
            let rx = self.shutdown.subscribe();
            self.checker_task = Some(tokio::spawn(async move { checker.run(rx).await }));
        }
    }

    pub fn cache(&self) -> Arc<CacheManager> {
        self.cache.clone()
    }

    pub fn applier(&self) -> Arc<SyncApplier> {
        self.applier.clone()
    }

    pub fn replica(&self) -> Arc<dyn ReplicaStore> {
        self.replica.clone()
    }

    pub fn checker(&self) -> Option<Arc<ConsistencyChecker>> {
        self.checker.clone()
    }

    pub fn state(&self) -> watch::Receiver<ServiceState> {
        self.state.subscribe()
    }

    /// Stop all workers and wait for them to close their sources.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(mut self) -> Vec<PartitionSummary> {
        info!(workers = self.workers.len(), "Shutting down org sync");
        self.state.send_replace(ServiceState::ShuttingDown);
        self.shutdown.send_replace(true);

        let mut summaries = Vec::with_capacity(self.workers.len());
        for worker in self.workers.drain(..) {
            match worker.await {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(error = %e, "Partition worker did not finish cleanly"),
            }
        }
        if let Some(task) = self.checker_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Consistency checker did not finish cleanly");
            }
        }

        self.state.send_replace(ServiceState::Stopped);
        info!("Org sync stopped");
        summaries
    }
}
