// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ingestion loop: one task per partition.
//!
//! ```text
//! Subscribed ──► poll ──► Pipeline::process ──► commit? ──► poll ...
//!                 │                                          │
//!                 └──── shutdown flag observed between polls ┘──► close() ──► Closed
//! ```
//!
//! Messages of one partition are processed strictly in order. The in-flight
//! message always completes before the loop exits, and `close()` runs even
//! when processing panics.

pub mod pipeline;
pub mod redis_stream;
pub mod source;

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::SyncConfig;
use crate::metrics;

pub use pipeline::{MessageOutcome, Pipeline, TopicKind};
pub use redis_stream::RedisStreamSource;
pub use source::{InMemorySource, MessageSource, RawMessage, SourceError};

static ACTIVE_PARTITIONS: AtomicUsize = AtomicUsize::new(0);

#[async_trait]
impl<S: MessageSource + ?Sized> MessageSource for Box<S> {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<RawMessage>, SourceError> {
        (**self).poll(timeout).await
    }

    async fn commit(&mut self, message: &RawMessage) -> Result<(), SourceError> {
        (**self).commit(message).await
    }

    async fn close(&mut self) {
        (**self).close().await
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Per-partition counters, returned when the task ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSummary {
    pub source: String,
    pub applied: u64,
    pub skipped_malformed: u64,
    pub skipped_semantic: u64,
    pub retry_pending: u64,
    pub ignored: u64,
    pub committed: u64,
    pub commit_errors: u64,
    pub poll_errors: u64,
    pub panicked: bool,
}

impl PartitionSummary {
    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Applied => self.applied += 1,
            MessageOutcome::SkippedMalformed => self.skipped_malformed += 1,
            MessageOutcome::SkippedSemantic => self.skipped_semantic += 1,
            MessageOutcome::RetryPending => self.retry_pending += 1,
            MessageOutcome::Ignored => self.ignored += 1,
        }
    }

    /// Messages that reached a final outcome.
    #[must_use]
    pub fn processed(&self) -> u64 {
        self.applied + self.skipped_malformed + self.skipped_semantic + self.ignored
    }
}

#[derive(Clone)]
pub struct IngestionLoop {
    pipeline: Arc<Pipeline>,
    poll_timeout: Duration,
    /// Pause after a poll error or an uncommitted message
    retry_backoff: Duration,
}

impl IngestionLoop {
    pub fn new(pipeline: Arc<Pipeline>, config: &SyncConfig) -> Self {
        Self {
            pipeline,
            poll_timeout: config.poll_timeout(),
            retry_backoff: config.poll_timeout(),
        }
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Run `source` on its own task until `shutdown` is set.
    pub fn spawn<S>(&self, source: S, shutdown: watch::Receiver<bool>) -> JoinHandle<PartitionSummary>
    where
        S: MessageSource + 'static,
    {
        let this = self.clone();
        tokio::spawn(async move { this.run(source, shutdown).await })
    }

    /// Run `source` on the current task. Always closes it before returning.
    pub async fn run<S: MessageSource>(&self, mut source: S, shutdown: watch::Receiver<bool>) -> PartitionSummary {
        let mut summary = PartitionSummary {
            source: source.describe(),
            ..Default::default()
        };
        metrics::set_active_partitions(ACTIVE_PARTITIONS.fetch_add(1, Ordering::Relaxed) + 1);
        info!(source = %summary.source, "Partition subscribed");

        let result = AssertUnwindSafe(self.consume(&mut source, &mut summary, shutdown))
            .catch_unwind()
            .await;
        if result.is_err() {
            error!(source = %summary.source, "Partition worker panicked, closing source");
            summary.panicked = true;
        }

        source.close().await;
        metrics::set_active_partitions(ACTIVE_PARTITIONS.fetch_sub(1, Ordering::Relaxed).saturating_sub(1));
        info!(
            source = %summary.source,
            applied = summary.applied,
            committed = summary.committed,
            "Partition closed"
        );
        summary
    }

    async fn consume<S: MessageSource>(
        &self,
        source: &mut S,
        summary: &mut PartitionSummary,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            // A dropped sender counts as shutdown
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }

            let message = match source.poll(self.poll_timeout).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(SourceError::Closed) => {
                    warn!(source = %summary.source, "Source closed underneath the loop");
                    break;
                }
                Err(e) => {
                    warn!(source = %summary.source, error = %e, "Poll failed, retrying");
                    metrics::record_poll_error(&summary.source);
                    summary.poll_errors += 1;
                    if !self.back_off(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let outcome = self.pipeline.process(&message).await;
            summary.record(outcome);

            if !outcome.should_commit() {
                if !self.back_off(&mut shutdown).await {
                    break;
                }
                continue;
            }

            let partition = message.partition_label();
            match source.commit(&message).await {
                Ok(()) => {
                    metrics::record_commit(&partition, true);
                    summary.committed += 1;
                }
                Err(e) => {
                    // Redelivered later; the applier is idempotent
                    warn!(topic = %message.topic, offset = %message.offset, error = %e, "Commit failed");
                    metrics::record_commit(&partition, false);
                    summary.commit_errors += 1;
                }
            }
        }
    }

    /// Wait out the retry backoff. Returns false if shutdown came first.
    async fn back_off(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.retry_backoff) => true,
            _ = shutdown.wait_for(|stop| *stop) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::SyncApplier;
    use crate::config::DeletePolicy;
    use crate::storage::memory::InMemoryReplica;

    const CDC: &str = "cubecastle-postgres.public.organization_units";

    fn ingestion(replica: Arc<InMemoryReplica>) -> IngestionLoop {
        let config = SyncConfig {
            cdc_topics: vec![CDC.into()],
            poll_timeout_ms: 5,
            ..SyncConfig::default()
        };
        let applier = Arc::new(SyncApplier::new(replica, DeletePolicy::Soft));
        let pipeline = Arc::new(Pipeline::new(&config, applier, None));
        IngestionLoop::new(pipeline, &config).with_retry_backoff(Duration::from_millis(1))
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_processes_and_commits_in_order() {
        let replica = Arc::new(InMemoryReplica::new());
        let source = InMemorySource::new(CDC);
        source.publish(r#"{"op":"c","after":{"tenant_id":"t1","code":"a"}}"#);
        source.publish(r#"not json"#);
        source.publish(r#"{"op":"c","after":{"tenant_id":"t1","code":"b"}}"#);

        let (tx, rx) = watch::channel(false);
        let handle = ingestion(replica.clone()).spawn(source.clone(), rx);

        let probe = source.clone();
        wait_until(|| probe.outstanding() == 0).await;
        tx.send(true).unwrap();
        let summary = handle.await.unwrap();

        assert_eq!(source.committed_offsets(), vec!["0", "1", "2"]);
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.skipped_malformed, 1);
        assert_eq!(replica.len(), 2);
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn test_poll_and_commit_errors_are_survived() {
        let replica = Arc::new(InMemoryReplica::new());
        let source = InMemorySource::new(CDC);
        source.fail_next_polls(2);
        source.fail_next_commits(1);
        source.publish(r#"{"op":"c","after":{"tenant_id":"t1","code":"a"}}"#);

        let (tx, rx) = watch::channel(false);
        let handle = ingestion(replica.clone()).spawn(source.clone(), rx);

        let probe = source.clone();
        wait_until(|| probe.outstanding() == 0).await;
        tx.send(true).unwrap();
        let summary = handle.await.unwrap();

        assert_eq!(summary.poll_errors, 2);
        assert_eq!(summary.commit_errors, 1);
        // Redelivered after the failed commit and applied again
        assert_eq!(summary.applied, 2);
        assert_eq!(source.committed_offsets(), vec!["0"]);
        assert_eq!(replica.len(), 1);
    }

    struct PanickingSource {
        inner: InMemorySource,
    }

    #[async_trait]
    impl MessageSource for PanickingSource {
        async fn poll(&mut self, _timeout: Duration) -> Result<Option<RawMessage>, SourceError> {
            panic!("transport bug");
        }
        async fn commit(&mut self, message: &RawMessage) -> Result<(), SourceError> {
            self.inner.commit(message).await
        }
        async fn close(&mut self) {
            self.inner.close().await
        }
        fn describe(&self) -> String {
            "panicking".into()
        }
    }

    #[tokio::test]
    async fn test_source_closed_after_panic() {
        let handle = InMemorySource::new(CDC);
        let source = PanickingSource { inner: handle.clone() };
        let (_tx, rx) = watch::channel(false);

        let summary = ingestion(Arc::new(InMemoryReplica::new())).run(source, rx).await;
        assert!(summary.panicked);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_cuts_backoff_short() {
        let source = InMemorySource::new(CDC);
        source.fail_next_polls(usize::MAX);
        let (tx, rx) = watch::channel(false);
        let handle = ingestion(Arc::new(InMemoryReplica::new()))
            .with_retry_backoff(Duration::from_secs(60))
            .spawn(source.clone(), rx);

        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let summary = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop stayed in backoff")
            .unwrap();
        assert_eq!(summary.poll_errors, 1);
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn test_dropped_sender_stops_loop() {
        let (tx, rx) = watch::channel(false);
        let source: Box<dyn MessageSource> = Box::new(InMemorySource::new(CDC));
        let handle = ingestion(Arc::new(InMemoryReplica::new())).spawn(source, rx);
        drop(tx);

        let summary = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert_eq!(summary.processed(), 0);
    }
}
