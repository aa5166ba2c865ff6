// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-message processing: route, decode, apply, bring the cache in line.
//!
//! [`Pipeline::process`] never fails. Every message ends in exactly one
//! [`MessageOutcome`], and only [`MessageOutcome::RetryPending`] keeps the
//! message uncommitted.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::source::RawMessage;
use crate::applier::SyncApplier;
use crate::cache::CacheManager;
use crate::cdc::{ChangeRecord, DecodeError, DomainEventDecoder, DomainEventKind, EnvelopeDecoder, EVENT_TYPE_HEADER};
use crate::config::SyncConfig;
use crate::metrics;

/// How a topic's payloads are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Raw table-change envelopes
    Cdc,
    /// Domain events typed by the `event-type` header
    DomainEvents,
    Unknown,
}

impl TopicKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cdc => "cdc",
            Self::DomainEvents => "domain",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Written to the replica, cache brought in line
    Applied,
    /// Payload could not be decoded
    SkippedMalformed,
    /// Decoded but refused by the applier (unknown key, invalid change)
    SkippedSemantic,
    /// Replica unavailable. Left uncommitted for redelivery
    RetryPending,
    /// Unknown topic or event type
    Ignored,
}

impl MessageOutcome {
    #[must_use]
    pub fn should_commit(&self) -> bool {
        !matches!(self, Self::RetryPending)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::SkippedMalformed => "skipped_malformed",
            Self::SkippedSemantic => "skipped_semantic",
            Self::RetryPending => "retry_pending",
            Self::Ignored => "ignored",
        }
    }
}

pub struct Pipeline {
    envelope: EnvelopeDecoder,
    domain: DomainEventDecoder,
    applier: Arc<SyncApplier>,
    cache: Option<Arc<CacheManager>>,
    cdc_topics: HashSet<String>,
    domain_topics: HashSet<String>,
}

impl Pipeline {
    /// `cache` is optional so the replica can be synced without a cache tier.
    pub fn new(config: &SyncConfig, applier: Arc<SyncApplier>, cache: Option<Arc<CacheManager>>) -> Self {
        Self {
            envelope: EnvelopeDecoder::new(config.default_tenant_id.clone()),
            domain: DomainEventDecoder::new(config.default_tenant_id.clone()),
            applier,
            cache,
            cdc_topics: config.cdc_topics.iter().cloned().collect(),
            domain_topics: config.domain_event_topics.iter().cloned().collect(),
        }
    }

    #[must_use]
    pub fn topic_kind(&self, topic: &str) -> TopicKind {
        if self.cdc_topics.contains(topic) {
            TopicKind::Cdc
        } else if self.domain_topics.contains(topic) {
            TopicKind::DomainEvents
        } else {
            TopicKind::Unknown
        }
    }

    #[tracing::instrument(skip(self, message), fields(topic = %message.topic, offset = %message.offset))]
    pub async fn process(&self, message: &RawMessage) -> MessageOutcome {
        let _timer = metrics::LatencyTimer::new("message");
        let kind = self.topic_kind(&message.topic);

        let decoded = {
            let _timer = metrics::LatencyTimer::new("decode");
            match kind {
                TopicKind::Cdc => self.envelope.decode(&message.payload),
                TopicKind::DomainEvents => {
                    let event_type = message.header(EVENT_TYPE_HEADER).unwrap_or_default();
                    match DomainEventKind::parse(event_type) {
                        Some(event) => self.domain.decode(event, &message.payload),
                        None => {
                            info!(event_type, "Ignoring unknown domain event type");
                            metrics::record_event(kind.as_str(), "unknown", MessageOutcome::Ignored.as_str());
                            return MessageOutcome::Ignored;
                        }
                    }
                }
                TopicKind::Unknown => {
                    warn!("Ignoring message from unconfigured topic");
                    metrics::record_event(kind.as_str(), "unknown", MessageOutcome::Ignored.as_str());
                    return MessageOutcome::Ignored;
                }
            }
        };

        let record = match decoded {
            Ok(record) => record,
            Err(e) => return self.malformed(kind, e),
        };

        let outcome = self.apply(&record).await;
        metrics::record_event(kind.as_str(), record.operation().as_str(), outcome.as_str());
        outcome
    }

    fn malformed(&self, kind: TopicKind, error: DecodeError) -> MessageOutcome {
        warn!(error = %error, "Skipping malformed message");
        metrics::record_event(kind.as_str(), "unknown", MessageOutcome::SkippedMalformed.as_str());
        MessageOutcome::SkippedMalformed
    }

    async fn apply(&self, record: &ChangeRecord) -> MessageOutcome {
        let applied = {
            let _timer = metrics::LatencyTimer::new("apply");
            self.applier.apply(record).await
        };

        match applied {
            Ok(change) => {
                if let Some(cache) = &self.cache {
                    let _timer = metrics::LatencyTimer::new("cache");
                    let report = cache.on_change(&change).await;
                    if report.errors > 0 {
                        warn!(errors = report.errors, "Cache partially out of line, entries expire by TTL");
                    }
                }
                debug!(tenant = %record.key().tenant_id, code = %record.key().code, "Message applied");
                MessageOutcome::Applied
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Replica unavailable, leaving message for redelivery");
                MessageOutcome::RetryPending
            }
            Err(e) => {
                warn!(error = %e, "Skipping change refused by the applier");
                MessageOutcome::SkippedSemantic
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeletePolicy;
    use crate::storage::memory::{InMemoryReplica, InMemorySharedCache};
    use crate::storage::traits::ReplicaStore;
    use crate::org_unit::NaturalKey;

    const CDC: &str = "cubecastle-postgres.public.organization_units";
    const EVENTS: &str = "organization.events";

    fn pipeline() -> (Arc<InMemoryReplica>, Pipeline) {
        let config = SyncConfig {
            cdc_topics: vec![CDC.into()],
            domain_event_topics: vec![EVENTS.into()],
            ..SyncConfig::default()
        };
        let replica = Arc::new(InMemoryReplica::new());
        let applier = Arc::new(SyncApplier::new(replica.clone(), DeletePolicy::Soft));
        let cache = Arc::new(CacheManager::new(&config, Arc::new(InMemorySharedCache::new()), replica.clone()));
        (replica.clone(), Pipeline::new(&config, applier, Some(cache)))
    }

    #[tokio::test]
    async fn test_cdc_create_is_applied() {
        let (replica, pipeline) = pipeline();
        let message = RawMessage::new(
            CDC,
            "0",
            br#"{"op":"c","after":{"tenant_id":"t1","code":"1000001","name":"Engineering"}}"#.to_vec(),
        );

        assert_eq!(pipeline.process(&message).await, MessageOutcome::Applied);
        assert!(replica.get(&NaturalKey::new("t1", "1000001")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_domain_event_uses_header() {
        let (replica, pipeline) = pipeline();
        let message = RawMessage::new(
            EVENTS,
            "0",
            br#"{"aggregate_id":"1000002","tenant_id":"t1","name":"Sales"}"#.to_vec(),
        )
        .with_header(EVENT_TYPE_HEADER, "OrganizationCreated");

        assert_eq!(pipeline.process(&message).await, MessageOutcome::Applied);
        let unit = replica.get(&NaturalKey::new("t1", "1000002")).await.unwrap().unwrap();
        assert_eq!(unit.name, "Sales");
    }

    #[tokio::test]
    async fn test_outcomes_for_skipped_messages() {
        let (replica, pipeline) = pipeline();

        let malformed = RawMessage::new(CDC, "0", br#"{"op":"u","before":{"code":"1"}}"#.to_vec());
        assert_eq!(pipeline.process(&malformed).await, MessageOutcome::SkippedMalformed);

        let unknown_update = RawMessage::new(CDC, "1", br#"{"op":"u","after":{"tenant_id":"t1","code":"ghost"}}"#.to_vec());
        assert_eq!(pipeline.process(&unknown_update).await, MessageOutcome::SkippedSemantic);

        let unknown_event = RawMessage::new(EVENTS, "2", b"{}".to_vec()).with_header(EVENT_TYPE_HEADER, "OrganizationMerged");
        assert_eq!(pipeline.process(&unknown_event).await, MessageOutcome::Ignored);

        let stray = RawMessage::new("other.topic", "3", b"{}".to_vec());
        assert_eq!(pipeline.process(&stray).await, MessageOutcome::Ignored);

        assert!(replica.is_empty());
    }

    #[test]
    fn test_only_retry_pending_stays_uncommitted() {
        assert!(MessageOutcome::Applied.should_commit());
        assert!(MessageOutcome::SkippedMalformed.should_commit());
        assert!(MessageOutcome::SkippedSemantic.should_commit());
        assert!(MessageOutcome::Ignored.should_commit());
        assert!(!MessageOutcome::RetryPending.should_commit());
    }
}
