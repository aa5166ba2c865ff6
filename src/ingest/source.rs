// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport seam for inbound change messages.
//!
//! A [`MessageSource`] is one partition of one topic as seen by one
//! consumer. Delivery is at-least-once: a message that was polled but not
//! committed comes back on a later poll.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("source is closed")]
    Closed,
}

impl From<redis::RedisError> for SourceError {
    fn from(e: redis::RedisError) -> Self {
        Self::Transport(e.to_string())
    }
}

/// One message as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: u32,
    /// Transport position, e.g. a stream entry id
    pub offset: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, offset: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: offset.into(),
            headers: BTreeMap::new(),
            payload: payload.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Header lookup, ignoring ASCII case.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `topic/partition`, used as a metrics label.
    #[must_use]
    pub fn partition_label(&self) -> String {
        format!("{}/{}", self.topic, self.partition)
    }
}

#[async_trait]
pub trait MessageSource: Send {
    /// Next message, or `None` once `timeout` passes without one.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<RawMessage>, SourceError>;

    /// Mark `message` as processed so it is not delivered again.
    async fn commit(&mut self, message: &RawMessage) -> Result<(), SourceError>;

    /// Release the subscription. Safe to call more than once.
    async fn close(&mut self);

    /// Human-readable subscription name for logs.
    fn describe(&self) -> String;
}

#[derive(Debug, Default)]
struct InMemoryState {
    queue: VecDeque<RawMessage>,
    /// Polled but not yet committed, oldest first
    in_flight: VecDeque<RawMessage>,
    committed: Vec<RawMessage>,
    deliveries: usize,
    next_offset: u64,
    fail_polls: usize,
    fail_commits: usize,
    closed: bool,
}

/// Process-local source for tests and demos.
///
/// Clones share one queue, so a test can keep a handle to publish messages
/// and inspect commits while the ingestion loop owns another.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    topic: String,
    partition: u32,
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemorySource {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            state: Arc::new(Mutex::new(InMemoryState::default())),
        }
    }

    /// Enqueue a payload on this source's topic and return its offset.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> String {
        self.publish_with_headers(payload, BTreeMap::new())
    }

    pub fn publish_with_headers(&self, payload: impl Into<Vec<u8>>, headers: BTreeMap<String, String>) -> String {
        let mut state = self.state.lock();
        let offset = state.next_offset.to_string();
        state.next_offset += 1;
        state.queue.push_back(RawMessage {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: offset.clone(),
            headers,
            payload: payload.into(),
        });
        offset
    }

    /// Fail the next `n` polls with a transport error.
    pub fn fail_next_polls(&self, n: usize) {
        self.state.lock().fail_polls = n;
    }

    /// Fail the next `n` commits with a transport error.
    pub fn fail_next_commits(&self, n: usize) {
        self.state.lock().fail_commits = n;
    }

    #[must_use]
    pub fn committed_offsets(&self) -> Vec<String> {
        self.state.lock().committed.iter().map(|m| m.offset.clone()).collect()
    }

    /// Messages not yet committed, delivered or not.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.queue.len() + state.in_flight.len()
    }

    /// Total deliveries, redeliveries included.
    #[must_use]
    pub fn deliveries(&self) -> usize {
        self.state.lock().deliveries
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<RawMessage>, SourceError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SourceError::Closed);
            }
            if state.fail_polls > 0 {
                state.fail_polls -= 1;
                return Err(SourceError::Transport("injected poll failure".into()));
            }
            // Redeliver the oldest uncommitted message before anything new
            let next = match state.in_flight.front().cloned() {
                Some(pending) => Some(pending),
                None => {
                    let fresh = state.queue.pop_front();
                    if let Some(ref m) = fresh {
                        state.in_flight.push_back(m.clone());
                    }
                    fresh
                }
            };
            if let Some(message) = next {
                state.deliveries += 1;
                return Ok(Some(message));
            }
        }

        tokio::time::sleep(timeout.min(Duration::from_millis(5))).await;
        Ok(None)
    }

    async fn commit(&mut self, message: &RawMessage) -> Result<(), SourceError> {
        let mut state = self.state.lock();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(SourceError::Transport("injected commit failure".into()));
        }
        if let Some(pos) = state.in_flight.iter().position(|m| m.offset == message.offset) {
            if let Some(done) = state.in_flight.remove(pos) {
                state.committed.push(done);
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().closed = true;
    }

    fn describe(&self) -> String {
        format!("memory:{}/{}", self.topic, self.partition)
    }
}
