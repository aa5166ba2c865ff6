// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams consumer-group binding of [`MessageSource`].
//!
//! One stream per topic. Each entry carries a `payload` field and, on
//! domain-event streams, an `event-type` field:
//!
//! ```text
//! XADD organization.events * event-type OrganizationCreated payload {...}
//! ```
//!
//! Every poll first re-reads this consumer's pending entries (`XREADGROUP
//! .. 0`), so a message left uncommitted after a transient failure is
//! delivered again before anything new (`XREADGROUP .. >` with `BLOCK`).
//! `commit` is `XACK`.
//!
//! Each source owns its own connection: a blocking read would otherwise
//! stall every other user of a multiplexed connection.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::source::{MessageSource, RawMessage, SourceError};
use crate::cdc::EVENT_TYPE_HEADER;
use crate::resilience::retry::{retry, RetryConfig};

const PAYLOAD_FIELD: &str = "payload";

pub struct RedisStreamSource {
    connection: ConnectionManager,
    stream: String,
    group: String,
    consumer: String,
    closed: bool,
}

impl RedisStreamSource {
    /// Connect and join `group` on `stream`, creating both if missing.
    pub async fn new(redis_url: &str, stream: &str, group: &str, consumer: &str) -> Result<Self, SourceError> {
        let client = Client::open(redis_url)?;
        let connection = retry("redis_stream_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await?;

        let source = Self {
            connection,
            stream: stream.to_string(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            closed: false,
        };
        source.ensure_group().await?;
        info!(stream, group, consumer, "Joined stream consumer group");
        Ok(source)
    }

    async fn ensure_group(&self) -> Result<(), SourceError> {
        let mut conn = self.connection.clone();
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %self.stream, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, id: &str, block: Option<Duration>) -> Result<Option<RawMessage>, SourceError> {
        let mut options = StreamReadOptions::default().group(&self.group, &self.consumer).count(1);
        if let Some(block) = block {
            options = options.block(block.as_millis().max(1) as usize);
        }

        let mut conn = self.connection.clone();
        let reply: Option<StreamReadReply> = conn.xread_options(&[&self.stream], &[id], &options).await?;

        let entry = reply
            .into_iter()
            .flat_map(|r| r.keys)
            .flat_map(|k| k.ids)
            .next();
        Ok(entry.map(|entry| self.to_message(entry)))
    }

    fn to_message(&self, entry: StreamId) -> RawMessage {
        let mut headers = BTreeMap::new();
        if let Some(event_type) = entry.get::<String>(EVENT_TYPE_HEADER) {
            headers.insert(EVENT_TYPE_HEADER.to_string(), event_type);
        }
        // A trimmed entry comes back without fields; an empty payload is
        // rejected by the decoder and committed past.
        let payload = entry.get::<Vec<u8>>(PAYLOAD_FIELD).unwrap_or_default();

        RawMessage {
            topic: self.stream.clone(),
            partition: 0,
            offset: entry.id,
            headers,
            payload,
        }
    }
}

#[async_trait]
impl MessageSource for RedisStreamSource {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<RawMessage>, SourceError> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        if let Some(pending) = self.read("0", None).await? {
            debug!(stream = %self.stream, offset = %pending.offset, "Redelivering pending entry");
            return Ok(Some(pending));
        }
        self.read(">", Some(timeout)).await
    }

    async fn commit(&mut self, message: &RawMessage) -> Result<(), SourceError> {
        let mut conn = self.connection.clone();
        let acked: usize = conn.xack(&self.stream, &self.group, &[&message.offset]).await?;
        if acked == 0 {
            warn!(stream = %self.stream, offset = %message.offset, "Entry was not pending at ack time");
        }
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            info!(stream = %self.stream, consumer = %self.consumer, "Left stream consumer group");
        }
    }

    fn describe(&self) -> String {
        format!("redis-stream:{}/{}@{}", self.stream, self.group, self.consumer)
    }
}
