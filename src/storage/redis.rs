// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis shared cache (tier 2).
//!
//! Entries are JSON documents under `{namespace}:{key}` written with
//! `SET .. EX`. Every tag of an entry is a sorted set of the keys it
//! indexes, scored by each key's expiry in epoch seconds:
//!
//! ```text
//! org_v1:org:t1:1000001             → {"key": .., "payload": {..}, "metadata": {..}, ..}
//! org_v1:tag:tenant:t1              → {org_v1:org:t1:1000001 @1754829000, org_v1:orgs:t1:9f1c.. @1754829060}
//! org_v1:tag:tenant:t1:kind:list    → {org_v1:orgs:t1:9f1c.. @1754829060}
//! ```
//!
//! Tags are scoped to one tenant, so no set is shared across tenants and no
//! wildcard scan of the namespace is needed. Members whose entry has expired
//! are dropped (`ZREMRANGEBYSCORE`) every time their set is written or read,
//! which keeps each set no larger than the live entries it indexes.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use chrono::Utc;
use redis::{cmd, pipe, AsyncCommands, Client};
use std::collections::BTreeSet;
use std::time::Duration;

use super::traits::{SharedCache, StorageError};
use crate::cache::entry::CacheEntry;
use crate::cache::keys::tags_of;
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisSharedCache {
    connection: ConnectionManager,
    /// Namespace with trailing colon, e.g. "org_v1:"
    prefix: String,
}

impl RedisSharedCache {
    /// Connect with startup retry. Keys are stored under `namespace:`.
    pub async fn new(connection_string: &str, namespace: &str) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(|e| StorageError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(Self::from_connection(connection, namespace))
    }

    pub fn from_connection(connection: ConnectionManager, namespace: &str) -> Self {
        Self {
            connection,
            prefix: namespace_prefix(namespace),
        }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    #[inline]
    fn tag_key(&self, tag: &str) -> String {
        format!("{}tag:{}", self.prefix, tag)
    }

    #[inline]
    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.prefix).unwrap_or(key)
    }
}

fn namespace_prefix(namespace: &str) -> String {
    let namespace = namespace.trim_end_matches(':');
    if namespace.is_empty() {
        String::new()
    } else {
        format!("{}:", namespace)
    }
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(key);

        let raw: Option<String> = retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            async move {
                let data: Option<String> = conn.get(&key).await?;
                Ok(data)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        raw.map(|doc| {
            serde_json::from_str(&doc).map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    async fn put(&self, entry: &CacheEntry, ttl: Duration) -> Result<(), StorageError> {
        let doc = serde_json::to_string(entry).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let conn = self.connection.clone();
        let prefixed = self.prefixed_key(&entry.key);
        let tag_keys: Vec<String> = entry.tags.iter().map(|t| self.tag_key(t)).collect();
        let seconds = ttl.as_secs().max(1);

        retry("redis_put", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let key = prefixed.clone();
            let doc = doc.clone();
            let tag_keys = tag_keys.clone();
            async move {
                let now = Utc::now().timestamp();
                let mut pipeline = pipe();
                pipeline.atomic().set_ex(&key, doc, seconds).ignore();
                for tag_key in &tag_keys {
                    pipeline.zrembyscore(tag_key, "-inf", now).ignore();
                    pipeline.zadd(tag_key, &key, now + seconds as i64).ignore();
                    pipeline.expire(tag_key, seconds as i64).ignore();
                }
                pipeline.query_async::<()>(&mut conn).await
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let conn = self.connection.clone();
        let prefixed: Vec<String> = keys.iter().map(|k| self.prefixed_key(k)).collect();
        let memberships: Vec<(String, String)> = keys
            .iter()
            .zip(&prefixed)
            .flat_map(|(key, full)| tags_of(key).into_iter().map(move |tag| (tag, full.clone())))
            .map(|(tag, full)| (self.tag_key(&tag), full))
            .collect();

        retry("redis_delete", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let prefixed = prefixed.clone();
            let memberships = memberships.clone();
            async move {
                let mut pipeline = pipe();
                pipeline.atomic().del(&prefixed);
                for (tag_key, member) in &memberships {
                    pipeline.zrem(tag_key, member).ignore();
                }
                let (removed,): (usize,) = pipeline.query_async(&mut conn).await?;
                Ok(removed)
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))
    }

    async fn tagged(&self, tags: &[String]) -> Result<Vec<String>, StorageError> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connection.clone();
        let tag_keys: Vec<String> = tags.iter().map(|t| self.tag_key(t)).collect();

        let sets: Vec<Vec<String>> = retry("redis_tagged", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let tag_keys = tag_keys.clone();
            async move {
                let now = Utc::now().timestamp();
                let mut pipeline = pipe();
                pipeline.atomic();
                for tag_key in &tag_keys {
                    pipeline.zrembyscore(tag_key, "-inf", now).ignore();
                    pipeline.zrangebyscore(tag_key, format!("({}", now), "+inf");
                }
                pipeline.query_async(&mut conn).await
            }
        })
        .await
        .map_err(|e: redis::RedisError| StorageError::Backend(e.to_string()))?;

        Ok(intersect(sets)
            .iter()
            .map(|m| self.strip_prefix(m).to_string())
            .collect())
    }

    async fn ping(&self) -> bool {
        let mut conn = self.connection.clone();
        let result: Result<String, _> = cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }
}

/// Members present in every set, sorted.
fn intersect(sets: Vec<Vec<String>>) -> BTreeSet<String> {
    let mut sets = sets.into_iter();
    let Some(first) = sets.next() else {
        return BTreeSet::new();
    };
    let mut acc: BTreeSet<String> = first.into_iter().collect();
    for set in sets {
        let set: BTreeSet<String> = set.into_iter().collect();
        acc.retain(|m| set.contains(m));
    }
    acc
}
