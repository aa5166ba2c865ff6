// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded exponential backoff for store and transport calls.
//!
//! Retries here are short and local: they smooth over a dropped pooled
//! connection, a busy SQLite file or a Redis failover. Errors the backend
//! raised about the statement itself are returned on the first attempt.
//! Anything still failing after the schedule surfaces as a transient apply
//! error, and the ingestion loop leaves the message for redelivery.
//!
//! # Example
//!
//! ```
//! use org_sync::RetryConfig;
//!
//! // Connecting at startup: a handful of attempts, then give up
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//!
//! // One statement on the message path
//! let query = RetryConfig::query();
//! assert_eq!(query.max_attempts, 3);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::storage::traits::StorageError;

/// Errors that know whether repeating the call could help.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }
}

impl Transient for redis::RedisError {
    fn is_transient(&self) -> bool {
        self.is_io_error()
            || self.is_timeout()
            || self.is_connection_dropped()
            || self.is_connection_refusal()
            || matches!(
                self.kind(),
                redis::ErrorKind::TryAgain
                    | redis::ErrorKind::BusyLoadingError
                    | redis::ErrorKind::ClusterDown
                    | redis::ErrorKind::MasterDown
            )
    }
}

/// Backoff schedule for a retried call. `max_attempts` includes the first try.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Connection setup. Five attempts, roughly three seconds in total.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// A single statement on the message path. Kept short so one partition
    /// never stalls for long behind a dead backend.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the schedule
/// runs out. Returns the last error.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Transient,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        let err = match operation().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempts = attempt, "Operation recovered");
                }
                return Ok(val);
            }
            Err(err) => err,
        };

        if !err.is_transient() {
            debug!(operation = operation_name, error = %err, "Permanent failure, not retrying");
            return Err(err);
        }
        if attempt >= config.max_attempts {
            warn!(operation = operation_name, attempts = attempt, error = %err, "Retries exhausted");
            return Err(err);
        }

        warn!(
            operation = operation_name,
            attempt,
            max_attempts = config.max_attempts,
            error = %err,
            retry_in = ?delay,
            "Operation failed, retrying"
        );
        metrics::record_retry(operation_name);
        sleep(delay).await;
        delay = config.next_delay(delay);
    }
}
