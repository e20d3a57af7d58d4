//! Pipeline configuration loaded from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `EVENTLINE_WORKERS` | 1 |
//! | `EVENTLINE_POLL_DELAY_MS` | 1000 |
//! | `EVENTLINE_ERROR_DELAY_MS` | 5000 |
//! | `EVENTLINE_ABANDONED_TIMEOUT_SECS` | 300 |
//! | `EVENTLINE_CLEANUP_INTERVAL_MS` | 5000 |
//! | `EVENTLINE_CLEANUP_BATCH_SIZE` | 100 |
//! | `EVENTLINE_MAX_ATTEMPTS` | unset (retry forever) |
//! | `EVENTLINE_RELEASE_ON_TRANSIENT` | false |
//! | `EVENTLINE_PROJECTION_IDLE_DELAY_MS` | 500 |
//! | `EVENTLINE_PROJECTION_ERROR_DELAY_MS` | 10000 |
//! | `EVENTLINE_PROJECTION_BATCH_SIZE` | 1 |
//!
//! Unparseable values fall back to the default.

use crate::backoff::BackoffPolicy;
use crate::manager::EventManagerConfig;
use crate::queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tunables for the queue, the event manager and projection runners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of processing loops
    pub workers: usize,
    /// Sleep when the queue is empty
    pub poll_delay: Duration,
    /// First sleep after a failed processing step
    pub error_delay: Duration,
    /// Lease age after which a claimed event may be reclaimed
    pub abandoned_timeout: Duration,
    /// Sleep between cleanup passes
    pub cleanup_interval: Duration,
    /// Queue rows scanned per cleanup page
    pub cleanup_batch_size: usize,
    /// Attempts before a transient failure becomes unrecoverable
    pub max_attempts: Option<u32>,
    /// Release claims right after a transient failure
    pub release_on_transient: bool,
    /// Projection runner sleep when caught up
    pub projection_idle_delay: Duration,
    /// Projection runner sleep after a failure
    pub projection_error_delay: Duration,
    /// Log entries applied per projection poll
    pub projection_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_delay: Duration::from_secs(1),
            error_delay: Duration::from_secs(5),
            abandoned_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(5),
            cleanup_batch_size: 100,
            max_attempts: None,
            release_on_transient: false,
            projection_idle_delay: Duration::from_millis(500),
            projection_error_delay: Duration::from_secs(10),
            projection_batch_size: 1,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parse(key).map_or(default, Duration::from_millis)
        };

        Self {
            workers: parsed(&lookup, "EVENTLINE_WORKERS").unwrap_or(defaults.workers),
            poll_delay: millis("EVENTLINE_POLL_DELAY_MS", defaults.poll_delay),
            error_delay: millis("EVENTLINE_ERROR_DELAY_MS", defaults.error_delay),
            abandoned_timeout: parse("EVENTLINE_ABANDONED_TIMEOUT_SECS")
                .map_or(defaults.abandoned_timeout, Duration::from_secs),
            cleanup_interval: millis("EVENTLINE_CLEANUP_INTERVAL_MS", defaults.cleanup_interval),
            cleanup_batch_size: parsed(&lookup, "EVENTLINE_CLEANUP_BATCH_SIZE")
                .unwrap_or(defaults.cleanup_batch_size),
            max_attempts: parsed(&lookup, "EVENTLINE_MAX_ATTEMPTS").filter(|n| *n > 0),
            release_on_transient: parsed(&lookup, "EVENTLINE_RELEASE_ON_TRANSIENT")
                .unwrap_or(defaults.release_on_transient),
            projection_idle_delay: millis(
                "EVENTLINE_PROJECTION_IDLE_DELAY_MS",
                defaults.projection_idle_delay,
            ),
            projection_error_delay: millis(
                "EVENTLINE_PROJECTION_ERROR_DELAY_MS",
                defaults.projection_error_delay,
            ),
            projection_batch_size: parsed(&lookup, "EVENTLINE_PROJECTION_BATCH_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.projection_batch_size),
        }
    }

    /// Queue policy.
    #[must_use]
    pub const fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            abandoned_timeout: self.abandoned_timeout,
        }
    }

    /// Event manager policy.
    #[must_use]
    pub fn manager_config(&self) -> EventManagerConfig {
        let backoff = BackoffPolicy::builder()
            .idle_delay(self.poll_delay)
            .error_delay(self.error_delay)
            .build();

        EventManagerConfig::default()
            .with_backoff(backoff)
            .with_cleanup_interval(self.cleanup_interval)
            .with_cleanup_batch_size(self.cleanup_batch_size)
            .with_max_attempts(self.max_attempts)
            .with_release_on_transient(self.release_on_transient)
    }

    /// Delays for projection runners.
    #[must_use]
    pub fn projection_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::builder()
            .idle_delay(self.projection_idle_delay)
            .error_delay(self.projection_error_delay)
            .max_error_delay(self.projection_error_delay.max(Duration::from_secs(60)))
            .build()
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}
