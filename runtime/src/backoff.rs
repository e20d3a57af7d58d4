//! Delays used by the long-running loops.
//!
//! Every loop in the pipeline sleeps for a short idle delay when it finds no
//! work and for a longer delay after a failure. Both
//! sleeps race against the shutdown signal, which is the only place the loops
//! observe cancellation.
//!
//! # Example
//!
//! ```rust
//! use eventline_runtime::backoff::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::builder()
//!     .idle_delay(Duration::from_millis(200))
//!     .error_delay(Duration::from_secs(1))
//!     .max_error_delay(Duration::from_secs(30))
//!     .multiplier(2.0)
//!     .build();
//!
//! assert_eq!(policy.error_delay_for(1), Duration::from_secs(1));
//! assert_eq!(policy.error_delay_for(2), Duration::from_secs(2));
//! assert_eq!(BackoffPolicy::default().error_delay_for(3), Duration::from_secs(5));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

/// Idle and error delays for a polling loop.
///
/// # Default Values
///
/// - `idle_delay`: 1 second
/// - `error_delay`: 5 seconds
/// - `max_error_delay`: 60 seconds
/// - `multiplier`: 1.0 (the error delay stays fixed)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Sleep when a poll found nothing to do
    pub idle_delay: Duration,
    /// Sleep after the first consecutive failure
    pub error_delay: Duration,
    /// Cap for the error delay
    pub max_error_delay: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_secs(1),
            error_delay: Duration::from_secs(5),
            max_error_delay: Duration::from_secs(60),
            multiplier: 1.0,
        }
    }
}

impl BackoffPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder {
            idle_delay: None,
            error_delay: None,
            max_error_delay: None,
            multiplier: None,
        }
    }

    /// Delay after `consecutive_failures` failures in a row.
    ///
    /// Computed as `error_delay * multiplier^(failures - 1)`,
    /// capped at `max_error_delay`. Zero failures means the idle delay.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_possible_wrap
    )]
    pub fn error_delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.idle_delay;
        }

        let exponent = consecutive_failures.saturating_sub(1).min(32) as i32;
        let delay_ms = self.error_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let delay = Duration::from_millis(delay_ms as u64);

        delay.min(self.max_error_delay)
    }
}

/// Builder for [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct BackoffPolicyBuilder {
    idle_delay: Option<Duration>,
    error_delay: Option<Duration>,
    max_error_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl BackoffPolicyBuilder {
    /// Set the idle delay.
    #[must_use]
    pub const fn idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = Some(delay);
        self
    }

    /// Set the delay after the first failure.
    #[must_use]
    pub const fn error_delay(mut self, delay: Duration) -> Self {
        self.error_delay = Some(delay);
        self
    }

    /// Set the cap for the error delay.
    #[must_use]
    pub const fn max_error_delay(mut self, delay: Duration) -> Self {
        self.max_error_delay = Some(delay);
        self
    }

    /// Set the growth factor per consecutive failure.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`BackoffPolicy`].
    #[must_use]
    pub fn build(self) -> BackoffPolicy {
        let defaults = BackoffPolicy::default();
        BackoffPolicy {
            idle_delay: self.idle_delay.unwrap_or(defaults.idle_delay),
            error_delay: self.error_delay.unwrap_or(defaults.error_delay),
            max_error_delay: self.max_error_delay.unwrap_or(defaults.max_error_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
        }
    }
}

/// Whether shutdown has been requested.
///
/// A dropped sender counts as a shutdown request.
#[must_use]
pub fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Sleep for `delay` unless shutdown is requested first.
///
/// Returns `true` if the loop should stop.
pub async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if shutdown_requested(shutdown) {
        return true;
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => shutdown_requested(shutdown),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
