//! # Eventline Testing
//!
//! Testing utilities for the Eventline pipeline.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - [`InMemoryEventStore`]: queue, log, outcomes and guards behind a mutex
//! - [`InMemoryProjectionCheckpoint`] and [`RecordingProjection`]
//! - [`ScriptedHandler`]: a handler that plays back a list of outcomes
//! - proptest strategies for pipeline types
//!
//! ## Example
//!
//! ```ignore
//! use eventline_testing::{InMemoryEventStore, ManualClock, ScriptedHandler};
//!
//! #[tokio::test]
//! async fn retries_until_success() {
//!     let store = InMemoryEventStore::new();
//!     let clock = ManualClock::default();
//!     let handler = ScriptedHandler::new("mailer")
//!         .then(HandlerOutcome::TransientError("smtp down".into()))
//!         .otherwise(HandlerOutcome::Success);
//!     // ... build queue and manager, publish, process ...
//! }
//! ```

use chrono::{DateTime, TimeDelta, Utc};
use eventline_core::environment::Clock;

pub mod event_store;
pub mod handlers;
pub mod projection_mocks;

/// Mock implementations of the `Clock` trait.
pub mod mocks {
    use super::{Clock, DateTime, TimeDelta, Utc};
    use std::sync::{Arc, RwLock};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use eventline_testing::mocks::FixedClock;
    /// use eventline_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the queue.
    ///
    /// ```
    /// use eventline_testing::{ManualClock, test_epoch};
    /// use eventline_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::default();
    /// clock.advance(Duration::from_secs(90));
    /// assert_eq!((clock.now() - test_epoch()).num_seconds(), 90);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    #[allow(clippy::unwrap_used, clippy::missing_panics_doc)]
    impl ManualClock {
        /// Create a clock at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// The current time.
        #[must_use]
        pub fn current(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }

        /// Move the clock forward.
        pub fn advance(&self, by: Duration) {
            let by = TimeDelta::from_std(by).unwrap();
            let mut time = self.time.write().unwrap();
            *time += by;
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.write().unwrap() = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_epoch())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            self.current()
        }
    }

    /// The instant test clocks start at (2025-01-01 00:00:00 UTC).
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .expect("hardcoded timestamp should always parse")
            .with_timezone(&Utc)
    }

    /// Create a default fixed clock for tests at [`test_epoch`].
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use eventline_core::handler::{HandlerId, HandlerOutcome};
    use proptest::prelude::*;

    /// Any handler outcome with a short reason.
    pub fn handler_outcome() -> impl Strategy<Value = HandlerOutcome> {
        prop_oneof![
            Just(HandlerOutcome::Success),
            "[a-z ]{0,16}".prop_map(HandlerOutcome::TransientError),
            "[a-z ]{0,16}".prop_map(HandlerOutcome::FatalError),
            "[a-z ]{0,16}".prop_map(HandlerOutcome::UnrecoverableError),
        ]
    }

    /// A handler id of the form `handler-N`.
    pub fn handler_id() -> impl Strategy<Value = HandlerId> {
        (0u8..8).prop_map(|n| HandlerId::new(format!("handler-{n}")))
    }
}

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

// Re-export commonly used items
pub use event_store::InMemoryEventStore;
pub use handlers::{ScriptedHandler, Step};
pub use mocks::{FixedClock, ManualClock, test_clock, test_epoch};
pub use projection_mocks::{InMemoryProjectionCheckpoint, RecordingProjection};
