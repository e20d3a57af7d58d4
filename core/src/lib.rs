//! # Eventline Core
//!
//! Core traits and types for the Eventline durable event pipeline.
//!
//! This crate holds the vocabulary shared by every other crate in the workspace.
//! It performs no I/O on its own: storage backends implement the traits defined
//! here, and the runtime drives them.
//!
//! ## Core Concepts
//!
//! - **Event**: A closed sum type of domain facts, tagged by a stable kind string
//! - **Queue**: Published events waiting to be claimed by a worker
//! - **Log**: Append-only archive of events whose handlers have settled
//! - **Handler outcome**: The recorded result of one handler for one event
//! - **Idempotency record**: Marker that a specific side effect already happened
//! - **Projection builder**: Read model fed from the log in id order
//!
//! ## Lifecycle
//!
//! ```text
//! publish ──► queued (pending) ──claim──► queued (processing)
//!                  ▲                            │
//!                  └──── lease expired ◄────────┤
//!                                               │ handlers settle
//!                                               ▼
//!                                          event log ──► projections
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod event;
pub mod event_store;
pub mod handler;
pub mod projection;

/// Environment module - injected dependencies.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Every lease, abandon check and log timestamp in the pipeline goes
    /// through a `Clock`, so tests can drive time explicitly.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventline_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let first = clock.now();
    /// assert!(clock.now() >= first);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
