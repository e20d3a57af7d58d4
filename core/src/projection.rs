//! Projection system for building read models from the event log.
//!
//! # Overview
//!
//! Once an event settles it is moved into the append-only log. Projection
//! builders replay that log in id order to maintain eventually-consistent
//! read models. Each builder tracks its own checkpoint, so builders never
//! block each other and a restarted builder resumes where it stopped.
//!
//! ## Key Concepts
//!
//! - **Projection builder**: Maps one log entry to mutations of its own state
//! - **Checkpoint**: Id of the last log entry the builder fully applied
//! - **Replay**: Resetting the checkpoint to rebuild a read model from scratch
//!
//! ```text
//! event log:   1 ─ 2 ─ 3 ─ 4 ─ 5 ─ 6
//!                          ▲
//!                  checkpoint("form_stats") = 3
//!                  next poll applies 4
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use eventline_core::projection::*;
//!
//! struct SubmissionCount {
//!     count: AtomicU64,
//! }
//!
//! impl ProjectionBuilder for SubmissionCount {
//!     type Event = FormEvent;
//!
//!     fn name(&self) -> &str {
//!         "submission_count"
//!     }
//!
//!     async fn handle(&self, event: &FormEvent, _at: DateTime<Utc>) -> Result<()> {
//!         if let FormEvent::FormSubmitted { .. } = event {
//!             self.count.fetch_add(1, Ordering::SeqCst);
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use crate::event::Event;
use crate::event_store::EventId;
use crate::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Error type for projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Event processing error
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    /// A builder failed to apply a log entry. The checkpoint was not advanced.
    #[error("Projection '{builder}' failed at log entry {entry_id}: {source}")]
    Apply {
        /// Name of the builder.
        builder: String,
        /// Id of the entry that failed.
        entry_id: EventId,
        /// Underlying failure.
        #[source]
        source: Box<ProjectionError>,
    },

    /// Generic error
    #[error("Projection error: {0}")]
    Other(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// A projection builder maintains a read model from the event log.
///
/// # Philosophy
///
/// - **Eventually Consistent**: Builders lag behind the log by at least one poll
/// - **Rebuildable**: Resetting the checkpoint replays every entry again
/// - **Independent**: Each builder owns its checkpoint and its state
///
/// # Idempotency
///
/// An entry can be applied twice if the process stops between the apply and
/// the checkpoint write. Implementations should tolerate that where possible.
pub trait ProjectionBuilder: Send + Sync {
    /// The event type this builder consumes.
    type Event: Event + DeserializeOwned;

    /// Builder name, used as the checkpoint key.
    ///
    /// Should be unique across all builders in the system.
    fn name(&self) -> &str;

    /// Apply one log entry.
    ///
    /// `event_timestamp` is the original publication time of the event.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the read model cannot be updated. The
    /// same entry is offered again on the next poll.
    fn handle(
        &self,
        event: &Self::Event,
        event_timestamp: DateTime<Utc>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Drop the read model before a replay.
    ///
    /// Default implementation is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if rebuild fails.
    fn rebuild(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Checkpoint tracking for projection builders.
///
/// # Semantics
///
/// - `load_position` creates the checkpoint at offset 0 the first time a
///   builder asks for it
/// - `save_position` only ever moves forward; saving an offset at or below the
///   stored one leaves it unchanged
/// - `reset_position` is the one way back to 0, used for replays
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `impl Future`
/// to enable trait object usage (`Arc<dyn ProjectionCheckpoint>`).
pub trait ProjectionCheckpoint: Send + Sync {
    /// Advance the stored position.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if save fails.
    fn save_position(
        &self,
        builder_name: &str,
        position: EventPosition,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Load the stored position, creating it at 0 if absent.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if load fails.
    fn load_position(
        &self,
        builder_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<EventPosition>> + Send + '_>>;

    /// Move the stored position back to 0.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if the reset fails.
    fn reset_position(
        &self,
        builder_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Position in the event log (for checkpoint resumption).
///
/// # Example
///
/// ```
/// use eventline_core::projection::EventPosition;
/// use chrono::Utc;
///
/// let position = EventPosition::new(1000, Utc::now());
/// assert_eq!(position.offset, 1000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPosition {
    /// Id of the last log entry fully applied.
    pub offset: u64,

    /// Timestamp when this position was reached
    pub timestamp: DateTime<Utc>,
}

impl EventPosition {
    /// Create a new event position.
    #[must_use]
    pub const fn new(offset: u64, timestamp: DateTime<Utc>) -> Self {
        Self { offset, timestamp }
    }

    /// Create a position at the beginning of the log.
    ///
    /// Nothing has been applied yet, so the timestamp is the earliest
    /// representable instant.
    ///
    /// # Example
    ///
    /// ```
    /// use eventline_core::projection::EventPosition;
    ///
    /// let start = EventPosition::beginning();
    /// assert_eq!(start.offset, 0);
    /// ```
    #[must_use]
    pub const fn beginning() -> Self {
        Self {
            offset: 0,
            timestamp: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// The last applied entry as an event id.
    #[must_use]
    pub fn last_applied(&self) -> EventId {
        EventId::from_offset(self.offset)
    }
}
