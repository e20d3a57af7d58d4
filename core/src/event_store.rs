//! Event store trait and related types.
//!
//! The event store owns the persistent tables behind the pipeline: the queue
//! of events waiting to be handled, the append-only log of settled events and
//! the idempotency records written by handlers. It is pure data access. Policy
//! such as abandon timeouts and settlement lives in the runtime.
//!
//! # Atomicity
//!
//! Every method on [`EventStore`] is one atomic operation. In particular
//! [`EventStore::claim_next`] must never hand the same row to two concurrent
//! callers, and [`EventStore::finalize`] must move a row into the log at most
//! once. Multi-step writes that must land together go through a
//! [`UnitOfWork`].
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `eventline-postgres` crate): Production implementation
//! - `InMemoryEventStore` (in `eventline-testing` crate): Fast, deterministic testing

use crate::event::SerializedEvent;
use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Identifier assigned by the store when an event is published.
///
/// Ids are positive and increase monotonically with publication order. The
/// same id is shared by the queue row, the log entry, handler state rows and
/// idempotency records of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EventId(i64);

impl EventId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw id as stored in the database.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Interpret the id as a log offset for checkpointing.
    #[must_use]
    pub fn as_offset(self) -> u64 {
        u64::try_from(self.0).unwrap_or(0)
    }

    /// Build an id from a checkpoint offset.
    #[must_use]
    pub fn from_offset(offset: u64) -> Self {
        Self(i64::try_from(offset).unwrap_or(i64::MAX))
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The referenced event does not exist.
    #[error("Event not found: {0}")]
    NotFound(EventId),
}

/// Status of a row in the queue table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker whose lease started at `lease_updated_at`.
    Processing,
}

impl QueueStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, EventStoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            _ => Err(EventStoreError::DatabaseError(format!(
                "Invalid queue status: {s}"
            ))),
        }
    }
}

/// An event sitting in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    /// Store-assigned id.
    pub id: EventId,
    /// The payload as published.
    pub event: SerializedEvent,
    /// Current claim status.
    pub status: QueueStatus,
    /// Publication time.
    pub created_at: DateTime<Utc>,
    /// Last time the row was published or claimed.
    pub lease_updated_at: DateTime<Utc>,
}

/// An archived event in the append-only log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Same id as the originating queue row.
    pub id: EventId,
    /// The payload as published.
    pub event: SerializedEvent,
    /// Original publication time.
    pub created_at: DateTime<Utc>,
    /// When the event was moved into the log.
    pub finalized_at: DateTime<Utc>,
}

/// Marker that one side effect of one event has completed.
///
/// Keyed by `(event_id, sub_task)`. Records are written once and never
/// updated; they outlive the queue row and the log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    /// Event the side effect belongs to.
    pub event_id: EventId,
    /// Kind of that event, for inspection.
    pub event_kind: String,
    /// Name of the side effect, e.g. `"archive-document"`.
    pub sub_task: String,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

/// Row counts for operator introspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Rows waiting to be claimed.
    pub pending: u64,
    /// Rows claimed under a live lease.
    pub processing: u64,
    /// Rows claimed under an expired lease.
    pub abandoned: u64,
    /// Entries in the log.
    pub archived: u64,
}

/// A transactional unit of work.
///
/// Everything staged through a unit of work becomes visible together when
/// [`UnitOfWork::commit`] succeeds. Dropping it without committing discards
/// every staged write.
pub trait UnitOfWork: Send {
    /// Stage a new pending event. Its id is assigned immediately.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the insert fails.
    fn publish(
        &mut self,
        event: SerializedEvent,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<QueuedEvent, EventStoreError>> + Send + '_>>;

    /// Stage an idempotency record. A record that already exists is kept as is.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the insert fails.
    fn guard(
        &mut self,
        record: IdempotencyRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>>;

    /// Commit every staged write atomically.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the commit fails; nothing is applied in that case.
    fn commit(self: Box<Self>)
    -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send>>;
}

/// Persistent tables backing the queue and the log.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be shared as `Arc<dyn EventStore>` between the queue, the
/// idempotency guard, handlers and projection runners.
pub trait EventStore: Send + Sync {
    /// Open a unit of work.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if a transaction cannot be started.
    fn begin(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn UnitOfWork>, EventStoreError>> + Send + '_>>;

    /// Atomically claim the lowest-id claimable event.
    ///
    /// A row is claimable when it is pending, or when it is processing and its
    /// lease started strictly before `stale_before`. The claimed row becomes
    /// processing with its lease set to `now`. Concurrent callers never receive
    /// the same row.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the claim query fails.
    fn claim_next(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueuedEvent>, EventStoreError>> + Send + '_>>;

    /// Return a processing row to pending. Returns whether a row changed.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the update fails.
    fn unclaim(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>>;

    /// Move a queue row into the log. Returns whether a row moved.
    ///
    /// Calling it again for the same id is a no-op that returns `false` and
    /// never creates a second log entry.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the move fails; the queue row is untouched then.
    fn finalize(
        &self,
        id: EventId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>>;

    /// Load one queue row.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    fn load_queued(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueuedEvent>, EventStoreError>> + Send + '_>>;

    /// List queue rows with an id greater than `after`, ascending, at most `limit`.
    ///
    /// With a `status`, only rows in that status are listed.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    fn list_queued(
        &self,
        status: Option<QueueStatus>,
        after: EventId,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueuedEvent>, EventStoreError>> + Send + '_>>;

    /// Load one log entry.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    fn load_log_entry(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LogEntry>, EventStoreError>> + Send + '_>>;

    /// Read log entries with an id greater than `after`, ascending, at most `limit`.
    ///
    /// Entries are finalized out of id order, so reads stop below the lowest id
    /// still in the queue. A reader that advances past every returned entry
    /// never misses one that is finalized later.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    fn read_log_after(
        &self,
        after: EventId,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LogEntry>, EventStoreError>> + Send + '_>>;

    /// Whether an idempotency record exists for `(event_id, sub_task)`.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    fn is_guarded(
        &self,
        event_id: EventId,
        sub_task: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>>;

    /// Count queue and log rows. Processing rows leased before `stale_before`
    /// are reported as abandoned.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    fn queue_stats(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<QueueStats, EventStoreError>> + Send + '_>>;
}
