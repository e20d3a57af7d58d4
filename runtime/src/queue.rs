//! The event queue: publish, claim with lease, finalize.
//!
//! [`EventQueue`] applies the abandon-timeout policy on top of an
//! [`EventStore`]. A worker that claims an event holds a lease on it. If the
//! worker dies, the event becomes claimable again once the lease is older than
//! the abandon timeout. Publishing new events never holds back an abandoned
//! one: claims always take the lowest claimable id.
//!
//! # Example
//!
//! ```ignore
//! let queue = EventQueue::new(store, Arc::new(SystemClock), QueueConfig::default());
//!
//! queue.publish_event(&FormEvent::FormSubmitted { .. }, None).await?;
//!
//! if let Some(claimed) = queue.poll().await? {
//!     // ... run handlers ...
//!     queue.finalize(claimed.id).await?;
//! }
//! ```

use crate::metrics::PipelineMetrics;
use chrono::{DateTime, TimeDelta, Utc};
use eventline_core::environment::Clock;
use eventline_core::event::{Event, SerializedEvent};
use eventline_core::event_store::{
    EventId, EventStore, EventStoreError, LogEntry, QueueStats, QueuedEvent, UnitOfWork,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Queue policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long a lease may go without renewal before the event can be reclaimed.
    pub abandoned_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            abandoned_timeout: Duration::from_secs(300),
        }
    }
}

impl QueueConfig {
    /// Set the abandon timeout.
    #[must_use]
    pub const fn with_abandoned_timeout(mut self, timeout: Duration) -> Self {
        self.abandoned_timeout = timeout;
        self
    }

    /// Leases started strictly before the returned instant are abandoned.
    #[must_use]
    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.abandoned_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Durable queue of events awaiting their handlers.
///
/// Cheap to clone; clones share the store and the clock.
#[derive(Clone)]
pub struct EventQueue {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl EventQueue {
    /// Create a queue over a store.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>, config: QueueConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// The injected clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The queue policy.
    #[must_use]
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append a serialized event as pending.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the write does not commit.
    pub async fn publish(&self, event: SerializedEvent) -> Result<QueuedEvent, EventStoreError> {
        let mut uow = self.store.begin().await?;
        let queued = self.publish_in(uow.as_mut(), event).await?;
        uow.commit().await?;

        tracing::debug!(
            event_id = %queued.id,
            event_type = %queued.event.event_type,
            "Event published"
        );
        PipelineMetrics::record_published(&queued.event.event_type);
        Ok(queued)
    }

    /// Serialize and append a typed event.
    ///
    /// # Errors
    ///
    /// Returns `SerializationError` if the event cannot be encoded and
    /// `DatabaseError` if the write does not commit.
    pub async fn publish_event<E: Event + Serialize>(
        &self,
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<QueuedEvent, EventStoreError> {
        let serialized = SerializedEvent::from_event(event, metadata)
            .map_err(|e| EventStoreError::SerializationError(e.to_string()))?;
        self.publish(serialized).await
    }

    /// Stage an event inside a caller's unit of work.
    ///
    /// The event becomes claimable only when the unit of work commits.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the insert fails.
    pub async fn publish_in(
        &self,
        uow: &mut dyn UnitOfWork,
        event: SerializedEvent,
    ) -> Result<QueuedEvent, EventStoreError> {
        uow.publish(event, self.clock.now()).await
    }

    /// Claim the next event.
    ///
    /// Returns the lowest-id event that is pending or whose lease is abandoned,
    /// now marked processing under a fresh lease. Returns `None` when nothing is
    /// claimable.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the claim fails.
    pub async fn poll(&self) -> Result<Option<QueuedEvent>, EventStoreError> {
        let now = self.clock.now();
        let claimed = self
            .store
            .claim_next(now, self.config.stale_before(now))
            .await?;

        if let Some(event) = &claimed {
            tracing::debug!(
                event_id = %event.id,
                event_type = %event.event.event_type,
                "Event claimed"
            );
            PipelineMetrics::record_claimed();
        }
        Ok(claimed)
    }

    /// Release a claim so the next poll can pick the event up again.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the update fails.
    pub async fn unclaim(&self, id: EventId) -> Result<bool, EventStoreError> {
        self.store.unclaim(id).await
    }

    /// Move an event into the log.
    ///
    /// Idempotent: returns `false` without touching the log if the event was
    /// already finalized.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the move fails.
    pub async fn finalize(&self, id: EventId) -> Result<bool, EventStoreError> {
        let moved = self.store.finalize(id, self.clock.now()).await?;
        if moved {
            tracing::debug!(event_id = %id, "Event finalized");
            PipelineMetrics::record_finalized();
        }
        Ok(moved)
    }

    /// Load a queued event.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn get(&self, id: EventId) -> Result<Option<QueuedEvent>, EventStoreError> {
        self.store.load_queued(id).await
    }

    /// Load a log entry.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn log_entry(&self, id: EventId) -> Result<Option<LogEntry>, EventStoreError> {
        self.store.load_log_entry(id).await
    }

    /// Current row counts.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    pub async fn stats(&self) -> Result<QueueStats, EventStoreError> {
        let now = self.clock.now();
        self.store.queue_stats(self.config.stale_before(now)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use eventline_core::event_store::QueueStatus;
    use eventline_testing::{InMemoryEventStore, ManualClock, test_epoch};

    fn queue_with(timeout: Duration) -> (EventQueue, InMemoryEventStore, ManualClock) {
        let store = InMemoryEventStore::new();
        let clock = ManualClock::default();
        let queue = EventQueue::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            QueueConfig::default().with_abandoned_timeout(timeout),
        );
        (queue, store, clock)
    }

    fn event(kind: &str) -> SerializedEvent {
        SerializedEvent::new(kind.to_string(), vec![1, 2, 3], None)
    }

    #[test]
    fn stale_before_subtracts_timeout() {
        let now = test_epoch();
        let config = QueueConfig::default().with_abandoned_timeout(Duration::from_secs(60));
        assert_eq!(config.stale_before(now), now - TimeDelta::seconds(60));
    }

    #[test]
    fn stale_before_saturates() {
        let config = QueueConfig::default().with_abandoned_timeout(Duration::MAX);
        assert_eq!(
            config.stale_before(test_epoch()),
            DateTime::<Utc>::MIN_UTC
        );
    }

    #[tokio::test]
    async fn publish_sets_pending_with_lease_at_now() {
        let (queue, _store, clock) = queue_with(Duration::from_secs(60));

        let queued = queue.publish(event("A.v1")).await.unwrap();

        assert_eq!(queued.status, QueueStatus::Pending);
        assert_eq!(queued.created_at, clock.current());
        assert_eq!(queued.lease_updated_at, clock.current());
    }

    #[tokio::test]
    async fn poll_claims_lowest_id_first() {
        let (queue, _store, _clock) = queue_with(Duration::from_secs(60));
        let first = queue.publish(event("A.v1")).await.unwrap();
        let second = queue.publish(event("B.v1")).await.unwrap();

        assert_eq!(queue.poll().await.unwrap().unwrap().id, first.id);
        assert_eq!(queue.poll().await.unwrap().unwrap().id, second.id);
        assert!(queue.poll().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unclaim_makes_event_claimable_again() {
        let (queue, _store, _clock) = queue_with(Duration::from_secs(60));
        let queued = queue.publish(event("A.v1")).await.unwrap();

        queue.poll().await.unwrap().unwrap();
        assert!(queue.poll().await.unwrap().is_none());

        assert!(queue.unclaim(queued.id).await.unwrap());
        assert_eq!(queue.poll().await.unwrap().unwrap().id, queued.id);
    }

    #[tokio::test]
    async fn stats_report_abandoned_leases() {
        let (queue, _store, clock) = queue_with(Duration::from_secs(60));
        queue.publish(event("A.v1")).await.unwrap();
        queue.publish(event("B.v1")).await.unwrap();
        let third = queue.publish(event("C.v1")).await.unwrap();

        queue.poll().await.unwrap();
        queue.poll().await.unwrap();
        clock.advance(Duration::from_secs(61));
        // reclaims the first event; the second stays abandoned
        queue.poll().await.unwrap();
        queue.finalize(third.id).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(
            stats,
            QueueStats {
                pending: 0,
                processing: 1,
                abandoned: 1,
                archived: 1,
            }
        );
    }
}
