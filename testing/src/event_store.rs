//! In-memory event store for fast, deterministic tests.
//!
//! Implements [`EventStore`] and [`HandlerStateStore`] over a single mutex, so
//! claims are atomic exactly like the row-locking claim of the Postgres store.
//! Ids are assigned when an event is staged, including for units of work that
//! are later dropped, which leaves gaps the same way a database sequence does.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use eventline_core::event::SerializedEvent;
use eventline_core::event_store::{
    EventId, EventStore, EventStoreError, IdempotencyRecord, LogEntry, QueueStats, QueueStatus,
    QueuedEvent, UnitOfWork,
};
use eventline_core::handler::{HandlerId, HandlerOutcome, HandlerState, HandlerStateStore};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct StoreState {
    next_id: i64,
    queued: BTreeMap<EventId, QueuedEvent>,
    log: BTreeMap<EventId, LogEntry>,
    handler_states: BTreeMap<(EventId, HandlerId), HandlerState>,
    idempotency: BTreeMap<(EventId, String), IdempotencyRecord>,
}

impl StoreState {
    fn allocate_id(&mut self) -> EventId {
        self.next_id += 1;
        EventId::new(self.next_id)
    }
}

/// In-memory implementation of the pipeline tables.
///
/// Clones share the same tables.
///
/// # Example
///
/// ```
/// use eventline_testing::InMemoryEventStore;
/// use eventline_core::event::SerializedEvent;
/// use eventline_core::event_store::EventStore;
/// use eventline_testing::test_epoch;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEventStore::new();
/// let mut uow = store.begin().await?;
/// uow.publish(SerializedEvent::new("Ping.v1".into(), vec![], None), test_epoch()).await?;
/// uow.commit().await?;
///
/// assert_eq!(store.queued_events().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    state: Arc<Mutex<StoreState>>,
    unavailable: Arc<AtomicBool>,
    state_loads: Arc<AtomicUsize>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `DatabaseError` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of the queue, ascending by id.
    #[must_use]
    pub fn queued_events(&self) -> Vec<QueuedEvent> {
        self.state.lock().unwrap().queued.values().cloned().collect()
    }

    /// Snapshot of the log, ascending by id.
    #[must_use]
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.state.lock().unwrap().log.values().cloned().collect()
    }

    /// Snapshot of every idempotency record.
    #[must_use]
    pub fn idempotency_records(&self) -> Vec<IdempotencyRecord> {
        self.state
            .lock()
            .unwrap()
            .idempotency
            .values()
            .cloned()
            .collect()
    }

    /// How many times handler states were loaded.
    #[must_use]
    pub fn state_loads(&self) -> usize {
        self.state_loads.load(Ordering::SeqCst)
    }

    /// Number of stored handler states across all events.
    #[must_use]
    pub fn handler_state_count(&self) -> usize {
        self.state.lock().unwrap().handler_states.len()
    }

    /// Append straight to the log, bypassing the queue.
    ///
    /// Useful for projection tests that only care about the log.
    pub fn append_log(&self, event: SerializedEvent, at: DateTime<Utc>) -> EventId {
        let mut state = self.state.lock().unwrap();
        let id = state.allocate_id();
        state.log.insert(
            id,
            LogEntry {
                id,
                event,
                created_at: at,
                finalized_at: at,
            },
        );
        id
    }

    /// Insert an outcome row for an event, as a crashed cleanup pass would
    /// leave behind.
    pub fn insert_handler_state(&self, event_id: EventId, handler_id: &str, state: HandlerState) {
        self.state
            .lock()
            .unwrap()
            .handler_states
            .insert((event_id, HandlerId::new(handler_id)), state);
    }

    fn with_state<T>(
        &self,
        f: impl FnOnce(&mut StoreState) -> T,
    ) -> Result<T, EventStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EventStoreError::DatabaseError(
                "in-memory store unavailable".to_string(),
            ));
        }
        let mut state = self.state.lock().unwrap();
        Ok(f(&mut state))
    }
}

/// Unit of work over [`InMemoryEventStore`]. Writes are buffered until commit.
pub struct InMemoryUnitOfWork {
    store: InMemoryEventStore,
    events: Vec<QueuedEvent>,
    guards: Vec<IdempotencyRecord>,
}

impl UnitOfWork for InMemoryUnitOfWork {
    fn publish(
        &mut self,
        event: SerializedEvent,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<QueuedEvent, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let id = self.store.with_state(StoreState::allocate_id)?;
            let queued = QueuedEvent {
                id,
                event,
                status: QueueStatus::Pending,
                created_at: now,
                lease_updated_at: now,
            };
            self.events.push(queued.clone());
            Ok(queued)
        })
    }

    fn guard(
        &mut self,
        record: IdempotencyRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.guards.push(record);
            Ok(())
        })
    }

    fn commit(
        self: Box<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send>> {
        Box::pin(async move {
            let Self {
                store,
                events,
                guards,
            } = *self;
            store.with_state(|state| {
                for event in events {
                    state.queued.insert(event.id, event);
                }
                for record in guards {
                    state
                        .idempotency
                        .entry((record.event_id, record.sub_task.clone()))
                        .or_insert(record);
                }
            })
        })
    }
}

impl EventStore for InMemoryEventStore {
    fn begin(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn UnitOfWork>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            self.with_state(|_| ())?;
            let uow: Box<dyn UnitOfWork> = Box::new(InMemoryUnitOfWork {
                store: self.clone(),
                events: Vec::new(),
                guards: Vec::new(),
            });
            Ok(uow)
        })
    }

    fn claim_next(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueuedEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            self.with_state(|state| {
                let claimable = state.queued.values_mut().find(|e| match e.status {
                    QueueStatus::Pending => true,
                    QueueStatus::Processing => e.lease_updated_at < stale_before,
                })?;
                claimable.status = QueueStatus::Processing;
                claimable.lease_updated_at = now;
                Some(claimable.clone())
            })
        })
    }

    fn unclaim(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.with_state(|state| match state.queued.get_mut(&id) {
                Some(event) if event.status == QueueStatus::Processing => {
                    event.status = QueueStatus::Pending;
                    true
                }
                _ => false,
            })
        })
    }

    fn finalize(
        &self,
        id: EventId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.with_state(|state| {
                let Some(queued) = state.queued.remove(&id) else {
                    return false;
                };
                if state.log.contains_key(&id) {
                    return false;
                }
                state.log.insert(
                    id,
                    LogEntry {
                        id,
                        event: queued.event,
                        created_at: queued.created_at,
                        finalized_at: now,
                    },
                );
                true
            })
        })
    }

    fn load_queued(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueuedEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move { self.with_state(|state| state.queued.get(&id).cloned()) })
    }

    fn list_queued(
        &self,
        status: Option<QueueStatus>,
        after: EventId,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueuedEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            self.with_state(|state| {
                state
                    .queued
                    .range(EventId::new(after.value().saturating_add(1))..)
                    .filter(|(_, event)| status.is_none_or(|s| event.status == s))
                    .take(limit)
                    .map(|(_, event)| event.clone())
                    .collect()
            })
        })
    }

    fn load_log_entry(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LogEntry>, EventStoreError>> + Send + '_>> {
        Box::pin(async move { self.with_state(|state| state.log.get(&id).cloned()) })
    }

    fn read_log_after(
        &self,
        after: EventId,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LogEntry>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.with_state(|state| {
                let oldest_queued = state.queued.keys().next().copied();
                state
                    .log
                    .range(EventId::new(after.value().saturating_add(1))..)
                    .take_while(|(id, _)| oldest_queued.is_none_or(|oldest| **id < oldest))
                    .take(limit)
                    .map(|(_, entry)| entry.clone())
                    .collect()
            })
        })
    }

    fn is_guarded(
        &self,
        event_id: EventId,
        sub_task: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>> {
        let key = (event_id, sub_task.to_string());
        Box::pin(async move { self.with_state(|state| state.idempotency.contains_key(&key)) })
    }

    fn queue_stats(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<QueueStats, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.with_state(|state| {
                let mut stats = QueueStats {
                    archived: state.log.len() as u64,
                    ..QueueStats::default()
                };
                for event in state.queued.values() {
                    match event.status {
                        QueueStatus::Pending => stats.pending += 1,
                        QueueStatus::Processing if event.lease_updated_at < stale_before => {
                            stats.abandoned += 1;
                        }
                        QueueStatus::Processing => stats.processing += 1,
                    }
                }
                stats
            })
        })
    }
}

impl HandlerStateStore for InMemoryEventStore {
    fn load_states(
        &self,
        event_id: EventId,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<BTreeMap<HandlerId, HandlerState>, EventStoreError>>
                + Send
                + '_,
        >,
    > {
        self.state_loads.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            self.with_state(|state| {
                state
                    .handler_states
                    .iter()
                    .filter(|((id, _), _)| *id == event_id)
                    .map(|((_, handler_id), s)| (handler_id.clone(), s.clone()))
                    .collect()
            })
        })
    }

    fn record_outcome(
        &self,
        event_id: EventId,
        handler_id: &HandlerId,
        outcome: &HandlerOutcome,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerState, EventStoreError>> + Send + '_>> {
        let key = (event_id, handler_id.clone());
        let outcome = outcome.clone();
        Box::pin(async move {
            self.with_state(|state| {
                let entry = state.handler_states.entry(key).or_insert(HandlerState {
                    outcome: outcome.clone(),
                    attempts: 0,
                    updated_at: now,
                });
                if entry.attempts > 0 && entry.outcome.is_terminal() {
                    return entry.clone();
                }
                entry.outcome = outcome;
                entry.attempts += 1;
                entry.updated_at = now;
                entry.clone()
            })
        })
    }

    fn delete_states(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.with_state(|state| {
                let before = state.handler_states.len();
                state.handler_states.retain(|(id, _), _| *id != event_id);
                (before - state.handler_states.len()) as u64
            })
        })
    }

    fn delete_orphaned_states(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            self.with_state(|state| {
                let before = state.handler_states.len();
                let queued = &state.queued;
                state
                    .handler_states
                    .retain(|(id, _), _| queued.contains_key(id));
                (before - state.handler_states.len()) as u64
            })
        })
    }
}
