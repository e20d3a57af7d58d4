//! Event handlers and the context they run in.
//!
//! A handler reacts to one kind of event. It returns a [`HandlerOutcome`]
//! describing how the attempt ended, or a [`HandlerError`] when it could not
//! classify the failure itself. Handlers must tolerate running more than once
//! for the same event; [`HandlerContext`] gives them the idempotency guard and
//! a way to publish follow-up events atomically with their guard records.

use crate::idempotency::IdempotencyGuard;
use crate::queue::EventQueue;
use eventline_core::event::SerializedEvent;
use eventline_core::event_store::{EventId, EventStoreError, QueuedEvent, UnitOfWork};
use eventline_core::handler::{HandlerError, HandlerOutcome};
use std::future::Future;
use std::pin::Pin;

/// Reacts to events of the kinds it is registered for.
///
/// # Dyn Compatibility
///
/// `handle` returns an explicit `Pin<Box<dyn Future>>` so heterogeneous
/// handlers can live side by side in one registry as `Arc<dyn EventHandler<E>>`.
///
/// # Example
///
/// ```ignore
/// struct NotifyApplicant;
///
/// impl EventHandler<FormEvent> for NotifyApplicant {
///     fn id(&self) -> &str {
///         "notify-applicant"
///     }
///
///     fn handle<'a>(
///         &'a self,
///         ctx: &'a HandlerContext,
///         event: &'a FormEvent,
///     ) -> Pin<Box<dyn Future<Output = Result<HandlerOutcome, HandlerError>> + Send + 'a>> {
///         Box::pin(async move {
///             if ctx.is_guarded("send-email").await? {
///                 return Ok(HandlerOutcome::Success);
///             }
///             // ... send ...
///             ctx.guard("send-email").await?;
///             Ok(HandlerOutcome::Success)
///         })
///     }
/// }
/// ```
pub trait EventHandler<E>: Send + Sync {
    /// Identifier, unique among the handlers of one event kind.
    ///
    /// Outcomes are stored under this id; changing it makes the handler run
    /// again for events already in flight.
    fn id(&self) -> &str;

    /// Handle one delivery of an event.
    ///
    /// # Errors
    ///
    /// `HandlerError::Failed` is recorded as a transient error.
    /// `HandlerError::Cancelled` stops the processing loop without recording
    /// anything.
    fn handle<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        event: &'a E,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerOutcome, HandlerError>> + Send + 'a>>;
}

/// Per-invocation context handed to a handler.
#[derive(Clone)]
pub struct HandlerContext {
    event_id: EventId,
    event_kind: String,
    attempt: u32,
    queue: EventQueue,
    guard: IdempotencyGuard,
}

impl HandlerContext {
    /// Create a context for one invocation.
    #[must_use]
    pub fn new(
        event_id: EventId,
        event_kind: impl Into<String>,
        attempt: u32,
        queue: EventQueue,
        guard: IdempotencyGuard,
    ) -> Self {
        Self {
            event_id,
            event_kind: event_kind.into(),
            attempt,
            queue,
            guard,
        }
    }

    /// Id of the event being handled.
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Kind of the event being handled.
    #[must_use]
    pub fn event_kind(&self) -> &str {
        &self.event_kind
    }

    /// 1-based attempt number of this handler for this event.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The queue, for publishing follow-up events.
    #[must_use]
    pub const fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// The idempotency guard.
    #[must_use]
    pub const fn guard_handle(&self) -> &IdempotencyGuard {
        &self.guard
    }

    /// Whether `sub_task` of the current event already completed.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the lookup fails.
    pub async fn is_guarded(&self, sub_task: &str) -> Result<bool, EventStoreError> {
        self.guard.is_guarded(self.event_id, sub_task).await
    }

    /// Record that `sub_task` of the current event completed.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the record does not commit.
    pub async fn guard(&self, sub_task: &str) -> Result<(), EventStoreError> {
        self.guard
            .guard(self.event_id, &self.event_kind, sub_task)
            .await
    }

    /// Publish a follow-up event and guard `sub_task` in one transaction.
    ///
    /// Either both writes become visible or neither does.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the transaction does not commit.
    pub async fn publish_guarded(
        &self,
        event: SerializedEvent,
        sub_task: &str,
    ) -> Result<QueuedEvent, EventStoreError> {
        let mut uow = self.queue.store().begin().await?;
        let queued = self.stage(uow.as_mut(), event, sub_task).await?;
        uow.commit().await?;
        Ok(queued)
    }

    async fn stage(
        &self,
        uow: &mut dyn UnitOfWork,
        event: SerializedEvent,
        sub_task: &str,
    ) -> Result<QueuedEvent, EventStoreError> {
        let queued = self.queue.publish_in(uow, event).await?;
        self.guard
            .guard_in(uow, self.event_id, &self.event_kind, sub_task)
            .await?;
        Ok(queued)
    }
}
