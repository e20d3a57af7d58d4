//! Fine-grained guard against repeating side effects.
//!
//! Handlers run at least once, so a handler that calls an external system may
//! run again after a crash or a transient failure elsewhere. The guard lets it
//! record that a named side effect of an event has completed, and check that
//! record before doing the work again.
//!
//! ```ignore
//! if guard.is_guarded(event_id, "archive-document").await? {
//!     return Ok(HandlerOutcome::Success);
//! }
//! archive_client.store(&form).await?;
//! guard.guard(event_id, "FormSubmitted.v1", "archive-document").await?;
//! ```

use eventline_core::environment::Clock;
use eventline_core::event_store::{
    EventId, EventStore, EventStoreError, IdempotencyRecord, UnitOfWork,
};
use std::sync::Arc;

/// Records and checks completed side effects.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
}

impl IdempotencyGuard {
    /// Create a guard over a store.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Whether `sub_task` of `event_id` already completed.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the lookup fails.
    pub async fn is_guarded(
        &self,
        event_id: EventId,
        sub_task: &str,
    ) -> Result<bool, EventStoreError> {
        self.store.is_guarded(event_id, sub_task).await
    }

    /// Record that `sub_task` of `event_id` completed.
    ///
    /// Guarding a pair that is already guarded is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the record does not commit.
    pub async fn guard(
        &self,
        event_id: EventId,
        event_kind: &str,
        sub_task: &str,
    ) -> Result<(), EventStoreError> {
        let mut uow = self.store.begin().await?;
        self.guard_in(uow.as_mut(), event_id, event_kind, sub_task)
            .await?;
        uow.commit().await?;

        tracing::debug!(event_id = %event_id, sub_task, "Side effect guarded");
        Ok(())
    }

    /// Stage the record inside a caller's unit of work.
    ///
    /// Use this when the record must commit together with other writes, such
    /// as a follow-up event published by the same handler.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the insert fails.
    pub async fn guard_in(
        &self,
        uow: &mut dyn UnitOfWork,
        event_id: EventId,
        event_kind: &str,
        sub_task: &str,
    ) -> Result<(), EventStoreError> {
        uow.guard(IdempotencyRecord {
            event_id,
            event_kind: event_kind.to_string(),
            sub_task: sub_task.to_string(),
            completed_at: self.clock.now(),
        })
        .await
    }
}
