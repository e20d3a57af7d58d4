//! `EventManager`: dispatches claimed events to their handlers.
//!
//! # Overview
//!
//! The manager owns the retry policy of the pipeline:
//!
//! - It claims one event at a time from the [`EventQueue`]
//! - It runs every handler registered for the event's kind, in order,
//!   skipping handlers whose recorded outcome is already terminal
//! - It records each fresh outcome in the [`HandlerStateStore`]
//! - A fatal error stops every remaining handler, now and on later claims
//! - A cleanup pass moves settled events into the log and drops their
//!   outcome rows
//!
//! ```text
//!            ┌──────────────┐  poll   ┌──────────────┐
//!            │  EventQueue  │────────►│ EventManager │── handlers ──► outcomes
//!            └──────────────┘         └──────┬───────┘
//!                   ▲  finalize              │ cleanup
//!                   └────────────────────────┘
//! ```
//!
//! # Delivery
//!
//! A transient failure leaves the event claimed. It is retried once its lease
//! is abandoned and another poll reclaims it, or right away when
//! [`EventManagerConfig::release_on_transient`] is set.

use crate::backoff::{BackoffPolicy, pause, shutdown_requested};
use crate::handler::HandlerContext;
use crate::idempotency::IdempotencyGuard;
use crate::metrics::PipelineMetrics;
use crate::queue::EventQueue;
use crate::registry::{HandlerRegistry, RegisteredHandler};
use eventline_core::event::Event;
use eventline_core::event_store::{EventId, EventStoreError, QueueStatus, QueuedEvent};
use eventline_core::handler::{
    HandlerError, HandlerId, HandlerOutcome, HandlerState, HandlerStateStore, is_settled,
};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Errors surfaced by the manager.
#[derive(Error, Debug)]
pub enum ManagerError {
    /// The store failed; the loop backs off and retries.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// A handler reported cancellation. Nothing was recorded for it.
    #[error("Handler '{handler_id}' cancelled while handling event {event_id}")]
    Cancelled {
        /// Event being handled.
        event_id: EventId,
        /// Handler that was cancelled.
        handler_id: HandlerId,
    },
}

/// Manager policy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventManagerConfig {
    /// Idle and error delays of the processing loop.
    pub backoff: BackoffPolicy,
    /// Sleep between cleanup passes.
    pub cleanup_interval: Duration,
    /// Queue rows scanned per cleanup page.
    pub cleanup_batch_size: usize,
    /// Attempts after which a transient failure is recorded as unrecoverable.
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Release the claim after a transient failure instead of waiting for the
    /// lease to be abandoned.
    pub release_on_transient: bool,
}

impl Default for EventManagerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            cleanup_interval: Duration::from_secs(5),
            cleanup_batch_size: 100,
            max_attempts: None,
            release_on_transient: false,
        }
    }
}

impl EventManagerConfig {
    /// Set the loop delays.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the cleanup interval.
    #[must_use]
    pub const fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the cleanup page size.
    #[must_use]
    pub const fn with_cleanup_batch_size(mut self, size: usize) -> Self {
        self.cleanup_batch_size = size;
        self
    }

    /// Cap the number of attempts per handler.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Release claims after transient failures.
    #[must_use]
    pub const fn with_release_on_transient(mut self, release: bool) -> Self {
        self.release_on_transient = release;
        self
    }
}

/// What one processing step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    /// The claimed event.
    pub event_id: EventId,
    /// Handlers invoked during this step with their fresh outcomes.
    pub invoked: Vec<(HandlerId, HandlerOutcome)>,
    /// Whether the event is settled after this step.
    pub settled: bool,
}

/// What one cleanup pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Settled events moved into the log.
    pub finalized: u64,
    /// Outcome rows deleted along with them.
    pub states_deleted: u64,
    /// Outcome rows deleted because their event was already gone.
    pub orphans_deleted: u64,
}

/// Dispatches queued events to registered handlers.
///
/// All methods take `&self`; share one manager between several processing
/// loops through an `Arc`.
pub struct EventManager<E> {
    queue: EventQueue,
    states: Arc<dyn HandlerStateStore>,
    registry: Arc<HandlerRegistry<E>>,
    guard: IdempotencyGuard,
    config: EventManagerConfig,
}

impl<E> EventManager<E>
where
    E: Event + DeserializeOwned,
{
    /// Create a manager.
    #[must_use]
    pub fn new(
        queue: EventQueue,
        states: Arc<dyn HandlerStateStore>,
        registry: HandlerRegistry<E>,
        config: EventManagerConfig,
    ) -> Self {
        let guard = IdempotencyGuard::new(Arc::clone(queue.store()), Arc::clone(queue.clock()));
        Self {
            queue,
            states,
            registry: Arc::new(registry),
            guard,
            config,
        }
    }

    /// The queue this manager polls.
    #[must_use]
    pub const fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// The handler registry.
    #[must_use]
    pub fn registry(&self) -> &HandlerRegistry<E> {
        &self.registry
    }

    /// The manager policy.
    #[must_use]
    pub const fn config(&self) -> &EventManagerConfig {
        &self.config
    }

    /// Claim and process one event.
    ///
    /// Returns `None` when nothing was claimable.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Store` if the store fails and
    /// `ManagerError::Cancelled` if a handler reports cancellation.
    pub async fn process_next(&self) -> Result<Option<ProcessReport>, ManagerError> {
        let Some(queued) = self.queue.poll().await? else {
            return Ok(None);
        };
        self.process_event(&queued).await.map(Some)
    }

    /// Run the handlers of an already claimed event.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Store` if the store fails and
    /// `ManagerError::Cancelled` if a handler reports cancellation.
    #[allow(clippy::cognitive_complexity)]
    pub async fn process_event(&self, queued: &QueuedEvent) -> Result<ProcessReport, ManagerError> {
        let event_kind = queued.event.event_type.as_str();
        let handlers = self.registry.handlers_for(event_kind);
        let mut states = self.states.load_states(queued.id).await?;
        let mut invoked = Vec::new();

        if !Self::halted(&states) {
            match queued.event.decode::<E>() {
                Ok(event) => {
                    for registered in handlers {
                        if Self::is_done(&states, registered.id()) {
                            continue;
                        }
                        let attempt = states.get(registered.id()).map_or(0, |s| s.attempts) + 1;
                        let outcome = self
                            .invoke(queued, registered, &event, attempt)
                            .await?;
                        let halts = outcome.halts_event();
                        let state = self.record(queued.id, registered.id(), &outcome).await?;
                        invoked.push((registered.id().clone(), outcome));
                        states.insert(registered.id().clone(), state);
                        if halts {
                            tracing::warn!(
                                event_id = %queued.id,
                                handler_id = %registered.id(),
                                "Fatal handler error, remaining handlers skipped"
                            );
                            break;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %queued.id,
                        event_type = event_kind,
                        error = %e,
                        "Undecodable event payload"
                    );
                    let outcome = HandlerOutcome::UnrecoverableError(format!(
                        "undecodable payload: {e}"
                    ));
                    for registered in handlers {
                        if Self::is_done(&states, registered.id()) {
                            continue;
                        }
                        let state = self.record(queued.id, registered.id(), &outcome).await?;
                        invoked.push((registered.id().clone(), outcome.clone()));
                        states.insert(registered.id().clone(), state);
                    }
                }
            }
        }

        let settled = is_settled(
            handlers.iter().map(RegisteredHandler::id),
            &Self::outcomes(&states),
        );

        if !settled && self.config.release_on_transient {
            self.queue.unclaim(queued.id).await?;
        }

        tracing::debug!(
            event_id = %queued.id,
            event_type = event_kind,
            invoked = invoked.len(),
            settled,
            "Event processed"
        );

        Ok(ProcessReport {
            event_id: queued.id,
            invoked,
            settled,
        })
    }

    /// Run the processing loop until shutdown.
    ///
    /// Store failures are logged and followed by the error backoff; the loop
    /// keeps running. Shutdown is observed between events and while sleeping,
    /// never in the middle of a handler.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Cancelled` if a handler reports cancellation.
    pub async fn run_process_loop(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ManagerError> {
        tracing::info!(handlers = self.registry.len(), "Starting event processing loop");
        let mut consecutive_failures = 0u32;

        loop {
            if shutdown_requested(&shutdown) {
                break;
            }

            let delay = match self.process_next().await {
                Ok(Some(_)) => {
                    consecutive_failures = 0;
                    continue;
                }
                Ok(None) => {
                    consecutive_failures = 0;
                    self.config.backoff.idle_delay
                }
                Err(e @ ManagerError::Cancelled { .. }) => {
                    tracing::info!(error = %e, "Event processing loop cancelled");
                    return Err(e);
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    tracing::error!(
                        error = %e,
                        consecutive_failures,
                        "Event processing failed"
                    );
                    PipelineMetrics::record_loop_error("process");
                    self.config.backoff.error_delay_for(consecutive_failures)
                }
            };

            if pause(delay, &mut shutdown).await {
                break;
            }
        }

        tracing::info!("Event processing loop stopped");
        Ok(())
    }

    /// Move settled events into the log and drop their outcome rows.
    ///
    /// Also removes outcome rows whose event is no longer queued, which can
    /// happen when a previous pass stopped between the two steps.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Store` if the store fails.
    pub async fn cleanup_finalized_events(&self) -> Result<CleanupReport, ManagerError> {
        let mut report = CleanupReport::default();
        let mut after = EventId::default();
        let batch_size = self.config.cleanup_batch_size.max(1);

        loop {
            // A settled event keeps its claim, so pending rows never need a state load.
            let page = self
                .queue
                .store()
                .list_queued(Some(QueueStatus::Processing), after, batch_size)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.id;

            for queued in &page {
                let handlers = self.registry.handler_ids(&queued.event.event_type);
                let states = self.states.load_states(queued.id).await?;
                if !is_settled(&handlers, &Self::outcomes(&states)) {
                    continue;
                }

                if self.queue.finalize(queued.id).await? {
                    report.finalized += 1;
                }
                report.states_deleted += self.states.delete_states(queued.id).await?;
                tracing::debug!(event_id = %queued.id, "Settled event cleaned up");
            }

            if page.len() < batch_size {
                break;
            }
        }

        report.orphans_deleted = self.states.delete_orphaned_states().await?;

        if report != CleanupReport::default() {
            tracing::info!(
                finalized = report.finalized,
                states_deleted = report.states_deleted,
                orphans_deleted = report.orphans_deleted,
                "Cleanup pass complete"
            );
        }
        Ok(report)
    }

    /// Run cleanup passes until shutdown.
    pub async fn run_cleanup_loop(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = u64::try_from(self.config.cleanup_interval.as_millis()).unwrap_or(u64::MAX),
            "Starting cleanup loop"
        );
        let mut consecutive_failures = 0u32;

        loop {
            if shutdown_requested(&shutdown) {
                break;
            }

            let delay = match self.cleanup_finalized_events().await {
                Ok(_) => {
                    consecutive_failures = 0;
                    self.config.cleanup_interval
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    tracing::error!(error = %e, consecutive_failures, "Cleanup pass failed");
                    PipelineMetrics::record_loop_error("cleanup");
                    self.config
                        .backoff
                        .error_delay_for(consecutive_failures)
                        .max(self.config.cleanup_interval)
                }
            };

            if pause(delay, &mut shutdown).await {
                break;
            }
        }

        tracing::info!("Cleanup loop stopped");
    }

    /// Recorded outcome per handler for an event.
    ///
    /// Empty for unknown events and for events already cleaned up.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Store` if the store fails.
    pub async fn handled_events(
        &self,
        event_id: EventId,
    ) -> Result<BTreeMap<HandlerId, HandlerOutcome>, ManagerError> {
        let states = self.states.load_states(event_id).await?;
        Ok(Self::outcomes(&states))
    }

    /// Recorded state, including attempt counts, per handler for an event.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Store` if the store fails.
    pub async fn handler_states(
        &self,
        event_id: EventId,
    ) -> Result<BTreeMap<HandlerId, HandlerState>, ManagerError> {
        Ok(self.states.load_states(event_id).await?)
    }

    async fn invoke(
        &self,
        queued: &QueuedEvent,
        registered: &RegisteredHandler<E>,
        event: &E,
        attempt: u32,
    ) -> Result<HandlerOutcome, ManagerError> {
        let ctx = HandlerContext::new(
            queued.id,
            queued.event.event_type.clone(),
            attempt,
            self.queue.clone(),
            self.guard.clone(),
        );

        let result = AssertUnwindSafe(registered.handler().handle(&ctx, event))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(HandlerError::Cancelled)) => {
                return Err(ManagerError::Cancelled {
                    event_id: queued.id,
                    handler_id: registered.id().clone(),
                });
            }
            Ok(Err(HandlerError::Failed(reason))) => HandlerOutcome::TransientError(reason),
            Err(panic) => {
                HandlerOutcome::TransientError(format!("handler panicked: {}", panic_message(&panic)))
            }
        };

        Ok(self.apply_attempt_budget(outcome, attempt))
    }

    fn apply_attempt_budget(&self, outcome: HandlerOutcome, attempt: u32) -> HandlerOutcome {
        match (outcome, self.config.max_attempts) {
            (HandlerOutcome::TransientError(reason), Some(max)) if attempt >= max => {
                HandlerOutcome::UnrecoverableError(format!(
                    "gave up after {attempt} attempts: {reason}"
                ))
            }
            (outcome, _) => outcome,
        }
    }

    async fn record(
        &self,
        event_id: EventId,
        handler_id: &HandlerId,
        outcome: &HandlerOutcome,
    ) -> Result<HandlerState, ManagerError> {
        let now = self.queue.clock().now();
        let state = self
            .states
            .record_outcome(event_id, handler_id, outcome, now)
            .await?;

        match outcome {
            HandlerOutcome::Success => {
                tracing::debug!(event_id = %event_id, handler_id = %handler_id, "Handler succeeded");
            }
            HandlerOutcome::TransientError(reason) => tracing::warn!(
                event_id = %event_id,
                handler_id = %handler_id,
                attempts = state.attempts,
                reason = %reason,
                "Handler failed, will retry"
            ),
            HandlerOutcome::FatalError(reason) | HandlerOutcome::UnrecoverableError(reason) => {
                tracing::error!(
                    event_id = %event_id,
                    handler_id = %handler_id,
                    outcome = outcome.as_str(),
                    reason = %reason,
                    "Handler gave up"
                );
            }
        }
        PipelineMetrics::record_outcome(outcome);
        Ok(state)
    }

    fn halted(states: &BTreeMap<HandlerId, HandlerState>) -> bool {
        states.values().any(|s| s.outcome.halts_event())
    }

    fn is_done(states: &BTreeMap<HandlerId, HandlerState>, id: &HandlerId) -> bool {
        states.get(id).is_some_and(|s| s.outcome.is_terminal())
    }

    fn outcomes(
        states: &BTreeMap<HandlerId, HandlerState>,
    ) -> BTreeMap<HandlerId, HandlerOutcome> {
        states
            .iter()
            .map(|(id, state)| (id.clone(), state.outcome.clone()))
            .collect()
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
