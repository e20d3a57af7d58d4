//! Integration tests for the event manager: dispatch, retries, settlement and
//! cleanup, using scripted handlers over the in-memory store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use eventline_core::event::{Event, SerializedEvent};
use eventline_core::event_store::EventId;
use eventline_core::handler::{HandlerError, HandlerId, HandlerOutcome};
use eventline_runtime::{
    BackoffPolicy, EventHandler, EventManager, EventManagerConfig, EventQueue, HandlerContext,
    HandlerRegistry, ManagerError, QueueConfig,
};
use eventline_testing::{InMemoryEventStore, ManualClock, ScriptedHandler};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum TestEvent {
    Foo(String),
    Bar(u32),
}

impl Event for TestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Foo(_) => "Foo.v1",
            Self::Bar(_) => "Bar.v1",
        }
    }
}

const LEASE: Duration = Duration::from_secs(10);

struct Harness {
    manager: Arc<EventManager<TestEvent>>,
    store: InMemoryEventStore,
    clock: ManualClock,
}

impl Harness {
    fn new(registry: HandlerRegistry<TestEvent>, config: EventManagerConfig) -> Self {
        let store = InMemoryEventStore::new();
        let clock = ManualClock::default();
        let queue = EventQueue::new(
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            QueueConfig::default().with_abandoned_timeout(LEASE),
        );
        let manager = EventManager::new(queue, Arc::new(store.clone()), registry, config);
        Self {
            manager: Arc::new(manager),
            store,
            clock,
        }
    }

    async fn publish(&self, event: TestEvent) -> EventId {
        self.manager
            .queue()
            .publish_event(&event, None)
            .await
            .unwrap()
            .id
    }

    fn expire_lease(&self) {
        self.clock.advance(LEASE + Duration::from_millis(1));
    }
}

fn registry(handlers: Vec<(&str, ScriptedHandler)>) -> HandlerRegistry<TestEvent> {
    handlers
        .into_iter()
        .fold(HandlerRegistry::builder(), |builder, (kind, handler)| {
            builder.register(kind, handler)
        })
        .build()
        .unwrap()
}

fn fast_config() -> EventManagerConfig {
    EventManagerConfig::default()
        .with_backoff(
            BackoffPolicy::builder()
                .idle_delay(Duration::from_millis(5))
                .error_delay(Duration::from_millis(5))
                .max_error_delay(Duration::from_millis(20))
                .build(),
        )
        .with_cleanup_interval(Duration::from_millis(5))
}

fn id(name: &str) -> HandlerId {
    HandlerId::new(name)
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn transient_failures_retry_until_terminal() {
    let mailer = ScriptedHandler::new("mailer")
        .then(HandlerOutcome::TransientError("smtp down".into()))
        .then(HandlerOutcome::TransientError("smtp down".into()))
        .otherwise(HandlerOutcome::Success);
    let h = Harness::new(
        registry(vec![("Foo.v1", mailer.clone())]),
        EventManagerConfig::default(),
    );
    let event_id = h.publish(TestEvent::Foo("bar".into())).await;

    let report = h.manager.process_next().await.unwrap().unwrap();
    assert!(!report.settled);
    assert!(h.manager.process_next().await.unwrap().is_none(), "lease is still live");

    h.expire_lease();
    let report = h.manager.process_next().await.unwrap().unwrap();
    assert!(!report.settled);

    h.expire_lease();
    let report = h.manager.process_next().await.unwrap().unwrap();
    assert!(report.settled);
    assert_eq!(report.invoked, vec![(id("mailer"), HandlerOutcome::Success)]);

    assert_eq!(mailer.attempts_seen(), vec![1, 2, 3]);
    let states = h.manager.handler_states(event_id).await.unwrap();
    assert_eq!(states[&id("mailer")].attempts, 3);
    assert_eq!(states[&id("mailer")].outcome, HandlerOutcome::Success);
}

#[tokio::test]
async fn succeeded_handlers_are_skipped_on_retry() {
    let first = ScriptedHandler::new("first");
    let second = ScriptedHandler::new("second")
        .then(HandlerOutcome::TransientError("later".into()))
        .otherwise(HandlerOutcome::Success);
    let h = Harness::new(
        registry(vec![("Foo.v1", first.clone()), ("Foo.v1", second.clone())]),
        EventManagerConfig::default().with_release_on_transient(true),
    );
    h.publish(TestEvent::Foo("x".into())).await;

    assert!(!h.manager.process_next().await.unwrap().unwrap().settled);
    let report = h.manager.process_next().await.unwrap().unwrap();

    assert!(report.settled);
    assert_eq!(report.invoked, vec![(id("second"), HandlerOutcome::Success)]);
    assert_eq!(first.invocations(), 1);
    assert_eq!(second.invocations(), 2);
}

#[tokio::test]
async fn handler_error_and_panic_count_as_transient() {
    let flaky = ScriptedHandler::new("flaky")
        .then_error(HandlerError::failed("connection reset"))
        .then_panic("boom")
        .otherwise(HandlerOutcome::Success);
    let h = Harness::new(
        registry(vec![("Foo.v1", flaky.clone())]),
        EventManagerConfig::default().with_release_on_transient(true),
    );
    h.publish(TestEvent::Foo("x".into())).await;

    let report = h.manager.process_next().await.unwrap().unwrap();
    assert_eq!(report.invoked[0].0, id("flaky"));
    assert!(matches!(
        &report.invoked[0].1,
        HandlerOutcome::TransientError(reason) if reason.contains("connection reset")
    ));

    let report = h.manager.process_next().await.unwrap().unwrap();
    assert!(matches!(
        &report.invoked[0].1,
        HandlerOutcome::TransientError(reason) if reason.contains("panicked: boom")
    ));

    let report = h.manager.process_next().await.unwrap().unwrap();
    assert!(report.settled);
    assert_eq!(flaky.invocations(), 3);
}

#[tokio::test]
async fn attempt_budget_gives_up() {
    let stuck = ScriptedHandler::new("stuck").otherwise(HandlerOutcome::TransientError("nope".into()));
    let h = Harness::new(
        registry(vec![("Foo.v1", stuck.clone())]),
        EventManagerConfig::default()
            .with_release_on_transient(true)
            .with_max_attempts(Some(2)),
    );
    let event_id = h.publish(TestEvent::Foo("x".into())).await;

    assert!(!h.manager.process_next().await.unwrap().unwrap().settled);
    let report = h.manager.process_next().await.unwrap().unwrap();
    assert!(report.settled);

    let outcomes = h.manager.handled_events(event_id).await.unwrap();
    assert!(matches!(
        &outcomes[&id("stuck")],
        HandlerOutcome::UnrecoverableError(reason) if reason.contains("gave up after 2 attempts")
    ));
    assert_eq!(stuck.invocations(), 2);
}

// ============================================================================
// Fatal and unrecoverable outcomes
// ============================================================================

#[tokio::test]
async fn fatal_error_halts_siblings_across_cycles() {
    let archive = ScriptedHandler::new("archive");
    let validate = ScriptedHandler::new("validate").then(HandlerOutcome::FatalError("corrupt".into()));
    let notify = ScriptedHandler::new("notify");
    let h = Harness::new(
        registry(vec![
            ("Foo.v1", archive.clone()),
            ("Foo.v1", validate.clone()),
            ("Foo.v1", notify.clone()),
        ]),
        EventManagerConfig::default(),
    );
    let event_id = h.publish(TestEvent::Foo("x".into())).await;

    let report = h.manager.process_next().await.unwrap().unwrap();
    assert!(report.settled);
    assert_eq!(report.invoked.len(), 2);

    for _ in 0..5 {
        h.expire_lease();
        let report = h.manager.process_next().await.unwrap().unwrap();
        assert!(report.invoked.is_empty());
        assert!(report.settled);
    }

    assert_eq!(archive.invocations(), 1);
    assert_eq!(validate.invocations(), 1);
    assert_eq!(notify.invocations(), 0);

    let outcomes = h.manager.handled_events(event_id).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(!outcomes.contains_key(&id("notify")));
}

#[tokio::test]
async fn unrecoverable_error_does_not_halt_siblings() {
    let notify = ScriptedHandler::new("notify").then(HandlerOutcome::UnrecoverableError("bad address".into()));
    let audit = ScriptedHandler::new("audit");
    let h = Harness::new(
        registry(vec![("Foo.v1", notify.clone()), ("Foo.v1", audit.clone())]),
        EventManagerConfig::default(),
    );
    let event_id = h.publish(TestEvent::Foo("x".into())).await;

    let report = h.manager.process_next().await.unwrap().unwrap();
    assert!(report.settled);
    assert_eq!(audit.invocations(), 1);

    let outcomes = h.manager.handled_events(event_id).await.unwrap();
    assert_eq!(
        outcomes[&id("notify")],
        HandlerOutcome::UnrecoverableError("bad address".into())
    );
    assert_eq!(outcomes[&id("audit")], HandlerOutcome::Success);
}

#[tokio::test]
async fn undecodable_payload_is_unrecoverable_for_every_handler() {
    let a = ScriptedHandler::new("a");
    let b = ScriptedHandler::new("b");
    let h = Harness::new(
        registry(vec![("Foo.v1", a.clone()), ("Foo.v1", b.clone())]),
        EventManagerConfig::default(),
    );
    let queued = h
        .manager
        .queue()
        .publish(SerializedEvent::new("Foo.v1".into(), vec![0xff, 0xff], None))
        .await
        .unwrap();

    let report = h.manager.process_next().await.unwrap().unwrap();
    assert!(report.settled);
    assert_eq!(a.invocations() + b.invocations(), 0);

    let outcomes = h.manager.handled_events(queued.id).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.values().all(|o| matches!(
        o,
        HandlerOutcome::UnrecoverableError(reason) if reason.starts_with("undecodable payload")
    )));
}

#[tokio::test]
async fn payload_of_another_kind_is_rejected() {
    let a = ScriptedHandler::new("a");
    let h = Harness::new(registry(vec![("Foo.v1", a.clone())]), EventManagerConfig::default());
    let bar = SerializedEvent::from_event(&TestEvent::Bar(7), None).unwrap();
    h.manager
        .queue()
        .publish(SerializedEvent::new("Foo.v1".into(), bar.data, None))
        .await
        .unwrap();

    let report = h.manager.process_next().await.unwrap().unwrap();
    assert!(report.settled);
    assert_eq!(a.invocations(), 0);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn cancellation_propagates_without_recording() {
    let a = ScriptedHandler::new("a").then_error(HandlerError::Cancelled);
    let h = Harness::new(registry(vec![("Foo.v1", a.clone())]), EventManagerConfig::default());
    let event_id = h.publish(TestEvent::Foo("x".into())).await;

    let result = h.manager.process_next().await;
    assert!(matches!(
        result,
        Err(ManagerError::Cancelled { event_id: e, ref handler_id }) if e == event_id && handler_id.as_str() == "a"
    ));
    assert!(h.manager.handler_states(event_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn cancellation_stops_the_process_loop() {
    let a = ScriptedHandler::new("a").then_error(HandlerError::Cancelled);
    let h = Harness::new(registry(vec![("Foo.v1", a)]), fast_config());
    h.publish(TestEvent::Foo("x".into())).await;

    let (_tx, rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(5), h.manager.run_process_loop(rx))
        .await
        .expect("loop should stop on cancellation");
    assert!(matches!(result, Err(ManagerError::Cancelled { .. })));
}

// ============================================================================
// Settlement and cleanup
// ============================================================================

#[tokio::test]
async fn settled_event_is_cleaned_up() {
    let a = ScriptedHandler::new("a");
    let h = Harness::new(registry(vec![("Foo.v1", a)]), EventManagerConfig::default());
    let event_id = h.publish(TestEvent::Foo("x".into())).await;

    h.manager.process_next().await.unwrap().unwrap();
    assert_eq!(h.manager.handled_events(event_id).await.unwrap().len(), 1);

    let report = h.manager.cleanup_finalized_events().await.unwrap();
    assert_eq!(report.finalized, 1);
    assert_eq!(report.states_deleted, 1);

    assert!(h.manager.handled_events(event_id).await.unwrap().is_empty());
    assert!(h.manager.queue().log_entry(event_id).await.unwrap().is_some());
    assert!(h.store.queued_events().is_empty());
    assert_eq!(h.store.handler_state_count(), 0);
}

#[tokio::test]
async fn cleanup_leaves_unsettled_events_alone() {
    let slow = ScriptedHandler::new("slow").otherwise(HandlerOutcome::TransientError("wait".into()));
    let h = Harness::new(
        registry(vec![("Foo.v1", slow)]),
        EventManagerConfig::default().with_cleanup_batch_size(1),
    );
    let retrying = h.publish(TestEvent::Foo("retrying".into())).await;
    h.manager.process_next().await.unwrap();
    let other = h.publish(TestEvent::Bar(1)).await;
    h.manager.process_next().await.unwrap();

    let report = h.manager.cleanup_finalized_events().await.unwrap();
    assert_eq!(report.finalized, 1, "only the handler-less Bar settles");

    assert!(h.manager.queue().get(retrying).await.unwrap().is_some());
    assert!(h.manager.queue().log_entry(other).await.unwrap().is_some());
}

#[tokio::test]
async fn cleanup_skips_unclaimed_backlog() {
    let a = ScriptedHandler::new("a");
    let h = Harness::new(
        registry(vec![("Foo.v1", a)]),
        EventManagerConfig::default().with_cleanup_batch_size(4),
    );
    let settled = h.publish(TestEvent::Foo("first".into())).await;
    h.manager.process_next().await.unwrap().unwrap();
    for n in 0..20 {
        h.publish(TestEvent::Foo(format!("backlog-{n}"))).await;
    }

    let loads_before = h.store.state_loads();
    let report = h.manager.cleanup_finalized_events().await.unwrap();

    assert_eq!(report.finalized, 1);
    assert_eq!(h.store.state_loads() - loads_before, 1, "only the claimed event is inspected");
    assert!(h.manager.queue().log_entry(settled).await.unwrap().is_some());
    assert_eq!(h.store.queued_events().len(), 20);
}

#[tokio::test]
async fn event_without_handlers_settles_immediately() {
    let h = Harness::new(registry(vec![]), EventManagerConfig::default());
    let event_id = h.publish(TestEvent::Bar(3)).await;

    let report = h.manager.process_next().await.unwrap().unwrap();
    assert!(report.settled);
    assert!(report.invoked.is_empty());

    h.manager.cleanup_finalized_events().await.unwrap();
    assert!(h.manager.queue().log_entry(event_id).await.unwrap().is_some());
}

#[tokio::test]
async fn cleanup_sweeps_orphaned_states() {
    let h = Harness::new(registry(vec![]), EventManagerConfig::default());
    h.store.insert_handler_state(
        EventId::new(404),
        "ghost",
        eventline_core::handler::HandlerState {
            outcome: HandlerOutcome::Success,
            attempts: 1,
            updated_at: h.clock.current(),
        },
    );

    let report = h.manager.cleanup_finalized_events().await.unwrap();
    assert_eq!(report.orphans_deleted, 1);
    assert_eq!(h.store.handler_state_count(), 0);
}

// ============================================================================
// Handlers publishing follow-up events
// ============================================================================

struct Forwarder;

impl EventHandler<TestEvent> for Forwarder {
    fn id(&self) -> &str {
        "forwarder"
    }

    fn handle<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        event: &'a TestEvent,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerOutcome, HandlerError>> + Send + 'a>> {
        Box::pin(async move {
            let TestEvent::Foo(_) = event else {
                return Ok(HandlerOutcome::Success);
            };
            if !ctx.is_guarded("forward").await? {
                let follow_up = SerializedEvent::from_event(&TestEvent::Bar(1), None)
                    .map_err(HandlerError::failed)?;
                ctx.publish_guarded(follow_up, "forward").await?;
            }
            if ctx.attempt() == 1 {
                return Ok(HandlerOutcome::TransientError("downstream timeout".into()));
            }
            Ok(HandlerOutcome::Success)
        })
    }
}

#[tokio::test]
async fn guarded_follow_up_is_published_once_across_retries() {
    let registry = HandlerRegistry::builder()
        .register("Foo.v1", Forwarder)
        .build()
        .unwrap();
    let h = Harness::new(registry, EventManagerConfig::default().with_release_on_transient(true));
    let source = h.publish(TestEvent::Foo("x".into())).await;

    assert!(!h.manager.process_next().await.unwrap().unwrap().settled);
    let report = h.manager.process_next().await.unwrap().unwrap();
    assert_eq!(report.event_id, source);
    assert!(report.settled);

    let follow_ups: Vec<_> = h
        .store
        .queued_events()
        .into_iter()
        .filter(|e| e.event.event_type == "Bar.v1")
        .collect();
    assert_eq!(follow_ups.len(), 1);
    assert_eq!(h.store.idempotency_records().len(), 1);
}

// ============================================================================
// Loops
// ============================================================================

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn loops_drain_queue_and_stop_on_shutdown() {
    let a = ScriptedHandler::new("a");
    let h = Harness::new(registry(vec![("Foo.v1", a.clone())]), fast_config());
    for i in 0..5 {
        h.publish(TestEvent::Foo(format!("event-{i}"))).await;
    }

    let (tx, rx) = watch::channel(false);
    let process = {
        let manager = Arc::clone(&h.manager);
        let rx = rx.clone();
        tokio::spawn(async move { manager.run_process_loop(rx).await })
    };
    let cleanup = {
        let manager = Arc::clone(&h.manager);
        tokio::spawn(async move { manager.run_cleanup_loop(rx).await })
    };

    let store = h.store.clone();
    wait_for(|| store.log_entries().len() == 5).await;
    assert_eq!(a.invocations(), 5);

    tx.send(true).unwrap();
    assert!(process.await.unwrap().is_ok());
    cleanup.await.unwrap();
}

#[tokio::test]
async fn process_loop_survives_store_outage() {
    let a = ScriptedHandler::new("a");
    let h = Harness::new(registry(vec![("Foo.v1", a.clone())]), fast_config());

    h.store.set_unavailable(true);
    let (tx, rx) = watch::channel(false);
    let process = {
        let manager = Arc::clone(&h.manager);
        tokio::spawn(async move { manager.run_process_loop(rx).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!process.is_finished());

    h.store.set_unavailable(false);
    h.publish(TestEvent::Foo("after outage".into())).await;
    wait_for(|| a.invocations() == 1).await;

    tx.send(true).unwrap();
    assert!(process.await.unwrap().is_ok());
}
