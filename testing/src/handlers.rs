//! Scripted event handlers.
//!
//! A [`ScriptedHandler`] returns a fixed sequence of results, then a fallback
//! for every later call. Clones share the script and the invocation log, so a
//! test can register one clone and inspect the other.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use eventline_core::event_store::EventId;
use eventline_core::handler::{HandlerError, HandlerOutcome};
use eventline_runtime::handler::{EventHandler, HandlerContext};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

/// One scripted result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Return this outcome.
    Outcome(HandlerOutcome),
    /// Return this error.
    Error(HandlerError),
    /// Panic with this message.
    Panic(String),
}

#[derive(Debug)]
struct Script {
    steps: VecDeque<Step>,
    fallback: Step,
    calls: Vec<(EventId, u32)>,
}

/// Handler that plays back scripted results.
///
/// # Example
///
/// ```
/// use eventline_testing::ScriptedHandler;
/// use eventline_core::handler::HandlerOutcome;
///
/// let handler = ScriptedHandler::new("mailer")
///     .then(HandlerOutcome::TransientError("smtp down".into()))
///     .then_panic("boom")
///     .otherwise(HandlerOutcome::Success);
/// assert_eq!(handler.invocations(), 0);
/// ```
#[derive(Debug, Clone)]
pub struct ScriptedHandler {
    id: String,
    script: Arc<Mutex<Script>>,
}

impl ScriptedHandler {
    /// A handler that succeeds until scripted otherwise.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            script: Arc::new(Mutex::new(Script {
                steps: VecDeque::new(),
                fallback: Step::Outcome(HandlerOutcome::Success),
                calls: Vec::new(),
            })),
        }
    }

    /// Queue an outcome.
    #[must_use]
    pub fn then(self, outcome: HandlerOutcome) -> Self {
        self.push(Step::Outcome(outcome))
    }

    /// Queue an error.
    #[must_use]
    pub fn then_error(self, error: HandlerError) -> Self {
        self.push(Step::Error(error))
    }

    /// Queue a panic.
    #[must_use]
    pub fn then_panic(self, message: impl Into<String>) -> Self {
        self.push(Step::Panic(message.into()))
    }

    /// Outcome for every call after the queued steps run out.
    #[must_use]
    pub fn otherwise(self, outcome: HandlerOutcome) -> Self {
        self.script.lock().unwrap().fallback = Step::Outcome(outcome);
        self
    }

    /// Number of calls so far.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.script.lock().unwrap().calls.len()
    }

    /// Attempt numbers seen by each call, in call order.
    #[must_use]
    pub fn attempts_seen(&self) -> Vec<u32> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(_, attempt)| *attempt)
            .collect()
    }

    /// Event ids seen by each call, in call order.
    #[must_use]
    pub fn events_seen(&self) -> Vec<EventId> {
        self.script
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    fn push(self, step: Step) -> Self {
        self.script.lock().unwrap().steps.push_back(step);
        self
    }

    fn next_step(&self, ctx: &HandlerContext) -> Step {
        let mut script = self.script.lock().unwrap();
        script.calls.push((ctx.event_id(), ctx.attempt()));
        let fallback = script.fallback.clone();
        script.steps.pop_front().unwrap_or(fallback)
    }
}

impl<E: Send + Sync> EventHandler<E> for ScriptedHandler {
    fn id(&self) -> &str {
        &self.id
    }

    #[allow(clippy::panic)]
    fn handle<'a>(
        &'a self,
        ctx: &'a HandlerContext,
        _event: &'a E,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerOutcome, HandlerError>> + Send + 'a>> {
        let step = self.next_step(ctx);
        Box::pin(async move {
            match step {
                Step::Outcome(outcome) => Ok(outcome),
                Step::Error(error) => Err(error),
                Step::Panic(message) => panic!("{message}"),
            }
        })
    }
}
