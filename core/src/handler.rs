//! Handler outcomes and their persistent state.
//!
//! Every handler invocation for an event ends in exactly one
//! [`HandlerOutcome`]. Outcomes are persisted per `(event, handler)` pair so
//! that a retry after a crash or lease expiry knows which handlers have
//! already reached a final result.
//!
//! | Outcome | Terminal | Halts siblings |
//! |---|---|---|
//! | `Success` | yes | no |
//! | `TransientError` | no | no |
//! | `FatalError` | yes | yes |
//! | `UnrecoverableError` | yes | no |

use crate::event_store::{EventId, EventStoreError};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Unique identifier of a handler within one event kind.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(String);

impl HandlerId {
    /// Create a handler id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HandlerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Result of one handler invocation for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// The handler finished its work.
    Success,
    /// The handler failed but may succeed on a later attempt.
    TransientError(String),
    /// The event must not be processed any further by anyone.
    FatalError(String),
    /// This handler will never succeed for this event; siblings continue.
    UnrecoverableError(String),
}

impl HandlerOutcome {
    /// Whether the outcome is final for this handler.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::TransientError(_))
    }

    /// Whether the outcome stops every other handler for the event.
    #[must_use]
    pub const fn halts_event(&self) -> bool {
        matches!(self, Self::FatalError(_))
    }

    /// Database string representation of the variant.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::TransientError(_) => "transient_error",
            Self::FatalError(_) => "fatal_error",
            Self::UnrecoverableError(_) => "unrecoverable_error",
        }
    }

    /// The failure reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Success => None,
            Self::TransientError(reason)
            | Self::FatalError(reason)
            | Self::UnrecoverableError(reason) => Some(reason),
        }
    }

    /// Rebuild an outcome from its stored parts.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if `kind` is not a known outcome.
    pub fn from_parts(kind: &str, reason: Option<String>) -> Result<Self, EventStoreError> {
        let reason = reason.unwrap_or_default();
        match kind {
            "success" => Ok(Self::Success),
            "transient_error" => Ok(Self::TransientError(reason)),
            "fatal_error" => Ok(Self::FatalError(reason)),
            "unrecoverable_error" => Ok(Self::UnrecoverableError(reason)),
            _ => Err(EventStoreError::DatabaseError(format!(
                "Invalid handler outcome: {kind}"
            ))),
        }
    }
}

impl fmt::Display for HandlerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {reason}", self.as_str()),
            None => f.write_str(self.as_str()),
        }
    }
}

/// Persisted state of one `(event, handler)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerState {
    /// Last recorded outcome.
    pub outcome: HandlerOutcome,
    /// Number of invocations recorded so far.
    pub attempts: u32,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
}

/// Error returned by a handler instead of an outcome.
///
/// `Failed` is treated like a transient error. `Cancelled` is never recorded;
/// it stops the processing loop that ran the handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The surrounding task is being cancelled.
    #[error("Handler cancelled")]
    Cancelled,

    /// Any failure the handler did not classify.
    #[error("Handler failed: {0}")]
    Failed(String),
}

impl HandlerError {
    /// Wrap any displayable error as `Failed`.
    pub fn failed(error: impl fmt::Display) -> Self {
        Self::Failed(error.to_string())
    }
}

impl From<EventStoreError> for HandlerError {
    fn from(error: EventStoreError) -> Self {
        Self::Failed(error.to_string())
    }
}

/// Whether an event is settled.
///
/// An event is settled once any handler recorded a fatal error, or once every
/// registered handler has a terminal outcome. An event with no registered
/// handlers is settled immediately.
#[must_use]
pub fn is_settled<'a>(
    registered: impl IntoIterator<Item = &'a HandlerId>,
    outcomes: &BTreeMap<HandlerId, HandlerOutcome>,
) -> bool {
    if outcomes.values().any(HandlerOutcome::halts_event) {
        return true;
    }
    registered
        .into_iter()
        .all(|id| outcomes.get(id).is_some_and(HandlerOutcome::is_terminal))
}

/// Storage for per-`(event, handler)` outcomes.
///
/// # Dyn Compatibility
///
/// Uses explicit `Pin<Box<dyn Future>>` returns so the manager can hold an
/// `Arc<dyn HandlerStateStore>`.
pub trait HandlerStateStore: Send + Sync {
    /// Load every recorded state for an event.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the query fails.
    fn load_states(
        &self,
        event_id: EventId,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<BTreeMap<HandlerId, HandlerState>, EventStoreError>>
                + Send
                + '_,
        >,
    >;

    /// Record an outcome and increment the attempt counter.
    ///
    /// A terminal outcome already on record is never overwritten; the stored
    /// state is returned unchanged in that case.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the upsert fails.
    fn record_outcome(
        &self,
        event_id: EventId,
        handler_id: &HandlerId,
        outcome: &HandlerOutcome,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerState, EventStoreError>> + Send + '_>>;

    /// Delete every state of an event. Returns the number of rows removed.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the delete fails.
    fn delete_states(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, EventStoreError>> + Send + '_>>;

    /// Delete states whose event is no longer in the queue.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the delete fails.
    fn delete_orphaned_states(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, EventStoreError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(names: &[&str]) -> Vec<HandlerId> {
        names.iter().map(|n| HandlerId::new(*n)).collect()
    }

    #[test]
    fn outcome_classification() {
        assert!(HandlerOutcome::Success.is_terminal());
        assert!(!HandlerOutcome::TransientError("x".into()).is_terminal());
        assert!(HandlerOutcome::FatalError("x".into()).is_terminal());
        assert!(HandlerOutcome::UnrecoverableError("x".into()).is_terminal());

        assert!(HandlerOutcome::FatalError("x".into()).halts_event());
        assert!(!HandlerOutcome::UnrecoverableError("x".into()).halts_event());
    }

    #[test]
    fn outcome_parts_roundtrip() {
        for outcome in [
            HandlerOutcome::Success,
            HandlerOutcome::TransientError("timeout".into()),
            HandlerOutcome::FatalError("bad form".into()),
            HandlerOutcome::UnrecoverableError("no applicant".into()),
        ] {
            let parsed = HandlerOutcome::from_parts(
                outcome.as_str(),
                outcome.reason().map(str::to_string),
            )
            .expect("known outcome should parse");
            assert_eq!(parsed, outcome);
        }
        assert!(HandlerOutcome::from_parts("skipped", None).is_err());
    }

    #[test]
    fn no_handlers_is_settled() {
        assert!(is_settled(&Vec::<HandlerId>::new(), &BTreeMap::new()));
    }

    #[test]
    fn missing_outcome_is_not_settled() {
        let registered = ids(&["a", "b"]);
        let outcomes = BTreeMap::from([(HandlerId::new("a"), HandlerOutcome::Success)]);
        assert!(!is_settled(&registered, &outcomes));
    }

    #[test]
    fn fatal_settles_even_with_pending_siblings() {
        let registered = ids(&["a", "b", "c"]);
        let outcomes = BTreeMap::from([(
            HandlerId::new("b"),
            HandlerOutcome::FatalError("stop".into()),
        )]);
        assert!(is_settled(&registered, &outcomes));
    }

    #[test]
    fn handler_error_from_store_error_is_failed() {
        let error: HandlerError = EventStoreError::DatabaseError("down".into()).into();
        assert!(matches!(error, HandlerError::Failed(msg) if msg.contains("down")));
    }

    fn outcome_strategy() -> impl Strategy<Value = HandlerOutcome> {
        prop_oneof![
            Just(HandlerOutcome::Success),
            Just(HandlerOutcome::TransientError("t".into())),
            Just(HandlerOutcome::FatalError("f".into())),
            Just(HandlerOutcome::UnrecoverableError("u".into())),
        ]
    }

    proptest! {
        #[test]
        fn settled_iff_fatal_or_all_terminal(
            recorded in proptest::collection::vec(proptest::option::of(outcome_strategy()), 0..6)
        ) {
            let registered: Vec<HandlerId> =
                (0..recorded.len()).map(|i| HandlerId::new(format!("h{i}"))).collect();
            let outcomes: BTreeMap<HandlerId, HandlerOutcome> = registered
                .iter()
                .zip(&recorded)
                .filter_map(|(id, o)| o.clone().map(|o| (id.clone(), o)))
                .collect();

            let any_fatal = recorded.iter().flatten().any(HandlerOutcome::halts_event);
            let all_terminal = recorded
                .iter()
                .all(|o| o.as_ref().is_some_and(HandlerOutcome::is_terminal));

            prop_assert_eq!(is_settled(&registered, &outcomes), any_fatal || all_terminal);
        }
    }
}
