//! In-memory projection testing utilities
//!
//! - [`InMemoryProjectionCheckpoint`]: checkpoint table behind a lock
//! - [`RecordingProjection`]: builder that records what it applied and can be
//!   told to fail

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use eventline_core::event::Event;
use eventline_core::projection::{
    EventPosition, ProjectionBuilder, ProjectionCheckpoint, ProjectionError, Result,
};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// In-memory checkpoint tracker for tests.
///
/// Follows the checkpoint contract: loading creates the position at 0,
/// saving never moves it backwards and only a reset does.
///
/// # Example
///
/// ```
/// use eventline_testing::InMemoryProjectionCheckpoint;
/// use eventline_core::projection::{EventPosition, ProjectionCheckpoint};
/// use chrono::Utc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let checkpoint = InMemoryProjectionCheckpoint::new();
/// assert_eq!(checkpoint.load_position("stats").await?.offset, 0);
///
/// checkpoint.save_position("stats", EventPosition::new(5, Utc::now())).await?;
/// checkpoint.save_position("stats", EventPosition::new(3, Utc::now())).await?;
/// assert_eq!(checkpoint.offset("stats"), Some(5));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryProjectionCheckpoint {
    positions: Arc<RwLock<HashMap<String, EventPosition>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryProjectionCheckpoint {
    /// Create a new empty checkpoint tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored offset of a builder, without creating it.
    #[must_use]
    pub fn offset(&self, builder_name: &str) -> Option<u64> {
        self.positions
            .read()
            .unwrap()
            .get(builder_name)
            .map(|p| p.offset)
    }

    /// Make every call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProjectionError::Checkpoint(
                "in-memory checkpoint unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl ProjectionCheckpoint for InMemoryProjectionCheckpoint {
    fn save_position(
        &self,
        builder_name: &str,
        position: EventPosition,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let builder_name = builder_name.to_string();
        Box::pin(async move {
            self.check()?;
            let mut positions = self.positions.write().unwrap();
            let stored = positions
                .entry(builder_name)
                .or_insert_with(|| EventPosition::new(0, position.timestamp));
            if position.offset > stored.offset {
                *stored = position;
            }
            Ok(())
        })
    }

    fn load_position(
        &self,
        builder_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<EventPosition>> + Send + '_>> {
        let builder_name = builder_name.to_string();
        Box::pin(async move {
            self.check()?;
            Ok(*self
                .positions
                .write()
                .unwrap()
                .entry(builder_name)
                .or_insert_with(EventPosition::beginning))
        })
    }

    fn reset_position(
        &self,
        builder_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let builder_name = builder_name.to_string();
        Box::pin(async move {
            self.check()?;
            self.positions
                .write()
                .unwrap()
                .insert(builder_name, EventPosition::beginning());
            Ok(())
        })
    }
}

/// Projection builder that records every event it applies.
///
/// Clones share the recorded list and the failure budget.
#[derive(Clone)]
pub struct RecordingProjection<E> {
    name: String,
    applied: Arc<RwLock<Vec<(E, DateTime<Utc>)>>>,
    failures_left: Arc<AtomicUsize>,
    rebuilds: Arc<AtomicUsize>,
}

impl<E> RecordingProjection<E> {
    /// Create a builder named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            applied: Arc::new(RwLock::new(Vec::new())),
            failures_left: Arc::new(AtomicUsize::new(0)),
            rebuilds: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the next `count` calls to `handle`.
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Number of rebuilds requested.
    #[must_use]
    pub fn rebuilds(&self) -> usize {
        self.rebuilds.load(Ordering::SeqCst)
    }
}

impl<E: Clone> RecordingProjection<E> {
    /// Events applied so far, in order.
    #[must_use]
    pub fn applied(&self) -> Vec<E> {
        self.applied
            .read()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    /// Timestamps passed with each applied event.
    #[must_use]
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        self.applied.read().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

impl<E> ProjectionBuilder for RecordingProjection<E>
where
    E: Event + DeserializeOwned + Clone,
{
    type Event = E;

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &E, event_timestamp: DateTime<Utc>) -> Result<()> {
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(ProjectionError::EventProcessing(format!(
                "{} refused {}",
                self.name,
                event.event_type()
            )));
        }
        self.applied
            .write()
            .unwrap()
            .push((event.clone(), event_timestamp));
        Ok(())
    }

    async fn rebuild(&self) -> Result<()> {
        self.applied.write().unwrap().clear();
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
