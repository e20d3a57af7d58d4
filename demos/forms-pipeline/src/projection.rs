//! Submission counters rebuilt from the event log.

use crate::events::FormEvent;
use chrono::{DateTime, Utc};
use eventline_core::projection::{ProjectionBuilder, ProjectionError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

/// Current counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// Forms submitted.
    pub submitted: u64,
    /// Submissions archived.
    pub archived: u64,
    /// Forms rejected.
    pub rejected: u64,
    /// Forms with at least one submission and no rejection.
    pub open_forms: BTreeSet<String>,
    /// Publication time of the newest entry applied.
    pub last_event_at: Option<DateTime<Utc>>,
}

/// In-memory read model of submission activity.
///
/// Clones share the same counters.
#[derive(Debug, Clone, Default)]
pub struct SubmissionStats {
    stats: Arc<RwLock<Stats>>,
}

impl SubmissionStats {
    /// Builder name, also the checkpoint key.
    pub const NAME: &'static str = "submission-stats";

    /// Create empty stats.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current counters.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the lock is poisoned.
    pub fn snapshot(&self) -> Result<Stats> {
        self.stats
            .read()
            .map(|stats| stats.clone())
            .map_err(|_| ProjectionError::Storage("stats lock poisoned".to_string()))
    }

    fn update(&self, f: impl FnOnce(&mut Stats)) -> Result<()> {
        let mut stats = self
            .stats
            .write()
            .map_err(|_| ProjectionError::Storage("stats lock poisoned".to_string()))?;
        f(&mut stats);
        Ok(())
    }
}

impl ProjectionBuilder for SubmissionStats {
    type Event = FormEvent;

    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle(&self, event: &FormEvent, event_timestamp: DateTime<Utc>) -> Result<()> {
        self.update(|stats| {
            match event {
                FormEvent::FormSubmitted { form_id, .. } => {
                    stats.submitted += 1;
                    stats.open_forms.insert(form_id.clone());
                }
                FormEvent::DocumentArchived { .. } => stats.archived += 1,
                FormEvent::FormRejected { form_id, .. } => {
                    stats.rejected += 1;
                    stats.open_forms.remove(form_id);
                }
            }
            stats.last_event_at = Some(event_timestamp);
        })
    }

    async fn rebuild(&self) -> Result<()> {
        self.update(|stats| *stats = Stats::default())
    }
}
