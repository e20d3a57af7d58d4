//! Replays the event log into one projection builder.

use eventline_core::event_store::{EventStore, LogEntry};
use eventline_core::projection::{
    EventPosition, ProjectionBuilder, ProjectionCheckpoint, ProjectionError, Result,
};
use eventline_runtime::backoff::{BackoffPolicy, pause, shutdown_requested};
use eventline_runtime::metrics::PipelineMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Drives a [`ProjectionBuilder`] from the event log.
///
/// The checkpoint holds the id of the last entry the builder fully applied.
/// Each poll reads the next entries after it, in ascending id order, and saves
/// the checkpoint after every successful apply. A failed apply leaves the
/// checkpoint where it was, so the same entry is offered again.
pub struct ProjectionRunner<P> {
    builder: P,
    store: Arc<dyn EventStore>,
    checkpoint: Arc<dyn ProjectionCheckpoint>,
    batch_size: usize,
    backoff: BackoffPolicy,
}

impl<P: ProjectionBuilder> ProjectionRunner<P> {
    /// Create a runner reading one entry per poll.
    ///
    /// The default backoff sleeps 500 ms when the log is drained and 10 s
    /// after a failure.
    #[must_use]
    pub fn new(
        builder: P,
        store: Arc<dyn EventStore>,
        checkpoint: Arc<dyn ProjectionCheckpoint>,
    ) -> Self {
        Self {
            builder,
            store,
            checkpoint,
            batch_size: 1,
            backoff: BackoffPolicy::builder()
                .idle_delay(Duration::from_millis(500))
                .error_delay(Duration::from_secs(10))
                .build(),
        }
    }

    /// Read up to `batch_size` entries per poll. Zero is treated as one.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Replace the idle and error delays of [`run`](Self::run).
    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// The builder being fed.
    #[must_use]
    pub const fn builder(&self) -> &P {
        &self.builder
    }

    /// Entries read per poll.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Apply the next batch of log entries.
    ///
    /// Returns `false` when no entry follows the checkpoint. Entries newer than
    /// an event that is still queued are held back until that event reaches
    /// the log, so a late finalize never lands behind the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Apply`] naming the builder and the entry if
    /// an entry cannot be decoded or applied; entries before it in the batch
    /// stay applied. Checkpoint and log read failures are returned as is.
    pub async fn poll(&self) -> Result<bool> {
        let name = self.builder.name();
        let position = self.checkpoint.load_position(name).await?;
        let entries = self
            .store
            .read_log_after(position.last_applied(), self.batch_size)
            .await
            .map_err(|e| ProjectionError::Storage(e.to_string()))?;

        if entries.is_empty() {
            return Ok(false);
        }

        for entry in &entries {
            self.apply(entry)
                .await
                .map_err(|source| ProjectionError::Apply {
                    builder: name.to_string(),
                    entry_id: entry.id,
                    source: Box::new(source),
                })?;

            self.checkpoint
                .save_position(name, EventPosition::new(entry.id.as_offset(), entry.finalized_at))
                .await?;

            tracing::debug!(builder = name, entry_id = %entry.id, "Projection entry applied");
            PipelineMetrics::record_projection_applied(name);
        }

        Ok(true)
    }

    async fn apply(&self, entry: &LogEntry) -> Result<()> {
        let event = entry
            .event
            .decode::<P::Event>()
            .map_err(|e| ProjectionError::Serialization(e.to_string()))?;
        self.builder.handle(&event, entry.created_at).await
    }

    /// Poll until shutdown.
    ///
    /// Sleeps the idle delay when the log is drained. After an error it logs,
    /// sleeps the error delay and retries from the same checkpoint.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let name = self.builder.name();
        tracing::info!(builder = name, batch_size = self.batch_size, "Starting projection loop");
        let mut consecutive_failures = 0u32;

        loop {
            if shutdown_requested(&shutdown) {
                break;
            }

            let delay = match self.poll().await {
                Ok(true) => {
                    consecutive_failures = 0;
                    continue;
                }
                Ok(false) => {
                    consecutive_failures = 0;
                    self.backoff.idle_delay
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    tracing::error!(
                        builder = name,
                        error = %e,
                        consecutive_failures,
                        "Projection poll failed"
                    );
                    PipelineMetrics::record_loop_error("projection");
                    self.backoff.error_delay_for(consecutive_failures)
                }
            };

            if pause(delay, &mut shutdown).await {
                break;
            }
        }

        tracing::info!(builder = name, "Projection loop stopped");
    }

    /// Reset the checkpoint and clear the builder's state.
    ///
    /// The next poll starts again from the first log entry.
    ///
    /// # Errors
    ///
    /// Returns the checkpoint or builder error.
    pub async fn rebuild(&self) -> Result<()> {
        let name = self.builder.name();
        self.checkpoint.reset_position(name).await?;
        self.builder.rebuild().await?;
        tracing::info!(builder = name, "Projection reset for rebuild");
        Ok(())
    }
}
