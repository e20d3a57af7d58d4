//! Supervision of the long-running loops.
//!
//! A [`Pipeline`] owns one shutdown signal and every task spawned under it:
//! the processing loops and cleanup loop of an [`EventManager`], projection
//! runners, or anything else that should stop with the process.
//!
//! # Example
//!
//! ```ignore
//! let mut pipeline = Pipeline::new();
//! pipeline.spawn_event_manager(Arc::new(manager), 4);
//!
//! let shutdown = pipeline.shutdown_signal();
//! pipeline.spawn("projection:submission-stats", async move {
//!     runner.run(shutdown).await;
//! });
//!
//! tokio::signal::ctrl_c().await?;
//! pipeline.shutdown_and_join().await;
//! ```

use crate::manager::EventManager;
use eventline_core::event::Event;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Handle over a group of supervised tasks.
///
/// Dropping the pipeline drops the shutdown sender, which the loops also treat
/// as a shutdown request.
pub struct Pipeline {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// A receiver that flips to `true` on shutdown.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn `workers` processing loops and one cleanup loop.
    ///
    /// Several processing loops over one manager claim different events; the
    /// store's claim is atomic.
    pub fn spawn_event_manager<E>(&mut self, manager: Arc<EventManager<E>>, workers: usize)
    where
        E: Event + DeserializeOwned,
    {
        for worker in 0..workers.max(1) {
            let manager = Arc::clone(&manager);
            let shutdown = self.shutdown_signal();
            self.spawn(format!("event-manager:{worker}"), async move {
                if let Err(e) = manager.run_process_loop(shutdown).await {
                    tracing::warn!(worker, error = %e, "Processing loop ended");
                }
            });
        }

        let shutdown = self.shutdown_signal();
        self.spawn("event-manager:cleanup", async move {
            manager.run_cleanup_loop(shutdown).await;
        });
    }

    /// Spawn a named task.
    ///
    /// The task should watch [`Pipeline::shutdown_signal`] to stop in time.
    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!(task = %name, "Spawning pipeline task");
        self.tasks.push((name, tokio::spawn(task)));
    }

    /// Number of supervised tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Ask every task to stop after its current unit of work.
    pub fn request_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Request shutdown and wait for every task.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        tracing::info!(tasks = self.tasks.len(), "Waiting for pipeline tasks");

        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                tracing::error!(task = %name, error = %e, "Pipeline task panicked");
            }
        }

        tracing::info!("Pipeline stopped");
    }
}
