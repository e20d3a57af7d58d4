//! Projections over the Eventline log.
//!
//! # Overview
//!
//! - [`ProjectionRunner`]: feeds log entries to one [`ProjectionBuilder`] in
//!   id order, advancing a checkpoint after each entry
//! - [`PostgresProjectionCheckpoint`]: checkpoints in `projection_builder_state`
//!
//! Each builder has its own runner and its own checkpoint, so a slow or
//! failing builder never holds the others back.
//!
//! # Example
//!
//! ```ignore
//! use eventline_projections::{PostgresProjectionCheckpoint, ProjectionRunner};
//!
//! let checkpoint = PostgresProjectionCheckpoint::new(pool.clone());
//! checkpoint.migrate().await?;
//!
//! let runner = ProjectionRunner::new(stats, store, Arc::new(checkpoint))
//!     .with_batch_size(50);
//! let shutdown = pipeline.shutdown_signal();
//! pipeline.spawn("projection:stats", async move { runner.run(shutdown).await });
//! ```
//!
//! [`ProjectionBuilder`]: eventline_core::projection::ProjectionBuilder

pub mod postgres;
pub mod runner;

pub use postgres::PostgresProjectionCheckpoint;
pub use runner::ProjectionRunner;
