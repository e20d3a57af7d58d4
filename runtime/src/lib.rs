//! # Eventline Runtime
//!
//! Runtime for the Eventline at-least-once event pipeline.
//!
//! ## Core Components
//!
//! - **[`EventQueue`]**: publish, claim with an abandonable lease, finalize
//!   into the log
//! - **[`IdempotencyGuard`]**: per sub-task records so handlers can skip side
//!   effects that already happened
//! - **[`EventManager`]**: runs the handlers registered for each claimed event
//!   and cleans up settled events
//! - **[`Pipeline`]**: spawns the loops and stops them together
//!
//! ## Example
//!
//! ```ignore
//! use eventline_runtime::{EventManager, EventQueue, HandlerRegistry, Pipeline, PipelineConfig};
//!
//! let config = PipelineConfig::from_env();
//! let queue = EventQueue::new(store.clone(), Arc::new(SystemClock), config.queue_config());
//!
//! let registry = HandlerRegistry::builder()
//!     .register("FormSubmitted.v1", ArchiveSubmission::new(archive))
//!     .register("FormSubmitted.v1", NotifyApplicant::new(mailer))
//!     .build()?;
//!
//! let manager = EventManager::new(queue, store, registry, config.manager_config());
//!
//! let mut pipeline = Pipeline::new();
//! pipeline.spawn_event_manager(Arc::new(manager), config.workers);
//! ```

pub mod backoff;
pub mod config;
pub mod handler;
pub mod health;
pub mod idempotency;
pub mod manager;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod registry;

pub use backoff::BackoffPolicy;
pub use config::PipelineConfig;
pub use handler::{EventHandler, HandlerContext};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use idempotency::IdempotencyGuard;
pub use manager::{CleanupReport, EventManager, EventManagerConfig, ManagerError, ProcessReport};
pub use pipeline::Pipeline;
pub use queue::{EventQueue, QueueConfig};
pub use registry::{HandlerRegistry, HandlerRegistryBuilder, RegistryError};
