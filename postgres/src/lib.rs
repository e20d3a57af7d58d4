//! `PostgreSQL` storage for the Eventline pipeline.
//!
//! [`PostgresEventStore`] implements both the `EventStore` and the
//! `HandlerStateStore` traits from `eventline-core` over one connection pool:
//!
//! - `queued_events`: events awaiting their handlers, claimed with
//!   `FOR UPDATE SKIP LOCKED` so concurrent workers never share a row
//! - `event_log`: settled events, moved from the queue in one statement
//! - `event_handler_state`: last outcome and attempt count per handler
//! - `idempotency_records`: completed side effects per sub-task
//!
//! # Example
//!
//! ```ignore
//! use eventline_postgres::PostgresEventStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresEventStore::new("postgres://localhost/eventline").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

mod handler_state;
mod store;

pub use store::{PostgresEventStore, PostgresUnitOfWork};
