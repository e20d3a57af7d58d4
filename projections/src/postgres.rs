//! `PostgreSQL` checkpoints for projection builders.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE projection_builder_state (
//!     builder_name TEXT PRIMARY KEY,
//!     position BIGINT NOT NULL DEFAULT 0,
//!     updated_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! The table can live next to the event tables or in a separate database; the
//! runner only needs the log from the event store.

use chrono::{DateTime, Utc};
use eventline_core::projection::{EventPosition, ProjectionCheckpoint, ProjectionError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::pin::Pin;

/// PostgreSQL-backed checkpoint tracking.
///
/// Positions only move forward: a save at or below the stored position is
/// ignored. [`reset_position`](ProjectionCheckpoint::reset_position) is the
/// one way back to 0.
///
/// # Example
///
/// ```ignore
/// use eventline_projections::PostgresProjectionCheckpoint;
///
/// let checkpoint = PostgresProjectionCheckpoint::new(pool);
/// checkpoint.migrate().await?;
///
/// // First load creates the row at 0
/// let position = checkpoint.load_position("submission_stats").await?;
/// assert_eq!(position.offset, 0);
/// ```
#[derive(Clone, Debug)]
pub struct PostgresProjectionCheckpoint {
    pool: PgPool,
}

impl PostgresProjectionCheckpoint {
    /// Create a checkpoint tracker using an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a checkpoint tracker with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if connection fails.
    pub async fn new_with_separate_db(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5) // Checkpoints are low-volume
            .connect(database_url)
            .await
            .map_err(|e| ProjectionError::Checkpoint(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool))
    }

    /// Create the checkpoint table if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if migration fails.
    pub async fn migrate(&self) -> Result<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_position(position: i64, updated_at: DateTime<Utc>) -> EventPosition {
    EventPosition::new(u64::try_from(position).unwrap_or(0), updated_at)
}

impl ProjectionCheckpoint for PostgresProjectionCheckpoint {
    fn save_position(
        &self,
        builder_name: &str,
        position: EventPosition,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let builder_name = builder_name.to_string();
        Box::pin(async move {
            let offset = i64::try_from(position.offset).map_err(|_| {
                ProjectionError::Checkpoint(format!("Position {} out of range", position.offset))
            })?;

            sqlx::query(
                r"
                INSERT INTO projection_builder_state (builder_name, position, updated_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (builder_name) DO UPDATE
                SET position = EXCLUDED.position,
                    updated_at = EXCLUDED.updated_at
                WHERE projection_builder_state.position < EXCLUDED.position
                ",
            )
            .bind(&builder_name)
            .bind(offset)
            .bind(position.timestamp)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Checkpoint(format!("Failed to save checkpoint: {e}")))?;

            Ok(())
        })
    }

    fn load_position(
        &self,
        builder_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<EventPosition>> + Send + '_>> {
        let builder_name = builder_name.to_string();
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO projection_builder_state (builder_name, position, updated_at)
                VALUES ($1, 0, now())
                ON CONFLICT (builder_name) DO NOTHING
                ",
            )
            .bind(&builder_name)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Checkpoint(format!("Failed to create checkpoint: {e}")))?;

            let (position, updated_at): (i64, DateTime<Utc>) = sqlx::query_as(
                "SELECT position, updated_at FROM projection_builder_state WHERE builder_name = $1",
            )
            .bind(&builder_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ProjectionError::Checkpoint(format!("Failed to load checkpoint: {e}")))?;

            Ok(to_position(position, updated_at))
        })
    }

    fn reset_position(
        &self,
        builder_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let builder_name = builder_name.to_string();
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO projection_builder_state (builder_name, position, updated_at)
                VALUES ($1, 0, now())
                ON CONFLICT (builder_name) DO UPDATE
                SET position = 0, updated_at = now()
                ",
            )
            .bind(&builder_name)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Checkpoint(format!("Failed to reset checkpoint: {e}")))?;

            tracing::info!(builder = %builder_name, "Projection checkpoint reset");
            Ok(())
        })
    }
}
