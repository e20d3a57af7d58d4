//! Per-handler outcomes in `event_handler_state`.

use crate::store::{PostgresEventStore, db_error};
use chrono::{DateTime, Utc};
use eventline_core::event_store::{EventId, EventStoreError};
use eventline_core::handler::{HandlerId, HandlerOutcome, HandlerState, HandlerStateStore};
use sqlx::Row;
use sqlx::postgres::PgRow;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

fn row_to_state(row: &PgRow) -> Result<HandlerState, EventStoreError> {
    let kind: String = row.try_get("outcome").map_err(db_error("decode handler state"))?;
    let reason: Option<String> = row.try_get("reason").map_err(db_error("decode handler state"))?;
    let attempts: i32 = row.try_get("attempts").map_err(db_error("decode handler state"))?;
    Ok(HandlerState {
        outcome: HandlerOutcome::from_parts(&kind, reason)?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        updated_at: row.try_get("updated_at").map_err(db_error("decode handler state"))?,
    })
}

impl HandlerStateStore for PostgresEventStore {
    fn load_states(
        &self,
        event_id: EventId,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<BTreeMap<HandlerId, HandlerState>, EventStoreError>>
                + Send
                + '_,
        >,
    > {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT handler_id, outcome, reason, attempts, updated_at
                FROM event_handler_state
                WHERE event_id = $1
                ",
            )
            .bind(event_id.value())
            .fetch_all(self.pool())
            .await
            .map_err(db_error("load handler states"))?;

            rows.iter()
                .map(|row| {
                    let handler_id: String = row
                        .try_get("handler_id")
                        .map_err(db_error("decode handler state"))?;
                    Ok((HandlerId::new(handler_id), row_to_state(row)?))
                })
                .collect()
        })
    }

    fn record_outcome(
        &self,
        event_id: EventId,
        handler_id: &HandlerId,
        outcome: &HandlerOutcome,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<HandlerState, EventStoreError>> + Send + '_>> {
        let handler_id = handler_id.clone();
        let outcome = outcome.clone();
        Box::pin(async move {
            // Only a transient outcome on record may be replaced.
            let updated = sqlx::query(
                r"
                INSERT INTO event_handler_state
                    (event_id, handler_id, outcome, reason, attempts, updated_at)
                VALUES ($1, $2, $3, $4, 1, $5)
                ON CONFLICT (event_id, handler_id) DO UPDATE
                SET outcome = EXCLUDED.outcome,
                    reason = EXCLUDED.reason,
                    attempts = event_handler_state.attempts + 1,
                    updated_at = EXCLUDED.updated_at
                WHERE event_handler_state.outcome = 'transient_error'
                RETURNING outcome, reason, attempts, updated_at
                ",
            )
            .bind(event_id.value())
            .bind(handler_id.as_str())
            .bind(outcome.as_str())
            .bind(outcome.reason())
            .bind(now)
            .fetch_optional(self.pool())
            .await
            .map_err(db_error("record outcome"))?;

            if let Some(row) = updated {
                return row_to_state(&row);
            }

            tracing::debug!(
                event_id = %event_id,
                handler_id = %handler_id,
                attempted = outcome.as_str(),
                "Terminal outcome already recorded; keeping it"
            );

            let existing = sqlx::query(
                r"
                SELECT outcome, reason, attempts, updated_at
                FROM event_handler_state
                WHERE event_id = $1 AND handler_id = $2
                ",
            )
            .bind(event_id.value())
            .bind(handler_id.as_str())
            .fetch_one(self.pool())
            .await
            .map_err(db_error("record outcome"))?;
            row_to_state(&existing)
        })
    }

    fn delete_states(
        &self,
        event_id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<u64, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM event_handler_state WHERE event_id = $1")
                .bind(event_id.value())
                .execute(self.pool())
                .await
                .map_err(db_error("delete handler states"))?;
            Ok(result.rows_affected())
        })
    }

    fn delete_orphaned_states(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                DELETE FROM event_handler_state s
                WHERE NOT EXISTS (SELECT 1 FROM queued_events q WHERE q.id = s.event_id)
                ",
            )
            .execute(self.pool())
            .await
            .map_err(db_error("delete orphaned handler states"))?;

            let deleted = result.rows_affected();
            if deleted > 0 {
                tracing::info!(deleted, "Removed handler states of finalized events");
            }
            Ok(deleted)
        })
    }
}

