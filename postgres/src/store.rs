//! Queue, log and idempotency tables.

use chrono::{DateTime, Utc};
use eventline_core::event::SerializedEvent;
use eventline_core::event_store::{
    EventId, EventStore, EventStoreError, IdempotencyRecord, LogEntry, QueueStats, QueueStatus,
    QueuedEvent, UnitOfWork,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::future::Future;
use std::pin::Pin;

const QUEUED_COLUMNS: &str =
    "id, event_type, schema_version, payload, metadata, status, created_at, updated_at";

const LOG_COLUMNS: &str =
    "id, event_type, schema_version, payload, metadata, created_at, finalized_at";

/// Map a driver error, logging it and counting it per operation.
pub(crate) fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> EventStoreError {
    move |e| {
        tracing::warn!(operation, error = %e, "Event store query failed");
        metrics::counter!("eventline_store_errors_total", "operation" => operation).increment(1);
        EventStoreError::DatabaseError(format!("{operation}: {e}"))
    }
}

fn to_u64(count: i64) -> u64 {
    u64::try_from(count).unwrap_or(0)
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// `PostgreSQL`-backed event store.
///
/// Cheap to clone; clones share the pool.
#[derive(Clone, Debug)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Connect with a pool of at most 10 connections.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, EventStoreError> {
        Self::connect(database_url, 10).await
    }

    /// Connect with an explicit pool size.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if the connection fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_error("connect"))?;
        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the pipeline tables if they don't exist.
    ///
    /// Migrations applied by other crates against the same database are
    /// tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), EventStoreError> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(&self.pool)
            .await
            .map_err(|e| EventStoreError::DatabaseError(format!("Migration failed: {e}")))?;
        tracing::info!("Event pipeline migrations applied");
        Ok(())
    }

    fn row_to_queued(row: &PgRow) -> Result<QueuedEvent, EventStoreError> {
        let status: String = row.try_get("status").map_err(db_error("decode queued row"))?;
        Ok(QueuedEvent {
            id: EventId::new(row.try_get("id").map_err(db_error("decode queued row"))?),
            event: Self::row_to_event(row)?,
            status: QueueStatus::parse(&status)?,
            created_at: row.try_get("created_at").map_err(db_error("decode queued row"))?,
            lease_updated_at: row.try_get("updated_at").map_err(db_error("decode queued row"))?,
        })
    }

    fn row_to_log_entry(row: &PgRow) -> Result<LogEntry, EventStoreError> {
        Ok(LogEntry {
            id: EventId::new(row.try_get("id").map_err(db_error("decode log row"))?),
            event: Self::row_to_event(row)?,
            created_at: row.try_get("created_at").map_err(db_error("decode log row"))?,
            finalized_at: row.try_get("finalized_at").map_err(db_error("decode log row"))?,
        })
    }

    fn row_to_event(row: &PgRow) -> Result<SerializedEvent, EventStoreError> {
        let event_type: String = row.try_get("event_type").map_err(db_error("decode event"))?;
        let schema_version: i32 = row.try_get("schema_version").map_err(db_error("decode event"))?;
        let payload: Vec<u8> = row.try_get("payload").map_err(db_error("decode event"))?;
        let metadata: Option<serde_json::Value> =
            row.try_get("metadata").map_err(db_error("decode event"))?;
        Ok(SerializedEvent::new(event_type, payload, metadata).with_schema_version(schema_version))
    }
}

/// A transaction exposed as a unit of work.
///
/// Dropping it without committing rolls the transaction back.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl UnitOfWork for PostgresUnitOfWork {
    fn publish(
        &mut self,
        event: SerializedEvent,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<QueuedEvent, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let (id,): (i64,) = sqlx::query_as(
                r"
                INSERT INTO queued_events
                    (event_type, schema_version, payload, metadata, status, created_at, updated_at)
                VALUES ($1, $2, $3, $4, 'pending', $5, $5)
                RETURNING id
                ",
            )
            .bind(&event.event_type)
            .bind(event.schema_version)
            .bind(&event.data)
            .bind(&event.metadata)
            .bind(now)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db_error("publish"))?;

            Ok(QueuedEvent {
                id: EventId::new(id),
                event,
                status: QueueStatus::Pending,
                created_at: now,
                lease_updated_at: now,
            })
        })
    }

    fn guard(
        &mut self,
        record: IdempotencyRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO idempotency_records (event_id, sub_task, event_kind, status, completed_at)
                VALUES ($1, $2, $3, 'completed', $4)
                ON CONFLICT (event_id, sub_task) DO NOTHING
                ",
            )
            .bind(record.event_id.value())
            .bind(&record.sub_task)
            .bind(&record.event_kind)
            .bind(record.completed_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error("guard"))?;
            Ok(())
        })
    }

    fn commit(
        self: Box<Self>,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventStoreError>> + Send>> {
        Box::pin(async move { self.tx.commit().await.map_err(db_error("commit")) })
    }
}

impl EventStore for PostgresEventStore {
    fn begin(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn UnitOfWork>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let tx = self.pool.begin().await.map_err(db_error("begin"))?;
            let uow: Box<dyn UnitOfWork> = Box::new(PostgresUnitOfWork { tx });
            Ok(uow)
        })
    }

    fn claim_next(
        &self,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueuedEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                WITH claimable AS (
                    SELECT id
                    FROM queued_events
                    WHERE status = 'pending'
                       OR (status = 'processing' AND updated_at < $2)
                    ORDER BY id
                    LIMIT 1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE queued_events q
                SET status = 'processing', updated_at = $1
                FROM claimable
                WHERE q.id = claimable.id
                RETURNING q.id, q.event_type, q.schema_version, q.payload, q.metadata,
                          q.status, q.created_at, q.updated_at
                ",
            )
            .bind(now)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("claim"))?;

            row.as_ref().map(Self::row_to_queued).transpose()
        })
    }

    fn unclaim(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE queued_events SET status = 'pending' WHERE id = $1 AND status = 'processing'",
            )
            .bind(id.value())
            .execute(&self.pool)
            .await
            .map_err(db_error("unclaim"))?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn finalize(
        &self,
        id: EventId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                WITH moved AS (
                    DELETE FROM queued_events
                    WHERE id = $1
                    RETURNING id, event_type, schema_version, payload, metadata, created_at
                )
                INSERT INTO event_log
                    (id, event_type, schema_version, payload, metadata, status, created_at, finalized_at)
                SELECT id, event_type, schema_version, payload, metadata, 'completed', created_at, $2
                FROM moved
                ON CONFLICT (id) DO NOTHING
                ",
            )
            .bind(id.value())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error("finalize"))?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn load_queued(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<QueuedEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {QUEUED_COLUMNS} FROM queued_events WHERE id = $1"))
                .bind(id.value())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("load queued"))?;
            row.as_ref().map(Self::row_to_queued).transpose()
        })
    }

    fn list_queued(
        &self,
        status: Option<QueueStatus>,
        after: EventId,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<QueuedEvent>, EventStoreError>> + Send + '_>>
    {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                SELECT {QUEUED_COLUMNS} FROM queued_events
                WHERE id > $1 AND ($3::TEXT IS NULL OR status = $3)
                ORDER BY id
                LIMIT $2
                "
            ))
            .bind(after.value())
            .bind(to_limit(limit))
            .bind(status.as_ref().map(QueueStatus::as_str))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list queued"))?;
            rows.iter().map(Self::row_to_queued).collect()
        })
    }

    fn load_log_entry(
        &self,
        id: EventId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<LogEntry>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {LOG_COLUMNS} FROM event_log WHERE id = $1"))
                .bind(id.value())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("load log entry"))?;
            row.as_ref().map(Self::row_to_log_entry).transpose()
        })
    }

    fn read_log_after(
        &self,
        after: EventId,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<LogEntry>, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                r"
                SELECT {LOG_COLUMNS} FROM event_log
                WHERE id > $1
                  AND id < COALESCE((SELECT min(id) FROM queued_events), id + 1)
                ORDER BY id
                LIMIT $2
                "
            ))
            .bind(after.value())
            .bind(to_limit(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("read log"))?;
            rows.iter().map(Self::row_to_log_entry).collect()
        })
    }

    fn is_guarded(
        &self,
        event_id: EventId,
        sub_task: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, EventStoreError>> + Send + '_>> {
        let sub_task = sub_task.to_string();
        Box::pin(async move {
            let (exists,): (bool,) = sqlx::query_as(
                r"
                SELECT EXISTS(
                    SELECT 1 FROM idempotency_records WHERE event_id = $1 AND sub_task = $2
                )
                ",
            )
            .bind(event_id.value())
            .bind(&sub_task)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("is guarded"))?;
            Ok(exists)
        })
    }

    fn queue_stats(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<QueueStats, EventStoreError>> + Send + '_>> {
        Box::pin(async move {
            let (pending, processing, abandoned, archived): (i64, i64, i64, i64) = sqlx::query_as(
                r"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'pending'),
                    COUNT(*) FILTER (WHERE status = 'processing' AND updated_at >= $1),
                    COUNT(*) FILTER (WHERE status = 'processing' AND updated_at < $1),
                    (SELECT COUNT(*) FROM event_log)
                FROM queued_events
                ",
            )
            .bind(stale_before)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("queue stats"))?;

            Ok(QueueStats {
                pending: to_u64(pending),
                processing: to_u64(processing),
                abandoned: to_u64(abandoned),
                archived: to_u64(archived),
            })
        })
    }
}
