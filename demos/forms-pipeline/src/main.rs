//! Forms pipeline worker.
//!
//! Runs the event manager, the cleanup loop, the submission stats projection
//! and a periodic queue health report until Ctrl+C.

use anyhow::Context;
use chrono::Utc;
use eventline_core::environment::SystemClock;
use eventline_core::event_store::EventStore;
use eventline_postgres::PostgresEventStore;
use eventline_projections::{PostgresProjectionCheckpoint, ProjectionRunner};
use eventline_runtime::backoff::pause;
use eventline_runtime::health::check_queue;
use eventline_runtime::metrics::MetricsServer;
use eventline_runtime::{EventManager, EventQueue, HealthReport, Pipeline};
use forms_pipeline::{AppConfig, LogMailer, SubmissionStats, registry};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,eventline=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting forms pipeline");

    let config = AppConfig::from_env();
    info!(
        workers = config.pipeline.workers,
        metrics_addr = %config.metrics_addr,
        abandoned_timeout_secs = config.pipeline.abandoned_timeout.as_secs(),
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.metrics_addr);
    metrics.start().context("Failed to start metrics server")?;

    info!("Connecting to event store database...");
    let pg = PostgresEventStore::connect(&config.database_url, config.max_connections)
        .await
        .context("Failed to connect to the event store")?;
    pg.migrate().await.context("Event store migrations failed")?;

    let checkpoint = PostgresProjectionCheckpoint::new(pg.pool().clone());
    checkpoint
        .migrate()
        .await
        .context("Projection checkpoint migrations failed")?;
    info!("Event store connected");

    let store: Arc<dyn EventStore> = Arc::new(pg.clone());
    let queue = EventQueue::new(
        Arc::clone(&store),
        Arc::new(SystemClock),
        config.pipeline.queue_config(),
    );
    let manager = EventManager::new(
        queue.clone(),
        Arc::new(pg),
        registry(Arc::new(LogMailer)).context("Invalid handler registry")?,
        config.pipeline.manager_config(),
    );

    let runner = ProjectionRunner::new(SubmissionStats::new(), store, Arc::new(checkpoint))
        .with_batch_size(config.pipeline.projection_batch_size)
        .with_backoff(config.pipeline.projection_backoff());

    let mut pipeline = Pipeline::new();
    pipeline.spawn_event_manager(Arc::new(manager), config.pipeline.workers);

    let shutdown = pipeline.shutdown_signal();
    pipeline.spawn(format!("projection:{}", SubmissionStats::NAME), async move {
        runner.run(shutdown).await;
    });

    let mut shutdown = pipeline.shutdown_signal();
    let backlog_threshold = config.backlog_threshold;
    pipeline.spawn("health", async move {
        loop {
            let report = HealthReport::new(
                vec![check_queue(&queue, backlog_threshold).await],
                Utc::now(),
            );
            info!(status = %report.status, "Health report");
            if pause(HEALTH_INTERVAL, &mut shutdown).await {
                break;
            }
        }
    });

    info!(tasks = pipeline.task_count(), "Pipeline running; press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutdown requested");
    pipeline.shutdown_and_join().await;
    info!("Forms pipeline stopped");
    Ok(())
}
