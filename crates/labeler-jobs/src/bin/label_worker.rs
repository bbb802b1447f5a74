//! Label recalculation daemon.
//!
//! Connects to PostgreSQL, applies migrations, listens for
//! `calculate_labels` / `dataset_new` notifications and recalculates labels
//! one dataset at a time until interrupted.

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use labeler_db::{log_pool_metrics, Database, PoolConfig};
use labeler_jobs::{
    build_evaluator, EventBus, EvaluatorConfig, LabelCalculator, RecalculationController,
    RecalculationWorker, WorkerConfig,
};

const DEFAULT_DATABASE_URL: &str = "postgres://localhost/labeler";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   RUST_LOG    - standard env filter (default: "labeler_jobs=info,labeler_db=info")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let json = log_format == "json";

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "labeler_jobs=info,labeler_db=info,label_worker=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    // File output rotates daily and never carries ANSI colors
    let _file_guard = match log_file.as_deref().map(std::path::Path::new) {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(std::path::Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("label-worker.log");
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            if json {
                registry.with(layer.json()).init();
            } else {
                registry.with(layer).init();
            }
            Some(guard)
        }
        None => {
            if json {
                registry.with(tracing_subscriber::fmt::layer().json()).init();
            } else {
                registry.with(tracing_subscriber::fmt::layer()).init();
            }
            None
        }
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let db = Database::connect_with_config(&database_url, PoolConfig::from_env()).await?;
    db.migrate().await?;
    info!(subsystem = "db", "Database connected and migrated");

    let evaluator_config = EvaluatorConfig::from_env();
    let evaluator = build_evaluator(evaluator_config.clone());
    info!(
        evaluator = evaluator.name(),
        timeout_ms = evaluator_config.timeout.as_millis() as u64,
        memory_limit = evaluator_config.memory_limit,
        "Label function evaluator configured"
    );

    let event_bus_capacity = std::env::var("EVENT_BUS_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(labeler_core::defaults::EVENT_BUS_CAPACITY);
    let events = EventBus::new(event_bus_capacity);

    let controller = Arc::new(RecalculationController::new(
        db.labels.clone(),
        LabelCalculator::new(evaluator),
        events.clone(),
    ));
    let handle = RecalculationWorker::new(controller, WorkerConfig::from_env()).start();

    // Log label events for downstream consumers tailing the output, with the
    // pool's health after each recalculation
    let mut label_events = events.subscribe();
    let pool = db.pool.clone();
    tokio::spawn(async move {
        loop {
            match label_events.recv().await {
                Ok(envelope) => {
                    info!(
                        event_id = %envelope.event_id,
                        event_type = envelope.payload.namespaced_event_type(),
                        dataset_id = envelope.payload.dataset_id(),
                        "Label event published"
                    );
                    log_pool_metrics(&pool);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Label event log lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let listener = db.trigger_listener().await?.spawn(handle.sender());

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
        }
        result = listener => {
            match result {
                Ok(Ok(())) => warn!("Trigger listener stopped"),
                Ok(Err(e)) => error!(error = %e, "Trigger listener failed"),
                Err(e) => error!(error = %e, "Trigger listener panicked"),
            }
        }
    }

    handle.shutdown().await?;
    handle.join().await?;
    info!("Label worker stopped");
    Ok(())
}
