use anyhow::Context;
use commissary_print_queue::api::{self, ApiState};
use commissary_print_queue::config::AppConfig;
use commissary_print_queue::queue::QueueManager;
use commissary_print_queue::reconciler::Reconciler;
use commissary_print_queue::sentry_init;
use commissary_print_queue::telemetry::{TelemetryCollector, TelemetryReporter};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Structured logging to stdout, plus a daily rolling file when `log_dir` is
/// set. Events at error level are forwarded to Sentry as well.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let stdout = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "print-queue.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .with(sentry_tracing::layer())
        .init();

    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;

    let _log_guard = init_tracing(config.log_dir.as_deref());

    info!("========================================");
    info!("Print Queue Service Starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("========================================");

    // Must stay alive for the lifetime of the process
    let _sentry_guard = sentry_init::init();

    let db_path = config.database_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
    }

    let queue = Arc::new(
        QueueManager::new(db_path.clone(), config.retry.initial_settings())
            .await
            .context("Failed to initialize queue manager")?
            .with_retry_policy(Arc::new(config.retry.policy())),
    );
    info!("Database initialized at: {:?}", db_path);

    let telemetry = Arc::new(TelemetryCollector::new());
    let _telemetry_listener = telemetry.clone().attach(queue.subscribe());
    let _reporter = TelemetryReporter::new(telemetry.clone(), queue.clone())
        .start_reporting(config.telemetry_report_interval_secs);

    let reconciler = Arc::new(Reconciler::new(queue.clone()).with_telemetry(telemetry.clone()));
    let reconciler_task =
        reconciler.start(Duration::from_secs(config.reconcile_interval_secs));

    let state = ApiState {
        history: commissary_print_queue::history::HistoryView::new(queue.clone()),
        queue,
        telemetry,
        media_types: Arc::new(config.media_types.clone()),
        callback_mode: config.callback_mode,
        cors_origins: Arc::new(config.cors_origins.clone()),
        start_time: Instant::now(),
    };

    api::start_api_server(&config.bind_addr, state, shutdown_signal())
        .await
        .with_context(|| format!("HTTP API server on {} failed", config.bind_addr))?;

    reconciler_task.abort();
    info!("Print Queue Service stopped");
    Ok(())
}
