use bouncer_worker::{
    app_state::AppState,
    config::WorkerConfig,
    db,
    routes,
    services::{
        broker::{Backoff, RedisBroker},
        bundle::{BundleSettings, ScriptBundler},
        import::PgImportStore,
        tool::{BouncerTool, ToolSettings},
    },
    worker::Worker,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting bouncer conversion worker");

    if let Err(e) = run().await {
        tracing::error!(error = %e, "Worker exited with error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = WorkerConfig::from_env()?;

    let prometheus_handle = Arc::new(PrometheusBuilder::new().install_recorder()?);
    routes::metrics::describe();

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    tracing::info!(host = %config.db_host, port = config.db_port, "Connecting to PostgreSQL");
    let pool_size = (config.task_prefetch + config.model_prefetch) as u32 + 2;
    let db_pool = db::init_pool(config.db_connect_options(), pool_size).await?;

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool).await?;

    tracing::info!("Connecting to broker");
    let Some(broker) = connect_broker(&config, &shutdown).await else {
        tracing::info!("Shutdown requested before the broker became reachable");
        return Ok(());
    };

    let tool = BouncerTool::new(ToolSettings::from(&config));
    let importer = PgImportStore::new(db_pool, config.db_durability);
    let bundler = ScriptBundler::new(BundleSettings::from(&config));
    if config.bundler_path.is_none() {
        tracing::warn!("BUNDLER_PATH is not set; bundled conversions will fail");
    }

    let metrics_addr = config.metrics_addr.clone();
    let state = AppState::new(
        config,
        Arc::new(broker),
        Arc::new(tool),
        Arc::new(importer),
        Arc::new(bundler),
    );

    let app = routes::router(state.clone(), prometheus_handle);
    let listener = tokio::net::TcpListener::bind(&metrics_addr).await?;
    tracing::info!("Health and metrics listening on {}", metrics_addr);
    let http_shutdown = shutdown.clone();
    let http = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    Worker::new(state).run(shutdown.clone()).await;

    shutdown.cancel();
    http.await??;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Connect to Redis, retrying with backoff until it succeeds or shutdown is requested.
async fn connect_broker(config: &WorkerConfig, shutdown: &CancellationToken) -> Option<RedisBroker> {
    let mut backoff = Backoff::default();
    loop {
        match RedisBroker::connect(&config.broker_url, &config.worker_name).await {
            Ok(broker) => return Some(broker),
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::error!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Broker unreachable"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn watch_signals(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received, no longer accepting jobs");
    shutdown.cancel();
}
