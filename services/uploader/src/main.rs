use anyhow::{Context, Result};
use media_uploader::{
    start_api_server, AppState, Config, Connectivity, ConnectivityMonitor, DurableStore,
    HttpTransport, QueueEngine, ReachabilityProbe, SqliteStore,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        endpoint = %config.endpoint.url,
        "Starting media uploader"
    );

    init_metrics(config.service.metrics_port)?;

    let store: Arc<dyn DurableStore> = Arc::new(
        SqliteStore::new(&config.store)
            .await
            .context("Failed to open queue store")?,
    );

    let transport = Arc::new(
        HttpTransport::new(
            &config.endpoint,
            config.request_timeout(),
            config.connect_timeout(),
        )
        .context("Failed to initialize upload transport")?,
    );

    let monitor = ConnectivityMonitor::new(Connectivity::from(config.connectivity.assume_online));
    let shutdown = CancellationToken::new();

    let probe = ReachabilityProbe::for_endpoint(
        &config.endpoint.url,
        config.probe_interval(),
        config.probe_timeout(),
    )
    .context("Failed to configure reachability probe")?;
    let probe_handle = probe.spawn(monitor.clone(), shutdown.clone());

    // Refuse to start on an unreadable queue rather than overwrite it
    let engine = Arc::new(
        QueueEngine::open(store.clone(), transport, monitor.clone())
            .await
            .context("Failed to load upload queue")?,
    );
    let subscription = engine.watch_connectivity();

    if monitor.is_online() && engine.pending().await > 0 {
        let engine = engine.clone();
        tokio::spawn(async move {
            let outcome = engine.drain().await;
            info!(outcome = ?outcome, "Startup drain finished");
        });
    }

    let api_state = AppState {
        engine: engine.clone(),
        store,
        field_name: config.endpoint.field_name.clone(),
    };

    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Media uploader started successfully");

    shutdown_signal().await;

    info!(pending = engine.pending().await, "Shutting down media uploader");

    shutdown.cancel();
    subscription.unsubscribe();
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }
    probe_handle.abort();

    info!("Media uploader stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
