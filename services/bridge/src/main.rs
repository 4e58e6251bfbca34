use anyhow::{Context, Result};
use std::sync::Arc;
use swiflet_bridge::config::Config;
use swiflet_bridge::upload_api::{start_api_server, AppState};
use swiflet_bridge::{
    CommandPublisher, ConnectionManager, Databases, ObjectStorageGateway, PgContentRecords,
    PgDeviceRegistry, S3ObjectStore, TelemetryIngestor, TimescaleSensorStore, UploadCoordinator,
    UploadValidator,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Swiflet bridge"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let databases = Databases::connect(&config.database, &config.timescale)
        .await
        .context("Failed to initialize databases")?;

    let object_store = Arc::new(
        S3ObjectStore::new(&config.s3)
            .await
            .context("Failed to initialize S3 object store")?,
    );

    let gateway = Arc::new(ObjectStorageGateway::new(
        object_store,
        UploadValidator::new(&config.upload),
    ));
    let coordinator = Arc::new(UploadCoordinator::new(
        gateway,
        config.compensation_timeout(),
    ));

    let shutdown = CancellationToken::new();

    // Raced against the broker retry so a signal during startup still shuts down cleanly
    let stop_requested = shutdown_signal();
    tokio::pin!(stop_requested);

    // Broker connection; failure here degrades to uploads only
    let (mqtt, inbound) = ConnectionManager::new(config.mqtt.clone());
    let mqtt = Arc::new(mqtt);

    let connected = tokio::select! {
        result = mqtt.connect_with_retry(config.mqtt.connect_max_attempts) => result,
        _ = &mut stop_requested => {
            info!("Shutdown requested while connecting to MQTT broker");
            mqtt.disconnect().await;
            databases.close().await;
            return Ok(());
        }
    };

    let telemetry_enabled = match connected {
        Ok(()) => true,
        Err(e) => {
            warn!(
                error = %e,
                broker = %config.mqtt.broker,
                "MQTT unavailable, running with telemetry disabled"
            );
            false
        }
    };

    let (commands, ingest_handle) = if telemetry_enabled {
        let ingestor = TelemetryIngestor::new(
            Arc::new(PgDeviceRegistry::new(databases.postgres.clone())),
            Arc::new(TimescaleSensorStore::new(databases.timescale.clone())),
        );

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { ingestor.run(inbound, token).await });

        let commands = Arc::new(CommandPublisher::new(
            mqtt.clone(),
            config.mqtt.command_topic_template.clone(),
        ));

        (Some(commands), Some(handle))
    } else {
        drop(inbound);
        (None, None)
    };

    // Create API state
    let api_state = AppState {
        coordinator,
        records: Arc::new(PgContentRecords::new(databases.postgres.clone())),
        commands,
        presigned_url_expiry: config.presigned_url_expiry(),
        max_upload_bytes: config.upload.max_file_bytes.max(config.upload.max_document_bytes),
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.clone();
    let api_handle = tokio::spawn(async move {
        let stop = async move { api_shutdown.cancelled().await };
        if let Err(e) = start_api_server(api_state, &api_config, stop).await {
            error!(error = %e, "API server error");
        }
    });

    info!(telemetry_enabled, "Swiflet bridge started successfully");

    // Wait for shutdown signal
    stop_requested.await;

    info!("Shutting down Swiflet bridge");

    // Broker first so no new telemetry arrives while the rest stops
    mqtt.disconnect().await;
    shutdown.cancel();

    if let Some(handle) = ingest_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "Telemetry ingestion task failed");
        }
    }
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    databases.close().await;

    info!("Swiflet bridge stopped");

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
