//! Kasa Exporter Binary Entry Point
//!
//! Runs discovery, the scrape/prune/push routines and the metrics server.
//! Core functionality is provided by the `kasa_exporter` library crate.

use std::sync::Arc;

use clap::Parser;
use kasa_exporter::{
    collector::{DeviceRegistry, PruneRoutine, PushRoutine, RoutineScheduler, ScrapeRoutine},
    config::{AppConfig, LogFormat},
    device::{
        Discovery,
        catalog::{simulated_catalog, simulated_dimensions, smart_plug_catalog, smart_plug_dimensions},
        kasa::KasaDiscovery,
        simulated::SimulatedDiscovery,
    },
    metrics::Extractor,
    server::{AppState, create_router},
};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::parse();
    init_tracing(config.log_format);

    tracing::info!("Kasa Exporter - Smart Plug Telemetry");
    config.validate()?;

    let metrics = prometheus::Registry::new();

    // Device source and the catalog that describes it
    let tariff = Arc::new(config.load_tariff()?);
    let extra = config.load_extra_metrics()?;
    let (discovery, catalog, dimensions) = if config.simulate {
        tracing::info!(devices = config.simulated_devices, "Running with simulated devices");
        (
            Arc::new(SimulatedDiscovery::new(config.simulated_devices)) as Arc<dyn Discovery>,
            simulated_catalog().merge(extra),
            simulated_dimensions(),
        )
    } else {
        tracing::info!(
            broadcast = %config.discovery_target,
            season = %tariff.season_now(),
            timezone = %tariff.timezone(),
            "Discovering devices on the local network"
        );
        (
            Arc::new(
                KasaDiscovery::new()
                    .with_device_timeout(config.device_timeout)
                    .with_timezone(tariff.timezone()),
            ) as Arc<dyn Discovery>,
            smart_plug_catalog(Arc::clone(&tariff)).merge(extra),
            smart_plug_dimensions(),
        )
    };

    // Catalog validation failures abort startup
    let extractor = Arc::new(Extractor::register_all(&metrics, &catalog, dimensions)?);
    tracing::info!(metrics = extractor.len(), "Registered metric catalog");

    let devices = Arc::new(
        DeviceRegistry::new(discovery, &metrics)?
            .with_credentials(config.credentials())
            .with_options(config.discovery_options())
            .with_staleness_threshold(config.staleness_threshold),
    );

    match devices.discover().await {
        Ok(found) => tracing::info!(devices = found.len(), "Initial discovery complete"),
        Err(e) => tracing::warn!(error = %e, "Initial discovery failed"),
    }

    // Background routines
    let scheduler = RoutineScheduler::new(&metrics).await?;
    scheduler
        .spawn(
            ScrapeRoutine::new(Arc::clone(&devices), Arc::clone(&extractor))
                .with_interval(config.scrape_interval)
                .with_refresh_timeout(config.device_timeout),
        )
        .await?;
    scheduler
        .spawn(
            PruneRoutine::new(Arc::clone(&devices))
                .with_extractor(extractor)
                .with_interval(config.prune_interval),
        )
        .await?;
    match config.push_config() {
        Some(push) => {
            tracing::info!(url = %push.url(), "Pushing metrics to gateway");
            scheduler.spawn(PushRoutine::new(push, metrics.clone())?).await?;
        }
        None => tracing::info!("Push gateway disabled"),
    }
    scheduler.start().await?;
    tracing::info!(routines = scheduler.job_count().await, "Routines started");

    let app = create_router(AppState {
        metrics,
        devices,
    });

    let addr = config.bind_addr()?;
    tracing::info!("Metrics server listening on: http://{}/metrics", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(scheduler))
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Install the global subscriber in the requested format.
fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kasa_exporter=debug".into());

    tracing_subscriber::registry()
        .with(filter)
        .with((format == LogFormat::Text).then(|| fmt::layer()))
        .with((format == LogFormat::Json).then(|| fmt::layer().json()))
        .init();
}

/// Wait for Ctrl+C or SIGTERM, then stop the routines.
async fn shutdown_signal(scheduler: RoutineScheduler) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    tracing::info!("Shutting down routines...");
    if let Err(e) = scheduler.shutdown().await {
        tracing::error!(error = %e, "Failed to shutdown routines");
    }
}
