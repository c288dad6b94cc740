//! Salon queue HTTP/WebSocket server.

use anyhow::Context;
use salon_queue::{
    app::{Collaborators, LaneSettings, QueueService, Ticker},
    config::Config,
    distribution::Hub,
    providers::{FixedTravelBuffers, InMemorySlotAvailability, InMemoryStaffDirectory},
    server::{AppState, build_router},
};
use salon_queue_core::environment::SystemClock;
use salon_queue_runtime::metrics::MetricsExporter;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting salon queue server");

    let mut exporter = MetricsExporter::new();
    exporter.install().context("installing metrics exporter")?;
    let exporter = Arc::new(exporter);

    let directory = match &config.queue.staff_roster_path {
        Some(path) => {
            let directory = InMemoryStaffDirectory::from_roster_file(path)
                .with_context(|| format!("loading staff roster from {path}"))?;
            info!(path = %path, staff = directory.len(), "Staff roster loaded");
            directory
        },
        None => {
            warn!("STAFF_ROSTER_PATH not set; every staff event will be dropped");
            InMemoryStaffDirectory::new()
        },
    };

    let collaborators = Collaborators {
        clock: Arc::new(SystemClock),
        directory: Arc::new(directory),
        slots: Arc::new(InMemorySlotAvailability::new()),
        travel: Arc::new(FixedTravelBuffers::new(config.default_travel_buffer())),
    };
    let service = Arc::new(QueueService::new(
        collaborators,
        Arc::new(Hub::with_connection_buffer(config.runtime.connection_buffer)),
        LaneSettings::from_config(&config),
    ));

    let (ticker, stop_ticker) = Ticker::new(Arc::clone(&service), config.tick_interval());
    let ticker = ticker.spawn();

    let app = build_router(AppState::new(Arc::clone(&service)).with_metrics(exporter));

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("HTTP server stopped, draining lanes");
    let _ = stop_ticker.send(true);
    if let Err(error) = ticker.await {
        warn!(%error, "Ticker task failed");
    }
    service.shutdown(config.shutdown_timeout()).await;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            warn!(%error, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(error) => {
                warn!(%error, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
