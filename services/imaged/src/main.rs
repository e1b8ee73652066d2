//! imgstored - image store daemon.
//!
//! Composition root: constructs the catalog, blob store, overlay manager,
//! and worker, wires them together, and serves the HTTP control surface
//! until a termination signal arrives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::{watch, Notify};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use imgstore_daemon::api::{self, AppState};
use imgstore_daemon::config::Config;
use imgstore_daemon::{
    BlobStore, Catalog, OverlayManager, OverlayMounter, StorageLayout, Worker, WorkerConfig,
};

/// Bounded drain window for in-flight HTTP requests after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::parse();
    info!(
        db = %config.db_path.display(),
        store = %config.store_root.display(),
        addr = %config.listen_addr,
        "Starting imgstored"
    );

    let catalog = Arc::new(Catalog::open(&config.db_path)?);
    let layout = StorageLayout::new(&config.store_root);
    layout.init()?;

    let blobs = Arc::new(BlobStore::new(layout.clone(), catalog.clone()));
    let overlay = Arc::new(OverlayManager::new(
        layout.clone(),
        Arc::new(OverlayMounter),
    ));
    let wake = Arc::new(Notify::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = Worker::new(
        catalog.clone(),
        blobs.clone(),
        overlay.clone(),
        layout.clone(),
        wake.clone(),
        WorkerConfig::default(),
    )?;
    let worker_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { worker.run(shutdown).await }
    });

    let state = AppState::new(catalog, blobs, overlay, layout, wake);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn({
        let mut shutdown = shutdown_rx.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
        }
    });

    shutdown_signal().await;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(joined) => joined??,
        Err(_) => warn!("Drain window expired with connections still open"),
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, worker_handle).await.is_err() {
        warn!("Worker did not stop within the drain window");
    }

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
