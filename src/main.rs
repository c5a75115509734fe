//! Strata - per-device display composer service
//!
//! Runs the composer on the headless display backend and serves clients
//! over a Unix socket.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use strata::backend::{HeadlessHwc, HeadlessRenderEngine};
use strata::clock::Nsecs;
use strata::config::Config;
use strata::hwc::{HwComposer, HwcDisplayId};
use strata::ipc::IpcServer;
use strata::render::RenderEngine;
use strata::service::Composer;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "strata=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Strata composer");

    let config = Config::load().context("Failed to load configuration")?;

    let hwc = HeadlessHwc::new(&config.display).context("Failed to start headless display")?;

    // Starting blocks until the primary display is up
    let composer = {
        let hwc = Arc::clone(&hwc) as Arc<dyn HwComposer>;
        tokio::task::spawn_blocking(move || {
            Composer::start(
                config,
                hwc,
                Box::new(|| Ok(Box::new(HeadlessRenderEngine::new()) as Box<dyn RenderEngine>)),
            )
        })
        .await
        .context("Composer startup panicked")?
        .context("Failed to start composer")?
    };
    let composer = Arc::new(composer);

    let weak = Arc::downgrade(&composer);
    hwc.set_vsync_callback(Arc::new(move |display: HwcDisplayId, timestamp: Nsecs| {
        if let Some(composer) = weak.upgrade() {
            composer.on_vsync_received(display, timestamp);
        }
    }));

    let ipc = IpcServer::new(Arc::clone(&composer))
        .start()
        .await
        .context("Failed to start IPC server")?;

    // Setup signal handlers for graceful shutdown
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully");
            }
        }
    }

    ipc.close();
    let stopping = Arc::clone(&composer);
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.shutdown()).await {
        error!("Shutdown failed: {}", e);
    }
    hwc.stop();
    info!("Strata stopped");
    Ok(())
}
