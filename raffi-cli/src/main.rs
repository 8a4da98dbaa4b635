//! Raffi CLI - local HTTP streaming gateway entry point.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use raffi_core::config::sessions_temp_dir;
use raffi_core::hls::SliceController;
use raffi_core::session::SessionStore;
use raffi_core::torrent::{RqbitClient, TorrentStreamer};
use raffi_core::{CliLogLevel, RaffiConfig, init_tracing, reaper};
use raffi_web::{AppState, cast, run_server};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "raffi")]
#[command(about = "Local HTTP streaming gateway for files, HTTP videos, and magnets")]
struct Cli {
    /// Listen address; RAFFI_SERVER_ADDR overrides the default
    #[arg(long)]
    addr: Option<String>,

    /// Console log level
    #[arg(long, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)?;

    let addr = cli
        .addr
        .or_else(|| std::env::var("RAFFI_SERVER_ADDR").ok())
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| "127.0.0.1:6969".to_string());

    let config = RaffiConfig::from_env();

    let torrent_client = Arc::new(RqbitClient::new(config.torrent.data_dir.clone()).await?);
    let torrents = Arc::new(TorrentStreamer::new(
        torrent_client,
        config.torrent.clone(),
        format!("http://{}", internal_host(&addr)),
    ));
    let controller = SliceController::with_defaults(config.hls.clone());
    let sessions = Arc::new(SessionStore::new());

    let state = AppState::new(
        config.clone(),
        sessions,
        controller.clone(),
        Arc::clone(&torrents),
    );

    reaper::spawn_reaper(controller, MAINTENANCE_INTERVAL);
    cast::spawn_sweeper(state.clone(), MAINTENANCE_INTERVAL);

    // Shutdown: close the swarm client and clear the temp areas.
    let shutdown_torrents = Arc::clone(&torrents);
    let torrent_data_dir = config.torrent.data_dir.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("received shutdown signal, cleaning up");

        shutdown_torrents.shutdown().await;

        for dir in [torrent_data_dir, sessions_temp_dir()] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => tracing::info!(dir = %dir.display(), "removed temp directory"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(dir = %dir.display(), "failed to remove temp directory: {e}"),
            }
        }

        tracing::info!("cleanup complete, exiting");
        std::process::exit(0);
    });

    run_server(&addr, state).await
}

/// The origin the transcoder uses to reach the torrent adapter. A wildcard
/// bind still serves loopback, so internal reads always go through it.
fn internal_host(addr: &str) -> String {
    match addr.strip_prefix("0.0.0.0") {
        Some(port) => format!("127.0.0.1{port}"),
        None => addr.to_string(),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    tracing::warn!("failed to install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
