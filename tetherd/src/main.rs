//! Tether backend daemon.
//!
//! Serves the pairing exchange and the per-agent command queue over HTTP.
//! Agents long-poll for work; the chat adapter enqueues validated commands
//! and picks results up.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tetherd::config::{DaemonConfig, DEFAULT_BIND};
use tetherd::http::{self, AppState};
use tetherd::pairing::PairingService;
use tetherd::queue::CommandQueue;

#[derive(Parser, Debug)]
#[command(name = "tetherd", version)]
#[command(about = "Tether backend daemon")]
struct Cli {
    /// Bind address, overrides the config file
    #[arg(long)]
    bind: Option<String>,

    /// Path to tetherd.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Shared adapter token (or use TETHER_ADAPTER_TOKEN)
    #[arg(long)]
    adapter_token: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };

    let adapter_token = cli
        .adapter_token
        .or_else(|| std::env::var("TETHER_ADAPTER_TOKEN").ok())
        .or(config.adapter_token);
    if adapter_token.is_none() {
        info!("No adapter token configured; the adapter surface is closed");
    }

    let bind = cli
        .bind
        .or(config.bind)
        .unwrap_or_else(|| DEFAULT_BIND.to_string());
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {bind}"))?;

    let state = Arc::new(AppState {
        pairing: PairingService::new(),
        queue: CommandQueue::new(),
        adapter_token,
    });

    let router = http::router(state);

    info!("tetherd listening on {addr}");
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP surface encountered an unrecoverable error")?;

    info!("tetherd shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => tracing::error!("Failed to install SIGTERM handler: {err}"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
