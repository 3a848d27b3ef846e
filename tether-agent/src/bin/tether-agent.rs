//! Tether agent daemon.
//!
//! Pairs with the backend once, then long-polls for commands and executes
//! them against local projects: registering paths, applying policy decisions,
//! and supervising per-project assistant servers.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_agent::client::BackendClient;
use tether_agent::config::{
    default_state_dir, AgentConfig, Credentials, DEFAULT_BACKEND_URL, POLICIES_FILE, PROJECTS_FILE,
};
use tether_agent::dispatcher::{CommandExecutor, Dispatcher};
use tether_agent::policy::PolicyStore;
use tether_agent::projects::ProjectStore;
use tether_agent::supervisor::{Supervisor, SupervisorConfig};

#[derive(Parser, Debug)]
#[command(name = "tether-agent", version)]
#[command(about = "Tether local agent")]
struct Cli {
    /// Path to tether-agent.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// State directory, overrides the config file
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Backend base URL, overrides the config file
    #[arg(long)]
    backend_url: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Claim a pairing code and store the issued credentials
    Pair {
        /// Pairing code shown in the chat channel
        code: String,

        /// Free-form device description sent with the claim
        #[arg(long, default_value = "tether-agent")]
        device_info: String,
    },
    /// Poll the backend and execute commands
    Run,
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
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };

    let backend_url = cli
        .backend_url
        .clone()
        .or_else(|| config.backend_url.clone())
        .unwrap_or_else(|| DEFAULT_BACKEND_URL.to_string());
    let state_dir = match cli.state_dir.clone().or_else(|| config.state_dir.clone()) {
        Some(dir) => dir,
        None => default_state_dir()?,
    };

    match cli.command {
        Commands::Pair { code, device_info } => pair(&backend_url, &state_dir, &code, &device_info).await,
        Commands::Run => run(&backend_url, &state_dir, config).await,
    }
}

async fn pair(backend_url: &str, state_dir: &std::path::Path, code: &str, device_info: &str) -> Result<()> {
    let claimed = BackendClient::claim_pairing(backend_url, code.trim(), device_info)
        .await
        .context("pairing claim rejected")?;

    let credentials = Credentials {
        agent_id: claimed.agent_id.clone(),
        agent_key: claimed.agent_key,
    };
    credentials.save(state_dir)?;

    info!(
        agent_id = %claimed.agent_id,
        state_dir = %state_dir.display(),
        "Paired; credentials stored"
    );
    Ok(())
}

async fn run(backend_url: &str, state_dir: &std::path::Path, config: AgentConfig) -> Result<()> {
    let credentials = Credentials::load(state_dir)?;

    let projects = ProjectStore::load(state_dir.join(PROJECTS_FILE))
        .map_err(|err| anyhow::anyhow!("{err}"))?;
    let policies = PolicyStore::load(state_dir.join(POLICIES_FILE))
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    let mut supervisor_config = SupervisorConfig::default();
    if let Some(command) = config.server_command {
        supervisor_config.server_command = command;
    }
    supervisor_config.server_args = config.server_args;
    let supervisor = Supervisor::new(supervisor_config).map_err(|err| anyhow::anyhow!("{err}"))?;

    let client = BackendClient::new(backend_url, &credentials.agent_key)
        .context("failed to build backend client")?;
    let executor = CommandExecutor::new(
        credentials.agent_id.clone(),
        projects,
        policies,
        supervisor,
    );
    let dispatcher = Dispatcher::new(client, executor);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    info!(
        agent_id = %credentials.agent_id,
        backend_url = %backend_url,
        "tether-agent running"
    );
    dispatcher.run(shutdown_rx).await;

    info!("tether-agent shut down");
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
