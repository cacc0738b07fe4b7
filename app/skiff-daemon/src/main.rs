use anyhow::{Context, Result};
use clap::Parser;
use skiff_api::{ApiServer, ServerConfig};
use skiff_core::{Daemon, DaemonConfig, DefaultNameGenerator};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod dev;
mod settings;

use dev::{DevFactory, DevKeys, DevSessions, DevVault, NoBlueprints};
use settings::FileSettingsStore;

#[derive(Debug, Parser)]
#[command(name = "skiffd")]
#[command(author, version, about = "Skiff control-plane daemon", long_about = None)]
pub struct DaemonArgs {
    /// Unix socket path for the API (default: <data-dir>/skiffd.sock).
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Data directory for durable daemon state.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Cache directory (legacy registry location is read from here).
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Default SSH username for new instances.
    #[arg(long, default_value = "ubuntu")]
    pub ssh_username: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skiff=info,skiffd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(DaemonArgs::parse()).await
}

async fn run(args: DaemonArgs) -> Result<()> {
    info!("Starting skiffd...");

    let data_dir = resolve_data_dir(args.data_dir.as_ref());
    let cache_dir = args.cache_dir.clone().unwrap_or_else(|| data_dir.join("cache"));
    std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

    let pid_file = data_dir.join("skiffd.pid");
    std::fs::write(&pid_file, format!("{}\n", std::process::id()))
        .context("Failed to write PID file")?;

    let socket_path = args.socket.unwrap_or_else(|| data_dir.join("skiffd.sock"));

    let config = DaemonConfig {
        data_directory: data_dir.clone(),
        cache_directory: cache_dir,
        ssh_username: args.ssh_username,
        factory: Arc::new(DevFactory),
        vault: Arc::new(DevVault::open(&data_dir)),
        blueprint_provider: Arc::new(NoBlueprints),
        name_generator: Arc::new(DefaultNameGenerator),
        ssh_key_provider: Arc::new(DevKeys::generate()),
        session_factory: Arc::new(DevSessions),
        settings: Arc::new(FileSettingsStore::open(&data_dir)),
        image_refresh_interval: skiff_core::config::IMAGE_REFRESH_INTERVAL,
    };

    let daemon = Daemon::new(config)
        .await
        .context("Failed to initialize the daemon core")?;

    info!(data_dir = %data_dir.display(), "Daemon core initialized");

    let api_server = ApiServer::new(
        ServerConfig {
            socket_path: socket_path.clone(),
        },
        daemon,
    );
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            tracing::error!("API server error: {}", e);
        }
    });

    println!("skiffd started");
    println!("  API socket: {}", socket_path.display());
    println!("  Data:       {}", data_dir.display());

    shutdown_signal().await;
    info!("Shutdown signal received");

    api_handle.abort();

    for path in [&socket_path, &pid_file] {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    info!("skiffd stopped");
    Ok(())
}

fn resolve_data_dir(data_dir: Option<&PathBuf>) -> PathBuf {
    data_dir.cloned().unwrap_or_else(|| {
        dirs::home_dir()
            .map(|home| home.join(".skiff"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/skiff"))
    })
}

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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
