//! API server over a unix socket.

use crate::error::{ApiError, Result};
use crate::routes::create_router;
use skiff_core::Daemon;
use std::path::PathBuf;
use tokio::net::UnixListener;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unix socket path the daemon listens on.
    pub socket_path: PathBuf,
}

/// The daemon's HTTP front-end.
pub struct ApiServer {
    config: ServerConfig,
    daemon: Daemon,
}

impl ApiServer {
    /// Creates a new API server around a running daemon core.
    #[must_use]
    pub fn new(config: ServerConfig, daemon: Daemon) -> Self {
        Self { config, daemon }
    }

    /// Binds the socket and serves requests until the task is aborted.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound.
    pub async fn run(self) -> Result<()> {
        let _ = std::fs::remove_file(&self.config.socket_path);
        if let Some(parent) = self.config.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.config.socket_path).map_err(|e| {
            ApiError::Config(format!(
                "failed to bind socket {}: {}",
                self.config.socket_path.display(),
                e
            ))
        })?;

        tracing::info!(
            socket = %self.config.socket_path.display(),
            "API server listening"
        );

        let app = create_router(self.daemon);
        axum::serve(listener, app)
            .await
            .map_err(|e| ApiError::Server(e.to_string()))
    }
}
