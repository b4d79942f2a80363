//! `arrival`: runs a standalone Arrival server.
//!
//! Usage: `arrival [CONFIG_PATH]`. Without a path the config lives at
//! `~/.arrival/server.json` and is written with defaults on first run.

mod logging;
mod paths;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use arrival_network::{ArrivalServer, ServerConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = logging::init_logging()?;

    let config_path = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => paths::config_path()?,
    };
    let config = load_config(&config_path)?;

    let mut server = ArrivalServer::new(config);
    let addr = server
        .start()
        .await
        .context("Failed to start the Arrival server")?;
    info!("Arrival server listening on {addr} (config: {})", config_path.display());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    server.stop();
    Ok(())
}

/// Load the server config, seeding the file with defaults when it is absent.
fn load_config(path: &Path) -> Result<ServerConfig> {
    if path.exists() {
        return ServerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }

    let config = ServerConfig::default();
    match config.save_to_file(path) {
        Ok(()) => info!("Wrote default config to {}", path.display()),
        Err(e) => warn!("Could not write default config to {}: {e}", path.display()),
    }
    Ok(config)
}
