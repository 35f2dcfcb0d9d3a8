//! Mosaic server — hosts one shared pixel grid over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! mosaic-server [CONFIG.toml]
//! MOSAIC_CONFIG=mosaic.toml mosaic-server
//! RUST_LOG=debug mosaic-server
//! ```
//!
//! Without a config file the server runs a 64×64 in-memory grid on
//! `127.0.0.1:9090` with a 10 second cooldown.

use anyhow::Context;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use mosaic_sync::storage::{PixelStore, RocksStore, StoreConfig};
use mosaic_sync::{GridServer, MosaicConfig, SyncEngine};

/// Config path from the first argument, else `MOSAIC_CONFIG`.
fn config_path() -> Option<PathBuf> {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("MOSAIC_CONFIG").map(PathBuf::from))
}

fn load_config() -> anyhow::Result<MosaicConfig> {
    match config_path() {
        Some(path) => MosaicConfig::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            info!("No config file given, using defaults");
            Ok(MosaicConfig::default())
        }
    }
}

fn build_engine(config: &MosaicConfig) -> anyhow::Result<SyncEngine> {
    let grid = config.grid.clone();
    match &config.server.storage_path {
        Some(path) => {
            let store: Arc<dyn PixelStore> = Arc::new(
                RocksStore::open(
                    StoreConfig {
                        path: path.clone(),
                        ..StoreConfig::default()
                    },
                    grid.dimensions(),
                )
                .with_context(|| format!("failed to open pixel store at {}", path.display()))?,
            );
            Ok(SyncEngine::with_store(grid, store).context("failed to rehydrate grid")?)
        }
        None => {
            warn!("No storage_path configured, the grid will not survive a restart");
            Ok(SyncEngine::new(grid))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    info!("Starting Mosaic server...");

    let config = load_config()?;
    info!(
        "Grid {}x{}, cooldown {}ms, palette: {}",
        config.grid.width,
        config.grid.height,
        config.grid.cooldown_ms,
        config
            .grid
            .palette
            .as_ref()
            .map_or("any color".to_string(), |p| format!("{} colors", p.len()))
    );

    let engine = Arc::new(build_engine(&config)?);
    let server = GridServer::new(engine.clone(), config.server.clone());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {e}");
                return Err(anyhow::anyhow!(e));
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping...");
        }
    }

    engine.flush_persistence().await;
    let stats = engine.stats();
    info!(
        "Stopped at sequence {}: {} commits, {} rate limited, {} unauthorized, {} persistence failures",
        engine.sequence(),
        stats.committed,
        stats.rejected_rate_limited,
        stats.rejected_unauthorized,
        stats.persistence_failures
    );
    Ok(())
}
