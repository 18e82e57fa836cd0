//! OxideTunnel - SSH port-forwarding tunnel engine
//!
//! Keeps local ports forwarded to remote endpoints through SSH, watches their
//! health and reconnects them when the transport drops.

pub mod config;
pub mod ssh;
pub mod state;
pub mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{AppConfig, ConfigStorage, StorageError};
use ssh::RusshConnector;
use state::{RedbTunnelStore, StoreError};
use tunnel::{EngineEvent, EventEmitter, TunnelError, TunnelManager};

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] StorageError),

    #[error("Failed to open tunnel database at {path:?}: {source}")]
    Database {
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("Tunnel engine error: {0}")]
    Engine(#[from] TunnelError),

    #[error("Signal handling failed: {0}")]
    Signal(#[from] std::io::Error),
}

/// Initialize logging. `RUST_LOG` overrides the configured filter.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Run the engine until Ctrl-C
pub async fn run() -> Result<(), StartupError> {
    let storage = ConfigStorage::new()?;
    let app_config = storage.load().await?;
    init_logging(&app_config.log_filter);

    tracing::info!("Starting OxideTunnel...");
    tracing::info!("Config file: {:?}", storage.path());

    let manager = build_manager(&app_config)?;
    spawn_event_logger(&manager);

    manager.load_tunnels_from_db().await?;
    if app_config.restore_on_startup {
        let restored = manager.restore_tunnels().await?;
        tracing::info!("Restored {} tunnels on startup", restored);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    manager.close_all().await;
    Ok(())
}

fn build_manager(app_config: &AppConfig) -> Result<TunnelManager, StartupError> {
    let db_path = match &app_config.database_path {
        Some(path) => path.clone(),
        None => config::database_file()?,
    };
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(StorageError::Io)?;
    }

    let store = RedbTunnelStore::open(&db_path).map_err(|source| StartupError::Database {
        path: db_path.clone(),
        source,
    })?;
    tracing::info!("Tunnel database: {:?}", db_path);

    Ok(TunnelManager::new(
        app_config.engine.clone(),
        Arc::new(RusshConnector::new()),
        Arc::new(store),
        EventEmitter::new(app_config.event_buffer_capacity),
    ))
}

/// Without a UI attached, status changes are only traced
fn spawn_event_logger(manager: &TunnelManager) {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(EngineEvent::TunnelUpdate(info)) => {
                    tracing::debug!("Tunnel {} is {}", info.id, info.status);
                }
                Ok(EngineEvent::TunnelRemoved { id }) => {
                    tracing::debug!("Tunnel {} removed", id);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Event logger skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
