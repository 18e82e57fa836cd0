//! Configuration Management Module
//!
//! Loads the daemon configuration file and exposes the tunnel engine's
//! tunables.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, database_file, ConfigStorage, StorageError};
pub use types::{AppConfig, EngineSettings, CONFIG_VERSION};
