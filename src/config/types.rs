//! Configuration Types
//!
//! Daemon settings and the tunnel engine's tunables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Root configuration file structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Config format version for migrations
    #[serde(default = "default_version")]
    pub version: u32,

    /// `tracing` filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Tunnel database; `~/.oxidetunnel/tunnels.redb` when unset
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Broadcast channel capacity for engine events
    #[serde(default = "default_event_buffer_capacity")]
    pub event_buffer_capacity: usize,

    /// Start every saved tunnel when the daemon boots
    #[serde(default)]
    pub restore_on_startup: bool,

    #[serde(default)]
    pub engine: EngineSettings,
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_event_buffer_capacity() -> usize {
    256
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            log_filter: default_log_filter(),
            database_path: None,
            event_buffer_capacity: default_event_buffer_capacity(),
            restore_on_startup: false,
            engine: EngineSettings::default(),
        }
    }
}

/// Tunables of the tunnel engine. All durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub health_check_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Window in which an accepted connection that closes without data is
    /// treated as a health probe
    pub probe_grace_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub ssh_connect_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub keepalive_count_max: usize,
    pub forward_timeout_ms: u64,
    /// Entries kept in each tunnel's log buffer
    pub log_capacity: usize,
    pub bind_address: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 5000,
            probe_timeout_ms: 5000,
            probe_grace_ms: 100,
            reconnect_delay_ms: 3000,
            max_reconnect_attempts: 100,
            ssh_connect_timeout_ms: 20000,
            keepalive_interval_ms: 5000,
            keepalive_count_max: 3,
            forward_timeout_ms: 10000,
            log_capacity: 50,
            bind_address: "127.0.0.1".to_string(),
        }
    }
}

impl EngineSettings {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_grace(&self) -> Duration {
        Duration::from_millis(self.probe_grace_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.ssh_connect_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }
}
