//! Tunnel data model

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::TunnelError;
use super::listener::ForwardStats;
use crate::config::EngineSettings;
use crate::ssh::{AuthMethod, SshConfig};

pub const DEFAULT_TUNNEL_NAME: &str = "Unnamed Tunnel";

const REDACTED: &str = "********";

/// Tunnel lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Error,
}

impl TunnelStatus {
    /// Connecting or connected; such tunnels reject start and update
    pub fn is_active(self) -> bool {
        matches!(self, TunnelStatus::Connecting | TunnelStatus::Connected)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Disconnected => "disconnected",
            TunnelStatus::Error => "error",
        }
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters of a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub ssh_host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<String>,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    #[serde(default)]
    pub auto_reconnect: bool,
}

fn default_ssh_port() -> u16 {
    22
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.ssh_host.trim().is_empty() {
            return Err(TunnelError::Config("SSH host is required".into()));
        }
        if self.ssh_user.trim().is_empty() {
            return Err(TunnelError::Config("SSH user is required".into()));
        }
        if self.remote_host.trim().is_empty() {
            return Err(TunnelError::Config("Remote host is required".into()));
        }
        if self.ssh_port == 0 {
            return Err(TunnelError::Config("SSH port must be non-zero".into()));
        }
        if self.local_port == 0 {
            return Err(TunnelError::Config("Local port must be non-zero".into()));
        }
        if self.remote_port == 0 {
            return Err(TunnelError::Config("Remote port must be non-zero".into()));
        }
        if non_empty(&self.ssh_password).is_none() && non_empty(&self.ssh_key_path).is_none() {
            return Err(TunnelError::Config(
                "No authentication method provided".into(),
            ));
        }
        Ok(())
    }

    /// Key authentication wins when both a key and a password are given
    pub fn auth(&self) -> Result<AuthMethod, TunnelError> {
        if let Some(key_path) = non_empty(&self.ssh_key_path) {
            return Ok(AuthMethod::key(key_path, None));
        }
        if let Some(password) = non_empty(&self.ssh_password) {
            return Ok(AuthMethod::password(password));
        }
        Err(TunnelError::Config(
            "No authentication method provided".into(),
        ))
    }

    pub fn to_ssh_config(&self, settings: &EngineSettings) -> Result<SshConfig, TunnelError> {
        Ok(SshConfig {
            host: self.ssh_host.clone(),
            port: self.ssh_port,
            username: self.ssh_user.clone(),
            auth: self.auth()?,
            ready_timeout: settings.ssh_connect_timeout(),
            keepalive_interval: settings.keepalive_interval(),
            keepalive_max: settings.keepalive_count_max,
        })
    }

    /// Copy safe to hand out of the engine
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if non_empty(&config.ssh_password).is_some() {
            config.ssh_password = Some(REDACTED.to_string());
        }
        config
    }

    /// `localhost:L -> R:P`
    pub fn route(&self) -> String {
        format!(
            "localhost:{} -> {}:{}",
            self.local_port, self.remote_host, self.remote_port
        )
    }
}

/// Input of `create_tunnel`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub config: TunnelConfig,
}

impl TunnelSpec {
    pub fn new(config: TunnelConfig) -> Self {
        Self { name: None, config }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> String {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(DEFAULT_TUNNEL_NAME)
            .to_string()
    }
}

/// Partial update of a stopped tunnel.
///
/// Absent, empty or zero fields keep the old value. An empty password or key
/// path clears that credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelUpdate {
    pub name: Option<String>,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub ssh_user: Option<String>,
    pub ssh_password: Option<String>,
    pub ssh_key_path: Option<String>,
    pub local_port: Option<u16>,
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub auto_reconnect: Option<bool>,
}

impl TunnelUpdate {
    /// Merge into `name` / `config`, then validate the result
    pub fn apply(&self, name: &mut String, config: &mut TunnelConfig) -> Result<(), TunnelError> {
        let mut merged = config.clone();

        fn text(target: &mut String, value: &Option<String>) {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                *target = v.to_string();
            }
        }
        fn port(target: &mut u16, value: Option<u16>) {
            if let Some(p) = value.filter(|p| *p != 0) {
                *target = p;
            }
        }
        fn credential(target: &mut Option<String>, value: &Option<String>) {
            if let Some(v) = value {
                *target = if v.is_empty() { None } else { Some(v.clone()) };
            }
        }

        text(&mut merged.ssh_host, &self.ssh_host);
        text(&mut merged.ssh_user, &self.ssh_user);
        text(&mut merged.remote_host, &self.remote_host);
        port(&mut merged.ssh_port, self.ssh_port);
        port(&mut merged.local_port, self.local_port);
        port(&mut merged.remote_port, self.remote_port);
        credential(&mut merged.ssh_password, &self.ssh_password);
        credential(&mut merged.ssh_key_path, &self.ssh_key_path);
        if let Some(auto) = self.auto_reconnect {
            merged.auto_reconnect = auto;
        }

        merged.validate()?;
        *config = merged;
        text(name, &self.name);
        Ok(())
    }
}

/// Severity of a per-tunnel log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub tunnel_id: String,
    #[serde(rename = "type")]
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Read model of a tunnel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    pub id: String,
    pub name: String,
    pub config: TunnelConfig,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
    pub auto_reconnect: bool,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    /// Milliseconds
    pub reconnect_delay: u64,
}

/// Durable record of a tunnel's desired state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedTunnel {
    pub id: String,
    pub name: String,
    pub config: TunnelConfig,
    pub status: TunnelStatus,
    pub created_at: DateTime<Utc>,
    pub auto_reconnect: bool,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

fn default_persistent() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSummary {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub ssh_host: String,
}

impl From<&TunnelConfig> for ConfigSummary {
    fn from(config: &TunnelConfig) -> Self {
        Self {
            local_port: config.local_port,
            remote_host: config.remote_host.clone(),
            remote_port: config.remote_port,
            ssh_host: config.ssh_host.clone(),
        }
    }
}

/// Result of an on-demand health evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatusReport {
    pub id: String,
    pub name: String,
    pub status: TunnelStatus,
    pub is_connected: bool,
    pub has_error: bool,
    pub error: Option<String>,
    pub auto_reconnect: bool,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: u64,
    /// Seconds since the tunnel last became connected
    pub uptime: u64,
    pub config: ConfigSummary,
    pub ssh_connection_alive: bool,
    pub local_port_listening: bool,
    pub remote_endpoint_reachable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_warning: Option<String>,
    pub stats: ForwardStats,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_config(local_port: u16) -> TunnelConfig {
        TunnelConfig {
            ssh_host: "bastion.example.com".into(),
            ssh_port: 22,
            ssh_user: "deploy".into(),
            ssh_password: Some("hunter2".into()),
            ssh_key_path: None,
            local_port,
            remote_host: "db.internal".into(),
            remote_port: 5432,
            auto_reconnect: true,
        }
    }

    #[test]
    fn test_status_serialization() {
        for (status, text) in [
            (TunnelStatus::Connecting, "\"connecting\""),
            (TunnelStatus::Connected, "\"connected\""),
            (TunnelStatus::Disconnected, "\"disconnected\""),
            (TunnelStatus::Error, "\"error\""),
        ] {
            assert_eq!(serde_json::to_string(&status).unwrap(), text);
        }
        assert!(TunnelStatus::Connecting.is_active());
        assert!(!TunnelStatus::Error.is_active());
    }

    #[test]
    fn test_validate() {
        assert!(sample_config(8080).validate().is_ok());

        let mut config = sample_config(8080);
        config.ssh_password = None;
        assert_eq!(
            config.validate(),
            Err(TunnelError::Config("No authentication method provided".into()))
        );

        let mut config = sample_config(0);
        assert!(config.validate().is_err());
        config.local_port = 8080;
        config.remote_host = " ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_key_wins_over_password() {
        let mut config = sample_config(8080);
        config.ssh_key_path = Some("~/.ssh/id_ed25519".into());
        assert!(matches!(config.auth().unwrap(), AuthMethod::Key { .. }));

        config.ssh_key_path = Some(String::new());
        assert!(matches!(config.auth().unwrap(), AuthMethod::Password { .. }));
    }

    #[test]
    fn test_camel_case_config_with_defaults() {
        let json = r#"{
            "sshHost": "h", "sshUser": "u", "sshKeyPath": "~/.ssh/id",
            "localPort": 9000, "remoteHost": "r", "remotePort": 80
        }"#;
        let config: TunnelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.ssh_port, 22);
        assert!(!config.auto_reconnect);
        assert!(config.validate().is_ok());

        let spec: TunnelSpec =
            serde_json::from_str(&json.replace("{", "{\"name\": \"web\",")).unwrap();
        assert_eq!(spec.display_name(), "web");
        assert_eq!(TunnelSpec::new(config).display_name(), DEFAULT_TUNNEL_NAME);
    }

    #[test]
    fn test_redacted_hides_password() {
        let config = sample_config(8080).redacted();
        assert_eq!(config.ssh_password.as_deref(), Some(REDACTED));
        assert_eq!(config.ssh_user, "deploy");
    }

    #[test]
    fn test_update_merge() {
        let mut name = "old".to_string();
        let mut config = sample_config(8080);

        let update = TunnelUpdate {
            name: Some("new".into()),
            ssh_host: Some(String::new()),
            local_port: Some(9090),
            remote_port: Some(0),
            ssh_key_path: Some("/keys/id".into()),
            ssh_password: Some(String::new()),
            ..Default::default()
        };
        update.apply(&mut name, &mut config).unwrap();

        assert_eq!(name, "new");
        assert_eq!(config.ssh_host, "bastion.example.com");
        assert_eq!(config.local_port, 9090);
        assert_eq!(config.remote_port, 5432);
        assert_eq!(config.ssh_password, None);
        assert_eq!(config.ssh_key_path.as_deref(), Some("/keys/id"));
    }

    #[test]
    fn test_update_rejects_unusable_result() {
        let mut name = "t".to_string();
        let mut config = sample_config(8080);
        let update = TunnelUpdate {
            ssh_password: Some(String::new()),
            ..Default::default()
        };
        assert!(update.apply(&mut name, &mut config).is_err());
        assert_eq!(config.ssh_password.as_deref(), Some("hunter2"));
    }
}
