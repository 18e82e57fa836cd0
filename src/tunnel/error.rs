//! Tunnel engine error types

use thiserror::Error;

use crate::ssh::SshError;
use crate::state::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// Rejected before any connection attempt; never retried
    #[error("Invalid tunnel configuration: {0}")]
    Config(String),

    /// Session failed before ready, or the listener could not bind
    #[error("{0}")]
    Connect(String),

    #[error("Forwarding failed: {0}")]
    Forward(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),
}

impl From<SshError> for TunnelError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::KeyError(msg) => TunnelError::Config(format!("Key error: {}", msg)),
            other => TunnelError::Connect(other.to_string()),
        }
    }
}

impl From<StoreError> for TunnelError {
    fn from(err: StoreError) -> Self {
        TunnelError::Storage(err.to_string())
    }
}

impl serde::Serialize for TunnelError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
