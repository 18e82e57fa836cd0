//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Whether this error is a timeout, either ours or one reported by the server.
    ///
    /// Forward timeouts are usually probe artifacts and are not logged as errors.
    pub fn is_timeout(&self) -> bool {
        match self {
            SshError::Timeout(_) => true,
            SshError::IoError(e) => e.kind() == std::io::ErrorKind::TimedOut,
            SshError::ChannelError(msg) | SshError::ProtocolError(msg) => {
                msg.to_ascii_lowercase().contains("timed out")
            }
            _ => false,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::KeepaliveTimeout | russh::Error::InactivityTimeout => {
                SshError::Timeout(err.to_string())
            }
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}

impl serde::Serialize for SshError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
