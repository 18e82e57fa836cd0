//! SSH Client implementation using russh

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::config::{expand_home, AuthMethod, SshConfig};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, TransportState};
use super::session::{ConnectedSession, SessionEvent, SshConnector};

/// Production connector backed by russh
#[derive(Debug, Default, Clone)]
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, config: &SshConfig) -> Result<ConnectedSession, SshError> {
        let addr = format!("{}:{}", config.host, config.port);
        let label = format!("{}@{}", config.username, addr);

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(config.keepalive_interval),
            keepalive_max: config.keepalive_max,
            ..Default::default()
        };

        let (events_tx, events) = mpsc::unbounded_channel();
        let transport = Arc::new(TransportState::new());
        let handler = ClientHandler::new(
            config.host.clone(),
            config.port,
            transport.clone(),
            events_tx.clone(),
        );

        let mut handle = tokio::time::timeout(
            config.ready_timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| SshError::Timeout("Connection timed out".to_string()))?
        .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed");

        let authenticated = match &config.auth {
            AuthMethod::Password { password } => handle
                .authenticate_password(&config.username, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                let key = russh::keys::load_secret_key(expand_home(key_path), passphrase.as_deref())
                    .map_err(|e| SshError::KeyError(e.to_string()))?;

                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

                handle
                    .authenticate_publickey(&config.username, key_with_hash)
                    .await
                    .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(SshError::AuthenticationFailed(
                "Authentication rejected by server".to_string(),
            ));
        }

        info!("SSH authentication successful for {}", label);

        let controller = spawn_handle_owner_task(handle, label, transport, events_tx);

        Ok(ConnectedSession {
            session: Arc::new(controller),
            events,
        })
    }
}

/// Client handler for russh callbacks. Every server key is accepted and logged.
pub struct ClientHandler {
    host: String,
    port: u16,
    transport: Arc<TransportState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        transport: Arc<TransportState>,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            host,
            port,
            transport,
            events_tx,
        }
    }

    /// Server sent a disconnect message
    fn remote_ended(&self) {
        self.transport.mark_closed();
        if !self.transport.close_requested() {
            info!("SSH connection to {}:{} ended by server", self.host, self.port);
            let _ = self.events_tx.send(SessionEvent::Ended);
        }
    }

    /// Transport broke; keepalive and inactivity timeouts are reported as `TimedOut`
    fn transport_failed(&self, err: SshError) {
        if self.transport.close_requested() {
            debug!("SSH transport to {}:{} closed: {}", self.host, self.port, err);
            self.transport.mark_closed();
            return;
        }
        warn!("SSH transport to {}:{} failed: {}", self.host, self.port, err);
        self.transport.mark_failed();
        if err.is_timeout() {
            let _ = self.events_tx.send(SessionEvent::TimedOut);
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Accepting {} host key for {}:{}",
            server_public_key.algorithm().as_str(),
            self.host,
            self.port
        );
        Ok(true)
    }

    async fn disconnected(
        &mut self,
        reason: client::DisconnectReason<Self::Error>,
    ) -> Result<(), Self::Error> {
        match reason {
            client::DisconnectReason::ReceivedDisconnect(_) => self.remote_ended(),
            client::DisconnectReason::Error(err) => self.transport_failed(err),
        }
        Ok(())
    }
}
