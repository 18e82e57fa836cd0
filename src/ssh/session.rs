//! SSH session capability
//!
//! The tunnel engine never touches a protocol implementation directly. It asks an
//! [`SshConnector`] for a session, opens forwarded streams through the resulting
//! [`SshSession`], and watches the session's [`SessionEvent`] channel.
//!
//! Liveness is queried through explicit capability methods (`is_alive`,
//! `is_writable`, `is_readable`) rather than by inspecting transport internals.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use super::config::SshConfig;
use super::error::SshError;

/// Byte stream carried over a forwarded SSH channel
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// Outbound stream returned by [`SshSession::forward_out`]
pub type ForwardStream = Box<dyn AsyncReadWrite>;

/// Lifecycle events reported by a live session.
///
/// `ready` and `error` are not events here: they are the `Ok` / `Err` of
/// [`SshConnector::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Remote side ended the connection
    Ended,
    /// Transport stopped responding
    TimedOut,
    /// Session is gone
    Closed { had_error: bool },
}

/// A session that has completed handshake and authentication
pub struct ConnectedSession {
    pub session: Arc<dyn SshSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Connect and authenticate. Resolves once the session is ready.
    async fn connect(&self, config: &SshConfig) -> Result<ConnectedSession, SshError>;
}

#[async_trait]
pub trait SshSession: Send + Sync {
    /// Open an outbound forwarded stream to `host:port` on behalf of `originator`
    async fn forward_out(
        &self,
        originator: SocketAddr,
        host: &str,
        port: u16,
    ) -> Result<ForwardStream, SshError>;

    /// Underlying transport has not been destroyed
    fn is_alive(&self) -> bool;

    /// Session still accepts outgoing requests
    fn is_writable(&self) -> bool;

    /// Session is still receiving from the server
    fn is_readable(&self) -> bool;

    /// Close the session. A `Closed` event follows.
    async fn close(&self);
}
