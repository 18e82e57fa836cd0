//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. All other components
//! communicate with it via `HandleController` which sends commands through
//! an mpsc channel.
//!
//! The owner task also tracks transport liveness. It polls `Handle::is_closed`
//! and publishes the result into a shared [`TransportState`], so health checks
//! can query liveness without touching the handle or the protocol. The russh
//! handler records why the transport went away in the same state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::session::{ForwardStream, SessionEvent, SshSession};

/// How often the owner task samples the transport
const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (for local forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Transport liveness, shared by the owner task and the russh handler
#[derive(Debug)]
pub struct TransportState {
    alive: AtomicBool,
    writable: AtomicBool,
    readable: AtomicBool,
    close_requested: AtomicBool,
    failed: AtomicBool,
}

impl TransportState {
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            readable: AtomicBool::new(true),
            close_requested: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn mark_closed(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.writable.store(false, Ordering::SeqCst);
        self.readable.store(false, Ordering::SeqCst);
    }

    /// The transport ended because of an error rather than a clean disconnect
    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.mark_closed();
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn request_close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::SeqCst)
    }
}

impl Default for TransportState {
    fn default() -> Self {
        Self::new()
    }
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the Sender). Every clone has full control over the
/// SSH connection, so controllers never leave the process.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    transport: Arc<TransportState>,
}

impl HandleController {
    /// Open a direct-tcpip channel (for local forward)
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

#[async_trait]
impl SshSession for HandleController {
    async fn forward_out(
        &self,
        originator: SocketAddr,
        host: &str,
        port: u16,
    ) -> Result<ForwardStream, SshError> {
        let channel = self
            .open_direct_tcpip(
                host,
                u32::from(port),
                &originator.ip().to_string(),
                u32::from(originator.port()),
            )
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    fn is_alive(&self) -> bool {
        self.transport.alive.load(Ordering::SeqCst) && self.is_connected()
    }

    fn is_writable(&self) -> bool {
        self.transport.writable.load(Ordering::SeqCst) && self.is_connected()
    }

    fn is_readable(&self) -> bool {
        self.transport.readable.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.disconnect().await;
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending
/// commands. `transport` is the state the handle's [`ClientHandler`] writes to;
/// the final `Closed` event is reported on `events_tx`.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    label: String,
    transport: Arc<TransportState>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let transport_for_task = transport.clone();

    tokio::spawn(async move {
        let handle = handle;
        let mut poll = tokio::time::interval(LIVENESS_POLL_INTERVAL);

        info!("Handle owner task started for {}", label);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenDirectTcpip {
                        host,
                        port,
                        originator_host,
                        originator_port,
                        reply_tx,
                    }) => {
                        let result = handle
                            .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                            .await;
                        if reply_tx.send(result).is_err() {
                            warn!("Caller dropped before receiving direct_tcpip result");
                        }
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for {}", label);
                        transport_for_task.request_close();
                        break;
                    }
                    None => {
                        info!("All controllers dropped for {}", label);
                        transport_for_task.request_close();
                        break;
                    }
                },

                _ = poll.tick() => {
                    if handle.is_closed() {
                        warn!("SSH transport closed for {}", label);
                        break;
                    }
                }
            }
        }

        // === Cleanup phase ===
        transport_for_task.mark_closed();
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Tunnel closed", "en")
            .await;

        let had_error = transport_for_task.has_failed() && !transport_for_task.close_requested();
        let _ = events_tx.send(SessionEvent::Closed { had_error });
        debug!("Handle owner task terminated for {}", label);
    });

    HandleController { cmd_tx, transport }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
