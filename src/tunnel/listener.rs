//! Port-Forward Listener
//!
//! Forwards connections from a local port to a remote host:port through SSH.
//!
//! The health monitor connects to the same port to test reachability, so every
//! accepted connection is first classified: a peer that closes without sending
//! anything inside the grace window is a probe and stays out of the tunnel log.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::error::TunnelError;
use super::types::LogLevel;
use crate::ssh::{SshError, SshSession};

/// Receives user-facing log lines produced by the listener
pub type LogSink = Arc<dyn Fn(LogLevel, String) + Send + Sync>;

/// What the listener binds and where it forwards to
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_address: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub forward_timeout: Duration,
    pub probe_grace: Duration,
}

/// Statistics for a port forward
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardStats {
    /// Real connections handled
    pub connection_count: u64,
    /// Accepted sockets still open
    pub active_connections: u64,
    /// Connections classified as health probes
    pub probe_count: u64,
    /// Total bytes sent (client -> server)
    pub bytes_sent: u64,
    /// Total bytes received (server -> client)
    pub bytes_received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionKind {
    Probe,
    Traffic,
}

/// Handle to a running listener
pub struct TunnelListener {
    bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RwLock<ForwardStats>>,
}

impl TunnelListener {
    /// Bind the local port and start accepting
    pub async fn bind(
        config: ListenerConfig,
        session: Arc<dyn SshSession>,
        log: LogSink,
    ) -> Result<Self, TunnelError> {
        let local_addr = format!("{}:{}", config.bind_address, config.local_port);
        let listener = TcpListener::bind(&local_addr)
            .await
            .map_err(|e| bind_error(&local_addr, e))?;

        let bound_addr = listener.local_addr().map_err(|e| {
            TunnelError::Connect(format!("Failed to get bound address: {}", e))
        })?;

        info!(
            "Started tunnel listener: {} -> {}:{}",
            bound_addr, config.remote_host, config.remote_port
        );

        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let stats = Arc::new(RwLock::new(ForwardStats::default()));

        let task = tokio::spawn(accept_loop(
            listener,
            config,
            session,
            log,
            running.clone(),
            stop_rx,
            stats.clone(),
        ));

        Ok(Self {
            bound_addr,
            running,
            stop_tx,
            task: Mutex::new(Some(task)),
            stats,
        })
    }

    /// Stop accepting, drop open connections and wait until the port is released
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) && self.task.lock().is_none() {
            return;
        }
        info!("Stopping tunnel listener on {}", self.bound_addr);
        let _ = self.stop_tx.try_send(());

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Listener task for {} ended abnormally: {}", self.bound_addr, e);
            }
        }
    }

    /// Accept loop is alive
    pub fn is_listening(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self
                .task
                .lock()
                .as_ref()
                .map_or(false, |t| !t.is_finished())
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Address a local probe should connect to
    pub fn probe_addr(&self) -> SocketAddr {
        let ip = match self.bound_addr.ip() {
            ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, self.bound_addr.port())
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

fn bind_error(local_addr: &str, e: std::io::Error) -> TunnelError {
    let msg = match e.kind() {
        std::io::ErrorKind::AddrInUse => format!(
            "Port already in use: {}. Another application may be using this port.",
            local_addr
        ),
        std::io::ErrorKind::PermissionDenied => format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            local_addr
        ),
        std::io::ErrorKind::AddrNotAvailable => format!(
            "Address not available: {}. The specified address is not valid on this system.",
            local_addr
        ),
        _ => format!("Failed to bind to {}: {}", local_addr, e),
    };
    TunnelError::Connect(msg)
}

async fn accept_loop(
    listener: TcpListener,
    config: ListenerConfig,
    session: Arc<dyn SshSession>,
    log: LogSink,
    running: Arc<AtomicBool>,
    mut stop_rx: mpsc::Receiver<()>,
    stats: Arc<RwLock<ForwardStats>>,
) {
    let config = Arc::new(config);
    // Dropping the set aborts in-flight connections
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                debug!("Tunnel listener on port {} stopped by request", config.local_port);
                break;
            }

            Some(_) = connections.join_next(), if !connections.is_empty() => {}

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }

                        // Disable Nagle's algorithm for low-latency forwarding
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        stats.write().active_connections += 1;

                        connections.spawn(handle_connection(
                            stream,
                            peer_addr,
                            config.clone(),
                            session.clone(),
                            log.clone(),
                            stats.clone(),
                        ));
                    }
                    Err(e) => {
                        error!("Accept error on port {}: {}", config.local_port, e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    connections.shutdown().await;
    stats.write().active_connections = 0;
    debug!("Tunnel listener task for port {} exited", config.local_port);
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ListenerConfig>,
    session: Arc<dyn SshSession>,
    log: LogSink,
    stats: Arc<RwLock<ForwardStats>>,
) {
    let (kind, forward) = tokio::join!(
        classify(&stream, config.probe_grace),
        async {
            match tokio::time::timeout(
                config.forward_timeout,
                session.forward_out(peer_addr, &config.remote_host, config.remote_port),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(SshError::Timeout("Forward request timed out".to_string())),
            }
        }
    );

    match kind {
        ConnectionKind::Probe => stats.write().probe_count += 1,
        ConnectionKind::Traffic => {
            stats.write().connection_count += 1;
            log(
                LogLevel::Info,
                format!("New connection to localhost:{}", config.local_port),
            );
        }
    }

    let mut remote = match forward {
        Ok(remote) => remote,
        Err(e) => {
            if kind == ConnectionKind::Probe || e.is_timeout() {
                debug!("Forward from {} dropped quietly: {}", peer_addr, e);
            } else {
                log(LogLevel::Error, TunnelError::Forward(e.to_string()).to_string());
            }
            release(&stats);
            return;
        }
    };

    if kind == ConnectionKind::Probe {
        release(&stats);
        return;
    }

    match tokio::io::copy_bidirectional(&mut stream, &mut remote).await {
        Ok((sent, received)) => {
            let mut s = stats.write();
            s.bytes_sent += sent;
            s.bytes_received += received;
        }
        Err(e) => debug!("Forward connection from {} ended: {}", peer_addr, e),
    }
    release(&stats);
}

fn release(stats: &RwLock<ForwardStats>) {
    let mut s = stats.write();
    s.active_connections = s.active_connections.saturating_sub(1);
}

/// A peer that closes or errors before the grace window ends is a probe
async fn classify(stream: &TcpStream, grace: Duration) -> ConnectionKind {
    let mut buf = [0u8; 1];
    match tokio::time::timeout(grace, stream.peek(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => ConnectionKind::Probe,
        Ok(Ok(_)) | Err(_) => ConnectionKind::Traffic,
    }
}
