//! Tunnel Health Check Module
//!
//! Three tiers, cheapest first:
//! 1. SSH transport liveness, read through the session capability
//! 2. Local listener liveness
//! 3. End-to-end reachability: a TCP connect to the forwarding port
//!
//! Tier 3 only runs when 1 and 2 pass. [`HealthMonitor`] sweeps every
//! connected tunnel on a fixed period; the checks themselves run inside the
//! tunnel actor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::listener::TunnelListener;
use super::registry::TunnelRegistry;
use super::types::TunnelStatus;
use crate::ssh::SshSession;

pub const ISSUE_SESSION_MISSING: &str = "SSH connection object missing";
pub const ISSUE_SOCKET_DESTROYED: &str = "SSH socket destroyed";
pub const ISSUE_NOT_WRITABLE: &str = "SSH socket not writable";
pub const ISSUE_NOT_READABLE: &str = "SSH socket not readable";
pub const ISSUE_NOT_LISTENING: &str = "Local port not listening";
pub const ISSUE_UNREACHABLE: &str = "Remote endpoint unreachable";

/// Tier 1. Reports the first failing transport dimension.
pub fn transport_issue(session: Option<&Arc<dyn SshSession>>) -> Option<&'static str> {
    let Some(session) = session else {
        return Some(ISSUE_SESSION_MISSING);
    };
    if !session.is_alive() {
        Some(ISSUE_SOCKET_DESTROYED)
    } else if !session.is_writable() {
        Some(ISSUE_NOT_WRITABLE)
    } else if !session.is_readable() {
        Some(ISSUE_NOT_READABLE)
    } else {
        None
    }
}

/// Tier 2
pub fn listener_issue(listener: Option<&TunnelListener>) -> Option<&'static str> {
    match listener {
        Some(l) if l.is_listening() => None,
        _ => Some(ISSUE_NOT_LISTENING),
    }
}

/// Tiers 1 and 2 combined, in report order
pub fn local_issues(
    session: Option<&Arc<dyn SshSession>>,
    listener: Option<&TunnelListener>,
) -> Vec<&'static str> {
    transport_issue(session)
        .into_iter()
        .chain(listener_issue(listener))
        .collect()
}

/// Tier 3. Connect and immediately hang up.
pub async fn probe_endpoint(addr: SocketAddr, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(e)) => {
            debug!("Health probe to {} failed: {}", addr, e);
            false
        }
        Err(_) => {
            debug!("Health probe to {} timed out", addr);
            false
        }
    }
}

/// Periodic sweep over all connected tunnels
pub struct HealthMonitor {
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn spawn(registry: Arc<TunnelRegistry>, period: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let period = period.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            info!("Health monitor started (every {:?})", period);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        for handle in registry.handles() {
                            if handle.status() == TunnelStatus::Connected {
                                handle.sweep();
                            }
                        }
                    }
                }
            }
            info!("Health monitor stopped");
        });

        Self {
            stop_tx: Mutex::new(Some(stop_tx)),
            task: Mutex::new(Some(task)),
        }
    }

    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map_or(false, |t| !t.is_finished())
    }
}
