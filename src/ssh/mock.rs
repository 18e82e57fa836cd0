//! Scripted SSH capability for engine tests

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::config::SshConfig;
use super::error::SshError;
use super::session::{ConnectedSession, ForwardStream, SessionEvent, SshConnector, SshSession};

/// Outcome of one scripted connect call
#[derive(Debug, Clone)]
pub enum MockPlan {
    Succeed,
    Fail(String),
    /// Private key cannot be loaded
    BadKey(String),
    /// Never resolves; exercises the connect timeout
    Hang,
}

pub struct MockConnector {
    plan: Mutex<VecDeque<MockPlan>>,
    fallback: MockPlan,
    connects: AtomicUsize,
    sessions: Mutex<Vec<Arc<MockSession>>>,
}

impl MockConnector {
    /// Every connect succeeds
    pub fn new() -> Arc<Self> {
        Self::with_fallback(MockPlan::Succeed)
    }

    /// Scripted outcomes are used first, then `fallback` forever
    pub fn with_fallback(fallback: MockPlan) -> Arc<Self> {
        Arc::new(Self {
            plan: Mutex::new(VecDeque::new()),
            fallback,
            connects: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, plan: MockPlan) {
        self.plan.lock().push_back(plan);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Most recently established session
    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.sessions.lock().last().cloned()
    }
}

#[async_trait]
impl SshConnector for MockConnector {
    async fn connect(&self, _config: &SshConfig) -> Result<ConnectedSession, SshError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plan
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match plan {
            MockPlan::Succeed => {
                let (events_tx, events) = mpsc::unbounded_channel();
                let session = Arc::new(MockSession::new(events_tx));
                self.sessions.lock().push(session.clone());
                Ok(ConnectedSession { session, events })
            }
            MockPlan::Fail(msg) => Err(SshError::ConnectionFailed(msg)),
            MockPlan::BadKey(msg) => Err(SshError::KeyError(msg)),
            MockPlan::Hang => {
                std::future::pending::<()>().await;
                Err(SshError::Disconnected)
            }
        }
    }
}

pub struct MockSession {
    alive: AtomicBool,
    writable: AtomicBool,
    readable: AtomicBool,
    closed: AtomicBool,
    forward_error: Mutex<Option<String>>,
    forwards: AtomicUsize,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl MockSession {
    fn new(events_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            alive: AtomicBool::new(true),
            writable: AtomicBool::new(true),
            readable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            forward_error: Mutex::new(None),
            forwards: AtomicUsize::new(0),
            events_tx,
        }
    }

    /// Transport destroyed without any event
    pub fn destroy_socket(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
    }

    /// Server drops the connection
    pub fn drop_connection(&self) {
        self.mark_dead();
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(SessionEvent::Ended);
            let _ = self.events_tx.send(SessionEvent::Closed { had_error: true });
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Make every subsequent forward fail with `msg`
    pub fn fail_forwards(&self, msg: &str) {
        *self.forward_error.lock() = Some(msg.to_string());
    }

    pub fn forward_count(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.writable.store(false, Ordering::SeqCst);
        self.readable.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl SshSession for MockSession {
    async fn forward_out(
        &self,
        _originator: SocketAddr,
        _host: &str,
        _port: u16,
    ) -> Result<ForwardStream, SshError> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        if let Some(msg) = self.forward_error.lock().clone() {
            return Err(SshError::ChannelError(msg));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(SshError::Disconnected);
        }

        // Remote end echoes everything back
        let (near, far) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(far);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        });
        Ok(Box::new(near))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::SeqCst)
    }

    fn is_readable(&self) -> bool {
        self.readable.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.mark_dead();
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(SessionEvent::Closed { had_error: false });
        }
    }
}
