//! Tunnel Actor
//!
//! One task per tunnel owns all of its state. API calls, SSH session events,
//! health sweeps, probe results, reconnect timers and listener log lines all
//! arrive as [`TunnelCommand`]s and are applied one at a time, so transitions
//! of a tunnel are totally ordered.
//!
//! Work that can suspend for long (SSH connect, probes, timers) runs in spawned
//! tasks that report back through the same queue. Their messages carry the
//! connection generation (or the timer token) they belong to; anything from an
//! older attempt is dropped.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::TunnelError;
use super::events::EventEmitter;
use super::health::{self, ISSUE_UNREACHABLE};
use super::listener::{ListenerConfig, LogSink, TunnelListener};
use super::logs::LogBuffer;
use super::reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectState};
use super::types::{
    ConfigSummary, LogLevel, PersistedTunnel, TunnelConfig, TunnelInfo, TunnelSpec,
    TunnelStatus, TunnelStatusReport, TunnelUpdate,
};
use crate::config::EngineSettings;
use crate::ssh::{ConnectedSession, SessionEvent, SshConnector, SshSession};
use crate::state::TunnelStore;

type Reply<T> = oneshot::Sender<Result<T, TunnelError>>;

/// Who asked for a connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOrigin {
    Operator,
    Reconnect,
}

/// Why a reachability probe was started
pub enum ProbePurpose {
    Sweep,
    OnDemand {
        report: Box<TunnelStatusReport>,
        reply: oneshot::Sender<TunnelStatusReport>,
    },
}

pub enum TunnelCommand {
    /// Connect. `spec` replaces name and config first.
    Start {
        spec: Option<TunnelSpec>,
        reply: Reply<TunnelInfo>,
    },
    Close {
        reply: oneshot::Sender<TunnelInfo>,
    },
    Update {
        update: TunnelUpdate,
        reply: Reply<TunnelInfo>,
    },
    CheckStatus {
        reply: oneshot::Sender<TunnelStatusReport>,
    },
    HealthSweep,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    SessionReady {
        generation: u64,
        session: Arc<dyn SshSession>,
    },
    ConnectFailed {
        generation: u64,
        error: TunnelError,
    },
    Session {
        generation: u64,
        event: SessionEvent,
    },
    ReconnectDue {
        token: u64,
    },
    ProbeFinished {
        generation: u64,
        reachable: bool,
        purpose: ProbePurpose,
    },
    Log {
        level: LogLevel,
        message: String,
    },
}

/// Shared collaborators of every tunnel actor
#[derive(Clone)]
pub struct ActorContext {
    pub settings: Arc<EngineSettings>,
    pub connector: Arc<dyn SshConnector>,
    pub store: Arc<dyn TunnelStore>,
    pub events: EventEmitter,
}

/// Initial state of a tunnel actor
pub struct TunnelSeed {
    pub id: String,
    pub name: String,
    pub config: TunnelConfig,
    pub created_at: DateTime<Utc>,
    pub auto_reconnect: bool,
}

impl From<PersistedTunnel> for TunnelSeed {
    fn from(record: PersistedTunnel) -> Self {
        Self {
            id: record.id,
            name: record.name,
            config: record.config,
            created_at: record.created_at,
            auto_reconnect: record.auto_reconnect,
        }
    }
}

/// Cheap, cloneable handle to a running tunnel actor
#[derive(Clone)]
pub struct TunnelHandle {
    id: String,
    tx: mpsc::UnboundedSender<TunnelCommand>,
    snapshot: Arc<RwLock<TunnelInfo>>,
}

impl TunnelHandle {
    pub fn spawn(ctx: ActorContext, seed: TunnelSeed) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = TunnelActor::new(ctx, seed, tx.downgrade());
        let snapshot = actor.snapshot.clone();
        let id = actor.id.clone();
        tokio::spawn(actor.run(rx));
        Self { id, tx, snapshot }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn info(&self) -> TunnelInfo {
        self.snapshot.read().clone()
    }

    pub fn status(&self) -> TunnelStatus {
        self.snapshot.read().status
    }

    fn gone(&self) -> TunnelError {
        TunnelError::NotFound(self.id.clone())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> TunnelCommand,
    ) -> Result<T, TunnelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx.send(make(reply_tx)).map_err(|_| self.gone())?;
        reply_rx.await.map_err(|_| self.gone())
    }

    /// Connect; resolves once the tunnel is connected or the attempt failed
    pub async fn start(&self, spec: Option<TunnelSpec>) -> Result<TunnelInfo, TunnelError> {
        self.request(|reply| TunnelCommand::Start { spec, reply }).await?
    }

    pub async fn close(&self) -> Result<TunnelInfo, TunnelError> {
        self.request(|reply| TunnelCommand::Close { reply }).await
    }

    pub async fn update(&self, update: TunnelUpdate) -> Result<TunnelInfo, TunnelError> {
        self.request(|reply| TunnelCommand::Update { update, reply }).await?
    }

    pub async fn check_status(&self) -> Result<TunnelStatusReport, TunnelError> {
        self.request(|reply| TunnelCommand::CheckStatus { reply }).await
    }

    /// Ask for a background health check; fire and forget
    pub fn sweep(&self) {
        let _ = self.tx.send(TunnelCommand::HealthSweep);
    }

    /// Tear everything down and stop the actor
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| TunnelCommand::Shutdown { reply }).await;
    }
}

struct TunnelActor {
    id: String,
    name: String,
    config: TunnelConfig,
    status: TunnelStatus,
    error: Option<String>,
    created_at: DateTime<Utc>,
    connected_at: Option<Instant>,
    logs: LogBuffer,
    reconnect_attempts: u32,
    auto_reconnect: bool,
    closing_intentionally: bool,
    /// Reached `connected` at least once since the last operator start
    established: bool,

    session: Option<Arc<dyn SshSession>>,
    listener: Option<TunnelListener>,

    generation: u64,
    origin: AttemptOrigin,
    pending_start: Option<Reply<TunnelInfo>>,
    connect_task: Option<JoinHandle<()>>,
    reconnect_token: u64,
    reconnect_timer: Option<JoinHandle<()>>,
    sweep_in_flight: bool,

    policy: ReconnectPolicy,
    ctx: ActorContext,
    self_tx: mpsc::WeakUnboundedSender<TunnelCommand>,
    snapshot: Arc<RwLock<TunnelInfo>>,
}

impl TunnelActor {
    fn new(
        ctx: ActorContext,
        seed: TunnelSeed,
        self_tx: mpsc::WeakUnboundedSender<TunnelCommand>,
    ) -> Self {
        let policy = ReconnectPolicy::from(ctx.settings.as_ref());
        let logs = LogBuffer::new(ctx.settings.log_capacity);
        let mut actor = Self {
            id: seed.id,
            name: seed.name,
            config: seed.config,
            status: TunnelStatus::Disconnected,
            error: None,
            created_at: seed.created_at,
            connected_at: None,
            logs,
            reconnect_attempts: 0,
            auto_reconnect: seed.auto_reconnect,
            closing_intentionally: false,
            established: false,
            session: None,
            listener: None,
            generation: 0,
            origin: AttemptOrigin::Operator,
            pending_start: None,
            connect_task: None,
            reconnect_token: 0,
            reconnect_timer: None,
            sweep_in_flight: false,
            policy,
            ctx,
            self_tx,
            snapshot: Arc::new(RwLock::new(TunnelInfo::default())),
        };
        actor.publish_snapshot();
        actor
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TunnelCommand>) {
        debug!("Tunnel actor {} started", self.id);
        while let Some(cmd) = rx.recv().await {
            let keep_running = self.handle(cmd).await;
            self.publish_snapshot();
            if !keep_running {
                break;
            }
        }
        debug!("Tunnel actor {} stopped", self.id);
    }

    async fn handle(&mut self, cmd: TunnelCommand) -> bool {
        match cmd {
            TunnelCommand::Start { spec, reply } => self.on_start(spec, reply).await,
            TunnelCommand::Close { reply } => {
                self.on_close().await;
                let _ = reply.send(self.info());
            }
            TunnelCommand::Update { update, reply } => {
                let result = self.on_update(update).await;
                let _ = reply.send(result);
            }
            TunnelCommand::CheckStatus { reply } => self.on_check_status(reply).await,
            TunnelCommand::HealthSweep => self.on_sweep().await,
            TunnelCommand::Shutdown { reply } => {
                self.cancel_reconnect();
                self.abort_connect();
                self.teardown().await;
                if let Some(pending) = self.pending_start.take() {
                    let _ = pending.send(Err(TunnelError::NotFound(self.id.clone())));
                }
                let _ = reply.send(());
                return false;
            }
            TunnelCommand::SessionReady {
                generation,
                session,
            } => self.on_session_ready(generation, session).await,
            TunnelCommand::ConnectFailed { generation, error } => {
                self.on_connect_failed(generation, error).await
            }
            TunnelCommand::Session { generation, event } => {
                if generation == self.generation {
                    self.on_session_event(event).await;
                } else {
                    debug!("Dropping stale session event {:?} for {}", event, self.id);
                }
            }
            TunnelCommand::ReconnectDue { token } => self.on_reconnect_due(token).await,
            TunnelCommand::ProbeFinished {
                generation,
                reachable,
                purpose,
            } => self.on_probe_finished(generation, reachable, purpose).await,
            TunnelCommand::Log { level, message } => self.log(level, message),
        }
        true
    }

    // === Operations ===

    async fn on_start(&mut self, spec: Option<TunnelSpec>, reply: Reply<TunnelInfo>) {
        if self.status.is_active() {
            let _ = reply.send(Err(TunnelError::Conflict(format!(
                "Tunnel is already {}",
                self.status
            ))));
            return;
        }

        if let Some(spec) = spec {
            self.name = spec.display_name();
            self.config = spec.config;
        }

        self.cancel_reconnect();
        self.closing_intentionally = false;
        self.auto_reconnect = self.config.auto_reconnect;
        self.reconnect_attempts = 0;
        self.established = false;

        self.log(LogLevel::Info, format!("Creating tunnel: {}", self.name));
        self.pending_start = Some(reply);
        self.begin_connect(AttemptOrigin::Operator).await;
    }

    async fn on_close(&mut self) {
        self.cancel_reconnect();
        self.closing_intentionally = true;
        self.auto_reconnect = false;

        self.log(LogLevel::Info, "Closing tunnel...");
        if self.status == TunnelStatus::Connecting {
            self.abort_connect();
        }
        let had_listener = self.listener.is_some();
        self.teardown().await;
        if had_listener {
            self.log(LogLevel::Info, "Local server closed");
        }

        if let Some(pending) = self.pending_start.take() {
            let _ = pending.send(Err(TunnelError::Connect(
                "Tunnel closed before it connected".into(),
            )));
        }

        self.status = TunnelStatus::Disconnected;
        self.error = None;
        self.log(LogLevel::Info, "Tunnel closed");
        self.persist().await;
        self.broadcast();
    }

    async fn on_update(&mut self, update: TunnelUpdate) -> Result<TunnelInfo, TunnelError> {
        if self.status.is_active() {
            return Err(TunnelError::Conflict(
                "Cannot update a running tunnel. Close it first.".into(),
            ));
        }

        update.apply(&mut self.name, &mut self.config)?;
        self.status = TunnelStatus::Disconnected;
        self.log(LogLevel::Info, "Tunnel configuration updated");
        self.persist().await;
        self.broadcast();
        Ok(self.info())
    }

    async fn on_check_status(&mut self, reply: oneshot::Sender<TunnelStatusReport>) {
        let report = self.status_report();
        if self.status != TunnelStatus::Connected {
            self.finish_status_check(*report, reply, Vec::new()).await;
            return;
        }

        let issues = health::local_issues(self.session.as_ref(), self.listener.as_ref());

        if !issues.is_empty() {
            self.finish_status_check(*report, reply, issues).await;
            return;
        }

        self.spawn_probe(ProbePurpose::OnDemand { report, reply });
    }

    async fn on_sweep(&mut self) {
        if self.status != TunnelStatus::Connected || self.sweep_in_flight {
            return;
        }

        let issues = health::local_issues(self.session.as_ref(), self.listener.as_ref());
        if !issues.is_empty() {
            self.fail_health(&issues).await;
            return;
        }

        self.sweep_in_flight = true;
        self.spawn_probe(ProbePurpose::Sweep);
    }

    // === Connection lifecycle ===

    async fn begin_connect(&mut self, origin: AttemptOrigin) {
        self.abort_connect();
        self.teardown().await;

        self.generation += 1;
        self.origin = origin;
        self.status = TunnelStatus::Connecting;

        let ssh_config = match self.config.to_ssh_config(&self.ctx.settings) {
            Ok(c) => c,
            Err(e) => {
                let generation = self.generation;
                self.on_connect_failed(generation, e).await;
                return;
            }
        };

        self.log(
            LogLevel::Info,
            format!(
                "Connecting to {}@{}:{}...",
                self.config.ssh_user, self.config.ssh_host, self.config.ssh_port
            ),
        );
        self.log(
            LogLevel::Info,
            format!("Using {} authentication", ssh_config.auth.describe()),
        );
        self.persist().await;
        self.broadcast();

        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        let generation = self.generation;
        let connector = self.ctx.connector.clone();
        let timeout = self.ctx.settings.ssh_connect_timeout();

        self.connect_task = Some(tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, connector.connect(&ssh_config)).await;
            let ConnectedSession {
                session,
                mut events,
            } = match result {
                Ok(Ok(connected)) => connected,
                Ok(Err(e)) => {
                    let _ = tx.send(TunnelCommand::ConnectFailed {
                        generation,
                        error: e.into(),
                    });
                    return;
                }
                Err(_) => {
                    let _ = tx.send(TunnelCommand::ConnectFailed {
                        generation,
                        error: TunnelError::Connect("SSH connection timeout".into()),
                    });
                    return;
                }
            };

            if tx
                .send(TunnelCommand::SessionReady {
                    generation,
                    session,
                })
                .is_err()
            {
                return;
            }

            // Relay session events until the session goes away
            while let Some(event) = events.recv().await {
                if tx.send(TunnelCommand::Session { generation, event }).is_err() {
                    break;
                }
            }
        }));
    }

    async fn on_session_ready(&mut self, generation: u64, session: Arc<dyn SshSession>) {
        if generation != self.generation || self.status != TunnelStatus::Connecting {
            debug!("Closing stale session for tunnel {}", self.id);
            session.close().await;
            return;
        }

        self.log(
            LogLevel::Success,
            format!("SSH connection established to {}", self.config.ssh_host),
        );

        let listener_config = ListenerConfig {
            bind_address: self.ctx.settings.bind_address.clone(),
            local_port: self.config.local_port,
            remote_host: self.config.remote_host.clone(),
            remote_port: self.config.remote_port,
            forward_timeout: self.ctx.settings.forward_timeout(),
            probe_grace: self.ctx.settings.probe_grace(),
        };

        self.session = Some(session.clone());
        match TunnelListener::bind(listener_config, session, self.log_sink()).await {
            Ok(listener) => {
                self.listener = Some(listener);
                self.status = TunnelStatus::Connected;
                self.error = None;
                self.reconnect_attempts = 0;
                self.connected_at = Some(Instant::now());
                self.established = true;

                self.log(
                    LogLevel::Success,
                    format!("Tunnel active: {}", self.config.route()),
                );
                if self.origin == AttemptOrigin::Reconnect {
                    self.log(LogLevel::Success, "Reconnection successful");
                }
                self.persist().await;
                self.broadcast();

                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Ok(self.info()));
                }
            }
            Err(e) => {
                self.teardown().await;
                self.fail_attempt(e).await;
            }
        }
    }

    async fn on_connect_failed(&mut self, generation: u64, error: TunnelError) {
        if generation != self.generation || self.status != TunnelStatus::Connecting {
            debug!("Ignoring stale connect failure for {}: {}", self.id, error);
            return;
        }
        self.connect_task = None;
        self.fail_attempt(error).await;
    }

    /// A connect attempt ended without reaching `connected`
    async fn fail_attempt(&mut self, error: TunnelError) {
        let message = error.to_string();
        self.log(LogLevel::Error, format!("SSH connection error: {}", message));
        if self.origin == AttemptOrigin::Reconnect {
            self.log(LogLevel::Error, format!("Reconnection failed: {}", message));
        }

        self.status = TunnelStatus::Error;
        self.error = Some(message);
        self.persist().await;
        self.broadcast();

        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(error.clone()));
        }

        if matches!(error, TunnelError::Config(_)) {
            if self.auto_reconnect {
                self.auto_reconnect = false;
                self.log(
                    LogLevel::Error,
                    "Configuration error is not retryable. Stopping auto-reconnect.",
                );
                self.persist().await;
                self.broadcast();
            }
        } else if self.origin == AttemptOrigin::Reconnect || self.established {
            self.schedule_reconnect().await;
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Ended => {
                self.log(LogLevel::Info, "SSH connection ended by remote");
            }
            SessionEvent::TimedOut => {
                self.log(LogLevel::Error, "SSH connection timeout");
                if self.session.is_some() {
                    self.status = TunnelStatus::Error;
                    self.error = Some("Connection timeout".into());
                    self.persist().await;
                    self.broadcast();
                }
            }
            SessionEvent::Closed { had_error } => {
                if self.closing_intentionally {
                    self.closing_intentionally = false;
                    self.log(LogLevel::Info, "SSH connection closed");
                    if self.status != TunnelStatus::Disconnected {
                        self.status = TunnelStatus::Disconnected;
                        self.persist().await;
                        self.broadcast();
                    }
                    return;
                }
                if self.session.is_none() {
                    debug!("Close event from a torn-down session on {}", self.id);
                    return;
                }

                let reason = if had_error {
                    self.log(LogLevel::Error, "SSH connection closed with error");
                    "Connection closed with error"
                } else {
                    self.log(LogLevel::Warning, "SSH connection closed");
                    "Connection closed unexpectedly"
                };

                self.status = TunnelStatus::Error;
                // A preceding timeout keeps its more specific message
                if self.error.is_none() {
                    self.error = Some(reason.to_string());
                }
                self.teardown().await;
                self.persist().await;
                self.broadcast();
                self.schedule_reconnect().await;
            }
        }
    }

    async fn fail_health(&mut self, issues: &[&str]) {
        let message = issues.join(", ");
        warn!("Tunnel {} health check failed: {}", self.id, message);
        self.log(
            LogLevel::Error,
            TunnelError::HealthCheck(message.clone()).to_string(),
        );

        self.status = TunnelStatus::Error;
        self.error = Some(message);
        self.teardown().await;
        self.persist().await;
        self.broadcast();
        self.schedule_reconnect().await;
    }

    // === Reconnect ===

    async fn schedule_reconnect(&mut self) {
        let decision = self.policy.decide(ReconnectState {
            attempts: self.reconnect_attempts,
            auto_reconnect: self.auto_reconnect,
            closing_intentionally: self.closing_intentionally,
            pending: self.reconnect_timer.is_some(),
        });

        match decision {
            ReconnectDecision::Skip => {}
            ReconnectDecision::Exhausted => {
                self.auto_reconnect = false;
                self.log(
                    LogLevel::Error,
                    format!(
                        "Max reconnection attempts ({}) reached. Stopping auto-reconnect.",
                        self.policy.max_attempts
                    ),
                );
                self.persist().await;
                self.broadcast();
            }
            ReconnectDecision::Schedule { attempt } => {
                let Some(tx) = self.self_tx.upgrade() else {
                    return;
                };
                self.reconnect_attempts = attempt;
                self.log(
                    LogLevel::Warning,
                    format!(
                        "Attempting to reconnect in {} ({}/{})...",
                        self.policy.delay_label(),
                        attempt,
                        self.policy.max_attempts
                    ),
                );

                let token = self.reconnect_token;
                let delay = self.policy.delay;
                self.reconnect_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(TunnelCommand::ReconnectDue { token });
                }));
                self.broadcast();
            }
        }
    }

    async fn on_reconnect_due(&mut self, token: u64) {
        if token != self.reconnect_token {
            debug!("Ignoring revoked reconnect timer for {}", self.id);
            return;
        }
        self.reconnect_timer = None;
        if self.closing_intentionally || !self.auto_reconnect {
            return;
        }

        self.log(LogLevel::Info, format!("Reconnecting tunnel: {}", self.name));
        self.begin_connect(AttemptOrigin::Reconnect).await;
    }

    /// Revoke any armed timer, including one whose message is already queued
    fn cancel_reconnect(&mut self) {
        self.reconnect_token += 1;
        if let Some(timer) = self.reconnect_timer.take() {
            timer.abort();
        }
    }

    // === Health probes ===

    fn spawn_probe(&mut self, purpose: ProbePurpose) {
        let Some(addr) = self.listener.as_ref().map(|l| l.probe_addr()) else {
            return;
        };
        let Some(tx) = self.self_tx.upgrade() else {
            return;
        };
        let generation = self.generation;
        let timeout = self.ctx.settings.probe_timeout();

        tokio::spawn(async move {
            let reachable = health::probe_endpoint(addr, timeout).await;
            let _ = tx.send(TunnelCommand::ProbeFinished {
                generation,
                reachable,
                purpose,
            });
        });
    }

    async fn on_probe_finished(&mut self, generation: u64, reachable: bool, purpose: ProbePurpose) {
        let current = generation == self.generation && self.status == TunnelStatus::Connected;

        match purpose {
            ProbePurpose::Sweep => {
                self.sweep_in_flight = false;
                if !current {
                    return;
                }
                if reachable {
                    debug!("Tunnel {} health check passed", self.id);
                } else {
                    self.fail_health(&[ISSUE_UNREACHABLE]).await;
                }
            }
            ProbePurpose::OnDemand { report, reply } => {
                if !current {
                    let report = self.status_report();
                    self.finish_status_check(*report, reply, Vec::new()).await;
                    return;
                }
                let mut report = *report;
                report.remote_endpoint_reachable = reachable;
                let issues = if reachable {
                    Vec::new()
                } else {
                    vec![ISSUE_UNREACHABLE]
                };
                self.finish_status_check(report, reply, issues).await;
            }
        }
    }

    async fn finish_status_check(
        &mut self,
        mut report: TunnelStatusReport,
        reply: oneshot::Sender<TunnelStatusReport>,
        issues: Vec<&'static str>,
    ) {
        if self.status == TunnelStatus::Connected {
            if issues.is_empty() {
                self.log(
                    LogLevel::Success,
                    "Health check: All systems operational (SSH \u{2713}, Local Port \u{2713}, Remote Endpoint \u{2713})",
                );
            } else {
                let summary = issues.join(", ");
                self.log(
                    LogLevel::Warning,
                    format!("Health check: Issues detected ({})", summary),
                );
                report.health_warning = Some(summary);
                self.fail_health(&issues).await;

                report.status = self.status;
                report.is_connected = false;
                report.has_error = true;
                report.error = self.error.clone();
                report.auto_reconnect = self.auto_reconnect;
                report.reconnect_attempts = self.reconnect_attempts;
            }
        }

        self.ctx.events.emit_health_check(report.clone());
        let _ = reply.send(report);
    }

    fn status_report(&self) -> Box<TunnelStatusReport> {
        let connected = self.status == TunnelStatus::Connected;
        Box::new(TunnelStatusReport {
            id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            is_connected: connected,
            has_error: self.error.is_some(),
            error: self.error.clone(),
            auto_reconnect: self.auto_reconnect,
            reconnect_attempts: self.reconnect_attempts,
            max_reconnect_attempts: self.policy.max_attempts,
            reconnect_delay: self.ctx.settings.reconnect_delay_ms,
            uptime: self
                .connected_at
                .filter(|_| connected)
                .map_or(0, |t| t.elapsed().as_secs()),
            config: ConfigSummary::from(&self.config),
            ssh_connection_alive: connected
                && health::transport_issue(self.session.as_ref()).is_none(),
            local_port_listening: connected
                && health::listener_issue(self.listener.as_ref()).is_none(),
            remote_endpoint_reachable: false,
            health_warning: None,
            stats: self
                .listener
                .as_ref()
                .map(|l| l.stats())
                .unwrap_or_default(),
        })
    }

    // === Plumbing ===

    fn abort_connect(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if self.status == TunnelStatus::Connecting {
            // Results already queued from the aborted attempt become stale
            self.generation += 1;
        }
    }

    /// Stop the listener and close the session. Both are always dropped together.
    async fn teardown(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop().await;
        }
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.connected_at = None;
        self.sweep_in_flight = false;
    }

    fn log_sink(&self) -> LogSink {
        let tx = self.self_tx.clone();
        Arc::new(move |level, message| {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(TunnelCommand::Log { level, message });
            }
        })
    }

    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        let entry = self.logs.push(&self.id, level, message);
        match level {
            LogLevel::Error => error!("[tunnel {}] {}", self.id, entry.message),
            LogLevel::Warning => warn!("[tunnel {}] {}", self.id, entry.message),
            LogLevel::Info | LogLevel::Success => info!("[tunnel {}] {}", self.id, entry.message),
        }
        self.ctx.events.emit_log(entry);
    }

    fn record(&self) -> PersistedTunnel {
        PersistedTunnel {
            id: self.id.clone(),
            name: self.name.clone(),
            config: self.config.clone(),
            status: self.status,
            created_at: self.created_at,
            auto_reconnect: self.auto_reconnect,
            persistent: true,
        }
    }

    /// Store failures never block a transition
    async fn persist(&self) {
        if let Err(e) = self.ctx.store.upsert(&self.record()).await {
            warn!("Failed to persist tunnel {}: {}", self.id, e);
        }
    }

    fn info(&self) -> TunnelInfo {
        TunnelInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            config: self.config.redacted(),
            status: self.status,
            created_at: self.created_at,
            error: self.error.clone(),
            logs: self.logs.to_vec(),
            auto_reconnect: self.auto_reconnect,
            reconnect_attempts: self.reconnect_attempts,
            max_reconnect_attempts: self.policy.max_attempts,
            reconnect_delay: self.ctx.settings.reconnect_delay_ms,
        }
    }

    fn publish_snapshot(&mut self) {
        *self.snapshot.write() = self.info();
    }

    fn broadcast(&mut self) {
        self.publish_snapshot();
        self.ctx.events.emit_update(self.info());
    }
}
