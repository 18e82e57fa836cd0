//! Engine Event System
//!
//! Fire-and-forget fan-out of tunnel state changes to any number of
//! subscribers (API layer, dashboards). Delivery is best effort: a slow
//! subscriber lags and loses events, and sends without subscribers are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::types::{LogEntry, TunnelInfo, TunnelStatusReport};

/// Events published by the tunnel engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A line was appended to a tunnel's log
    Log(LogEntry),
    /// Tunnel snapshot after a state change
    TunnelUpdate(TunnelInfo),
    /// Tunnel was deleted
    TunnelRemoved { id: String },
    /// Result of an on-demand status check
    TunnelHealthCheck(TunnelStatusReport),
}

/// Event emitter for the tunnel engine
///
/// Can be a no-op for tests or when events are not needed.
#[derive(Clone)]
pub struct EventEmitter {
    tx: Option<broadcast::Sender<EngineEvent>>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx: Some(tx) }
    }

    pub fn noop() -> Self {
        Self { tx: None }
    }

    /// Subscribe to engine events. A no-op emitter yields a closed receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        match &self.tx {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(ref tx) = self.tx {
            // No subscribers is not an error
            let _ = tx.send(event);
        }
    }

    pub fn emit_log(&self, entry: LogEntry) {
        self.emit(EngineEvent::Log(entry));
    }

    pub fn emit_update(&self, info: TunnelInfo) {
        self.emit(EngineEvent::TunnelUpdate(info));
    }

    pub fn emit_removed(&self, id: &str) {
        self.emit(EngineEvent::TunnelRemoved { id: id.to_string() });
    }

    pub fn emit_health_check(&self, report: TunnelStatusReport) {
        self.emit(EngineEvent::TunnelHealthCheck(report));
    }
}
