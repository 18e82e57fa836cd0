//! Tunnel Engine
//!
//! Local port forwarding over SSH with health monitoring, automatic
//! reconnection and durable tunnel records.
//!
//! ```text
//! TunnelManager ──▶ TunnelRegistry ──▶ TunnelHandle ──mpsc──▶ TunnelActor
//!                        ▲                                     │   │
//!                  HealthMonitor                     TunnelListener  SshSession
//! ```

pub mod actor;
pub mod error;
pub mod events;
pub mod health;
pub mod listener;
pub mod logs;
pub mod manager;
pub mod reconnect;
pub mod registry;
pub mod types;

pub use actor::TunnelHandle;
pub use error::TunnelError;
pub use events::{EngineEvent, EventEmitter};
pub use health::HealthMonitor;
pub use listener::{ForwardStats, TunnelListener};
pub use manager::TunnelManager;
pub use reconnect::ReconnectPolicy;
pub use registry::TunnelRegistry;
pub use types::{
    LogEntry, LogLevel, PersistedTunnel, TunnelConfig, TunnelInfo, TunnelSpec, TunnelStatus,
    TunnelStatusReport, TunnelUpdate,
};
