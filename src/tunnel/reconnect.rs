//! Tunnel Reconnection Policy
//!
//! Fixed-delay retry with a hard attempt ceiling. The policy only decides; the
//! tunnel actor owns the counter and the timer.

use std::time::Duration;

use crate::config::EngineSettings;

/// Reconnection configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnection attempts
    pub max_attempts: u32,
    /// Delay before every attempt
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            delay: Duration::from_secs(3),
        }
    }
}

impl From<&EngineSettings> for ReconnectPolicy {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            max_attempts: settings.max_reconnect_attempts,
            delay: settings.reconnect_delay(),
        }
    }
}

/// Tunnel state the policy looks at
#[derive(Debug, Clone, Copy)]
pub struct ReconnectState {
    pub attempts: u32,
    pub auto_reconnect: bool,
    pub closing_intentionally: bool,
    /// A timer is already armed
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Intentional close, disabled, or already pending
    Skip,
    /// Ceiling reached; auto-reconnect must be switched off
    Exhausted,
    /// Arm the timer for this attempt number (1-based)
    Schedule { attempt: u32 },
}

impl ReconnectPolicy {
    pub fn decide(&self, state: ReconnectState) -> ReconnectDecision {
        if state.closing_intentionally || !state.auto_reconnect || state.pending {
            return ReconnectDecision::Skip;
        }
        if state.attempts >= self.max_attempts {
            return ReconnectDecision::Exhausted;
        }
        ReconnectDecision::Schedule {
            attempt: state.attempts + 1,
        }
    }

    /// Human form of the delay, e.g. `3s` or `250ms`
    pub fn delay_label(&self) -> String {
        let ms = self.delay.as_millis();
        if ms % 1000 == 0 {
            format!("{}s", ms / 1000)
        } else {
            format!("{}ms", ms)
        }
    }
}
