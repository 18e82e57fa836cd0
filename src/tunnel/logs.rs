//! Per-tunnel log buffer

use std::collections::VecDeque;

use chrono::Utc;

use super::types::{LogEntry, LogLevel};

/// Bounded FIFO of user-facing log entries
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full
    pub fn push(&mut self, tunnel_id: &str, level: LogLevel, message: impl Into<String>) -> LogEntry {
        let entry = LogEntry {
            tunnel_id: tunnel_id.to_string(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        };
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());
        entry
    }

    pub fn to_vec(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
