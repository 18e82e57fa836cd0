//! Tunnel Registry
//!
//! The authoritative in-memory map from tunnel id to its actor handle.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::actor::TunnelHandle;

#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, TunnelHandle>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<TunnelHandle> {
        self.tunnels.get(id).map(|entry| entry.value().clone())
    }

    /// Return the handle for `id`, spawning it with `spawn` if absent.
    ///
    /// Concurrent callers for the same id get the same actor.
    pub fn get_or_spawn(&self, id: &str, spawn: impl FnOnce() -> TunnelHandle) -> TunnelHandle {
        match self.tunnels.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(spawn()).value().clone(),
        }
    }

    pub fn remove(&self, id: &str) -> Option<TunnelHandle> {
        self.tunnels.remove(id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tunnels.contains_key(id)
    }

    /// Point-in-time copy of all handles
    pub fn handles(&self) -> Vec<TunnelHandle> {
        self.tunnels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}
