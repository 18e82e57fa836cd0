//! State persistence using redb + MessagePack (rmp-serde)

pub mod store;

pub use store::{MemoryTunnelStore, RedbTunnelStore, StoreError, TunnelQuery, TunnelStore};
