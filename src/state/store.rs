//! Tunnel Persistence
//!
//! Durable storage of each tunnel's desired state, so tunnels survive daemon
//! restarts. Records are MessagePack-encoded (rmp-serde) in a redb table keyed
//! by tunnel id.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{ReadableTable, TableDefinition};
use thiserror::Error;
use tracing::{debug, info};

use crate::tunnel::{PersistedTunnel, TunnelStatus};

const TUNNELS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tunnels");

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Filter for [`TunnelStore::find`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TunnelQuery {
    pub status: Option<TunnelStatus>,
    pub auto_reconnect: Option<bool>,
}

impl TunnelQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn matches(&self, record: &PersistedTunnel) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self
                .auto_reconnect
                .map_or(true, |a| record.auto_reconnect == a)
    }
}

/// Durable record store for tunnels
#[async_trait]
pub trait TunnelStore: Send + Sync {
    async fn find_one(&self, id: &str) -> Result<Option<PersistedTunnel>, StoreError>;

    async fn find(&self, query: &TunnelQuery) -> Result<Vec<PersistedTunnel>, StoreError>;

    /// Insert or replace the record with the same id
    async fn upsert(&self, record: &PersistedTunnel) -> Result<(), StoreError>;

    /// Returns whether a record existed
    async fn remove(&self, id: &str) -> Result<bool, StoreError>;
}

/// redb-backed store
pub struct RedbTunnelStore {
    db: redb::Database,
}

impl RedbTunnelStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!("Opening tunnel store at: {:?}", path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = redb::Database::create(path)?;

        // Ensure table exists
        let write_txn = db.begin_write()?;
        {
            let _table = write_txn.open_table(TUNNELS_TABLE)?;
        }
        write_txn.commit()?;

        debug!("Tunnel store initialized");
        Ok(Self { db })
    }
}

#[async_trait]
impl TunnelStore for RedbTunnelStore {
    async fn find_one(&self, id: &str) -> Result<Option<PersistedTunnel>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TUNNELS_TABLE)?;

        match table.get(id)? {
            Some(value) => Ok(Some(rmp_serde::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    async fn find(&self, query: &TunnelQuery) -> Result<Vec<PersistedTunnel>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TUNNELS_TABLE)?;

        let mut results = Vec::new();
        for item in table.iter()? {
            let (_key, value) = item?;
            let record: PersistedTunnel = rmp_serde::from_slice(value.value())?;
            if query.matches(&record) {
                results.push(record);
            }
        }

        debug!("Found {} stored tunnels", results.len());
        Ok(results)
    }

    async fn upsert(&self, record: &PersistedTunnel) -> Result<(), StoreError> {
        let serialized = rmp_serde::to_vec_named(record)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(TUNNELS_TABLE)?;
            table.insert(record.id.as_str(), serialized.as_slice())?;
        }
        write_txn.commit()?;

        debug!("Persisted tunnel {} ({})", record.id, record.status);
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(TUNNELS_TABLE)?;
            let removed = table.remove(id)?;
            removed.is_some()
        };
        write_txn.commit()?;

        debug!("Removed tunnel {} from store (existed: {})", id, existed);
        Ok(existed)
    }
}

/// In-memory store, used when no database is configured
#[derive(Default)]
pub struct MemoryTunnelStore {
    records: RwLock<BTreeMap<String, PersistedTunnel>>,
}

impl MemoryTunnelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TunnelStore for MemoryTunnelStore {
    async fn find_one(&self, id: &str) -> Result<Option<PersistedTunnel>, StoreError> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn find(&self, query: &TunnelQuery) -> Result<Vec<PersistedTunnel>, StoreError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    async fn upsert(&self, record: &PersistedTunnel) -> Result<(), StoreError> {
        self.records
            .write()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(id).is_some())
    }
}
