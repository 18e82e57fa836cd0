//! Tunnel Manager
//!
//! Public face of the engine. Owns the registry, the health monitor and the
//! shared collaborators; every per-tunnel operation is delegated to that
//! tunnel's actor.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use super::actor::{ActorContext, TunnelHandle, TunnelSeed};
use super::error::TunnelError;
use super::events::{EngineEvent, EventEmitter};
use super::health::HealthMonitor;
use super::registry::TunnelRegistry;
use super::types::{PersistedTunnel, TunnelInfo, TunnelSpec, TunnelStatusReport, TunnelUpdate};
use crate::config::EngineSettings;
use crate::ssh::SshConnector;
use crate::state::{TunnelQuery, TunnelStore};

pub struct TunnelManager {
    ctx: ActorContext,
    registry: Arc<TunnelRegistry>,
    monitor: HealthMonitor,
}

impl TunnelManager {
    /// Build the engine and start the health monitor. Must run inside a tokio runtime.
    pub fn new(
        settings: EngineSettings,
        connector: Arc<dyn SshConnector>,
        store: Arc<dyn TunnelStore>,
        events: EventEmitter,
    ) -> Self {
        let registry = Arc::new(TunnelRegistry::new());
        let monitor = HealthMonitor::spawn(registry.clone(), settings.health_check_interval());
        Self {
            ctx: ActorContext {
                settings: Arc::new(settings),
                connector,
                store,
                events,
            },
            registry,
            monitor,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.ctx.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }

    fn spawn_handle(&self, seed: TunnelSeed) -> TunnelHandle {
        let ctx = self.ctx.clone();
        let id = seed.id.clone();
        self.registry.get_or_spawn(&id, move || TunnelHandle::spawn(ctx, seed))
    }

    /// Registry handle, falling back to the stored record
    async fn resolve(&self, id: &str) -> Result<TunnelHandle, TunnelError> {
        if let Some(handle) = self.registry.get(id) {
            return Ok(handle);
        }
        let record = self
            .ctx
            .store
            .find_one(id)
            .await?
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;
        Ok(self.spawn_handle(TunnelSeed::from(record)))
    }

    /// Create and connect a tunnel. Resolves once it is connected.
    pub async fn create_tunnel(
        &self,
        spec: TunnelSpec,
        id: Option<String>,
    ) -> Result<TunnelInfo, TunnelError> {
        spec.config.validate()?;
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let handle = match self.registry.get(&id) {
            Some(handle) => handle,
            None => {
                let created_at = match self.ctx.store.find_one(&id).await {
                    Ok(Some(record)) => record.created_at,
                    Ok(None) => Utc::now(),
                    Err(e) => {
                        warn!("Failed to look up stored tunnel {}: {}", id, e);
                        Utc::now()
                    }
                };
                self.spawn_handle(TunnelSeed {
                    id: id.clone(),
                    name: spec.display_name(),
                    config: spec.config.clone(),
                    created_at,
                    auto_reconnect: spec.config.auto_reconnect,
                })
            }
        };

        handle.start(Some(spec)).await
    }

    /// Close a tunnel and disable its auto-reconnect
    pub async fn close_tunnel(&self, id: &str) -> Result<TunnelInfo, TunnelError> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;
        handle.close().await
    }

    /// Reconnect a stopped tunnel using its saved configuration
    pub async fn start_tunnel(&self, id: &str) -> Result<TunnelInfo, TunnelError> {
        self.resolve(id).await?.start(None).await
    }

    pub async fn update_tunnel(
        &self,
        id: &str,
        update: TunnelUpdate,
    ) -> Result<TunnelInfo, TunnelError> {
        self.resolve(id).await?.update(update).await
    }

    pub async fn check_tunnel_status(&self, id: &str) -> Result<TunnelStatusReport, TunnelError> {
        let handle = self
            .registry
            .get(id)
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;
        handle.check_status().await
    }

    /// Close, forget and unpersist a tunnel. Always succeeds.
    pub async fn delete_tunnel(&self, id: &str) -> Result<(), TunnelError> {
        if let Some(handle) = self.registry.remove(id) {
            if handle.status().is_active() {
                let _ = handle.close().await;
            }
            handle.shutdown().await;
        }

        if let Err(e) = self.ctx.store.remove(id).await {
            warn!("Failed to remove tunnel {} from store: {}", id, e);
        }

        self.ctx.events.emit_removed(id);
        info!("Tunnel {} deleted", id);
        Ok(())
    }

    pub fn get_tunnel_info(&self, id: &str) -> Result<TunnelInfo, TunnelError> {
        self.registry
            .get(id)
            .map(|handle| handle.info())
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))
    }

    pub fn get_all_tunnels(&self) -> Vec<TunnelInfo> {
        let mut tunnels: Vec<TunnelInfo> =
            self.registry.handles().iter().map(|h| h.info()).collect();
        tunnels.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tunnels
    }

    /// Every stored record, credentials redacted
    pub async fn get_saved_tunnels(&self) -> Result<Vec<PersistedTunnel>, TunnelError> {
        let records = self.ctx.store.find(&TunnelQuery::all()).await?;
        Ok(records
            .into_iter()
            .map(|mut r| {
                r.config = r.config.redacted();
                r
            })
            .collect())
    }

    /// Remove only the stored record. Returns whether one existed.
    pub async fn delete_saved_tunnel(&self, id: &str) -> Result<bool, TunnelError> {
        Ok(self.ctx.store.remove(id).await?)
    }

    /// Register every stored tunnel as `disconnected` without connecting
    pub async fn load_tunnels_from_db(&self) -> Result<usize, TunnelError> {
        let records = self.ctx.store.find(&TunnelQuery::all()).await?;
        let mut loaded = 0;
        for record in records {
            if self.registry.contains(&record.id) {
                continue;
            }
            self.spawn_handle(TunnelSeed::from(record));
            loaded += 1;
        }
        info!("Loaded {} tunnels from database", loaded);
        Ok(loaded)
    }

    /// Load stored tunnels and start each one. Returns how many connected.
    pub async fn restore_tunnels(&self) -> Result<usize, TunnelError> {
        self.load_tunnels_from_db().await?;

        let mut restored = 0;
        for handle in self.registry.handles() {
            if handle.status().is_active() {
                continue;
            }
            match handle.start(None).await {
                Ok(_) => restored += 1,
                Err(e) => warn!("Failed to restore tunnel {}: {}", handle.id(), e),
            }
        }
        info!("Restored {} tunnels", restored);
        Ok(restored)
    }

    /// Stop the health monitor and close every tunnel
    pub async fn close_all(&self) {
        self.monitor.stop().await;
        for handle in self.registry.handles() {
            if let Err(e) = handle.close().await {
                warn!("Failed to close tunnel {}: {}", handle.id(), e);
            }
        }
        info!("All tunnels closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::ssh::mock::{MockConnector, MockPlan};
    use crate::ssh::SessionEvent;
    use crate::state::{MemoryTunnelStore, RedbTunnelStore};
    use crate::tunnel::types::tests::sample_config;
    use crate::tunnel::types::{LogLevel, TunnelStatus};

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn fast_settings() -> EngineSettings {
        EngineSettings {
            // Sweeps are driven by hand unless a test lowers this
            health_check_interval_ms: 60_000,
            probe_timeout_ms: 500,
            probe_grace_ms: 50,
            reconnect_delay_ms: 1,
            ssh_connect_timeout_ms: 500,
            forward_timeout_ms: 500,
            ..EngineSettings::default()
        }
    }

    struct Fixture {
        manager: TunnelManager,
        connector: Arc<MockConnector>,
        store: Arc<dyn TunnelStore>,
    }

    fn fixture_with(settings: EngineSettings, store: Arc<dyn TunnelStore>) -> Fixture {
        let connector = MockConnector::new();
        let manager = TunnelManager::new(
            settings,
            connector.clone(),
            store.clone(),
            EventEmitter::new(1024),
        );
        Fixture {
            manager,
            connector,
            store,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(fast_settings(), Arc::new(MemoryTunnelStore::new()))
    }

    fn spec(port: u16) -> TunnelSpec {
        TunnelSpec::new(sample_config(port)).with_name("db")
    }

    /// Poll the snapshot until `pred` holds
    async fn wait_for(
        manager: &TunnelManager,
        id: &str,
        pred: impl Fn(&TunnelInfo) -> bool,
    ) -> TunnelInfo {
        for _ in 0..500 {
            let info = manager.get_tunnel_info(id).unwrap();
            if pred(&info) {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached: {:?}", manager.get_tunnel_info(id));
    }

    fn has_log(info: &TunnelInfo, needle: &str) -> bool {
        info.logs.iter().any(|l| l.message.contains(needle))
    }

    #[tokio::test]
    async fn test_create_connects_and_forwards() {
        let f = fixture();
        let port = free_port();
        let info = f
            .manager
            .create_tunnel(spec(port), Some("t1".into()))
            .await
            .unwrap();

        assert_eq!(info.status, TunnelStatus::Connected);
        assert_eq!(info.name, "db");
        assert_eq!(info.reconnect_attempts, 0);
        assert_eq!(info.config.ssh_password.as_deref(), Some("********"));
        assert!(has_log(&info, "Using password authentication"));
        assert!(has_log(
            &info,
            &format!("Tunnel active: localhost:{} -> db.internal:5432", port)
        ));

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        f.manager.close_all().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_without_connecting() {
        let f = fixture();
        let mut bad = spec(free_port());
        bad.config.ssh_password = None;

        let err = f.manager.create_tunnel(bad, None).await.unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
        assert_eq!(f.connector.connect_count(), 0);
        assert!(f.manager.get_all_tunnels().is_empty());
    }

    #[tokio::test]
    async fn test_connect_error_rejects_create() {
        let f = fixture();
        f.connector.push(MockPlan::Fail("Connection refused".into()));

        let err = f
            .manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Connect(ref m) if m.contains("Connection refused")));

        let info = f.manager.get_tunnel_info("t").unwrap();
        assert_eq!(info.status, TunnelStatus::Error);
        // Never established, so no retry
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let f = fixture();
        f.connector.push(MockPlan::Hang);

        let err = f
            .manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap_err();
        assert_eq!(err, TunnelError::Connect("SSH connection timeout".into()));
    }

    #[tokio::test]
    async fn test_bind_failure_rejects_create() {
        let f = fixture();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = f
            .manager
            .create_tunnel(spec(port), Some("t".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Port already in use"));
        assert!(f.connector.last_session().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_start_conflict_leaves_state_unchanged() {
        let f = fixture();
        f.manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap();

        let err = f.manager.start_tunnel("t").await.unwrap_err();
        assert!(matches!(err, TunnelError::Conflict(_)));
        assert_eq!(
            f.manager.get_tunnel_info("t").unwrap().status,
            TunnelStatus::Connected
        );
        assert_eq!(f.connector.connect_count(), 1);

        let err = f
            .manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Conflict(_)));

        f.manager.close_all().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_port() {
        let f = fixture();
        let port = free_port();
        f.manager
            .create_tunnel(spec(port), Some("t".into()))
            .await
            .unwrap();

        let info = f.manager.close_tunnel("t").await.unwrap();
        assert_eq!(info.status, TunnelStatus::Disconnected);
        assert!(!info.auto_reconnect);
        assert!(info.error.is_none());
        assert!(f.connector.last_session().unwrap().is_closed());
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        let again = f.manager.close_tunnel("t").await.unwrap();
        assert_eq!(again.status, TunnelStatus::Disconnected);

        assert!(matches!(
            f.manager.close_tunnel("missing").await,
            Err(TunnelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_no_reconnect_after_close() {
        let f = fixture();
        f.manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap();
        let session = f.connector.last_session().unwrap();

        f.manager.close_tunnel("t").await.unwrap();
        session.drop_connection();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let info = f.manager.get_tunnel_info("t").unwrap();
        assert_eq!(info.status, TunnelStatus::Disconnected);
        assert_eq!(info.reconnect_attempts, 0);
        assert_eq!(f.connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_unexpected_close_reconnects_and_resets_counter() {
        let f = fixture();
        f.manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap();
        f.connector.push(MockPlan::Fail("network unreachable".into()));

        f.connector.last_session().unwrap().drop_connection();

        let info = wait_for(&f.manager, "t", |i| {
            i.status == TunnelStatus::Connected && has_log(i, "Reconnection successful")
        })
        .await;
        assert_eq!(info.reconnect_attempts, 0);
        assert!(info.error.is_none());
        assert!(has_log(&info, "Connection closed") || has_log(&info, "SSH connection closed"));
        assert!(has_log(&info, "Reconnection failed: "));
        assert!(has_log(&info, "Attempting to reconnect in 1ms (2/100)..."));
        assert_eq!(f.connector.connect_count(), 3);

        f.manager.close_all().await;
    }

    #[tokio::test]
    async fn test_reconnect_ceiling() {
        let f = fixture();
        f.manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap();
        for _ in 0..100 {
            f.connector.push(MockPlan::Fail("host down".into()));
        }

        f.connector.last_session().unwrap().drop_connection();

        let info = wait_for(&f.manager, "t", |i| !i.auto_reconnect).await;
        assert_eq!(info.status, TunnelStatus::Error);
        assert_eq!(info.reconnect_attempts, 100);
        assert!(has_log(
            &info,
            "Max reconnection attempts (100) reached. Stopping auto-reconnect."
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.connector.connect_count(), 101);
    }

    #[tokio::test]
    async fn test_key_error_stops_reconnecting() {
        let f = fixture();
        f.manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap();
        for _ in 0..5 {
            f.connector.push(MockPlan::BadKey("No such file or directory".into()));
        }

        f.connector.last_session().unwrap().drop_connection();

        let info = wait_for(&f.manager, "t", |i| !i.auto_reconnect).await;
        assert_eq!(info.status, TunnelStatus::Error);
        assert!(info.error.as_deref().unwrap().contains("Key error"));
        assert!(has_log(&info, "Configuration error is not retryable"));
        assert_eq!(info.reconnect_attempts, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.connector.connect_count(), 2);
        let stored = f.store.find_one("t").await.unwrap().unwrap();
        assert!(!stored.auto_reconnect);
    }

    #[tokio::test]
    async fn test_session_timeout_then_close_reconnects_once() {
        let mut settings = fast_settings();
        // Keep the scheduled attempt pending
        settings.reconnect_delay_ms = 60_000;
        let f = fixture_with(settings, Arc::new(MemoryTunnelStore::new()));
        let port = free_port();
        f.manager
            .create_tunnel(spec(port), Some("t".into()))
            .await
            .unwrap();
        let session = f.connector.last_session().unwrap();

        session.emit(SessionEvent::TimedOut);
        let info = wait_for(&f.manager, "t", |i| i.status == TunnelStatus::Error).await;
        assert_eq!(info.error.as_deref(), Some("Connection timeout"));
        assert_eq!(info.reconnect_attempts, 0);

        session.emit(SessionEvent::Closed { had_error: true });
        let info = wait_for(&f.manager, "t", |i| i.reconnect_attempts == 1).await;
        assert_eq!(info.error.as_deref(), Some("Connection timeout"));
        assert!(has_log(&info, "SSH connection timeout"));
        assert!(has_log(&info, "SSH connection closed with error"));
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        // The teardown's own close event must not trigger a second attempt
        tokio::time::sleep(Duration::from_millis(100)).await;
        let info = f.manager.get_tunnel_info("t").unwrap();
        assert_eq!(info.reconnect_attempts, 1);
        assert_eq!(f.connector.connect_count(), 1);
        assert!(session.is_closed());

        f.manager.close_all().await;
    }

    #[tokio::test]
    async fn test_probe_is_silent() {
        let f = fixture();
        let port = free_port();
        f.manager
            .create_tunnel(spec(port), Some("t".into()))
            .await
            .unwrap();

        let report = f.manager.check_tunnel_status("t").await.unwrap();
        assert!(report.ssh_connection_alive);
        assert!(report.local_port_listening);
        assert!(report.remote_endpoint_reachable);
        assert!(report.health_warning.is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let info = f.manager.get_tunnel_info("t").unwrap();
        assert_eq!(info.status, TunnelStatus::Connected);
        assert!(!has_log(&info, "New connection to localhost"));
        assert!(!info.logs.iter().any(|l| l.level == LogLevel::Error));
        assert!(has_log(&info, "Health check: All systems operational"));

        f.manager.close_all().await;
    }

    #[tokio::test]
    async fn test_destroyed_socket_demotes_tunnel() {
        let mut settings = fast_settings();
        settings.health_check_interval_ms = 20;
        // Keep the demoted state observable
        settings.reconnect_delay_ms = 60_000;
        let f = fixture_with(settings, Arc::new(MemoryTunnelStore::new()));
        let port = free_port();
        f.manager
            .create_tunnel(spec(port), Some("t".into()))
            .await
            .unwrap();

        f.connector.last_session().unwrap().destroy_socket();

        let info = wait_for(&f.manager, "t", |i| i.status == TunnelStatus::Error).await;
        assert!(info.error.as_deref().unwrap().contains("SSH socket destroyed"));
        assert!(has_log(&info, "Health check failed: SSH socket destroyed"));
        assert_eq!(info.reconnect_attempts, 1);
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        f.manager.close_all().await;
    }

    #[tokio::test]
    async fn test_on_demand_check_reports_issues() {
        let mut settings = fast_settings();
        settings.reconnect_delay_ms = 60_000;
        let f = fixture_with(settings, Arc::new(MemoryTunnelStore::new()));
        f.manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap();
        f.connector.last_session().unwrap().set_writable(false);

        let mut events = f.manager.subscribe();
        let report = f.manager.check_tunnel_status("t").await.unwrap();
        assert!(!report.ssh_connection_alive);
        assert_eq!(
            report.health_warning.as_deref(),
            Some("SSH socket not writable")
        );
        assert_eq!(report.status, TunnelStatus::Error);

        let mut saw_report = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::TunnelHealthCheck(_)) {
                saw_report = true;
            }
        }
        assert!(saw_report);
    }

    #[tokio::test]
    async fn test_update_conflict_and_merge() {
        let f = fixture();
        f.manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap();

        let update = TunnelUpdate {
            remote_port: Some(6543),
            ..Default::default()
        };
        let err = f
            .manager
            .update_tunnel("t", update.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::Conflict(_)));
        assert_eq!(
            f.manager.get_tunnel_info("t").unwrap().config.remote_port,
            5432
        );

        f.manager.close_tunnel("t").await.unwrap();
        let info = f.manager.update_tunnel("t", update).await.unwrap();
        assert_eq!(info.config.remote_port, 6543);
        assert_eq!(info.status, TunnelStatus::Disconnected);

        let stored = f.store.find_one("t").await.unwrap().unwrap();
        assert_eq!(stored.config.remote_port, 6543);
        assert_eq!(stored.config.ssh_password.as_deref(), Some("hunter2"));

        assert!(matches!(
            f.manager.update_tunnel("missing", TunnelUpdate::default()).await,
            Err(TunnelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_persisted_status_tracks_transitions() {
        let temp = tempfile::tempdir().unwrap();
        let store: Arc<dyn TunnelStore> =
            Arc::new(RedbTunnelStore::open(&temp.path().join("tunnels.redb")).unwrap());
        let f = fixture_with(fast_settings(), store);

        let created = f
            .manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap();

        let record = f.store.find_one("t").await.unwrap().unwrap();
        assert_eq!(record.status, TunnelStatus::Connected);
        assert_eq!(record.created_at, created.created_at);
        assert!(record.persistent);

        f.manager.close_tunnel("t").await.unwrap();
        let record = f.store.find_one("t").await.unwrap().unwrap();
        assert_eq!(record.status, TunnelStatus::Disconnected);
        assert!(!record.auto_reconnect);
    }

    #[tokio::test]
    async fn test_load_and_restore_from_store() {
        let store: Arc<dyn TunnelStore> = Arc::new(MemoryTunnelStore::new());
        let port = free_port();
        let created_at = {
            let f = fixture_with(fast_settings(), store.clone());
            let info = f
                .manager
                .create_tunnel(spec(port), Some("t".into()))
                .await
                .unwrap();
            // Simulate a crash: the record still says connected
            f.manager.close_all().await;
            store
                .upsert(&PersistedTunnel {
                    status: TunnelStatus::Connected,
                    ..store.find_one("t").await.unwrap().unwrap()
                })
                .await
                .unwrap();
            info.created_at
        };

        let f = fixture_with(fast_settings(), store);
        assert_eq!(f.manager.load_tunnels_from_db().await.unwrap(), 1);
        let info = f.manager.get_tunnel_info("t").unwrap();
        assert_eq!(info.status, TunnelStatus::Disconnected);
        assert_eq!(info.created_at, created_at);
        assert_eq!(f.connector.connect_count(), 0);

        assert_eq!(f.manager.restore_tunnels().await.unwrap(), 1);
        let info = f.manager.get_tunnel_info("t").unwrap();
        assert_eq!(info.status, TunnelStatus::Connected);
        assert_eq!(info.created_at, created_at);

        f.manager.close_all().await;
    }

    #[tokio::test]
    async fn test_start_unloaded_tunnel_from_store() {
        let store: Arc<dyn TunnelStore> = Arc::new(MemoryTunnelStore::new());
        store
            .upsert(&PersistedTunnel {
                id: "saved".into(),
                name: "saved".into(),
                config: sample_config(free_port()),
                status: TunnelStatus::Disconnected,
                created_at: Utc::now(),
                auto_reconnect: true,
                persistent: true,
            })
            .await
            .unwrap();
        let f = fixture_with(fast_settings(), store);

        let info = f.manager.start_tunnel("saved").await.unwrap();
        assert_eq!(info.status, TunnelStatus::Connected);
        assert!(info.auto_reconnect);

        assert!(matches!(
            f.manager.start_tunnel("nope").await,
            Err(TunnelError::NotFound(_))
        ));
        f.manager.close_all().await;
    }

    #[tokio::test]
    async fn test_delete_removes_everywhere() {
        let f = fixture();
        let port = free_port();
        f.manager
            .create_tunnel(spec(port), Some("t".into()))
            .await
            .unwrap();
        let mut events = f.manager.subscribe();

        f.manager.delete_tunnel("t").await.unwrap();
        assert!(matches!(
            f.manager.get_tunnel_info("t"),
            Err(TunnelError::NotFound(_))
        ));
        assert!(f.store.find_one("t").await.unwrap().is_none());
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        let mut removed = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::TunnelRemoved { id } = event {
                removed = id == "t";
            }
        }
        assert!(removed);

        // Unknown ids still succeed
        f.manager.delete_tunnel("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_saved_tunnel_queries() {
        let f = fixture();
        f.manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap();

        let saved = f.manager.get_saved_tunnels().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].config.ssh_password.as_deref(), Some("********"));

        assert!(f.manager.delete_saved_tunnel("t").await.unwrap());
        assert!(!f.manager.delete_saved_tunnel("t").await.unwrap());
        // The live tunnel is untouched
        assert_eq!(
            f.manager.get_tunnel_info("t").unwrap().status,
            TunnelStatus::Connected
        );
        f.manager.close_all().await;
    }

    #[tokio::test]
    async fn test_log_buffer_is_bounded() {
        let mut settings = fast_settings();
        settings.log_capacity = 5;
        let f = fixture_with(settings, Arc::new(MemoryTunnelStore::new()));
        f.manager
            .create_tunnel(spec(free_port()), Some("t".into()))
            .await
            .unwrap();
        for _ in 0..5 {
            f.manager.check_tunnel_status("t").await.unwrap();
        }

        let info = f.manager.get_tunnel_info("t").unwrap();
        assert_eq!(info.logs.len(), 5);
        assert!(!has_log(&info, "Creating tunnel"));
        f.manager.close_all().await;
    }
}
