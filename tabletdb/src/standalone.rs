//! Standalone deployment: every component in one process, wired over the
//! in-process stores. Production clusters put a wire transport in front of
//! the same service traits; standalone hands out the implementations
//! directly. Integration tests run on this.
//!
//! The instance's durable state (persistent coordination nodes plus the
//! metadata table) lives in one snapshot file under the data directory:
//! [`StandaloneInstance::persist`] writes it and [`open_stores`] reads it
//! back, which is how a later `admin` invocation against the same
//! `--data-dir` sees the same transactions the instance left behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tabletdb_client::rpc::{
    ServerConnector, TabletLocation, TabletLocator, TabletServerService,
};
use tabletdb_common::{KeyExtent, SystemConfig, TableId};
use tabletdb_coordination::{LocalStore, LocalStoreSnapshot};
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_fate::FateConfig;
use tabletdb_manager::{Manager, ManagerEnv};
use tabletdb_metadata::{Ample, InMemoryAmple, InMemoryAmpleSnapshot};
use tabletdb_server::TabletServer;
use tabletdb_wal::{ProcessHalter, WalConfig};

/// File under the data directory holding the serialized instance state.
const INSTANCE_STATE_FILE: &str = "instance.state";

#[derive(Serialize, Deserialize)]
struct InstanceState {
    coordination: LocalStoreSnapshot,
    metadata: InMemoryAmpleSnapshot,
}

/// Open the stores persisted under `data_dir`, or fresh empty ones when
/// nothing has been persisted there yet.
pub fn open_stores(data_dir: &Path) -> TabletDbResult<(LocalStore, InMemoryAmple)> {
    let path = data_dir.join(INSTANCE_STATE_FILE);
    match std::fs::read(&path) {
        Ok(bytes) => {
            let state: InstanceState = bincode::deserialize(&bytes)?;
            Ok((
                LocalStore::restore(state.coordination),
                InMemoryAmple::restore(state.metadata),
            ))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok((LocalStore::new(), InMemoryAmple::new()))
        }
        Err(e) => Err(TabletDbError::io("reading instance state", e)),
    }
}

/// Write the stores' durable state under `data_dir`, atomically.
pub fn persist_stores(
    data_dir: &Path,
    coordination: &LocalStore,
    metadata: &InMemoryAmple,
) -> TabletDbResult<()> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| TabletDbError::io("creating data dir", e))?;
    let state = InstanceState {
        coordination: coordination.snapshot(),
        metadata: metadata.snapshot(),
    };
    let bytes = bincode::serialize(&state)?;
    let tmp = data_dir.join(format!("{INSTANCE_STATE_FILE}.tmp"));
    std::fs::write(&tmp, &bytes).map_err(|e| TabletDbError::io("writing instance state", e))?;
    std::fs::rename(&tmp, data_dir.join(INSTANCE_STATE_FILE))
        .map_err(|e| TabletDbError::io("publishing instance state", e))?;
    Ok(())
}

/// In-process server registry: the standalone stand-in for a connection
/// pool.
#[derive(Default)]
pub struct InProcessConnector {
    servers: RwLock<HashMap<String, Arc<dyn TabletServerService>>>,
}

impl InProcessConnector {
    /// An empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a server under its location.
    pub fn register(&self, location: impl Into<String>, service: Arc<dyn TabletServerService>) {
        self.servers.write().insert(location.into(), service);
    }

    /// Remove a server (it "crashed").
    pub fn deregister(&self, location: &str) {
        self.servers.write().remove(location);
    }
}

impl ServerConnector for InProcessConnector {
    fn connect(&self, location: &str) -> Option<Arc<dyn TabletServerService>> {
        self.servers.read().get(location).cloned()
    }
}

/// A locator that reads current locations straight from tablet metadata.
pub struct MetadataLocator {
    ample: Ample,
}

impl MetadataLocator {
    /// Locate through `ample`.
    pub fn new(ample: Ample) -> Arc<Self> {
        Arc::new(MetadataLocator { ample })
    }
}

#[async_trait::async_trait]
impl TabletLocator for MetadataLocator {
    async fn locate(
        &self,
        table: &TableId,
        row: &[u8],
    ) -> TabletDbResult<Option<TabletLocation>> {
        let tablets = self
            .ample
            .read_tablets(table.level())
            .for_table(table.clone())
            .fetch_all()
            .await?;
        for tm in tablets {
            if tm.extent().contains_row(row) {
                return Ok(tm.current().map(|server| TabletLocation {
                    extent: tm.extent().clone(),
                    server: server.location.clone(),
                }));
            }
        }
        Ok(None)
    }

    fn invalidate(&self, _extent: &KeyExtent) {
        // nothing cached; every lookup reads metadata
    }
}

/// A full single-process instance.
pub struct StandaloneInstance {
    /// Where WALs and the state snapshot live
    pub data_dir: PathBuf,
    /// The shared coordination tree
    pub coordination: LocalStore,
    /// The in-memory metadata table
    pub ample_backend: InMemoryAmple,
    /// Typed metadata surface
    pub ample: Ample,
    /// In-process server registry
    pub connector: Arc<InProcessConnector>,
    /// The manager
    pub manager: Arc<Manager>,
    /// The tablet servers, by location
    pub servers: Vec<Arc<TabletServer>>,
    /// Each server's coordination session, index-aligned with `servers`;
    /// expiring one simulates that server's death
    pub server_sessions: Vec<LocalStore>,
}

impl StandaloneInstance {
    /// Bring up a manager and `server_count` tablet servers under
    /// `data_dir`, reopening any state a previous instance persisted
    /// there. Stale locations from the previous incarnation point at dead
    /// instances, so the watcher clears and reassigns them.
    pub async fn start(
        data_dir: &Path,
        server_count: usize,
        config: SystemConfig,
    ) -> TabletDbResult<StandaloneInstance> {
        let (coordination, ample_backend) = open_stores(data_dir)?;
        let ample = Ample::new(Arc::new(ample_backend.clone()));
        let connector = InProcessConnector::new();

        let env = ManagerEnv::new(
            ample.clone(),
            Arc::new(coordination.clone()),
            Arc::clone(&connector) as Arc<dyn ServerConnector>,
            config.clone(),
        );
        let manager = Manager::start(
            env,
            ample_backend.system_kv(),
            FateConfig {
                workers: 2,
                scan_interval: Duration::from_millis(50),
                reclaim_interval: Duration::from_secs(10),
            },
            Duration::from_millis(100),
        )
        .await?;

        let mut servers = Vec::with_capacity(server_count);
        let mut server_sessions = Vec::with_capacity(server_count);
        for i in 0..server_count {
            let location = format!("127.0.0.1:{}", 9997 + i);
            // each server gets its own coordination session so a crash can
            // be simulated by expiring it
            let session = coordination.new_session();
            let server = TabletServer::start(
                &location,
                Arc::new(session.clone()),
                ample.clone(),
                config.clone(),
                WalConfig::new(data_dir.join(&location)),
                Arc::new(ProcessHalter),
            )
            .await?;
            connector.register(location, Arc::clone(&server) as Arc<dyn TabletServerService>);
            servers.push(server);
            server_sessions.push(session);
        }

        Ok(StandaloneInstance {
            data_dir: data_dir.to_path_buf(),
            coordination,
            ample_backend,
            ample,
            connector,
            manager,
            servers,
            server_sessions,
        })
    }

    /// Write the instance's durable state to its data directory so a
    /// later process (another instance, or the admin CLI) can open it.
    pub fn persist(&self) -> TabletDbResult<()> {
        persist_stores(&self.data_dir, &self.coordination, &self.ample_backend)
    }

    /// A metadata-backed locator for client use.
    pub fn locator(&self) -> Arc<MetadataLocator> {
        MetadataLocator::new(self.ample.clone())
    }
}
