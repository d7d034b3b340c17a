//! The manager process: lock, FATE engines, and watchers, wired together.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tabletdb_client::load_plan::LoadPlan;
use tabletdb_client::rpc::ManagerService;
use tabletdb_common::{FateId, FateInstanceType, KeyExtent, TableId};
use tabletdb_coordination::paths;
use tabletdb_coordination::lock::NullLockWatcher;
use tabletdb_coordination::ServiceLock;
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_fate::{Fate, FateConfig, FateStore, ZooKv};
use tabletdb_metadata::SystemKv;
use tracing::info;

use crate::balancer::{Balancer, SimpleLoadBalancer};
use crate::env::ManagerEnv;
use crate::ondemand::OndemandHostingRequests;
use crate::steps::{ops, Step};
use crate::watcher::TabletGroupWatcher;

/// A running manager.
pub struct Manager {
    env: Arc<ManagerEnv>,
    lock: Arc<ServiceLock>,
    meta_fate: Fate<ManagerEnv, Step>,
    user_fate: Fate<ManagerEnv, Step>,
    watchers: Vec<Arc<TabletGroupWatcher>>,
    ondemand: OndemandHostingRequests,
}

impl Manager {
    /// Acquire the manager lock and start the FATE engines and one watcher
    /// per data level. `user_kv` is the metadata-table section backing the
    /// USER FATE store.
    pub async fn start(
        env: Arc<ManagerEnv>,
        user_kv: Arc<dyn SystemKv>,
        fate_config: FateConfig,
        scan_interval: Duration,
    ) -> TabletDbResult<Arc<Manager>> {
        let lock = Arc::new(ServiceLock::new(
            Arc::clone(&env.coordination),
            paths::MANAGER_LOCK,
            Arc::new(NullLockWatcher),
        ));
        if !lock.try_acquire(b"manager").await? {
            return Err(TabletDbError::AlreadyExists {
                path: paths::MANAGER_LOCK.to_string(),
            });
        }
        let lock_id = lock
            .lock_id()
            .ok_or_else(|| TabletDbError::Internal("manager lock acquired without id".into()))?;

        let meta_store = Arc::new(FateStore::new(
            Arc::new(ZooKv::new(Arc::clone(&env.coordination), paths::FATE_ROOT)),
            FateInstanceType::Meta,
        ));
        let user_store = Arc::new(FateStore::new(user_kv, FateInstanceType::User));

        let meta_fate = Fate::start(
            meta_store,
            Arc::clone(&env),
            Arc::clone(&env.coordination),
            lock_id.clone(),
            fate_config.clone(),
        );
        let user_fate = Fate::start(
            user_store,
            Arc::clone(&env),
            Arc::clone(&env.coordination),
            lock_id,
            fate_config,
        );

        let balancer: Arc<dyn Balancer> = Arc::new(SimpleLoadBalancer);
        // a level is serviced only with the level above stable; watchers
        // start top-down
        let watchers = tabletdb_common::DataLevel::ALL
            .iter()
            .map(|level| {
                TabletGroupWatcher::start(
                    *level,
                    Arc::clone(&env),
                    Arc::clone(&balancer),
                    scan_interval,
                )
            })
            .collect();

        info!("manager started");
        Ok(Arc::new(Manager {
            env,
            lock,
            meta_fate,
            user_fate,
            watchers,
            ondemand: OndemandHostingRequests::new(),
        }))
    }

    /// The environment shared with steps and watchers.
    pub fn env(&self) -> &Arc<ManagerEnv> {
        &self.env
    }

    /// The watchers, one per data level.
    pub fn watchers(&self) -> &[Arc<TabletGroupWatcher>] {
        &self.watchers
    }

    /// The META FATE engine.
    pub fn meta_fate(&self) -> &Fate<ManagerEnv, Step> {
        &self.meta_fate
    }

    /// The USER FATE engine.
    pub fn user_fate(&self) -> &Fate<ManagerEnv, Step> {
        &self.user_fate
    }

    /// Seed a create-table transaction.
    pub async fn create_table(
        &self,
        table: TableId,
        splits: Vec<Bytes>,
    ) -> TabletDbResult<FateId> {
        self.user_fate
            .create_and_seed(
                ops::CREATE_TABLE,
                Step::PopulateZoo { table, splits },
                false,
            )
            .await
    }

    /// Seed a bulk-import transaction.
    pub async fn bulk_import(
        &self,
        table: TableId,
        import_dir: String,
        dir_files: Vec<String>,
        plan: LoadPlan,
    ) -> TabletDbResult<FateId> {
        self.user_fate
            .create_and_seed(
                ops::BULK_IMPORT,
                Step::BulkLoadFiles {
                    table,
                    import_dir,
                    dir_files,
                    plan,
                },
                false,
            )
            .await
    }

    /// Stop watchers and engines and release the lock.
    pub async fn stop(self: Arc<Self>) -> TabletDbResult<()> {
        for watcher in &self.watchers {
            watcher.stop();
        }
        let manager =
            Arc::try_unwrap(self).map_err(|_| TabletDbError::Internal("manager still shared".into()))?;
        manager.meta_fate.stop().await;
        manager.user_fate.stop().await;
        manager.lock.unlock().await?;
        Ok(())
    }
}

#[async_trait]
impl ManagerService for Manager {
    async fn server_shutdown(&self, server: String, force: bool) -> TabletDbResult<()> {
        if !force {
            // refuse up front when the server cannot be reached; a forced
            // shutdown skips straight to draining metadata
            let service = self
                .env
                .connector
                .connect(&server)
                .ok_or_else(|| TabletDbError::Io {
                    context: format!("shutdown pre-check of {server}"),
                    message: "unreachable".into(),
                })?;
            service.ping().await?;
        }
        let fate_id = self
            .meta_fate
            .create_and_seed(
                ops::SHUTDOWN_TSERVER,
                Step::PrepareShutdown { server: server.clone(), force },
                true,
            )
            .await?;
        info!(server, %fate_id, "server shutdown seeded");
        Ok(())
    }

    async fn host_ondemand(&self, extents: Vec<KeyExtent>) -> TabletDbResult<()> {
        self.ondemand
            .host_ondemand(&self.env, extents.clone())
            .await?;
        // wake the watchers so the request is honored within one cycle
        for watcher in &self.watchers {
            watcher.notify(extents_for_level(&extents, watcher.level()));
        }
        Ok(())
    }
}

fn extents_for_level(
    extents: &[KeyExtent],
    level: tabletdb_common::DataLevel,
) -> Vec<KeyExtent> {
    extents
        .iter()
        .filter(|e| e.level() == level)
        .cloned()
        .collect()
}
