//! The tablet server facade: service-lock acquisition, tablet hosting, and
//! the [`TabletServerService`] implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tabletdb_client::rpc::{
    ConditionalSessionInfo, ConditionalUpdateResult, TabletServerService, UnloadGoal,
    WriteBatchResult,
};
use tabletdb_common::{
    Authorizations, ConditionalMutation, ConditionalWriteStatus, Durability, KeyExtent, Mutation,
    SystemConfig, TServerInstance,
};
use tabletdb_coordination::lock::{LockWatcher, NullLockWatcher};
use tabletdb_coordination::paths;
use tabletdb_coordination::store::CoordinationStore;
use tabletdb_coordination::ServiceLock;
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_metadata::{Ample, ConditionalStatus, SuspendingTServer, TabletMetadata, WalRef};
use tabletdb_util::shutdown::ShutdownSender;
use tabletdb_wal::{
    needs_recovery, recover, Halter, LogDefinePublisher, RecoveryLogsResolver, ResolvedSortedLog,
    TabletLogWrite, TabletServerLogger, WalConfig,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::conditional::{check_conditions_and_commit, RowLocks};
use crate::session::SessionManager;
use crate::tablet::Tablet;
use crate::write::{prepare_mutations_for_commit, ConstraintChecker, SizeConstraint};

/// Publishes log→tablet associations into tablet metadata, used by the
/// logger before a tablet's first mutation lands in a new log.
pub struct AmpleLogPublisher {
    ample: Ample,
    server: String,
}

impl AmpleLogPublisher {
    /// Publisher writing under `server`'s name.
    pub fn new(ample: Ample, server: impl Into<String>) -> Self {
        AmpleLogPublisher {
            ample,
            server: server.into(),
        }
    }
}

#[async_trait]
impl LogDefinePublisher for AmpleLogPublisher {
    async fn publish(&self, extent: &KeyExtent, log_uuid: Uuid, path: &str) -> TabletDbResult<()> {
        let wal_ref = WalRef {
            server: self.server.clone(),
            log_uuid,
            path: path.to_string(),
        };
        let mut mutator = self.ample.conditionally_mutate_tablets();
        let check_ref = wal_ref.clone();
        mutator
            .mutate_tablet(extent.clone())
            .require_absent_operation()
            .put_log(wal_ref)
            .submit(
                move |tm| tm.logs().contains(&check_ref),
                "publish wal reference",
            )?;
        let results = mutator.process().await?;
        match results.get(extent).map(|r| r.status) {
            Some(ConditionalStatus::Accepted) => Ok(()),
            other => Err(TabletDbError::Internal(format!(
                "could not publish wal reference for {extent}: {other:?}"
            ))),
        }
    }
}

/// A running tablet server.
pub struct TabletServer {
    instance: TServerInstance,
    lock: Arc<ServiceLock>,
    coordination: Arc<dyn CoordinationStore>,
    ample: Ample,
    logger: Arc<TabletServerLogger>,
    tablets: DashMap<KeyExtent, Arc<Tablet>>,
    sessions: SessionManager,
    row_locks: RowLocks,
    constraints: Vec<Arc<dyn ConstraintChecker>>,
    default_durability: Durability,
    /// Sorted-artifact locations for logs under recovery; the resolver's
    /// cache collapses duplicate resolution when many tablets reference
    /// one dead server's log.
    log_paths: Arc<DashMap<Uuid, std::path::PathBuf>>,
    resolver: RecoveryLogsResolver<Box<dyn Fn(Uuid) -> Option<std::path::PathBuf> + Send + Sync>>,
    sweeper: ShutdownSender,
}

impl TabletServer {
    /// Acquire the server's service lock and start its logger. Fails if
    /// another live server already holds the lock for `location`.
    pub async fn start(
        location: &str,
        coordination: Arc<dyn CoordinationStore>,
        ample: Ample,
        config: SystemConfig,
        wal_config: WalConfig,
        halter: Arc<dyn Halter>,
    ) -> TabletDbResult<Arc<TabletServer>> {
        Self::start_with_watcher(
            location,
            coordination,
            ample,
            config,
            wal_config,
            halter,
            Arc::new(NullLockWatcher),
        )
        .await
    }

    /// As [`Self::start`], with a caller-supplied lock watcher.
    pub async fn start_with_watcher(
        location: &str,
        coordination: Arc<dyn CoordinationStore>,
        ample: Ample,
        config: SystemConfig,
        wal_config: WalConfig,
        halter: Arc<dyn Halter>,
        lock_watcher: Arc<dyn LockWatcher>,
    ) -> TabletDbResult<Arc<TabletServer>> {
        let lock = Arc::new(ServiceLock::new(
            Arc::clone(&coordination),
            paths::tserver_lock(location),
            lock_watcher,
        ));
        if !lock.try_acquire(location.as_bytes()).await? {
            return Err(TabletDbError::AlreadyExists {
                path: paths::tserver_lock(location),
            });
        }
        let lock_id = lock
            .lock_id()
            .ok_or_else(|| TabletDbError::Internal("lock acquired without id".into()))?;
        let instance = TServerInstance::new(location, lock_id.seq);

        let logger = Arc::new(
            TabletServerLogger::start(
                wal_config,
                Arc::clone(&coordination),
                location,
                Arc::clone(&lock),
                Arc::new(AmpleLogPublisher::new(ample.clone(), location)),
                halter,
            )
            .await?,
        );

        let (sweeper, mut sweep_rx) = tabletdb_util::shutdown::channel();
        let sessions = SessionManager::new(config.session_ttl);
        let log_paths: Arc<DashMap<Uuid, std::path::PathBuf>> = Arc::new(DashMap::new());
        let resolver_paths = Arc::clone(&log_paths);
        let resolver = RecoveryLogsResolver::new(Box::new(move |uuid: Uuid| {
            resolver_paths.get(&uuid).map(|p| p.value().clone())
        }) as Box<dyn Fn(Uuid) -> Option<std::path::PathBuf> + Send + Sync>);
        let server = Arc::new(TabletServer {
            instance,
            lock,
            coordination,
            ample,
            logger,
            tablets: DashMap::new(),
            sessions,
            row_locks: RowLocks::new(),
            constraints: vec![Arc::new(SizeConstraint::default())],
            default_durability: Durability::Sync,
            log_paths,
            resolver,
            sweeper,
        });

        let sweep_server = Arc::downgrade(&server);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sweep_rx.recv() => return,
                    _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                }
                let Some(server) = sweep_server.upgrade() else {
                    return;
                };
                let swept = server.sessions.sweep();
                if swept > 0 {
                    info!(swept, "swept idle conditional sessions");
                }
            }
        });

        info!(server = %server.instance, "tablet server started");
        Ok(server)
    }

    /// This server's live identity (location + lock session).
    pub fn instance(&self) -> &TServerInstance {
        &self.instance
    }

    /// The server's write-ahead logger.
    pub fn logger(&self) -> &Arc<TabletServerLogger> {
        &self.logger
    }

    /// The extents currently hosted here.
    pub fn hosted(&self) -> Vec<KeyExtent> {
        self.tablets.iter().map(|e| e.key().clone()).collect()
    }

    /// A hosted tablet, if present.
    pub fn tablet(&self, extent: &KeyExtent) -> Option<Arc<Tablet>> {
        self.tablets.get(extent).map(|t| Arc::clone(t.value()))
    }

    /// Stop serving: release the lock and close the current log.
    pub async fn stop(&self) -> TabletDbResult<()> {
        self.sweeper.signal();
        self.logger.stop().await?;
        self.lock.unlock().await?;
        Ok(())
    }

    async fn recover_tablet(&self, tablet: &Arc<Tablet>, tm: &TabletMetadata) -> TabletDbResult<()> {
        let referenced: Vec<Uuid> = tm.logs().iter().map(|w| w.log_uuid).collect();
        if !needs_recovery(&referenced) {
            return Ok(());
        }
        for wal_ref in tm.logs() {
            self.log_paths
                .insert(wal_ref.log_uuid, wal_ref.path.clone().into());
        }
        let logs: Vec<ResolvedSortedLog> = tm
            .logs()
            .iter()
            .filter_map(|wal_ref| self.resolver.resolve(wal_ref.log_uuid))
            .collect();
        let mut recovered = Vec::new();
        recover(tablet.extent(), &logs, tm.files().len(), &mut |_, m| {
            recovered.push(m)
        })
        .await?;
        tablet.apply_recovered(&recovered);
        info!(extent = %tablet.extent(), mutations = recovered.len(), "tablet recovered from logs");
        Ok(())
    }
}

#[async_trait]
impl TabletServerService for TabletServer {
    async fn apply_mutations(
        &self,
        batch: HashMap<KeyExtent, Vec<(u64, Mutation)>>,
        durability: Durability,
    ) -> TabletDbResult<WriteBatchResult> {
        let mut result = WriteBatchResult::default();
        for (extent, mutations) in batch {
            let tablet = match self.tablet(&extent) {
                Some(tablet) if !tablet.is_closed() => tablet,
                _ => {
                    result.ignored.extend(mutations.iter().map(|(id, _)| *id));
                    continue;
                }
            };

            let prepared = prepare_mutations_for_commit(&tablet, &self.constraints, mutations);
            result.violations.extend(
                prepared
                    .violators
                    .into_iter()
                    .map(|(id, _, reason)| (id, reason)),
            );
            let Some(session) = prepared.commit_session else {
                if prepared.tablet_closed {
                    result
                        .ignored
                        .extend(prepared.non_violators.iter().map(|(id, _)| *id));
                }
                continue;
            };

            let (ids, to_commit): (Vec<u64>, Vec<Mutation>) =
                prepared.non_violators.into_iter().unzip();
            let effective = session.durability(durability);
            if effective.uses_log() {
                let write = TabletLogWrite {
                    extent: &extent,
                    seq: session.seq(),
                    mutations: &to_commit,
                    durability: effective,
                };
                if let Err(e) = self.logger.log(&[write]).await {
                    // durability could not be established, so nothing from
                    // this tablet's batch is applied; the client may safely
                    // resubmit
                    warn!(%extent, %e, "write batch not logged");
                    session.abort();
                    result.ignored.extend(ids);
                    continue;
                }
            }
            session.commit(&to_commit);
        }
        Ok(result)
    }

    async fn start_conditional_session(
        &self,
        authorizations: Authorizations,
    ) -> TabletDbResult<ConditionalSessionInfo> {
        let lock_id = self
            .lock
            .lock_id()
            .ok_or_else(|| TabletDbError::Internal("service lock not held".into()))?;
        let session_id = self.sessions.create(authorizations);
        Ok(ConditionalSessionInfo {
            session_id,
            ttl: self.sessions.ttl(),
            lock_id,
        })
    }

    async fn conditional_update(
        &self,
        session_id: u64,
        batch: HashMap<KeyExtent, Vec<(u64, ConditionalMutation)>>,
    ) -> TabletDbResult<ConditionalUpdateResult> {
        let authorizations = self.sessions.reserve(session_id)?;
        let result = self.conditional_update_reserved(&authorizations, batch).await;
        self.sessions.unreserve(session_id);
        result
    }

    async fn invalidate_conditional_update(&self, session_id: u64) -> TabletDbResult<()> {
        match self.sessions.invalidate(session_id).await {
            Ok(()) => Ok(()),
            // an unknown session has nothing in flight; the guarantee
            // holds vacuously
            Err(TabletDbError::NoSuchSession(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn close_conditional_session(&self, session_id: u64) -> TabletDbResult<()> {
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn load_tablet(&self, extent: KeyExtent) -> TabletDbResult<()> {
        if self.tablets.contains_key(&extent) {
            return Ok(());
        }
        let tm = self
            .ample
            .read_tablet(&extent)
            .await?
            .ok_or_else(|| TabletDbError::TabletNotHosted(extent.to_string()))?;
        if tm.future() != Some(&self.instance) && tm.current() != Some(&self.instance) {
            return Err(TabletDbError::TabletNotHosted(format!(
                "{extent} is not assigned to {}",
                self.instance
            )));
        }

        let tablet = Tablet::new(
            extent.clone(),
            tm.files().clone(),
            tm.time(),
            self.default_durability,
        );
        self.recover_tablet(&tablet, &tm).await?;

        // accept ownership: future -> current, exactly one location set
        let mut mutator = self.ample.conditionally_mutate_tablets();
        let me = self.instance.clone();
        let me2 = me.clone();
        mutator
            .mutate_tablet(extent.clone())
            .require_absent_operation()
            .require_future(me.clone())
            .delete_future()
            .set_current(me.clone())
            .set_last(me.clone())
            .delete_suspend()
            .submit(move |tm| tm.current() == Some(&me2), "accept assignment")?;
        let results = mutator.process().await?;
        match results.get(&extent).map(|r| r.status) {
            Some(ConditionalStatus::Accepted) => {
                self.tablets.insert(extent.clone(), tablet);
                info!(%extent, server = %self.instance, "tablet loaded");
                Ok(())
            }
            other => {
                warn!(%extent, ?other, "assignment acceptance rejected");
                Err(TabletDbError::ConditionalRejected {
                    extent: extent.to_string(),
                })
            }
        }
    }

    async fn unload_tablet(&self, extent: KeyExtent, goal: UnloadGoal) -> TabletDbResult<()> {
        let Some((_, tablet)) = self.tablets.remove(&extent) else {
            return Ok(());
        };
        tablet.close().await?;

        let mut mutator = self.ample.conditionally_mutate_tablets();
        let me = self.instance.clone();
        {
            let mut m = mutator.mutate_tablet(extent.clone());
            m.require_absent_operation()
                .require_current(me.clone())
                .delete_current()
                .set_last(me.clone());
            match goal {
                UnloadGoal::Suspend => {
                    m.set_suspend(SuspendingTServer {
                        server: me.clone(),
                        suspension_time: std::time::SystemTime::now(),
                    });
                }
                UnloadGoal::Unassign | UnloadGoal::Delete => {
                    m.delete_suspend();
                }
            }
            m.submit(move |tm| tm.current().is_none(), "release assignment")?;
        }
        let results = mutator.process().await?;
        match results.get(&extent).map(|r| r.status) {
            Some(ConditionalStatus::Accepted) => {
                info!(%extent, server = %self.instance, ?goal, "tablet unloaded");
                Ok(())
            }
            other => {
                warn!(%extent, ?other, "unload metadata update rejected");
                Err(TabletDbError::ConditionalRejected {
                    extent: extent.to_string(),
                })
            }
        }
    }

    async fn refresh_tablets(&self, extents: Vec<KeyExtent>) -> TabletDbResult<()> {
        for extent in extents {
            let Some(tablet) = self.tablet(&extent) else {
                continue;
            };
            if let Some(tm) = self.ample.read_tablet(&extent).await? {
                tablet.set_files(tm.files().clone());
            }
        }
        Ok(())
    }

    async fn ping(&self) -> TabletDbResult<()> {
        Ok(())
    }
}

impl TabletServer {
    async fn conditional_update_reserved(
        &self,
        authorizations: &Authorizations,
        batch: HashMap<KeyExtent, Vec<(u64, ConditionalMutation)>>,
    ) -> TabletDbResult<ConditionalUpdateResult> {
        let mut result = ConditionalUpdateResult::default();
        for (extent, mutations) in batch {
            match self.tablet(&extent) {
                Some(tablet) if !tablet.is_closed() => {
                    let statuses = check_conditions_and_commit(
                        &tablet,
                        authorizations,
                        mutations,
                        &self.constraints,
                        &self.row_locks,
                        &self.logger,
                    )
                    .await?;
                    result.statuses.extend(statuses);
                }
                _ => {
                    // not hosted here (anymore): the client refreshes its
                    // locator and resubmits
                    result
                        .statuses
                        .extend(mutations.into_iter().map(|(id, _)| {
                            (id, ConditionalWriteStatus::Ignored)
                        }));
                }
            }
        }
        Ok(result)
    }
}
