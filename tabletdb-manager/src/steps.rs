//! The manager's FATE step set.
//!
//! One tagged sum covers every multi-step administrative operation; the
//! FATE engine is generic over it. Step side effects are idempotent: each
//! metadata write is conditional with an accepted-anyway predicate, so a
//! replayed step observes its earlier effects and no-ops.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tabletdb_client::load_plan::LoadPlan;
use tabletdb_client::rpc::UnloadGoal;
use tabletdb_common::{FateId, KeyExtent, TableId, TabletAvailability};
use tabletdb_coordination::paths;
use tabletdb_coordination::store::{CreatePolicy, NodeMode};
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_fate::Repo;
use tabletdb_metadata::{ConditionalStatus, MetadataTime, StoredTabletFile, TabletMetadata};
use tracing::{info, warn};

use crate::bulk::compute_bulk_load_mapping;
use crate::env::ManagerEnv;
use crate::tables::TableState;

/// How long a step sleeps when its work is not finished yet.
const STEP_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Every FATE step the manager runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Step {
    /// Bulk import: load files into tablet metadata.
    BulkLoadFiles {
        /// Table being imported into
        table: TableId,
        /// Directory holding the files
        import_dir: String,
        /// Files present in the directory
        dir_files: Vec<String>,
        /// The caller's load plan
        plan: LoadPlan,
    },
    /// Bulk import: make hosted tablets observe their new files.
    BulkRefreshTablets {
        /// Table that was imported into
        table: TableId,
        /// Tablets the import touched
        extents: Vec<KeyExtent>,
    },
    /// Create table: record state and configuration in the coordination
    /// service.
    PopulateZoo {
        /// The new table
        table: TableId,
        /// Split points carried through to metadata population
        splits: Vec<Bytes>,
    },
    /// Create table: create the table's directory node.
    CreateDir {
        /// The new table
        table: TableId,
        /// Split points carried through to metadata population
        splits: Vec<Bytes>,
    },
    /// Create table: insert the tablet rows partitioning the keyspace.
    PopulateMetadata {
        /// The new table
        table: TableId,
        /// Split points; n splits make n+1 tablets
        splits: Vec<Bytes>,
    },
    /// Create table: flip the table online.
    FinishCreate {
        /// The new table
        table: TableId,
    },
    /// Server shutdown: refuse if the server is unreachable (unless
    /// forced).
    PrepareShutdown {
        /// Location of the server being shut down
        server: String,
        /// Skip the reachability pre-check
        force: bool,
    },
    /// Server shutdown: drain the server's tablets.
    UnloadServerTablets {
        /// Location of the server being shut down
        server: String,
    },
    /// Server shutdown: delete the server's lock so it halts.
    ReleaseServerLock {
        /// Location of the server being shut down
        server: String,
    },
}

#[async_trait]
impl Repo<ManagerEnv> for Step {
    fn name(&self) -> &'static str {
        match self {
            Step::BulkLoadFiles { .. } => "BULK_LOAD_FILES",
            Step::BulkRefreshTablets { .. } => "BULK_REFRESH_TABLETS",
            Step::PopulateZoo { .. } => "POPULATE_ZOO",
            Step::CreateDir { .. } => "CREATE_DIR",
            Step::PopulateMetadata { .. } => "POPULATE_METADATA",
            Step::FinishCreate { .. } => "FINISH_CREATE",
            Step::PrepareShutdown { .. } => "PREPARE_SHUTDOWN",
            Step::UnloadServerTablets { .. } => "UNLOAD_SERVER_TABLETS",
            Step::ReleaseServerLock { .. } => "RELEASE_SERVER_LOCK",
        }
    }

    async fn is_ready(&self, fate_id: FateId, env: &ManagerEnv) -> TabletDbResult<Duration> {
        match self {
            Step::BulkLoadFiles {
                table,
                import_dir,
                dir_files,
                plan,
            } => {
                // loading happens here, incrementally: each pass loads the
                // tablets it can and defers while paused tablets or
                // stragglers remain
                let remaining =
                    load_files_pass(env, fate_id, table, import_dir, dir_files, plan).await?;
                Ok(if remaining == 0 {
                    Duration::ZERO
                } else {
                    STEP_RETRY_DELAY
                })
            }
            Step::UnloadServerTablets { server } => {
                let remaining = unload_pass(env, server).await?;
                Ok(if remaining == 0 {
                    Duration::ZERO
                } else {
                    STEP_RETRY_DELAY
                })
            }
            _ => Ok(Duration::ZERO),
        }
    }

    async fn call(&self, fate_id: FateId, env: &ManagerEnv) -> TabletDbResult<Option<Step>> {
        match self {
            Step::BulkLoadFiles {
                table,
                import_dir,
                dir_files,
                plan,
            } => {
                let config = env.table_config(table);
                let mapping = compute_bulk_load_mapping(
                    &env.ample,
                    table,
                    import_dir,
                    dir_files,
                    plan,
                    config.bulk_max_tablets,
                    config.bulk_max_tablet_files,
                )
                .await?;
                Ok(Some(Step::BulkRefreshTablets {
                    table: table.clone(),
                    extents: mapping.extents(),
                }))
            }
            Step::BulkRefreshTablets { extents, .. } => {
                for extent in extents {
                    let Some(tm) = env.ample.read_tablet(extent).await? else {
                        continue;
                    };
                    if let Some(current) = tm.current() {
                        if let Some(service) = env.connector.connect(&current.location) {
                            if let Err(e) = service.refresh_tablets(vec![extent.clone()]).await {
                                warn!(%extent, %e, "refresh after bulk import failed");
                            }
                        }
                    }
                }
                info!(%fate_id, tablets = extents.len(), "bulk import complete");
                Ok(None)
            }
            Step::PopulateZoo { table, splits } => {
                env.table_states.set_state(table, TableState::Offline).await?;
                Ok(Some(Step::CreateDir {
                    table: table.clone(),
                    splits: splits.clone(),
                }))
            }
            Step::CreateDir { table, splits } => {
                env.coordination
                    .create(
                        &paths::table_conf(table),
                        b"",
                        NodeMode::Persistent,
                        CreatePolicy::SkipIfExists,
                    )
                    .await?;
                Ok(Some(Step::PopulateMetadata {
                    table: table.clone(),
                    splits: splits.clone(),
                }))
            }
            Step::PopulateMetadata { table, splits } => {
                populate_metadata(env, table, splits).await?;
                Ok(Some(Step::FinishCreate {
                    table: table.clone(),
                }))
            }
            Step::FinishCreate { table } => {
                env.table_states.set_state(table, TableState::Online).await?;
                info!(%fate_id, %table, "table created");
                Ok(None)
            }
            Step::PrepareShutdown { server, force } => {
                if !force {
                    let service = env.connector.connect(server).ok_or_else(|| {
                        TabletDbError::Io {
                            context: format!("shutdown pre-check of {server}"),
                            message: "unreachable".into(),
                        }
                    })?;
                    service.ping().await?;
                }
                Ok(Some(Step::UnloadServerTablets {
                    server: server.clone(),
                }))
            }
            Step::UnloadServerTablets { server } => Ok(Some(Step::ReleaseServerLock {
                server: server.clone(),
            })),
            Step::ReleaseServerLock { server } => {
                let dir = paths::tserver_lock(server);
                let children = match env.coordination.get_children(&dir).await {
                    Ok(children) => children,
                    Err(TabletDbError::NotFound { .. }) => Vec::new(),
                    Err(e) => return Err(e),
                };
                for child in children {
                    match env.coordination.delete(&format!("{dir}/{child}")).await {
                        Ok(()) | Err(TabletDbError::NotFound { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                info!(%fate_id, server, "server lock released");
                Ok(None)
            }
        }
    }

    async fn undo(&self, fate_id: FateId, env: &ManagerEnv) -> TabletDbResult<()> {
        match self {
            Step::BulkLoadFiles { table, .. } => {
                // withdraw anything this transaction loaded
                let tablets = env
                    .ample
                    .read_tablets(table.level())
                    .for_table(table.clone())
                    .fetch_all()
                    .await?;
                for tm in tablets {
                    let mine: Vec<StoredTabletFile> = tm
                        .loaded()
                        .iter()
                        .filter(|(_, id)| **id == fate_id)
                        .map(|(f, _)| f.clone())
                        .collect();
                    if mine.is_empty() {
                        continue;
                    }
                    let mut mutator = env.ample.conditionally_mutate_tablets();
                    {
                        let mut m = mutator.mutate_tablet(tm.extent().clone());
                        m.require_absent_operation();
                        for file in &mine {
                            m.delete_loaded(file.clone());
                            m.delete_file(file.clone());
                        }
                        m.submit(|_| false, "undo bulk load")?;
                    }
                    mutator.process().await?;
                }
                Ok(())
            }
            Step::PopulateZoo { table, .. }
            | Step::CreateDir { table, .. }
            | Step::PopulateMetadata { table, .. }
            | Step::FinishCreate { table } => {
                // unwind table creation: drop rows and state
                let tablets = env
                    .ample
                    .read_tablets(table.level())
                    .for_table(table.clone())
                    .fetch_all()
                    .await?;
                for tm in tablets {
                    let mut mutator = env.ample.conditionally_mutate_tablets();
                    mutator
                        .mutate_tablet(tm.extent().clone())
                        .require_absent_operation()
                        .delete_tablet()
                        .submit(|_| false, "undo table create")?;
                    mutator.process().await?;
                }
                env.table_states.remove(table).await
            }
            // tearing down a partly shut-down server is not possible; the
            // watcher will reassign whatever was already unloaded
            Step::BulkRefreshTablets { .. }
            | Step::PrepareShutdown { .. }
            | Step::UnloadServerTablets { .. }
            | Step::ReleaseServerLock { .. } => Ok(()),
        }
    }
}

/// One pass of bulk loading. Returns how many destination tablets still
/// need their files.
async fn load_files_pass(
    env: &ManagerEnv,
    fate_id: FateId,
    table: &TableId,
    import_dir: &str,
    dir_files: &[String],
    plan: &LoadPlan,
) -> TabletDbResult<usize> {
    let config = env.table_config(table);
    let mapping = compute_bulk_load_mapping(
        &env.ample,
        table,
        import_dir,
        dir_files,
        plan,
        config.bulk_max_tablets,
        config.bulk_max_tablet_files,
    )
    .await?;

    let mut remaining = 0;
    for (extent, files) in mapping.iter() {
        let Some(tm) = env.ample.read_tablet(extent).await? else {
            return Err(TabletDbError::Internal(format!(
                "tablet {extent} vanished mid-import"
            )));
        };
        let missing: Vec<&StoredTabletFile> = files
            .iter()
            .filter(|f| tm.loaded().get(*f) != Some(&fate_id))
            .collect();
        if missing.is_empty() {
            continue;
        }
        // the pause threshold blocks further bulk loads into a busy
        // tablet until compaction catches up; user writes are unaffected
        if tm.files().len() > config.file_pause {
            remaining += 1;
            continue;
        }

        let mut mutator = env.ample.conditionally_mutate_tablets();
        {
            let mut m = mutator.mutate_tablet(extent.clone());
            m.require_absent_operation();
            for file in &missing {
                m.require_absent_loaded((*file).clone());
                m.put_file((*file).clone());
                m.put_loaded((*file).clone(), fate_id);
            }
            let check: Vec<StoredTabletFile> = missing.iter().map(|f| (*f).clone()).collect();
            m.submit(
                move |tm| {
                    check
                        .iter()
                        .all(|f| tm.loaded().get(f) == Some(&fate_id))
                },
                "bulk load files",
            )?;
        }
        let results = mutator.process().await?;
        match results.get(extent).map(|r| r.status) {
            Some(ConditionalStatus::Accepted) => {}
            other => {
                warn!(%extent, ?other, "bulk load mutation not accepted yet");
                remaining += 1;
            }
        }
    }
    Ok(remaining)
}

/// One pass of draining a server. Returns how many tablets it still hosts.
async fn unload_pass(env: &ManagerEnv, server: &str) -> TabletDbResult<usize> {
    // An unreachable server cannot drain itself; proceed to the lock
    // release and let the watcher clean up its metadata afterwards.
    let Some(service) = env.connector.connect(server) else {
        return Ok(0);
    };
    let mut remaining = 0;
    for level in tabletdb_common::DataLevel::ALL {
        let tablets = env.ample.read_tablets(level).fetch_all().await?;
        for tm in tablets {
            let Some(current) = tm.current() else {
                continue;
            };
            if current.location != server {
                continue;
            }
            remaining += 1;
            if let Err(e) = service
                .unload_tablet(tm.extent().clone(), UnloadGoal::Unassign)
                .await
            {
                warn!(extent = %tm.extent(), %e, "unload during shutdown failed");
            }
        }
    }
    Ok(remaining)
}

async fn populate_metadata(
    env: &ManagerEnv,
    table: &TableId,
    splits: &[Bytes],
) -> TabletDbResult<()> {
    let mut sorted: Vec<Bytes> = splits.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut prev: Option<Bytes> = None;
    let mut bounds: Vec<(Option<Bytes>, Option<Bytes>)> = Vec::with_capacity(sorted.len() + 1);
    for split in sorted {
        bounds.push((Some(split.clone()), prev.clone()));
        prev = Some(split);
    }
    bounds.push((None, prev));

    for (end, prev_end) in bounds {
        let extent = KeyExtent::new(table.clone(), end, prev_end);
        let tm = TabletMetadata::builder(extent.clone())
            .availability(TabletAvailability::Ondemand)
            .time(MetadataTime::Millis(0))
            .build();
        let mut mutator = env.ample.conditionally_mutate_tablets();
        mutator
            .mutate_tablet(extent.clone())
            .require_absent_tablet()
            .insert_tablet(tm)
            // a replayed create sees the row already there and accepts
            .submit(|_| true, "populate table metadata")?;
        let results = mutator.process().await?;
        match results.get(&extent).map(|r| r.status) {
            Some(ConditionalStatus::Accepted) => {}
            other => {
                return Err(TabletDbError::Internal(format!(
                    "could not insert tablet {extent}: {other:?}"
                )))
            }
        }
    }
    Ok(())
}

/// The FATE operation names used when seeding.
pub mod ops {
    /// Bulk import.
    pub const BULK_IMPORT: &str = "BULK_IMPORT";
    /// Create table.
    pub const CREATE_TABLE: &str = "CREATE_TABLE";
    /// Graceful server shutdown.
    pub const SHUTDOWN_TSERVER: &str = "SHUTDOWN_TSERVER";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn populate_bounds_partition() {
        // checked indirectly through populate_metadata in integration
        // tests; here just the bound derivation
        let splits = [Bytes::from("f"), Bytes::from("m")];
        let mut sorted: Vec<Bytes> = splits.to_vec();
        sorted.sort();
        let mut prev: Option<Bytes> = None;
        let mut bounds = Vec::new();
        for split in sorted {
            bounds.push((Some(split.clone()), prev.clone()));
            prev = Some(split);
        }
        bounds.push((None, prev));
        assert_eq!(bounds.len(), 3);
        assert_eq!(bounds[0], (Some(Bytes::from("f")), None));
        assert_eq!(bounds[2], (None, Some(Bytes::from("m"))));
    }

    #[test]
    fn step_serialization_round_trips() {
        let step = Step::BulkLoadFiles {
            table: TableId::new("t1"),
            import_dir: "/bulk/dir".into(),
            dir_files: vec!["f1.rf".into()],
            plan: LoadPlan::builder()
                .load_file_to("f1.rf", None::<&str>, None::<&str>)
                .build(),
        };
        let bytes = bincode::serialize(&step).unwrap();
        let back: Step = bincode::deserialize(&bytes).unwrap();
        assert_eq!(format!("{step:?}"), format!("{back:?}"));
    }
}
