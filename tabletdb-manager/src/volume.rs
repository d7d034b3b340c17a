//! Volume replacement: rewriting file and log paths off decommissioned
//! volumes.
//!
//! Replacement is deferred until the tablet is unassigned or suspended and
//! carries no operation, then done in a single conditional mutation. The
//! post-condition verifies *removal of the old entries* rather than
//! presence of the new ones: a compaction may legitimately remove the new
//! file before the check runs, but nothing may resurrect the old path.

use tabletdb_common::SystemConfig;
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_metadata::{ConditionalStatus, StoredTabletFile, TabletMetadata, WalRef};
use tracing::info;

use crate::env::ManagerEnv;

fn replacement_for<'a>(path: &str, config: &'a SystemConfig) -> Option<&'a (String, String)> {
    config
        .volume_replacements
        .iter()
        .find(|(old, _)| path.starts_with(old.as_str()))
}

/// Whether any of the tablet's file or log paths sit on a decommissioned
/// volume.
pub fn references_decommissioned_volume(tm: &TabletMetadata, config: &SystemConfig) -> bool {
    tm.files()
        .iter()
        .any(|f| replacement_for(&f.path, config).is_some())
        || tm
            .logs()
            .iter()
            .any(|l| replacement_for(&l.path, config).is_some())
}

/// Rewrite the tablet's decommissioned paths in one conditional mutation.
pub async fn replace_volumes(env: &ManagerEnv, tm: &TabletMetadata) -> TabletDbResult<()> {
    let mut old_files: Vec<StoredTabletFile> = Vec::new();
    let mut new_files: Vec<StoredTabletFile> = Vec::new();
    for file in tm.files() {
        if let Some((old, new)) = replacement_for(&file.path, &env.config) {
            let mut replacement = file.clone();
            replacement.path = format!("{new}{}", &file.path[old.len()..]);
            old_files.push(file.clone());
            new_files.push(replacement);
        }
    }
    let mut old_logs: Vec<WalRef> = Vec::new();
    let mut new_logs: Vec<WalRef> = Vec::new();
    for log in tm.logs() {
        if let Some((old, new)) = replacement_for(&log.path, &env.config) {
            let mut replacement = log.clone();
            replacement.path = format!("{new}{}", &log.path[old.len()..]);
            old_logs.push(log.clone());
            new_logs.push(replacement);
        }
    }
    if old_files.is_empty() && old_logs.is_empty() {
        return Ok(());
    }

    let extent = tm.extent().clone();
    let mut mutator = env.ample.conditionally_mutate_tablets();
    {
        let mut m = mutator.mutate_tablet(extent.clone());
        // only touch tablets at rest
        m.require_absent_operation().require_absent_location();
        for (old, new) in old_files.iter().zip(&new_files) {
            m.delete_file(old.clone());
            m.put_file(new.clone());
        }
        for (old, new) in old_logs.iter().zip(&new_logs) {
            m.delete_log(old.clone());
            m.put_log(new.clone());
        }
        let check_files = old_files.clone();
        let check_logs = old_logs.clone();
        m.submit(
            move |tm| {
                // verify the old entries are gone; checking for the new
                // ones would race a compaction that already consumed them
                check_files.iter().all(|f| !tm.files().contains(f))
                    && check_logs.iter().all(|l| !tm.logs().contains(l))
            },
            "volume replacement",
        )?;
    }
    let results = mutator.process().await?;
    match results.get(&extent).map(|r| r.status) {
        Some(ConditionalStatus::Accepted) => {
            info!(
                %extent,
                files = old_files.len(),
                logs = old_logs.len(),
                "replaced decommissioned volume paths"
            );
            Ok(())
        }
        other => Err(TabletDbError::ConditionalRejected {
            extent: format!("{extent} (volume replacement: {other:?})"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tabletdb_client::rpc::{ServerConnector, TabletServerService};
    use tabletdb_common::{KeyExtent, TableId};
    use tabletdb_coordination::LocalStore;
    use tabletdb_metadata::{Ample, InMemoryAmple};

    use super::*;

    struct NoConnector;

    impl ServerConnector for NoConnector {
        fn connect(&self, _location: &str) -> Option<Arc<dyn TabletServerService>> {
            None
        }
    }

    fn config() -> SystemConfig {
        SystemConfig {
            volume_replacements: vec![("hdfs://old".to_string(), "hdfs://new".to_string())],
            table_suspend_duration: Duration::ZERO,
            ..SystemConfig::default()
        }
    }

    fn env_with(ample: Ample) -> Arc<ManagerEnv> {
        ManagerEnv::new(
            ample,
            Arc::new(LocalStore::new()),
            Arc::new(NoConnector),
            config(),
        )
    }

    async fn seed(ample: &Ample, tm: TabletMetadata) {
        let mut mutator = ample.conditionally_mutate_tablets();
        mutator
            .mutate_tablet(tm.extent().clone())
            .require_absent_tablet()
            .insert_tablet(tm)
            .submit(|_| false, "seed")
            .unwrap();
        mutator.process().await.unwrap();
    }

    fn tablet_on_old_volume() -> TabletMetadata {
        TabletMetadata::builder(KeyExtent::new(TableId::new("t"), None::<&str>, None::<&str>))
            .file(StoredTabletFile::unfenced("hdfs://old/t/f1.rf"))
            .file(StoredTabletFile::unfenced("hdfs://other/t/f2.rf"))
            .build()
    }

    #[test]
    fn detection() {
        let tm = tablet_on_old_volume();
        assert!(references_decommissioned_volume(&tm, &config()));
        let clean = TabletMetadata::builder(KeyExtent::new(
            TableId::new("t"),
            None::<&str>,
            None::<&str>,
        ))
        .file(StoredTabletFile::unfenced("hdfs://other/t/f2.rf"))
        .build();
        assert!(!references_decommissioned_volume(&clean, &config()));
    }

    #[tokio::test]
    async fn replaces_only_decommissioned_paths() {
        let ample = Ample::new(Arc::new(InMemoryAmple::new()));
        let tm = tablet_on_old_volume();
        seed(&ample, tm.clone()).await;
        let env = env_with(ample.clone());

        replace_volumes(&env, &tm).await.unwrap();

        let after = ample.read_tablet(tm.extent()).await.unwrap().unwrap();
        let paths: Vec<&str> = after.files().iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"hdfs://new/t/f1.rf"));
        assert!(paths.contains(&"hdfs://other/t/f2.rf"));
        assert!(!paths.iter().any(|p| p.starts_with("hdfs://old")));
    }
}
