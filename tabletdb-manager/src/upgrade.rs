//! Prepare-for-upgrade: a singleton marker that refuses to appear while
//! the cluster is still doing work.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tabletdb_coordination::lock::validate_and_sort;
use tabletdb_coordination::paths;
use tabletdb_coordination::store::{CoordinationStore, CreatePolicy, NodeMode};
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_fate::FateStore;
use tracing::info;

/// Write the `/prepare-for-upgrade` marker.
///
/// Refused while the manager lock is held (a live manager could start new
/// work) or while either FATE store has any transaction at all: an upgrade
/// must not race in-flight multi-step operations.
pub async fn prepare_upgrade<R1, R2>(
    store: Arc<dyn CoordinationStore>,
    meta_fate: &FateStore<R1>,
    user_fate: &FateStore<R2>,
) -> TabletDbResult<()>
where
    R1: Serialize + DeserializeOwned,
    R2: Serialize + DeserializeOwned,
{
    let manager_lock_holders = match store.get_children(paths::MANAGER_LOCK).await {
        Ok(children) => validate_and_sort(children),
        Err(TabletDbError::NotFound { .. }) => Vec::new(),
        Err(e) => return Err(e),
    };
    if !manager_lock_holders.is_empty() {
        return Err(TabletDbError::InvalidArgument(
            "cannot prepare for upgrade: a manager is running".into(),
        ));
    }

    let meta_txns = meta_fate.list().await?;
    let user_txns = user_fate.list().await?;
    if !meta_txns.is_empty() || !user_txns.is_empty() {
        return Err(TabletDbError::InvalidArgument(format!(
            "cannot prepare for upgrade: {} FATE transaction(s) exist",
            meta_txns.len() + user_txns.len()
        )));
    }

    store
        .create(
            paths::PREPARE_FOR_UPGRADE,
            b"",
            NodeMode::Persistent,
            CreatePolicy::SkipIfExists,
        )
        .await?;
    info!("prepare-for-upgrade marker written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tabletdb_common::FateInstanceType;
    use tabletdb_coordination::lock::NullLockWatcher;
    use tabletdb_coordination::{LocalStore, ServiceLock};
    use tabletdb_fate::ZooKv;
    use tabletdb_metadata::InMemoryAmple;

    use super::*;

    fn stores(local: &LocalStore) -> (FateStore<Vec<u8>>, FateStore<Vec<u8>>) {
        (
            FateStore::new(
                Arc::new(ZooKv::new(Arc::new(local.clone()), paths::FATE_ROOT)),
                FateInstanceType::Meta,
            ),
            FateStore::new(InMemoryAmple::new().system_kv(), FateInstanceType::User),
        )
    }

    #[tokio::test]
    async fn refuses_with_live_manager_or_fate_work() {
        let local = LocalStore::new();
        let (meta, user) = stores(&local);

        // live manager
        let lock = Arc::new(ServiceLock::new(
            Arc::new(local.clone()),
            paths::MANAGER_LOCK,
            Arc::new(NullLockWatcher),
        ));
        lock.acquire(b"manager").await.unwrap();
        assert!(prepare_upgrade(Arc::new(local.clone()), &meta, &user)
            .await
            .is_err());
        lock.unlock().await.unwrap();

        // pending fate transaction
        let id = meta.create().await.unwrap();
        assert!(prepare_upgrade(Arc::new(local.clone()), &meta, &user)
            .await
            .is_err());
        meta.delete(&id).await.unwrap();

        prepare_upgrade(Arc::new(local.clone()), &meta, &user)
            .await
            .unwrap();
        assert!(local.exists(paths::PREPARE_FOR_UPGRADE).await.unwrap());
        // idempotent
        prepare_upgrade(Arc::new(local), &meta, &user).await.unwrap();
    }
}
