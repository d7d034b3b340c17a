//! Adapter exposing a coordination-service subtree as a [`SystemKv`], which
//! is what the META FATE store runs on.

use std::sync::Arc;

use async_trait::async_trait;
use tabletdb_coordination::store::{CoordinationStore, CreatePolicy, NodeMode};
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_metadata::SystemKv;

/// [`SystemKv`] over nodes under a fixed root path.
pub struct ZooKv {
    store: Arc<dyn CoordinationStore>,
    root: String,
}

impl ZooKv {
    /// Keys become children of `root`.
    pub fn new(store: Arc<dyn CoordinationStore>, root: impl Into<String>) -> Self {
        ZooKv {
            store,
            root: root.into(),
        }
    }

    fn path(&self, key: &str) -> String {
        format!("{}/{}", self.root, key)
    }
}

#[async_trait]
impl SystemKv for ZooKv {
    async fn get(&self, key: &str) -> TabletDbResult<Option<(Vec<u8>, u64)>> {
        match self.store.get(&self.path(key)).await {
            Ok(v) => Ok(Some(v)),
            Err(TabletDbError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put_new(&self, key: &str, value: &[u8]) -> TabletDbResult<bool> {
        match self
            .store
            .create(
                &self.path(key),
                value,
                NodeMode::Persistent,
                CreatePolicy::FailIfExists,
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(TabletDbError::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn cas(&self, key: &str, expected_version: u64, value: &[u8]) -> TabletDbResult<bool> {
        match self
            .store
            .set_data(&self.path(key), value, expected_version)
            .await
        {
            Ok(()) => Ok(true),
            Err(TabletDbError::VersionMismatch { .. } | TabletDbError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> TabletDbResult<()> {
        match self.store.delete(&self.path(key)).await {
            Ok(()) | Err(TabletDbError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> TabletDbResult<Vec<String>> {
        match self.store.get_children(&self.root).await {
            Ok(children) => Ok(children),
            Err(TabletDbError::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use tabletdb_coordination::LocalStore;

    use super::*;

    #[tokio::test]
    async fn kv_over_coordination_tree() {
        let kv = ZooKv::new(Arc::new(LocalStore::new()), "/fate");
        assert!(kv.get("abc").await.unwrap().is_none());
        assert!(kv.put_new("abc", b"one").await.unwrap());
        assert!(!kv.put_new("abc", b"two").await.unwrap());
        let (data, version) = kv.get("abc").await.unwrap().unwrap();
        assert_eq!(data, b"one");
        assert!(kv.cas("abc", version, b"two").await.unwrap());
        assert!(!kv.cas("abc", version, b"three").await.unwrap());
        assert_eq!(kv.list().await.unwrap(), vec!["abc"]);
        kv.delete("abc").await.unwrap();
        kv.delete("abc").await.unwrap();
    }
}
