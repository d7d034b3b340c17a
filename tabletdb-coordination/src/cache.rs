//! Read-mostly cache over a [`CoordinationStore`].
//!
//! Configuration bundles (table, namespace, system) are read far more often
//! than they change, so reads are served from this cache and treated as
//! authoritative. The contract is that every writer invalidates the paths it
//! touched; mutations through this wrapper do so automatically, while
//! out-of-band writers call [`CachedStore::invalidate_matching`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tabletdb_errors::TabletDbResult;
use tracing::trace;

use crate::store::{
    CoordinationStore, CreatePolicy, NodeMode, WatchListener, WatcherId,
};

#[derive(Default)]
struct CacheState {
    data: HashMap<String, (Vec<u8>, u64)>,
    children: HashMap<String, Vec<String>>,
    existence: HashMap<String, bool>,
}

impl CacheState {
    fn invalidate<P: Fn(&str) -> bool>(&mut self, pred: P) {
        self.data.retain(|path, _| !pred(path));
        self.existence.retain(|path, _| !pred(path));
        // A child list is affected both by its own path and by its
        // children's paths.
        self.children
            .retain(|path, names| !pred(path) && !names.iter().any(|n| pred(&format!("{path}/{n}"))));
    }
}

/// A caching wrapper around a [`CoordinationStore`].
pub struct CachedStore {
    inner: Arc<dyn CoordinationStore>,
    cache: RwLock<CacheState>,
}

impl CachedStore {
    /// Wrap `inner` with an empty cache.
    pub fn new(inner: Arc<dyn CoordinationStore>) -> Self {
        CachedStore {
            inner,
            cache: RwLock::new(CacheState::default()),
        }
    }

    /// The uncached store underneath.
    pub fn uncached(&self) -> &Arc<dyn CoordinationStore> {
        &self.inner
    }

    /// Drop every cached entry whose path matches `pred`.
    pub fn invalidate_matching<P: Fn(&str) -> bool>(&self, pred: P) {
        self.cache.write().invalidate(pred);
    }

    /// Drop the whole cache.
    pub fn invalidate_all(&self) {
        let mut cache = self.cache.write();
        *cache = CacheState::default();
    }

    fn invalidate_path(&self, path: &str) {
        let path = path.to_string();
        self.cache
            .write()
            .invalidate(|p| p == path || p.starts_with(&format!("{path}/")));
    }
}

#[async_trait]
impl CoordinationStore for CachedStore {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: NodeMode,
        policy: CreatePolicy,
    ) -> TabletDbResult<String> {
        let actual = self.inner.create(path, data, mode, policy).await?;
        self.invalidate_path(&actual);
        // the parent's child list changed too
        if let Some((parent, _)) = actual.rsplit_once('/') {
            let parent = parent.to_string();
            self.cache.write().children.remove(&parent);
        }
        Ok(actual)
    }

    async fn mutate_existing(
        &self,
        path: &str,
        f: &(dyn for<'b> Fn(&'b [u8]) -> TabletDbResult<Vec<u8>> + Sync),
    ) -> TabletDbResult<Vec<u8>> {
        let result = self.inner.mutate_existing(path, f).await;
        self.invalidate_path(path);
        result
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: u64,
    ) -> TabletDbResult<()> {
        let result = self.inner.set_data(path, data, expected_version).await;
        self.invalidate_path(path);
        result
    }

    async fn get(&self, path: &str) -> TabletDbResult<(Vec<u8>, u64)> {
        if let Some(hit) = self.cache.read().data.get(path) {
            trace!(path, "cache hit");
            return Ok(hit.clone());
        }
        let fetched = self.inner.get(path).await?;
        self.cache
            .write()
            .data
            .insert(path.to_string(), fetched.clone());
        Ok(fetched)
    }

    async fn get_children(&self, path: &str) -> TabletDbResult<Vec<String>> {
        if let Some(hit) = self.cache.read().children.get(path) {
            return Ok(hit.clone());
        }
        let fetched = self.inner.get_children(path).await?;
        self.cache
            .write()
            .children
            .insert(path.to_string(), fetched.clone());
        Ok(fetched)
    }

    async fn exists(&self, path: &str) -> TabletDbResult<bool> {
        if let Some(hit) = self.cache.read().existence.get(path) {
            return Ok(*hit);
        }
        let fetched = self.inner.exists(path).await?;
        self.cache
            .write()
            .existence
            .insert(path.to_string(), fetched);
        Ok(fetched)
    }

    async fn delete(&self, path: &str) -> TabletDbResult<()> {
        let result = self.inner.delete(path).await;
        self.invalidate_path(path);
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.cache.write().children.remove(parent);
        }
        result
    }

    fn watch(&self, path: &str, listener: WatchListener) -> WatcherId {
        self.inner.watch(path, listener)
    }

    fn unwatch(&self, id: WatcherId) {
        self.inner.unwatch(id)
    }

    fn session_id(&self) -> u64 {
        self.inner.session_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalStore;

    #[tokio::test]
    async fn serves_reads_from_cache_until_invalidated() {
        let raw = LocalStore::new();
        raw.create("/conf/t1", b"v1", NodeMode::Persistent, CreatePolicy::FailIfExists)
            .await
            .unwrap();
        let cached = CachedStore::new(Arc::new(raw.clone()));

        assert_eq!(cached.get("/conf/t1").await.unwrap().0, b"v1");

        // write behind the cache's back
        raw.create("/conf/t1", b"v2", NodeMode::Persistent, CreatePolicy::Overwrite)
            .await
            .unwrap();
        assert_eq!(cached.get("/conf/t1").await.unwrap().0, b"v1");

        cached.invalidate_matching(|p| p.starts_with("/conf"));
        assert_eq!(cached.get("/conf/t1").await.unwrap().0, b"v2");
    }

    #[tokio::test]
    async fn own_mutations_invalidate() {
        let raw = LocalStore::new();
        raw.create("/n", b"a", NodeMode::Persistent, CreatePolicy::FailIfExists)
            .await
            .unwrap();
        let cached = CachedStore::new(Arc::new(raw));
        assert_eq!(cached.get("/n").await.unwrap().0, b"a");
        cached
            .create("/n", b"b", NodeMode::Persistent, CreatePolicy::Overwrite)
            .await
            .unwrap();
        assert_eq!(cached.get("/n").await.unwrap().0, b"b");
    }

    #[tokio::test]
    async fn child_lists_invalidate_on_create_and_delete() {
        let raw = LocalStore::new();
        raw.create("/d/a", b"", NodeMode::Persistent, CreatePolicy::FailIfExists)
            .await
            .unwrap();
        let cached = CachedStore::new(Arc::new(raw));
        assert_eq!(cached.get_children("/d").await.unwrap(), vec!["a"]);
        cached
            .create("/d/b", b"", NodeMode::Persistent, CreatePolicy::FailIfExists)
            .await
            .unwrap();
        let mut children = cached.get_children("/d").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["a", "b"]);
        cached.delete("/d/a").await.unwrap();
        assert_eq!(cached.get_children("/d").await.unwrap(), vec!["b"]);
    }
}
