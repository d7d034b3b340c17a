//! In-process implementation of [`CoordinationStore`].
//!
//! One [`LocalStore`] value is a *session* against a shared in-memory node
//! tree; [`LocalStore::new_session`] opens further sessions against the same
//! tree. Ephemeral nodes are bound to the creating session and disappear
//! when it expires, firing the same watch events a remote service would.
//! Standalone deployments run on this store; cluster tests use
//! [`LocalStore::expire_this_session`] to simulate server death.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tracing::trace;

use crate::store::{
    CoordinationStore, CreatePolicy, NodeMode, WatchEvent, WatchListener, WatcherId,
};

#[derive(Clone)]
struct Node {
    data: Vec<u8>,
    version: u64,
    /// Session that owns this node if it is ephemeral
    owner_session: Option<u64>,
    /// Sequence counter for EphemeralSequential children of this node
    seq_counter: u64,
}

struct Watch {
    path: String,
    owner_session: u64,
    listener: WatchListener,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<u64, Watch>,
    next_watcher_id: u64,
    next_session_id: u64,
    live_sessions: HashSet<u64>,
}

impl Tree {
    /// Collect the listeners to fire for an event on `path`. Actual
    /// invocation happens after the tree lock is released.
    fn listeners_for(&self, path: &str) -> Vec<WatchListener> {
        self.watches
            .values()
            .filter(|w| w.path == path)
            .map(|w| Arc::clone(&w.listener))
            .collect()
    }

    fn ensure_parents(&mut self, path: &str) {
        let mut prefix = String::new();
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        for part in &parts[..parts.len().saturating_sub(1)] {
            prefix.push('/');
            prefix.push_str(part);
            self.nodes.entry(prefix.clone()).or_insert(Node {
                data: Vec::new(),
                version: 0,
                owner_session: None,
                seq_counter: 0,
            });
        }
    }
}

/// The durable portion of a [`LocalStore`]: every persistent node plus the
/// sequence counters, which must keep climbing across restarts so lock
/// entries stay fair. Ephemeral nodes are deliberately absent; their
/// sessions are gone by definition when a snapshot is restored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStoreSnapshot {
    /// `(path, data, version, sequence counter)`
    nodes: Vec<(String, Vec<u8>, u64, u64)>,
}

/// A session against the shared in-memory coordination tree.
#[derive(Clone)]
pub struct LocalStore {
    tree: Arc<Mutex<Tree>>,
    session: u64,
}

impl LocalStore {
    /// Create a fresh tree and the first session against it.
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.next_session_id = 1;
        tree.live_sessions.insert(1);
        LocalStore {
            tree: Arc::new(Mutex::new(tree)),
            session: 1,
        }
    }

    /// Capture the persistent nodes for later [`LocalStore::restore`].
    pub fn snapshot(&self) -> LocalStoreSnapshot {
        let tree = self.tree.lock();
        LocalStoreSnapshot {
            nodes: tree
                .nodes
                .iter()
                .filter(|(_, n)| n.owner_session.is_none())
                .map(|(p, n)| (p.clone(), n.data.clone(), n.version, n.seq_counter))
                .collect(),
        }
    }

    /// Rebuild a tree from a snapshot, with a fresh first session.
    pub fn restore(snapshot: LocalStoreSnapshot) -> Self {
        let store = Self::new();
        {
            let mut tree = store.tree.lock();
            for (path, data, version, seq_counter) in snapshot.nodes {
                tree.nodes.insert(
                    path,
                    Node {
                        data,
                        version,
                        owner_session: None,
                        seq_counter,
                    },
                );
            }
        }
        store
    }

    /// Open another session against the same tree.
    pub fn new_session(&self) -> Self {
        let mut tree = self.tree.lock();
        tree.next_session_id += 1;
        let session = tree.next_session_id;
        tree.live_sessions.insert(session);
        LocalStore {
            tree: Arc::clone(&self.tree),
            session,
        }
    }

    /// Expire this handle's session: its ephemeral nodes are deleted (with
    /// watch events), its watches receive `SessionExpired`, and further
    /// mutations through this handle fail with `Disconnected`.
    pub fn expire_this_session(&self) {
        let mut to_fire: Vec<(WatchListener, WatchEvent)> = Vec::new();
        {
            let mut tree = self.tree.lock();
            if !tree.live_sessions.remove(&self.session) {
                return;
            }
            let dead: Vec<String> = tree
                .nodes
                .iter()
                .filter(|(_, n)| n.owner_session == Some(self.session))
                .map(|(p, _)| p.clone())
                .collect();
            for path in dead {
                tree.nodes.remove(&path);
                for l in tree.listeners_for(&path) {
                    to_fire.push((l, WatchEvent::Deleted(path.clone())));
                }
            }
            let own_watches: Vec<u64> = tree
                .watches
                .iter()
                .filter(|(_, w)| w.owner_session == self.session)
                .map(|(id, _)| *id)
                .collect();
            for id in own_watches {
                if let Some(w) = tree.watches.remove(&id) {
                    to_fire.push((w.listener, WatchEvent::SessionExpired));
                }
            }
            trace!(session = self.session, "session expired");
        }
        for (l, ev) in to_fire {
            l(ev);
        }
    }

    fn check_session(&self) -> TabletDbResult<()> {
        if self.tree.lock().live_sessions.contains(&self.session) {
            Ok(())
        } else {
            Err(TabletDbError::Disconnected)
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for LocalStore {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: NodeMode,
        policy: CreatePolicy,
    ) -> TabletDbResult<String> {
        self.check_session()?;
        let mut to_fire: Vec<(WatchListener, WatchEvent)> = Vec::new();
        let result = {
            let mut tree = self.tree.lock();
            tree.ensure_parents(path);

            let actual_path = match mode {
                NodeMode::EphemeralSequential => {
                    let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
                    let seq = {
                        let parent_node = tree.nodes.entry(parent.to_string()).or_insert(Node {
                            data: Vec::new(),
                            version: 0,
                            owner_session: None,
                            seq_counter: 0,
                        });
                        let seq = parent_node.seq_counter;
                        parent_node.seq_counter += 1;
                        seq
                    };
                    format!("{path}{seq:010}")
                }
                _ => path.to_string(),
            };

            let owner = match mode {
                NodeMode::Persistent => None,
                NodeMode::Ephemeral | NodeMode::EphemeralSequential => Some(self.session),
            };

            if let Some(existing) = tree.nodes.get_mut(&actual_path) {
                match policy {
                    CreatePolicy::FailIfExists => {
                        return Err(TabletDbError::AlreadyExists { path: actual_path })
                    }
                    CreatePolicy::SkipIfExists => actual_path,
                    CreatePolicy::Overwrite => {
                        existing.data = data.to_vec();
                        existing.version += 1;
                        for l in tree.listeners_for(&actual_path) {
                            to_fire.push((l, WatchEvent::Changed(actual_path.clone())));
                        }
                        actual_path
                    }
                }
            } else {
                tree.nodes.insert(
                    actual_path.clone(),
                    Node {
                        data: data.to_vec(),
                        version: 0,
                        owner_session: owner,
                        seq_counter: 0,
                    },
                );
                actual_path
            }
        };
        for (l, ev) in to_fire {
            l(ev);
        }
        Ok(result)
    }

    async fn mutate_existing(
        &self,
        path: &str,
        f: &(dyn for<'b> Fn(&'b [u8]) -> TabletDbResult<Vec<u8>> + Sync),
    ) -> TabletDbResult<Vec<u8>> {
        self.check_session()?;
        let (new_data, to_fire) = {
            let mut tree = self.tree.lock();
            let old_data = tree
                .nodes
                .get(path)
                .ok_or(TabletDbError::NotFound {
                    path: path.to_string(),
                })?
                .data
                .clone();
            let new_data = f(&old_data)?;
            // The tree lock makes the read-modify-write atomic here, so the
            // version recheck a remote store would do cannot fail.
            let node = tree.nodes.get_mut(path).ok_or(TabletDbError::NotFound {
                path: path.to_string(),
            })?;
            node.data = new_data.clone();
            node.version += 1;
            (new_data, tree.listeners_for(path))
        };
        for l in to_fire {
            l(WatchEvent::Changed(path.to_string()));
        }
        Ok(new_data)
    }

    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: u64,
    ) -> TabletDbResult<()> {
        self.check_session()?;
        let to_fire = {
            let mut tree = self.tree.lock();
            let node = tree.nodes.get_mut(path).ok_or(TabletDbError::NotFound {
                path: path.to_string(),
            })?;
            if node.version != expected_version {
                return Err(TabletDbError::VersionMismatch {
                    path: path.to_string(),
                });
            }
            node.data = data.to_vec();
            node.version += 1;
            tree.listeners_for(path)
        };
        for l in to_fire {
            l(WatchEvent::Changed(path.to_string()));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> TabletDbResult<(Vec<u8>, u64)> {
        let tree = self.tree.lock();
        tree.nodes
            .get(path)
            .map(|n| (n.data.clone(), n.version))
            .ok_or(TabletDbError::NotFound {
                path: path.to_string(),
            })
    }

    async fn get_children(&self, path: &str) -> TabletDbResult<Vec<String>> {
        let tree = self.tree.lock();
        let prefix = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        Ok(tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect())
    }

    async fn exists(&self, path: &str) -> TabletDbResult<bool> {
        Ok(self.tree.lock().nodes.contains_key(path))
    }

    async fn delete(&self, path: &str) -> TabletDbResult<()> {
        self.check_session()?;
        let to_fire = {
            let mut tree = self.tree.lock();
            if tree.nodes.remove(path).is_none() {
                return Err(TabletDbError::NotFound {
                    path: path.to_string(),
                });
            }
            tree.listeners_for(path)
        };
        for l in to_fire {
            l(WatchEvent::Deleted(path.to_string()));
        }
        Ok(())
    }

    fn watch(&self, path: &str, listener: WatchListener) -> WatcherId {
        let mut tree = self.tree.lock();
        tree.next_watcher_id += 1;
        let id = tree.next_watcher_id;
        tree.watches.insert(
            id,
            Watch {
                path: path.to_string(),
                owner_session: self.session,
                listener,
            },
        );
        WatcherId(id)
    }

    fn unwatch(&self, id: WatcherId) {
        self.tree.lock().watches.remove(&id.0);
    }

    fn session_id(&self) -> u64 {
        self.session
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn create_get_delete() {
        let store = LocalStore::new();
        store
            .create("/a/b/c", b"hello", NodeMode::Persistent, CreatePolicy::FailIfExists)
            .await
            .unwrap();
        let (data, version) = store.get("/a/b/c").await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(version, 0);
        // parents were created
        assert!(store.exists("/a/b").await.unwrap());
        assert_eq!(store.get_children("/a/b").await.unwrap(), vec!["c"]);

        store.delete("/a/b/c").await.unwrap();
        assert!(!store.exists("/a/b/c").await.unwrap());
        assert!(matches!(
            store.get("/a/b/c").await,
            Err(TabletDbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn create_policies() {
        let store = LocalStore::new();
        store
            .create("/n", b"one", NodeMode::Persistent, CreatePolicy::FailIfExists)
            .await
            .unwrap();
        assert!(matches!(
            store
                .create("/n", b"two", NodeMode::Persistent, CreatePolicy::FailIfExists)
                .await,
            Err(TabletDbError::AlreadyExists { .. })
        ));
        store
            .create("/n", b"two", NodeMode::Persistent, CreatePolicy::SkipIfExists)
            .await
            .unwrap();
        assert_eq!(store.get("/n").await.unwrap().0, b"one");
        store
            .create("/n", b"two", NodeMode::Persistent, CreatePolicy::Overwrite)
            .await
            .unwrap();
        let (data, version) = store.get("/n").await.unwrap();
        assert_eq!(data, b"two");
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn sequential_nodes_number_in_order() {
        let store = LocalStore::new();
        let a = store
            .create(
                "/locks/x/zlock#u#",
                b"",
                NodeMode::EphemeralSequential,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap();
        let b = store
            .create(
                "/locks/x/zlock#u#",
                b"",
                NodeMode::EphemeralSequential,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap();
        assert_eq!(a, "/locks/x/zlock#u#0000000000");
        assert_eq!(b, "/locks/x/zlock#u#0000000001");
    }

    #[tokio::test]
    async fn session_expiry_deletes_ephemerals_and_notifies() {
        let service = LocalStore::new();
        let dying = service.new_session();
        dying
            .create("/e", b"", NodeMode::Ephemeral, CreatePolicy::FailIfExists)
            .await
            .unwrap();

        let deletions = Arc::new(AtomicUsize::new(0));
        let deletions2 = Arc::clone(&deletions);
        service.watch(
            "/e",
            Arc::new(move |ev| {
                if matches!(ev, WatchEvent::Deleted(_)) {
                    deletions2.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        dying.expire_this_session();
        assert!(!service.exists("/e").await.unwrap());
        assert_eq!(deletions.load(Ordering::SeqCst), 1);
        assert!(matches!(
            dying
                .create("/f", b"", NodeMode::Ephemeral, CreatePolicy::FailIfExists)
                .await,
            Err(TabletDbError::Disconnected)
        ));
        // reads still work through an expired handle
        assert!(service.exists("/").await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_restores_persistent_state_only() {
        let store = LocalStore::new();
        store
            .create("/conf/t1", b"v1", NodeMode::Persistent, CreatePolicy::FailIfExists)
            .await
            .unwrap();
        store
            .create("/e", b"", NodeMode::Ephemeral, CreatePolicy::FailIfExists)
            .await
            .unwrap();
        store
            .create(
                "/locks/x/zlock#u#",
                b"",
                NodeMode::EphemeralSequential,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap();

        let restored = LocalStore::restore(store.snapshot());
        assert_eq!(restored.get("/conf/t1").await.unwrap().0, b"v1");
        // ephemerals belong to sessions that no longer exist
        assert!(!restored.exists("/e").await.unwrap());
        // sequence counters keep climbing so lock fairness survives restarts
        let next = restored
            .create(
                "/locks/x/zlock#u#",
                b"",
                NodeMode::EphemeralSequential,
                CreatePolicy::FailIfExists,
            )
            .await
            .unwrap();
        assert_eq!(next, "/locks/x/zlock#u#0000000001");
    }

    #[tokio::test]
    async fn mutate_existing_applies_and_bumps_version() {
        let store = LocalStore::new();
        store
            .create("/counter", b"0", NodeMode::Persistent, CreatePolicy::FailIfExists)
            .await
            .unwrap();
        let new = store
            .mutate_existing("/counter", &|old| {
                let n: u64 = std::str::from_utf8(old).unwrap().parse().unwrap();
                Ok((n + 1).to_string().into_bytes())
            })
            .await
            .unwrap();
        assert_eq!(new, b"1");
        assert_eq!(store.get("/counter").await.unwrap().1, 1);
    }
}
