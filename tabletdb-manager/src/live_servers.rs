//! The set of live tablet servers, observed from their service locks.

use std::collections::HashSet;
use std::sync::Arc;

use tabletdb_common::TServerInstance;
use tabletdb_coordination::lock::validate_and_sort;
use tabletdb_coordination::paths;
use tabletdb_coordination::store::CoordinationStore;
use tabletdb_errors::{TabletDbError, TabletDbResult};

/// Reads the live tablet-server set from the lock tree. A server is live
/// exactly while it holds the lowest entry in its own lock directory; its
/// instance identity carries that entry's sequence, so a restarted server
/// is a different instance.
pub struct LiveTServerSet {
    store: Arc<dyn CoordinationStore>,
}

impl LiveTServerSet {
    /// Observe liveness through `store`.
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        LiveTServerSet { store }
    }

    /// A fresh snapshot of the live servers. Each call re-reads the lock
    /// tree; the watcher deliberately re-snapshots when it suspects a
    /// stale view.
    pub async fn snapshot(&self) -> TabletDbResult<HashSet<TServerInstance>> {
        let locations = match self.store.get_children(paths::TSERVER_LOCKS_ROOT).await {
            Ok(children) => children,
            Err(TabletDbError::NotFound { .. }) => return Ok(HashSet::new()),
            Err(e) => return Err(e),
        };
        let mut live = HashSet::with_capacity(locations.len());
        for location in locations {
            if let Some(instance) = self.instance_of(&location).await? {
                live.insert(instance);
            }
        }
        Ok(live)
    }

    /// The live instance at `location`, if its lock is held.
    pub async fn instance_of(&self, location: &str) -> TabletDbResult<Option<TServerInstance>> {
        let dir = paths::tserver_lock(location);
        let children = match self.store.get_children(&dir).await {
            Ok(children) => children,
            Err(TabletDbError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let children = validate_and_sort(children);
        let Some(lowest) = children.first() else {
            return Ok(None);
        };
        // the sequence in the entry name is the instance's session
        let seq = lowest
            .rsplit('#')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| TabletDbError::Internal(format!("unparseable lock entry {lowest}")))?;
        Ok(Some(TServerInstance::new(location, seq)))
    }
}
