//! A hosted tablet's in-memory state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::Mutex;
use tabletdb_common::{Durability, Key, KeyExtent, Mutation, UpdateValue, Value};
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_metadata::{MetadataTime, StoredTabletFile};

use crate::visibility;

struct TabletInner {
    /// The in-memory sorted view of recent writes
    map: BTreeMap<Key, Value>,
    /// Files backing this tablet (updated by refresh after bulk import)
    files: BTreeSet<StoredTabletFile>,
    /// Time type and high-water counter, from the metadata row
    time: MetadataTime,
    /// Next commit sequence
    next_seq: u64,
    /// Commit sessions granted but not yet committed/aborted
    open_sessions: usize,
    closed: bool,
}

/// One hosted tablet.
///
/// All in-memory state is owned by exactly one server at a time; the
/// manager hands ownership over by writing a `future` location and observes
/// this server switch it to `current`.
pub struct Tablet {
    extent: KeyExtent,
    default_durability: Durability,
    inner: Mutex<TabletInner>,
}

impl Tablet {
    /// Open a tablet from its metadata-derived state.
    pub fn new(
        extent: KeyExtent,
        files: BTreeSet<StoredTabletFile>,
        time: MetadataTime,
        default_durability: Durability,
    ) -> Arc<Tablet> {
        Arc::new(Tablet {
            extent,
            default_durability,
            inner: Mutex::new(TabletInner {
                map: BTreeMap::new(),
                files,
                time,
                next_seq: 1,
                open_sessions: 0,
                closed: false,
            }),
        })
    }

    /// The extent this tablet covers.
    pub fn extent(&self) -> &KeyExtent {
        &self.extent
    }

    /// The table's default durability, the floor for every write here.
    pub fn default_durability(&self) -> Durability {
        self.default_durability
    }

    /// Current file set.
    pub fn files(&self) -> BTreeSet<StoredTabletFile> {
        self.inner.lock().files.clone()
    }

    /// Replace the file set after a metadata refresh.
    pub fn set_files(&self, files: BTreeSet<StoredTabletFile>) {
        self.inner.lock().files = files;
    }

    /// Number of files, for admission checks.
    pub fn file_count(&self) -> usize {
        self.inner.lock().files.len()
    }

    /// Whether this tablet has been closed for unload.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Grant a commit session covering `mutations`, or report the tablet
    /// closed. Commit order is session-grant order; the lock here is what
    /// makes that true.
    pub(crate) fn grant_session(self: &Arc<Self>) -> Option<CommitSession> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return None;
        }
        inner.open_sessions += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        Some(CommitSession {
            tablet: Arc::clone(self),
            seq,
            done: false,
        })
    }

    fn assign_timestamp(time: &mut MetadataTime) -> i64 {
        match time {
            MetadataTime::Logical(n) => {
                *n += 1;
                *n as i64
            }
            MetadataTime::Millis(high) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                // never move backwards, even against a stepping clock
                *high = (*high).max(now);
                *high as i64
            }
        }
    }

    fn apply_locked(inner: &mut TabletInner, extent: &KeyExtent, mutations: &[Mutation]) {
        for mutation in mutations {
            debug_assert!(extent.contains_row(&mutation.row));
            let ts = Self::assign_timestamp(&mut inner.time);
            for update in &mutation.updates {
                let key = Key {
                    row: mutation.row.clone(),
                    family: update.family.clone(),
                    qualifier: update.qualifier.clone(),
                    visibility: update.visibility.clone(),
                    timestamp: update.timestamp.unwrap_or(ts),
                };
                match &update.value {
                    UpdateValue::Put(v) => {
                        inner.map.insert(key, Value(v.clone()));
                    }
                    UpdateValue::Delete => {
                        inner.map.remove(&key);
                    }
                }
            }
        }
    }

    /// Apply recovered mutations directly, bypassing sessions; used only
    /// while the tablet is being opened and nothing else can see it.
    pub fn apply_recovered(&self, mutations: &[Mutation]) {
        let mut inner = self.inner.lock();
        Self::apply_locked(&mut inner, &self.extent, mutations);
    }

    /// The visible cells of `row` under `auths`, newest version first
    /// within each cell. Cells whose visibility fails to parse are hidden.
    pub fn scan_row(
        &self,
        row: &[u8],
        auths: &tabletdb_common::Authorizations,
    ) -> Vec<(Key, Value)> {
        let inner = self.inner.lock();
        let start = Key {
            row: Bytes::copy_from_slice(row),
            family: Bytes::new(),
            qualifier: Bytes::new(),
            visibility: Bytes::new(),
            timestamp: i64::MAX,
        };
        inner
            .map
            .range(start..)
            .take_while(|(k, _)| k.row.as_ref() == row)
            .filter(|(k, _)| visibility::can_see(&k.visibility, auths).unwrap_or(false))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Close the tablet: refuse new sessions and wait for granted ones to
    /// finish, so everything committed here is also logged.
    pub async fn close(&self) -> TabletDbResult<()> {
        {
            let mut inner = self.inner.lock();
            inner.closed = true;
        }
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
        loop {
            if self.inner.lock().open_sessions == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TabletDbError::TimedOut(std::time::Duration::from_secs(30)));
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    /// Count of in-memory entries, for tests and status reporting.
    pub fn in_memory_entries(&self) -> usize {
        self.inner.lock().map.len()
    }
}

/// A granted slot in a tablet's commit order.
///
/// A session that is neither committed nor aborted would wedge
/// [`Tablet::close`]; the drop guard aborts so an error path cannot leak
/// one.
pub struct CommitSession {
    tablet: Arc<Tablet>,
    seq: u64,
    done: bool,
}

impl CommitSession {
    /// The commit sequence this session occupies.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Resolve the effective durability for a write in this session.
    pub fn durability(&self, requested: Durability) -> Durability {
        Durability::resolve(requested, self.tablet.default_durability)
    }

    /// Merge the mutations into the tablet's in-memory state. The caller
    /// must have already established WAL durability for them (unless the
    /// effective durability was `None`).
    pub fn commit(mut self, mutations: &[Mutation]) {
        let mut inner = self.tablet.inner.lock();
        Tablet::apply_locked(&mut inner, &self.tablet.extent, mutations);
        inner.open_sessions -= 1;
        self.done = true;
    }

    /// Give up the slot without writing.
    pub fn abort(mut self) {
        self.tablet.inner.lock().open_sessions -= 1;
        self.done = true;
    }
}

impl Drop for CommitSession {
    fn drop(&mut self) {
        if !self.done {
            self.tablet.inner.lock().open_sessions -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use tabletdb_common::{Authorizations, TableId};

    use super::*;

    fn tablet() -> Arc<Tablet> {
        Tablet::new(
            KeyExtent::new(TableId::new("t"), None::<&str>, None::<&str>),
            BTreeSet::new(),
            MetadataTime::Logical(0),
            Durability::Sync,
        )
    }

    #[test]
    fn commit_applies_and_scan_sees() {
        let t = tablet();
        let session = t.grant_session().unwrap();
        session.commit(&[Mutation::new("r1").put("f", "q", "v1")]);
        let cells = t.scan_row(b"r1", &Authorizations::empty());
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].1, Value(Bytes::from("v1")));
        assert!(t.scan_row(b"r2", &Authorizations::empty()).is_empty());
    }

    #[test]
    fn logical_time_orders_versions() {
        let t = tablet();
        t.grant_session()
            .unwrap()
            .commit(&[Mutation::new("r").put("f", "q", "old")]);
        t.grant_session()
            .unwrap()
            .commit(&[Mutation::new("r").put("f", "q", "new")]);
        let cells = t.scan_row(b"r", &Authorizations::empty());
        // newest first
        assert_eq!(cells[0].1, Value(Bytes::from("new")));
        assert_eq!(cells.len(), 2);
        assert!(cells[0].0.timestamp > cells[1].0.timestamp);
    }

    #[test]
    fn visibility_filters_scans() {
        let t = tablet();
        t.grant_session().unwrap().commit(&[
            Mutation::new("r").put_visible("f", "secret", "admin", "v")
        ]);
        assert!(t.scan_row(b"r", &Authorizations::empty()).is_empty());
        let cells = t.scan_row(b"r", &Authorizations::new(["admin"]));
        assert_eq!(cells.len(), 1);
    }

    #[tokio::test]
    async fn close_waits_for_sessions_then_refuses() {
        let t = tablet();
        let session = t.grant_session().unwrap();
        let t2 = Arc::clone(&t);
        let closer = tokio::spawn(async move { t2.close().await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(t.is_closed());
        session.commit(&[Mutation::new("r").put("f", "q", "v")]);
        closer.await.unwrap().unwrap();
        assert!(t.grant_session().is_none());
    }
}
