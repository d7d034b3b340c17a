//! The service lock: a mutually exclusive, fair, failure-detecting lock
//! built from sequential-ephemeral children of a lock directory.
//!
//! Each candidate creates a child named `zlock#<uuid>#<seq>`; the candidate
//! owning the lowest sequence holds the lock, and every other candidate
//! watches the candidate group immediately preceding its own. Holding the
//! lock is only meaningful while the ephemeral node exists, so lock-guarded
//! work re-verifies the node before anything irreversible
//! ([`ServiceLock::verify_lock_at_source`]).

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{CoordinationStore, CreatePolicy, NodeMode, WatchEvent};

/// Name prefix of every lock entry.
const ZLOCK_PREFIX: &str = "zlock#";

/// Notification surface for lock-state transitions.
pub trait LockWatcher: Send + Sync {
    /// The lock was definitively lost (node deleted or session expired).
    /// The holder must stop all lock-guarded work.
    fn lost_lock(&self, reason: &str);

    /// The lock's node can no longer be monitored; treat as lost.
    fn unable_to_monitor(&self, reason: &str);
}

/// Serialized identity of a held service lock: `path#uuid#seq`.
///
/// Remote observers use this to verify the holder is still alive without
/// talking to it: the lock directory is listed and the entry matched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct LockId {
    /// The lock directory
    pub path: String,
    /// The holder's candidate uuid
    pub uuid: Uuid,
    /// The holder's sequence number
    pub seq: u64,
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}#{:010}", self.path, self.uuid, self.seq)
    }
}

impl FromStr for LockId {
    type Err = TabletDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('#');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(path), Some(uuid_str), Some(seq_str), None) => {
                let uuid = Uuid::parse_str(uuid_str).map_err(|_| {
                    TabletDbError::InvalidArgument(format!("bad lock uuid: {uuid_str}"))
                })?;
                // round-trip equality rejects non-canonical spellings
                if uuid.to_string() != uuid_str {
                    return Err(TabletDbError::InvalidArgument(format!(
                        "non-canonical lock uuid: {uuid_str}"
                    )));
                }
                if seq_str.len() != 10 || !seq_str.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(TabletDbError::InvalidArgument(format!(
                        "bad lock sequence: {seq_str}"
                    )));
                }
                let seq = seq_str
                    .parse()
                    .map_err(|_| TabletDbError::InvalidArgument(format!("bad lock sequence: {seq_str}")))?;
                Ok(LockId {
                    path: path.to_string(),
                    uuid,
                    seq,
                })
            }
            _ => Err(TabletDbError::InvalidArgument(format!(
                "lock id must look like path#uuid#seq, got: {s}"
            ))),
        }
    }
}

/// Parse a child entry name `zlock#<uuid>#<10-digit-seq>`. Returns `None`
/// for anything non-conformant, including uuids that do not round-trip to
/// the same string.
fn parse_entry(name: &str) -> Option<(Uuid, u64)> {
    let rest = name.strip_prefix(ZLOCK_PREFIX)?;
    let (uuid_str, seq_str) = rest.split_once('#')?;
    let uuid = Uuid::parse_str(uuid_str).ok()?;
    if uuid.to_string() != uuid_str {
        return None;
    }
    if seq_str.len() != 10 || !seq_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((uuid, seq_str.parse().ok()?))
}

/// Filter to conformant entries and sort ascending by sequence number.
pub fn validate_and_sort(mut children: Vec<String>) -> Vec<String> {
    children.retain(|c| parse_entry(c).is_some());
    children.sort_by_key(|c| parse_entry(c).map(|(_, seq)| seq));
    children
}

/// Given the conformant, sequence-sorted `children` of a lock directory and
/// our own entry, find the entry to watch: the *lowest* member of the
/// candidate group (same `zlock#<uuid>#` prefix) immediately preceding ours.
///
/// Fails if `own` has no predecessor, i.e. it is the lowest entry.
pub fn find_lowest_prev_prefix(children: &[String], own: &str) -> TabletDbResult<String> {
    let pos = children
        .iter()
        .position(|c| c == own)
        .ok_or_else(|| TabletDbError::InvalidArgument(format!("entry {own} not in children")))?;
    if pos == 0 {
        return Err(TabletDbError::InvalidArgument(format!(
            "entry {own} has no predecessor"
        )));
    }
    let prev = &children[pos - 1];
    let prefix_end = prev.rfind('#').expect("conformant entries contain '#'") + 1;
    let prev_prefix = &prev[..prefix_end];
    let mut lowest = pos - 1;
    for i in (0..pos - 1).rev() {
        if children[i].starts_with(prev_prefix) {
            lowest = i;
        } else {
            break;
        }
    }
    Ok(children[lowest].clone())
}

/// A candidate for (and possibly holder of) a service lock.
pub struct ServiceLock {
    store: Arc<dyn CoordinationStore>,
    /// Lock directory path
    path: String,
    uuid: Uuid,
    /// Name of our entry under `path`, once created
    entry: Mutex<Option<String>>,
    held: AtomicBool,
    watcher: Arc<dyn LockWatcher>,
}

impl ServiceLock {
    /// Create a candidate for the lock at `path`.
    pub fn new(store: Arc<dyn CoordinationStore>, path: impl Into<String>, watcher: Arc<dyn LockWatcher>) -> Self {
        ServiceLock {
            store,
            path: path.into(),
            uuid: Uuid::new_v4(),
            entry: Mutex::new(None),
            held: AtomicBool::new(false),
            watcher,
        }
    }

    /// Whether the lock was held at the last observation. A `true` here is
    /// advisory; see [`Self::verify_lock_at_source`].
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// The serialized identity of the held lock, if held.
    pub fn lock_id(&self) -> Option<LockId> {
        if !self.is_held() {
            return None;
        }
        let entry = self.entry.lock();
        let name = entry.as_ref()?;
        let (uuid, seq) = parse_entry(name)?;
        Some(LockId {
            path: self.path.clone(),
            uuid,
            seq,
        })
    }

    async fn create_entry(&self, data: &[u8]) -> TabletDbResult<String> {
        let prefix = format!("{}/{}{}#", self.path, ZLOCK_PREFIX, self.uuid);
        let created = self
            .store
            .create(&prefix, data, NodeMode::EphemeralSequential, CreatePolicy::FailIfExists)
            .await?;
        let name = created
            .rsplit_once('/')
            .map(|(_, n)| n.to_string())
            .ok_or_else(|| TabletDbError::Internal(format!("bad created path: {created}")))?;
        *self.entry.lock() = Some(name.clone());
        Ok(name)
    }

    /// Acquire the lock, waiting for predecessors to release or die.
    /// `data` is stored in our lock entry (typically the serialized service
    /// descriptor).
    pub async fn acquire(self: &Arc<Self>, data: &[u8]) -> TabletDbResult<()> {
        let own = self.create_entry(data).await?;
        loop {
            let children = validate_and_sort(self.store.get_children(&self.path).await?);
            if children.first().map(String::as_str) == Some(own.as_str()) {
                self.mark_held(&own);
                info!(path = %self.path, entry = %own, "service lock acquired");
                return Ok(());
            }
            let prev = find_lowest_prev_prefix(&children, &own)?;
            let prev_path = format!("{}/{}", self.path, prev);
            debug!(path = %self.path, entry = %own, watching = %prev, "waiting for predecessor");

            let notify = Arc::new(Notify::new());
            let notify2 = Arc::clone(&notify);
            let watch_id = self.store.watch(
                &prev_path,
                Arc::new(move |ev| {
                    if matches!(ev, WatchEvent::Deleted(_) | WatchEvent::SessionExpired) {
                        notify2.notify_one();
                    }
                }),
            );
            // the predecessor may have vanished between listing and watching
            if self.store.exists(&prev_path).await? {
                notify.notified().await;
            }
            self.store.unwatch(watch_id);
        }
    }

    /// Single non-blocking attempt: acquire if we end up lowest, otherwise
    /// withdraw the entry and return `false`.
    pub async fn try_acquire(self: &Arc<Self>, data: &[u8]) -> TabletDbResult<bool> {
        let own = self.create_entry(data).await?;
        let children = validate_and_sort(self.store.get_children(&self.path).await?);
        if children.first().map(String::as_str) == Some(own.as_str()) {
            self.mark_held(&own);
            info!(path = %self.path, entry = %own, "service lock acquired");
            Ok(true)
        } else {
            let own_path = format!("{}/{}", self.path, own);
            self.store.delete(&own_path).await?;
            *self.entry.lock() = None;
            Ok(false)
        }
    }

    fn mark_held(self: &Arc<Self>, own: &str) {
        self.held.store(true, Ordering::SeqCst);
        let own_path = format!("{}/{}", self.path, own);
        let this = Arc::downgrade(self);
        self.store.watch(
            &own_path,
            Arc::new(move |ev| {
                let reason = match ev {
                    WatchEvent::Deleted(_) => "lock node deleted",
                    WatchEvent::SessionExpired => "session expired",
                    WatchEvent::Changed(_) => return,
                };
                if let Some(lock) = this.upgrade() {
                    if lock.held.swap(false, Ordering::SeqCst) {
                        warn!(path = %lock.path, reason, "service lock lost");
                        lock.watcher.lost_lock(reason);
                    }
                }
            }),
        );
    }

    /// Confirm, against the source of truth, that our lock node still
    /// exists. Must be called before lock-guarded work whose safety depends
    /// on holding the lock; on failure the lock is treated as lost.
    pub async fn verify_lock_at_source(&self) -> bool {
        let entry = match self.entry.lock().clone() {
            Some(e) => e,
            None => return false,
        };
        let own_path = format!("{}/{}", self.path, entry);
        match self.store.exists(&own_path).await {
            Ok(true) => self.held.load(Ordering::SeqCst),
            Ok(false) => {
                if self.held.swap(false, Ordering::SeqCst) {
                    self.watcher.lost_lock("lock node missing at source");
                }
                false
            }
            Err(e) => {
                self.watcher
                    .unable_to_monitor(&format!("cannot verify lock node: {e}"));
                false
            }
        }
    }

    /// Release the lock by deleting our entry.
    pub async fn unlock(&self) -> TabletDbResult<()> {
        self.held.store(false, Ordering::SeqCst);
        let entry = self.entry.lock().take();
        if let Some(entry) = entry {
            let own_path = format!("{}/{}", self.path, entry);
            match self.store.delete(&own_path).await {
                Ok(()) | Err(TabletDbError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Whether the lock identified by `lock_id` is still held, judged from the
/// coordination service alone.
pub async fn is_lock_held(
    store: &dyn CoordinationStore,
    lock_id: &LockId,
) -> TabletDbResult<bool> {
    let children = match store.get_children(&lock_id.path).await {
        Ok(c) => c,
        Err(TabletDbError::NotFound { .. }) => return Ok(false),
        Err(e) => return Err(e),
    };
    let children = validate_and_sort(children);
    Ok(children.iter().any(|c| {
        parse_entry(c).is_some_and(|(uuid, seq)| uuid == lock_id.uuid && seq == lock_id.seq)
    }))
}

/// A no-op lock watcher for callers that poll [`ServiceLock::is_held`].
pub struct NullLockWatcher;

impl LockWatcher for NullLockWatcher {
    fn lost_lock(&self, _reason: &str) {}
    fn unable_to_monitor(&self, _reason: &str) {}
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::local::LocalStore;

    fn entry(uuid: &str, seq: u64) -> String {
        format!("zlock#{uuid}#{seq:010}")
    }

    const UUID_A: &str = "11111111-1111-1111-1111-111111111111";
    const UUID_B: &str = "22222222-2222-2222-2222-222222222222";
    const UUID_C: &str = "33333333-3333-3333-3333-333333333333";
    const UUID_D: &str = "44444444-4444-4444-4444-444444444444";
    const UUID_E: &str = "55555555-5555-5555-5555-555555555555";
    const UUID_F: &str = "66666666-6666-6666-6666-666666666666";

    /// Seq 1,2 belong to one candidate, 6,7 to another; 3, 4, 8, and 10
    /// stand alone.
    fn election_children() -> Vec<String> {
        validate_and_sort(vec![
            entry(UUID_A, 1),
            entry(UUID_A, 2),
            entry(UUID_B, 3),
            entry(UUID_C, 4),
            entry(UUID_D, 6),
            entry(UUID_D, 7),
            entry(UUID_E, 8),
            entry(UUID_F, 10),
        ])
    }

    #[test]
    fn prev_prefix_of_ten_is_eight() {
        let children = election_children();
        assert_eq!(
            find_lowest_prev_prefix(&children, &entry(UUID_F, 10)).unwrap(),
            entry(UUID_E, 8)
        );
    }

    #[test]
    fn prev_prefix_of_three_is_one() {
        // the predecessor entry is seq 2, but its candidate group starts at 1
        let children = election_children();
        assert_eq!(
            find_lowest_prev_prefix(&children, &entry(UUID_B, 3)).unwrap(),
            entry(UUID_A, 1)
        );
    }

    #[test]
    fn prev_prefix_of_lowest_fails() {
        let children = election_children();
        assert!(find_lowest_prev_prefix(&children, &entry(UUID_A, 1)).is_err());
    }

    #[test]
    fn non_conformant_entries_are_filtered() {
        let children = validate_and_sort(vec![
            entry(UUID_A, 2),
            "zlock#NOT-A-UUID#0000000001".to_string(),
            // uppercase uuid fails round-trip conformance
            format!("zlock#{}#0000000003", UUID_A.to_uppercase()),
            "garbage".to_string(),
            "zlock#11111111-1111-1111-1111-111111111111#123".to_string(),
        ]);
        assert_eq!(children, vec![entry(UUID_A, 2)]);
    }

    #[test]
    fn lock_id_round_trip() {
        let id = LockId {
            path: "/locks/tservers/host:9997".to_string(),
            uuid: Uuid::parse_str(UUID_A).unwrap(),
            seq: 42,
        };
        let s = id.to_string();
        assert_eq!(s, format!("/locks/tservers/host:9997#{UUID_A}#0000000042"));
        assert_eq!(s.parse::<LockId>().unwrap(), id);
    }

    #[test]
    fn lock_id_rejects_non_canonical_uuid() {
        let s = format!("/locks/x#{}#0000000001", UUID_A.to_uppercase());
        assert!(s.parse::<LockId>().is_err());
    }

    proptest! {
        #[test]
        fn lock_id_string_identity(seq in 0u64..=9_999_999_999) {
            let id = LockId {
                path: "/locks/manager".to_string(),
                uuid: Uuid::new_v4(),
                seq,
            };
            let parsed: LockId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed.to_string(), id.to_string());
        }
    }

    #[tokio::test]
    async fn lock_is_exclusive_and_fair() {
        let service = LocalStore::new();
        let holder = Arc::new(ServiceLock::new(
            Arc::new(service.clone()),
            "/locks/svc",
            Arc::new(NullLockWatcher),
        ));
        holder.acquire(b"holder").await.unwrap();
        assert!(holder.is_held());
        assert!(holder.verify_lock_at_source().await);

        let contender_store = service.new_session();
        let contender = Arc::new(ServiceLock::new(
            Arc::new(contender_store),
            "/locks/svc",
            Arc::new(NullLockWatcher),
        ));
        assert!(!contender.try_acquire(b"contender").await.unwrap());

        // a waiting acquire completes once the holder releases
        let contender2 = Arc::clone(&contender);
        let waiter = tokio::spawn(async move { contender2.acquire(b"contender").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_held());
        holder.unlock().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter timed out")
            .unwrap()
            .unwrap();
        assert!(contender.is_held());
    }

    #[tokio::test]
    async fn session_expiry_loses_lock() {
        let service = LocalStore::new();
        let session = service.new_session();
        let lock = Arc::new(ServiceLock::new(
            Arc::new(session.clone()),
            "/locks/svc",
            Arc::new(NullLockWatcher),
        ));
        lock.acquire(b"").await.unwrap();
        let id = lock.lock_id().unwrap();
        assert!(is_lock_held(&service, &id).await.unwrap());

        session.expire_this_session();
        assert!(!lock.is_held());
        assert!(!lock.verify_lock_at_source().await);
        assert!(!is_lock_held(&service, &id).await.unwrap());
    }
}
