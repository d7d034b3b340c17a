//! The durable FATE transaction store.
//!
//! A transaction is one record: status, creation time, operation name, the
//! serialized step stack, and the current reservation. Records live behind
//! the [`SystemKv`] seam, so the coordination-service store (META) and the
//! metadata-table store (USER) share every line of this logic. All writes
//! are read-modify-CAS; contention simply re-reads.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tabletdb_common::{FateId, FateInstanceType};
use tabletdb_coordination::lock::{is_lock_held, LockId};
use tabletdb_coordination::store::CoordinationStore;
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_metadata::SystemKv;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Status of a FATE transaction.
///
/// Transitions are monotone along `NEW → SUBMITTED → IN_PROGRESS →
/// (FAILED_IN_PROGRESS → FAILED) | SUCCESSFUL`, with the single exception
/// of `NEW → FAILED` via cancellation. `UNKNOWN` is never stored; it is
/// reported for transactions that disappear mid-observation.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TStatus {
    /// Created but not yet seeded with a first step.
    New,
    /// Seeded and waiting for a worker.
    Submitted,
    /// A worker is (or was) executing steps.
    InProgress,
    /// A step failed; the undo chain is running.
    FailedInProgress,
    /// Undone and terminal.
    Failed,
    /// Completed and terminal.
    Successful,
    /// The transaction no longer exists (reporting only).
    Unknown,
}

impl TStatus {
    /// Whether a transaction in this status may be deleted.
    pub fn is_deletable(self) -> bool {
        matches!(
            self,
            TStatus::New | TStatus::Failed | TStatus::Successful | TStatus::Unknown
        )
    }
}

/// A worker's claim on a transaction: the worker process's service lock
/// plus a per-claim uuid, so a claim can only ever be released (or
/// reclaimed) by exactly matching it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FateReservation {
    /// The claiming process's service lock
    pub lock_id: LockId,
    /// Unique id of this particular claim
    pub uuid: Uuid,
}

impl FateReservation {
    /// A fresh claim for the process holding `lock_id`.
    pub fn new(lock_id: LockId) -> Self {
        FateReservation {
            lock_id,
            uuid: Uuid::new_v4(),
        }
    }
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveResult {
    /// The claim is ours.
    Accepted,
    /// Someone else holds the transaction; their claim, if it could be
    /// read, is included.
    Rejected(Option<FateReservation>),
}

#[derive(Debug, Serialize, Deserialize)]
struct FateRecord {
    status: TStatus,
    created_millis: u64,
    fate_op: Option<String>,
    auto_clean: bool,
    reservation: Option<FateReservation>,
    /// Serialized steps, last entry is the top
    repo_stack: Vec<Vec<u8>>,
}

/// Read-only view of a transaction's bookkeeping.
#[derive(Debug, Clone)]
pub struct FateTxnView {
    /// The transaction
    pub fate_id: FateId,
    /// Stored status
    pub status: TStatus,
    /// Creation time, millis since the epoch
    pub created_millis: u64,
    /// Operation name recorded at seeding
    pub fate_op: Option<String>,
    /// Current claim, if busy
    pub reservation: Option<FateReservation>,
    /// Depth of the step stack
    pub stack_depth: usize,
    /// Whether the record self-deletes at terminal status
    pub auto_clean: bool,
}

enum Update<T> {
    /// Write the mutated record back and return.
    Write(T),
    /// Leave the record untouched and return.
    Skip(T),
}

/// The durable store for one instance type's transactions.
pub struct FateStore<R> {
    kv: Arc<dyn SystemKv>,
    instance_type: FateInstanceType,
    _repo: PhantomData<fn() -> R>,
}

impl<R> FateStore<R>
where
    R: Serialize + DeserializeOwned,
{
    /// A store over `kv`, minting ids of `instance_type`.
    pub fn new(kv: Arc<dyn SystemKv>, instance_type: FateInstanceType) -> Self {
        FateStore {
            kv,
            instance_type,
            _repo: PhantomData,
        }
    }

    /// Which instance type this store serves.
    pub fn instance_type(&self) -> FateInstanceType {
        self.instance_type
    }

    fn key(fate_id: &FateId) -> String {
        fate_id.uuid.to_string()
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Allocate a transaction in status `NEW`.
    pub async fn create(&self) -> TabletDbResult<FateId> {
        loop {
            let fate_id = FateId::new_random(self.instance_type);
            let record = FateRecord {
                status: TStatus::New,
                created_millis: Self::now_millis(),
                fate_op: None,
                auto_clean: false,
                reservation: None,
                repo_stack: Vec::new(),
            };
            if self
                .kv
                .put_new(&Self::key(&fate_id), &bincode::serialize(&record)?)
                .await?
            {
                debug!(%fate_id, "created fate transaction");
                return Ok(fate_id);
            }
            // uuid collision; try another
        }
    }

    async fn update<T, F>(&self, fate_id: &FateId, f: F) -> TabletDbResult<T>
    where
        F: Fn(&mut FateRecord) -> TabletDbResult<Update<T>>,
    {
        let key = Self::key(fate_id);
        loop {
            let Some((bytes, version)) = self.kv.get(&key).await? else {
                return Err(TabletDbError::NoSuchFateTransaction(fate_id.to_string()));
            };
            let mut record: FateRecord = bincode::deserialize(&bytes)?;
            match f(&mut record)? {
                Update::Skip(out) => return Ok(out),
                Update::Write(out) => {
                    if self
                        .kv
                        .cas(&key, version, &bincode::serialize(&record)?)
                        .await?
                    {
                        return Ok(out);
                    }
                    // lost the race; re-read and retry
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Seed a `NEW` transaction with its first step and move it to
    /// `SUBMITTED`. Returns `false` (leaving the record untouched) if the
    /// transaction was already seeded.
    pub async fn seed(
        &self,
        fate_op: &str,
        fate_id: &FateId,
        first_step: &R,
        auto_clean: bool,
    ) -> TabletDbResult<bool> {
        let step_bytes = bincode::serialize(first_step)?;
        self.update(fate_id, move |record| {
            if record.status != TStatus::New || !record.repo_stack.is_empty() {
                return Ok(Update::Skip(false));
            }
            record.status = TStatus::Submitted;
            record.fate_op = Some(fate_op.to_string());
            record.auto_clean = auto_clean;
            record.repo_stack.push(step_bytes.clone());
            Ok(Update::Write(true))
        })
        .await
    }

    /// Claim a transaction. Succeeds when the transaction is free or
    /// already carries exactly this claim.
    pub async fn reserve(
        &self,
        fate_id: &FateId,
        reservation: &FateReservation,
    ) -> TabletDbResult<ReserveResult> {
        self.update(fate_id, |record| match &record.reservation {
            None => {
                record.reservation = Some(reservation.clone());
                Ok(Update::Write(ReserveResult::Accepted))
            }
            Some(existing) if existing == reservation => Ok(Update::Skip(ReserveResult::Accepted)),
            Some(existing) => Ok(Update::Skip(ReserveResult::Rejected(Some(existing.clone())))),
        })
        .await
    }

    /// Release a claim. Only the exact holder may release.
    pub async fn unreserve(
        &self,
        fate_id: &FateId,
        reservation: &FateReservation,
    ) -> TabletDbResult<()> {
        self.update(fate_id, |record| {
            if record.reservation.as_ref() == Some(reservation) {
                record.reservation = None;
                Ok(Update::Write(()))
            } else {
                Err(TabletDbError::Internal(format!(
                    "unreserve of {fate_id} by a non-holder"
                )))
            }
        })
        .await
    }

    /// The stored status, or `None` if the transaction does not exist.
    pub async fn status(&self, fate_id: &FateId) -> TabletDbResult<Option<TStatus>> {
        Ok(self.read(fate_id).await?.map(|view| view.status))
    }

    /// Store a new status.
    pub async fn set_status(&self, fate_id: &FateId, status: TStatus) -> TabletDbResult<()> {
        self.update(fate_id, |record| {
            record.status = status;
            Ok(Update::Write(()))
        })
        .await?;
        debug!(%fate_id, %status, "fate status");
        Ok(())
    }

    /// The top of the step stack, if any.
    pub async fn top_repo(&self, fate_id: &FateId) -> TabletDbResult<Option<R>> {
        let view = self
            .update(fate_id, |record| {
                Ok(Update::Skip(record.repo_stack.last().cloned()))
            })
            .await?;
        view.map(|bytes| bincode::deserialize(&bytes).map_err(Into::into))
            .transpose()
    }

    /// Push the next step.
    pub async fn push_repo(&self, fate_id: &FateId, repo: &R) -> TabletDbResult<()> {
        let bytes = bincode::serialize(repo)?;
        self.update(fate_id, move |record| {
            record.repo_stack.push(bytes.clone());
            Ok(Update::Write(()))
        })
        .await
    }

    /// Pop the top step.
    pub async fn pop_repo(&self, fate_id: &FateId) -> TabletDbResult<()> {
        self.update(fate_id, |record| {
            record.repo_stack.pop();
            Ok(Update::Write(()))
        })
        .await
    }

    /// Read a transaction's bookkeeping, or `None` if it does not exist.
    pub async fn read(&self, fate_id: &FateId) -> TabletDbResult<Option<FateTxnView>> {
        let Some((bytes, _)) = self.kv.get(&Self::key(fate_id)).await? else {
            return Ok(None);
        };
        let record: FateRecord = bincode::deserialize(&bytes)?;
        Ok(Some(FateTxnView {
            fate_id: *fate_id,
            status: record.status,
            created_millis: record.created_millis,
            fate_op: record.fate_op,
            reservation: record.reservation,
            stack_depth: record.repo_stack.len(),
            auto_clean: record.auto_clean,
        }))
    }

    /// Whether the record self-deletes at terminal status.
    pub async fn auto_clean(&self, fate_id: &FateId) -> TabletDbResult<bool> {
        Ok(self
            .read(fate_id)
            .await?
            .map(|view| view.auto_clean)
            .unwrap_or(false))
    }

    /// Remove a transaction's record entirely.
    pub async fn delete(&self, fate_id: &FateId) -> TabletDbResult<()> {
        info!(%fate_id, "deleting fate transaction");
        self.kv.delete(&Self::key(fate_id)).await
    }

    /// All transaction ids currently in the store. A listed id may vanish
    /// before it is probed; readers must tolerate that.
    pub async fn list(&self) -> TabletDbResult<Vec<FateId>> {
        let keys = self.kv.list().await?;
        Ok(keys
            .iter()
            .filter_map(|k| Uuid::parse_str(k).ok())
            .map(|uuid| FateId::from_parts(self.instance_type, uuid))
            .collect())
    }

    /// Clear reservations whose holding lock is no longer held. The clear
    /// is conditional on the reservation still being exactly the dead one,
    /// so a new claim taken between observation and clear survives.
    /// Returns how many were reclaimed.
    pub async fn reclaim_dead_reservations(
        &self,
        coordination: &dyn CoordinationStore,
    ) -> TabletDbResult<usize> {
        let mut reclaimed = 0;
        for fate_id in self.list().await? {
            let Some(view) = self.read(&fate_id).await? else {
                continue;
            };
            let Some(reservation) = view.reservation else {
                continue;
            };
            if is_lock_held(coordination, &reservation.lock_id).await? {
                continue;
            }
            let cleared = self
                .update(&fate_id, |record| {
                    if record.reservation.as_ref() == Some(&reservation) {
                        record.reservation = None;
                        Ok(Update::Write(true))
                    } else {
                        Ok(Update::Skip(false))
                    }
                })
                .await;
            match cleared {
                Ok(true) => {
                    warn!(%fate_id, dead_lock = %reservation.lock_id, "reclaimed dead fate reservation");
                    reclaimed += 1;
                }
                Ok(false) => {}
                // the record vanished between listing and clearing
                Err(TabletDbError::NoSuchFateTransaction(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tabletdb_coordination::lock::NullLockWatcher;
    use tabletdb_coordination::{LocalStore, ServiceLock};
    use tabletdb_metadata::InMemoryAmple;

    use super::*;
    use crate::zoo_kv::ZooKv;

    type Store = FateStore<Vec<u8>>;

    fn meta_store(local: &LocalStore) -> Store {
        FateStore::new(
            Arc::new(ZooKv::new(Arc::new(local.clone()), "/fate")),
            FateInstanceType::Meta,
        )
    }

    fn lock_id(n: u64) -> LockId {
        LockId {
            path: "/locks/manager".to_string(),
            uuid: Uuid::new_v4(),
            seq: n,
        }
    }

    #[tokio::test]
    async fn create_seed_lifecycle() {
        let store = meta_store(&LocalStore::new());
        let id = store.create().await.unwrap();
        assert_eq!(store.status(&id).await.unwrap(), Some(TStatus::New));

        assert!(store.seed("TABLE_CREATE", &id, &vec![1u8], false).await.unwrap());
        assert_eq!(store.status(&id).await.unwrap(), Some(TStatus::Submitted));
        // seeding twice is a no-op
        assert!(!store.seed("TABLE_CREATE", &id, &vec![2u8], false).await.unwrap());
        assert_eq!(store.top_repo(&id).await.unwrap(), Some(vec![1u8]));

        store.push_repo(&id, &vec![9u8]).await.unwrap();
        assert_eq!(store.top_repo(&id).await.unwrap(), Some(vec![9u8]));
        store.pop_repo(&id).await.unwrap();
        assert_eq!(store.top_repo(&id).await.unwrap(), Some(vec![1u8]));
    }

    #[tokio::test]
    async fn reservation_is_exclusive() {
        let store = meta_store(&LocalStore::new());
        let id = store.create().await.unwrap();

        let first = FateReservation::new(lock_id(1));
        let second = FateReservation::new(lock_id(2));
        assert_eq!(
            store.reserve(&id, &first).await.unwrap(),
            ReserveResult::Accepted
        );
        // same claim is re-accepted, different claim rejected
        assert_eq!(
            store.reserve(&id, &first).await.unwrap(),
            ReserveResult::Accepted
        );
        assert_eq!(
            store.reserve(&id, &second).await.unwrap(),
            ReserveResult::Rejected(Some(first.clone()))
        );

        // only the holder may unreserve
        assert!(store.unreserve(&id, &second).await.is_err());
        store.unreserve(&id, &first).await.unwrap();
        assert_eq!(
            store.reserve(&id, &second).await.unwrap(),
            ReserveResult::Accepted
        );
    }

    #[tokio::test]
    async fn dead_reservations_are_reclaimed_conditionally() {
        let local = LocalStore::new();
        let store = meta_store(&local);
        let id = store.create().await.unwrap();

        // a real lock that then dies with its session
        let session = local.new_session();
        let lock = Arc::new(ServiceLock::new(
            Arc::new(session.clone()),
            "/locks/manager",
            Arc::new(NullLockWatcher),
        ));
        lock.acquire(b"").await.unwrap();
        let dead_res = FateReservation::new(lock.lock_id().unwrap());
        store.reserve(&id, &dead_res).await.unwrap();

        // while the lock lives nothing is reclaimed
        assert_eq!(store.reclaim_dead_reservations(&local).await.unwrap(), 0);

        session.expire_this_session();
        assert_eq!(store.reclaim_dead_reservations(&local).await.unwrap(), 1);
        assert!(store.read(&id).await.unwrap().unwrap().reservation.is_none());
    }

    #[tokio::test]
    async fn user_store_shares_semantics() {
        let ample = InMemoryAmple::new();
        let store: Store = FateStore::new(ample.system_kv(), FateInstanceType::User);
        let id = store.create().await.unwrap();
        assert_eq!(id.instance_type, FateInstanceType::User);
        assert!(store.seed("BULK_IMPORT", &id, &vec![3u8], true).await.unwrap());
        let view = store.read(&id).await.unwrap().unwrap();
        assert_eq!(view.status, TStatus::Submitted);
        assert!(view.auto_clean);
        assert_eq!(view.fate_op.as_deref(), Some("BULK_IMPORT"));
        assert_eq!(store.list().await.unwrap(), vec![id]);
        store.delete(&id).await.unwrap();
        assert!(store.read(&id).await.unwrap().is_none());
    }
}
