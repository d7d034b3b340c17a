//! In-memory implementation of [`AmpleBackend`], used by standalone
//! deployments and tests.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tabletdb_common::{DataLevel, KeyExtent, TableId};
use tabletdb_errors::TabletDbResult;
use tracing::trace;

use crate::ample::{
    AmpleBackend, ConditionalStatus, ConditionalTabletMutation, Require, SystemKv,
    TabletMutationOp,
};
use crate::tablet::TabletMetadata;

/// Hook letting tests override the status of a conditional mutation. The
/// second element of the returned pair says whether the mutation should
/// still be applied, which is how "reported UNKNOWN but actually landed"
/// gets simulated.
pub type StatusHook = Box<dyn Fn(&KeyExtent) -> Option<(ConditionalStatus, bool)> + Send + Sync>;

#[derive(Default)]
struct Inner {
    /// level -> metadata row -> decoded row
    levels: BTreeMap<DataLevel, BTreeMap<Bytes, TabletMetadata>>,
    /// system KV rows (USER FATE transactions)
    system: BTreeMap<String, (Vec<u8>, u64)>,
    status_hook: Option<StatusHook>,
}

/// The durable contents of an [`InMemoryAmple`]: every tablet row by level
/// plus the system KV section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryAmpleSnapshot {
    levels: Vec<(DataLevel, Vec<TabletMetadata>)>,
    system: Vec<(String, Vec<u8>, u64)>,
}

/// An in-memory metadata table. Conditional mutations serialize on one
/// mutex, giving the same per-row atomicity the on-disk table provides.
#[derive(Clone, Default)]
pub struct InMemoryAmple {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryAmple {
    /// An empty metadata table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current contents for later [`InMemoryAmple::restore`].
    pub fn snapshot(&self) -> InMemoryAmpleSnapshot {
        let inner = self.inner.lock();
        InMemoryAmpleSnapshot {
            levels: inner
                .levels
                .iter()
                .map(|(level, rows)| (*level, rows.values().cloned().collect()))
                .collect(),
            system: inner
                .system
                .iter()
                .map(|(k, (v, version))| (k.clone(), v.clone(), *version))
                .collect(),
        }
    }

    /// Rebuild a table from a snapshot.
    pub fn restore(snapshot: InMemoryAmpleSnapshot) -> Self {
        let restored = Self::new();
        {
            let mut inner = restored.inner.lock();
            for (level, rows) in snapshot.levels {
                let level_rows = inner.levels.entry(level).or_default();
                for tm in rows {
                    level_rows.insert(tm.extent().metadata_row(), tm);
                }
            }
            for (k, v, version) in snapshot.system {
                inner.system.insert(k, (v, version));
            }
        }
        restored
    }

    /// Install a test hook overriding conditional statuses.
    pub fn set_status_hook(&self, hook: StatusHook) {
        self.inner.lock().status_hook = Some(hook);
    }

    /// Remove the test hook.
    pub fn clear_status_hook(&self) {
        self.inner.lock().status_hook = None;
    }

    /// Handle to the system KV section (USER FATE rows).
    pub fn system_kv(&self) -> Arc<dyn SystemKv> {
        Arc::new(InMemorySystemKv {
            inner: Arc::clone(&self.inner),
        })
    }

    fn check_require(row: Option<&TabletMetadata>, require: &Require) -> bool {
        match require {
            Require::TabletExists => row.is_some(),
            Require::AbsentTablet => row.is_none(),
            _ => {
                let Some(tm) = row else { return false };
                match require {
                    Require::TabletExists | Require::AbsentTablet => unreachable!(),
                    Require::AbsentOperation => tm.operation_id.is_none(),
                    Require::Operation(opid) => tm.operation_id.as_ref() == Some(opid),
                    Require::AbsentLocation => tm.current.is_none() && tm.future.is_none(),
                    Require::CurrentLocation(s) => tm.current.as_ref() == Some(s),
                    Require::FutureLocation(s) => tm.future.as_ref() == Some(s),
                    Require::Availability(a) => tm.availability == *a,
                    Require::AbsentSuspend => tm.suspend.is_none(),
                    Require::SameFiles(files) => &tm.files == files,
                    Require::AbsentFile(f) => !tm.files.contains(f),
                    Require::AbsentLog(l) => !tm.logs.contains(l),
                    Require::AbsentLoaded(f) => !tm.loaded.contains_key(f),
                    Require::HostingRequested(v) => tm.hosting_requested == *v,
                }
            }
        }
    }

    fn apply_ops(
        rows: &mut BTreeMap<Bytes, TabletMetadata>,
        row_key: &Bytes,
        ops: &[TabletMutationOp],
    ) {
        for op in ops {
            match op {
                TabletMutationOp::InsertTablet(tm) => {
                    rows.insert(row_key.clone(), tm.clone());
                    continue;
                }
                TabletMutationOp::DeleteTablet => {
                    rows.remove(row_key);
                    continue;
                }
                _ => {}
            }
            let Some(tm) = rows.get_mut(row_key) else {
                continue;
            };
            match op {
                TabletMutationOp::InsertTablet(_) | TabletMutationOp::DeleteTablet => {}
                TabletMutationOp::PutFile(f) => {
                    tm.files.insert(f.clone());
                }
                TabletMutationOp::DeleteFile(f) => {
                    tm.files.remove(f);
                }
                TabletMutationOp::PutLoaded(f, id) => {
                    tm.loaded.insert(f.clone(), *id);
                }
                TabletMutationOp::DeleteLoaded(f) => {
                    tm.loaded.remove(f);
                }
                TabletMutationOp::SetFuture(s) => tm.future = Some(s.clone()),
                TabletMutationOp::DeleteFuture => tm.future = None,
                TabletMutationOp::SetCurrent(s) => tm.current = Some(s.clone()),
                TabletMutationOp::DeleteCurrent => tm.current = None,
                TabletMutationOp::SetLast(s) => tm.last = Some(s.clone()),
                TabletMutationOp::SetSuspend(s) => tm.suspend = Some(s.clone()),
                TabletMutationOp::DeleteSuspend => tm.suspend = None,
                TabletMutationOp::PutLog(l) => {
                    tm.logs.insert(l.clone());
                }
                TabletMutationOp::DeleteLog(l) => {
                    tm.logs.remove(l);
                }
                TabletMutationOp::SetOperation(opid) => tm.operation_id = Some(*opid),
                TabletMutationOp::DeleteOperation => tm.operation_id = None,
                TabletMutationOp::SetAvailability(a) => tm.availability = *a,
                TabletMutationOp::SetHostingRequested(v) => tm.hosting_requested = *v,
                TabletMutationOp::SetFlushId(id) => tm.flush_id = Some(*id),
                TabletMutationOp::SetTime(t) => tm.time = *t,
                TabletMutationOp::SetMigration(s) => tm.migration = Some(s.clone()),
                TabletMutationOp::DeleteMigration => tm.migration = None,
            }
        }
    }
}

#[async_trait]
impl AmpleBackend for InMemoryAmple {
    async fn read_tablet(&self, extent: &KeyExtent) -> TabletDbResult<Option<TabletMetadata>> {
        let inner = self.inner.lock();
        Ok(inner
            .levels
            .get(&extent.level())
            .and_then(|rows| rows.get(&extent.metadata_row()))
            .cloned())
    }

    async fn scan_tablets(
        &self,
        level: DataLevel,
        table: Option<TableId>,
        start: Option<Bytes>,
        end: Option<Bytes>,
    ) -> TabletDbResult<Vec<TabletMetadata>> {
        let inner = self.inner.lock();
        let Some(rows) = inner.levels.get(&level) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .filter(|tm| {
                if let Some(table) = &table {
                    if tm.extent().table() != table {
                        return false;
                    }
                }
                match (&start, &end) {
                    (None, None) => true,
                    _ => {
                        let probe = KeyExtent::new(
                            tm.extent().table().clone(),
                            end.clone(),
                            start.clone(),
                        );
                        tm.extent().overlaps(&probe)
                    }
                }
            })
            .cloned()
            .collect())
    }

    async fn apply_conditional(
        &self,
        mutations: Vec<ConditionalTabletMutation>,
    ) -> TabletDbResult<Vec<(ConditionalTabletMutation, ConditionalStatus)>> {
        let mut results = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            let mut inner = self.inner.lock();
            let hook_result = inner
                .status_hook
                .as_ref()
                .and_then(|h| h(&mutation.extent));
            let level = mutation.extent.level();
            let rows = inner.levels.entry(level).or_default();
            let row_key = mutation.extent.metadata_row();

            let (status, apply) = match hook_result {
                Some((status, apply)) => (status, apply),
                None => {
                    let row = rows.get(&row_key);
                    if mutation
                        .requires
                        .iter()
                        .all(|r| Self::check_require(row, r))
                    {
                        (ConditionalStatus::Accepted, true)
                    } else {
                        (ConditionalStatus::Rejected, false)
                    }
                }
            };
            if apply {
                Self::apply_ops(rows, &row_key, &mutation.ops);
            }
            trace!(extent = %mutation.extent, %status, "conditional mutation");
            results.push((mutation, status));
        }
        Ok(results)
    }
}

struct InMemorySystemKv {
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl SystemKv for InMemorySystemKv {
    async fn get(&self, key: &str) -> TabletDbResult<Option<(Vec<u8>, u64)>> {
        Ok(self.inner.lock().system.get(key).cloned())
    }

    async fn put_new(&self, key: &str, value: &[u8]) -> TabletDbResult<bool> {
        let mut inner = self.inner.lock();
        if inner.system.contains_key(key) {
            return Ok(false);
        }
        inner.system.insert(key.to_string(), (value.to_vec(), 0));
        Ok(true)
    }

    async fn cas(&self, key: &str, expected_version: u64, value: &[u8]) -> TabletDbResult<bool> {
        let mut inner = self.inner.lock();
        match inner.system.get_mut(key) {
            Some((data, version)) if *version == expected_version => {
                *data = value.to_vec();
                *version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> TabletDbResult<()> {
        self.inner.lock().system.remove(key);
        Ok(())
    }

    async fn list(&self) -> TabletDbResult<Vec<String>> {
        Ok(self.inner.lock().system.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use tabletdb_common::{TServerInstance, TabletAvailability};

    use super::*;
    use crate::ample::Ample;
    use crate::tablet::StoredTabletFile;

    fn extent(
        table: &'static str,
        end: Option<&'static str>,
        prev: Option<&'static str>,
    ) -> KeyExtent {
        KeyExtent::new(TableId::new(table), end, prev)
    }

    fn seeded() -> Ample {
        let backend = InMemoryAmple::new();
        Ample::new(Arc::new(backend))
    }

    async fn insert(ample: &Ample, e: &KeyExtent) {
        let mut mutator = ample.conditionally_mutate_tablets();
        mutator
            .mutate_tablet(e.clone())
            .require_absent_tablet()
            .insert_tablet(TabletMetadata::builder(e.clone()).build())
            .submit(|_| false, "insert")
            .unwrap();
        let results = mutator.process().await.unwrap();
        assert_eq!(results[e].status, ConditionalStatus::Accepted);
    }

    #[tokio::test]
    async fn insert_and_read_back() {
        let ample = seeded();
        let e = extent("t1", Some("m"), None);
        insert(&ample, &e).await;
        let tm = ample.read_tablet(&e).await.unwrap().unwrap();
        assert_eq!(tm.extent(), &e);
        // a successful mutation is observed by a subsequent read
        let mut mutator = ample.conditionally_mutate_tablets();
        let file = StoredTabletFile::unfenced("/t1/f1.rf");
        mutator
            .mutate_tablet(e.clone())
            .require_absent_operation()
            .put_file(file.clone())
            .submit(|_| false, "add file")
            .unwrap();
        mutator.process().await.unwrap();
        let tm = ample.read_tablet(&e).await.unwrap().unwrap();
        assert!(tm.files().contains(&file));
    }

    #[tokio::test]
    async fn rejected_mutation_reports_current_row() {
        let ample = seeded();
        let e = extent("t1", Some("m"), None);
        insert(&ample, &e).await;

        let mut mutator = ample.conditionally_mutate_tablets();
        mutator
            .mutate_tablet(e.clone())
            .require_absent_operation()
            .require_current(TServerInstance::new("a:1", 1))
            .set_availability(TabletAvailability::Hosted)
            .submit(|_| false, "requires current location")
            .unwrap();
        let results = mutator.process().await.unwrap();
        let result = &results[&e];
        assert_eq!(result.status, ConditionalStatus::Rejected);
        assert!(result.read_metadata.is_some());
        let tm = ample.read_tablet(&e).await.unwrap().unwrap();
        assert_eq!(tm.availability(), TabletAvailability::Ondemand);
    }

    #[tokio::test]
    async fn accepted_when_predicate_resolves_replays() {
        let ample = seeded();
        let e = extent("t1", Some("m"), None);
        insert(&ample, &e).await;
        let file = StoredTabletFile::unfenced("/t1/f1.rf");

        // first application
        let mut mutator = ample.conditionally_mutate_tablets();
        mutator
            .mutate_tablet(e.clone())
            .require_absent_operation()
            .require_absent_loaded(file.clone())
            .put_file(file.clone())
            .put_loaded(file.clone(), tabletdb_common::FateId::new_random(tabletdb_common::FateInstanceType::User))
            .submit(|_| false, "load")
            .unwrap();
        mutator.process().await.unwrap();

        // replay: the require fails but the predicate sees the file landed
        let mut mutator = ample.conditionally_mutate_tablets();
        let file2 = file.clone();
        mutator
            .mutate_tablet(e.clone())
            .require_absent_operation()
            .require_absent_loaded(file.clone())
            .put_file(file.clone())
            .submit(move |tm| tm.loaded().contains_key(&file2), "load replay")
            .unwrap();
        let results = mutator.process().await.unwrap();
        assert_eq!(results[&e].status, ConditionalStatus::Accepted);
    }

    #[tokio::test]
    async fn mutation_without_operation_guard_is_refused() {
        let ample = seeded();
        let e = extent("t1", Some("m"), None);
        let mut mutator = ample.conditionally_mutate_tablets();
        let err = mutator
            .mutate_tablet(e)
            .set_flush_id(3)
            .submit(|_| false, "no guard");
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn scan_filters_by_table_and_range() {
        let ample = seeded();
        let e1 = extent("t1", Some("f"), None);
        let e2 = extent("t1", Some("m"), Some("f"));
        let e3 = extent("t1", None, Some("m"));
        let other = extent("t2", None, None);
        for e in [&e1, &e2, &e3, &other] {
            insert(&ample, e).await;
        }

        let all = ample
            .read_tablets(tabletdb_common::DataLevel::User)
            .for_table(TableId::new("t1"))
            .fetch_all()
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let mid = ample
            .read_tablets(tabletdb_common::DataLevel::User)
            .for_table(TableId::new("t1"))
            .overlapping(Some("g"), Some("h"))
            .fetch_all()
            .await
            .unwrap();
        assert_eq!(mid.len(), 1);
        assert_eq!(mid[0].extent(), &e2);
    }

    #[tokio::test]
    async fn status_hook_simulates_unknown() {
        let backend = InMemoryAmple::new();
        let ample = Ample::new(Arc::new(backend.clone()));
        let e = extent("t1", Some("m"), None);
        insert(&ample, &e).await;

        backend.set_status_hook(Box::new(|_| Some((ConditionalStatus::Unknown, true))));
        let mut mutator = ample.conditionally_mutate_tablets();
        let file = StoredTabletFile::unfenced("/t1/f1.rf");
        let file2 = file.clone();
        mutator
            .mutate_tablet(e.clone())
            .require_absent_operation()
            .put_file(file.clone())
            .submit(move |tm| tm.files().contains(&file2), "unknown but landed")
            .unwrap();
        let results = mutator.process().await.unwrap();
        // the accepted-anyway predicate resolved the UNKNOWN
        assert_eq!(results[&e].status, ConditionalStatus::Accepted);
    }

    #[tokio::test]
    async fn snapshot_round_trips_rows_and_system_kv() {
        let backend = InMemoryAmple::new();
        let ample = Ample::new(Arc::new(backend.clone()));
        let e = extent("t1", Some("m"), None);
        insert(&ample, &e).await;
        assert!(backend.system_kv().put_new("txn/1", b"a").await.unwrap());

        let restored = InMemoryAmple::restore(backend.snapshot());
        let ample = Ample::new(Arc::new(restored.clone()));
        assert!(ample.read_tablet(&e).await.unwrap().is_some());
        let (data, version) = restored.system_kv().get("txn/1").await.unwrap().unwrap();
        assert_eq!(data, b"a");
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn system_kv_cas() {
        let backend = InMemoryAmple::new();
        let kv = backend.system_kv();
        assert!(kv.put_new("txn/1", b"a").await.unwrap());
        assert!(!kv.put_new("txn/1", b"b").await.unwrap());
        let (data, version) = kv.get("txn/1").await.unwrap().unwrap();
        assert_eq!(data, b"a");
        assert!(kv.cas("txn/1", version, b"b").await.unwrap());
        assert!(!kv.cas("txn/1", version, b"c").await.unwrap());
        assert_eq!(kv.list().await.unwrap(), vec!["txn/1"]);
        kv.delete("txn/1").await.unwrap();
        assert!(kv.get("txn/1").await.unwrap().is_none());
    }
}
