//! The FATE worker engine.
//!
//! A fixed pool of workers drains a queue of runnable transaction ids fed
//! by a periodic store scan. Each worker reserves its transaction before
//! touching it, so a single FateId is never executed concurrently even
//! with multiple engines running against the same store. A separate
//! scheduled task reclaims reservations whose holding lock has died.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tabletdb_common::metrics::recorded;
use tabletdb_common::FateId;
use tabletdb_coordination::lock::LockId;
use tabletdb_coordination::store::CoordinationStore;
use tabletdb_errors::TabletDbResult;
use tabletdb_util::shutdown::{ShutdownReceiver, ShutdownSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::{FateReservation, FateStore, ReserveResult, TStatus};

/// One step of a FATE transaction.
///
/// `call` runs at least once per occurrence on the stack, so everything it
/// does must be idempotent. `is_ready` returning a positive delay defers
/// the transaction without consuming the step.
#[async_trait]
pub trait Repo<E>: Serialize + DeserializeOwned + Clone + Send + Sync + fmt::Debug + 'static
where
    E: Send + Sync + 'static,
{
    /// Short name for logs and the admin CLI.
    fn name(&self) -> &'static str;

    /// How long to wait before this step can run; zero means ready.
    async fn is_ready(&self, fate_id: FateId, env: &E) -> TabletDbResult<Duration>;

    /// Perform the step. Returns the next step, or `None` when the
    /// transaction is complete.
    async fn call(&self, fate_id: FateId, env: &E) -> TabletDbResult<Option<Self>>;

    /// Roll back this step's effects, best effort.
    async fn undo(&self, fate_id: FateId, env: &E) -> TabletDbResult<()>;
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct FateConfig {
    /// Worker tasks draining the runnable queue.
    pub workers: usize,
    /// How often the store is scanned for runnable transactions.
    pub scan_interval: Duration,
    /// How often dead reservations are hunted.
    pub reclaim_interval: Duration,
}

impl Default for FateConfig {
    fn default() -> Self {
        FateConfig {
            workers: 4,
            scan_interval: Duration::from_millis(250),
            reclaim_interval: Duration::from_secs(30),
        }
    }
}

struct WorkQueue {
    queue: Mutex<VecDeque<FateId>>,
    /// Wakeup times for transactions whose `is_ready` asked for a delay
    deferred: Mutex<HashMap<FateId, tokio::time::Instant>>,
    notify: Notify,
}

impl WorkQueue {
    fn push(&self, fate_id: FateId) {
        let mut queue = self.queue.lock();
        if !queue.contains(&fate_id) {
            queue.push_back(fate_id);
            self.notify.notify_one();
        }
    }

    fn pop(&self) -> Option<FateId> {
        self.queue.lock().pop_front()
    }
}

/// A running FATE engine over one store.
pub struct Fate<E, R> {
    store: Arc<FateStore<R>>,
    env: Arc<E>,
    lock_id: LockId,
    work: Arc<WorkQueue>,
    shutdown: ShutdownSender,
    handles: Vec<JoinHandle<()>>,
}

impl<E, R> Fate<E, R>
where
    E: Send + Sync + 'static,
    R: Repo<E>,
{
    /// Start workers, the store scanner, and the dead-reservation
    /// reclaimer. `lock_id` identifies this process's service lock, which
    /// every reservation taken here is tied to.
    pub fn start(
        store: Arc<FateStore<R>>,
        env: Arc<E>,
        coordination: Arc<dyn CoordinationStore>,
        lock_id: LockId,
        config: FateConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = tabletdb_util::shutdown::channel();
        let work = Arc::new(WorkQueue {
            queue: Mutex::new(VecDeque::new()),
            deferred: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        });

        let mut handles = Vec::new();
        for worker in 0..config.workers.max(1) {
            handles.push(tokio::spawn(Self::worker_loop(
                worker,
                Arc::clone(&store),
                Arc::clone(&env),
                lock_id.clone(),
                Arc::clone(&work),
                shutdown_rx.clone(),
            )));
        }
        handles.push(tokio::spawn(Self::scan_loop(
            Arc::clone(&store),
            Arc::clone(&work),
            config.scan_interval,
            shutdown_rx.clone(),
        )));
        handles.push(tokio::spawn(Self::reclaim_loop(
            Arc::clone(&store),
            coordination,
            config.reclaim_interval,
            shutdown_rx,
        )));

        Fate {
            store,
            env,
            lock_id,
            work,
            shutdown,
            handles,
        }
    }

    /// The store this engine drives.
    pub fn store(&self) -> &Arc<FateStore<R>> {
        &self.store
    }

    /// The environment steps run against.
    pub fn env(&self) -> &Arc<E> {
        &self.env
    }

    /// The service lock identity reservations are tied to.
    pub fn lock_id(&self) -> &LockId {
        &self.lock_id
    }

    /// Allocate, seed, and queue a transaction in one call.
    pub async fn create_and_seed(
        &self,
        fate_op: &str,
        first_step: R,
        auto_clean: bool,
    ) -> TabletDbResult<FateId> {
        let fate_id = self.store.create().await?;
        self.store
            .seed(fate_op, &fate_id, &first_step, auto_clean)
            .await?;
        info!(%fate_id, fate_op, "seeded fate transaction");
        self.work.push(fate_id);
        Ok(fate_id)
    }

    /// Nudge the engine about a transaction seeded elsewhere.
    pub fn signal(&self, fate_id: FateId) {
        self.work.push(fate_id);
    }

    /// Stop all background tasks and wait for them.
    pub async fn stop(self) {
        self.shutdown.shutdown().await;
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    async fn scan_loop(
        store: Arc<FateStore<R>>,
        work: Arc<WorkQueue>,
        interval: Duration,
        mut shutdown: ShutdownReceiver,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            // promote deferred transactions whose wakeup time has passed
            let now = tokio::time::Instant::now();
            let ready: Vec<FateId> = {
                let mut deferred = work.deferred.lock();
                let ready: Vec<FateId> = deferred
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(id, _)| *id)
                    .collect();
                for id in &ready {
                    deferred.remove(id);
                }
                ready
            };
            for id in ready {
                work.push(id);
            }

            let ids = match store.list().await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(%e, "fate store scan failed");
                    continue;
                }
            };
            for fate_id in ids {
                let view = match store.read(&fate_id).await {
                    Ok(Some(view)) => view,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(%fate_id, %e, "fate txn read failed during scan");
                        continue;
                    }
                };
                let runnable = matches!(
                    view.status,
                    TStatus::Submitted | TStatus::InProgress | TStatus::FailedInProgress
                ) && view.reservation.is_none()
                    && !work.deferred.lock().contains_key(&fate_id);
                if runnable {
                    work.push(fate_id);
                }
            }
        }
    }

    async fn reclaim_loop(
        store: Arc<FateStore<R>>,
        coordination: Arc<dyn CoordinationStore>,
        interval: Duration,
        mut shutdown: ShutdownReceiver,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            match store.reclaim_dead_reservations(coordination.as_ref()).await {
                Ok(0) => {}
                Ok(n) => {
                    counter!(recorded::FATE_RESERVATIONS_RECLAIMED).increment(n as u64);
                }
                Err(e) => warn!(%e, "dead reservation reclaim failed"),
            }
        }
    }

    async fn worker_loop(
        worker: usize,
        store: Arc<FateStore<R>>,
        env: Arc<E>,
        lock_id: LockId,
        work: Arc<WorkQueue>,
        mut shutdown: ShutdownReceiver,
    ) {
        debug!(worker, "fate worker started");
        loop {
            let fate_id = loop {
                if let Some(id) = work.pop() {
                    break id;
                }
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = work.notify.notified() => {}
                }
            };
            if shutdown.signalled() {
                return;
            }
            if let Err(e) = Self::execute(&store, &env, &lock_id, &work, fate_id).await {
                error!(%fate_id, %e, "fate transaction execution errored");
            }
        }
    }

    /// Reserve and drive one transaction as far as it will go right now.
    async fn execute(
        store: &FateStore<R>,
        env: &E,
        lock_id: &LockId,
        work: &WorkQueue,
        fate_id: FateId,
    ) -> TabletDbResult<()> {
        let reservation = FateReservation::new(lock_id.clone());
        match store.reserve(&fate_id, &reservation).await {
            Ok(ReserveResult::Accepted) => {}
            Ok(ReserveResult::Rejected(_)) => return Ok(()),
            Err(tabletdb_errors::TabletDbError::NoSuchFateTransaction(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
        gauge!(recorded::FATE_TXNS_IN_PROGRESS).increment(1.0);

        let result = Self::run_reserved(store, env, work, fate_id).await;

        gauge!(recorded::FATE_TXNS_IN_PROGRESS).decrement(1.0);
        match store.unreserve(&fate_id, &reservation).await {
            Ok(()) => {}
            // the record was deleted (auto-clean) while we held it
            Err(tabletdb_errors::TabletDbError::NoSuchFateTransaction(_)) => {}
            Err(e) => warn!(%fate_id, %e, "unreserve failed"),
        }
        result
    }

    async fn run_reserved(
        store: &FateStore<R>,
        env: &E,
        work: &WorkQueue,
        fate_id: FateId,
    ) -> TabletDbResult<()> {
        loop {
            let status = match store.status(&fate_id).await? {
                Some(status) => status,
                None => return Ok(()),
            };
            match status {
                TStatus::Submitted => {
                    store.set_status(&fate_id, TStatus::InProgress).await?;
                }
                TStatus::InProgress => {
                    let Some(repo) = store.top_repo(&fate_id).await? else {
                        Self::finish(store, &fate_id, TStatus::Successful).await?;
                        return Ok(());
                    };
                    let delay = match repo.is_ready(fate_id, env).await {
                        Ok(delay) => delay,
                        Err(e) => {
                            warn!(%fate_id, step = repo.name(), %e, "step is_ready failed");
                            store
                                .set_status(&fate_id, TStatus::FailedInProgress)
                                .await?;
                            continue;
                        }
                    };
                    if delay > Duration::ZERO {
                        debug!(%fate_id, step = repo.name(), ?delay, "step deferred");
                        work.deferred
                            .lock()
                            .insert(fate_id, tokio::time::Instant::now() + delay);
                        return Ok(());
                    }
                    match repo.call(fate_id, env).await {
                        Ok(Some(next)) => {
                            debug!(%fate_id, step = repo.name(), next = next.name(), "step complete");
                            store.push_repo(&fate_id, &next).await?;
                        }
                        Ok(None) => {
                            debug!(%fate_id, step = repo.name(), "transaction complete");
                            Self::finish(store, &fate_id, TStatus::Successful).await?;
                            return Ok(());
                        }
                        Err(e) => {
                            warn!(%fate_id, step = repo.name(), %e, "step failed, undoing");
                            store
                                .set_status(&fate_id, TStatus::FailedInProgress)
                                .await?;
                        }
                    }
                }
                TStatus::FailedInProgress => {
                    while let Some(repo) = store.top_repo(&fate_id).await? {
                        if let Err(e) = repo.undo(fate_id, env).await {
                            // keep unwinding; undo is best effort
                            error!(%fate_id, step = repo.name(), %e, "undo failed");
                        }
                        store.pop_repo(&fate_id).await?;
                    }
                    tabletdb_errors::invariant!(
                        store.top_repo(&fate_id).await?.is_none(),
                        "undo chain left steps on the stack for {fate_id}"
                    );
                    Self::finish(store, &fate_id, TStatus::Failed).await?;
                    return Ok(());
                }
                // not seeded yet, or already terminal
                TStatus::New | TStatus::Failed | TStatus::Successful | TStatus::Unknown => {
                    return Ok(())
                }
            }
        }
    }

    async fn finish(store: &FateStore<R>, fate_id: &FateId, status: TStatus) -> TabletDbResult<()> {
        store.set_status(fate_id, status).await?;
        if store.auto_clean(fate_id).await? {
            store.delete(fate_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::Deserialize;
    use tabletdb_common::FateInstanceType;
    use tabletdb_coordination::LocalStore;
    use uuid::Uuid;

    use super::*;
    use crate::zoo_kv::ZooKv;

    #[derive(Debug, Default)]
    struct TestEnv {
        calls: AtomicUsize,
        undos: AtomicUsize,
        fail_on_step: Mutex<Option<u32>>,
    }

    /// A chain of numbered steps; each step increments the env's call
    /// counter and hands off to the next number until `remaining` is zero.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct CountStep {
        remaining: u32,
    }

    #[async_trait]
    impl Repo<TestEnv> for CountStep {
        fn name(&self) -> &'static str {
            "COUNT_STEP"
        }

        async fn is_ready(&self, _fate_id: FateId, _env: &TestEnv) -> TabletDbResult<Duration> {
            Ok(Duration::ZERO)
        }

        async fn call(&self, _fate_id: FateId, env: &TestEnv) -> TabletDbResult<Option<Self>> {
            if env.fail_on_step.lock().as_ref() == Some(&self.remaining) {
                return Err(tabletdb_errors::internal_err!("injected step failure"));
            }
            env.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if self.remaining > 1 {
                Some(CountStep {
                    remaining: self.remaining - 1,
                })
            } else {
                None
            })
        }

        async fn undo(&self, _fate_id: FateId, env: &TestEnv) -> TabletDbResult<()> {
            env.undos.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn engine(local: &LocalStore, env: Arc<TestEnv>) -> Fate<TestEnv, CountStep> {
        let store = Arc::new(FateStore::new(
            Arc::new(ZooKv::new(Arc::new(local.clone()), "/fate")),
            FateInstanceType::Meta,
        ));
        Fate::start(
            store,
            env,
            Arc::new(local.clone()),
            LockId {
                path: "/locks/manager".to_string(),
                uuid: Uuid::new_v4(),
                seq: 0,
            },
            FateConfig {
                workers: 2,
                scan_interval: Duration::from_millis(20),
                reclaim_interval: Duration::from_secs(600),
            },
        )
    }

    async fn wait_for_status(
        store: &FateStore<CountStep>,
        fate_id: &FateId,
        want: TStatus,
    ) {
        tabletdb_util::poll_until(Duration::from_secs(10), Duration::from_millis(10), || async {
            match store.status(fate_id).await.unwrap() {
                Some(s) if s == want => Some(()),
                _ => None,
            }
        })
        .await
        .unwrap_or_else(|| panic!("transaction never reached {want}"));
    }

    #[tokio::test]
    async fn runs_steps_to_success() {
        let local = LocalStore::new();
        let env = Arc::new(TestEnv::default());
        let fate = engine(&local, Arc::clone(&env));

        let id = fate
            .create_and_seed("COUNT", CountStep { remaining: 3 }, false)
            .await
            .unwrap();
        wait_for_status(fate.store(), &id, TStatus::Successful).await;
        assert_eq!(env.calls.load(Ordering::SeqCst), 3);
        assert_eq!(env.undos.load(Ordering::SeqCst), 0);
        fate.stop().await;
    }

    #[tokio::test]
    async fn failed_step_runs_undo_chain() {
        let local = LocalStore::new();
        let env = Arc::new(TestEnv::default());
        *env.fail_on_step.lock() = Some(1);
        let fate = engine(&local, Arc::clone(&env));

        let id = fate
            .create_and_seed("COUNT", CountStep { remaining: 3 }, false)
            .await
            .unwrap();
        wait_for_status(fate.store(), &id, TStatus::Failed).await;
        // steps 3 and 2 ran, the failing occurrence of step 1 is also on
        // the stack, so three undos unwind
        assert_eq!(env.calls.load(Ordering::SeqCst), 2);
        assert_eq!(env.undos.load(Ordering::SeqCst), 3);
        fate.stop().await;
    }

    #[tokio::test]
    async fn auto_clean_removes_record() {
        let local = LocalStore::new();
        let env = Arc::new(TestEnv::default());
        let fate = engine(&local, Arc::clone(&env));

        let id = fate
            .create_and_seed("COUNT", CountStep { remaining: 1 }, true)
            .await
            .unwrap();
        tabletdb_util::poll_until(Duration::from_secs(10), Duration::from_millis(10), || async {
            match fate.store().read(&id).await.unwrap() {
                None => Some(()),
                Some(_) => None,
            }
        })
        .await
        .expect("auto-clean never deleted the record");
        assert_eq!(env.calls.load(Ordering::SeqCst), 1);
        fate.stop().await;
    }
}
