//! The per-server logger: one shared current log, rotation, retry, and the
//! self-halt safety valve.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tabletdb_common::metrics::recorded;
use tabletdb_common::{Durability, KeyExtent};
use tabletdb_coordination::store::CoordinationStore;
use tabletdb_coordination::ServiceLock;
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_util::backoff::{self, RetryPolicy};
use tabletdb_util::shutdown::ShutdownSender;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entry::{LogEntry, TabletLogWrite};
use crate::file::WalFile;
use crate::marker::{WalMarkers, WalState};
use crate::next_log::{spawn_next_log_maker, NextLogReceiver};

/// Logger tuning.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory logs are created in
    pub dir: PathBuf,
    /// Rotate once the current log reaches this size
    pub max_size: u64,
    /// Rotate once the current log is this old
    pub max_age: Duration,
    /// Consecutive creation failures tolerated by the next-log maker
    pub tolerated_creation_failures: u32,
    /// Retry budget for append failures
    pub retry: RetryPolicy,
}

impl WalConfig {
    /// Config with production defaults rooted at `dir`.
    pub fn new(dir: PathBuf) -> Self {
        WalConfig {
            dir,
            max_size: 1 << 30,
            max_age: Duration::from_secs(24 * 60 * 60),
            tolerated_creation_failures: 50,
            retry: RetryPolicy::transient(),
        }
    }
}

/// Publishes the log→tablet association into tablet metadata before the
/// tablet's first mutation lands in a log.
#[async_trait]
pub trait LogDefinePublisher: Send + Sync {
    /// Record in `extent`'s metadata row that `log_uuid` at `path` holds
    /// mutations for it.
    async fn publish(&self, extent: &KeyExtent, log_uuid: Uuid, path: &str) -> TabletDbResult<()>;
}

/// Last-resort process termination, injectable for tests.
pub trait Halter: Send + Sync {
    /// Stop the process. Called when continuing could violate durability
    /// invariants (WAL unwritable and the service lock is gone).
    fn halt(&self, reason: &str);
}

/// The production halter: aborts the process.
pub struct ProcessHalter;

impl Halter for ProcessHalter {
    fn halt(&self, reason: &str) {
        error!(reason, "halting tablet server");
        std::process::abort();
    }
}

struct CurrentLog {
    id: u64,
    log: Arc<WalFile>,
}

/// The tablet server's write-ahead logger.
///
/// Writers share the current log under the read side of a lock; rotation
/// takes the write side. The next log is always pre-created by a dedicated
/// background task so rotation only swaps pointers.
pub struct TabletServerLogger {
    config: WalConfig,
    lock: Arc<ServiceLock>,
    publisher: Arc<dyn LogDefinePublisher>,
    markers: Arc<WalMarkers>,
    halter: Arc<dyn Halter>,
    server: String,
    current: RwLock<CurrentLog>,
    next_rx: tokio::sync::Mutex<NextLogReceiver>,
    maker: tokio::task::JoinHandle<()>,
    shutdown: ShutdownSender,
}

impl TabletServerLogger {
    /// Start the logger: spawn the next-log maker and install the first
    /// log as current.
    pub async fn start(
        config: WalConfig,
        coordination: Arc<dyn CoordinationStore>,
        server: impl Into<String>,
        lock: Arc<ServiceLock>,
        publisher: Arc<dyn LogDefinePublisher>,
        halter: Arc<dyn Halter>,
    ) -> TabletDbResult<TabletServerLogger> {
        let server = server.into();
        let markers = Arc::new(WalMarkers::new(coordination, &server));
        let (shutdown, shutdown_rx) = tabletdb_util::shutdown::channel();
        let (mut next_rx, maker) = spawn_next_log_maker(
            config.dir.clone(),
            Arc::clone(&markers),
            config.tolerated_creation_failures,
            shutdown_rx,
        );
        let first = next_rx
            .recv()
            .await
            .ok_or_else(|| TabletDbError::Internal("next-log maker died at startup".into()))??;
        info!(server = %server, log = %first.uuid(), "opened first write-ahead log");
        Ok(TabletServerLogger {
            config,
            lock,
            publisher,
            markers,
            halter,
            server,
            current: RwLock::new(CurrentLog { id: 1, log: first }),
            next_rx: tokio::sync::Mutex::new(next_rx),
            maker,
            shutdown,
        })
    }

    /// The server this logger writes for.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Uuid and path of the current log.
    pub async fn current_log(&self) -> (Uuid, PathBuf) {
        let cur = self.current.read().await;
        (cur.log.uuid(), cur.log.path().to_path_buf())
    }

    /// This server's marker surface.
    pub fn markers(&self) -> &Arc<WalMarkers> {
        &self.markers
    }

    /// Log a batch of tablet writes, establishing the strongest durability
    /// any of them asked for. Returns the id of the log that took the
    /// batch.
    pub async fn log(&self, writes: &[TabletLogWrite<'_>]) -> TabletDbResult<u64> {
        if writes.is_empty() {
            return Ok(self.current.read().await.id);
        }
        let durability = writes
            .iter()
            .map(|w| w.durability)
            .max()
            .unwrap_or(Durability::Sync);

        let mut attempts_left = self.config.retry.max_attempts;
        let mut delays = self.config.retry.delays();
        loop {
            match self.try_log_once(writes, durability).await {
                Ok(log_id) => return Ok(log_id),
                Err(e) if e.is_transient() => {
                    counter!(recorded::WAL_WRITE_RETRIES).increment(1);
                    attempts_left = attempts_left.saturating_sub(1);
                    if attempts_left == 0 {
                        return self.give_up(e).await;
                    }
                    warn!(%e, attempts_left, "wal write failed, rotating and retrying");
                    // a fresh log sidesteps a bad file or full volume
                    self.rotate().await?;
                    if let Some(delay) = delays.next() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt at the write path: define tablets in the current log,
    /// append the batch, then confirm the log did not rotate underneath us.
    async fn try_log_once(
        &self,
        writes: &[TabletLogWrite<'_>],
        durability: Durability,
    ) -> TabletDbResult<u64> {
        self.maybe_rotate().await?;

        let (log_id, log) = {
            let cur = self.current.read().await;
            (cur.id, Arc::clone(&cur.log))
        };

        for write in writes {
            if !log.is_defined(write.extent) {
                log.append(
                    &[LogEntry::DefineTablet {
                        extent: write.extent.clone(),
                    }],
                    Durability::Sync,
                )
                .await?;
                self.publisher
                    .publish(write.extent, log.uuid(), &log.path().to_string_lossy())
                    .await?;
                log.mark_defined(write.extent);
            }
        }

        let entries: Vec<LogEntry> = writes
            .iter()
            .map(|w| LogEntry::Mutations {
                extent: w.extent.clone(),
                seq: w.seq,
                mutations: w.mutations.to_vec(),
                durability: w.durability,
            })
            .collect();
        log.append(&entries, durability).await?;

        // If the log rotated mid-write the batch may have raced the close;
        // redo it against the new log. Appends are idempotent for replay
        // because recovery dedupes on (extent, seq).
        let cur_id = self.current.read().await.id;
        if cur_id != log_id {
            return Err(TabletDbError::Io {
                context: "wal rotated during write".into(),
                message: "retrying against new log".into(),
            });
        }
        Ok(log_id)
    }

    /// Append a minor-compaction lifecycle record.
    pub async fn log_minor_compaction_started(
        &self,
        extent: &KeyExtent,
        seq: u64,
        file: &str,
    ) -> TabletDbResult<()> {
        let cur = self.current.read().await;
        cur.log
            .append(
                &[LogEntry::MinorCompactionStarted {
                    extent: extent.clone(),
                    seq,
                    file: file.to_string(),
                }],
                Durability::Sync,
            )
            .await
    }

    /// Append a minor-compaction completion record.
    pub async fn log_minor_compaction_finished(
        &self,
        extent: &KeyExtent,
        seq: u64,
    ) -> TabletDbResult<()> {
        let cur = self.current.read().await;
        cur.log
            .append(
                &[LogEntry::MinorCompactionFinished {
                    extent: extent.clone(),
                    seq,
                }],
                Durability::Sync,
            )
            .await
    }

    async fn maybe_rotate(&self) -> TabletDbResult<()> {
        let needs = {
            let cur = self.current.read().await;
            cur.log.size() >= self.config.max_size || cur.log.age() >= self.config.max_age
        };
        if needs {
            self.rotate().await?;
        }
        Ok(())
    }

    /// Swap in the pre-created next log and close the old one.
    pub async fn rotate(&self) -> TabletDbResult<()> {
        let mut cur = self.current.write().await;
        let next = {
            let mut rx = self.next_rx.lock().await;
            match rx.recv().await {
                Some(Ok(log)) => log,
                Some(Err(e)) => return Err(e),
                None => {
                    self.halter.halt("next-log maker is gone");
                    return Err(TabletDbError::Internal("next-log maker is gone".into()));
                }
            }
        };
        let new_id = cur.id + 1;
        let old = std::mem::replace(&mut *cur, CurrentLog { id: new_id, log: next });
        counter!(recorded::WAL_ROTATIONS).increment(1);
        info!(old = %old.log.uuid(), new = %cur.log.uuid(), "rotated write-ahead log");
        drop(cur);

        old.log.close().await?;
        let old_uuid = old.log.uuid();
        backoff::retry(
            self.config.retry,
            "closing wal marker",
            TabletDbError::is_transient,
            || self.markers.set_state(&old_uuid, WalState::Closed),
        )
        .await?;
        Ok(())
    }

    /// Retries exhausted: if we no longer hold our service lock the safe
    /// move is to die rather than acknowledge writes we cannot make
    /// durable.
    async fn give_up(&self, err: TabletDbError) -> TabletDbResult<u64> {
        if !self.lock.verify_lock_at_source().await {
            self.halter
                .halt("wal write retries exhausted and service lock is lost");
        }
        error!(%err, "wal write retries exhausted");
        Err(err)
    }

    /// Close the current log and stop the maker.
    pub async fn stop(&self) -> TabletDbResult<()> {
        let cur = self.current.read().await;
        cur.log.close().await?;
        self.markers
            .set_state(&cur.log.uuid(), WalState::Closed)
            .await?;
        drop(cur);
        self.shutdown.signal();
        self.maker.abort();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tabletdb_common::{Mutation, TableId};
    use tabletdb_coordination::lock::NullLockWatcher;
    use tabletdb_coordination::LocalStore;

    use super::*;

    struct NullPublisher;

    #[async_trait]
    impl LogDefinePublisher for NullPublisher {
        async fn publish(
            &self,
            _extent: &KeyExtent,
            _log_uuid: Uuid,
            _path: &str,
        ) -> TabletDbResult<()> {
            Ok(())
        }
    }

    struct PanicHalter;

    impl Halter for PanicHalter {
        fn halt(&self, reason: &str) {
            panic!("halted: {reason}");
        }
    }

    fn extent(end: &'static str) -> KeyExtent {
        KeyExtent::new(TableId::new("t"), Some(end), None::<&str>)
    }

    async fn logger(dir: PathBuf, max_size: u64) -> TabletServerLogger {
        let store = Arc::new(LocalStore::new());
        let lock = Arc::new(ServiceLock::new(
            Arc::clone(&store) as Arc<dyn CoordinationStore>,
            "/locks/tservers/ts1:9997",
            Arc::new(NullLockWatcher),
        ));
        lock.acquire(b"").await.unwrap();
        let mut config = WalConfig::new(dir);
        config.max_size = max_size;
        TabletServerLogger::start(
            config,
            store,
            "ts1:9997",
            lock,
            Arc::new(NullPublisher),
            Arc::new(PanicHalter),
        )
        .await
        .unwrap()
    }

    fn write<'a>(extent: &'a KeyExtent, seq: u64, mutations: &'a [Mutation]) -> TabletLogWrite<'a> {
        TabletLogWrite {
            extent,
            seq,
            mutations,
            durability: Durability::Sync,
        }
    }

    #[tokio::test]
    async fn batches_stay_in_one_log() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path().to_path_buf(), 1 << 20).await;
        let e = extent("m");
        let muts = vec![Mutation::new("r").put("f", "q", "v")];

        let id1 = logger.log(&[write(&e, 1, &muts)]).await.unwrap();
        let id2 = logger.log(&[write(&e, 2, &muts)]).await.unwrap();
        assert_eq!(id1, id2);

        // the define record went in exactly once
        let (_, path) = logger.current_log().await;
        logger.stop().await.unwrap();
        let entries = LogEntry::read_all(&tokio::fs::read(path).await.unwrap()).unwrap();
        let defines = entries
            .iter()
            .filter(|e| matches!(e, LogEntry::DefineTablet { .. }))
            .count();
        assert_eq!(defines, 1);
        let mutation_records = entries
            .iter()
            .filter(|e| matches!(e, LogEntry::Mutations { .. }))
            .count();
        assert_eq!(mutation_records, 2);
    }

    #[tokio::test]
    async fn rotation_at_size_boundary() {
        let dir = tempfile::tempdir().unwrap();
        // tiny cap: the first batch crosses it, so the second batch must
        // land in a fresh log and the first log must be closed
        let logger = logger(dir.path().to_path_buf(), 64).await;
        let e = extent("m");
        let muts = vec![Mutation::new("r").put("f", "q", "payload-payload-payload")];

        let id1 = logger.log(&[write(&e, 1, &muts)]).await.unwrap();
        let (first_uuid, _) = logger.current_log().await;
        let id2 = logger.log(&[write(&e, 2, &muts)]).await.unwrap();
        let (second_uuid, _) = logger.current_log().await;

        assert_eq!(id2, id1 + 1);
        assert_ne!(first_uuid, second_uuid);
        assert_eq!(
            logger.markers().read(&first_uuid).await.unwrap().unwrap().0,
            WalState::Closed
        );
        logger.stop().await.unwrap();
    }

    #[tokio::test]
    async fn define_records_reappear_after_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let logger = logger(dir.path().to_path_buf(), 1 << 20).await;
        let e = extent("m");
        let muts = vec![Mutation::new("r").put("f", "q", "v")];
        logger.log(&[write(&e, 1, &muts)]).await.unwrap();
        logger.rotate().await.unwrap();
        logger.log(&[write(&e, 2, &muts)]).await.unwrap();

        let (_, path) = logger.current_log().await;
        logger.stop().await.unwrap();
        let entries = LogEntry::read_all(&tokio::fs::read(path).await.unwrap()).unwrap();
        // the new log re-defines the tablet before its mutations
        assert!(matches!(entries[0], LogEntry::DefineTablet { .. }));
    }
}
