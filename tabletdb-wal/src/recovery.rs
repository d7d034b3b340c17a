//! Recovery: feeding a dead server's closed logs back into a tablet.
//!
//! An out-of-scope sorting step turns each closed log into a sorted
//! recovery artifact; [`RecoveryLogsResolver`] maps log references to those
//! artifacts, with a short cache collapsing the duplicate resolutions a
//! recovery batch produces. [`recover`] then replays the mutations a tablet
//! actually needs: those logged after its last finished minor compaction.
//! Both entry points are idempotent; they only read and feed a sink.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use tabletdb_common::{KeyExtent, Mutation};
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::entry::LogEntry;

/// A WAL reference paired with the sorted artifact produced from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSortedLog {
    /// The log's unique id
    pub log_uuid: Uuid,
    /// Path of the sorted recovery artifact
    pub sorted_path: PathBuf,
}

/// How long resolutions stay cached; long enough to collapse duplicates
/// within one recovery batch, short enough to notice replacement.
const RESOLVE_CACHE_TTL: Duration = Duration::from_secs(3);

/// Resolves WAL references to sorted recovery artifacts, caching briefly.
pub struct RecoveryLogsResolver<F> {
    resolve: F,
    cache: Mutex<HashMap<Uuid, (Instant, Option<ResolvedSortedLog>)>>,
}

impl<F> RecoveryLogsResolver<F>
where
    F: Fn(Uuid) -> Option<PathBuf>,
{
    /// `resolve` maps a log uuid to its sorted artifact, or `None` while
    /// sorting has not finished.
    pub fn new(resolve: F) -> Self {
        RecoveryLogsResolver {
            resolve,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve one log, serving repeats from the cache.
    pub fn resolve(&self, log_uuid: Uuid) -> Option<ResolvedSortedLog> {
        let now = Instant::now();
        let mut cache = self.cache.lock();
        if let Some((at, cached)) = cache.get(&log_uuid) {
            if now.duration_since(*at) < RESOLVE_CACHE_TTL {
                return cached.clone();
            }
        }
        let resolved = (self.resolve)(log_uuid).map(|sorted_path| ResolvedSortedLog {
            log_uuid,
            sorted_path,
        });
        cache.insert(log_uuid, (now, resolved.clone()));
        resolved
    }
}

/// Whether `extent` needs log recovery before serving: it does whenever
/// its metadata still references write-ahead logs.
pub fn needs_recovery(walogs: &[Uuid]) -> bool {
    !walogs.is_empty()
}

/// Replay the mutations `extent` needs from `logs` into `sink`, in log
/// order then sequence order.
///
/// Mutations at or below the tablet's last finished minor compaction are
/// already durable in `tablet_files` and are skipped. Calling this twice
/// feeds the sink the same mutations; the sink's application must cope (the
/// tablet applies them into a fresh in-memory map, so replays converge).
pub async fn recover(
    extent: &KeyExtent,
    logs: &[ResolvedSortedLog],
    tablet_files: usize,
    sink: &mut (dyn FnMut(u64, Mutation) + Send),
) -> TabletDbResult<usize> {
    // Pass 1: find the highest finished compaction seq for this tablet
    // across all logs.
    let mut entries_per_log = Vec::with_capacity(logs.len());
    let mut last_compacted_seq = 0u64;
    for log in logs {
        let bytes = tokio::fs::read(&log.sorted_path)
            .await
            .map_err(|e| TabletDbError::io("reading recovery log", e))?;
        let entries = LogEntry::read_all(&bytes)?;
        let mut defined = false;
        for entry in &entries {
            match entry {
                LogEntry::DefineTablet { extent: e } if e == extent => defined = true,
                LogEntry::MinorCompactionFinished { extent: e, seq } if e == extent => {
                    last_compacted_seq = last_compacted_seq.max(*seq);
                }
                _ => {}
            }
        }
        entries_per_log.push((defined, entries));
    }
    debug!(
        %extent,
        last_compacted_seq,
        tablet_files,
        "replaying recovery logs"
    );

    // Pass 2: feed surviving mutations in order.
    let mut replayed = 0;
    for (defined, entries) in entries_per_log {
        if !defined {
            continue;
        }
        for entry in entries {
            if let LogEntry::Mutations {
                extent: e,
                seq,
                mutations,
                ..
            } = entry
            {
                if &e == extent && seq > last_compacted_seq {
                    for mutation in mutations {
                        sink(seq, mutation);
                        replayed += 1;
                    }
                }
            }
        }
    }
    info!(%extent, replayed, "log recovery complete");
    Ok(replayed)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tabletdb_common::{Durability, TableId};

    use super::*;

    fn extent() -> KeyExtent {
        KeyExtent::new(TableId::new("t"), Some("m"), None::<&str>)
    }

    fn other_extent() -> KeyExtent {
        KeyExtent::new(TableId::new("t"), None::<&str>, Some("m"))
    }

    async fn write_log(dir: &std::path::Path, entries: &[LogEntry]) -> PathBuf {
        let path = dir.join(format!("{}.wal", Uuid::new_v4()));
        let mut buf = Vec::new();
        for e in entries {
            buf.extend_from_slice(&e.to_frame().unwrap());
        }
        tokio::fs::write(&path, buf).await.unwrap();
        path
    }

    fn muts(row: &str) -> Vec<Mutation> {
        vec![Mutation::new(row.to_string()).put("f", "q", "v")]
    }

    #[tokio::test]
    async fn replays_only_uncompacted_mutations_for_the_extent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_log(
            dir.path(),
            &[
                LogEntry::DefineTablet { extent: extent() },
                LogEntry::DefineTablet {
                    extent: other_extent(),
                },
                LogEntry::Mutations {
                    extent: extent(),
                    seq: 1,
                    mutations: muts("a"),
                    durability: Durability::Sync,
                },
                LogEntry::Mutations {
                    extent: other_extent(),
                    seq: 1,
                    mutations: muts("z"),
                    durability: Durability::Sync,
                },
                LogEntry::MinorCompactionStarted {
                    extent: extent(),
                    seq: 1,
                    file: "/t/f1.rf".into(),
                },
                LogEntry::MinorCompactionFinished {
                    extent: extent(),
                    seq: 1,
                },
                LogEntry::Mutations {
                    extent: extent(),
                    seq: 2,
                    mutations: muts("b"),
                    durability: Durability::Sync,
                },
            ],
        )
        .await;

        let logs = vec![ResolvedSortedLog {
            log_uuid: Uuid::new_v4(),
            sorted_path: path,
        }];
        let mut got = Vec::new();
        let replayed = recover(&extent(), &logs, 1, &mut |seq, m| got.push((seq, m)))
            .await
            .unwrap();
        assert_eq!(replayed, 1);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 2);
        assert_eq!(got[0].1.row.as_ref(), b"b");

        // idempotent: replaying yields the same feed
        let mut again = Vec::new();
        recover(&extent(), &logs, 1, &mut |seq, m| again.push((seq, m)))
            .await
            .unwrap();
        assert_eq!(got, again);
    }

    #[tokio::test]
    async fn resolver_caches_within_ttl() {
        let calls = AtomicUsize::new(0);
        let resolver = RecoveryLogsResolver::new(|uuid| {
            calls.fetch_add(1, Ordering::SeqCst);
            Some(PathBuf::from(format!("/recovery/{uuid}")))
        });
        let id = Uuid::new_v4();
        let first = resolver.resolve(id).unwrap();
        let second = resolver.resolve(id).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn needs_recovery_when_logs_referenced() {
        assert!(!needs_recovery(&[]));
        assert!(needs_recovery(&[Uuid::new_v4()]));
    }
}
