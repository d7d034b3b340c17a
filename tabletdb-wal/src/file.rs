//! One open write-ahead log file.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tabletdb_common::{Durability, KeyExtent};
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::entry::LogEntry;

/// An open WAL file. Appends serialize on an internal mutex (a log is a
/// single append stream); metadata reads are lock-free.
pub struct WalFile {
    uuid: Uuid,
    path: PathBuf,
    created: Instant,
    size: AtomicU64,
    closed: AtomicBool,
    writer: Mutex<File>,
    /// Tablets that already have a DefineTablet record in this log
    defined: parking_lot::Mutex<HashSet<KeyExtent>>,
}

impl WalFile {
    /// Create the file on disk and open it for appending.
    pub async fn create(dir: &Path, uuid: Uuid) -> TabletDbResult<WalFile> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| TabletDbError::io("creating wal dir", e))?;
        let path = dir.join(format!("{uuid}.wal"));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| TabletDbError::io("creating wal file", e))?;
        Ok(WalFile {
            uuid,
            path,
            created: Instant::now(),
            size: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            writer: Mutex::new(file),
            defined: parking_lot::Mutex::new(HashSet::new()),
        })
    }

    /// The log's unique id.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// The log file's path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes appended so far.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// How long this log has been open.
    pub fn age(&self) -> std::time::Duration {
        self.created.elapsed()
    }

    /// Whether this tablet already has a DefineTablet record here.
    pub fn is_defined(&self, extent: &KeyExtent) -> bool {
        self.defined.lock().contains(extent)
    }

    /// Record that a DefineTablet entry was written for `extent`.
    pub fn mark_defined(&self, extent: &KeyExtent) {
        self.defined.lock().insert(extent.clone());
    }

    /// Append entries and establish `durability`. A `CLOSED` log must never
    /// be appended to; doing so is a bug upstream.
    pub async fn append(&self, entries: &[LogEntry], durability: Durability) -> TabletDbResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TabletDbError::Internal(format!(
                "append to closed wal {}",
                self.uuid
            )));
        }
        let mut buf = Vec::new();
        for entry in entries {
            buf.extend_from_slice(&entry.to_frame()?);
        }
        let mut writer = self.writer.lock().await;
        // recheck under the writer lock: close takes it too
        if self.closed.load(Ordering::SeqCst) {
            return Err(TabletDbError::Internal(format!(
                "append to closed wal {}",
                self.uuid
            )));
        }
        writer
            .write_all(&buf)
            .await
            .map_err(|e| TabletDbError::io("appending to wal", e))?;
        match durability {
            Durability::None | Durability::Log => {}
            Durability::Flush => {
                writer
                    .flush()
                    .await
                    .map_err(|e| TabletDbError::io("flushing wal", e))?;
            }
            Durability::Sync => {
                writer
                    .sync_data()
                    .await
                    .map_err(|e| TabletDbError::io("syncing wal", e))?;
            }
        }
        self.size.fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Close the log: flush, sync, and refuse all further appends.
    pub async fn close(&self) -> TabletDbResult<()> {
        let mut writer = self.writer.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        writer
            .flush()
            .await
            .map_err(|e| TabletDbError::io("flushing wal at close", e))?;
        writer
            .sync_all()
            .await
            .map_err(|e| TabletDbError::io("syncing wal at close", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tabletdb_common::{Mutation, TableId};

    use super::*;

    fn extent() -> KeyExtent {
        KeyExtent::new(TableId::new("t"), None::<&str>, None::<&str>)
    }

    #[tokio::test]
    async fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WalFile::create(dir.path(), Uuid::new_v4()).await.unwrap();
        let entries = vec![
            LogEntry::DefineTablet { extent: extent() },
            LogEntry::Mutations {
                extent: extent(),
                seq: 1,
                mutations: vec![Mutation::new("r").put("f", "q", "v")],
                durability: Durability::Sync,
            },
        ];
        wal.append(&entries, Durability::Sync).await.unwrap();
        assert!(wal.size() > 0);

        wal.close().await.unwrap();
        let bytes = tokio::fs::read(wal.path()).await.unwrap();
        assert_eq!(LogEntry::read_all(&bytes).unwrap(), entries);
    }

    #[tokio::test]
    async fn closed_log_refuses_appends() {
        let dir = tempfile::tempdir().unwrap();
        let wal = WalFile::create(dir.path(), Uuid::new_v4()).await.unwrap();
        wal.close().await.unwrap();
        let err = wal
            .append(&[LogEntry::DefineTablet { extent: extent() }], Durability::Log)
            .await;
        assert!(err.is_err());
    }
}
