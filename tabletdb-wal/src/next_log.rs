//! The next-log maker: a dedicated background task that keeps one
//! pre-created WAL ready so rotation never waits on file creation.

use std::path::PathBuf;
use std::sync::Arc;

use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_util::shutdown::ShutdownReceiver;
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::file::WalFile;
use crate::marker::{WalMarkers, WalState};

/// Receiving side of the single-slot rendezvous; each rotation consumes one
/// item (a ready log, or the error that prevented making one).
pub type NextLogReceiver = mpsc::Receiver<TabletDbResult<Arc<WalFile>>>;

/// Spawn the maker. It repeatedly creates a log file, advertises its
/// `OPEN` marker, and offers it through the channel. Creation failures are
/// cleaned up best-effort and reported through the same channel; after
/// `tolerated_failures` consecutive failures the maker gives up and exits,
/// leaving a final error in the channel for the logger to act on.
pub fn spawn_next_log_maker(
    dir: PathBuf,
    markers: Arc<WalMarkers>,
    tolerated_failures: u32,
    mut shutdown: ShutdownReceiver,
) -> (NextLogReceiver, tokio::task::JoinHandle<()>) {
    // capacity 1 makes this a rendezvous: the maker runs one log ahead and
    // then blocks until a rotation consumes it
    let (tx, rx) = mpsc::channel(1);
    let handle = tokio::spawn(async move {
        let mut consecutive_failures = 0u32;
        loop {
            let offered = match make_one(&dir, &markers).await {
                Ok(log) => {
                    consecutive_failures = 0;
                    Ok(log)
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(%e, consecutive_failures, "next wal creation failed");
                    Err(e)
                }
            };
            let fatal = consecutive_failures > tolerated_failures;
            tokio::select! {
                _ = shutdown.recv() => return,
                sent = tx.send(offered) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            if fatal {
                error!("giving up creating write-ahead logs");
                return;
            }
        }
    });
    (rx, handle)
}

async fn make_one(dir: &PathBuf, markers: &WalMarkers) -> TabletDbResult<Arc<WalFile>> {
    let uuid = Uuid::new_v4();
    let log = match WalFile::create(dir, uuid).await {
        Ok(log) => Arc::new(log),
        Err(e) => {
            // the file may or may not exist; remove what we can
            let _ = tokio::fs::remove_file(dir.join(format!("{uuid}.wal"))).await;
            return Err(e);
        }
    };
    if let Err(e) = markers
        .advertise(&uuid, &log.path().to_string_lossy())
        .await
    {
        // The marker may have been advertised before the failure surfaced.
        // Err on the side of closing: a CLOSED marker for an empty log is
        // harmless, an OPEN marker for an abandoned one is not.
        if let Err(close_err) = markers.set_state(&uuid, WalState::Closed).await {
            if !matches!(close_err, TabletDbError::NotFound { .. }) {
                warn!(%close_err, log = %uuid, "could not close marker of abandoned wal");
            }
        }
        let _ = tokio::fs::remove_file(log.path()).await;
        return Err(e);
    }
    Ok(log)
}

#[cfg(test)]
mod tests {
    use tabletdb_coordination::LocalStore;

    use super::*;

    #[tokio::test]
    async fn maker_keeps_one_log_ready() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new());
        let markers = Arc::new(WalMarkers::new(store, "ts1:9997"));
        let (shutdown_tx, shutdown_rx) = tabletdb_util::shutdown::channel();
        let (mut rx, handle) = spawn_next_log_maker(
            dir.path().to_path_buf(),
            Arc::clone(&markers),
            5,
            shutdown_rx,
        );

        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert_ne!(first.uuid(), second.uuid());
        // both were advertised OPEN
        for log in [&first, &second] {
            assert_eq!(
                markers.read(&log.uuid()).await.unwrap().unwrap().0,
                WalState::Open
            );
        }

        drop(rx);
        shutdown_tx.shutdown().await;
        handle.await.unwrap();
    }
}
