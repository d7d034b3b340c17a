//! WAL lifecycle markers in the coordination service.
//!
//! Every log a server creates is advertised under `/wals/<server>/<uuid>`.
//! `OPEN` means the server may still append; `CLOSED` means it never will
//! again (rotation, or the server died and the manager closed it); and
//! `UNREFERENCED` means no tablet needs it for recovery, so the garbage
//! collector may delete the file. After a server death, all of its logs
//! must reach `CLOSED` before anything recovers from them.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tabletdb_coordination::paths;
use tabletdb_coordination::store::{CoordinationStore, CreatePolicy, NodeMode};
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tracing::info;
use uuid::Uuid;

/// Lifecycle state of one write-ahead log.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WalState {
    /// The owning server may still append.
    Open,
    /// No further appends will ever happen.
    Closed,
    /// No tablet references the log; it may be collected.
    Unreferenced,
}

#[derive(Debug, Serialize, Deserialize)]
struct MarkerData {
    state: WalState,
    path: String,
}

/// Typed access to one server's WAL markers.
pub struct WalMarkers {
    store: Arc<dyn CoordinationStore>,
    server: String,
}

impl WalMarkers {
    /// Markers for `server`'s logs.
    pub fn new(store: Arc<dyn CoordinationStore>, server: impl Into<String>) -> Self {
        WalMarkers {
            store,
            server: server.into(),
        }
    }

    fn marker_path(&self, log_uuid: &Uuid) -> String {
        paths::wal_marker(&self.server, &log_uuid.to_string())
    }

    /// Advertise a freshly created log as `OPEN`.
    pub async fn advertise(&self, log_uuid: &Uuid, file_path: &str) -> TabletDbResult<()> {
        let data = bincode::serialize(&MarkerData {
            state: WalState::Open,
            path: file_path.to_string(),
        })?;
        self.store
            .create(
                &self.marker_path(log_uuid),
                &data,
                NodeMode::Persistent,
                CreatePolicy::Overwrite,
            )
            .await?;
        Ok(())
    }

    /// Move a log's marker to a new state.
    pub async fn set_state(&self, log_uuid: &Uuid, state: WalState) -> TabletDbResult<()> {
        self.store
            .mutate_existing(&self.marker_path(log_uuid), &move |old| {
                let mut data: MarkerData = bincode::deserialize(old)?;
                data.state = state;
                Ok(bincode::serialize(&data)?)
            })
            .await?;
        info!(server = %self.server, log = %log_uuid, %state, "wal marker state");
        Ok(())
    }

    /// Read one marker.
    pub async fn read(&self, log_uuid: &Uuid) -> TabletDbResult<Option<(WalState, String)>> {
        match self.store.get(&self.marker_path(log_uuid)).await {
            Ok((bytes, _)) => {
                let data: MarkerData = bincode::deserialize(&bytes)?;
                Ok(Some((data.state, data.path)))
            }
            Err(TabletDbError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// All of this server's markers as `(uuid, state, file path)`.
    pub async fn list(&self) -> TabletDbResult<Vec<(Uuid, WalState, String)>> {
        let parent = paths::wal_markers(&self.server);
        let children = match self.store.get_children(&parent).await {
            Ok(c) => c,
            Err(TabletDbError::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut markers = Vec::with_capacity(children.len());
        for child in children {
            let Ok(uuid) = Uuid::from_str(&child) else {
                continue;
            };
            if let Some((state, path)) = self.read(&uuid).await? {
                markers.push((uuid, state, path));
            }
        }
        Ok(markers)
    }

    /// Remove a marker once its log file is gone.
    pub async fn remove(&self, log_uuid: &Uuid) -> TabletDbResult<()> {
        match self.store.delete(&self.marker_path(log_uuid)).await {
            Ok(()) | Err(TabletDbError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Close every `OPEN` marker of this server. Run by the manager after
    /// the server's lock is observed dead; recovery of the server's
    /// tablets must not start before this completes.
    pub async fn close_all(&self) -> TabletDbResult<usize> {
        let mut closed = 0;
        for (uuid, state, _) in self.list().await? {
            if state == WalState::Open {
                self.set_state(&uuid, WalState::Closed).await?;
                closed += 1;
            }
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use tabletdb_coordination::LocalStore;

    use super::*;

    #[tokio::test]
    async fn marker_lifecycle() {
        let markers = WalMarkers::new(Arc::new(LocalStore::new()), "ts1:9997");
        let log = Uuid::new_v4();
        markers.advertise(&log, "/wals/ts1/log1").await.unwrap();
        assert_eq!(
            markers.read(&log).await.unwrap(),
            Some((WalState::Open, "/wals/ts1/log1".to_string()))
        );

        markers.set_state(&log, WalState::Closed).await.unwrap();
        assert_eq!(markers.read(&log).await.unwrap().unwrap().0, WalState::Closed);

        markers.set_state(&log, WalState::Unreferenced).await.unwrap();
        markers.remove(&log).await.unwrap();
        assert_eq!(markers.read(&log).await.unwrap(), None);
    }

    #[tokio::test]
    async fn close_all_only_touches_open() {
        let markers = WalMarkers::new(Arc::new(LocalStore::new()), "ts1:9997");
        let open = Uuid::new_v4();
        let closed = Uuid::new_v4();
        markers.advertise(&open, "/a").await.unwrap();
        markers.advertise(&closed, "/b").await.unwrap();
        markers.set_state(&closed, WalState::Closed).await.unwrap();

        assert_eq!(markers.close_all().await.unwrap(), 1);
        assert_eq!(markers.read(&open).await.unwrap().unwrap().0, WalState::Closed);
    }
}
