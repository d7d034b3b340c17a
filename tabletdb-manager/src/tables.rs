//! Table lifecycle state.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tabletdb_common::TableId;
use tabletdb_coordination::store::{CoordinationStore, CreatePolicy, NodeMode};
use tabletdb_errors::{TabletDbError, TabletDbResult};

/// A table's lifecycle state, kept in the coordination service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TableState {
    /// Serving: tablets follow their availability.
    Online,
    /// All tablets are to be unloaded.
    Offline,
    /// The table is going away; tablets unload and rows get deleted.
    Deleting,
    /// The state node could not be read; the watcher skips such tables.
    Unknown,
}

/// Source of table states.
#[async_trait]
pub trait TableStateSource: Send + Sync {
    /// The current state of `table`. Never errors: unreadable is
    /// [`TableState::Unknown`].
    async fn state(&self, table: &TableId) -> TableState;
}

fn table_state_path(table: &TableId) -> String {
    format!("/tables/{table}/state")
}

/// Table states stored at `/tables/<tid>/state`.
pub struct ZooTableStates {
    store: Arc<dyn CoordinationStore>,
}

impl ZooTableStates {
    /// States read through `store`.
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        ZooTableStates { store }
    }

    /// Record a state transition.
    pub async fn set_state(&self, table: &TableId, state: TableState) -> TabletDbResult<()> {
        self.store
            .create(
                &table_state_path(table),
                state.to_string().as_bytes(),
                NodeMode::Persistent,
                CreatePolicy::Overwrite,
            )
            .await?;
        Ok(())
    }

    /// Remove a deleted table's state node.
    pub async fn remove(&self, table: &TableId) -> TabletDbResult<()> {
        match self.store.delete(&table_state_path(table)).await {
            Ok(()) | Err(TabletDbError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl TableStateSource for ZooTableStates {
    async fn state(&self, table: &TableId) -> TableState {
        // the root and metadata tables are always online
        if *table == TableId::root() || *table == TableId::metadata() {
            return TableState::Online;
        }
        match self.store.get(&table_state_path(table)).await {
            Ok((bytes, _)) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| TableState::from_str(s).ok())
                .unwrap_or(TableState::Unknown),
            Err(_) => TableState::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use tabletdb_coordination::LocalStore;

    use super::*;

    #[tokio::test]
    async fn states_round_trip_and_unknown_for_missing() {
        let states = ZooTableStates::new(Arc::new(LocalStore::new()));
        let t = TableId::new("t1");
        assert_eq!(states.state(&t).await, TableState::Unknown);
        states.set_state(&t, TableState::Online).await.unwrap();
        assert_eq!(states.state(&t).await, TableState::Online);
        states.set_state(&t, TableState::Deleting).await.unwrap();
        assert_eq!(states.state(&t).await, TableState::Deleting);
        assert_eq!(states.state(&TableId::root()).await, TableState::Online);
    }
}
