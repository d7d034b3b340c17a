//! The environment FATE steps and the watcher run against.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tabletdb_client::rpc::ServerConnector;
use tabletdb_common::{SystemConfig, TableConfig, TableId};
use tabletdb_coordination::store::CoordinationStore;
use tabletdb_metadata::Ample;

use crate::tables::ZooTableStates;

/// Everything a manager-side operation needs, passed explicitly; the only
/// process-wide singletons in the system are the service context objects
/// like this one.
pub struct ManagerEnv {
    /// The metadata table surface
    pub ample: Ample,
    /// The coordination service
    pub coordination: Arc<dyn CoordinationStore>,
    /// How to reach tablet servers
    pub connector: Arc<dyn ServerConnector>,
    /// System configuration
    pub config: SystemConfig,
    /// Table lifecycle states
    pub table_states: ZooTableStates,
    /// Per-table configuration overrides
    table_configs: RwLock<HashMap<TableId, TableConfig>>,
}

impl ManagerEnv {
    /// Assemble an environment.
    pub fn new(
        ample: Ample,
        coordination: Arc<dyn CoordinationStore>,
        connector: Arc<dyn ServerConnector>,
        config: SystemConfig,
    ) -> Arc<ManagerEnv> {
        let table_states = ZooTableStates::new(Arc::clone(&coordination));
        Arc::new(ManagerEnv {
            ample,
            coordination,
            connector,
            config,
            table_states,
            table_configs: RwLock::new(HashMap::new()),
        })
    }

    /// The effective configuration for `table`.
    pub fn table_config(&self, table: &TableId) -> TableConfig {
        self.table_configs
            .read()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Install a table's configuration.
    pub fn set_table_config(&self, table: TableId, config: TableConfig) {
        self.table_configs.write().insert(table, config);
    }
}
