//! Typed configuration for servers, tables, and the manager.
//!
//! Defaults here are the production defaults; tests construct these structs
//! directly with whatever small values they need.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mutation::Durability;

/// System-wide configuration, shared by every process of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Rotate the current write-ahead log once it reaches this many bytes.
    pub wal_max_size: u64,
    /// Rotate the current write-ahead log once it has been open this long.
    pub wal_max_age: Duration,
    /// How many consecutive failures the next-log maker tolerates before
    /// the tablet server gives up and halts.
    pub wal_tolerated_creation_failures: u32,
    /// Cap on assignment/unassignment work queued per live tablet server in
    /// one watcher scan before changes are flushed.
    pub max_tserver_work_chunk: usize,
    /// How long a suspended tablet waits for its previous server to return
    /// before being reassigned elsewhere.
    pub table_suspend_duration: Duration,
    /// Idle lifetime of a server-side conditional session.
    pub session_ttl: Duration,
    /// Overall client-side deadline for a conditional write.
    pub conditional_writer_timeout: Duration,
    /// Volume replacements `(decommissioned prefix, replacement prefix)`;
    /// file and log paths under a decommissioned prefix are rewritten by
    /// the manager once their tablet is at rest.
    pub volume_replacements: Vec<(String, String)>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            wal_max_size: 1 << 30,
            wal_max_age: Duration::from_secs(24 * 60 * 60),
            wal_tolerated_creation_failures: 50,
            max_tserver_work_chunk: 5_000,
            table_suspend_duration: Duration::from_secs(0),
            session_ttl: Duration::from_secs(60),
            conditional_writer_timeout: Duration::from_secs(u64::MAX / 1_000),
            volume_replacements: Vec::new(),
        }
    }
}

/// Per-table configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Hard cap on files in a single tablet after a bulk import; imports
    /// that would exceed it are refused whole.
    pub bulk_max_tablet_files: usize,
    /// Cap on tablets a single bulk-imported file may be mapped into.
    pub bulk_max_tablets: usize,
    /// Once a tablet holds more than this many files, further bulk imports
    /// into it pause until compaction catches up. Blocks bulk transactions
    /// only, never user writes.
    pub file_pause: usize,
    /// Default durability for writes to this table.
    pub durability: Durability,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            bulk_max_tablet_files: 100,
            bulk_max_tablets: 100,
            file_pause: 100,
            durability: Durability::Sync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let sys = SystemConfig::default();
        assert!(sys.wal_max_size >= 1 << 20);
        assert!(sys.wal_tolerated_creation_failures > 0);
        let table = TableConfig::default();
        assert!(table.file_pause <= table.bulk_max_tablet_files);
        assert_eq!(table.durability, Durability::Sync);
    }
}
