//! Metric names recorded by TabletDB components.

/// Constants for every metric name, so dashboards and code never drift.
pub mod recorded {
    /// Counter: conditional mutations by final status. Tagged with `status`.
    pub const CONDITIONAL_MUTATIONS: &str = "tabletdb_conditional_mutations_total";

    /// Counter: write-ahead log rotations on this server.
    pub const WAL_ROTATIONS: &str = "tabletdb_wal_rotations_total";

    /// Counter: write-ahead log append failures that triggered a retry.
    pub const WAL_WRITE_RETRIES: &str = "tabletdb_wal_write_retries_total";

    /// Gauge: FATE transactions currently reserved by workers.
    pub const FATE_TXNS_IN_PROGRESS: &str = "tabletdb_fate_in_progress";

    /// Counter: dead FATE reservations reclaimed.
    pub const FATE_RESERVATIONS_RECLAIMED: &str = "tabletdb_fate_reservations_reclaimed_total";

    /// Histogram: duration of one full tablet-group-watcher scan, seconds.
    /// Tagged with `level`.
    pub const WATCHER_SCAN_DURATION: &str = "tabletdb_watcher_scan_duration_seconds";

    /// Counter: tablet assignments requested by the watcher.
    pub const TABLETS_ASSIGNED: &str = "tabletdb_tablets_assigned_total";

    /// Counter: bulk imports refused by the admission check.
    pub const BULK_IMPORTS_REFUSED: &str = "tabletdb_bulk_imports_refused_total";
}
