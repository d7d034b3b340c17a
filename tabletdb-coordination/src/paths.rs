//! The instance's coordination-service layout.
//!
//! All paths are relative to the instance root and built through these
//! helpers so the layout exists in exactly one place.

use tabletdb_common::{FateId, TableId};

/// Per-table property bundle.
pub fn table_conf(table: &TableId) -> String {
    format!("/tables/{table}/conf")
}

/// Per-namespace property bundle.
pub fn namespace_conf(namespace: &str) -> String {
    format!("/namespaces/{namespace}/conf")
}

/// System-wide property bundle.
pub const SYSTEM_CONF: &str = "/config";

/// Auth record for a base64-encoded principal.
pub fn user(principal_b64: &str) -> String {
    format!("/users/{principal_b64}")
}

/// A META-FATE transaction's node.
pub fn fate_txn(fate_id: &FateId) -> String {
    format!("/fate/{}", fate_id.uuid)
}

/// Parent of all META-FATE transaction nodes.
pub const FATE_ROOT: &str = "/fate";

/// Lock directory for a named service (manager, gc, a tablet server's
/// host:port, ...).
pub fn service_lock(service: &str) -> String {
    format!("/locks/{service}")
}

/// Parent of all tablet-server lock directories.
pub const TSERVER_LOCKS_ROOT: &str = "/locks/tservers";

/// Lock directory for one tablet server.
pub fn tserver_lock(location: &str) -> String {
    format!("{TSERVER_LOCKS_ROOT}/{location}")
}

/// Lock directory for the manager.
pub const MANAGER_LOCK: &str = "/locks/manager";

/// A write-ahead-log marker for one server's log.
pub fn wal_marker(server: &str, log_uuid: &str) -> String {
    format!("/wals/{server}/{log_uuid}")
}

/// Parent of one server's WAL markers.
pub fn wal_markers(server: &str) -> String {
    format!("/wals/{server}")
}

/// Singleton marker blocking new work while an upgrade is prepared.
pub const PREPARE_FOR_UPGRADE: &str = "/prepare-for-upgrade";

/// Shared/exclusive table lock node.
pub fn table_lock(table: &TableId) -> String {
    format!("/table-locks/{table}")
}
