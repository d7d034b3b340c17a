//! Service traits the client drives.
//!
//! These are the call surfaces of tablet servers and the manager. The wire
//! IDL is an external concern; standalone deployments implement these
//! directly and hand the client in-process references through
//! [`ServerConnector`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tabletdb_common::{
    Authorizations, ConditionalMutation, ConditionalWriteStatus, Durability, KeyExtent, Mutation,
    TableId,
};
use tabletdb_coordination::lock::LockId;
use tabletdb_errors::TabletDbResult;

/// A conditional-update session handle, as returned by the server.
///
/// Sessions are strictly single-threaded: the server reserves the session
/// for the duration of each request and the client never pipelines two
/// requests onto one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalSessionInfo {
    /// Server-assigned session id
    pub session_id: u64,
    /// Idle lifetime; the client stops reusing the session at 95% of this
    pub ttl: Duration,
    /// The server's service lock, used by the client to tell a dead server
    /// from a slow one
    pub lock_id: LockId,
}

/// Result of one conditional-update RPC: the final status of every
/// mutation in the request, keyed by the client-assigned mutation id.
#[derive(Debug, Clone, Default)]
pub struct ConditionalUpdateResult {
    /// Per-mutation outcomes
    pub statuses: Vec<(u64, ConditionalWriteStatus)>,
}

/// Result of one unconditional write batch: everything not listed here was
/// applied and made durable at the requested durability.
#[derive(Debug, Clone, Default)]
pub struct WriteBatchResult {
    /// Mutations refused by a table constraint, with the reason
    pub violations: Vec<(u64, String)>,
    /// Mutations the server could not take right now (tablet closed or no
    /// longer hosted here); resubmit after refreshing the locator
    pub ignored: Vec<u64>,
}

/// How an unload should treat the tablet's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnloadGoal {
    /// Flush and forget; the tablet goes back to unassigned.
    Unassign,
    /// Remember the server so the tablet can return to it quickly.
    Suspend,
    /// The tablet is being deleted; drop everything.
    Delete,
}

/// The tablet-server call surface used by clients and the manager.
#[async_trait]
pub trait TabletServerService: Send + Sync {
    /// Apply unconditional mutations, batched by extent. Each mutation is
    /// `(client id, mutation)`; `durability` is the floor requested for
    /// the whole batch (the table default may raise it further). Every
    /// mutation not reported back was applied and logged; `ignored` ones
    /// were not applied at all and may be resubmitted.
    async fn apply_mutations(
        &self,
        batch: HashMap<KeyExtent, Vec<(u64, Mutation)>>,
        durability: Durability,
    ) -> TabletDbResult<WriteBatchResult>;

    /// Open a conditional-update session.
    async fn start_conditional_session(
        &self,
        authorizations: Authorizations,
    ) -> TabletDbResult<ConditionalSessionInfo>;

    /// Evaluate and apply conditional mutations, batched by extent. Each
    /// mutation is `(client id, mutation)`.
    async fn conditional_update(
        &self,
        session_id: u64,
        batch: HashMap<KeyExtent, Vec<(u64, ConditionalMutation)>>,
    ) -> TabletDbResult<ConditionalUpdateResult>;

    /// The unknown-status fence: after this returns, the server guarantees
    /// no further mutation from `session_id` will ever be applied.
    async fn invalidate_conditional_update(&self, session_id: u64) -> TabletDbResult<()>;

    /// Discard a session.
    async fn close_conditional_session(&self, session_id: u64) -> TabletDbResult<()>;

    /// Manager: host a tablet.
    async fn load_tablet(&self, extent: KeyExtent) -> TabletDbResult<()>;

    /// Manager: stop hosting a tablet.
    async fn unload_tablet(&self, extent: KeyExtent, goal: UnloadGoal) -> TabletDbResult<()>;

    /// Make hosted tablets re-read their metadata (bulk import landed new
    /// files).
    async fn refresh_tablets(&self, extents: Vec<KeyExtent>) -> TabletDbResult<()>;

    /// Liveness probe.
    async fn ping(&self) -> TabletDbResult<()>;
}

/// The manager call surface.
#[async_trait]
pub trait ManagerService: Send + Sync {
    /// Gracefully shut down a tablet server. With `force`, skip the
    /// reachability pre-check.
    async fn server_shutdown(&self, server: String, force: bool) -> TabletDbResult<()>;

    /// Request hosting for on-demand tablets.
    async fn host_ondemand(&self, extents: Vec<KeyExtent>) -> TabletDbResult<()>;
}

/// Maps a row to the tablet covering it and that tablet's current server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletLocation {
    /// The covering tablet
    pub extent: KeyExtent,
    /// Location (host:port) of the hosting server
    pub server: String,
}

/// The client's tablet locator, backed by a metadata cache that can go
/// stale; callers invalidate on any sign of staleness and retry.
#[async_trait]
pub trait TabletLocator: Send + Sync {
    /// Locate the hosted tablet covering `row`, or `None` if it is not
    /// currently hosted anywhere.
    async fn locate(&self, table: &TableId, row: &[u8]) -> TabletDbResult<Option<TabletLocation>>;

    /// Drop any cached location for `extent`.
    fn invalidate(&self, extent: &KeyExtent);
}

/// Resolves a server location to its service handle.
pub trait ServerConnector: Send + Sync {
    /// Connect to (or look up) the server at `location`.
    fn connect(&self, location: &str) -> Option<Arc<dyn TabletServerService>>;
}
