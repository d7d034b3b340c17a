//! The coordination-store adapter trait.

use std::sync::Arc;

use async_trait::async_trait;
use tabletdb_errors::TabletDbResult;

/// Lifetime mode of a created node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// Survives sessions; deleted only explicitly.
    Persistent,
    /// Deleted automatically when the creating session ends.
    Ephemeral,
    /// Ephemeral, with a monotonically increasing 10-digit sequence number
    /// appended to the requested name by the service.
    EphemeralSequential,
}

/// What to do when a created node already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatePolicy {
    /// Surface `AlreadyExists`.
    FailIfExists,
    /// Replace the existing node's data.
    Overwrite,
    /// Leave the existing node untouched and report success.
    SkipIfExists,
}

/// An event delivered to a watch listener.
///
/// Listeners run on the adapter's I/O thread; they must not block, and in
/// particular must never call back into the store synchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The watched node's data changed.
    Changed(String),
    /// The watched node was deleted.
    Deleted(String),
    /// The session owning the watch expired; all ephemeral state created by
    /// it is gone.
    SessionExpired,
}

/// Handle for removing a registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(pub(crate) u64);

/// Callback invoked with watch events.
pub type WatchListener = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Typed access to the hierarchical coordination service.
///
/// Read operations recover from transient disconnects internally; mutation
/// operations surface [`Disconnected`](tabletdb_errors::TabletDbError::Disconnected)
/// so the caller can decide whether the write may have landed.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create a node. Parents are created as persistent nodes when missing.
    /// Returns the node's actual path, which differs from `path` only for
    /// [`NodeMode::EphemeralSequential`].
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: NodeMode,
        policy: CreatePolicy,
    ) -> TabletDbResult<String>;

    /// Read the node, apply `f` to its data, and write the result back
    /// conditional on the version being unchanged. A concurrent writer
    /// surfaces as `VersionMismatch`; retrying is the caller's choice.
    async fn mutate_existing(
        &self,
        path: &str,
        f: &(dyn for<'b> Fn(&'b [u8]) -> TabletDbResult<Vec<u8>> + Sync),
    ) -> TabletDbResult<Vec<u8>>;

    /// Write a node's data conditional on its version being exactly
    /// `expected_version`. A concurrent writer surfaces as
    /// `VersionMismatch`.
    async fn set_data(
        &self,
        path: &str,
        data: &[u8],
        expected_version: u64,
    ) -> TabletDbResult<()>;

    /// Read a node's data and version.
    async fn get(&self, path: &str) -> TabletDbResult<(Vec<u8>, u64)>;

    /// Names (not paths) of a node's children, unordered.
    async fn get_children(&self, path: &str) -> TabletDbResult<Vec<String>>;

    /// Whether the node exists.
    async fn exists(&self, path: &str) -> TabletDbResult<bool>;

    /// Delete a node. The node must have no children.
    async fn delete(&self, path: &str) -> TabletDbResult<()>;

    /// Register a persistent watch on `path`. The listener fires for data
    /// changes, deletion, and session expiry, until unregistered.
    fn watch(&self, path: &str, listener: WatchListener) -> WatcherId;

    /// Remove a previously registered watch.
    fn unwatch(&self, id: WatcherId);

    /// The session this handle's ephemeral nodes are bound to.
    fn session_id(&self) -> u64;
}
