//! Typed access to the hierarchical coordination service, and the service
//! lock built on top of it.
//!
//! The coordination service itself (a ZooKeeper-class system) is an external
//! collaborator; everything here goes through the [`CoordinationStore`]
//! trait. [`LocalStore`] is the in-process implementation used by standalone
//! deployments and tests; it faithfully models versions, ephemeral and
//! sequential nodes, sessions, and watches.

pub mod cache;
pub mod local;
pub mod lock;
pub mod paths;
pub mod store;

pub use cache::CachedStore;
pub use local::{LocalStore, LocalStoreSnapshot};
pub use lock::{LockId, LockWatcher, ServiceLock};
pub use store::{CoordinationStore, CreatePolicy, NodeMode, WatchEvent, WatcherId};
