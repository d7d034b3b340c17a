//! Typed access to the tablet metadata table.
//!
//! Every piece of tablet lifecycle state in the system lives in metadata
//! rows keyed by extent (see [`KeyExtent::metadata_row`]). This crate
//! exposes the typed surface over those rows: point reads, range scans, and
//! the conditional mutator that is the *only* sanctioned way to change
//! them. Conditional mutations are atomic per tablet row; atomicity across
//! rows is deliberately absent (multi-tablet changes go through FATE).
//!
//! [`KeyExtent::metadata_row`]: tabletdb_common::KeyExtent::metadata_row

pub mod ample;
pub mod mem;
pub mod tablet;

pub use ample::{
    Ample, AmpleBackend, ConditionalResult, ConditionalStatus, ConditionalTabletMutation, Require,
    SystemKv, TabletMutationOp, TabletMutator, TabletsMutator, TabletsReader,
};
pub use mem::{InMemoryAmple, InMemoryAmpleSnapshot};
pub use tablet::{
    MetadataTime, StoredTabletFile, SuspendingTServer, TabletMergeability, TabletMetadata,
    TabletMetadataBuilder, TabletState, WalRef,
};
