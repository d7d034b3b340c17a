//! Shared data model for the TabletDB tablet store.
//!
//! Everything in this crate is plain data: identifiers, key/value and
//! mutation types, tablet extents, durability levels, and configuration.
//! Behavior lives in the crates that consume these types.

pub mod config;
pub mod extent;
pub mod ids;
pub mod keys;
pub mod metrics;
pub mod mutation;

pub use config::{SystemConfig, TableConfig};
pub use extent::KeyExtent;
pub use ids::{DataLevel, FateId, FateInstanceType, TServerInstance, TableId};
pub use keys::{Authorizations, Key, Value};
pub use mutation::{
    ColumnUpdate, Condition, ConditionalMutation, ConditionalWriteStatus, Durability,
    IteratorSetting, Mutation, UpdateValue,
};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Per-tablet hosting policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TabletAvailability {
    /// The tablet must always have a location.
    Hosted,
    /// The tablet is hosted only while something wants it.
    #[default]
    Ondemand,
    /// The tablet is never hosted; its files are only read directly.
    Unhosted,
}

/// The type of a multi-step administrative operation that can hold a tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TabletOperationType {
    /// The tablet is being split into two.
    Splitting,
    /// The tablet is being merged into a neighbor.
    Merging,
    /// The tablet (or its table) is being deleted.
    Deleting,
}

/// The active operation on a tablet: its type plus the FATE transaction
/// driving it. Tablets carrying one of these are never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabletOperationId {
    /// What kind of operation holds the tablet
    pub op_type: TabletOperationType,
    /// The FATE transaction performing it
    pub fate_id: FateId,
}

impl std::fmt::Display for TabletOperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.op_type, self.fate_id)
    }
}
