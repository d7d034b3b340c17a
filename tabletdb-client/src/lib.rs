//! Client bindings for TabletDB.
//!
//! The wire protocol itself is out of scope here; cross-process call
//! surfaces are the [`rpc`] service traits, implemented in-process by the
//! server crates and by whatever transport a deployment puts in front of
//! them. On top of those sit the conditional writer (compare-and-set
//! writes with sessions and the unknown-status fence) and bulk-import load
//! plans.

pub mod load_plan;
pub mod rpc;
pub mod writer;

pub use load_plan::{LoadPlan, LoadPlanBuilder, LoadPlanEntry, RangeType};
pub use rpc::{
    ConditionalSessionInfo, ConditionalUpdateResult, ManagerService, ServerConnector,
    TabletLocation, TabletLocator, TabletServerService, UnloadGoal, WriteBatchResult,
};
pub use writer::{ConditionalWriter, ConditionalWriterConfig, ConditionalWriteResult};
