//! FATE: the fault-tolerant executor for multi-step administrative
//! operations.
//!
//! A FATE transaction is a durable stack of steps ([`Repo`]s). Workers
//! reserve a transaction, replay its top step, push the step it returns,
//! and repeat until a step returns `None`; every step's side effects must
//! be idempotent because `call` runs at least once. Failures walk back down
//! the stack through `undo`. Two stores exist with identical semantics:
//! `META` keeps its records in the coordination service and `USER` keeps
//! them in the metadata table; both are driven through the same
//! [`FateStore`].

pub mod admin;
pub mod engine;
pub mod store;
pub mod zoo_kv;

pub use admin::{FateAdmin, FateTxnSummary};
pub use engine::{Fate, FateConfig, Repo};
pub use store::{
    FateReservation, FateStore, FateTxnView, ReserveResult, TStatus,
};
pub use zoo_kv::ZooKv;
