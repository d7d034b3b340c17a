//! The manager: the cluster-wide coordinator.
//!
//! One [`watcher::TabletGroupWatcher`] per data level drives every tablet
//! toward its goal state; FATE transactions carry the multi-tablet
//! administrative operations (create table, bulk import, server shutdown);
//! and the balancer decides where unassigned tablets land.

pub mod balancer;
pub mod bulk;
pub mod env;
pub mod flush;
pub mod live_servers;
pub mod manager;
pub mod ondemand;
pub mod state;
pub mod steps;
pub mod tables;
pub mod upgrade;
pub mod volume;
pub mod watcher;

pub use balancer::{Balancer, SimpleLoadBalancer};
pub use env::ManagerEnv;
pub use live_servers::LiveTServerSet;
pub use manager::Manager;
pub use state::TabletGoalState;
pub use steps::Step;
pub use tables::{TableState, TableStateSource, ZooTableStates};
pub use watcher::TabletGroupWatcher;
