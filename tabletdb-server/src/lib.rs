//! The tablet server: hosts tablets, runs the per-tablet write path, and
//! serves the server side of the conditional-write pipeline.

pub mod conditional;
pub mod server;
pub mod session;
pub mod tablet;
pub mod visibility;
pub mod write;

pub use conditional::{check_conditions_and_commit, RowLocks};
pub use server::{AmpleLogPublisher, TabletServer};
pub use session::SessionManager;
pub use tablet::Tablet;
pub use write::{prepare_mutations_for_commit, ConstraintChecker, Prepared, SizeConstraint};
