//! Goal-state computation.

use tabletdb_client::rpc::UnloadGoal;
use tabletdb_common::TabletAvailability;
use tabletdb_metadata::{TabletMetadata, TabletState};

use crate::tables::TableState;

/// Where the manager wants a tablet to be. Computed fresh on every scan
/// and never stored; the dispatch logic treats it as the single source of
/// truth and no branch mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TabletGoalState {
    /// The tablet should have a location.
    Hosted,
    /// The tablet should have no location.
    Unassigned,
    /// The tablet should be unloaded but remember its server.
    Suspended,
    /// The tablet's table is going away.
    Deleted,
}

impl TabletGoalState {
    /// Compute the goal for one tablet.
    pub fn compute(
        tm: &TabletMetadata,
        _state: TabletState,
        table_state: TableState,
        suspension_enabled: bool,
    ) -> TabletGoalState {
        match table_state {
            TableState::Deleting => return TabletGoalState::Deleted,
            TableState::Offline => {
                return if suspension_enabled {
                    TabletGoalState::Suspended
                } else {
                    TabletGoalState::Unassigned
                };
            }
            TableState::Online => {}
            // the caller skips UNKNOWN tables before getting here
            TableState::Unknown => return TabletGoalState::Unassigned,
        }
        match tm.availability() {
            TabletAvailability::Hosted => TabletGoalState::Hosted,
            TabletAvailability::Unhosted => TabletGoalState::Unassigned,
            TabletAvailability::Ondemand => {
                if tm.hosting_requested() {
                    TabletGoalState::Hosted
                } else {
                    TabletGoalState::Unassigned
                }
            }
        }
    }

    /// How an unload driven by this goal should treat the tablet.
    pub fn how_unload(self) -> UnloadGoal {
        match self {
            TabletGoalState::Suspended => UnloadGoal::Suspend,
            TabletGoalState::Deleted => UnloadGoal::Delete,
            TabletGoalState::Hosted | TabletGoalState::Unassigned => UnloadGoal::Unassign,
        }
    }
}
