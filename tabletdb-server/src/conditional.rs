//! Server-side conditional-mutation evaluation.
//!
//! Mutations arrive batched by extent. Within a request, only one mutation
//! per row runs per round (later ones see earlier rounds' writes), rows are
//! locked with a non-blocking attempt (contended rows defer to the next
//! round), and for each locked row the conditions are checked against a
//! scoped scan of the tablet. Survivors are logged and committed while the
//! row lock is still held.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use parking_lot::Mutex;
use tabletdb_common::metrics::recorded;
use tabletdb_common::{
    Authorizations, Condition, ConditionalMutation, ConditionalWriteStatus,
};
use tabletdb_errors::TabletDbResult;
use tabletdb_wal::{TabletLogWrite, TabletServerLogger};
use tracing::trace;

use crate::tablet::Tablet;
use crate::visibility;
use crate::write::ConstraintChecker;

/// The server-wide row-lock table. Keys are `(metadata row of the tablet,
/// row)` so identical rows in different tablets do not contend.
#[derive(Default)]
pub struct RowLocks {
    held: Mutex<HashSet<(Bytes, Bytes)>>,
}

impl RowLocks {
    /// An empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    fn try_lock(&self, tablet: &Bytes, row: &Bytes) -> bool {
        self.held.lock().insert((tablet.clone(), row.clone()))
    }

    fn unlock(&self, tablet: &Bytes, row: &Bytes) {
        self.held.lock().remove(&(tablet.clone(), row.clone()));
    }
}

/// Evaluate and apply one extent's worth of conditional mutations,
/// returning `(client id, status)` for every input.
pub async fn check_conditions_and_commit(
    tablet: &Arc<Tablet>,
    authorizations: &Authorizations,
    mutations: Vec<(u64, ConditionalMutation)>,
    constraints: &[Arc<dyn ConstraintChecker>],
    row_locks: &RowLocks,
    logger: &TabletServerLogger,
) -> TabletDbResult<Vec<(u64, ConditionalWriteStatus)>> {
    let tablet_key = tablet.extent().metadata_row();
    let mut results = Vec::with_capacity(mutations.len());
    let mut queue = mutations;

    while !queue.is_empty() {
        queue.sort_by(|a, b| a.1.row().cmp(b.1.row()));

        // one mutation per row per round; the rest wait so each writer only
        // sees writes from earlier rounds
        let mut rows_this_round: HashSet<Bytes> = HashSet::new();
        let mut this_round = Vec::new();
        let mut deferred = Vec::new();
        for (id, cm) in queue {
            if rows_this_round.insert(cm.row().clone()) {
                this_round.push((id, cm));
            } else {
                deferred.push((id, cm));
            }
        }

        let mut made_progress = false;
        for (id, cm) in this_round {
            let row = cm.row().clone();
            if !row_locks.try_lock(&tablet_key, &row) {
                // locked by a concurrent request; try again next round
                deferred.push((id, cm));
                continue;
            }
            made_progress = true;
            let status = evaluate_and_commit(tablet, authorizations, &cm, constraints, logger).await;
            row_locks.unlock(&tablet_key, &row);
            let status = status?;
            counter!(recorded::CONDITIONAL_MUTATIONS, "status" => status.to_string()).increment(1);
            results.push((id, status));
        }

        queue = deferred;
        if !made_progress && !queue.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
    Ok(results)
}

async fn evaluate_and_commit(
    tablet: &Arc<Tablet>,
    authorizations: &Authorizations,
    cm: &ConditionalMutation,
    constraints: &[Arc<dyn ConstraintChecker>],
    logger: &TabletServerLogger,
) -> TabletDbResult<ConditionalWriteStatus> {
    // a condition over a visibility the submitter cannot read is its own
    // status, distinct from a plain rejection
    for condition in &cm.conditions {
        if !visibility::can_see(&condition.visibility, authorizations).unwrap_or(false)
            && !condition.visibility.is_empty()
        {
            return Ok(ConditionalWriteStatus::InvisibleVisibility);
        }
    }

    // the scan engine resolves each condition's iterator stack from the
    // request's symbol table; the raw row view is what reaches the checks
    let cells = tablet.scan_row(cm.row(), authorizations);
    if !cm.conditions.iter().all(|c| condition_holds(c, &cells)) {
        return Ok(ConditionalWriteStatus::Rejected);
    }

    if let Some(reason) = constraints.iter().find_map(|c| c.check(&cm.mutation).err()) {
        trace!(row = ?cm.row(), reason, "conditional mutation violated constraint");
        return Ok(ConditionalWriteStatus::Violated);
    }

    let Some(session) = tablet.grant_session() else {
        return Ok(ConditionalWriteStatus::Ignored);
    };

    let durability = session.durability(tabletdb_common::Durability::Sync);
    if durability.uses_log() {
        let write = TabletLogWrite {
            extent: tablet.extent(),
            seq: session.seq(),
            mutations: std::slice::from_ref(&cm.mutation),
            durability,
        };
        if let Err(e) = logger.log(&[write]).await {
            // durability could not be established; nothing was committed
            session.abort();
            return Err(e);
        }
    }
    session.commit(std::slice::from_ref(&cm.mutation));
    Ok(ConditionalWriteStatus::Accepted)
}

/// Check one condition against the row's visible cells (newest version
/// first within each cell).
fn condition_holds(
    condition: &Condition,
    cells: &[(tabletdb_common::Key, tabletdb_common::Value)],
) -> bool {
    let matching = cells.iter().find(|(k, _)| {
        k.family == condition.family
            && k.qualifier == condition.qualifier
            && k.visibility == condition.visibility
            && condition.timestamp.map_or(true, |ts| k.timestamp == ts)
    });
    match (&condition.expected, matching) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some(_), None) => false,
        (Some(expected), Some((_, value))) => value.0 == *expected,
    }
}
