//! Administrative operations over a FATE store: cancel, fail, delete, and
//! the summary/print listings the CLI exposes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tabletdb_common::FateId;
use tabletdb_coordination::lock::LockId;
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tracing::info;
use uuid::Uuid;

use crate::store::{FateReservation, FateStore, ReserveResult, TStatus};

/// How long admin mutations wait for a busy transaction before giving up.
pub const DEFAULT_ADMIN_WAIT: Duration = Duration::from_secs(30);

/// One transaction's line in a summary listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FateTxnSummary {
    /// The transaction id, in `FATE:<type>:<uuid>` form
    pub fate_id: String,
    /// Status, `UNKNOWN` when the record vanished mid-listing
    pub status: String,
    /// Operation name, when known
    pub fate_op: Option<String>,
    /// Creation time in millis since the epoch; zero when unknown
    pub time_created: u64,
    /// Depth of the step stack
    pub stack_depth: usize,
    /// Display form of the reservation holding the transaction, if busy
    pub reservation: Option<String>,
}

/// A full summary report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FateSummaryReport {
    /// Per-status counts over the listed transactions
    pub status_counts: BTreeMap<String, usize>,
    /// The listed transactions
    pub txns: Vec<FateTxnSummary>,
}

/// Admin surface over one FATE store.
pub struct FateAdmin<'a, R> {
    store: &'a FateStore<R>,
    admin_wait: Duration,
}

impl<'a, R> FateAdmin<'a, R>
where
    R: Serialize + serde::de::DeserializeOwned,
{
    /// Wrap a store with the default busy-wait.
    pub fn new(store: &'a FateStore<R>) -> Self {
        FateAdmin {
            store,
            admin_wait: DEFAULT_ADMIN_WAIT,
        }
    }

    /// Override how long mutating operations wait for a busy transaction.
    pub fn with_admin_wait(mut self, wait: Duration) -> Self {
        self.admin_wait = wait;
        self
    }

    /// Cancel a transaction that has not been seeded: `NEW → FAILED`.
    /// Returns `false` if the transaction had already progressed.
    pub async fn cancel(&self, fate_id: &FateId) -> TabletDbResult<bool> {
        match self.store.status(fate_id).await? {
            Some(TStatus::New) => {
                self.store.set_status(fate_id, TStatus::Failed).await?;
                info!(%fate_id, "cancelled");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Force a transaction onto the failure path so workers undo it.
    /// Requires the transaction to be unreserved; waits up to the admin
    /// wait for a busy one, then gives up with `Ok(false)`.
    pub async fn fail(&self, fate_id: &FateId) -> TabletDbResult<bool> {
        let Some(reservation) = self.reserve_within_wait(fate_id).await? else {
            return Ok(false);
        };
        let result = async {
            match self.store.status(fate_id).await? {
                Some(TStatus::Submitted | TStatus::InProgress) => {
                    self.store
                        .set_status(fate_id, TStatus::FailedInProgress)
                        .await?;
                    info!(%fate_id, "marked failed in progress");
                    Ok(true)
                }
                Some(TStatus::New) => {
                    self.store.set_status(fate_id, TStatus::Failed).await?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
        .await;
        self.store.unreserve(fate_id, &reservation).await?;
        result
    }

    /// Delete a transaction's record. Requires the transaction to be
    /// unreserved and in a deletable status; otherwise `Ok(false)` (busy)
    /// or an error (wrong status).
    pub async fn delete(&self, fate_id: &FateId) -> TabletDbResult<bool> {
        let Some(reservation) = self.reserve_within_wait(fate_id).await? else {
            return Ok(false);
        };
        let status = self.store.status(fate_id).await?;
        match status {
            Some(status) if status.is_deletable() => {
                self.store.delete(fate_id).await?;
                Ok(true)
            }
            Some(status) => {
                self.store.unreserve(fate_id, &reservation).await?;
                Err(TabletDbError::InvalidArgument(format!(
                    "cannot delete {fate_id} in status {status}"
                )))
            }
            None => Ok(true),
        }
    }

    async fn reserve_within_wait(
        &self,
        fate_id: &FateId,
    ) -> TabletDbResult<Option<FateReservation>> {
        // an identity for this admin invocation; admin is not a long-lived
        // service, so the lock id is synthetic and never looked up
        let reservation = FateReservation {
            lock_id: LockId {
                path: "/locks/admin".to_string(),
                uuid: Uuid::new_v4(),
                seq: 0,
            },
            uuid: Uuid::new_v4(),
        };
        let deadline = tokio::time::Instant::now() + self.admin_wait;
        loop {
            match self.store.reserve(fate_id, &reservation).await {
                Ok(ReserveResult::Accepted) => return Ok(Some(reservation)),
                Ok(ReserveResult::Rejected(_)) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Ok(None);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(TabletDbError::NoSuchFateTransaction(_)) => return Ok(Some(reservation)),
                Err(e) => return Err(e),
            }
        }
    }

    /// Summarize transactions, optionally filtered to specific ids and
    /// statuses. Ids listed by the store but missing when probed are
    /// reported with status `UNKNOWN` and `time_created` zero; they are
    /// counted under `UNKNOWN` rather than dropped.
    pub async fn summary(
        &self,
        id_filter: &[FateId],
        status_filter: &[TStatus],
    ) -> TabletDbResult<FateSummaryReport> {
        let mut ids = self.store.list().await?;
        if !id_filter.is_empty() {
            ids.retain(|id| id_filter.contains(id));
            // probe explicitly requested ids even if the listing missed them
            for id in id_filter {
                if !ids.contains(id) {
                    ids.push(*id);
                }
            }
        }

        let mut txns = Vec::with_capacity(ids.len());
        for fate_id in ids {
            let summary = match self.store.read(&fate_id).await? {
                Some(view) => FateTxnSummary {
                    fate_id: fate_id.to_string(),
                    status: view.status.to_string(),
                    fate_op: view.fate_op,
                    time_created: view.created_millis,
                    stack_depth: view.stack_depth,
                    reservation: view.reservation.map(|r| r.lock_id.to_string()),
                },
                // deleted between listing and probing
                None => FateTxnSummary {
                    fate_id: fate_id.to_string(),
                    status: TStatus::Unknown.to_string(),
                    fate_op: None,
                    time_created: 0,
                    stack_depth: 0,
                    reservation: None,
                },
            };
            if !status_filter.is_empty()
                && !status_filter.iter().any(|s| s.to_string() == summary.status)
            {
                continue;
            }
            txns.push(summary);
        }
        txns.sort_by_key(|t| t.time_created);

        let mut status_counts = BTreeMap::new();
        for txn in &txns {
            *status_counts.entry(txn.status.clone()).or_insert(0) += 1;
        }
        Ok(FateSummaryReport {
            status_counts,
            txns,
        })
    }
}

#[cfg(test)]
mod tests {
    use tabletdb_common::FateInstanceType;
    use tabletdb_metadata::InMemoryAmple;

    use super::*;

    fn store() -> FateStore<Vec<u8>> {
        FateStore::new(InMemoryAmple::new().system_kv(), FateInstanceType::User)
    }

    #[tokio::test]
    async fn cancel_only_new() {
        let store = store();
        let admin = FateAdmin::new(&store);
        let id = store.create().await.unwrap();
        assert!(admin.cancel(&id).await.unwrap());
        assert_eq!(store.status(&id).await.unwrap(), Some(TStatus::Failed));
        // cancelling again is a no-op
        assert!(!admin.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn fail_of_busy_txn_gives_up() {
        let store = store();
        let admin = FateAdmin::new(&store).with_admin_wait(Duration::from_millis(50));
        let id = store.create().await.unwrap();
        store.seed("OP", &id, &vec![1], false).await.unwrap();

        let busy = FateReservation {
            lock_id: LockId {
                path: "/locks/manager".to_string(),
                uuid: Uuid::new_v4(),
                seq: 1,
            },
            uuid: Uuid::new_v4(),
        };
        store.reserve(&id, &busy).await.unwrap();
        assert!(!admin.fail(&id).await.unwrap());

        store.unreserve(&id, &busy).await.unwrap();
        assert!(admin.fail(&id).await.unwrap());
        assert_eq!(
            store.status(&id).await.unwrap(),
            Some(TStatus::FailedInProgress)
        );
    }

    #[tokio::test]
    async fn delete_requires_deletable_status() {
        let store = store();
        let admin = FateAdmin::new(&store).with_admin_wait(Duration::from_millis(50));
        let id = store.create().await.unwrap();
        store.seed("OP", &id, &vec![1], false).await.unwrap();
        // SUBMITTED is not deletable
        assert!(admin.delete(&id).await.is_err());
        store.set_status(&id, TStatus::Successful).await.unwrap();
        assert!(admin.delete(&id).await.unwrap());
        assert!(store.read(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn summary_tolerates_missing_rows() {
        let store = store();
        let admin = FateAdmin::new(&store);
        let keep = store.create().await.unwrap();
        let vanish = store.create().await.unwrap();
        store.delete(&vanish).await.unwrap();

        // ask for both; the deleted one must be listed as UNKNOWN with
        // zero creation time, not error out
        let report = admin.summary(&[keep, vanish], &[]).await.unwrap();
        assert_eq!(report.txns.len(), 2);
        let unknown = report
            .txns
            .iter()
            .find(|t| t.fate_id == vanish.to_string())
            .unwrap();
        assert_eq!(unknown.status, "UNKNOWN");
        assert_eq!(unknown.time_created, 0);
        assert_eq!(report.status_counts["UNKNOWN"], 1);
        assert_eq!(report.status_counts["NEW"], 1);
    }
}
