//! The fluent read/mutate surface over tablet metadata.
//!
//! Reads come in two shapes: a point read by extent, and a lazy range scan
//! ([`TabletsReader`]) yielding a finite, non-restartable stream. Writes go
//! through [`TabletsMutator`], a batch of per-tablet conditional mutations:
//! each tablet's requires and actions are checked and applied atomically
//! against that tablet's row, and each tablet reports its own
//! [`ConditionalStatus`]. There is no atomicity across tablets.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tabletdb_common::{
    DataLevel, FateId, KeyExtent, TServerInstance, TableId, TabletAvailability, TabletOperationId,
};
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tracing::debug;

use crate::tablet::{
    MetadataTime, StoredTabletFile, SuspendingTServer, TabletMetadata, WalRef,
};

/// Raw outcome of one conditional tablet mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionalStatus {
    /// All requires held; all actions applied.
    Accepted,
    /// Some require failed; nothing applied.
    Rejected,
    /// The submission's fate is indeterminate.
    Unknown,
}

/// Resolved outcome of one conditional tablet mutation, including the
/// re-read row for diagnosis when the raw status was not `Accepted`.
#[derive(Debug)]
pub struct ConditionalResult {
    /// The tablet this result is for
    pub extent: KeyExtent,
    /// Final status, after the accepted-anyway predicate ran
    pub status: ConditionalStatus,
    /// The row as re-read during resolution, when one was read
    pub read_metadata: Option<TabletMetadata>,
}

/// A predicate a tablet row must satisfy for the mutation to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum Require {
    /// The row must exist.
    TabletExists,
    /// The row must not exist (used when inserting new tablets).
    AbsentTablet,
    /// No multi-step operation may hold the tablet.
    AbsentOperation,
    /// Exactly this operation must hold the tablet.
    Operation(TabletOperationId),
    /// Neither `current` nor `future` location may be set.
    AbsentLocation,
    /// `current` must be exactly this server.
    CurrentLocation(TServerInstance),
    /// `future` must be exactly this server.
    FutureLocation(TServerInstance),
    /// The availability column must match.
    Availability(TabletAvailability),
    /// No suspension record may be present.
    AbsentSuspend,
    /// The file set must equal this snapshot (same-as-read).
    SameFiles(std::collections::BTreeSet<StoredTabletFile>),
    /// This file must not be referenced (used to verify removals, which is
    /// race-free where checking presence of a replacement is not).
    AbsentFile(StoredTabletFile),
    /// This log must not be referenced.
    AbsentLog(WalRef),
    /// The loaded marker for this file must be absent.
    AbsentLoaded(StoredTabletFile),
    /// The `hosting_requested` flag must have this value.
    HostingRequested(bool),
}

/// An action applied to a tablet row once all requires hold.
#[derive(Debug, Clone, PartialEq)]
pub enum TabletMutationOp {
    /// Insert a whole new row (requires [`Require::AbsentTablet`]).
    InsertTablet(TabletMetadata),
    /// Delete the whole row.
    DeleteTablet,
    /// Add a file reference.
    PutFile(StoredTabletFile),
    /// Remove a file reference.
    DeleteFile(StoredTabletFile),
    /// Record the FATE transaction that bulk-loaded a file.
    PutLoaded(StoredTabletFile, FateId),
    /// Remove a bulk-load marker.
    DeleteLoaded(StoredTabletFile),
    /// Set the `future` location.
    SetFuture(TServerInstance),
    /// Clear the `future` location.
    DeleteFuture,
    /// Set the `current` location.
    SetCurrent(TServerInstance),
    /// Clear the `current` location.
    DeleteCurrent,
    /// Set the sticky `last` location.
    SetLast(TServerInstance),
    /// Record a suspension.
    SetSuspend(SuspendingTServer),
    /// Clear the suspension record.
    DeleteSuspend,
    /// Add a write-ahead-log reference.
    PutLog(WalRef),
    /// Remove a write-ahead-log reference.
    DeleteLog(WalRef),
    /// Mark the tablet as held by a multi-step operation.
    SetOperation(TabletOperationId),
    /// Release the multi-step operation hold.
    DeleteOperation,
    /// Change the hosting policy.
    SetAvailability(TabletAvailability),
    /// Set or clear the hosting request flag.
    SetHostingRequested(bool),
    /// Record a completed flush.
    SetFlushId(u64),
    /// Update the time column.
    SetTime(MetadataTime),
    /// Pin a migration target.
    SetMigration(TServerInstance),
    /// Clear the migration pin.
    DeleteMigration,
}

impl TabletMutationOp {
    /// Whether this action sets or clears the operation column, exempting
    /// its mutation from the mandatory `AbsentOperation` require.
    fn touches_operation(&self) -> bool {
        matches!(
            self,
            TabletMutationOp::SetOperation(_)
                | TabletMutationOp::DeleteOperation
                | TabletMutationOp::InsertTablet(_)
        )
    }
}

/// One tablet's worth of requires and actions within a batch.
pub struct ConditionalTabletMutation {
    /// The tablet being mutated
    pub extent: KeyExtent,
    /// Predicates that must all hold
    pub requires: Vec<Require>,
    /// Actions applied when they do
    pub ops: Vec<TabletMutationOp>,
    /// Accepted-anyway predicate, run against a re-read of the row when the
    /// raw status was `Rejected` or `Unknown`; returning `true` resolves the
    /// status to `Accepted`. This is what makes idempotent replays clean.
    pub accepted_when: Option<Box<dyn Fn(&TabletMetadata) -> bool + Send + Sync>>,
    /// Short human description, for logs
    pub description: String,
}

/// Low-level backend the fluent surface drives. Implemented by the real
/// on-disk metadata table and by [`InMemoryAmple`](crate::mem::InMemoryAmple).
#[async_trait]
pub trait AmpleBackend: Send + Sync {
    /// Read one tablet's row.
    async fn read_tablet(&self, extent: &KeyExtent) -> TabletDbResult<Option<TabletMetadata>>;

    /// Read the rows of `level` overlapping the given table/row-range
    /// filter, in metadata-row order.
    async fn scan_tablets(
        &self,
        level: DataLevel,
        table: Option<TableId>,
        start: Option<Bytes>,
        end: Option<Bytes>,
    ) -> TabletDbResult<Vec<TabletMetadata>>;

    /// Check-and-apply each mutation atomically against its row. Returns
    /// the raw per-extent status, in no particular order.
    async fn apply_conditional(
        &self,
        mutations: Vec<ConditionalTabletMutation>,
    ) -> TabletDbResult<Vec<(ConditionalTabletMutation, ConditionalStatus)>>;
}

/// Versioned conditional KV access to a system section of the metadata
/// table (rows outside the per-tablet keyspace, such as the USER FATE
/// transaction rows). Writes are per-key CAS; the version is the row's
/// mutation count.
#[async_trait]
pub trait SystemKv: Send + Sync {
    /// Read a key's value and version.
    async fn get(&self, key: &str) -> TabletDbResult<Option<(Vec<u8>, u64)>>;

    /// Insert a key only if absent. Returns whether the insert won.
    async fn put_new(&self, key: &str, value: &[u8]) -> TabletDbResult<bool>;

    /// Replace a key's value only if its version is unchanged. Returns
    /// whether the swap won.
    async fn cas(&self, key: &str, expected_version: u64, value: &[u8]) -> TabletDbResult<bool>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> TabletDbResult<()>;

    /// All keys, unordered.
    async fn list(&self) -> TabletDbResult<Vec<String>>;
}

/// The typed surface over tablet metadata.
#[derive(Clone)]
pub struct Ample {
    backend: std::sync::Arc<dyn AmpleBackend>,
}

impl Ample {
    /// Wrap a backend.
    pub fn new(backend: std::sync::Arc<dyn AmpleBackend>) -> Self {
        Ample { backend }
    }

    /// Read one tablet's metadata row.
    pub async fn read_tablet(&self, extent: &KeyExtent) -> TabletDbResult<Option<TabletMetadata>> {
        self.backend.read_tablet(extent).await
    }

    /// Start a range scan over the tablets of `level`.
    pub fn read_tablets(&self, level: DataLevel) -> TabletsReader {
        TabletsReader {
            backend: std::sync::Arc::clone(&self.backend),
            level,
            table: None,
            start: None,
            end: None,
        }
    }

    /// Start a batch of conditional tablet mutations.
    pub fn conditionally_mutate_tablets(&self) -> TabletsMutator {
        TabletsMutator {
            backend: std::sync::Arc::clone(&self.backend),
            mutations: Vec::new(),
        }
    }
}

/// Builder for a lazy scan over tablet metadata.
///
/// The returned stream is finite and not restartable; collect what you need
/// in one pass.
pub struct TabletsReader {
    backend: std::sync::Arc<dyn AmpleBackend>,
    level: DataLevel,
    table: Option<TableId>,
    start: Option<Bytes>,
    end: Option<Bytes>,
}

impl TabletsReader {
    /// Restrict to one table.
    pub fn for_table(mut self, table: TableId) -> Self {
        self.table = Some(table);
        self
    }

    /// Restrict to tablets whose range overlaps `(start, end]`.
    pub fn overlapping(
        mut self,
        start: Option<impl Into<Bytes>>,
        end: Option<impl Into<Bytes>>,
    ) -> Self {
        self.start = start.map(Into::into);
        self.end = end.map(Into::into);
        self
    }

    /// Run the scan.
    pub async fn fetch(self) -> TabletDbResult<BoxStream<'static, TabletMetadata>> {
        let rows = self
            .backend
            .scan_tablets(self.level, self.table, self.start, self.end)
            .await?;
        Ok(Box::pin(futures::stream::iter(rows)))
    }

    /// Run the scan and collect it, for callers that want everything
    /// anyway.
    pub async fn fetch_all(self) -> TabletDbResult<Vec<TabletMetadata>> {
        self.backend
            .scan_tablets(self.level, self.table, self.start, self.end)
            .await
    }
}

/// A batch of conditional mutations under construction.
pub struct TabletsMutator {
    backend: std::sync::Arc<dyn AmpleBackend>,
    mutations: Vec<ConditionalTabletMutation>,
}

impl TabletsMutator {
    /// Start the mutation for one tablet.
    pub fn mutate_tablet(&mut self, extent: KeyExtent) -> TabletMutator<'_> {
        TabletMutator {
            parent: self,
            mutation: Some(ConditionalTabletMutation {
                extent,
                requires: Vec::new(),
                ops: Vec::new(),
                accepted_when: None,
                description: String::new(),
            }),
        }
    }

    /// Check-and-apply every submitted mutation, then resolve raw
    /// `Rejected`/`Unknown` statuses through each mutation's
    /// accepted-anyway predicate.
    pub async fn process(self) -> TabletDbResult<HashMap<KeyExtent, ConditionalResult>> {
        let raw = self.backend.apply_conditional(self.mutations).await?;
        let mut results = HashMap::with_capacity(raw.len());
        for (mutation, status) in raw {
            let mut resolved = ConditionalResult {
                extent: mutation.extent.clone(),
                status,
                read_metadata: None,
            };
            if status != ConditionalStatus::Accepted {
                let read = self.backend.read_tablet(&mutation.extent).await?;
                if let (Some(pred), Some(tm)) = (&mutation.accepted_when, &read) {
                    if pred(tm) {
                        debug!(
                            extent = %mutation.extent,
                            description = %mutation.description,
                            "conditional mutation resolved to accepted on re-read"
                        );
                        resolved.status = ConditionalStatus::Accepted;
                    }
                }
                resolved.read_metadata = read;
            }
            results.insert(mutation.extent.clone(), resolved);
        }
        Ok(results)
    }
}

/// Fluent builder for one tablet's requires and actions.
pub struct TabletMutator<'a> {
    parent: &'a mut TabletsMutator,
    mutation: Option<ConditionalTabletMutation>,
}

impl TabletMutator<'_> {
    fn push_require(&mut self, r: Require) -> &mut Self {
        self.mutation.as_mut().expect("submitted").requires.push(r);
        self
    }

    fn push_op(&mut self, op: TabletMutationOp) -> &mut Self {
        self.mutation.as_mut().expect("submitted").ops.push(op);
        self
    }

    /// Require that no multi-step operation holds the tablet.
    pub fn require_absent_operation(&mut self) -> &mut Self {
        self.push_require(Require::AbsentOperation)
    }

    /// Require exactly this operation to hold the tablet.
    pub fn require_operation(&mut self, opid: TabletOperationId) -> &mut Self {
        self.push_require(Require::Operation(opid))
    }

    /// Require no location at all.
    pub fn require_absent_location(&mut self) -> &mut Self {
        self.push_require(Require::AbsentLocation)
    }

    /// Require `current` to be exactly `server`.
    pub fn require_current(&mut self, server: TServerInstance) -> &mut Self {
        self.push_require(Require::CurrentLocation(server))
    }

    /// Require `future` to be exactly `server`.
    pub fn require_future(&mut self, server: TServerInstance) -> &mut Self {
        self.push_require(Require::FutureLocation(server))
    }

    /// Require the availability column to match.
    pub fn require_availability(&mut self, availability: TabletAvailability) -> &mut Self {
        self.push_require(Require::Availability(availability))
    }

    /// Require the row to exist.
    pub fn require_tablet_exists(&mut self) -> &mut Self {
        self.push_require(Require::TabletExists)
    }

    /// Require the row to be absent.
    pub fn require_absent_tablet(&mut self) -> &mut Self {
        self.push_require(Require::AbsentTablet)
    }

    /// Require no suspension record.
    pub fn require_absent_suspend(&mut self) -> &mut Self {
        self.push_require(Require::AbsentSuspend)
    }

    /// Require the file set to equal the snapshot read earlier.
    pub fn require_same_files(
        &mut self,
        files: std::collections::BTreeSet<StoredTabletFile>,
    ) -> &mut Self {
        self.push_require(Require::SameFiles(files))
    }

    /// Require `file` to be unreferenced.
    pub fn require_absent_file(&mut self, file: StoredTabletFile) -> &mut Self {
        self.push_require(Require::AbsentFile(file))
    }

    /// Require `log` to be unreferenced.
    pub fn require_absent_log(&mut self, log: WalRef) -> &mut Self {
        self.push_require(Require::AbsentLog(log))
    }

    /// Require no loaded marker for `file`.
    pub fn require_absent_loaded(&mut self, file: StoredTabletFile) -> &mut Self {
        self.push_require(Require::AbsentLoaded(file))
    }

    /// Require the hosting-request flag to have this value.
    pub fn require_hosting_requested(&mut self, value: bool) -> &mut Self {
        self.push_require(Require::HostingRequested(value))
    }

    /// Insert a whole new row.
    pub fn insert_tablet(&mut self, tm: TabletMetadata) -> &mut Self {
        self.push_op(TabletMutationOp::InsertTablet(tm))
    }

    /// Delete the whole row.
    pub fn delete_tablet(&mut self) -> &mut Self {
        self.push_op(TabletMutationOp::DeleteTablet)
    }

    /// Add a file reference.
    pub fn put_file(&mut self, file: StoredTabletFile) -> &mut Self {
        self.push_op(TabletMutationOp::PutFile(file))
    }

    /// Remove a file reference.
    pub fn delete_file(&mut self, file: StoredTabletFile) -> &mut Self {
        self.push_op(TabletMutationOp::DeleteFile(file))
    }

    /// Record a bulk-load marker.
    pub fn put_loaded(&mut self, file: StoredTabletFile, fate_id: FateId) -> &mut Self {
        self.push_op(TabletMutationOp::PutLoaded(file, fate_id))
    }

    /// Remove a bulk-load marker.
    pub fn delete_loaded(&mut self, file: StoredTabletFile) -> &mut Self {
        self.push_op(TabletMutationOp::DeleteLoaded(file))
    }

    /// Set the `future` location.
    pub fn set_future(&mut self, server: TServerInstance) -> &mut Self {
        self.push_op(TabletMutationOp::SetFuture(server))
    }

    /// Clear the `future` location.
    pub fn delete_future(&mut self) -> &mut Self {
        self.push_op(TabletMutationOp::DeleteFuture)
    }

    /// Set the `current` location.
    pub fn set_current(&mut self, server: TServerInstance) -> &mut Self {
        self.push_op(TabletMutationOp::SetCurrent(server))
    }

    /// Clear the `current` location.
    pub fn delete_current(&mut self) -> &mut Self {
        self.push_op(TabletMutationOp::DeleteCurrent)
    }

    /// Set the sticky `last` location.
    pub fn set_last(&mut self, server: TServerInstance) -> &mut Self {
        self.push_op(TabletMutationOp::SetLast(server))
    }

    /// Record a suspension.
    pub fn set_suspend(&mut self, s: SuspendingTServer) -> &mut Self {
        self.push_op(TabletMutationOp::SetSuspend(s))
    }

    /// Clear the suspension record.
    pub fn delete_suspend(&mut self) -> &mut Self {
        self.push_op(TabletMutationOp::DeleteSuspend)
    }

    /// Add a write-ahead-log reference.
    pub fn put_log(&mut self, log: WalRef) -> &mut Self {
        self.push_op(TabletMutationOp::PutLog(log))
    }

    /// Remove a write-ahead-log reference.
    pub fn delete_log(&mut self, log: WalRef) -> &mut Self {
        self.push_op(TabletMutationOp::DeleteLog(log))
    }

    /// Mark the tablet held by an operation.
    pub fn set_operation(&mut self, opid: TabletOperationId) -> &mut Self {
        self.push_op(TabletMutationOp::SetOperation(opid))
    }

    /// Release the operation hold.
    pub fn delete_operation(&mut self) -> &mut Self {
        self.push_op(TabletMutationOp::DeleteOperation)
    }

    /// Change the hosting policy.
    pub fn set_availability(&mut self, availability: TabletAvailability) -> &mut Self {
        self.push_op(TabletMutationOp::SetAvailability(availability))
    }

    /// Set or clear the hosting request flag.
    pub fn set_hosting_requested(&mut self, value: bool) -> &mut Self {
        self.push_op(TabletMutationOp::SetHostingRequested(value))
    }

    /// Record a completed flush.
    pub fn set_flush_id(&mut self, id: u64) -> &mut Self {
        self.push_op(TabletMutationOp::SetFlushId(id))
    }

    /// Update the time column.
    pub fn set_time(&mut self, time: MetadataTime) -> &mut Self {
        self.push_op(TabletMutationOp::SetTime(time))
    }

    /// Pin a migration target.
    pub fn set_migration(&mut self, server: TServerInstance) -> &mut Self {
        self.push_op(TabletMutationOp::SetMigration(server))
    }

    /// Clear the migration pin.
    pub fn delete_migration(&mut self) -> &mut Self {
        self.push_op(TabletMutationOp::DeleteMigration)
    }

    /// Finish this tablet's mutation and add it to the batch.
    ///
    /// `accepted_when` is the accepted-anyway predicate (see
    /// [`ConditionalTabletMutation::accepted_when`]); `description` labels
    /// the mutation in logs.
    ///
    /// Every mutation must either require an absent operation, require a
    /// specific operation, or itself set/clear the operation column;
    /// anything else would let unrelated writers race a multi-step
    /// operation's hold on the tablet.
    pub fn submit<P>(&mut self, accepted_when: P, description: impl Into<String>) -> TabletDbResult<()>
    where
        P: Fn(&TabletMetadata) -> bool + Send + Sync + 'static,
    {
        let mut mutation = self
            .mutation
            .take()
            .ok_or_else(|| TabletDbError::InvalidArgument("mutation already submitted".into()))?;
        let guards_operation = mutation.requires.iter().any(|r| {
            matches!(r, Require::AbsentOperation | Require::Operation(_) | Require::AbsentTablet)
        }) || mutation.ops.iter().any(TabletMutationOp::touches_operation);
        if !guards_operation {
            return Err(TabletDbError::InvalidArgument(format!(
                "conditional mutation of {} must require absent operation",
                mutation.extent
            )));
        }
        mutation.accepted_when = Some(Box::new(accepted_when));
        mutation.description = description.into();
        self.parent.mutations.push(mutation);
        Ok(())
    }
}
