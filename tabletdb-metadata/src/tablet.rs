//! The tablet metadata row and the state computed from it.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tabletdb_common::{
    KeyExtent, TServerInstance, TabletAvailability, TabletOperationId, FateId,
};
use tabletdb_errors::TabletDbError;
use uuid::Uuid;

/// A data-file reference held by a tablet: the file's path plus the fenced
/// row range `(start, end]` the tablet may read from it. An unfenced file
/// is `(-∞, +∞]`.
///
/// Fencing is what lets two tablets share one physical file after a split:
/// each child holds the same path with its own fence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoredTabletFile {
    /// Path of the file in the DFS
    pub path: String,
    /// Exclusive lower bound of the fence, `None` = −∞
    pub fenced_start: Option<Bytes>,
    /// Inclusive upper bound of the fence, `None` = +∞
    pub fenced_end: Option<Bytes>,
}

impl StoredTabletFile {
    /// An unfenced reference to `path`.
    pub fn unfenced(path: impl Into<String>) -> Self {
        StoredTabletFile {
            path: path.into(),
            fenced_start: None,
            fenced_end: None,
        }
    }

    /// A reference to `path` fenced to `(start, end]`.
    pub fn fenced(
        path: impl Into<String>,
        start: Option<impl Into<Bytes>>,
        end: Option<impl Into<Bytes>>,
    ) -> Self {
        StoredTabletFile {
            path: path.into(),
            fenced_start: start.map(Into::into),
            fenced_end: end.map(Into::into),
        }
    }
}

impl fmt::Display for StoredTabletFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.fenced_start, &self.fenced_end) {
            (None, None) => write!(f, "{}", self.path),
            (s, e) => write!(
                f,
                "{} ({},{}]",
                self.path,
                s.as_ref().map_or("-inf".into(), |b| String::from_utf8_lossy(b).into_owned()),
                e.as_ref().map_or("+inf".into(), |b| String::from_utf8_lossy(b).into_owned()),
            ),
        }
    }
}

/// A write-ahead-log reference still needed to recover this tablet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WalRef {
    /// The server that wrote the log
    pub server: String,
    /// The log's unique id
    pub log_uuid: Uuid,
    /// Path of the log in the DFS
    pub path: String,
}

/// A tablet's time type and counter: a `LOGICAL` counter or `MILLIS` wall
/// clock. Serialized as `L<n>` / `M<ms>` in the `srv:time` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataTime {
    /// Logical time: a counter bumped per batch.
    Logical(u64),
    /// Wall-clock time in milliseconds.
    Millis(u64),
}

impl MetadataTime {
    /// The numeric component.
    pub fn value(self) -> u64 {
        match self {
            MetadataTime::Logical(n) | MetadataTime::Millis(n) => n,
        }
    }
}

impl fmt::Display for MetadataTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataTime::Logical(n) => write!(f, "L{n}"),
            MetadataTime::Millis(ms) => write!(f, "M{ms}"),
        }
    }
}

impl FromStr for MetadataTime {
    type Err = TabletDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |digits: &str| {
            digits
                .parse()
                .map_err(|_| TabletDbError::InvalidArgument(format!("bad metadata time: {s}")))
        };
        match s.split_at_checked(1) {
            Some(("L", rest)) => Ok(MetadataTime::Logical(parse(rest)?)),
            Some(("M", rest)) => Ok(MetadataTime::Millis(parse(rest)?)),
            _ => Err(TabletDbError::InvalidArgument(format!(
                "bad metadata time: {s}"
            ))),
        }
    }
}

/// Whether a tablet may be merged away automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TabletMergeability {
    /// Never merge this tablet automatically.
    #[default]
    Never,
    /// The system may merge this tablet whenever it wants.
    Always,
}

/// The `suspend` column: the server a tablet last ran on and when it was
/// suspended, used to prefer re-hosting on the same server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendingTServer {
    /// Server the tablet was hosted on
    pub server: TServerInstance,
    /// When the suspension was recorded
    pub suspension_time: SystemTime,
}

/// One tablet's metadata row, decoded.
///
/// `current` and `future` are mutually exclusive; a row carrying both is a
/// hard anomaly that readers must surface ([`Self::location_anomaly`]) and
/// never act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletMetadata {
    extent: KeyExtent,
    pub(crate) files: BTreeSet<StoredTabletFile>,
    pub(crate) loaded: BTreeMap<StoredTabletFile, FateId>,
    pub(crate) last: Option<TServerInstance>,
    pub(crate) current: Option<TServerInstance>,
    pub(crate) future: Option<TServerInstance>,
    pub(crate) suspend: Option<SuspendingTServer>,
    pub(crate) logs: BTreeSet<WalRef>,
    pub(crate) operation_id: Option<TabletOperationId>,
    pub(crate) availability: TabletAvailability,
    pub(crate) hosting_requested: bool,
    pub(crate) flush_id: Option<u64>,
    pub(crate) time: MetadataTime,
    pub(crate) mergeability: TabletMergeability,
    pub(crate) migration: Option<TServerInstance>,
}

impl TabletMetadata {
    /// Start building a fresh row for `extent`.
    pub fn builder(extent: KeyExtent) -> TabletMetadataBuilder {
        TabletMetadataBuilder {
            tm: TabletMetadata {
                extent,
                files: BTreeSet::new(),
                loaded: BTreeMap::new(),
                last: None,
                current: None,
                future: None,
                suspend: None,
                logs: BTreeSet::new(),
                operation_id: None,
                availability: TabletAvailability::default(),
                hosting_requested: false,
                flush_id: None,
                time: MetadataTime::Millis(0),
                mergeability: TabletMergeability::default(),
                migration: None,
            },
        }
    }

    /// The extent this row describes.
    pub fn extent(&self) -> &KeyExtent {
        &self.extent
    }

    /// Data files referenced by this tablet.
    pub fn files(&self) -> &BTreeSet<StoredTabletFile> {
        &self.files
    }

    /// Bulk-loaded files and the FATE transaction that placed each.
    pub fn loaded(&self) -> &BTreeMap<StoredTabletFile, FateId> {
        &self.loaded
    }

    /// The last server this tablet was hosted on (sticky).
    pub fn last(&self) -> Option<&TServerInstance> {
        self.last.as_ref()
    }

    /// The server currently hosting this tablet.
    pub fn current(&self) -> Option<&TServerInstance> {
        self.current.as_ref()
    }

    /// The server this tablet has been assigned to but which has not yet
    /// accepted it.
    pub fn future(&self) -> Option<&TServerInstance> {
        self.future.as_ref()
    }

    /// The suspension record, if suspended.
    pub fn suspend(&self) -> Option<&SuspendingTServer> {
        self.suspend.as_ref()
    }

    /// Write-ahead logs still needed to recover this tablet.
    pub fn logs(&self) -> &BTreeSet<WalRef> {
        &self.logs
    }

    /// The active multi-step operation holding this tablet, if any. A
    /// tablet carrying one is never assigned.
    pub fn operation_id(&self) -> Option<&TabletOperationId> {
        self.operation_id.as_ref()
    }

    /// The tablet's hosting policy.
    pub fn availability(&self) -> TabletAvailability {
        self.availability
    }

    /// Whether something has asked for this ONDEMAND tablet to be hosted.
    pub fn hosting_requested(&self) -> bool {
        self.hosting_requested
    }

    /// The last completed flush id.
    pub fn flush_id(&self) -> Option<u64> {
        self.flush_id
    }

    /// The tablet's time type and counter.
    pub fn time(&self) -> MetadataTime {
        self.time
    }

    /// Whether this tablet may be auto-merged.
    pub fn mergeability(&self) -> TabletMergeability {
        self.mergeability
    }

    /// The pinned migration target, if the balancer chose one.
    pub fn migration(&self) -> Option<&TServerInstance> {
        self.migration.as_ref()
    }

    /// Whether this row carries both `current` and `future`, which should
    /// be impossible. Callers seeing `true` must diagnose and skip, never
    /// act.
    pub fn location_anomaly(&self) -> bool {
        self.current.is_some() && self.future.is_some()
    }
}

/// Builder for a fresh metadata row, used when creating tablets.
pub struct TabletMetadataBuilder {
    tm: TabletMetadata,
}

impl TabletMetadataBuilder {
    /// Set the hosting policy.
    pub fn availability(mut self, availability: TabletAvailability) -> Self {
        self.tm.availability = availability;
        self
    }

    /// Set the time type and counter.
    pub fn time(mut self, time: MetadataTime) -> Self {
        self.tm.time = time;
        self
    }

    /// Add a data file.
    pub fn file(mut self, file: StoredTabletFile) -> Self {
        self.tm.files.insert(file);
        self
    }

    /// Set the operation holding the tablet from birth (e.g. a split in
    /// progress).
    pub fn operation_id(mut self, opid: TabletOperationId) -> Self {
        self.tm.operation_id = Some(opid);
        self
    }

    /// Finish the row.
    pub fn build(self) -> TabletMetadata {
        self.tm
    }
}

/// A tablet's lifecycle state, computed from its metadata row plus the live
/// tablet-server set. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TabletState {
    /// No location and no suspension.
    Unassigned,
    /// A `future` location is set and that server is alive.
    Assigned,
    /// A `current` location is set and that server is alive.
    Hosted,
    /// A location is set but the server is not in the live set.
    AssignedToDeadServer,
    /// No location; a suspension record is present.
    Suspended,
}

impl TabletState {
    /// Compute the state of `tm` given the currently known live servers.
    pub fn compute(tm: &TabletMetadata, live: &HashSet<TServerInstance>) -> TabletState {
        if let Some(current) = tm.current() {
            if live.contains(current) {
                TabletState::Hosted
            } else {
                TabletState::AssignedToDeadServer
            }
        } else if let Some(future) = tm.future() {
            if live.contains(future) {
                TabletState::Assigned
            } else {
                TabletState::AssignedToDeadServer
            }
        } else if tm.suspend().is_some() {
            TabletState::Suspended
        } else {
            TabletState::Unassigned
        }
    }
}

#[cfg(test)]
mod tests {
    use tabletdb_common::TableId;

    use super::*;

    fn extent() -> KeyExtent {
        KeyExtent::new(TableId::new("t"), Some("m"), None::<&str>)
    }

    fn ts(name: &str) -> TServerInstance {
        TServerInstance::new(name, 7)
    }

    #[test]
    fn metadata_time_round_trip() {
        for t in [MetadataTime::Logical(42), MetadataTime::Millis(1_700_000)] {
            assert_eq!(t.to_string().parse::<MetadataTime>().unwrap(), t);
        }
        assert!("X9".parse::<MetadataTime>().is_err());
        assert!("L".parse::<MetadataTime>().is_err());
        assert!("Lfoo".parse::<MetadataTime>().is_err());
    }

    #[test]
    fn state_computation() {
        let live: HashSet<_> = [ts("a:1")].into_iter().collect();

        let mut tm = TabletMetadata::builder(extent()).build();
        assert_eq!(TabletState::compute(&tm, &live), TabletState::Unassigned);

        tm.future = Some(ts("a:1"));
        assert_eq!(TabletState::compute(&tm, &live), TabletState::Assigned);

        tm.future = Some(ts("dead:1"));
        assert_eq!(
            TabletState::compute(&tm, &live),
            TabletState::AssignedToDeadServer
        );

        tm.future = None;
        tm.current = Some(ts("a:1"));
        assert_eq!(TabletState::compute(&tm, &live), TabletState::Hosted);

        tm.current = Some(ts("dead:1"));
        assert_eq!(
            TabletState::compute(&tm, &live),
            TabletState::AssignedToDeadServer
        );

        tm.current = None;
        tm.suspend = Some(SuspendingTServer {
            server: ts("a:1"),
            suspension_time: SystemTime::now(),
        });
        assert_eq!(TabletState::compute(&tm, &live), TabletState::Suspended);
    }

    #[test]
    fn location_anomaly_detection() {
        let mut tm = TabletMetadata::builder(extent()).build();
        tm.current = Some(ts("a:1"));
        tm.future = Some(ts("b:1"));
        assert!(tm.location_anomaly());
    }
}
