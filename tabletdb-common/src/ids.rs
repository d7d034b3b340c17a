//! Identifiers for tables, servers, and FATE transactions.
//!
//! Cyclic relationships in the system (tablet ↔ server ↔ lock) are always
//! expressed through these stable ids rather than direct references; lookups
//! go through whichever registry owns the id's referent.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tabletdb_errors::TabletDbError;
use uuid::Uuid;

/// Identifier of a table. Assigned once at table creation and never reused.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId(String);

impl TableId {
    /// The root metadata table, which locates the tablets of [`METADATA`].
    ///
    /// [`METADATA`]: TableId::METADATA
    pub const ROOT: &'static str = "+r";
    /// The metadata table, which locates the tablets of every user table.
    pub const METADATA: &'static str = "!0";

    /// Construct a table id from its canonical string form.
    pub fn new(id: impl Into<String>) -> Self {
        TableId(id.into())
    }

    /// The root table's id.
    pub fn root() -> Self {
        TableId(Self::ROOT.to_string())
    }

    /// The metadata table's id.
    pub fn metadata() -> Self {
        TableId(Self::METADATA.to_string())
    }

    /// The canonical string form of this id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Which data level this table belongs to.
    pub fn level(&self) -> DataLevel {
        match self.0.as_str() {
            Self::ROOT => DataLevel::Root,
            Self::METADATA => DataLevel::Metadata,
            _ => DataLevel::User,
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TableId {
    fn from(s: &str) -> Self {
        TableId(s.to_string())
    }
}

/// The tier a table's metadata lives in. Each level's tablets are located by
/// the level above it; a level is only serviced once the level above is
/// stable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum DataLevel {
    /// The single root tablet, located via the coordination service.
    Root,
    /// The metadata table, located via the root tablet.
    Metadata,
    /// All user tables, located via the metadata table.
    User,
}

impl DataLevel {
    /// All levels, ordered from the top of the hierarchy down.
    pub const ALL: [DataLevel; 3] = [DataLevel::Root, DataLevel::Metadata, DataLevel::User];

    /// The table holding the metadata rows for tablets of this level, or
    /// `None` for the root level, whose single tablet is tracked in the
    /// coordination service.
    pub fn metadata_table(self) -> Option<TableId> {
        match self {
            DataLevel::Root => None,
            DataLevel::Metadata => Some(TableId::root()),
            DataLevel::User => Some(TableId::metadata()),
        }
    }
}

/// A specific live incarnation of a tablet server: its advertised address
/// plus the session of its service lock. A restarted server reuses the
/// address but never the session, so stale references never match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TServerInstance {
    /// host:port the server serves RPCs on
    pub location: String,
    /// Session id of the server's service lock
    pub session: u64,
}

impl TServerInstance {
    /// Construct an instance from its location and lock session.
    pub fn new(location: impl Into<String>, session: u64) -> Self {
        TServerInstance {
            location: location.into(),
            session,
        }
    }
}

impl fmt::Display for TServerInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{:x}]", self.location, self.session)
    }
}

/// Which store a FATE transaction lives in.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum FateInstanceType {
    /// Transactions over user tables, stored in the metadata table.
    User,
    /// Transactions affecting metadata itself, stored in the coordination
    /// service.
    Meta,
}

/// Identifier of a FATE transaction.
///
/// The canonical string form is `FATE:<type>:<uuid>`, which is what appears
/// in metadata columns, log lines, and the admin CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FateId {
    /// Store the transaction lives in
    pub instance_type: FateInstanceType,
    /// Unique id of the transaction within that store
    pub uuid: Uuid,
}

impl FateId {
    /// Allocate a fresh transaction id in the given store.
    pub fn new_random(instance_type: FateInstanceType) -> Self {
        FateId {
            instance_type,
            uuid: Uuid::new_v4(),
        }
    }

    /// Build an id from parts, for deserialization paths.
    pub fn from_parts(instance_type: FateInstanceType, uuid: Uuid) -> Self {
        FateId {
            instance_type,
            uuid,
        }
    }
}

impl fmt::Display for FateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FATE:{}:{}", self.instance_type, self.uuid)
    }
}

impl FromStr for FateId {
    type Err = TabletDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (tag, ty, uuid) = (parts.next(), parts.next(), parts.next());
        match (tag, ty, uuid) {
            (Some("FATE"), Some(ty), Some(uuid)) => {
                let instance_type = ty
                    .parse()
                    .map_err(|_| TabletDbError::InvalidArgument(format!("bad fate type: {ty}")))?;
                let uuid = Uuid::parse_str(uuid)
                    .map_err(|_| TabletDbError::InvalidArgument(format!("bad fate uuid: {uuid}")))?;
                Ok(FateId {
                    instance_type,
                    uuid,
                })
            }
            _ => Err(TabletDbError::InvalidArgument(format!(
                "fate id must look like FATE:<type>:<uuid>, got: {s}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fate_id_round_trip() {
        let id = FateId::new_random(FateInstanceType::User);
        let parsed: FateId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!(id.to_string().starts_with("FATE:USER:"));
    }

    #[test]
    fn fate_id_rejects_garbage() {
        assert!("FATE:USER:not-a-uuid".parse::<FateId>().is_err());
        assert!("TX:USER:ba4ac8e2-9f91-4a14-b2cc-4d67b147b4a5"
            .parse::<FateId>()
            .is_err());
        assert!("FATE:ADMIN:ba4ac8e2-9f91-4a14-b2cc-4d67b147b4a5"
            .parse::<FateId>()
            .is_err());
    }

    #[test]
    fn table_levels() {
        assert_eq!(TableId::root().level(), DataLevel::Root);
        assert_eq!(TableId::metadata().level(), DataLevel::Metadata);
        assert_eq!(TableId::new("42").level(), DataLevel::User);
        assert_eq!(DataLevel::User.metadata_table(), Some(TableId::metadata()));
        assert_eq!(DataLevel::Root.metadata_table(), None);
    }
}
