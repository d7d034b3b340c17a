//! WAL record types and framing.
//!
//! Records are length-prefixed bincode frames: a `u32` big-endian length
//! followed by the serialized [`LogEntry`]. The prefix makes every record
//! position-recoverable; a torn final frame (crash mid-append) is detected
//! by the reader and treated as end of log.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use tabletdb_common::{Durability, KeyExtent, Mutation};
use tabletdb_errors::{TabletDbError, TabletDbResult};

/// One framed record in a write-ahead log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    /// Declares that mutations for `extent` may follow in this log.
    /// Written once per tablet per log, before that tablet's first
    /// mutation record.
    DefineTablet {
        /// The tablet being defined
        extent: KeyExtent,
    },
    /// One commit's worth of mutations for a tablet.
    Mutations {
        /// The tablet the mutations belong to
        extent: KeyExtent,
        /// The commit sequence within the tablet
        seq: u64,
        /// The mutations, in commit order
        mutations: Vec<Mutation>,
        /// The durability the batch was written under
        durability: Durability,
    },
    /// A minor compaction of `extent` began at `seq`, targeting `file`.
    MinorCompactionStarted {
        /// The tablet being compacted
        extent: KeyExtent,
        /// The commit sequence at the start of the compaction
        seq: u64,
        /// The file the in-memory data is being written to
        file: String,
    },
    /// The minor compaction that began at `seq` finished; mutations at or
    /// below it are durable in files and need not be replayed.
    MinorCompactionFinished {
        /// The tablet that was compacted
        extent: KeyExtent,
        /// The commit sequence the compaction covered
        seq: u64,
    },
}

impl LogEntry {
    /// Serialize into a length-prefixed frame.
    pub fn to_frame(&self) -> TabletDbResult<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let mut frame = vec![0u8; 4 + payload.len()];
        BigEndian::write_u32(&mut frame[..4], payload.len() as u32);
        frame[4..].copy_from_slice(&payload);
        Ok(frame)
    }

    /// Decode the frame starting at `buf`, returning the entry and how many
    /// bytes it consumed. `Ok(None)` means the remaining bytes are a torn
    /// final frame.
    pub fn from_frame(buf: &[u8]) -> TabletDbResult<Option<(LogEntry, usize)>> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = BigEndian::read_u32(&buf[..4]) as usize;
        if buf.len() < 4 + len {
            return Ok(None);
        }
        let entry = bincode::deserialize(&buf[4..4 + len])
            .map_err(|e| TabletDbError::Serialization(format!("corrupt wal frame: {e}")))?;
        Ok(Some((entry, 4 + len)))
    }

    /// Decode every complete frame in `buf`, ignoring a torn tail.
    pub fn read_all(mut buf: &[u8]) -> TabletDbResult<Vec<LogEntry>> {
        let mut entries = Vec::new();
        while let Some((entry, consumed)) = Self::from_frame(buf)? {
            entries.push(entry);
            buf = &buf[consumed..];
        }
        Ok(entries)
    }
}

/// One tablet's contribution to a logged batch.
#[derive(Debug)]
pub struct TabletLogWrite<'a> {
    /// The tablet the mutations belong to
    pub extent: &'a KeyExtent,
    /// The commit sequence assigned by the tablet's commit session
    pub seq: u64,
    /// The mutations to log
    pub mutations: &'a [Mutation],
    /// Requested durability for this write
    pub durability: Durability,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tabletdb_common::TableId;

    use super::*;

    fn extent() -> KeyExtent {
        KeyExtent::new(TableId::new("t"), Some("m"), None::<&str>)
    }

    #[test]
    fn frames_round_trip() {
        let entries = vec![
            LogEntry::DefineTablet { extent: extent() },
            LogEntry::Mutations {
                extent: extent(),
                seq: 7,
                mutations: vec![Mutation::new("row").put("f", "q", "v")],
                durability: Durability::Sync,
            },
            LogEntry::MinorCompactionStarted {
                extent: extent(),
                seq: 7,
                file: "/t/f1.rf".to_string(),
            },
            LogEntry::MinorCompactionFinished {
                extent: extent(),
                seq: 7,
            },
        ];
        let mut buf = Vec::new();
        for e in &entries {
            buf.extend_from_slice(&e.to_frame().unwrap());
        }
        assert_eq!(LogEntry::read_all(&buf).unwrap(), entries);
    }

    #[test]
    fn torn_tail_is_end_of_log() {
        let entry = LogEntry::DefineTablet { extent: extent() };
        let mut buf = entry.to_frame().unwrap();
        let full = buf.clone();
        buf.extend_from_slice(&full[..full.len() - 3]);
        let read = LogEntry::read_all(&buf).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0], entry);
    }
}
