//! Tablet extents: the contiguous key range a tablet covers.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::ids::{DataLevel, TableId};

/// Identifies one tablet: a table plus the half-open row range
/// `(prev_end_row, end_row]` the tablet covers.
///
/// `None` stands for the infinite bound at either end: a tablet with
/// `end_row = None` is the last tablet of its table, and one with
/// `prev_end_row = None` is the first. The live tablets of a table always
/// partition its keyspace; no two of them overlap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyExtent {
    table: TableId,
    end_row: Option<Bytes>,
    prev_end_row: Option<Bytes>,
}

impl KeyExtent {
    /// Construct an extent. `end_row`/`prev_end_row` of `None` mean +∞/−∞.
    pub fn new(
        table: TableId,
        end_row: Option<impl Into<Bytes>>,
        prev_end_row: Option<impl Into<Bytes>>,
    ) -> Self {
        KeyExtent {
            table,
            end_row: end_row.map(Into::into),
            prev_end_row: prev_end_row.map(Into::into),
        }
    }

    /// The extent covering an entire table.
    pub fn whole_table(table: TableId) -> Self {
        KeyExtent {
            table,
            end_row: None,
            prev_end_row: None,
        }
    }

    /// The single root tablet's extent.
    pub fn root() -> Self {
        Self::whole_table(TableId::root())
    }

    /// The table this tablet belongs to.
    pub fn table(&self) -> &TableId {
        &self.table
    }

    /// Inclusive upper bound of the range, `None` = +∞.
    pub fn end_row(&self) -> Option<&Bytes> {
        self.end_row.as_ref()
    }

    /// Exclusive lower bound of the range, `None` = −∞.
    pub fn prev_end_row(&self) -> Option<&Bytes> {
        self.prev_end_row.as_ref()
    }

    /// The data level of this tablet's table.
    pub fn level(&self) -> DataLevel {
        self.table.level()
    }

    /// Whether `row` falls in `(prev_end_row, end_row]`.
    pub fn contains_row(&self, row: &[u8]) -> bool {
        let above_prev = match &self.prev_end_row {
            Some(prev) => row > prev.as_ref(),
            None => true,
        };
        let at_or_below_end = match &self.end_row {
            Some(end) => row <= end.as_ref(),
            None => true,
        };
        above_prev && at_or_below_end
    }

    /// Whether the half-open ranges of two extents intersect. Only
    /// meaningful within one table.
    pub fn overlaps(&self, other: &KeyExtent) -> bool {
        if self.table != other.table {
            return false;
        }
        let self_below_other = match (&self.end_row, &other.prev_end_row) {
            (Some(end), Some(prev)) => end <= prev,
            // self ends at +inf or other starts at -inf: not disjoint this way
            _ => false,
        };
        let other_below_self = match (&other.end_row, &self.prev_end_row) {
            (Some(end), Some(prev)) => end <= prev,
            _ => false,
        };
        !(self_below_other || other_below_self)
    }

    /// Whether `range` (as `(start, end]`, `None` = ±∞) covers this entire
    /// extent.
    pub fn covered_by(&self, start: Option<&Bytes>, end: Option<&Bytes>) -> bool {
        let start_ok = match (start, &self.prev_end_row) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(s), Some(prev)) => s <= prev,
        };
        let end_ok = match (end, &self.end_row) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(e), Some(er)) => e >= er,
        };
        start_ok && end_ok
    }

    /// The metadata-table row this tablet's metadata lives in:
    /// `<table-id>;<end-row>`, or `<table-id><` for the last tablet.
    ///
    /// `<` sorts after `;` so the last tablet's row follows every bounded
    /// tablet of the same table; together rows of one table stay contiguous
    /// and ordered by end row.
    pub fn metadata_row(&self) -> Bytes {
        let mut row = Vec::with_capacity(
            self.table.as_str().len() + 1 + self.end_row.as_ref().map_or(0, |e| e.len()),
        );
        row.extend_from_slice(self.table.as_str().as_bytes());
        match &self.end_row {
            Some(end) => {
                row.push(b';');
                row.extend_from_slice(end);
            }
            None => row.push(b'<'),
        }
        Bytes::from(row)
    }

    /// Ordering used when walking a table's tablets in metadata-row order.
    pub fn cmp_by_row(&self, other: &KeyExtent) -> Ordering {
        self.metadata_row().cmp(&other.metadata_row())
    }
}

impl fmt::Display for KeyExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_bound = |b: &Option<Bytes>| match b {
            Some(b) => String::from_utf8_lossy(b).into_owned(),
            None => "∞".to_string(),
        };
        write!(
            f,
            "{};({},{}]",
            self.table,
            fmt_bound(&self.prev_end_row),
            fmt_bound(&self.end_row)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(end: Option<&'static str>, prev: Option<&'static str>) -> KeyExtent {
        KeyExtent::new(TableId::new("t1"), end, prev)
    }

    #[test]
    fn row_membership() {
        let e = extent(Some("m"), Some("f"));
        assert!(!e.contains_row(b"f"));
        assert!(e.contains_row(b"g"));
        assert!(e.contains_row(b"m"));
        assert!(!e.contains_row(b"n"));

        let first = extent(Some("f"), None);
        assert!(first.contains_row(b"a"));
        assert!(first.contains_row(b"f"));
        assert!(!first.contains_row(b"g"));

        let last = extent(None, Some("m"));
        assert!(!last.contains_row(b"m"));
        assert!(last.contains_row(b"zzz"));
    }

    #[test]
    fn split_children_partition_parent() {
        // a split of (f, m] at "j" yields (f, j] and (j, m]
        let left = extent(Some("j"), Some("f"));
        let right = extent(Some("m"), Some("j"));
        assert!(!left.overlaps(&right));
        for row in [&b"g"[..], b"j", b"k", b"m"] {
            let in_left = left.contains_row(row);
            let in_right = right.contains_row(row);
            assert!(in_left ^ in_right, "row {row:?} must be in exactly one child");
        }
    }

    #[test]
    fn overlap_detection() {
        let a = extent(Some("m"), None);
        let b = extent(None, Some("f"));
        assert!(a.overlaps(&b));
        let c = extent(None, Some("m"));
        assert!(!a.overlaps(&c));
        assert!(!c.overlaps(&a));

        let other_table = KeyExtent::new(TableId::new("t2"), Some("m"), None::<&str>);
        assert!(!a.overlaps(&other_table));
    }

    #[test]
    fn metadata_row_encoding() {
        assert_eq!(
            extent(Some("row1"), None).metadata_row(),
            Bytes::from("t1;row1")
        );
        assert_eq!(extent(None, Some("x")).metadata_row(), Bytes::from("t1<"));
        // last tablet's row sorts after every bounded tablet's row
        assert!(extent(None, None).metadata_row() > extent(Some("zzz"), None).metadata_row());
    }

    #[test]
    fn covered_by_ranges() {
        let e = extent(Some("m"), Some("f"));
        assert!(e.covered_by(None, None));
        assert!(e.covered_by(Some(&Bytes::from("f")), Some(&Bytes::from("m"))));
        assert!(e.covered_by(Some(&Bytes::from("a")), Some(&Bytes::from("z"))));
        assert!(!e.covered_by(Some(&Bytes::from("g")), Some(&Bytes::from("z"))));
        assert!(!e.covered_by(Some(&Bytes::from("a")), Some(&Bytes::from("l"))));
    }
}
