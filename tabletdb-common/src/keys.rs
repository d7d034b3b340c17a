//! Keys, values, and visibility authorizations.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A fully-qualified key in a table's sorted keyspace.
///
/// Keys sort by `(row, family, qualifier, visibility, timestamp
/// descending)`: within one cell the newest version sorts first, which is
/// what scans and condition evaluation want.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Key {
    /// Row portion; rows are the unit of tablet partitioning and of atomic
    /// mutation.
    pub row: Bytes,
    /// Column family
    pub family: Bytes,
    /// Column qualifier
    pub qualifier: Bytes,
    /// Column visibility expression (empty = visible to all)
    pub visibility: Bytes,
    /// Version timestamp, either wall-clock millis or a logical counter
    /// depending on the table's time type
    pub timestamp: i64,
}

impl Key {
    /// Construct a key with empty visibility.
    pub fn new(
        row: impl Into<Bytes>,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        timestamp: i64,
    ) -> Self {
        Key {
            row: row.into(),
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: Bytes::new(),
            timestamp,
        }
    }

    /// Set the visibility expression.
    pub fn with_visibility(mut self, visibility: impl Into<Bytes>) -> Self {
        self.visibility = visibility.into();
        self
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| self.family.cmp(&other.family))
            .then_with(|| self.qualifier.cmp(&other.qualifier))
            .then_with(|| self.visibility.cmp(&other.visibility))
            // newest version first
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} [{}] {}",
            String::from_utf8_lossy(&self.row),
            String::from_utf8_lossy(&self.family),
            String::from_utf8_lossy(&self.qualifier),
            String::from_utf8_lossy(&self.visibility),
            self.timestamp,
        )
    }
}

/// A cell value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Value(pub Bytes);

impl Value {
    /// The raw bytes of this value.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl<T: Into<Bytes>> From<T> for Value {
    fn from(b: T) -> Self {
        Value(b.into())
    }
}

/// The set of visibility labels a scan or conditional update is entitled to
/// see. Evaluation of visibility expressions against these labels happens
/// server-side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorizations(BTreeSet<Bytes>);

impl Authorizations {
    /// The empty authorization set, which can only see cells with empty
    /// visibility.
    pub fn empty() -> Self {
        Authorizations(BTreeSet::new())
    }

    /// Build an authorization set from labels.
    pub fn new<I, B>(labels: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Authorizations(labels.into_iter().map(Into::into).collect())
    }

    /// Whether `label` is among the held authorizations.
    pub fn contains(&self, label: &[u8]) -> bool {
        self.0.contains(label)
    }

    /// Iterate the held labels.
    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_sort_newest_version_first() {
        let older = Key::new("r", "f", "q", 5);
        let newer = Key::new("r", "f", "q", 9);
        assert!(newer < older);
    }

    #[test]
    fn keys_sort_by_row_first() {
        let a = Key::new("a", "z", "z", 0);
        let b = Key::new("b", "a", "a", i64::MAX);
        assert!(a < b);
    }
}
