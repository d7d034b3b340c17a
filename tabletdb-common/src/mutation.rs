//! Mutations, conditions, and durability levels.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tabletdb_errors::{TabletDbError, TabletDbResult};

/// The durability establishment required before a write is acknowledged.
///
/// Levels are ordered by strength; the effective level of a write is the
/// *maximum* of what the request asked for and the table's default, so a
/// table configured for `Sync` can never be silently weakened by a client.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum Durability {
    /// Skip the write-ahead log entirely.
    None,
    /// Append to the log without waiting for it to reach disk.
    Log,
    /// Append and flush to the OS.
    Flush,
    /// Append and fsync.
    #[default]
    Sync,
}

impl Durability {
    /// Resolve the effective durability of a write.
    pub fn resolve(requested: Durability, table_default: Durability) -> Durability {
        requested.max(table_default)
    }

    /// Whether this level requires the write-ahead log at all.
    pub fn uses_log(self) -> bool {
        self != Durability::None
    }
}

/// What a [`ColumnUpdate`] does to its cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateValue {
    /// Write the given value.
    Put(Bytes),
    /// Delete the cell.
    Delete,
}

/// One cell-level change within a [`Mutation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnUpdate {
    /// Column family
    pub family: Bytes,
    /// Column qualifier
    pub qualifier: Bytes,
    /// Visibility expression for the written cell
    pub visibility: Bytes,
    /// Explicit version timestamp; `None` lets the tablet assign one from
    /// its time type at commit.
    pub timestamp: Option<i64>,
    /// Put or delete
    pub value: UpdateValue,
}

/// An atomic set of changes to one row.
///
/// All updates in a mutation land in the same tablet (rows never span
/// tablets) and become visible together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// The row every update applies to
    pub row: Bytes,
    /// Cell changes, applied in order
    pub updates: Vec<ColumnUpdate>,
}

impl Mutation {
    /// Start a mutation of `row`.
    pub fn new(row: impl Into<Bytes>) -> Self {
        Mutation {
            row: row.into(),
            updates: Vec::new(),
        }
    }

    /// Add a put of `value` at `family:qualifier`.
    pub fn put(
        mut self,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.updates.push(ColumnUpdate {
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: Bytes::new(),
            timestamp: None,
            value: UpdateValue::Put(value.into()),
        });
        self
    }

    /// Add a put with an explicit visibility expression.
    pub fn put_visible(
        mut self,
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        visibility: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.updates.push(ColumnUpdate {
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: visibility.into(),
            timestamp: None,
            value: UpdateValue::Put(value.into()),
        });
        self
    }

    /// Add a delete of `family:qualifier`.
    pub fn delete(mut self, family: impl Into<Bytes>, qualifier: impl Into<Bytes>) -> Self {
        self.updates.push(ColumnUpdate {
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: Bytes::new(),
            timestamp: None,
            value: UpdateValue::Delete,
        });
        self
    }

    /// Approximate in-memory footprint, used for batching decisions.
    pub fn estimated_size(&self) -> usize {
        self.row.len()
            + self
                .updates
                .iter()
                .map(|u| {
                    u.family.len()
                        + u.qualifier.len()
                        + u.visibility.len()
                        + match &u.value {
                            UpdateValue::Put(v) => v.len(),
                            UpdateValue::Delete => 0,
                        }
                        + 16
                })
                .sum::<usize>()
    }
}

/// A reference to a server-side iterator to apply while evaluating
/// conditions. The iterator implementations themselves are resolved from
/// the request's symbol table by the tablet server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IteratorSetting {
    /// Application priority; lower runs closer to the data
    pub priority: i32,
    /// Name used to resolve the implementation in the symbol table
    pub name: String,
    /// Free-form options passed to the iterator
    pub options: BTreeMap<String, String>,
}

/// A single condition a [`ConditionalMutation`] requires to hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Column family of the checked cell
    pub family: Bytes,
    /// Column qualifier of the checked cell
    pub qualifier: Bytes,
    /// Visibility of the checked cell
    pub visibility: Bytes,
    /// If set, only a cell at exactly this timestamp satisfies the check
    pub timestamp: Option<i64>,
    /// Expected value; `None` means the cell must be absent
    pub expected: Option<Bytes>,
    /// Iterators to apply to the row view before checking
    pub iterators: Vec<IteratorSetting>,
}

impl Condition {
    /// Require `family:qualifier` to currently hold `value`.
    pub fn equals(
        family: impl Into<Bytes>,
        qualifier: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Condition {
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: Bytes::new(),
            timestamp: None,
            expected: Some(value.into()),
            iterators: Vec::new(),
        }
    }

    /// Require `family:qualifier` to be absent.
    pub fn absent(family: impl Into<Bytes>, qualifier: impl Into<Bytes>) -> Self {
        Condition {
            family: family.into(),
            qualifier: qualifier.into(),
            visibility: Bytes::new(),
            timestamp: None,
            expected: None,
            iterators: Vec::new(),
        }
    }
}

/// A compare-and-set write: the mutation applies only if every condition
/// holds against the row's current visible state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalMutation {
    /// The changes to apply on success
    pub mutation: Mutation,
    /// All conditions; empty is an argument error at submit time
    pub conditions: Vec<Condition>,
}

impl ConditionalMutation {
    /// Pair a mutation with its conditions, rejecting an empty condition
    /// set up front.
    pub fn new(mutation: Mutation, conditions: Vec<Condition>) -> TabletDbResult<Self> {
        if conditions.is_empty() {
            return Err(TabletDbError::InvalidArgument(
                "conditional mutation requires at least one condition".into(),
            ));
        }
        Ok(ConditionalMutation {
            mutation,
            conditions,
        })
    }

    /// The row this conditional mutation targets.
    pub fn row(&self) -> &Bytes {
        &self.mutation.row
    }

    /// Sort conditions by `(family, qualifier, visibility, timestamp desc)`
    /// so the server's row scan visits them in key order.
    pub fn sort_conditions(&mut self) {
        self.conditions.sort_by(|a, b| {
            a.family
                .cmp(&b.family)
                .then_with(|| a.qualifier.cmp(&b.qualifier))
                .then_with(|| a.visibility.cmp(&b.visibility))
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
    }
}

/// Outcome of one conditional mutation, as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionalWriteStatus {
    /// Conditions held and the mutation was committed.
    Accepted,
    /// At least one condition failed; nothing was written.
    Rejected,
    /// Conditions held but the mutation violated a table constraint.
    Violated,
    /// The server could not process the mutation right now (tablet closed,
    /// too many files, session invalidated); the client may retry it after
    /// refreshing its locator cache.
    Ignored,
    /// A condition referenced a visibility the submitter cannot see.
    InvisibleVisibility,
    /// The outcome cannot be determined; terminal, reported only after the
    /// session-invalidation fence has run.
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durability_resolution_is_max() {
        use Durability::*;
        assert_eq!(Durability::resolve(None, Sync), Sync);
        assert_eq!(Durability::resolve(Sync, None), Sync);
        assert_eq!(Durability::resolve(Log, Flush), Flush);
        assert_eq!(Durability::resolve(None, None), None);
        assert!(!None.uses_log());
        assert!(Log.uses_log());
    }

    #[test]
    fn conditional_mutation_requires_conditions() {
        let m = Mutation::new("row").put("f", "q", "v");
        assert!(matches!(
            ConditionalMutation::new(m, vec![]),
            Err(TabletDbError::InvalidArgument(_))
        ));
    }

    #[test]
    fn condition_sort_order() {
        let m = Mutation::new("row").put("f", "q", "v");
        let mut cm = ConditionalMutation::new(
            m,
            vec![
                Condition {
                    timestamp: Some(1),
                    ..Condition::equals("f", "a", "v")
                },
                Condition {
                    timestamp: Some(9),
                    ..Condition::equals("f", "a", "v")
                },
                Condition::absent("e", "z"),
            ],
        )
        .unwrap();
        cm.sort_conditions();
        assert_eq!(cm.conditions[0].family, Bytes::from("e"));
        // same cell: newest timestamp first
        assert_eq!(cm.conditions[1].timestamp, Some(9));
        assert_eq!(cm.conditions[2].timestamp, Some(1));
    }
}
