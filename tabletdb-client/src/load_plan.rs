//! Load plans for bulk import: which tablet ranges each externally-written
//! file covers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tabletdb_errors::{TabletDbError, TabletDbResult};

/// How a plan entry's range is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RangeType {
    /// The caller asserts `(start, end]` are existing tablet boundaries;
    /// the file lands in every tablet between them, unfenced.
    Table,
    /// `(start, end]` is the file's own key range; it lands, fenced, in
    /// every tablet the range overlaps.
    File,
}

/// One file's destination range in a load plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPlanEntry {
    /// File name relative to the import directory
    pub file_name: String,
    /// How to interpret the range
    pub range_type: RangeType,
    /// Exclusive lower bound, `None` = −∞
    #[serde(with = "opt_bytes")]
    pub start: Option<Bytes>,
    /// Inclusive upper bound, `None` = +∞
    #[serde(with = "opt_bytes")]
    pub end: Option<Bytes>,
}

mod opt_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(b) => s.serialize_some(&String::from_utf8_lossy(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Bytes>, D::Error> {
        let v: Option<String> = Option::deserialize(d)?;
        Ok(v.map(Bytes::from))
    }
}

/// A full plan: every file in the import directory and where it goes.
/// Serialized as JSON when handed to the manager.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPlan {
    /// The plan's entries; a file may appear more than once with disjoint
    /// ranges
    pub entries: Vec<LoadPlanEntry>,
}

impl LoadPlan {
    /// Start building a plan.
    pub fn builder() -> LoadPlanBuilder {
        LoadPlanBuilder { entries: Vec::new() }
    }

    /// All distinct file names in the plan.
    pub fn file_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.iter().map(|e| e.file_name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> TabletDbResult<String> {
        serde_json::to_string(self)
            .map_err(|e| TabletDbError::Serialization(format!("load plan: {e}")))
    }

    /// Parse from JSON.
    pub fn from_json(json: &str) -> TabletDbResult<LoadPlan> {
        serde_json::from_str(json)
            .map_err(|e| TabletDbError::InvalidArgument(format!("bad load plan: {e}")))
    }
}

/// Builder for [`LoadPlan`].
pub struct LoadPlanBuilder {
    entries: Vec<LoadPlanEntry>,
}

impl LoadPlanBuilder {
    /// The file covers the tablets between two existing split points.
    pub fn load_file_to(
        mut self,
        file_name: impl Into<String>,
        start: Option<impl Into<Bytes>>,
        end: Option<impl Into<Bytes>>,
    ) -> Self {
        self.entries.push(LoadPlanEntry {
            file_name: file_name.into(),
            range_type: RangeType::Table,
            start: start.map(Into::into),
            end: end.map(Into::into),
        });
        self
    }

    /// The file's own key range; tablets are derived by overlap.
    pub fn load_file_with_range(
        mut self,
        file_name: impl Into<String>,
        start: Option<impl Into<Bytes>>,
        end: Option<impl Into<Bytes>>,
    ) -> Self {
        self.entries.push(LoadPlanEntry {
            file_name: file_name.into(),
            range_type: RangeType::File,
            start: start.map(Into::into),
            end: end.map(Into::into),
        });
        self
    }

    /// Finish the plan.
    pub fn build(self) -> LoadPlan {
        LoadPlan {
            entries: self.entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip() {
        let plan = LoadPlan::builder()
            .load_file_to("f1.rf", None::<&str>, Some("m"))
            .load_file_with_range("f2.rf", Some("a"), Some("k"))
            .build();
        let json = plan.to_json().unwrap();
        assert_eq!(LoadPlan::from_json(&json).unwrap(), plan);
    }

    #[test]
    fn file_names_dedupe() {
        let plan = LoadPlan::builder()
            .load_file_to("f1.rf", None::<&str>, Some("m"))
            .load_file_to("f1.rf", Some("m"), None::<&str>)
            .load_file_to("f0.rf", None::<&str>, None::<&str>)
            .build();
        assert_eq!(plan.file_names(), vec!["f0.rf", "f1.rf"]);
    }
}
