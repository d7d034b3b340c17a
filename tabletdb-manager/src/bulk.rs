//! Bulk-import planning and admission.
//!
//! Given a directory of externally written sorted files and a [`LoadPlan`],
//! compute which tablets each file lands in and refuse the whole import up
//! front if it would breach per-tablet file caps. The actual metadata
//! writes happen inside the FATE transaction's load step.

use std::collections::BTreeMap;

use itertools::Itertools;
use tabletdb_client::load_plan::{LoadPlan, RangeType};
use tabletdb_common::{KeyExtent, TableId};
use tabletdb_errors::{TabletDbError, TabletDbResult};
use tabletdb_metadata::{Ample, StoredTabletFile, TabletMetadata};
use tracing::debug;

/// Which files land in which tablets, with each tablet's pre-import file
/// count for admission checks.
#[derive(Debug, Default)]
pub struct BulkLoadMapping {
    /// Per-tablet destinations, in metadata-row order
    pub tablets: BTreeMap<Vec<u8>, (KeyExtent, Vec<StoredTabletFile>)>,
}

impl BulkLoadMapping {
    /// Iterate `(extent, files)` destinations.
    pub fn iter(&self) -> impl Iterator<Item = (&KeyExtent, &Vec<StoredTabletFile>)> {
        self.tablets.values().map(|(e, fs)| (e, fs))
    }

    /// The extents touched by the import.
    pub fn extents(&self) -> Vec<KeyExtent> {
        self.tablets.values().map(|(e, _)| e.clone()).collect()
    }
}

/// Validate the plan against the directory listing and the table's current
/// tablets, and compute the file→tablet mapping.
///
/// Fails on: files in the directory missing from the plan (and vice
/// versa), `TABLE`-type ranges whose boundaries are not existing tablet
/// splits, a file mapped into more tablets than `bulk_max_tablets`, or any
/// tablet whose post-import file count would exceed
/// `bulk_max_tablet_files`.
pub async fn compute_bulk_load_mapping(
    ample: &Ample,
    table: &TableId,
    import_dir: &str,
    dir_files: &[String],
    plan: &LoadPlan,
    bulk_max_tablets: usize,
    bulk_max_tablet_files: usize,
) -> TabletDbResult<BulkLoadMapping> {
    // 1. the plan and the directory must agree exactly
    let planned: std::collections::BTreeSet<&str> =
        plan.file_names().into_iter().collect();
    let unplanned = dir_files
        .iter()
        .filter(|f| !planned.contains(f.as_str()))
        .join(", ");
    if !unplanned.is_empty() {
        return Err(TabletDbError::InvalidArgument(format!(
            "files in the import directory but not in the load plan: {unplanned}"
        )));
    }
    let absent = planned
        .iter()
        .filter(|f| !dir_files.iter().any(|d| d == *f))
        .join(", ");
    if !absent.is_empty() {
        return Err(TabletDbError::InvalidArgument(format!(
            "files in the load plan but not in the import directory: {absent}"
        )));
    }

    let tablets: Vec<TabletMetadata> = ample
        .read_tablets(table.level())
        .for_table(table.clone())
        .fetch_all()
        .await?;
    if tablets.is_empty() {
        return Err(TabletDbError::TableNotFound(table.to_string()));
    }
    let boundaries: std::collections::BTreeSet<Option<&bytes::Bytes>> = tablets
        .iter()
        .map(|tm| tm.extent().end_row())
        .collect();

    // 2. map each plan entry onto overlapping tablets
    let mut mapping = BulkLoadMapping::default();
    let mut tablets_per_file: BTreeMap<&str, usize> = BTreeMap::new();
    for entry in &plan.entries {
        if entry.range_type == RangeType::Table {
            for bound in [&entry.start, &entry.end] {
                if bound.is_some() && !boundaries.contains(&bound.as_ref()) {
                    return Err(TabletDbError::InvalidArgument(format!(
                        "load plan range boundary {:?} for {} is not a tablet boundary",
                        String::from_utf8_lossy(bound.as_ref().expect("checked some")),
                        entry.file_name,
                    )));
                }
            }
        }
        let path = format!("{import_dir}/{}", entry.file_name);
        for tm in &tablets {
            let probe = KeyExtent::new(table.clone(), entry.end.clone(), entry.start.clone());
            if !tm.extent().overlaps(&probe) {
                continue;
            }
            let file = match entry.range_type {
                RangeType::Table => StoredTabletFile::unfenced(path.clone()),
                RangeType::File => StoredTabletFile::fenced(
                    path.clone(),
                    entry.start.clone(),
                    entry.end.clone(),
                ),
            };
            let count = tablets_per_file.entry(entry.file_name.as_str()).or_insert(0);
            *count += 1;
            if *count > bulk_max_tablets {
                return Err(TabletDbError::InvalidArgument(format!(
                    "file {} would be imported into more than {} tablets",
                    entry.file_name, bulk_max_tablets
                )));
            }
            mapping
                .tablets
                .entry(tm.extent().metadata_row().to_vec())
                .or_insert_with(|| (tm.extent().clone(), Vec::new()))
                .1
                .push(file);
        }
    }

    // every planned file must have landed somewhere, or part of the
    // import would silently vanish
    for file in &planned {
        if !tablets_per_file.contains_key(*file) {
            return Err(TabletDbError::InvalidArgument(format!(
                "load plan maps {file} into no tablet of the table"
            )));
        }
    }

    // 3. pre-flight admission: no tablet may cross the file cap
    for (extent, files) in mapping.iter() {
        let existing = tablets
            .iter()
            .find(|tm| tm.extent() == extent)
            .map(|tm| tm.files().len())
            .unwrap_or(0);
        let would_be = existing + files.len();
        if would_be > bulk_max_tablet_files {
            metrics::counter!(tabletdb_common::metrics::recorded::BULK_IMPORTS_REFUSED)
                .increment(1);
            return Err(TabletDbError::InvalidArgument(format!(
                "bulk import of {} would bring tablet {} to {} files, over the limit of {}",
                files
                    .first()
                    .map(|f| f.path.as_str())
                    .unwrap_or("<none>"),
                extent,
                would_be,
                bulk_max_tablet_files,
            )));
        }
    }

    debug!(
        %table,
        files = dir_files.len(),
        tablets = mapping.tablets.len(),
        "bulk load mapping computed"
    );
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tabletdb_metadata::{InMemoryAmple, TabletMetadata};

    use super::*;

    async fn seeded_table() -> Ample {
        let ample = Ample::new(Arc::new(InMemoryAmple::new()));
        // three tablets: (-inf, f], (f, m], (m, +inf)
        for (end, prev) in [
            (Some("f"), None),
            (Some("m"), Some("f")),
            (None, Some("m")),
        ] {
            let e = KeyExtent::new(TableId::new("t1"), end, prev);
            let mut mutator = ample.conditionally_mutate_tablets();
            mutator
                .mutate_tablet(e.clone())
                .require_absent_tablet()
                .insert_tablet(TabletMetadata::builder(e.clone()).build())
                .submit(|_| false, "seed")
                .unwrap();
            mutator.process().await.unwrap();
        }
        ample
    }

    #[tokio::test]
    async fn maps_files_to_overlapping_tablets() {
        let ample = seeded_table().await;
        let plan = LoadPlan::builder()
            .load_file_with_range("f1.rf", Some("a"), Some("k"))
            .build();
        let mapping = compute_bulk_load_mapping(
            &ample,
            &TableId::new("t1"),
            "/bulk/dir",
            &["f1.rf".to_string()],
            &plan,
            100,
            100,
        )
        .await
        .unwrap();
        // (a, k] overlaps (-inf, f] and (f, m]
        assert_eq!(mapping.tablets.len(), 2);
        for (_, files) in mapping.iter() {
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].path, "/bulk/dir/f1.rf");
            assert!(files[0].fenced_start.is_some());
        }
    }

    #[tokio::test]
    async fn plan_and_directory_must_agree() {
        let ample = seeded_table().await;
        let plan = LoadPlan::builder()
            .load_file_to("f1.rf", None::<&str>, Some("f"))
            .build();
        let err = compute_bulk_load_mapping(
            &ample,
            &TableId::new("t1"),
            "/bulk/dir",
            &["f1.rf".to_string(), "stray.rf".to_string()],
            &plan,
            100,
            100,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("stray.rf"));

        let err = compute_bulk_load_mapping(
            &ample,
            &TableId::new("t1"),
            "/bulk/dir",
            &[],
            &plan,
            100,
            100,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("f1.rf"));
    }

    #[tokio::test]
    async fn table_ranges_must_hit_existing_boundaries() {
        let ample = seeded_table().await;
        let plan = LoadPlan::builder()
            .load_file_to("f1.rf", Some("f"), Some("q"))
            .build();
        let err = compute_bulk_load_mapping(
            &ample,
            &TableId::new("t1"),
            "/bulk/dir",
            &["f1.rf".to_string()],
            &plan,
            100,
            100,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains('q'));
    }

    #[tokio::test]
    async fn file_cap_refuses_whole_import() {
        let ample = seeded_table().await;
        // six files all aimed at the middle tablet, cap five
        let mut builder = LoadPlan::builder();
        let mut names = Vec::new();
        for i in 0..6 {
            let name = format!("f{i}.rf");
            builder = builder.load_file_with_range(name.clone(), Some("g"), Some("h"));
            names.push(name);
        }
        let err = compute_bulk_load_mapping(
            &ample,
            &TableId::new("t1"),
            "/bulk/dir",
            &names,
            &builder.build(),
            100,
            5,
        )
        .await
        .unwrap_err();
        let message = err.to_string();
        // the refusal names both the limit and the would-be count
        assert!(message.contains('5'), "{message}");
        assert!(message.contains('6'), "{message}");
    }

    #[tokio::test]
    async fn per_file_tablet_cap() {
        let ample = seeded_table().await;
        let plan = LoadPlan::builder()
            .load_file_with_range("wide.rf", None::<&str>, None::<&str>)
            .build();
        let err = compute_bulk_load_mapping(
            &ample,
            &TableId::new("t1"),
            "/bulk/dir",
            &["wide.rf".to_string()],
            &plan,
            2,
            100,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("wide.rf"));
    }
}
