//! Property-based tests for change reconciliation
//!
//! **Feature: tenure-lifecycle, Property 3: Unchanged datasets are never written**
//! **Feature: tenure-lifecycle, Property 4: Tagged datasets follow polygon presence**
//! **Validates: an empty diff is discarded rather than republished**

#[cfg(test)]
mod tests {
    use crate::downstream::DatasetKind;
    use crate::models::UnitPackage;
    use crate::reconciler::ChangeReconciler;
    use crate::test_support::{polygon, CellGeometryEngine, PackageBuilder, SharedRecord};
    use proptest::prelude::*;
    use std::sync::Arc;
    use tenure_config::ClassificationConfig;

    fn cells_strategy() -> impl Strategy<Value = String> {
        prop::collection::btree_set("[a-h]", 1..4).prop_map(|cells| {
            cells.into_iter().collect::<Vec<_>>().join(",")
        })
    }

    /// Strategy for a package with random Schedule A and tagged polygons
    fn package_strategy() -> impl Strategy<Value = UnitPackage> {
        (
            prop::collection::vec(cells_strategy(), 0..4),
            prop::collection::vec(
                (
                    prop_oneof![Just("Current_View"), Just("Addition"), Just("Deletion")],
                    cells_strategy(),
                ),
                0..5,
            ),
        )
            .prop_map(|(schedule, polygons)| {
                let mut builder = PackageBuilder::new("TFL_49");
                for (i, cells) in schedule.iter().enumerate() {
                    builder = builder.with_schedule_a(&format!("S{}", i), cells);
                }
                for (i, (tag, cells)) in polygons.iter().enumerate() {
                    let key = format!("P{}", i);
                    builder = builder.with_polygon(polygon(&key, tag, Some("OIC 9"), cells));
                }
                builder.build()
            })
    }

    fn reconciler() -> ChangeReconciler {
        ChangeReconciler::new(Arc::new(CellGeometryEngine), ClassificationConfig::default())
    }

    proptest! {
        /// Property 3: Unchanged datasets are never written
        ///
        /// When the package matches both its previous baseline and the system
        /// of record, neither diff-driven dataset is in the change set.
        #[test]
        fn prop_identical_diff_datasets_excluded(package in package_strategy()) {
            let record = SharedRecord::default();
            record.mirror(&package);

            let change_set = reconciler().reconcile(&package, Some(&package), &record).unwrap();

            prop_assert!(change_set.entry(DatasetKind::ScheduleA).is_none());
            prop_assert!(change_set.entry(DatasetKind::CurrentView).is_none());
            for entry in &change_set.entries {
                prop_assert!(entry.diffs.is_empty());
            }
        }

        /// Property 4: Tagged datasets follow polygon presence
        ///
        /// Additions and Deletions are included exactly when a polygon carries
        /// the matching tag, regardless of any diff.
        #[test]
        fn prop_presence_rule(package in package_strategy()) {
            let record = SharedRecord::default();
            record.mirror(&package);

            let change_set = reconciler().reconcile(&package, Some(&package), &record).unwrap();
            let has = |tag: &str| {
                package.boundary.iter().any(|p| p.poly_type.as_deref() == Some(tag))
            };

            prop_assert_eq!(change_set.entry(DatasetKind::Additions).is_some(), has("Addition"));
            prop_assert_eq!(change_set.entry(DatasetKind::Deletions).is_some(), has("Deletion"));
            prop_assert!(change_set.entry(DatasetKind::AgreementBoundary).is_none());
        }
    }
}
