//! Property-based tests for gate evaluation
//!
//! **Feature: tenure-lifecycle, Property 1: Gate determinism**
//! **Feature: tenure-lifecycle, Property 2: Segregation of duties**
//! **Validates: gates are pure functions of package, record and actor**

#[cfg(test)]
mod tests {
    use crate::audit::TransactionRecord;
    use crate::collaborators::{RecordSnapshot, StaticDomainCatalog};
    use crate::gate::{FindingCategory, GateName, GateResult};
    use crate::gateway::{GateContext, ValidationGateway};
    use crate::models::{Geometry, LineRecord, UnitPackage};
    use crate::test_support::{polygon, CellGeometryEngine, PackageBuilder};
    use chrono::Utc;
    use proptest::prelude::*;
    use std::sync::Arc;
    use tenure_storage::Actor;

    fn gateway() -> ValidationGateway {
        ValidationGateway::new(
            Arc::new(CellGeometryEngine),
            Arc::new(StaticDomainCatalog::new([
                ("Status_Code", vec!["ACTIVE", "RETIRED"]),
                ("Poly_Type", vec!["Current_View", "Addition", "Deletion", "Replacement"]),
            ])),
            Arc::new(RecordSnapshot::new()),
            0.0001,
        )
    }

    /// Strategy for cell lists, including the engine's trigger cells
    fn cells_strategy() -> impl Strategy<Value = String> {
        prop::collection::vec(
            prop_oneof![
                4 => "[a-f]",
                1 => Just("dangle".to_string()),
                1 => Just("selfx".to_string()),
                1 => Just("open".to_string()),
                1 => Just("invalid".to_string()),
            ],
            1..4,
        )
        .prop_map(|cells| cells.join(","))
    }

    /// Strategy for an optional status code, mostly valid
    fn status_strategy() -> impl Strategy<Value = Option<String>> {
        prop_oneof![
            6 => Just(Some("ACTIVE".to_string())),
            2 => Just(Some("RETIRED".to_string())),
            1 => Just(Some("PROPOSED".to_string())),
            1 => Just(None),
        ]
    }

    /// Strategy for a line with possibly missing attributes
    fn line_strategy() -> impl Strategy<Value = LineRecord> {
        (
            "L[0-9]{1,3}",
            cells_strategy(),
            status_strategy(),
            proptest::bool::weighted(0.9),
        )
            .prop_map(|(key, cells, status, described)| LineRecord {
                feature_key: key,
                legal_description: described.then(|| "segment".to_string()),
                status_code: status,
                source_code: Some("SURVEY".to_string()),
                geometry: Geometry::new(cells),
                last_edited_by: None,
                last_edited_at: None,
            })
    }

    /// Strategy for a package with random linework and polygon tags
    fn package_strategy() -> impl Strategy<Value = UnitPackage> {
        (
            prop::collection::vec(line_strategy(), 0..6),
            prop::collection::vec(
                prop_oneof![
                    Just("Current_View"),
                    Just("Addition"),
                    Just("Replacement"),
                    Just("Bogus"),
                ],
                0..4,
            ),
        )
            .prop_map(|(lines, tags)| {
                let mut package = PackageBuilder::tfl49().without_polygons().build();
                package.lines = lines;
                for (i, tag) in tags.into_iter().enumerate() {
                    package
                        .boundary
                        .push(polygon(&format!("P{}", i), tag, Some("OIC 1"), "a,b"));
                }
                package
            })
    }

    fn run_all(gateway: &ValidationGateway, ctx: &GateContext<'_>) -> Vec<GateResult> {
        [GateName::CheckEdits, GateName::Review, GateName::Publish]
            .into_iter()
            .map(|gate| gateway.run_gate(gate, ctx))
            .collect()
    }

    proptest! {
        /// Property 1: Gate determinism
        ///
        /// For any package, record and actor, running a gate twice yields the
        /// same findings in the same order, and the verdict is exactly "no
        /// blocking finding".
        #[test]
        fn prop_gates_are_deterministic(package in package_strategy(), checked in any::<bool>()) {
            let gateway = gateway();
            let editor = Actor::new("editor");
            let reviewer = Actor::new("reviewer");
            let mut record =
                TransactionRecord::new_cycle(package.unit_id.clone(), &editor, Utc::now());
            if checked {
                let passed = GateResult::from_findings(GateName::CheckEdits, Vec::new());
                record.record_gate(&passed, &editor, Utc::now());
            }
            let ctx = GateContext::new(&package, Some(&record), &reviewer);

            let first = run_all(&gateway, &ctx);
            let second = run_all(&gateway, &ctx);
            prop_assert_eq!(&first, &second);

            for result in &first {
                prop_assert_eq!(result.passed, result.blocking().next().is_none());
            }
        }

        /// Property 2: Segregation of duties
        ///
        /// For any cycle, whoever extracted or checked the unit fails the
        /// review gate with a segregation finding, whatever else the
        /// package contains.
        #[test]
        fn prop_editors_cannot_approve(
            package in package_strategy(),
            extra_editors in prop::collection::vec("[a-z]{3,8}", 0..3),
        ) {
            let gateway = gateway();
            let extractor = Actor::new("extractor");
            let mut record =
                TransactionRecord::new_cycle(package.unit_id.clone(), &extractor, Utc::now());
            let passed = GateResult::from_findings(GateName::CheckEdits, Vec::new());
            for name in &extra_editors {
                record.record_gate(&passed, &Actor::new(name.as_str()), Utc::now());
            }

            let mut editors = vec![extractor.clone()];
            editors.extend(extra_editors.iter().map(|n| Actor::new(n.as_str())));

            for editor in &editors {
                let result = gateway.run_gate(
                    GateName::Review,
                    &GateContext::new(&package, Some(&record), editor),
                );
                prop_assert!(!result.passed);
                prop_assert_eq!(
                    result.findings.first().map(|f| f.category),
                    Some(FindingCategory::SegregationOfDuties)
                );
            }
        }
    }
}
