//! Change detection for publication
//!
//! The reconciler decides which downstream datasets a published unit touches.
//! Tagged datasets are included when the unit carries the tag. The current
//! view and Schedule A are diffed against the previous baseline and the system
//! of record, and are only included when some diff is non-empty; empty diffs
//! are discarded. Every decision is returned with the change set.

use crate::collaborators::{CollaboratorError, GeometryEngine, SystemOfRecord};
use crate::downstream::{DatasetKind, DatasetSpec, DownstreamRow, InclusionRule, RowSource};
use crate::error::LifecycleResult;
use crate::models::{FeatureSet, UnitPackage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tenure_config::ClassificationConfig;
use tenure_storage::UnitId;
use tracing::{debug, info};
use uuid::Uuid;

/// Why a dataset is in the change set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeClass {
    /// Boundary replaced by a new agreement
    BoundaryReplacement,
    /// Area added
    Addition,
    /// Area removed
    Deletion,
    /// Published boundary changed
    CurrentViewUpdate,
    /// Schedule A changed
    SecondaryScheduleUpdate,
}

impl ChangeClass {
    /// Classification of a dataset's change
    pub fn of(dataset: DatasetKind) -> Self {
        match dataset {
            DatasetKind::CurrentView => ChangeClass::CurrentViewUpdate,
            DatasetKind::Additions => ChangeClass::Addition,
            DatasetKind::Deletions => ChangeClass::Deletion,
            DatasetKind::AgreementBoundary => ChangeClass::BoundaryReplacement,
            DatasetKind::ScheduleA => ChangeClass::SecondaryScheduleUpdate,
        }
    }
}

/// Geometry differences between two feature sets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffArtifact {
    /// Geometry present now and absent from the reference
    pub added: FeatureSet,
    /// Geometry in the reference and absent now
    pub removed: FeatureSet,
    /// Keys present in both with different geometry
    pub changed: Vec<String>,
}

impl DiffArtifact {
    /// Whether the two sides are the same
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Short count summary
    pub fn summary(&self) -> String {
        format!(
            "{} added, {} removed, {} changed",
            self.added.len(),
            self.removed.len(),
            self.changed.len()
        )
    }
}

/// Diff `current` against `reference` through the geometry engine
pub fn diff_features(
    geometry: &dyn GeometryEngine,
    current: &FeatureSet,
    reference: &FeatureSet,
) -> Result<DiffArtifact, CollaboratorError> {
    let added = geometry.spatial_difference(current, reference)?;
    let removed = geometry.spatial_difference(reference, current)?;

    let by_key: HashMap<&str, _> = reference
        .iter()
        .map(|f| (f.key.as_str(), &f.geometry))
        .collect();
    let changed = current
        .iter()
        .filter(|f| {
            by_key
                .get(f.key.as_str())
                .map(|g| **g != f.geometry)
                .unwrap_or(false)
        })
        .map(|f| f.key.clone())
        .collect();

    Ok(DiffArtifact {
        added,
        removed,
        changed,
    })
}

/// What a diff was taken against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparand {
    /// The unit's previous authoritative snapshot
    PreviousBaseline,
    /// The external system of record
    SystemOfRecord,
}

/// A retained non-empty diff
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonDiff {
    /// Reference side
    pub against: Comparand,
    /// Differences
    pub diff: DiffArtifact,
}

/// One reconciliation decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileDecision {
    /// Dataset decided on
    pub dataset: DatasetKind,
    /// Whether the dataset is in the change set
    pub included: bool,
    /// Why
    pub reason: String,
}

/// Outcome of the key-assignment step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum KeyAssignment {
    /// At most one instrument: keys stamped on every row
    Assigned {
        /// The single instrument, if any polygon names one
        instrument: Option<String>,
        /// Feature class key per dataset
        keys: BTreeMap<DatasetKind, u32>,
    },
    /// Several instruments: keys left for manual completion downstream
    ManualCompletionRequired {
        /// Every distinct instrument named
        instruments: Vec<String>,
    },
}

impl KeyAssignment {
    /// Key for a dataset, when assigned
    pub fn key_for(&self, dataset: DatasetKind) -> Option<u32> {
        match self {
            KeyAssignment::Assigned { keys, .. } => keys.get(&dataset).copied(),
            KeyAssignment::ManualCompletionRequired { .. } => None,
        }
    }

    /// Whether keys must be completed by hand
    pub fn requires_manual_completion(&self) -> bool {
        matches!(self, KeyAssignment::ManualCompletionRequired { .. })
    }
}

/// Decide feature class keys from the instruments a package names
pub fn assign_keys(package: &UnitPackage, keys: &ClassificationConfig) -> KeyAssignment {
    let instruments = package.instruments();
    if instruments.len() > 1 {
        return KeyAssignment::ManualCompletionRequired {
            instruments: instruments.into_iter().collect(),
        };
    }

    KeyAssignment::Assigned {
        instrument: instruments.into_iter().next(),
        keys: DatasetKind::ALL
            .iter()
            .map(|kind| (*kind, kind.classification_key(keys)))
            .collect(),
    }
}

/// A dataset to update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetChange {
    /// Dataset
    pub dataset: DatasetKind,
    /// Classification tag
    pub class: ChangeClass,
    /// Key the unit's rows are filed under
    pub unit_key: String,
    /// Non-empty diffs that justified the update
    pub diffs: Vec<ComparisonDiff>,
    /// Rows to write, without audit stamps
    pub rows: Vec<DownstreamRow>,
}

/// Downstream datasets to update for one publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Change set identifier
    pub id: Uuid,
    /// Published unit
    pub unit: UnitId,
    /// When it was computed
    pub computed_at: DateTime<Utc>,
    /// Key-assignment outcome
    pub key_assignment: KeyAssignment,
    /// Datasets to update, in update order
    pub entries: Vec<DatasetChange>,
    /// Every inclusion decision, in dataset order
    pub decisions: Vec<ReconcileDecision>,
}

impl ChangeSet {
    /// Whether nothing downstream needs updating
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Datasets in the change set
    pub fn datasets(&self) -> Vec<DatasetKind> {
        self.entries.iter().map(|e| e.dataset).collect()
    }

    /// Entry for a dataset
    pub fn entry(&self, dataset: DatasetKind) -> Option<&DatasetChange> {
        self.entries.iter().find(|e| e.dataset == dataset)
    }
}

/// Computes change sets
pub struct ChangeReconciler {
    geometry: Arc<dyn GeometryEngine>,
    classification: ClassificationConfig,
}

impl ChangeReconciler {
    /// Create a reconciler
    pub fn new(geometry: Arc<dyn GeometryEngine>, classification: ClassificationConfig) -> Self {
        Self {
            geometry,
            classification,
        }
    }

    /// Compute the change set of a unit about to be published
    pub fn reconcile(
        &self,
        package: &UnitPackage,
        previous_baseline: Option<&UnitPackage>,
        system_of_record: &dyn SystemOfRecord,
    ) -> LifecycleResult<ChangeSet> {
        let key_assignment = assign_keys(package, &self.classification);
        if key_assignment.requires_manual_completion() {
            info!(
                "{} names several legal instruments; feature class keys left for manual completion",
                package.unit_id
            );
        }

        let mut entries = Vec::new();
        let mut decisions = Vec::new();

        for spec in DatasetSpec::all() {
            let (diffs, decision) = match spec.rule {
                InclusionRule::Presence => self.presence(&spec, package),
                InclusionRule::Diff => {
                    self.compare(&spec, package, previous_baseline, system_of_record)?
                }
            };

            debug!(
                "{} {}: {}",
                spec.kind,
                if decision.included { "included" } else { "discarded" },
                decision.reason
            );

            if decision.included {
                entries.push(DatasetChange {
                    dataset: spec.kind,
                    class: ChangeClass::of(spec.kind),
                    unit_key: spec.key_format.key_for(&package.unit_id),
                    diffs,
                    rows: spec.collect_rows(package, key_assignment.key_for(spec.kind)),
                });
            }
            decisions.push(decision);
        }

        let change_set = ChangeSet {
            id: Uuid::new_v4(),
            unit: package.unit_id.clone(),
            computed_at: Utc::now(),
            key_assignment,
            entries,
            decisions,
        };

        info!(
            "Reconciled {}: {} dataset(s) to update",
            change_set.unit,
            change_set.entries.len()
        );
        Ok(change_set)
    }

    fn presence(
        &self,
        spec: &DatasetSpec,
        package: &UnitPackage,
    ) -> (Vec<ComparisonDiff>, ReconcileDecision) {
        let RowSource::Tagged(tag) = spec.source else {
            let decision = ReconcileDecision {
                dataset: spec.kind,
                included: false,
                reason: "presence rule needs a tagged row source".to_string(),
            };
            return (Vec::new(), decision);
        };
        let count = package.polygons_tagged(&[tag]).len();

        let decision = ReconcileDecision {
            dataset: spec.kind,
            included: count > 0,
            reason: if count > 0 {
                format!("{} polygon(s) tagged {}", count, tag)
            } else {
                format!("no polygon tagged {}", tag)
            },
        };
        (Vec::new(), decision)
    }

    fn compare(
        &self,
        spec: &DatasetSpec,
        package: &UnitPackage,
        previous_baseline: Option<&UnitPackage>,
        system_of_record: &dyn SystemOfRecord,
    ) -> LifecycleResult<(Vec<ComparisonDiff>, ReconcileDecision)> {
        let current = Self::features(spec, package);
        let key = spec.key_format.key_for(&package.unit_id);

        let external = match spec.source {
            RowSource::ScheduleA => system_of_record.schedule_a(&key)?,
            _ => system_of_record.current_view(&key)?,
        };

        let mut comparands = Vec::new();
        if let Some(previous) = previous_baseline {
            comparands.push((Comparand::PreviousBaseline, Self::features(spec, previous)));
        }
        comparands.push((Comparand::SystemOfRecord, external));

        let mut diffs = Vec::new();
        let mut reasons = Vec::new();
        for (against, reference) in comparands {
            let diff = diff_features(self.geometry.as_ref(), &current, &reference)?;
            let label = match against {
                Comparand::PreviousBaseline => "previous baseline",
                Comparand::SystemOfRecord => "system of record",
            };

            if diff.is_empty() {
                reasons.push(format!("no difference from {}", label));
            } else {
                reasons.push(format!("{} vs {}", diff.summary(), label));
                diffs.push(ComparisonDiff { against, diff });
            }
        }
        if previous_baseline.is_none() {
            reasons.insert(0, "no previous baseline".to_string());
        }

        let decision = ReconcileDecision {
            dataset: spec.kind,
            included: !diffs.is_empty(),
            reason: reasons.join("; "),
        };
        Ok((diffs, decision))
    }

    fn features(spec: &DatasetSpec, package: &UnitPackage) -> FeatureSet {
        match spec.source {
            RowSource::ScheduleA => package.schedule_a_features(),
            RowSource::ResultingBoundary => package.resulting_boundary(),
            RowSource::Tagged(tag) => package
                .polygons_tagged(&[tag])
                .into_iter()
                .map(|p| p.to_feature())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{RecordFeature, RecordSnapshot};
    use crate::models::{BoundaryPolygon, Geometry, ScheduleAFeature};
    use crate::test_support::CellGeometryEngine;

    fn polygon(key: &str, tag: &str, tool: Option<&str>, cells: &str) -> BoundaryPolygon {
        BoundaryPolygon {
            feature_key: key.to_string(),
            poly_type: Some(tag.to_string()),
            legislative_tool: tool.map(str::to_string),
            geometry: Geometry::new(cells),
        }
    }

    fn package() -> UnitPackage {
        let mut package = UnitPackage::new(UnitId::new("TFL_49").unwrap());
        package.boundary = vec![polygon("P1", "Current_View", None, "a,b")];
        package.schedule_a = vec![ScheduleAFeature {
            feature_key: "S1".to_string(),
            forest_file_id: Some("TFL49".to_string()),
            geometry: Geometry::new("a"),
        }];
        package
    }

    fn snapshot_of(package: &UnitPackage) -> RecordSnapshot {
        let record = |key: &str, feature: &str, geometry: &Geometry| RecordFeature {
            key: key.to_string(),
            feature_key: feature.to_string(),
            geometry: geometry.clone(),
            retired_at: None,
        };
        RecordSnapshot {
            current_view: package
                .boundary
                .iter()
                .map(|p| record("TFL 49", &p.feature_key, &p.geometry))
                .collect(),
            schedule_a: package
                .schedule_a
                .iter()
                .map(|s| record("TFL49", &s.feature_key, &s.geometry))
                .collect(),
        }
    }

    fn reconciler() -> ChangeReconciler {
        ChangeReconciler::new(Arc::new(CellGeometryEngine), ClassificationConfig::default())
    }

    #[test]
    fn test_unchanged_unit_has_empty_change_set() {
        let package = package();
        let snapshot = snapshot_of(&package);

        let change_set = reconciler()
            .reconcile(&package, Some(&package), &snapshot)
            .unwrap();

        assert!(change_set.is_empty());
        assert_eq!(change_set.decisions.len(), 5);
        assert!(change_set.decisions.iter().all(|d| !d.included));
    }

    #[test]
    fn test_schedule_a_difference_from_record_is_included() {
        let mut package = package();
        let snapshot = snapshot_of(&package);
        package.schedule_a[0].geometry = Geometry::new("a,b");

        let change_set = reconciler()
            .reconcile(&package, None, &snapshot)
            .unwrap();

        assert_eq!(change_set.datasets(), vec![DatasetKind::ScheduleA]);
        let entry = change_set.entry(DatasetKind::ScheduleA).unwrap();
        assert_eq!(entry.class, ChangeClass::SecondaryScheduleUpdate);
        assert_eq!(entry.unit_key, "TFL49");
        assert_eq!(entry.diffs.len(), 1);
        assert_eq!(entry.diffs[0].against, Comparand::SystemOfRecord);
        assert_eq!(entry.diffs[0].diff.changed, vec!["S1".to_string()]);
    }

    #[test]
    fn test_addition_drives_tagged_dataset_and_current_view() {
        let mut package = package();
        let baseline = package.clone();
        let snapshot = snapshot_of(&package);
        package
            .boundary
            .push(polygon("P2", "Addition", Some("OIC 77"), "c"));

        let change_set = reconciler()
            .reconcile(&package, Some(&baseline), &snapshot)
            .unwrap();

        assert_eq!(
            change_set.datasets(),
            vec![DatasetKind::CurrentView, DatasetKind::Additions]
        );
        let additions = change_set.entry(DatasetKind::Additions).unwrap();
        assert_eq!(additions.rows.len(), 1);
        assert_eq!(additions.rows[0].feature_class_skey, Some(831));

        let current_view = change_set.entry(DatasetKind::CurrentView).unwrap();
        assert_eq!(current_view.unit_key, "TFL 49");
        assert_eq!(current_view.rows.len(), 2);
        assert_eq!(current_view.diffs.len(), 2);
    }

    #[test]
    fn test_several_instruments_skip_key_assignment() {
        let mut package = package();
        package.boundary = vec![
            polygon("P1", "Addition", Some("OIC 1"), "a"),
            polygon("P2", "Addition", Some("OIC 2"), "b"),
        ];

        let assignment = assign_keys(&package, &ClassificationConfig::default());
        assert_eq!(
            assignment,
            KeyAssignment::ManualCompletionRequired {
                instruments: vec!["OIC 1".to_string(), "OIC 2".to_string()]
            }
        );

        let change_set = reconciler()
            .reconcile(&package, None, &RecordSnapshot::new())
            .unwrap();
        let additions = change_set.entry(DatasetKind::Additions).unwrap();
        assert!(additions.rows.iter().all(|r| r.feature_class_skey.is_none()));
    }

    #[test]
    fn test_single_instrument_assigns_configured_keys() {
        let mut package = package();
        package.boundary = vec![
            polygon("P1", "Addition", Some("OIC 1"), "a"),
            polygon("P2", "Current_View", None, "b"),
        ];

        match assign_keys(&package, &ClassificationConfig::default()) {
            KeyAssignment::Assigned { instrument, keys } => {
                assert_eq!(instrument.as_deref(), Some("OIC 1"));
                assert_eq!(keys[&DatasetKind::CurrentView], 830);
                assert_eq!(keys[&DatasetKind::ScheduleA], 834);
            }
            other => panic!("expected assigned keys, got {:?}", other),
        }
    }
}
