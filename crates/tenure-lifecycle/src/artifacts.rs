//! Advisory artifacts for reviewers and editors
//!
//! Artifacts are written under `<unit>/artifacts/`, outside the sealed data
//! directory, and are never an input to a gate.

use crate::collaborators::{GeometryEngine, SystemOfRecord};
use crate::error::{LifecycleError, LifecycleResult};
use crate::gate::{Finding, FindingCategory, Subject};
use crate::models::{LineRecord, UnitPackage};
use crate::package_store::write_in_unit;
use crate::reconciler::{diff_features, DiffArtifact};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tenure_storage::UnitLocation;

/// Artifact directory relative to the unit root
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Review artifact file name
pub const REVIEW_FILE: &str = "review.json";

/// Checkout advisory file name
pub const BASELINE_VS_RECORD_FILE: &str = "baseline_vs_record.json";

/// How a line changed since checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineChangeKind {
    /// New line
    Added,
    /// Attributes or geometry changed
    Modified,
    /// Line no longer present
    Removed,
}

/// One changed line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineChange {
    /// Line feature key
    pub feature_key: String,
    /// What happened to it
    pub kind: LineChangeKind,
}

/// What reviewers look at after submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewArtifacts {
    /// When the artifacts were computed
    pub generated_at: DateTime<Utc>,
    /// Lines changed relative to the baseline
    pub line_changes: Vec<LineChange>,
    /// Resulting boundary relative to the baseline
    pub polygon_diff: DiffArtifact,
}

impl ReviewArtifacts {
    /// Compare a submitted package with its baseline
    pub fn compute(
        geometry: &dyn GeometryEngine,
        current: &UnitPackage,
        baseline: &UnitPackage,
    ) -> LifecycleResult<Self> {
        let polygon_diff = diff_features(
            geometry,
            &current.resulting_boundary(),
            &baseline.resulting_boundary(),
        )?;

        Ok(Self {
            generated_at: Utc::now(),
            line_changes: line_changes(&current.lines, &baseline.lines),
            polygon_diff,
        })
    }

    /// Write the artifacts into a unit tree
    pub fn save(&self, location: &UnitLocation) -> LifecycleResult<PathBuf> {
        save_json(location, REVIEW_FILE, self)
    }
}

/// Line changes between two line sets, ignoring editor tracking
pub fn line_changes(current: &[LineRecord], baseline: &[LineRecord]) -> Vec<LineChange> {
    let before: BTreeMap<&str, &LineRecord> =
        baseline.iter().map(|l| (l.feature_key.as_str(), l)).collect();
    let after: BTreeMap<&str, &LineRecord> =
        current.iter().map(|l| (l.feature_key.as_str(), l)).collect();

    let mut changes = Vec::new();
    for (key, line) in &after {
        let kind = match before.get(key) {
            None => LineChangeKind::Added,
            Some(old) if !same_content(old, line) => LineChangeKind::Modified,
            Some(_) => continue,
        };
        changes.push(LineChange {
            feature_key: key.to_string(),
            kind,
        });
    }
    for key in before.keys().filter(|k| !after.contains_key(*k)) {
        changes.push(LineChange {
            feature_key: key.to_string(),
            kind: LineChangeKind::Removed,
        });
    }
    changes
}

fn same_content(a: &LineRecord, b: &LineRecord) -> bool {
    a.legal_description == b.legal_description
        && a.status_code == b.status_code
        && a.source_code == b.source_code
        && a.geometry == b.geometry
}

/// Baseline differences from the system of record, found at checkout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineAdvisory {
    /// Baseline boundary vs the published current view
    pub current_view: DiffArtifact,
    /// Baseline Schedule A vs the published Schedule A
    pub schedule_a: DiffArtifact,
}

impl BaselineAdvisory {
    /// Compare a baseline package with the system of record
    pub fn compute(
        geometry: &dyn GeometryEngine,
        system_of_record: &dyn SystemOfRecord,
        baseline: &UnitPackage,
    ) -> LifecycleResult<Self> {
        let unit = &baseline.unit_id;
        let current_view = diff_features(
            geometry,
            &baseline.resulting_boundary(),
            &system_of_record.current_view(&unit.current_view_key())?,
        )?;
        let schedule_a = diff_features(
            geometry,
            &baseline.schedule_a_features(),
            &system_of_record.schedule_a(&unit.forest_file_id())?,
        )?;

        Ok(Self {
            current_view,
            schedule_a,
        })
    }

    /// Whether the baseline matches the system of record
    pub fn is_empty(&self) -> bool {
        self.current_view.is_empty() && self.schedule_a.is_empty()
    }

    /// Informational findings for each non-empty difference
    pub fn findings(&self) -> Vec<Finding> {
        let mut findings = Vec::new();
        if !self.current_view.is_empty() {
            findings.push(Finding::informational(
                FindingCategory::Spatial,
                Subject::dataset("boundary"),
                format!(
                    "baseline boundary differs from the published current view ({})",
                    self.current_view.summary()
                ),
            ));
        }
        if !self.schedule_a.is_empty() {
            findings.push(Finding::informational(
                FindingCategory::Spatial,
                Subject::dataset("schedule_a"),
                format!(
                    "baseline Schedule A differs from the published Schedule A ({})",
                    self.schedule_a.summary()
                ),
            ));
        }
        findings
    }

    /// Write the advisory into a unit tree
    pub fn save(&self, location: &UnitLocation) -> LifecycleResult<PathBuf> {
        save_json(location, BASELINE_VS_RECORD_FILE, self)
    }
}

fn save_json<T: Serialize>(
    location: &UnitLocation,
    file: &str,
    value: &T,
) -> LifecycleResult<PathBuf> {
    let path = location.path().join(ARTIFACTS_DIR).join(file);
    let json = serde_json::to_string_pretty(value).map_err(|e| {
        LifecycleError::Serialization(format!("Failed to serialize {}: {}", file, e))
    })?;
    write_in_unit(location, &path, json.as_bytes())?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{RecordFeature, RecordSnapshot};
    use crate::models::{BoundaryPolygon, Geometry};
    use crate::test_support::CellGeometryEngine;
    use tempfile::TempDir;
    use tenure_storage::{Stage, UnitId};

    fn line(key: &str, cells: &str) -> LineRecord {
        LineRecord {
            feature_key: key.to_string(),
            legal_description: Some("d".to_string()),
            status_code: Some("ACTIVE".to_string()),
            source_code: Some("SURVEY".to_string()),
            geometry: Geometry::new(cells),
            last_edited_by: None,
            last_edited_at: None,
        }
    }

    #[test]
    fn test_line_changes() {
        let baseline = vec![line("kept", "a"), line("moved", "b"), line("gone", "c")];
        let mut touched = line("kept", "a");
        touched.last_edited_by = Some("editor".to_string());
        let current = vec![touched, line("moved", "b,x"), line("new", "d")];

        let changes = line_changes(&current, &baseline);
        assert_eq!(
            changes,
            vec![
                LineChange { feature_key: "moved".to_string(), kind: LineChangeKind::Modified },
                LineChange { feature_key: "new".to_string(), kind: LineChangeKind::Added },
                LineChange { feature_key: "gone".to_string(), kind: LineChangeKind::Removed },
            ]
        );
    }

    #[test]
    fn test_review_artifacts_saved_outside_data() {
        let temp = TempDir::new().unwrap();
        let location = UnitLocation::new(Stage::Review, temp.path().join("TFL_49"));
        std::fs::create_dir_all(location.path()).unwrap();
        let mut baseline = UnitPackage::new(UnitId::new("TFL_49").unwrap());
        baseline.boundary.push(BoundaryPolygon {
            feature_key: "P1".to_string(),
            poly_type: Some("Current_View".to_string()),
            legislative_tool: None,
            geometry: Geometry::new("a"),
        });
        let mut current = baseline.clone();
        current.boundary[0].geometry = Geometry::new("a,b");

        let artifacts = ReviewArtifacts::compute(&CellGeometryEngine, &current, &baseline).unwrap();
        assert_eq!(artifacts.polygon_diff.added.len(), 1);

        let path = artifacts.save(&location).unwrap();
        assert_eq!(path, location.path().join("artifacts").join("review.json"));
        assert!(path.exists());
    }

    #[test]
    fn test_baseline_advisory() {
        let mut baseline = UnitPackage::new(UnitId::new("TFL_49").unwrap());
        baseline.boundary.push(BoundaryPolygon {
            feature_key: "P1".to_string(),
            poly_type: Some("Current_View".to_string()),
            legislative_tool: None,
            geometry: Geometry::new("a"),
        });
        let snapshot = RecordSnapshot {
            current_view: vec![RecordFeature {
                key: "TFL 49".to_string(),
                feature_key: "P1".to_string(),
                geometry: Geometry::new("a"),
                retired_at: None,
            }],
            schedule_a: Vec::new(),
        };

        let advisory =
            BaselineAdvisory::compute(&CellGeometryEngine, &snapshot, &baseline).unwrap();
        assert!(advisory.is_empty());
        assert!(advisory.findings().is_empty());

        let empty = RecordSnapshot::new();
        let advisory = BaselineAdvisory::compute(&CellGeometryEngine, &empty, &baseline).unwrap();
        assert_eq!(advisory.findings().len(), 1);
    }
}
