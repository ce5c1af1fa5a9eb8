//! Capabilities the lifecycle consumes from outside systems
//!
//! Geometry construction, domain enumeration and the warehouse system of
//! record are external. The engine only sees pass/fail answers and feature
//! sets through these traits.

use crate::models::{Feature, FeatureSet, Geometry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tenure_storage::{IoOperation, StorageError};
use thiserror::Error;

/// Failure reported by an external collaborator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{collaborator} failed during {operation}: {message}")]
pub struct CollaboratorError {
    /// Which collaborator failed
    pub collaborator: String,
    /// Operation that failed
    pub operation: String,
    /// Collaborator's message
    pub message: String,
}

impl CollaboratorError {
    /// Create a collaborator error
    pub fn new(
        collaborator: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            collaborator: collaborator.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }
}

/// Topology rules evaluated over active linework
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyRule {
    /// Lines must not overlap each other
    MustNotOverlap,
    /// Lines must not cross each other
    MustNotIntersect,
    /// Line ends must connect
    MustNotHaveDangles,
    /// A line must not overlap itself
    MustNotSelfOverlap,
    /// A line must not cross itself
    MustNotSelfIntersect,
    /// Each line is a single part
    MustBeSinglePart,
}

impl TopologyRule {
    /// Rule set applied to boundary linework
    pub const BOUNDARY_RULES: [TopologyRule; 6] = [
        TopologyRule::MustNotOverlap,
        TopologyRule::MustNotIntersect,
        TopologyRule::MustNotHaveDangles,
        TopologyRule::MustNotSelfOverlap,
        TopologyRule::MustNotSelfIntersect,
        TopologyRule::MustBeSinglePart,
    ];
}

impl fmt::Display for TopologyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopologyRule::MustNotOverlap => "Must Not Overlap",
            TopologyRule::MustNotIntersect => "Must Not Intersect",
            TopologyRule::MustNotHaveDangles => "Must Not Have Dangles",
            TopologyRule::MustNotSelfOverlap => "Must Not Self-Overlap",
            TopologyRule::MustNotSelfIntersect => "Must Not Self-Intersect",
            TopologyRule::MustBeSinglePart => "Must Be Single Part",
        };
        f.write_str(name)
    }
}

/// Parameters for building a topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySpec {
    /// Rules to evaluate
    pub rules: Vec<TopologyRule>,
    /// Snapping tolerance in map units
    pub cluster_tolerance: f64,
}

impl TopologySpec {
    /// Boundary rule set at the given tolerance
    pub fn boundary(cluster_tolerance: f64) -> Self {
        Self {
            rules: TopologyRule::BOUNDARY_RULES.to_vec(),
            cluster_tolerance,
        }
    }
}

/// Handle to a topology built by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Engine-assigned identifier
    pub id: String,
    /// Rules the topology was built with
    pub rules: Vec<TopologyRule>,
    /// Features the topology was built over
    pub features: FeatureSet,
}

/// One topology error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleViolation {
    /// Broken rule
    pub rule: TopologyRule,
    /// Offending feature, when the engine can name one
    pub feature_key: Option<String>,
    /// Engine description
    pub description: String,
}

/// Geometry construction and spatial analysis
pub trait GeometryEngine: Send + Sync {
    /// Build a topology over linework
    fn build_topology(
        &self,
        lines: &FeatureSet,
        spec: &TopologySpec,
    ) -> Result<Topology, CollaboratorError>;

    /// Evaluate a built topology's rules
    fn validate_topology(
        &self,
        topology: &Topology,
    ) -> Result<Vec<RuleViolation>, CollaboratorError>;

    /// Number of polygons the linework closes into
    fn build_polygons(&self, lines: &FeatureSet) -> Result<usize, CollaboratorError>;

    /// Parts of `a` not covered by `b`
    fn spatial_difference(&self, a: &FeatureSet, b: &FeatureSet)
        -> Result<FeatureSet, CollaboratorError>;

    /// Whether `container` covers all of `contained`
    fn contains(&self, container: &FeatureSet, contained: &FeatureSet)
        -> Result<bool, CollaboratorError>;

    /// Parts of `a` that overlap `b`
    fn intersects(&self, a: &FeatureSet, b: &FeatureSet) -> Result<FeatureSet, CollaboratorError>;
}

/// Enumerated attribute domains
pub trait DomainCatalog: Send + Sync {
    /// Allowed values of a field, or `None` when the field is not governed
    fn enumerated_values(&self, field: &str) -> Option<BTreeSet<String>>;
}

/// Domain catalog with fixed values, typically from configuration
///
/// Field names match case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct StaticDomainCatalog {
    domains: BTreeMap<String, BTreeSet<String>>,
}

impl StaticDomainCatalog {
    /// Build from field → values pairs
    pub fn new<I, F, V>(domains: I) -> Self
    where
        I: IntoIterator<Item = (F, V)>,
        F: AsRef<str>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|(field, values)| {
                    (
                        field.as_ref().to_lowercase(),
                        values.into_iter().map(Into::into).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Governed field names, lowercased
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }
}

impl DomainCatalog for StaticDomainCatalog {
    fn enumerated_values(&self, field: &str) -> Option<BTreeSet<String>> {
        self.domains.get(&field.to_lowercase()).cloned()
    }
}

/// A published feature in the warehouse system of record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFeature {
    /// Unit key the feature is filed under
    pub key: String,
    /// Feature identifier
    pub feature_key: String,
    /// Feature geometry
    pub geometry: Geometry,
    /// Set when the feature has been retired
    #[serde(default)]
    pub retired_at: Option<DateTime<Utc>>,
}

impl RecordFeature {
    fn to_feature(&self) -> Feature {
        Feature::new(self.feature_key.clone(), self.geometry.clone())
    }
}

/// Read access to the external system of record
pub trait SystemOfRecord: Send + Sync {
    /// Published current-view boundary filed under a current-view key
    fn current_view(&self, current_view_key: &str) -> Result<FeatureSet, CollaboratorError>;

    /// Non-retired Schedule A filed under a forest file id
    fn schedule_a(&self, forest_file_id: &str) -> Result<FeatureSet, CollaboratorError>;

    /// Current-view boundaries of every other unit
    fn other_boundaries(&self, current_view_key: &str) -> Result<FeatureSet, CollaboratorError>;
}

/// System-of-record snapshot held in memory, loadable from a JSON extract
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// Published current-view boundary features
    #[serde(default)]
    pub current_view: Vec<RecordFeature>,
    /// Published Schedule A features
    #[serde(default)]
    pub schedule_a: Vec<RecordFeature>,
}

impl RecordSnapshot {
    /// Empty snapshot
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot from a JSON extract
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StorageError::io_error(path.to_path_buf(), IoOperation::Read, e))?;
        serde_json::from_str(&content)
            .map_err(|e| StorageError::parse_error(path.to_path_buf(), "JSON", e.to_string()))
    }

    fn select(features: &[RecordFeature], keep: impl Fn(&RecordFeature) -> bool) -> FeatureSet {
        features
            .iter()
            .filter(|f| keep(f))
            .map(RecordFeature::to_feature)
            .collect()
    }
}

impl SystemOfRecord for RecordSnapshot {
    fn current_view(&self, current_view_key: &str) -> Result<FeatureSet, CollaboratorError> {
        Ok(Self::select(&self.current_view, |f| {
            f.key == current_view_key && f.retired_at.is_none()
        }))
    }

    fn schedule_a(&self, forest_file_id: &str) -> Result<FeatureSet, CollaboratorError> {
        Ok(Self::select(&self.schedule_a, |f| {
            f.key == forest_file_id && f.retired_at.is_none()
        }))
    }

    fn other_boundaries(&self, current_view_key: &str) -> Result<FeatureSet, CollaboratorError> {
        Ok(Self::select(&self.current_view, |f| {
            f.key != current_view_key && f.retired_at.is_none()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, feature: &str, retired: bool) -> RecordFeature {
        RecordFeature {
            key: key.to_string(),
            feature_key: feature.to_string(),
            geometry: Geometry::new(feature),
            retired_at: if retired { Some(Utc::now()) } else { None },
        }
    }

    #[test]
    fn test_static_catalog_is_case_insensitive() {
        let catalog = StaticDomainCatalog::new([("Status_Code", vec!["ACTIVE", "RETIRED"])]);
        let values = catalog.enumerated_values("STATUS_CODE").unwrap();
        assert!(values.contains("ACTIVE"));
        assert!(catalog.enumerated_values("Legal_Description").is_none());
    }

    #[test]
    fn test_schedule_a_skips_retired() {
        let snapshot = RecordSnapshot {
            current_view: Vec::new(),
            schedule_a: vec![
                record("TFL49", "live", false),
                record("TFL49", "old", true),
                record("TFL12", "other", false),
            ],
        };

        let features = snapshot.schedule_a("TFL49").unwrap();
        assert_eq!(features.keys(), vec!["live"]);
    }

    #[test]
    fn test_other_boundaries_excludes_own_key() {
        let snapshot = RecordSnapshot {
            current_view: vec![
                record("TFL 49", "own", false),
                record("TFL 12", "neighbour", false),
            ],
            schedule_a: Vec::new(),
        };

        assert_eq!(snapshot.current_view("TFL 49").unwrap().keys(), vec!["own"]);
        assert_eq!(snapshot.other_boundaries("TFL 49").unwrap().keys(), vec!["neighbour"]);
    }

    #[test]
    fn test_snapshot_load() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("record.json");
        let snapshot = RecordSnapshot {
            current_view: vec![record("TFL 49", "own", false)],
            schedule_a: Vec::new(),
        };
        std::fs::write(&path, serde_json::to_string(&snapshot).unwrap()).unwrap();

        assert_eq!(RecordSnapshot::load(&path).unwrap(), snapshot);
        assert!(RecordSnapshot::load(&temp.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_rule_names() {
        assert_eq!(TopologyRule::MustNotHaveDangles.to_string(), "Must Not Have Dangles");
        assert_eq!(TopologySpec::boundary(0.0001).rules.len(), 6);
    }
}
