//! Core data models for boundary-change work units

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tenure_storage::{Actor, Stage, UnitId, UnitLocation};

/// Status code of a line that forms part of the current boundary
pub const STATUS_ACTIVE: &str = "ACTIVE";

/// Status code of a line kept for the record of a removed boundary segment
pub const STATUS_RETIRED: &str = "RETIRED";

/// Geometry in the encoding understood by the configured geometry engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Geometry(pub String);

impl Geometry {
    /// Wrap an encoded geometry
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encoded form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A keyed geometry passed to and from the geometry engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    /// Feature identifier within its dataset
    pub key: String,
    /// Feature geometry
    pub geometry: Geometry,
}

impl Feature {
    /// Create a feature
    pub fn new(key: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            key: key.into(),
            geometry,
        }
    }
}

/// Ordered collection of features
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSet {
    /// Member features
    pub features: Vec<Feature>,
}

impl FeatureSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the set has no features
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Number of features
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Iterate features
    pub fn iter(&self) -> std::slice::Iter<'_, Feature> {
        self.features.iter()
    }

    /// Feature keys in set order
    pub fn keys(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.key.as_str()).collect()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self {
            features: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for FeatureSet {
    type Item = Feature;
    type IntoIter = std::vec::IntoIter<Feature>;

    fn into_iter(self) -> Self::IntoIter {
        self.features.into_iter()
    }
}

/// Classification tag of a boundary polygon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PolyType {
    /// Unchanged part of the current boundary
    #[serde(rename = "Current_View")]
    CurrentView,
    /// Area added to the licence
    #[serde(rename = "Addition")]
    Addition,
    /// Area removed from the licence
    #[serde(rename = "Deletion")]
    Deletion,
    /// Boundary replaced wholesale by a new agreement
    #[serde(rename = "Replacement")]
    Replacement,
}

impl PolyType {
    /// Every tag
    pub const ALL: [PolyType; 4] = [
        PolyType::CurrentView,
        PolyType::Addition,
        PolyType::Deletion,
        PolyType::Replacement,
    ];

    /// Attribute value as stored
    pub fn as_str(self) -> &'static str {
        match self {
            PolyType::CurrentView => "Current_View",
            PolyType::Addition => "Addition",
            PolyType::Deletion => "Deletion",
            PolyType::Replacement => "Replacement",
        }
    }

    /// Parse a stored attribute value
    pub fn parse(value: &str) -> Option<PolyType> {
        PolyType::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for PolyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One boundary line segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRecord {
    /// Feature identifier
    pub feature_key: String,
    /// Legal description of the segment
    #[serde(default)]
    pub legal_description: Option<String>,
    /// `ACTIVE` or `RETIRED`
    #[serde(default)]
    pub status_code: Option<String>,
    /// Source of the linework
    #[serde(default)]
    pub source_code: Option<String>,
    /// Segment geometry
    pub geometry: Geometry,
    /// Editor tracking: who last touched the segment
    #[serde(default)]
    pub last_edited_by: Option<String>,
    /// Editor tracking: when the segment was last touched
    #[serde(default)]
    pub last_edited_at: Option<DateTime<Utc>>,
}

impl LineRecord {
    /// Whether the line is part of the current boundary
    pub fn is_active(&self) -> bool {
        self.status_code.as_deref() == Some(STATUS_ACTIVE)
    }

    /// Whether the line is active or retired
    pub fn is_buildable(&self) -> bool {
        matches!(
            self.status_code.as_deref(),
            Some(STATUS_ACTIVE) | Some(STATUS_RETIRED)
        )
    }

    /// Geometry as an engine feature
    pub fn to_feature(&self) -> Feature {
        Feature::new(self.feature_key.clone(), self.geometry.clone())
    }
}

/// One polygon of the unit boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryPolygon {
    /// Feature identifier
    pub feature_key: String,
    /// Classification tag as stored; may be missing or out of domain
    #[serde(default)]
    pub poly_type: Option<String>,
    /// Legal instrument that effected the change
    #[serde(default)]
    pub legislative_tool: Option<String>,
    /// Polygon geometry
    pub geometry: Geometry,
}

impl BoundaryPolygon {
    /// Parsed classification tag
    pub fn tag(&self) -> Option<PolyType> {
        self.poly_type.as_deref().and_then(PolyType::parse)
    }

    /// Geometry as an engine feature
    pub fn to_feature(&self) -> Feature {
        Feature::new(self.feature_key.clone(), self.geometry.clone())
    }
}

/// One Schedule A feature (the secondary schedule)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleAFeature {
    /// Feature identifier
    pub feature_key: String,
    /// Forest file id the schedule belongs to
    #[serde(default)]
    pub forest_file_id: Option<String>,
    /// Feature geometry
    pub geometry: Geometry,
}

impl ScheduleAFeature {
    /// Geometry as an engine feature
    pub fn to_feature(&self) -> Feature {
        Feature::new(self.feature_key.clone(), self.geometry.clone())
    }
}

/// Record of a checkout in the unit's change history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeHistoryEntry {
    /// When the unit was extracted from baseline
    pub extracted_at: DateTime<Utc>,
    /// Who extracted it
    pub extracted_by: Actor,
}

/// Typed contents of a unit's storage tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitPackage {
    /// Unit this package belongs to
    pub unit_id: UnitId,
    /// Boundary linework
    #[serde(default)]
    pub lines: Vec<LineRecord>,
    /// Boundary polygons built from the linework
    #[serde(default)]
    pub boundary: Vec<BoundaryPolygon>,
    /// Schedule A features
    #[serde(default)]
    pub schedule_a: Vec<ScheduleAFeature>,
    /// Checkout history across cycles
    #[serde(default)]
    pub change_history: Vec<ChangeHistoryEntry>,
    /// Package-level modification stamp
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

impl UnitPackage {
    /// Empty package for a unit
    pub fn new(unit_id: UnitId) -> Self {
        Self {
            unit_id,
            lines: Vec::new(),
            boundary: Vec::new(),
            schedule_a: Vec::new(),
            change_history: Vec::new(),
            modified_at: None,
        }
    }

    /// Latest of the package stamp and every line's editor-tracking stamp
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.lines
            .iter()
            .filter_map(|l| l.last_edited_at)
            .chain(self.modified_at)
            .max()
    }

    /// Most recent checkout
    pub fn latest_extraction(&self) -> Option<&ChangeHistoryEntry> {
        self.change_history.iter().max_by_key(|e| e.extracted_at)
    }

    /// Active lines as engine features
    pub fn active_lines(&self) -> FeatureSet {
        self.lines
            .iter()
            .filter(|l| l.is_active())
            .map(LineRecord::to_feature)
            .collect()
    }

    /// Active and retired lines as engine features
    pub fn buildable_lines(&self) -> FeatureSet {
        self.lines
            .iter()
            .filter(|l| l.is_buildable())
            .map(LineRecord::to_feature)
            .collect()
    }

    /// Polygons carrying one of the given tags
    pub fn polygons_tagged(&self, tags: &[PolyType]) -> Vec<&BoundaryPolygon> {
        self.boundary
            .iter()
            .filter(|p| p.tag().map(|t| tags.contains(&t)).unwrap_or(false))
            .collect()
    }

    /// Resulting licence boundary: every polygon not tagged as a deletion
    pub fn resulting_boundary(&self) -> FeatureSet {
        self.boundary
            .iter()
            .filter(|p| p.tag() != Some(PolyType::Deletion))
            .map(BoundaryPolygon::to_feature)
            .collect()
    }

    /// Schedule A as engine features
    pub fn schedule_a_features(&self) -> FeatureSet {
        self.schedule_a.iter().map(ScheduleAFeature::to_feature).collect()
    }

    /// Distinct legal instruments named by the polygons
    pub fn instruments(&self) -> BTreeSet<String> {
        self.boundary
            .iter()
            .filter_map(|p| p.legislative_tool.clone())
            .filter(|t| !t.trim().is_empty())
            .collect()
    }

    /// Fold the previous cycle's change tags into the current view
    ///
    /// Deletions leave the boundary; additions and replacements become
    /// untagged current view with no instrument. Polygons with a missing or
    /// unknown tag are kept as they are. Returns how many polygons changed.
    pub fn settle_boundary(&mut self) -> usize {
        let before = self.boundary.len();
        self.boundary.retain(|p| p.tag() != Some(PolyType::Deletion));
        let mut settled = before - self.boundary.len();

        for polygon in &mut self.boundary {
            if matches!(polygon.tag(), Some(PolyType::Addition | PolyType::Replacement)) {
                polygon.poly_type = Some(PolyType::CurrentView.as_str().to_string());
                polygon.legislative_tool = None;
                settled += 1;
            }
        }
        settled
    }
}

/// A work unit as seen by callers of the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Business key
    pub id: UnitId,
    /// Current stage
    pub stage: Stage,
    /// Current storage location
    pub location: UnitLocation,
    /// When the unit was checked out
    pub extracted_at: Option<DateTime<Utc>>,
    /// Latest modification of the unit's data
    pub last_modified: Option<DateTime<Utc>>,
}

impl WorkUnit {
    /// Build the view of a unit from its location and package
    pub fn from_package(location: UnitLocation, package: &UnitPackage) -> Self {
        Self {
            id: package.unit_id.clone(),
            stage: location.stage,
            location,
            extracted_at: package.latest_extraction().map(|e| e.extracted_at),
            last_modified: package.last_modified(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn line(key: &str, status: Option<&str>) -> LineRecord {
        LineRecord {
            feature_key: key.to_string(),
            legal_description: Some("desc".to_string()),
            status_code: status.map(str::to_string),
            source_code: Some("SURVEY".to_string()),
            geometry: Geometry::new(key),
            last_edited_by: None,
            last_edited_at: None,
        }
    }

    fn polygon(key: &str, tag: Option<&str>) -> BoundaryPolygon {
        BoundaryPolygon {
            feature_key: key.to_string(),
            poly_type: tag.map(str::to_string),
            legislative_tool: None,
            geometry: Geometry::new(key),
        }
    }

    #[test]
    fn test_poly_type_parse() {
        assert_eq!(PolyType::parse("Replacement"), Some(PolyType::Replacement));
        assert_eq!(PolyType::parse("replacement"), None);
        for tag in PolyType::ALL {
            assert_eq!(PolyType::parse(tag.as_str()), Some(tag));
        }
    }

    #[test]
    fn test_line_filters() {
        let mut package = UnitPackage::new(UnitId::new("TFL_49").unwrap());
        package.lines = vec![
            line("a", Some(STATUS_ACTIVE)),
            line("b", Some(STATUS_RETIRED)),
            line("c", None),
            line("d", Some("PROPOSED")),
        ];

        assert_eq!(package.active_lines().keys(), vec!["a"]);
        assert_eq!(package.buildable_lines().keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_last_modified_uses_editor_tracking() {
        let mut package = UnitPackage::new(UnitId::new("TFL_49").unwrap());
        assert!(package.last_modified().is_none());

        let base = Utc::now();
        package.modified_at = Some(base);
        let mut edited = line("a", Some(STATUS_ACTIVE));
        edited.last_edited_at = Some(base + Duration::seconds(30));
        package.lines.push(edited);

        assert_eq!(package.last_modified(), Some(base + Duration::seconds(30)));
    }

    #[test]
    fn test_resulting_boundary_drops_deletions() {
        let mut package = UnitPackage::new(UnitId::new("TFL_49").unwrap());
        package.boundary = vec![
            polygon("keep", Some("Current_View")),
            polygon("gone", Some("Deletion")),
            polygon("new", Some("Addition")),
            polygon("untagged", None),
        ];

        assert_eq!(package.resulting_boundary().keys(), vec!["keep", "new", "untagged"]);
        assert_eq!(package.polygons_tagged(&[PolyType::Addition]).len(), 1);
    }

    #[test]
    fn test_instruments_ignore_blank() {
        let mut package = UnitPackage::new(UnitId::new("TFL_49").unwrap());
        let mut a = polygon("a", Some("Addition"));
        a.legislative_tool = Some("OIC 123".to_string());
        let mut b = polygon("b", Some("Addition"));
        b.legislative_tool = Some("  ".to_string());
        package.boundary = vec![a, b, polygon("c", Some("Current_View"))];

        assert_eq!(package.instruments().len(), 1);
    }

    #[test]
    fn test_settle_boundary_keeps_resulting_boundary() {
        let mut package = UnitPackage::new(UnitId::new("TFL_49").unwrap());
        let mut added = polygon("new", Some("Addition"));
        added.legislative_tool = Some("OIC 123".to_string());
        package.boundary = vec![
            polygon("keep", Some("Current_View")),
            polygon("gone", Some("Deletion")),
            added,
            polygon("untagged", None),
        ];
        let resulting = package.resulting_boundary();

        assert_eq!(package.settle_boundary(), 2);
        assert_eq!(package.resulting_boundary(), resulting);
        assert!(package.polygons_tagged(&[PolyType::Addition, PolyType::Deletion]).is_empty());
        assert!(package.instruments().is_empty());
        assert_eq!(package.boundary[2].poly_type, None);

        assert_eq!(package.settle_boundary(), 0);
    }
}
