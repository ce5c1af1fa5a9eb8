//! Identity types shared by every layer: units, stages, locations and actors

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Business key of a work unit, e.g. `TFL_49`
///
/// The key doubles as the directory name of the unit inside each stage root,
/// so it must be a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UnitId(String);

impl UnitId {
    /// Validate and wrap a unit key
    pub fn new(key: impl Into<String>) -> StorageResult<Self> {
        let key = key.into();
        let trimmed = key.trim();

        if trimmed.is_empty() {
            return Err(StorageError::validation_error("unit_id", "Unit id cannot be empty"));
        }

        if trimmed != key {
            return Err(StorageError::validation_error(
                "unit_id",
                format!("Unit id '{}' has surrounding whitespace", key),
            ));
        }

        if key == "." || key == ".." || key.contains(['/', '\\', ':']) {
            return Err(StorageError::validation_error(
                "unit_id",
                format!("Unit id '{}' is not a single path component", key),
            ));
        }

        Ok(Self(key))
    }

    /// The key as written
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Forest file id used by the warehouse schedule and change datasets
    ///
    /// `TFL_01` becomes `TFL1`, `TFL_49` becomes `TFL49`.
    pub fn forest_file_id(&self) -> String {
        if self.0.contains("_0") {
            self.0.replacen("_0", "", 1)
        } else {
            self.0.replace('_', "")
        }
    }

    /// Key of the unit in the published current-view boundary, e.g. `TFL 49`
    pub fn current_view_key(&self) -> String {
        self.0.replace('_', " ")
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UnitId {
    type Error = StorageError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        UnitId::new(value)
    }
}

impl From<UnitId> for String {
    fn from(id: UnitId) -> Self {
        id.0
    }
}

/// Custody stage of a work unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Authoritative published version
    Baseline,
    /// Checked out for edits
    Editing,
    /// Awaiting peer review
    Review,
    /// Approved, awaiting publication
    Pending,
}

impl Stage {
    /// Every stage in lifecycle order
    pub const ALL: [Stage; 4] = [Stage::Baseline, Stage::Editing, Stage::Review, Stage::Pending];

    /// Stages that hold a checked-out unit
    pub const IN_FLIGHT: [Stage; 3] = [Stage::Editing, Stage::Review, Stage::Pending];

    /// Whether a unit in this stage is checked out
    pub fn is_in_flight(self) -> bool {
        !matches!(self, Stage::Baseline)
    }

    /// Stage reached by the forward transition out of this one
    pub fn next(self) -> Stage {
        match self {
            Stage::Baseline => Stage::Editing,
            Stage::Editing => Stage::Review,
            Stage::Review => Stage::Pending,
            Stage::Pending => Stage::Baseline,
        }
    }

    /// Lowercase name used in logs and records
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Baseline => "baseline",
            Stage::Editing => "editing",
            Stage::Review => "review",
            Stage::Pending => "pending",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a unit currently resides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitLocation {
    /// Stage the location belongs to
    pub stage: Stage,
    /// Root of the unit's storage tree
    pub path: PathBuf,
}

impl UnitLocation {
    /// Create a location handle
    pub fn new(stage: Stage, path: impl Into<PathBuf>) -> Self {
        Self {
            stage,
            path: path.into(),
        }
    }

    /// Root of the unit's storage tree
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Identity of a person or process acting on a unit
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    /// Wrap an actor name; names compare case-insensitively
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().trim().to_lowercase())
    }

    /// Normalized actor name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Actor {
    fn from(name: &str) -> Self {
        Actor::new(name)
    }
}

/// Root directory of each stage plus the archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRoots {
    pub baseline: PathBuf,
    pub editing: PathBuf,
    pub review: PathBuf,
    pub pending: PathBuf,
    pub archive: PathBuf,
}

impl StageRoots {
    /// Standard stage folder layout under a single root
    pub fn under(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            baseline: root.join("1_TFL_Final"),
            editing: root.join("2_TFL_Working"),
            review: root.join("3_TFL_Review"),
            pending: root.join("4_TFL_Pending"),
            archive: root.join("5_TFL_Archive"),
        }
    }

    /// Root directory of a stage
    pub fn root_for(&self, stage: Stage) -> &Path {
        match stage {
            Stage::Baseline => &self.baseline,
            Stage::Editing => &self.editing,
            Stage::Review => &self.review,
            Stage::Pending => &self.pending,
        }
    }

    /// Location a unit occupies (or would occupy) in a stage
    pub fn location(&self, unit: &UnitId, stage: Stage) -> UnitLocation {
        UnitLocation::new(stage, self.root_for(stage).join(unit.as_str()))
    }
}
