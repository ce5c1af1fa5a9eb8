//! Resolving a unit id to the stage location it occupies

use crate::error::{IoOperation, StorageError, StorageResult};
use crate::types::{Stage, StageRoots, UnitId, UnitLocation};
use std::fs;
use tracing::debug;

/// Resolves unit ids to stage locations
///
/// The locator only reports what exists. Enforcing that a unit is in exactly
/// one in-flight stage is the caller's job.
pub trait UnitLocator: Send + Sync {
    /// Current location of a unit, preferring an in-flight stage over baseline
    fn locate(&self, unit: &UnitId) -> StorageResult<Option<UnitLocation>>;

    /// Every stage in which the unit currently exists, in lifecycle order
    fn enumerate_conflicts(&self, unit: &UnitId) -> StorageResult<Vec<Stage>>;

    /// Location the unit would occupy in a stage, whether or not it exists
    fn location_for(&self, unit: &UnitId, stage: Stage) -> UnitLocation;

    /// Root directory that receives archived baselines
    fn archive_root(&self) -> &std::path::Path;
}

/// Locator over the stage directory layout
#[derive(Debug, Clone)]
pub struct FsUnitLocator {
    roots: StageRoots,
}

impl FsUnitLocator {
    /// Create a locator over the given stage roots
    pub fn new(roots: StageRoots) -> Self {
        Self { roots }
    }

    /// Stage roots this locator searches
    pub fn roots(&self) -> &StageRoots {
        &self.roots
    }

    fn exists_in(&self, unit: &UnitId, stage: Stage) -> StorageResult<bool> {
        let path = self.roots.root_for(stage).join(unit.as_str());
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io_error(path, IoOperation::Read, e)),
        }
    }
}

impl UnitLocator for FsUnitLocator {
    fn locate(&self, unit: &UnitId) -> StorageResult<Option<UnitLocation>> {
        for stage in Stage::IN_FLIGHT {
            if self.exists_in(unit, stage)? {
                debug!("Located {} in {}", unit, stage);
                return Ok(Some(self.roots.location(unit, stage)));
            }
        }

        if self.exists_in(unit, Stage::Baseline)? {
            debug!("Located {} in baseline", unit);
            return Ok(Some(self.roots.location(unit, Stage::Baseline)));
        }

        Ok(None)
    }

    fn enumerate_conflicts(&self, unit: &UnitId) -> StorageResult<Vec<Stage>> {
        let mut stages = Vec::new();
        for stage in Stage::ALL {
            if self.exists_in(unit, stage)? {
                stages.push(stage);
            }
        }
        Ok(stages)
    }

    fn location_for(&self, unit: &UnitId, stage: Stage) -> UnitLocation {
        self.roots.location(unit, stage)
    }

    fn archive_root(&self) -> &std::path::Path {
        &self.roots.archive
    }
}
