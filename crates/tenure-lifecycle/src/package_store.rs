//! Reading and writing the typed unit package

use crate::error::{LifecycleError, LifecycleResult};
use crate::models::UnitPackage;
use std::path::{Path, PathBuf};
use tenure_storage::{IoOperation, StorageError, StorageResult, UnitLocation};
use tracing::debug;

/// Package file relative to the unit root
pub const PACKAGE_FILE: &str = "data/package.json";

/// Storage of unit packages
pub trait PackageStore: Send + Sync {
    /// Load the package at a location
    fn load(&self, location: &UnitLocation) -> LifecycleResult<UnitPackage>;

    /// Replace the package at a location
    fn save(&self, location: &UnitLocation, package: &UnitPackage) -> LifecycleResult<()>;
}

/// Package stored as pretty JSON under `data/`
#[derive(Debug, Clone, Default)]
pub struct FsPackageStore;

impl FsPackageStore {
    /// Create a filesystem package store
    pub fn new() -> Self {
        Self
    }

    /// Path of the package inside a unit tree
    pub fn package_path(location: &UnitLocation) -> PathBuf {
        location.path().join(PACKAGE_FILE)
    }
}

impl PackageStore for FsPackageStore {
    fn load(&self, location: &UnitLocation) -> LifecycleResult<UnitPackage> {
        let path = Self::package_path(location);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| StorageError::io_error(path.clone(), IoOperation::Read, e))?;

        serde_json::from_str(&content).map_err(|e| {
            LifecycleError::Serialization(format!(
                "Failed to parse unit package {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn save(&self, location: &UnitLocation, package: &UnitPackage) -> LifecycleResult<()> {
        let path = Self::package_path(location);
        let json = serde_json::to_string_pretty(package).map_err(|e| {
            LifecycleError::Serialization(format!("Failed to serialize unit package: {}", e))
        })?;

        write_atomic(&path, json.as_bytes())?;
        debug!("Saved package for {} at {}", package.unit_id, path.display());
        Ok(())
    }
}

/// Write a file inside an existing unit tree
///
/// Fails when the unit root is gone, so a write that races a relocation never
/// recreates the unit in the stage it just left.
pub(crate) fn write_in_unit(
    location: &UnitLocation,
    path: &Path,
    content: &[u8],
) -> StorageResult<()> {
    if !location.path().is_dir() {
        return Err(StorageError::UnitTreeMissing {
            path: location.path().to_path_buf(),
        });
    }
    write_atomic(path, content)
}

/// Write through a `.tmp` sibling and rename over the target
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StorageError::directory_creation_failed(parent.to_path_buf(), e))?;
    }

    let mut temp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    std::fs::write(&temp_path, content)
        .map_err(|e| StorageError::io_error(temp_path.clone(), IoOperation::Write, e))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| StorageError::io_error(path.to_path_buf(), IoOperation::Move, e))?;
    Ok(())
}
