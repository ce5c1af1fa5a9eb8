//! Moving unit storage trees between stages
//!
//! Relocation is an atomic rename when source and target share a filesystem,
//! falling back to copy, verify, delete otherwise. Archived baselines are
//! moved, never deleted.

use crate::error::{IoOperation, StorageError, StorageResult};
use std::fs::{self, Permissions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Suffix of partially written files left by an interrupted write
const TEMP_SUFFIX: &str = ".tmp";

/// Probe file used to check a directory is writable
const PREFLIGHT_MARKER: &str = ".tenure_preflight";

/// Storage tree operations used by lifecycle transitions
pub trait StorageRelocator: Send + Sync {
    /// Move a unit's tree to a new location
    fn relocate(&self, from: &Path, to: &Path) -> StorageResult<()>;

    /// Copy a unit's tree, leaving the source in place
    fn copy_tree(&self, from: &Path, to: &Path) -> StorageResult<()>;

    /// Move a tree under the archive root as `archive_key`, returning its new path
    fn archive(&self, location: &Path, archive_key: &str) -> StorageResult<PathBuf>;

    /// Remove a partially created tree after a failed transition
    fn discard(&self, location: &Path) -> StorageResult<()>;

    /// Check that moving `from` next to `to` can succeed, without moving anything
    fn preflight(&self, from: &Path, to: &Path) -> StorageResult<()>;

    /// Flush transient state this process left in a location
    fn compact(&self, location: &Path) -> StorageResult<()>;

    /// Make the unit's data read-only
    fn seal(&self, location: &Path) -> StorageResult<()>;

    /// Make the unit's data writable again
    fn unseal(&self, location: &Path) -> StorageResult<()>;
}

/// Relocator over plain directories
#[derive(Debug, Clone)]
pub struct FsRelocator {
    archive_root: PathBuf,
    sealed_dir: PathBuf,
}

impl FsRelocator {
    /// Create a relocator archiving under `archive_root`
    pub fn new(archive_root: impl Into<PathBuf>) -> Self {
        Self {
            archive_root: archive_root.into(),
            sealed_dir: PathBuf::from("data"),
        }
    }

    /// Subdirectory of a unit tree that seal/unseal applies to
    pub fn with_sealed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sealed_dir = dir.into();
        self
    }

    /// Archive root
    pub fn archive_root(&self) -> &Path {
        &self.archive_root
    }

    fn validate_source(from: &Path, to: &Path) -> StorageResult<()> {
        if !from.is_dir() {
            return Err(StorageError::relocation_error(
                from.to_path_buf(),
                to.to_path_buf(),
                "Source directory does not exist",
            ));
        }
        Ok(())
    }

    fn validate_target(from: &Path, to: &Path) -> StorageResult<()> {
        if to.exists() {
            if to.is_dir() {
                let mut entries = fs::read_dir(to)
                    .map_err(|e| StorageError::io_error(to.to_path_buf(), IoOperation::Read, e))?;

                if entries.next().is_some() {
                    return Err(StorageError::relocation_error(
                        from.to_path_buf(),
                        to.to_path_buf(),
                        "Target directory is not empty",
                    ));
                }
            } else {
                return Err(StorageError::relocation_error(
                    from.to_path_buf(),
                    to.to_path_buf(),
                    "Target path exists and is not a directory",
                ));
            }
        }
        Ok(())
    }

    fn ensure_parent(to: &Path) -> StorageResult<()> {
        if let Some(parent) = to.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .map_err(|e| StorageError::directory_creation_failed(parent.to_path_buf(), e))?;
            }
        }
        Ok(())
    }

    fn walk_error(err: walkdir::Error) -> StorageError {
        let path = err.path().map(Path::to_path_buf).unwrap_or_default();
        StorageError::io_error(path, IoOperation::Read, err.into())
    }

    /// Copy directory recursively
    fn copy_dir_recursive(src: &Path, dst: &Path) -> StorageResult<()> {
        fs::create_dir_all(dst)
            .map_err(|e| StorageError::directory_creation_failed(dst.to_path_buf(), e))?;

        for entry in WalkDir::new(src).min_depth(1) {
            let entry = entry.map_err(Self::walk_error)?;
            let relative = entry.path().strip_prefix(src).map_err(|_| {
                StorageError::relocation_error(
                    src.to_path_buf(),
                    dst.to_path_buf(),
                    format!("{} escapes the source tree", entry.path().display()),
                )
            })?;
            let dest_path = dst.join(relative);

            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest_path)
                    .map_err(|e| StorageError::directory_creation_failed(dest_path.clone(), e))?;
            } else {
                fs::copy(entry.path(), &dest_path).map_err(|e| {
                    StorageError::io_error(entry.path().to_path_buf(), IoOperation::Read, e)
                })?;
            }
        }

        Ok(())
    }

    /// Count files in directory recursively
    fn count_files(dir: &Path) -> StorageResult<usize> {
        let mut count = 0;
        for entry in WalkDir::new(dir).min_depth(1) {
            let entry = entry.map_err(Self::walk_error)?;
            if !entry.file_type().is_dir() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Copy then verify file counts, removing the target on mismatch
    fn copy_verified(from: &Path, to: &Path) -> StorageResult<()> {
        if let Err(e) = Self::copy_dir_recursive(from, to) {
            let _ = fs::remove_dir_all(to);
            return Err(e);
        }

        let source_count = Self::count_files(from)?;
        let target_count = Self::count_files(to)?;

        if source_count != target_count {
            let _ = fs::remove_dir_all(to);
            return Err(StorageError::relocation_error(
                from.to_path_buf(),
                to.to_path_buf(),
                format!(
                    "Data integrity check failed: {} files in source, {} in target",
                    source_count, target_count
                ),
            ));
        }

        Ok(())
    }

    fn check_writable(dir: &Path) -> StorageResult<()> {
        fs::create_dir_all(dir)
            .map_err(|e| StorageError::directory_creation_failed(dir.to_path_buf(), e))?;

        let marker = dir.join(PREFLIGHT_MARKER);
        fs::write(&marker, b"")
            .map_err(|e| StorageError::io_error(marker.clone(), IoOperation::Write, e))?;
        fs::remove_file(&marker)
            .map_err(|e| StorageError::io_error(marker.clone(), IoOperation::Delete, e))?;
        Ok(())
    }

    fn set_writable(location: &Path, sealed_dir: &Path, writable: bool) -> StorageResult<usize> {
        let root = location.join(sealed_dir);
        if !root.exists() {
            return Ok(0);
        }

        let mut changed = 0;
        for entry in WalkDir::new(&root) {
            let entry = entry.map_err(Self::walk_error)?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let mut perms = fs::metadata(path)
                .map_err(|e| StorageError::io_error(path.to_path_buf(), IoOperation::Read, e))?
                .permissions();
            apply_writable(&mut perms, writable);
            fs::set_permissions(path, perms)
                .map_err(|e| StorageError::io_error(path.to_path_buf(), IoOperation::Write, e))?;
            changed += 1;
        }

        Ok(changed)
    }
}

#[cfg(unix)]
fn apply_writable(perms: &mut Permissions, writable: bool) {
    use std::os::unix::fs::PermissionsExt;
    let mode = perms.mode();
    perms.set_mode(if writable { mode | 0o200 } else { mode & !0o222 });
}

#[cfg(not(unix))]
fn apply_writable(perms: &mut Permissions, writable: bool) {
    perms.set_readonly(!writable);
}

impl StorageRelocator for FsRelocator {
    fn relocate(&self, from: &Path, to: &Path) -> StorageResult<()> {
        debug!("Starting relocation from {} to {}", from.display(), to.display());

        Self::validate_source(from, to)?;
        Self::validate_target(from, to)?;
        Self::ensure_parent(to)?;

        match fs::rename(from, to) {
            Ok(()) => {
                info!("Relocated {} to {}", from.display(), to.display());
                return Ok(());
            }
            Err(e) => debug!("Rename failed ({}), falling back to copy and delete", e),
        }

        Self::copy_verified(from, to)?;

        if let Err(e) = fs::remove_dir_all(from) {
            return Err(StorageError::relocation_error(
                from.to_path_buf(),
                to.to_path_buf(),
                format!(
                    "Copied to target but could not remove source ({}); \
                     unit now exists in both locations",
                    e
                ),
            ));
        }

        info!("Relocated {} to {} by copy", from.display(), to.display());
        Ok(())
    }

    fn copy_tree(&self, from: &Path, to: &Path) -> StorageResult<()> {
        Self::validate_source(from, to)?;
        if to.exists() {
            return Err(StorageError::relocation_error(
                from.to_path_buf(),
                to.to_path_buf(),
                "Target already exists",
            ));
        }
        Self::ensure_parent(to)?;
        Self::copy_verified(from, to)?;

        info!("Copied {} to {}", from.display(), to.display());
        Ok(())
    }

    fn archive(&self, location: &Path, archive_key: &str) -> StorageResult<PathBuf> {
        let target = self.archive_root.join(archive_key);
        if target.exists() {
            return Err(StorageError::relocation_error(
                location.to_path_buf(),
                target,
                "Archive slot already exists",
            ));
        }

        self.relocate(location, &target)?;
        info!("Archived {} as {}", location.display(), archive_key);
        Ok(target)
    }

    fn discard(&self, location: &Path) -> StorageResult<()> {
        if !location.exists() {
            return Ok(());
        }
        fs::remove_dir_all(location)
            .map_err(|e| StorageError::io_error(location.to_path_buf(), IoOperation::Delete, e))?;
        warn!("Discarded partial tree at {}", location.display());
        Ok(())
    }

    fn preflight(&self, from: &Path, to: &Path) -> StorageResult<()> {
        Self::validate_source(from, to)?;
        fs::read_dir(from)
            .map_err(|e| StorageError::io_error(from.to_path_buf(), IoOperation::Read, e))?;

        let parent = to.parent().ok_or_else(|| {
            StorageError::relocation_error(
                from.to_path_buf(),
                to.to_path_buf(),
                "Target has no parent",
            )
        })?;
        Self::check_writable(parent)?;
        Self::check_writable(&self.archive_root)?;

        debug!("Preflight passed for {} -> {}", from.display(), to.display());
        Ok(())
    }

    fn compact(&self, location: &Path) -> StorageResult<()> {
        if !location.exists() {
            return Ok(());
        }

        let mut removed = 0;
        for entry in WalkDir::new(location) {
            let entry = entry.map_err(Self::walk_error)?;
            let is_temp = entry
                .file_name()
                .to_str()
                .map(|name| name.ends_with(TEMP_SUFFIX))
                .unwrap_or(false);

            if entry.file_type().is_file() && is_temp {
                fs::remove_file(entry.path()).map_err(|e| {
                    StorageError::io_error(entry.path().to_path_buf(), IoOperation::Delete, e)
                })?;
                removed += 1;
            }
        }

        debug!("Compacted {}: removed {} stale temp files", location.display(), removed);
        Ok(())
    }

    fn seal(&self, location: &Path) -> StorageResult<()> {
        let changed = Self::set_writable(location, &self.sealed_dir, false)?;
        debug!("Sealed {} files under {}", changed, location.display());
        Ok(())
    }

    fn unseal(&self, location: &Path) -> StorageResult<()> {
        let changed = Self::set_writable(location, &self.sealed_dir, true)?;
        debug!("Unsealed {} files under {}", changed, location.display());
        Ok(())
    }
}
