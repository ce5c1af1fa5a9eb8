//! Downstream datasets updated at publication
//!
//! Every dataset is described by a [`DatasetSpec`] and updated through the one
//! [`apply_change`] routine: lock, back up, delete the unit's rows by key,
//! append the new rows with fresh audit stamps. Deleting by key before
//! appending makes a repeated update converge on the same rows.
//!
//! A backup slot remembers the change set that took it. Retrying the same
//! change set keeps the slot, so it still holds the rows from before the
//! first attempt.

use crate::models::{BoundaryPolygon, Geometry, PolyType, ScheduleAFeature, UnitPackage};
use crate::package_store::write_atomic;
use crate::reconciler::ChangeSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tenure_config::ClassificationConfig;
use tenure_storage::{
    Actor, IoOperation, LockManager, StorageError, StorageResult, UnitId, UnitLock,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A downstream dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Published licence boundary
    CurrentView,
    /// Areas added to licences
    Additions,
    /// Areas removed from licences
    Deletions,
    /// Boundaries replaced by a new agreement
    AgreementBoundary,
    /// Schedule A
    ScheduleA,
}

impl DatasetKind {
    /// Every dataset, in update order
    pub const ALL: [DatasetKind; 5] = [
        DatasetKind::CurrentView,
        DatasetKind::Additions,
        DatasetKind::Deletions,
        DatasetKind::AgreementBoundary,
        DatasetKind::ScheduleA,
    ];

    /// Storage name of the dataset
    pub fn storage_name(self) -> &'static str {
        match self {
            DatasetKind::CurrentView => "tfl_current_view",
            DatasetKind::Additions => "tfl_additions",
            DatasetKind::Deletions => "tfl_deletions",
            DatasetKind::AgreementBoundary => "tfl_agreement_boundary",
            DatasetKind::ScheduleA => "tfl_schedule_a",
        }
    }

    /// Numeric feature class key stamped on the dataset's rows
    pub fn classification_key(self, keys: &ClassificationConfig) -> u32 {
        match self {
            DatasetKind::CurrentView => keys.current_view,
            DatasetKind::Additions => keys.addition,
            DatasetKind::Deletions => keys.deletion,
            DatasetKind::AgreementBoundary => keys.replacement,
            DatasetKind::ScheduleA => keys.schedule_a,
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.storage_name())
    }
}

/// Where a dataset's rows come from in the unit package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSource {
    /// Every polygon not tagged as a deletion
    ResultingBoundary,
    /// Polygons carrying one tag
    Tagged(PolyType),
    /// Schedule A features
    ScheduleA,
}

/// Which business key a dataset files rows under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFormat {
    /// `TFL_49` → `TFL49`
    ForestFileId,
    /// `TFL_49` → `TFL 49`
    CurrentViewKey,
}

impl KeyFormat {
    /// Key of a unit in this format
    pub fn key_for(self, unit: &UnitId) -> String {
        match self {
            KeyFormat::ForestFileId => unit.forest_file_id(),
            KeyFormat::CurrentViewKey => unit.current_view_key(),
        }
    }
}

/// How the reconciler decides whether a dataset needs updating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InclusionRule {
    /// Update when the unit has at least one polygon with the source tag
    Presence,
    /// Update when the unit differs from the previous baseline or the system of record
    Diff,
}

/// Static description of one downstream dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetSpec {
    /// Dataset
    pub kind: DatasetKind,
    /// Row source
    pub source: RowSource,
    /// Key the unit's rows are filed under
    pub key_format: KeyFormat,
    /// Inclusion rule
    pub rule: InclusionRule,
}

impl DatasetSpec {
    /// The five downstream datasets
    pub fn all() -> [DatasetSpec; 5] {
        [
            DatasetSpec {
                kind: DatasetKind::CurrentView,
                source: RowSource::ResultingBoundary,
                key_format: KeyFormat::CurrentViewKey,
                rule: InclusionRule::Diff,
            },
            DatasetSpec {
                kind: DatasetKind::Additions,
                source: RowSource::Tagged(PolyType::Addition),
                key_format: KeyFormat::ForestFileId,
                rule: InclusionRule::Presence,
            },
            DatasetSpec {
                kind: DatasetKind::Deletions,
                source: RowSource::Tagged(PolyType::Deletion),
                key_format: KeyFormat::ForestFileId,
                rule: InclusionRule::Presence,
            },
            DatasetSpec {
                kind: DatasetKind::AgreementBoundary,
                source: RowSource::Tagged(PolyType::Replacement),
                key_format: KeyFormat::ForestFileId,
                rule: InclusionRule::Presence,
            },
            DatasetSpec {
                kind: DatasetKind::ScheduleA,
                source: RowSource::ScheduleA,
                key_format: KeyFormat::ForestFileId,
                rule: InclusionRule::Diff,
            },
        ]
    }

    /// Spec of one dataset
    pub fn of(kind: DatasetKind) -> DatasetSpec {
        match kind {
            DatasetKind::CurrentView => Self::all()[0],
            DatasetKind::Additions => Self::all()[1],
            DatasetKind::Deletions => Self::all()[2],
            DatasetKind::AgreementBoundary => Self::all()[3],
            DatasetKind::ScheduleA => Self::all()[4],
        }
    }

    /// Rows the unit contributes to this dataset, without audit stamps
    pub fn collect_rows(
        &self,
        package: &UnitPackage,
        feature_class_skey: Option<u32>,
    ) -> Vec<DownstreamRow> {
        let unit_key = self.key_format.key_for(&package.unit_id);
        let polygon_row = |p: &BoundaryPolygon| {
            DownstreamRow::from_polygon(&unit_key, p, feature_class_skey)
        };

        match self.source {
            RowSource::ResultingBoundary => package
                .boundary
                .iter()
                .filter(|p| p.tag() != Some(PolyType::Deletion))
                .map(polygon_row)
                .collect(),
            RowSource::Tagged(tag) => package
                .polygons_tagged(&[tag])
                .into_iter()
                .map(polygon_row)
                .collect(),
            RowSource::ScheduleA => package
                .schedule_a
                .iter()
                .map(|f| DownstreamRow::from_schedule(&unit_key, f, feature_class_skey))
                .collect(),
        }
    }
}

/// One row of a downstream dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownstreamRow {
    /// Business key the row is filed under
    pub unit_key: String,
    /// Feature identifier from the unit package
    pub feature_key: String,
    /// Polygon tag, for boundary rows
    #[serde(default)]
    pub poly_type: Option<String>,
    /// Legal instrument, for boundary rows
    #[serde(default)]
    pub legislative_tool: Option<String>,
    /// Numeric feature class key; left empty for manual completion
    #[serde(default)]
    pub feature_class_skey: Option<u32>,
    /// Row geometry
    pub geometry: Geometry,
    /// Who published the row
    #[serde(default)]
    pub updated_by: Option<Actor>,
    /// When the row was published
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl DownstreamRow {
    fn from_polygon(unit_key: &str, polygon: &BoundaryPolygon, skey: Option<u32>) -> Self {
        Self {
            unit_key: unit_key.to_string(),
            feature_key: polygon.feature_key.clone(),
            poly_type: polygon.poly_type.clone(),
            legislative_tool: polygon.legislative_tool.clone(),
            feature_class_skey: skey,
            geometry: polygon.geometry.clone(),
            updated_by: None,
            updated_at: None,
        }
    }

    fn from_schedule(unit_key: &str, feature: &ScheduleAFeature, skey: Option<u32>) -> Self {
        Self {
            unit_key: unit_key.to_string(),
            feature_key: feature.feature_key.clone(),
            poly_type: None,
            legislative_tool: None,
            feature_class_skey: skey,
            geometry: feature.geometry.clone(),
            updated_by: None,
            updated_at: None,
        }
    }
}

/// Audit stamps written onto appended rows, and the change set they publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Restamp {
    /// Change set being applied
    pub change_set: Uuid,
    /// Publishing actor
    pub actor: Actor,
    /// Publication time
    pub at: DateTime<Utc>,
}

impl Restamp {
    /// Stamp rows of `change_set` as published by `actor` at `at`
    pub fn new(change_set: Uuid, actor: Actor, at: DateTime<Utc>) -> Self {
        Self {
            change_set,
            actor,
            at,
        }
    }

    fn apply(&self, row: &DownstreamRow) -> DownstreamRow {
        DownstreamRow {
            updated_by: Some(self.actor.clone()),
            updated_at: Some(self.at),
            ..row.clone()
        }
    }
}

/// Storage of downstream datasets
pub trait DatasetStore: Send + Sync {
    /// Take the cross-unit lock on a dataset, waiting up to the store's timeout
    fn lock(&self, dataset: DatasetKind, actor: &Actor) -> StorageResult<UnitLock>;

    /// Copy the dataset into its backup slot for `change_set`, returning the slot's path
    ///
    /// A slot already taken for the same change set is left as it is.
    fn backup(&self, dataset: DatasetKind, change_set: Uuid) -> StorageResult<PathBuf>;

    /// Delete every row filed under `unit_key`, returning how many went
    fn delete_by_key(&self, dataset: DatasetKind, unit_key: &str) -> StorageResult<usize>;

    /// Append rows
    fn append(&self, dataset: DatasetKind, rows: &[DownstreamRow]) -> StorageResult<()>;

    /// Every row of the dataset
    fn rows(&self, dataset: DatasetKind) -> StorageResult<Vec<DownstreamRow>>;
}

/// Contents of a backup slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetBackup {
    /// Change set whose first attempt took the backup
    pub change_set: Uuid,
    /// When it was taken
    pub taken_at: DateTime<Utc>,
    /// Rows as they were
    pub rows: Vec<DownstreamRow>,
}

/// Datasets stored as one JSON array file each under a staging directory
pub struct FsDatasetStore {
    root: PathBuf,
    backup_suffix: String,
    locks: Arc<dyn LockManager>,
    lock_wait: Duration,
    poll_interval: Duration,
}

impl FsDatasetStore {
    /// Create a store under `root`
    pub fn new(
        root: impl Into<PathBuf>,
        backup_suffix: impl Into<String>,
        locks: Arc<dyn LockManager>,
    ) -> Self {
        Self {
            root: root.into(),
            backup_suffix: backup_suffix.into(),
            locks,
            lock_wait: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Set how long [`DatasetStore::lock`] waits and how often it polls
    pub fn with_lock_wait(mut self, wait: Duration, poll_interval: Duration) -> Self {
        self.lock_wait = wait;
        self.poll_interval = poll_interval;
        self
    }

    /// Staging directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding a dataset
    pub fn dataset_path(&self, dataset: DatasetKind) -> PathBuf {
        self.root.join(format!("{}.json", dataset.storage_name()))
    }

    /// File holding a dataset's backup slot
    pub fn backup_path(&self, dataset: DatasetKind) -> PathBuf {
        self.root
            .join(format!("{}{}.json", dataset.storage_name(), self.backup_suffix))
    }

    fn read_rows(path: &Path) -> StorageResult<Vec<DownstreamRow>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io_error(path.to_path_buf(), IoOperation::Read, e)),
        };
        serde_json::from_str(&content)
            .map_err(|e| StorageError::parse_error(path.to_path_buf(), "JSON", e.to_string()))
    }

    /// Current backup slot of a dataset, if one was ever taken
    pub fn read_backup(&self, dataset: DatasetKind) -> StorageResult<Option<DatasetBackup>> {
        let path = self.backup_path(dataset);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io_error(path, IoOperation::Read, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StorageError::parse_error(path, "JSON", e.to_string()))
    }

    fn write_rows(path: &Path, rows: &[DownstreamRow]) -> StorageResult<()> {
        let json = serde_json::to_string_pretty(rows)
            .map_err(|e| StorageError::parse_error(path.to_path_buf(), "JSON", e.to_string()))?;
        write_atomic(path, json.as_bytes())
    }
}

impl DatasetStore for FsDatasetStore {
    fn lock(&self, dataset: DatasetKind, actor: &Actor) -> StorageResult<UnitLock> {
        let location = self.root.join(dataset.storage_name());
        self.locks
            .acquire_blocking(&location, actor, self.lock_wait, self.poll_interval)
    }

    fn backup(&self, dataset: DatasetKind, change_set: Uuid) -> StorageResult<PathBuf> {
        let path = self.backup_path(dataset);
        if let Some(existing) = self.read_backup(dataset)? {
            if existing.change_set == change_set {
                debug!(
                    "Keeping backup of {} taken for change set {}",
                    dataset, change_set
                );
                return Ok(path);
            }
        }

        let slot = DatasetBackup {
            change_set,
            taken_at: Utc::now(),
            rows: Self::read_rows(&self.dataset_path(dataset))?,
        };
        let json = serde_json::to_string_pretty(&slot)
            .map_err(|e| StorageError::parse_error(path.clone(), "JSON", e.to_string()))?;
        write_atomic(&path, json.as_bytes())?;
        debug!(
            "Backed up {} rows of {} to {}",
            slot.rows.len(),
            dataset,
            path.display()
        );
        Ok(path)
    }

    fn delete_by_key(&self, dataset: DatasetKind, unit_key: &str) -> StorageResult<usize> {
        let path = self.dataset_path(dataset);
        let mut rows = Self::read_rows(&path)?;
        let before = rows.len();
        rows.retain(|row| row.unit_key != unit_key);
        let deleted = before - rows.len();
        if deleted > 0 {
            Self::write_rows(&path, &rows)?;
        }
        Ok(deleted)
    }

    fn append(&self, dataset: DatasetKind, new_rows: &[DownstreamRow]) -> StorageResult<()> {
        let path = self.dataset_path(dataset);
        let mut rows = Self::read_rows(&path)?;
        rows.extend_from_slice(new_rows);
        Self::write_rows(&path, &rows)
    }

    fn rows(&self, dataset: DatasetKind) -> StorageResult<Vec<DownstreamRow>> {
        Self::read_rows(&self.dataset_path(dataset))
    }
}

/// Outcome of updating one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    /// Updated dataset
    pub dataset: DatasetKind,
    /// Backup slot written before the update
    pub backup: PathBuf,
    /// Rows removed by key
    pub deleted: usize,
    /// Rows appended
    pub appended: usize,
}

/// Update one dataset for one unit
///
/// The dataset lock is held from the backup until the append completes.
pub fn apply_change(
    store: &dyn DatasetStore,
    spec: &DatasetSpec,
    unit_key: &str,
    rows: &[DownstreamRow],
    restamp: &Restamp,
) -> StorageResult<ApplySummary> {
    let lock = store.lock(spec.kind, &restamp.actor)?;

    let backup = store.backup(spec.kind, restamp.change_set)?;
    let deleted = store.delete_by_key(spec.kind, unit_key)?;
    let stamped: Vec<DownstreamRow> = rows.iter().map(|row| restamp.apply(row)).collect();
    store.append(spec.kind, &stamped)?;

    lock.release()?;

    debug!(
        "Updated {} for {}: {} deleted, {} appended",
        spec.kind,
        unit_key,
        deleted,
        stamped.len()
    );

    Ok(ApplySummary {
        dataset: spec.kind,
        backup,
        deleted,
        appended: stamped.len(),
    })
}

/// A dataset whose update failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetFailure {
    /// Dataset
    pub dataset: DatasetKind,
    /// Why it failed
    pub message: String,
}

/// Per-dataset outcome of applying a change set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Datasets updated
    pub succeeded: Vec<ApplySummary>,
    /// Datasets not updated
    pub failed: Vec<DatasetFailure>,
}

impl ApplyReport {
    /// Whether every dataset was updated
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

impl fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let updated: Vec<&str> = self
            .succeeded
            .iter()
            .map(|s| s.dataset.storage_name())
            .collect();
        write!(f, "{} dataset(s) updated", updated.len())?;
        if !updated.is_empty() {
            write!(f, " ({})", updated.join(", "))?;
        }
        if !self.failed.is_empty() {
            let failed: Vec<String> = self
                .failed
                .iter()
                .map(|d| format!("{}: {}", d.dataset, d.message))
                .collect();
            write!(f, "; {} failed ({})", failed.len(), failed.join("; "))?;
        }
        Ok(())
    }
}

/// Apply every entry of a change set, continuing past failed datasets
pub fn apply_change_set(
    store: &dyn DatasetStore,
    change_set: &ChangeSet,
    restamp: &Restamp,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    for entry in &change_set.entries {
        let spec = DatasetSpec::of(entry.dataset);
        match apply_change(store, &spec, &entry.unit_key, &entry.rows, restamp) {
            Ok(summary) => report.succeeded.push(summary),
            Err(e) => {
                warn!("Failed to update {} for {}: {}", entry.dataset, change_set.unit, e);
                report.failed.push(DatasetFailure {
                    dataset: entry.dataset,
                    message: e.to_string(),
                });
            }
        }
    }

    info!("Applied change set {} for {}: {}", change_set.id, change_set.unit, report);
    report
}
