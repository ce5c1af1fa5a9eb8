//! Deterministic collaborators and fixtures for tests
//!
//! [`CellGeometryEngine`] reads a geometry as a comma-separated set of cell
//! names, so spatial operations become set operations and test data can be
//! written inline. A few cell names trigger engine behaviour:
//!
//! - `invalid`: the topology cannot be built
//! - `dangle`: the line breaks Must Not Have Dangles
//! - `selfx`: the line breaks Must Not Self-Intersect
//! - `open`: the linework does not close into a polygon

use crate::collaborators::{
    CollaboratorError, GeometryEngine, RecordFeature, RecordSnapshot, RuleViolation,
    SystemOfRecord, Topology, TopologyRule, TopologySpec,
};
use crate::downstream::{DatasetKind, DatasetStore, DownstreamRow, FsDatasetStore};
use crate::models::{
    BoundaryPolygon, Feature, FeatureSet, Geometry, LineRecord, ScheduleAFeature, UnitPackage,
    STATUS_ACTIVE, STATUS_RETIRED,
};
use crate::orchestrator::{LifecycleOrchestrator, OrchestratorParts};
use crate::package_store::{FsPackageStore, PackageStore};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tenure_config::LifecycleConfig;
use tenure_storage::{
    Actor, FsRelocator, Stage, StageRoots, StorageError, StorageRelocator, StorageResult,
    UnitId, UnitLocation, UnitLock,
};
use uuid::Uuid;

const ENGINE: &str = "cell-geometry";

/// Geometry engine over comma-separated cell sets
#[derive(Debug, Clone, Copy, Default)]
pub struct CellGeometryEngine;

impl CellGeometryEngine {
    fn cells(geometry: &Geometry) -> BTreeSet<&str> {
        geometry
            .as_str()
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect()
    }

    fn union(set: &FeatureSet) -> BTreeSet<&str> {
        set.iter().flat_map(|f| Self::cells(&f.geometry)).collect()
    }

    fn encode<'a>(cells: impl IntoIterator<Item = &'a str>) -> Geometry {
        Geometry::new(cells.into_iter().collect::<Vec<_>>().join(","))
    }

    /// Per feature of `a`, the cells that do (`keep == true`) or do not
    /// appear in `b`; empty remainders are dropped
    fn partition(a: &FeatureSet, b: &FeatureSet, keep: bool) -> FeatureSet {
        let other = Self::union(b);
        a.iter()
            .filter_map(|feature| {
                let cells: Vec<&str> = Self::cells(&feature.geometry)
                    .into_iter()
                    .filter(|c| other.contains(c) == keep)
                    .collect();
                if cells.is_empty() {
                    None
                } else {
                    Some(Feature::new(feature.key.clone(), Self::encode(cells)))
                }
            })
            .collect()
    }
}

impl GeometryEngine for CellGeometryEngine {
    fn build_topology(
        &self,
        lines: &FeatureSet,
        spec: &TopologySpec,
    ) -> Result<Topology, CollaboratorError> {
        if let Some(bad) = lines
            .iter()
            .find(|f| Self::cells(&f.geometry).contains("invalid"))
        {
            return Err(CollaboratorError::new(
                ENGINE,
                "build_topology",
                format!("invalid geometry on {}", bad.key),
            ));
        }

        Ok(Topology {
            id: format!("topology-{}", lines.len()),
            rules: spec.rules.clone(),
            features: lines.clone(),
        })
    }

    fn validate_topology(
        &self,
        topology: &Topology,
    ) -> Result<Vec<RuleViolation>, CollaboratorError> {
        let triggers = [
            ("dangle", TopologyRule::MustNotHaveDangles),
            ("selfx", TopologyRule::MustNotSelfIntersect),
        ];

        let mut violations = Vec::new();
        for feature in topology.features.iter() {
            let cells = Self::cells(&feature.geometry);
            for (cell, rule) in triggers {
                if cells.contains(cell) && topology.rules.contains(&rule) {
                    violations.push(RuleViolation {
                        rule,
                        feature_key: Some(feature.key.clone()),
                        description: format!("{} on {}", rule, feature.key),
                    });
                }
            }
        }
        Ok(violations)
    }

    fn build_polygons(&self, lines: &FeatureSet) -> Result<usize, CollaboratorError> {
        let open = lines
            .iter()
            .any(|f| Self::cells(&f.geometry).contains("open"));
        Ok(if lines.is_empty() || open { 0 } else { 1 })
    }

    fn spatial_difference(
        &self,
        a: &FeatureSet,
        b: &FeatureSet,
    ) -> Result<FeatureSet, CollaboratorError> {
        Ok(Self::partition(a, b, false))
    }

    fn contains(
        &self,
        container: &FeatureSet,
        contained: &FeatureSet,
    ) -> Result<bool, CollaboratorError> {
        let outer = Self::union(container);
        Ok(Self::union(contained).iter().all(|c| outer.contains(c)))
    }

    fn intersects(&self, a: &FeatureSet, b: &FeatureSet) -> Result<FeatureSet, CollaboratorError> {
        Ok(Self::partition(a, b, true))
    }
}

/// System of record a test can rewrite while the orchestrator holds it
#[derive(Debug, Default)]
pub struct SharedRecord {
    snapshot: RwLock<RecordSnapshot>,
}

impl SharedRecord {
    /// Start from a snapshot
    pub fn new(snapshot: RecordSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    /// Replace the snapshot
    pub fn replace(&self, snapshot: RecordSnapshot) {
        *self.snapshot.write() = snapshot;
    }

    /// Current snapshot
    pub fn snapshot(&self) -> RecordSnapshot {
        self.snapshot.read().clone()
    }

    /// File `package`'s boundary and Schedule A as the published state of its unit
    pub fn mirror(&self, package: &UnitPackage) {
        let unit = &package.unit_id;
        let view_key = unit.current_view_key();
        let file_id = unit.forest_file_id();

        let mut snapshot = self.snapshot.write();
        snapshot.current_view.retain(|f| f.key != view_key);
        snapshot.schedule_a.retain(|f| f.key != file_id);
        snapshot
            .current_view
            .extend(package.resulting_boundary().into_iter().map(|f| RecordFeature {
                key: view_key.clone(),
                feature_key: f.key,
                geometry: f.geometry,
                retired_at: None,
            }));
        snapshot
            .schedule_a
            .extend(package.schedule_a_features().into_iter().map(|f| RecordFeature {
                key: file_id.clone(),
                feature_key: f.key,
                geometry: f.geometry,
                retired_at: None,
            }));
    }
}

impl SystemOfRecord for SharedRecord {
    fn current_view(&self, current_view_key: &str) -> Result<FeatureSet, CollaboratorError> {
        self.snapshot.read().current_view(current_view_key)
    }

    fn schedule_a(&self, forest_file_id: &str) -> Result<FeatureSet, CollaboratorError> {
        self.snapshot.read().schedule_a(forest_file_id)
    }

    fn other_boundaries(&self, current_view_key: &str) -> Result<FeatureSet, CollaboratorError> {
        self.snapshot.read().other_boundaries(current_view_key)
    }
}

/// Dataset store whose appends fail for chosen datasets
pub struct FailingDatasetStore {
    inner: Arc<dyn DatasetStore>,
    failing: Mutex<BTreeSet<DatasetKind>>,
}

impl FailingDatasetStore {
    /// Wrap a working store
    pub fn new(inner: Arc<dyn DatasetStore>) -> Self {
        Self {
            inner,
            failing: Mutex::new(BTreeSet::new()),
        }
    }

    /// Make appends to `dataset` fail until [`FailingDatasetStore::heal`]
    pub fn fail_appends(&self, dataset: DatasetKind) {
        self.failing.lock().insert(dataset);
    }

    /// Stop injecting failures
    pub fn heal(&self) {
        self.failing.lock().clear();
    }
}

impl DatasetStore for FailingDatasetStore {
    fn lock(&self, dataset: DatasetKind, actor: &Actor) -> StorageResult<UnitLock> {
        self.inner.lock(dataset, actor)
    }

    fn backup(&self, dataset: DatasetKind, change_set: Uuid) -> StorageResult<PathBuf> {
        self.inner.backup(dataset, change_set)
    }

    fn delete_by_key(&self, dataset: DatasetKind, unit_key: &str) -> StorageResult<usize> {
        self.inner.delete_by_key(dataset, unit_key)
    }

    fn append(&self, dataset: DatasetKind, rows: &[DownstreamRow]) -> StorageResult<()> {
        if self.failing.lock().contains(&dataset) {
            return Err(StorageError::storage_unavailable(
                PathBuf::from(dataset.storage_name()),
                "injected append failure",
            ));
        }
        self.inner.append(dataset, rows)
    }

    fn rows(&self, dataset: DatasetKind) -> StorageResult<Vec<DownstreamRow>> {
        self.inner.rows(dataset)
    }
}

type RelocationHook = Box<dyn FnOnce(&Path, &Path) + Send>;
type CompactionHook = Box<dyn FnOnce(&Path) + Send>;

/// Relocator that can run code between steps of a transition
///
/// Hooks fire once. Everything else is delegated to a [`FsRelocator`].
pub struct HookedRelocator {
    inner: FsRelocator,
    after_relocate: Mutex<Option<RelocationHook>>,
    on_compact: Mutex<Option<CompactionHook>>,
    fail_preflight: AtomicBool,
    compactions: AtomicUsize,
}

impl HookedRelocator {
    /// Wrap a filesystem relocator
    pub fn new(inner: FsRelocator) -> Self {
        Self {
            inner,
            after_relocate: Mutex::new(None),
            on_compact: Mutex::new(None),
            fail_preflight: AtomicBool::new(false),
            compactions: AtomicUsize::new(0),
        }
    }

    /// Run `hook` right after the next successful relocation
    pub fn after_next_relocate(&self, hook: impl FnOnce(&Path, &Path) + Send + 'static) {
        *self.after_relocate.lock() = Some(Box::new(hook));
    }

    /// Run `hook` during the next compaction
    pub fn on_next_compact(&self, hook: impl FnOnce(&Path) + Send + 'static) {
        *self.on_compact.lock() = Some(Box::new(hook));
    }

    /// Make every preflight report that the move cannot succeed
    pub fn fail_preflight(&self) {
        self.fail_preflight.store(true, Ordering::SeqCst);
    }

    /// How many compactions ran
    pub fn compactions(&self) -> usize {
        self.compactions.load(Ordering::SeqCst)
    }
}

impl StorageRelocator for HookedRelocator {
    fn relocate(&self, from: &Path, to: &Path) -> StorageResult<()> {
        self.inner.relocate(from, to)?;
        let hook = self.after_relocate.lock().take();
        if let Some(hook) = hook {
            hook(from, to);
        }
        Ok(())
    }

    fn copy_tree(&self, from: &Path, to: &Path) -> StorageResult<()> {
        self.inner.copy_tree(from, to)
    }

    fn archive(&self, location: &Path, archive_key: &str) -> StorageResult<PathBuf> {
        self.inner.archive(location, archive_key)
    }

    fn discard(&self, location: &Path) -> StorageResult<()> {
        self.inner.discard(location)
    }

    fn preflight(&self, from: &Path, to: &Path) -> StorageResult<()> {
        if self.fail_preflight.load(Ordering::SeqCst) {
            return Err(StorageError::relocation_error(
                from.to_path_buf(),
                to.to_path_buf(),
                "injected preflight failure",
            ));
        }
        self.inner.preflight(from, to)
    }

    fn compact(&self, location: &Path) -> StorageResult<()> {
        self.compactions.fetch_add(1, Ordering::SeqCst);
        let hook = self.on_compact.lock().take();
        if let Some(hook) = hook {
            hook(location);
        }
        self.inner.compact(location)
    }

    fn seal(&self, location: &Path) -> StorageResult<()> {
        self.inner.seal(location)
    }

    fn unseal(&self, location: &Path) -> StorageResult<()> {
        self.inner.unseal(location)
    }
}

/// Active line over the given cells
pub fn line(key: &str, cells: &str) -> LineRecord {
    LineRecord {
        feature_key: key.to_string(),
        legal_description: Some(format!("boundary segment {}", key)),
        status_code: Some(STATUS_ACTIVE.to_string()),
        source_code: Some("SURVEY".to_string()),
        geometry: Geometry::new(cells),
        last_edited_by: None,
        last_edited_at: None,
    }
}

/// Boundary polygon over the given cells
pub fn polygon(key: &str, tag: &str, tool: Option<&str>, cells: &str) -> BoundaryPolygon {
    BoundaryPolygon {
        feature_key: key.to_string(),
        poly_type: Some(tag.to_string()),
        legislative_tool: tool.map(str::to_string),
        geometry: Geometry::new(cells),
    }
}

/// Builds unit packages for tests
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    package: UnitPackage,
}

impl PackageBuilder {
    /// Empty package for `unit`
    ///
    /// # Panics
    ///
    /// When `unit` is not a valid unit key.
    pub fn new(unit: &str) -> Self {
        let unit = match UnitId::new(unit) {
            Ok(unit) => unit,
            Err(e) => panic!("bad test unit key {}: {}", unit, e),
        };
        Self {
            package: UnitPackage::new(unit),
        }
    }

    /// TFL 49 with clean linework, one current-view polygon and one
    /// Schedule A feature inside it
    pub fn tfl49() -> Self {
        Self::new("TFL_49")
            .with_line(line("L1", "n1,n2"))
            .with_line(line("L2", "n2,n3"))
            .with_line(line("L3", "n3,n1"))
            .with_polygon(polygon("P1", "Current_View", None, "a,b,c"))
            .with_schedule_a("S1", "a")
    }

    /// Add a line
    pub fn with_line(mut self, line: LineRecord) -> Self {
        self.package.lines.push(line);
        self
    }

    /// Add a retired line
    pub fn with_retired_line(mut self, key: &str) -> Self {
        let mut retired = line(key, key);
        retired.status_code = Some(STATUS_RETIRED.to_string());
        self.package.lines.push(retired);
        self
    }

    /// Add a polygon
    pub fn with_polygon(mut self, polygon: BoundaryPolygon) -> Self {
        self.package.boundary.push(polygon);
        self
    }

    /// Drop every polygon
    pub fn without_polygons(mut self) -> Self {
        self.package.boundary.clear();
        self
    }

    /// Add a Schedule A feature filed under the unit's forest file id
    pub fn with_schedule_a(mut self, key: &str, cells: &str) -> Self {
        self.package.schedule_a.push(ScheduleAFeature {
            feature_key: key.to_string(),
            forest_file_id: Some(self.package.unit_id.forest_file_id()),
            geometry: Geometry::new(cells),
        });
        self
    }

    /// Finished package
    pub fn build(self) -> UnitPackage {
        self.package
    }
}

/// A temporary stage tree with a filesystem orchestrator over it
pub struct Fixture {
    temp: TempDir,
    mirror_record: bool,
    /// Configuration rooted in the temporary directory
    pub config: LifecycleConfig,
    /// Stage roots of the active environment
    pub roots: StageRoots,
    /// System of record seen by the orchestrator
    pub record: Arc<SharedRecord>,
    /// Dataset store seen by the orchestrator
    pub datasets: Arc<FailingDatasetStore>,
    /// Underlying filesystem dataset store
    pub staging: Arc<FsDatasetStore>,
    /// Relocator seen by the orchestrator
    pub relocator: Arc<HookedRelocator>,
    /// Orchestrator under test
    pub orchestrator: LifecycleOrchestrator,
}

impl Fixture {
    /// Fixture whose system of record mirrors every seeded baseline
    pub fn new() -> Self {
        Self::build(RecordSnapshot::new(), true, |_| {})
    }

    /// Fixture with a fixed system-of-record snapshot
    pub fn with_snapshot(snapshot: RecordSnapshot) -> Self {
        Self::build(snapshot, false, |_| {})
    }

    /// Mirroring fixture with adjusted configuration
    pub fn with_config(adjust: impl FnOnce(&mut LifecycleConfig)) -> Self {
        Self::build(RecordSnapshot::new(), true, adjust)
    }

    fn build(
        snapshot: RecordSnapshot,
        mirror_record: bool,
        adjust: impl FnOnce(&mut LifecycleConfig),
    ) -> Self {
        let temp = match TempDir::new() {
            Ok(temp) => temp,
            Err(e) => panic!("cannot create fixture directory: {}", e),
        };
        let mut config = LifecycleConfig::rooted_at(temp.path());
        adjust(&mut config);
        if let Err(e) = config.validate() {
            panic!("fixture configuration invalid: {}", e);
        }

        let engine = Arc::new(CellGeometryEngine);
        let mut parts = match OrchestratorParts::from_config(&config, engine) {
            Ok(parts) => parts,
            Err(e) => panic!("cannot assemble orchestrator: {}", e),
        };

        let paths = config.active_paths();
        let staging = Arc::new(
            FsDatasetStore::new(
                paths.downstream.clone(),
                config.downstream.backup_suffix.clone(),
                Arc::clone(&parts.locks),
            )
            .with_lock_wait(
                std::time::Duration::from_millis(config.locking.dataset_lock_wait_ms),
                std::time::Duration::from_millis(config.locking.poll_interval_ms),
            ),
        );
        let datasets = Arc::new(FailingDatasetStore::new(staging.clone()));
        let record = Arc::new(SharedRecord::new(snapshot));
        let relocator = Arc::new(HookedRelocator::new(FsRelocator::new(paths.archive.clone())));
        parts.datasets = datasets.clone();
        parts.system_of_record = record.clone();
        parts.relocator = relocator.clone();

        let roots = StageRoots {
            baseline: paths.baseline.clone(),
            editing: paths.editing.clone(),
            review: paths.review.clone(),
            pending: paths.pending.clone(),
            archive: paths.archive.clone(),
        };

        Self {
            orchestrator: LifecycleOrchestrator::new(parts, &config),
            temp,
            mirror_record,
            config,
            roots,
            record,
            datasets,
            staging,
            relocator,
        }
    }

    /// Temporary root directory
    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Where `unit` lives in `stage`
    pub fn location(&self, unit: &UnitId, stage: Stage) -> UnitLocation {
        self.roots.location(unit, stage)
    }

    /// Write `package` as a sealed baseline and return its unit
    ///
    /// # Panics
    ///
    /// When the baseline cannot be written.
    pub fn seed_baseline(&self, package: UnitPackage) -> UnitId {
        let unit = package.unit_id.clone();
        let location = self.location(&unit, Stage::Baseline);
        if let Err(e) = FsPackageStore::new().save(&location, &package) {
            panic!("cannot seed baseline {}: {}", unit, e);
        }
        if let Err(e) = FsRelocator::new(self.roots.archive.clone()).seal(location.path()) {
            panic!("cannot seal baseline {}: {}", unit, e);
        }
        if self.mirror_record {
            self.record.mirror(&package);
        }
        unit
    }

    /// Package stored at a location
    ///
    /// # Panics
    ///
    /// When the package cannot be read.
    pub fn load(&self, location: &UnitLocation) -> UnitPackage {
        match FsPackageStore::new().load(location) {
            Ok(package) => package,
            Err(e) => panic!("cannot load package at {}: {}", location.path().display(), e),
        }
    }

    /// Change the editing copy of `unit` as an editor would
    ///
    /// Lines whose content changed get their editor-tracking stamp.
    ///
    /// # Panics
    ///
    /// When the unit is not in editing.
    pub fn edit(&self, unit: &UnitId, editor: &Actor, change: impl FnOnce(&mut UnitPackage)) {
        let location = self.location(unit, Stage::Editing);
        let before = self.load(&location);
        let mut package = before.clone();
        change(&mut package);

        let now = Utc::now();
        for line in &mut package.lines {
            let unchanged = before.lines.iter().any(|old| old == line);
            if !unchanged {
                line.last_edited_by = Some(editor.to_string());
                line.last_edited_at = Some(now);
            }
        }
        package.modified_at = Some(now);

        if let Err(e) = FsPackageStore::new().save(&location, &package) {
            panic!("cannot save edits to {}: {}", unit, e);
        }
    }

    /// Rows of a downstream dataset
    ///
    /// # Panics
    ///
    /// When the dataset cannot be read.
    pub fn rows(&self, dataset: DatasetKind) -> Vec<DownstreamRow> {
        match self.staging.rows(dataset) {
            Ok(rows) => rows,
            Err(e) => panic!("cannot read {}: {}", dataset, e),
        }
    }

    /// Check out, submit and approve `unit`
    ///
    /// # Panics
    ///
    /// When any step fails.
    pub fn run_to_pending(
        &self,
        unit: &UnitId,
        editor: &Actor,
        reviewer: &Actor,
        change: impl FnOnce(&mut UnitPackage),
    ) {
        if let Err(e) = self.orchestrator.checkout(unit, editor) {
            panic!("checkout of {} failed: {}", unit, e);
        }
        self.edit(unit, editor, change);
        if let Err(e) = self.orchestrator.submit_for_review(unit, editor) {
            panic!("submit of {} failed: {}", unit, e);
        }
        if let Err(e) = self.orchestrator.approve(unit, reviewer) {
            panic!("approve of {} failed: {}", unit, e);
        }
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(features: &[(&str, &str)]) -> FeatureSet {
        features
            .iter()
            .map(|(k, g)| Feature::new(*k, Geometry::new(*g)))
            .collect()
    }

    #[test]
    fn test_cell_difference_and_intersection() {
        let engine = CellGeometryEngine;
        let a = set(&[("A", "x,y"), ("B", "z")]);
        let b = set(&[("C", "y,z")]);

        let diff = engine.spatial_difference(&a, &b).unwrap();
        assert_eq!(diff.keys(), vec!["A"]);
        assert_eq!(diff.features[0].geometry.as_str(), "x");

        let overlap = engine.intersects(&a, &b).unwrap();
        assert_eq!(overlap.keys(), vec!["A", "B"]);
        assert!(engine.contains(&a, &set(&[("D", "x,z")])).unwrap());
        assert!(!engine.contains(&b, &a).unwrap());
    }

    #[test]
    fn test_trigger_cells() {
        let engine = CellGeometryEngine;
        let spec = TopologySpec::boundary(0.0001);
        assert!(engine.build_topology(&set(&[("L", "invalid")]), &spec).is_err());

        let topology = engine
            .build_topology(&set(&[("L1", "a,dangle"), ("L2", "selfx")]), &spec)
            .unwrap();
        let violations = engine.validate_topology(&topology).unwrap();
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].rule, TopologyRule::MustNotHaveDangles);

        assert_eq!(engine.build_polygons(&set(&[("L", "a,open")])).unwrap(), 0);
        assert_eq!(engine.build_polygons(&FeatureSet::new()).unwrap(), 0);
        assert_eq!(engine.build_polygons(&set(&[("L", "a")])).unwrap(), 1);
    }

    #[test]
    fn test_mirror_replaces_unit_features() {
        let record = SharedRecord::default();
        let package = PackageBuilder::tfl49().build();
        record.mirror(&package);
        record.mirror(&package);

        assert_eq!(record.current_view("TFL 49").unwrap().len(), 1);
        assert_eq!(record.schedule_a("TFL49").unwrap().len(), 1);
        assert!(record.other_boundaries("TFL 49").unwrap().is_empty());
    }
}
