//! Lifecycle state machine
//!
//! The orchestrator is the only component that moves a unit between stages.
//! Every transition resolves the unit, locks both its current and its target
//! location, confirms the unit has not moved meanwhile, runs the transition's
//! gate, relocates the unit's tree and updates its transaction record, in that
//! order. A failed transition leaves the unit where it was.

use crate::artifacts::{BaselineAdvisory, ReviewArtifacts};
use crate::audit::{AuditAction, AuditTrail, FsAuditTrail, TransactionRecord};
use crate::collaborators::{
    DomainCatalog, GeometryEngine, RecordSnapshot, StaticDomainCatalog, SystemOfRecord,
};
use crate::downstream::{apply_change_set, ApplyReport, DatasetStore, FsDatasetStore, Restamp};
use crate::error::{ConflictError, LifecycleError, LifecycleResult};
use crate::gate::{Finding, FindingCategory, GateName, GateResult, Subject};
use crate::gateway::{GateContext, ValidationGateway};
use crate::models::{ChangeHistoryEntry, UnitPackage, WorkUnit};
use crate::package_store::{FsPackageStore, PackageStore};
use crate::reconciler::{ChangeReconciler, ChangeSet};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tenure_config::{LifecycleConfig, LockingConfig};
use tenure_storage::{
    Actor, FileLockManager, FsRelocator, FsUnitLocator, IoOperation, LockManager, LockOutcome,
    Stage, StageRoots, StorageError, StorageRelocator, UnitId, UnitLocation, UnitLock,
    UnitLocator,
};
use tracing::{debug, info, warn};

/// Support documents kept with a baseline unit, relative to the unit root
pub const SUPPORT_DOCUMENTS_DIR: &str = "documents/Update_Support_Documents";

/// Collaborators the orchestrator drives
pub struct OrchestratorParts {
    /// Resolves units to stage locations
    pub locator: Arc<dyn UnitLocator>,
    /// Unit locks
    pub locks: Arc<dyn LockManager>,
    /// Moves unit trees
    pub relocator: Arc<dyn StorageRelocator>,
    /// Unit packages
    pub packages: Arc<dyn PackageStore>,
    /// Transaction records
    pub audit: Arc<dyn AuditTrail>,
    /// Downstream datasets
    pub datasets: Arc<dyn DatasetStore>,
    /// Geometry engine
    pub geometry: Arc<dyn GeometryEngine>,
    /// Attribute domains
    pub domains: Arc<dyn DomainCatalog>,
    /// External system of record
    pub system_of_record: Arc<dyn SystemOfRecord>,
}

impl OrchestratorParts {
    /// Filesystem collaborators for a configuration
    ///
    /// The geometry engine is always external and must be supplied.
    pub fn from_config(
        config: &LifecycleConfig,
        geometry: Arc<dyn GeometryEngine>,
    ) -> LifecycleResult<Self> {
        let paths = config.active_paths();
        let roots = StageRoots {
            baseline: paths.baseline.clone(),
            editing: paths.editing.clone(),
            review: paths.review.clone(),
            pending: paths.pending.clone(),
            archive: paths.archive.clone(),
        };

        let locks: Arc<dyn LockManager> = Arc::new(FileLockManager::new());
        let datasets = FsDatasetStore::new(
            paths.downstream.clone(),
            config.downstream.backup_suffix.clone(),
            Arc::clone(&locks),
        )
        .with_lock_wait(
            Duration::from_millis(config.locking.dataset_lock_wait_ms),
            Duration::from_millis(config.locking.poll_interval_ms),
        );

        let system_of_record = match &config.system_of_record.extract_path {
            Some(path) => RecordSnapshot::load(path)?,
            None => {
                warn!(
                    "No system-of-record extract configured; external comparisons see no features"
                );
                RecordSnapshot::new()
            }
        };

        Ok(Self {
            relocator: Arc::new(FsRelocator::new(roots.archive.clone())),
            locator: Arc::new(FsUnitLocator::new(roots)),
            locks,
            packages: Arc::new(FsPackageStore::new()),
            audit: Arc::new(FsAuditTrail::new()),
            datasets: Arc::new(datasets),
            geometry,
            domains: Arc::new(StaticDomainCatalog::new(config.domains.clone())),
            system_of_record: Arc::new(system_of_record),
        })
    }
}

/// Result of a completed transition
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    /// Unit after the transition
    pub unit: WorkUnit,
    /// Stage before
    pub from: Stage,
    /// Stage after
    pub to: Stage,
    /// Gate that allowed the transition
    pub gate: Option<GateResult>,
    /// Advisory findings raised along the way
    pub advisories: Vec<Finding>,
    /// Downstream change set, for publication
    pub change_set: Option<ChangeSet>,
    /// Downstream update report, for publication
    pub apply_report: Option<ApplyReport>,
    /// Where the previous baseline was archived, for publication
    pub archived: Option<PathBuf>,
}

impl TransitionOutcome {
    fn new(unit: WorkUnit, from: Stage) -> Self {
        Self {
            to: unit.stage,
            unit,
            from,
            gate: None,
            advisories: Vec::new(),
            change_set: None,
            apply_report: None,
            archived: None,
        }
    }
}

/// A unit and its transaction record
#[derive(Debug, Clone)]
pub struct UnitStatus {
    /// Where the unit is
    pub unit: WorkUnit,
    /// Its transaction record
    pub record: Option<TransactionRecord>,
}

/// Drives units through Baseline → Editing → Review → Pending → Baseline
pub struct LifecycleOrchestrator {
    locator: Arc<dyn UnitLocator>,
    locks: Arc<dyn LockManager>,
    relocator: Arc<dyn StorageRelocator>,
    packages: Arc<dyn PackageStore>,
    audit: Arc<dyn AuditTrail>,
    datasets: Arc<dyn DatasetStore>,
    geometry: Arc<dyn GeometryEngine>,
    system_of_record: Arc<dyn SystemOfRecord>,
    gateway: ValidationGateway,
    reconciler: ChangeReconciler,
    locking: LockingConfig,
}

impl LifecycleOrchestrator {
    /// Assemble an orchestrator from explicit collaborators
    pub fn new(parts: OrchestratorParts, config: &LifecycleConfig) -> Self {
        let gateway = ValidationGateway::new(
            Arc::clone(&parts.geometry),
            Arc::clone(&parts.domains),
            Arc::clone(&parts.system_of_record),
            config.topology.cluster_tolerance,
        );
        let reconciler =
            ChangeReconciler::new(Arc::clone(&parts.geometry), config.classification.clone());

        Self {
            locator: parts.locator,
            locks: parts.locks,
            relocator: parts.relocator,
            packages: parts.packages,
            audit: parts.audit,
            datasets: parts.datasets,
            geometry: parts.geometry,
            system_of_record: parts.system_of_record,
            gateway,
            reconciler,
            locking: config.locking.clone(),
        }
    }

    /// Validate a configuration and build the filesystem orchestrator for it
    pub fn from_config(
        config: &LifecycleConfig,
        geometry: Arc<dyn GeometryEngine>,
    ) -> LifecycleResult<Self> {
        config.validate()?;
        let parts = OrchestratorParts::from_config(config, geometry)?;
        Ok(Self::new(parts, config))
    }

    /// Move a unit to `target`, dispatching to the matching transition
    pub fn advance(
        &self,
        unit: &UnitId,
        target: Stage,
        actor: &Actor,
    ) -> LifecycleResult<TransitionOutcome> {
        let current = self
            .locator
            .locate(unit)?
            .ok_or_else(|| LifecycleError::NotFound(unit.clone()))?;

        match (current.stage, target) {
            (Stage::Baseline, Stage::Editing) => self.checkout(unit, actor),
            (Stage::Editing, Stage::Review) => self.submit_for_review(unit, actor),
            (Stage::Review, Stage::Pending) => self.approve(unit, actor),
            (Stage::Pending, Stage::Baseline) => self.publish(unit, actor),
            (Stage::Review | Stage::Pending, Stage::Editing) => {
                self.return_to_editing(unit, actor)
            }
            (from, to) => Err(LifecycleError::InvalidTransition {
                unit: unit.clone(),
                from,
                to,
            }),
        }
    }

    /// Where a unit is and what its record says
    pub fn status(&self, unit: &UnitId) -> LifecycleResult<UnitStatus> {
        let location = self
            .locator
            .locate(unit)?
            .ok_or_else(|| LifecycleError::NotFound(unit.clone()))?;
        let package = self.packages.load(&location)?;
        let record = self.audit.load(&location)?;

        Ok(UnitStatus {
            unit: WorkUnit::from_package(location, &package),
            record,
        })
    }

    /// Baseline → Editing
    ///
    /// Copies the baseline into the editing stage, keeps only active lines,
    /// settles the previous cycle's polygon tags into the current view, starts
    /// a fresh transaction record and reports baseline differences from the
    /// system of record as advisories.
    pub fn checkout(&self, unit: &UnitId, actor: &Actor) -> LifecycleResult<TransitionOutcome> {
        self.ensure_checkout_free(unit)?;

        let baseline = self.locator.location_for(unit, Stage::Baseline);
        let editing = self.locator.location_for(unit, Stage::Editing);
        let locks = self.lock_transition(unit, &baseline, &editing, actor)?;
        // A concurrent checkout may have won between the first check and the lock.
        self.ensure_checkout_free(unit)?;

        self.relocator
            .copy_tree(baseline.path(), editing.path())
            .map_err(LifecycleError::Relocation)?;

        let outcome = match self.prepare_edits(unit, &baseline, &editing, actor) {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(discard) = self.relocator.discard(editing.path()) {
                    warn!("Could not discard partial checkout of {}: {}", unit, discard);
                }
                return Err(e);
            }
        };

        locks.release()?;
        info!("{} checked out by {}", unit, actor);
        Ok(outcome)
    }

    fn ensure_checkout_free(&self, unit: &UnitId) -> LifecycleResult<()> {
        let stages = self.locator.enumerate_conflicts(unit)?;
        let in_flight: Vec<Stage> =
            stages.iter().copied().filter(|s| s.is_in_flight()).collect();

        if !in_flight.is_empty() {
            return Err(ConflictError::AlreadyInFlight {
                unit: unit.clone(),
                stages: in_flight,
            }
            .into());
        }
        if stages != [Stage::Baseline] {
            return Err(LifecycleError::NotFound(unit.clone()));
        }
        Ok(())
    }

    fn prepare_edits(
        &self,
        unit: &UnitId,
        baseline: &UnitLocation,
        editing: &UnitLocation,
        actor: &Actor,
    ) -> LifecycleResult<TransitionOutcome> {
        let now = Utc::now();
        self.relocator
            .unseal(editing.path())
            .map_err(LifecycleError::Relocation)?;

        let baseline_package = self.packages.load(baseline)?;
        let mut package = baseline_package.clone();
        let before = package.lines.len();
        package.lines.retain(|line| line.is_active());
        debug!(
            "Dropped {} non-active line(s) from the working copy of {}",
            before - package.lines.len(),
            unit
        );
        let settled = package.settle_boundary();
        if settled > 0 {
            debug!(
                "Settled {} polygon(s) of {} into the current view",
                settled, unit
            );
        }
        package.change_history.push(ChangeHistoryEntry {
            extracted_at: now,
            extracted_by: actor.clone(),
        });
        package.modified_at = Some(now);
        self.packages.save(editing, &package)?;

        let record = TransactionRecord::new_cycle(unit.clone(), actor, now);
        self.audit.save(editing, &record)?;

        let mut advisories = Vec::new();
        let copied = copy_support_documents(self.relocator.as_ref(), editing.path())?;
        if copied > 0 {
            advisories.push(Finding::informational(
                FindingCategory::Prerequisite,
                Subject::dataset("documents"),
                format!("{} document(s) relevant to this update copied to documents/", copied),
            ));
        }

        match BaselineAdvisory::compute(
            self.geometry.as_ref(),
            self.system_of_record.as_ref(),
            &baseline_package,
        ) {
            Ok(advisory) if !advisory.is_empty() => {
                advisories.extend(advisory.findings());
                advisory.save(editing)?;
            }
            Ok(_) => {}
            Err(e) => advisories.push(Finding::informational(
                FindingCategory::Collaborator,
                Subject::dataset("boundary"),
                format!("baseline comparison with the system of record skipped: {}", e),
            )),
        }

        let work_unit = WorkUnit::from_package(editing.clone(), &package);
        let mut outcome = TransitionOutcome::new(work_unit, Stage::Baseline);
        outcome.advisories = advisories;
        Ok(outcome)
    }

    /// Run the check-edits gate on an editing unit and record the attempt
    pub fn check(&self, unit: &UnitId, actor: &Actor) -> LifecycleResult<GateResult> {
        let location = self.resolve_in_flight(unit, Stage::Editing, Stage::Review)?;
        let lock = self.lock_unit(unit, &location, actor)?;
        self.resolve_in_flight(unit, Stage::Editing, Stage::Review)?;

        let package = self.packages.load(&location)?;
        let mut record = self.record_or_new_cycle(unit, &location, actor)?;
        let result =
            self.run_and_record(GateName::CheckEdits, &location, &package, &mut record, actor)?;

        lock.release()?;
        Ok(result)
    }

    /// Editing → Review
    ///
    /// Requires check-edits to pass. Review artifacts are computed afterwards
    /// on a best-effort basis.
    pub fn submit_for_review(
        &self,
        unit: &UnitId,
        actor: &Actor,
    ) -> LifecycleResult<TransitionOutcome> {
        let editing = self.resolve_in_flight(unit, Stage::Editing, Stage::Review)?;
        let review = self.locator.location_for(unit, Stage::Review);
        let locks = self.lock_transition(unit, &editing, &review, actor)?;
        self.resolve_in_flight(unit, Stage::Editing, Stage::Review)?;

        let package = self.packages.load(&editing)?;
        let mut record = self.record_or_new_cycle(unit, &editing, actor)?;
        let result =
            self.run_and_record(GateName::CheckEdits, &editing, &package, &mut record, actor)?;
        Self::require_pass(&result)?;

        self.relocator
            .relocate(editing.path(), review.path())
            .map_err(LifecycleError::Relocation)?;

        record.push(
            AuditAction::SubmitForReview,
            actor,
            true,
            "submitted for review",
            Utc::now(),
        );
        self.audit.save(&review, &record)?;

        if let Err(e) = self.write_review_artifacts(unit, &review, &package) {
            warn!("Review artifacts for {} not written: {}", unit, e);
        }

        locks.release()?;
        info!("{} submitted for review by {}", unit, actor);

        let work_unit = WorkUnit::from_package(review, &package);
        let mut outcome = TransitionOutcome::new(work_unit, Stage::Editing);
        outcome.advisories = result.informational().cloned().collect();
        outcome.gate = Some(result);
        Ok(outcome)
    }

    fn write_review_artifacts(
        &self,
        unit: &UnitId,
        review: &UnitLocation,
        package: &UnitPackage,
    ) -> LifecycleResult<()> {
        let baseline = self.locator.location_for(unit, Stage::Baseline);
        let baseline_package = self.packages.load(&baseline)?;
        let artifacts =
            ReviewArtifacts::compute(self.geometry.as_ref(), package, &baseline_package)?;
        let path = artifacts.save(review)?;
        debug!("Review artifacts for {} written to {}", unit, path.display());
        Ok(())
    }

    /// Review → Pending
    ///
    /// Requires the review gate to pass, including segregation of duties. The
    /// package is sealed read-only in pending.
    pub fn approve(&self, unit: &UnitId, actor: &Actor) -> LifecycleResult<TransitionOutcome> {
        let review = self.resolve_in_flight(unit, Stage::Review, Stage::Pending)?;
        let pending = self.locator.location_for(unit, Stage::Pending);
        let locks = self.lock_transition(unit, &review, &pending, actor)?;
        self.resolve_in_flight(unit, Stage::Review, Stage::Pending)?;

        let package = self.packages.load(&review)?;
        let mut record = self.audit.load(&review)?;
        let result = self.gate_with_optional_record(
            GateName::Review,
            &review,
            &package,
            record.as_mut(),
            actor,
        )?;
        Self::require_pass(&result)?;
        let mut record = record.ok_or_else(|| Self::missing_record(&review, unit))?;

        self.relocator
            .relocate(review.path(), pending.path())
            .map_err(LifecycleError::Relocation)?;
        self.relocator
            .seal(pending.path())
            .map_err(LifecycleError::Relocation)?;

        record.push(AuditAction::Approve, actor, true, "approved for publication", Utc::now());
        self.audit.save(&pending, &record)?;

        locks.release()?;
        info!("{} approved by {}", unit, actor);

        let work_unit = WorkUnit::from_package(pending, &package);
        let mut outcome = TransitionOutcome::new(work_unit, Stage::Review);
        outcome.gate = Some(result);
        Ok(outcome)
    }

    /// Pending → Baseline
    ///
    /// Re-validates domains, updates downstream datasets, archives the old
    /// baseline and moves the unit into its place. If any dataset update fails
    /// the unit stays pending and the call can be repeated.
    pub fn publish(&self, unit: &UnitId, actor: &Actor) -> LifecycleResult<TransitionOutcome> {
        let pending = self.resolve_in_flight(unit, Stage::Pending, Stage::Baseline)?;
        let baseline = self.locator.location_for(unit, Stage::Baseline);
        let locks = self.lock_transition(unit, &pending, &baseline, actor)?;
        self.resolve_in_flight(unit, Stage::Pending, Stage::Baseline)?;

        let package = self.packages.load(&pending)?;
        let mut record = self.audit.load(&pending)?;
        let result = self.gate_with_optional_record(
            GateName::Publish,
            &pending,
            &package,
            record.as_mut(),
            actor,
        )?;
        Self::require_pass(&result)?;
        let mut record = record.ok_or_else(|| Self::missing_record(&pending, unit))?;

        let previous = if baseline.path().is_dir() {
            Some(self.packages.load(&baseline)?)
        } else {
            None
        };

        let mut change_set = self.reconciler.reconcile(
            &package,
            previous.as_ref(),
            self.system_of_record.as_ref(),
        )?;
        if let Some(open) = record.open_publication {
            debug!("{} resumes publication of change set {}", unit, open);
            change_set.id = open;
        }

        self.relocator
            .preflight(pending.path(), baseline.path())
            .map_err(LifecycleError::Relocation)?;

        let now = Utc::now();
        let report = apply_change_set(
            self.datasets.as_ref(),
            &change_set,
            &Restamp::new(change_set.id, actor.clone(), now),
        );
        if !report.is_complete() {
            record.open_publication = Some(change_set.id);
            record.mark_submitted(actor, now, false, report.to_string());
            self.audit.save(&pending, &record)?;
            return Err(LifecycleError::ReconciliationPartialFailure(report));
        }

        let archived = if baseline.path().is_dir() {
            let key = self.archive_key(unit, now);
            Some(
                self.relocator
                    .archive(baseline.path(), &key)
                    .map_err(LifecycleError::Relocation)?,
            )
        } else {
            None
        };
        self.relocator
            .relocate(pending.path(), baseline.path())
            .map_err(LifecycleError::Relocation)?;
        self.relocator
            .seal(baseline.path())
            .map_err(LifecycleError::Relocation)?;

        record.open_publication = None;
        record.mark_submitted(actor, Utc::now(), true, report.to_string());
        self.audit.save(&baseline, &record)?;

        locks.release()?;
        info!("{} published by {}: {}", unit, actor, report);

        let work_unit = WorkUnit::from_package(baseline, &package);
        let mut outcome = TransitionOutcome::new(work_unit, Stage::Pending);
        outcome.gate = Some(result);
        outcome.change_set = Some(change_set);
        outcome.apply_report = Some(report);
        outcome.archived = archived;
        Ok(outcome)
    }

    /// Review or Pending → Editing
    ///
    /// Clears the review and publication flags; the cycle's editors stay
    /// disqualified from approving.
    pub fn return_to_editing(
        &self,
        unit: &UnitId,
        actor: &Actor,
    ) -> LifecycleResult<TransitionOutcome> {
        let current = self.resolve_single_in_flight(unit)?;
        if !matches!(current.stage, Stage::Review | Stage::Pending) {
            return Err(LifecycleError::InvalidTransition {
                unit: unit.clone(),
                from: current.stage,
                to: Stage::Editing,
            });
        }
        let editing = self.locator.location_for(unit, Stage::Editing);
        let locks = self.lock_transition(unit, &current, &editing, actor)?;
        self.resolve_in_flight(unit, current.stage, Stage::Editing)?;

        self.relocator
            .relocate(current.path(), editing.path())
            .map_err(LifecycleError::Relocation)?;
        self.relocator
            .unseal(editing.path())
            .map_err(LifecycleError::Relocation)?;

        let mut record = self.record_or_new_cycle(unit, &editing, actor)?;
        record.reset_beyond_editing(actor, Utc::now());
        self.audit.save(&editing, &record)?;

        locks.release()?;
        info!("{} returned to editing from {} by {}", unit, current.stage, actor);

        let package = self.packages.load(&editing)?;
        Ok(TransitionOutcome::new(
            WorkUnit::from_package(editing, &package),
            current.stage,
        ))
    }

    /// Lock the location a transition leaves and the one it enters
    ///
    /// Holding both keeps a second process from acting on the unit at its
    /// destination before this transition has finished writing there.
    fn lock_transition(
        &self,
        unit: &UnitId,
        source: &UnitLocation,
        destination: &UnitLocation,
        actor: &Actor,
    ) -> LifecycleResult<TransitionLocks> {
        let source = self.lock_unit(unit, source, actor)?;
        let destination = self.lock_unit(unit, destination, actor)?;
        Ok(TransitionLocks {
            source,
            destination,
        })
    }

    /// Take a unit lock: try, compact and retry once, then wait if configured
    fn lock_unit(
        &self,
        unit: &UnitId,
        location: &UnitLocation,
        actor: &Actor,
    ) -> LifecycleResult<UnitLock> {
        let path = location.path();
        if let LockOutcome::Acquired(lock) = self.locks.try_acquire(path, actor)? {
            return Ok(lock);
        }

        if let Err(e) = self.relocator.compact(path) {
            warn!("Compaction of {} before lock retry failed: {}", path.display(), e);
        }

        let holder = match self.locks.try_acquire(path, actor)? {
            LockOutcome::Acquired(lock) => return Ok(lock),
            LockOutcome::HeldBy(holder) => holder,
        };

        if self.locking.unit_lock_wait_ms == 0 {
            return Err(ConflictError::Locked {
                unit: unit.clone(),
                holder,
            }
            .into());
        }

        debug!(
            "{} held by {}; waiting up to {} ms",
            unit, holder, self.locking.unit_lock_wait_ms
        );
        match self.locks.acquire_blocking(
            path,
            actor,
            Duration::from_millis(self.locking.unit_lock_wait_ms),
            Duration::from_millis(self.locking.poll_interval_ms),
        ) {
            Ok(lock) => Ok(lock),
            Err(e) => match e.blocking_holder() {
                Some(holder) => Err(ConflictError::Locked {
                    unit: unit.clone(),
                    holder: holder.clone(),
                }
                .into()),
                None => Err(e.into()),
            },
        }
    }

    fn resolve_single_in_flight(&self, unit: &UnitId) -> LifecycleResult<UnitLocation> {
        let stages = self.locator.enumerate_conflicts(unit)?;
        let in_flight: Vec<Stage> =
            stages.iter().copied().filter(|s| s.is_in_flight()).collect();

        match in_flight.as_slice() {
            [stage] => Ok(self.locator.location_for(unit, *stage)),
            [] if stages.is_empty() => Err(LifecycleError::NotFound(unit.clone())),
            [] => Err(LifecycleError::InvalidTransition {
                unit: unit.clone(),
                from: Stage::Baseline,
                to: Stage::Editing,
            }),
            _ => Err(ConflictError::MultipleStages {
                unit: unit.clone(),
                stages: in_flight,
            }
            .into()),
        }
    }

    fn resolve_in_flight(
        &self,
        unit: &UnitId,
        expected: Stage,
        target: Stage,
    ) -> LifecycleResult<UnitLocation> {
        let location = match self.resolve_single_in_flight(unit) {
            Err(LifecycleError::InvalidTransition { unit, from, .. }) => {
                return Err(LifecycleError::InvalidTransition {
                    unit,
                    from,
                    to: target,
                })
            }
            other => other?,
        };

        if location.stage != expected {
            return Err(LifecycleError::InvalidTransition {
                unit: unit.clone(),
                from: location.stage,
                to: target,
            });
        }
        Ok(location)
    }

    fn record_or_new_cycle(
        &self,
        unit: &UnitId,
        location: &UnitLocation,
        actor: &Actor,
    ) -> LifecycleResult<TransactionRecord> {
        match self.audit.load(location)? {
            Some(record) => Ok(record),
            None => {
                warn!("{} has no transaction record; starting one for {}", unit, actor);
                Ok(TransactionRecord::new_cycle(unit.clone(), actor, Utc::now()))
            }
        }
    }

    fn run_and_record(
        &self,
        gate: GateName,
        location: &UnitLocation,
        package: &UnitPackage,
        record: &mut TransactionRecord,
        actor: &Actor,
    ) -> LifecycleResult<GateResult> {
        let result = self
            .gateway
            .run_gate(gate, &GateContext::new(package, Some(&*record), actor));
        record.record_gate(&result, actor, Utc::now());
        self.audit.save(location, record)?;
        Ok(result)
    }

    fn gate_with_optional_record(
        &self,
        gate: GateName,
        location: &UnitLocation,
        package: &UnitPackage,
        record: Option<&mut TransactionRecord>,
        actor: &Actor,
    ) -> LifecycleResult<GateResult> {
        match record {
            Some(record) => self.run_and_record(gate, location, package, record, actor),
            None => Ok(self
                .gateway
                .run_gate(gate, &GateContext::new(package, None, actor))),
        }
    }

    fn require_pass(result: &GateResult) -> LifecycleResult<()> {
        if result.passed {
            return Ok(());
        }
        Err(LifecycleError::Validation {
            gate: result.gate,
            result: result.clone(),
        })
    }

    fn missing_record(location: &UnitLocation, unit: &UnitId) -> LifecycleError {
        LifecycleError::MissingRecord {
            unit: unit.clone(),
            stage: location.stage,
        }
    }

    /// `<unit>_<UTC timestamp>`, suffixed when the slot is taken
    fn archive_key(&self, unit: &UnitId, at: chrono::DateTime<Utc>) -> String {
        let base = format!("{}_{}", unit, at.format("%Y%m%d_%H%M%S"));
        let root = self.locator.archive_root();
        let mut key = base.clone();
        let mut n = 1;
        while root.join(&key).exists() {
            key = format!("{}_{}", base, n);
            n += 1;
        }
        key
    }
}

/// Locks on both ends of a transition
struct TransitionLocks {
    source: UnitLock,
    destination: UnitLock,
}

impl TransitionLocks {
    /// Release the destination, then the source
    fn release(self) -> LifecycleResult<()> {
        let destination = self.destination.release();
        self.source.release()?;
        destination?;
        Ok(())
    }
}

/// Copy `documents/Update_Support_Documents` up into `documents/`
fn copy_support_documents(
    relocator: &dyn StorageRelocator,
    unit_root: &Path,
) -> LifecycleResult<usize> {
    let source = unit_root.join(SUPPORT_DOCUMENTS_DIR);
    if !source.is_dir() {
        return Ok(0);
    }
    let target = unit_root.join("documents");
    let read_error =
        |e: std::io::Error| StorageError::io_error(source.clone(), IoOperation::Read, e);

    let mut copied = 0;
    for entry in std::fs::read_dir(&source).map_err(read_error)? {
        let entry = entry.map_err(read_error)?;
        let path = entry.path();
        let dest = target.join(entry.file_name());
        if dest.exists() {
            debug!("{} already present, not copied", dest.display());
            continue;
        }
        if path.is_dir() {
            relocator
                .copy_tree(&path, &dest)
                .map_err(LifecycleError::Relocation)?;
        } else {
            std::fs::copy(&path, &dest)
                .map_err(|e| StorageError::io_error(dest.clone(), IoOperation::Write, e))?;
        }
        copied += 1;
    }

    if copied > 0 {
        warn!(
            "{} document(s) relevant to this update copied to {}",
            copied,
            target.display()
        );
    }
    Ok(copied)
}
