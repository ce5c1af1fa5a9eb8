#![warn(missing_docs)]

//! Tenure Boundary Lifecycle
//!
//! Moves a tree farm licence boundary update through its custody stages:
//! a sealed baseline is checked out for editing, checked, reviewed by someone
//! who did not edit it, and published back over the baseline. Publication
//! updates the downstream change datasets and archives the previous baseline.
//!
//! Each transition is guarded by a validation gate ([`gateway`]) and recorded
//! in the unit's own transaction record ([`audit`]). Geometry, attribute
//! domains and the warehouse system of record are external collaborators
//! ([`collaborators`]).

pub mod artifacts;
pub mod audit;
pub mod collaborators;
pub mod downstream;
pub mod error;
pub mod gate;
pub mod gateway;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod package_store;
pub mod reconciler;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

#[cfg(test)]
mod gateway_properties;

#[cfg(test)]
mod reconciler_properties;

pub use artifacts::{BaselineAdvisory, LineChange, LineChangeKind, ReviewArtifacts};
pub use audit::{AuditAction, AuditEntry, AuditTrail, FsAuditTrail, StageCheck, TransactionRecord};
pub use collaborators::{
    CollaboratorError, DomainCatalog, GeometryEngine, RecordFeature, RecordSnapshot,
    RuleViolation, StaticDomainCatalog, SystemOfRecord, Topology, TopologyRule, TopologySpec,
};
pub use downstream::{
    apply_change_set, ApplyReport, DatasetBackup, DatasetFailure, DatasetKind, DatasetSpec,
    DatasetStore, DownstreamRow, FsDatasetStore, Restamp,
};
pub use error::{ConflictError, LifecycleError, LifecycleResult};
pub use gate::{Finding, FindingCategory, GateName, GateResult, Severity, Subject};
pub use gateway::{GateContext, ValidationGateway};
pub use logging::init_logging;
pub use models::{
    BoundaryPolygon, ChangeHistoryEntry, Feature, FeatureSet, Geometry, LineRecord, PolyType,
    ScheduleAFeature, UnitPackage, WorkUnit,
};
pub use orchestrator::{LifecycleOrchestrator, OrchestratorParts, TransitionOutcome, UnitStatus};
pub use package_store::{FsPackageStore, PackageStore};
pub use reconciler::{
    ChangeClass, ChangeReconciler, ChangeSet, Comparand, DatasetChange, DiffArtifact,
    KeyAssignment, ReconcileDecision,
};
