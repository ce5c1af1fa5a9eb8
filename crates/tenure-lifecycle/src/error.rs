//! Error types for the lifecycle engine

use crate::collaborators::CollaboratorError;
use crate::downstream::ApplyReport;
use crate::gate::{GateName, GateResult};
use tenure_storage::{LockHolder, Stage, StorageError, UnitId};
use thiserror::Error;

/// Transition refused because the unit is contended
#[derive(Debug, Clone, Error)]
pub enum ConflictError {
    /// Checkout of a unit that already has an in-flight copy
    #[error("Unit {unit} is already checked out ({})", stage_list(.stages))]
    AlreadyInFlight {
        /// Unit being checked out
        unit: UnitId,
        /// In-flight stages holding a copy
        stages: Vec<Stage>,
    },

    /// Unit present in more than one in-flight stage
    #[error(
        "Unit {unit} exists in more than one stage ({}); resolve manually",
        stage_list(.stages)
    )]
    MultipleStages {
        /// Affected unit
        unit: UnitId,
        /// Every stage holding a copy
        stages: Vec<Stage>,
    },

    /// Someone else holds the unit's lock
    #[error("Unit {unit} is locked by {holder}; retry later")]
    Locked {
        /// Affected unit
        unit: UnitId,
        /// Current holder
        holder: LockHolder,
    },
}

fn stage_list(stages: &[Stage]) -> String {
    stages
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors that can occur while driving a unit through its lifecycle
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Unit contended; retry later
    #[error("Conflict: {0}")]
    Conflict(#[from] ConflictError),

    /// A gate reported blocking findings
    #[error("Validation failed: {}", .result.summary())]
    Validation {
        /// Gate that failed
        gate: GateName,
        /// Every finding of the failed run
        result: GateResult,
    },

    /// Moving the unit's storage failed; needs manual intervention
    #[error("Relocation failed: {0}")]
    Relocation(StorageError),

    /// Some downstream datasets were updated and some were not
    #[error("Publication partially applied: {0}")]
    ReconciliationPartialFailure(ApplyReport),

    /// Requested stage change is not a lifecycle transition
    #[error("Unit {unit} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Affected unit
        unit: UnitId,
        /// Current stage
        from: Stage,
        /// Requested stage
        to: Stage,
    },

    /// Unit is in no stage
    #[error("Unit not found: {0}")]
    NotFound(UnitId),

    /// Unit past editing has no transaction record to check against
    #[error("Unit {unit} in {stage} has no transaction record")]
    MissingRecord {
        /// Affected unit
        unit: UnitId,
        /// Stage it was found in
        stage: Stage,
    },

    /// Storage error outside relocation
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// External collaborator failed outside a gate
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    /// Stored record could not be read or written
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration unusable
    #[error("Configuration error: {0}")]
    Config(#[from] tenure_config::ConfigError),
}

impl LifecycleError {
    /// Whether retrying the same call later can succeed without remediation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LifecycleError::Conflict(ConflictError::Locked { .. })
                | LifecycleError::ReconciliationPartialFailure(_)
        )
    }

    /// Whether an operator has to repair storage by hand
    pub fn requires_intervention(&self) -> bool {
        matches!(
            self,
            LifecycleError::Relocation(_)
                | LifecycleError::MissingRecord { .. }
                | LifecycleError::Conflict(ConflictError::MultipleStages { .. })
                | LifecycleError::Conflict(ConflictError::AlreadyInFlight { .. })
        )
    }

    /// Gate result carried by a validation failure
    pub fn gate_result(&self) -> Option<&GateResult> {
        match self {
            LifecycleError::Validation { result, .. } => Some(result),
            _ => None,
        }
    }
}

/// Result type for lifecycle operations
pub type LifecycleResult<T> = Result<T, LifecycleError>;
