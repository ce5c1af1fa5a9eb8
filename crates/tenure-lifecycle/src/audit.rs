//! Per-unit transaction record
//!
//! Each unit carries exactly one [`TransactionRecord`] inside its own storage
//! tree, so the record relocates with the unit. The record is replaced at
//! checkout and updated in place afterwards; it is never deleted.

use crate::error::{LifecycleError, LifecycleResult};
use crate::gate::{GateName, GateResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tenure_storage::{Actor, IoOperation, StorageError, UnitId, UnitLocation};
use tracing::debug;
use uuid::Uuid;

/// File name of the record inside a unit tree
pub const TRANSACTION_FILE: &str = "transaction.yaml";

/// Gate-pass flag for one stage boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCheck {
    /// Whether the gate passed
    pub passed: bool,
    /// When it ran
    pub at: DateTime<Utc>,
    /// Who ran it
    pub by: Actor,
}

/// What happened to the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Extracted from baseline
    Checkout,
    /// Editing → Review gate run
    CheckEditsGate,
    /// Review → Pending gate run
    ReviewGate,
    /// Pending → Baseline gate run
    PublishGate,
    /// Moved to review
    SubmitForReview,
    /// Moved to pending
    Approve,
    /// Published to baseline
    Publish,
    /// Sent back for rework
    ReturnToEditing,
}

impl AuditAction {
    /// Action recorded for a gate run
    pub fn for_gate(gate: GateName) -> Self {
        match gate {
            GateName::CheckEdits => AuditAction::CheckEditsGate,
            GateName::Review => AuditAction::ReviewGate,
            GateName::Publish => AuditAction::PublishGate,
        }
    }
}

/// One line of the unit's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When
    pub at: DateTime<Utc>,
    /// Who
    pub actor: Actor,
    /// What
    pub action: AuditAction,
    /// Whether it succeeded
    pub passed: bool,
    /// Short description
    pub summary: String,
}

/// The single audit row of a work unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Unit the record belongs to
    pub unit_id: UnitId,
    /// When the current cycle's checkout happened
    pub cycle_started_at: DateTime<Utc>,
    /// Who checked the unit out
    #[serde(default)]
    pub extracted_by: Option<Actor>,
    /// Editing → Review gate
    #[serde(default)]
    pub checked: Option<StageCheck>,
    /// Review → Pending gate
    #[serde(default)]
    pub reviewed: Option<StageCheck>,
    /// Pending → Baseline publication
    #[serde(default)]
    pub submitted: Option<StageCheck>,
    /// Everyone who edited or checked the unit this cycle
    #[serde(default)]
    pub editors: BTreeSet<Actor>,
    /// Chronological history
    #[serde(default)]
    pub history: Vec<AuditEntry>,
    /// Change set of a publication that updated some datasets but not all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_publication: Option<Uuid>,
}

impl TransactionRecord {
    /// Fresh record for a new checkout
    pub fn new_cycle(unit_id: UnitId, actor: &Actor, at: DateTime<Utc>) -> Self {
        let mut record = Self {
            unit_id,
            cycle_started_at: at,
            extracted_by: Some(actor.clone()),
            checked: None,
            reviewed: None,
            submitted: None,
            editors: BTreeSet::new(),
            history: Vec::new(),
            open_publication: None,
        };
        record.editors.insert(actor.clone());
        record.push(AuditAction::Checkout, actor, true, "checked out from baseline", at);
        record
    }

    /// Append a history entry
    pub fn push(
        &mut self,
        action: AuditAction,
        actor: &Actor,
        passed: bool,
        summary: impl Into<String>,
        at: DateTime<Utc>,
    ) {
        self.history.push(AuditEntry {
            at,
            actor: actor.clone(),
            action,
            passed,
            summary: summary.into(),
        });
    }

    /// Record a gate run
    ///
    /// The check and review gates set their stage flag on every run. The
    /// publish gate only sets the submitted flag when it fails; success is
    /// recorded by [`TransactionRecord::mark_submitted`] once publication
    /// completes.
    pub fn record_gate(&mut self, result: &GateResult, actor: &Actor, at: DateTime<Utc>) {
        let check = StageCheck {
            passed: result.passed,
            at,
            by: actor.clone(),
        };

        match result.gate {
            GateName::CheckEdits => {
                self.editors.insert(actor.clone());
                self.checked = Some(check);
            }
            GateName::Review => self.reviewed = Some(check),
            GateName::Publish => {
                if !result.passed {
                    self.submitted = Some(check);
                }
            }
        }

        self.push(AuditAction::for_gate(result.gate), actor, result.passed, result.summary(), at);
    }

    /// Record the outcome of publication
    pub fn mark_submitted(
        &mut self,
        actor: &Actor,
        at: DateTime<Utc>,
        passed: bool,
        summary: impl Into<String>,
    ) {
        self.submitted = Some(StageCheck {
            passed,
            at,
            by: actor.clone(),
        });
        self.push(AuditAction::Publish, actor, passed, summary, at);
    }

    /// Clear the flags of every stage past editing
    pub fn reset_beyond_editing(&mut self, actor: &Actor, at: DateTime<Utc>) {
        self.reviewed = None;
        self.submitted = None;
        self.push(AuditAction::ReturnToEditing, actor, true, "returned to editing", at);
    }

    /// Actor who ran the last passing check
    pub fn editor_of(&self) -> Option<&Actor> {
        self.checked.as_ref().filter(|c| c.passed).map(|c| &c.by)
    }

    /// Whether `actor` edited, checked or extracted the unit this cycle
    pub fn is_editor(&self, actor: &Actor) -> bool {
        self.editors.contains(actor)
            || self.extracted_by.as_ref() == Some(actor)
            || self.checked.as_ref().map(|c| &c.by) == Some(actor)
    }

    /// When the last passing check ran
    pub fn checked_at(&self) -> Option<DateTime<Utc>> {
        self.checked.as_ref().filter(|c| c.passed).map(|c| c.at)
    }

    /// Whether the review gate passed
    pub fn review_passed(&self) -> bool {
        self.reviewed.as_ref().map(|r| r.passed).unwrap_or(false)
    }
}

/// Storage of transaction records
pub trait AuditTrail: Send + Sync {
    /// Record of the unit at `location`, if any
    fn load(&self, location: &UnitLocation) -> LifecycleResult<Option<TransactionRecord>>;

    /// Replace the unit's record
    fn save(&self, location: &UnitLocation, record: &TransactionRecord) -> LifecycleResult<()>;
}

/// Record stored as YAML in the unit tree
#[derive(Debug, Clone, Default)]
pub struct FsAuditTrail;

impl FsAuditTrail {
    /// Create a filesystem audit trail
    pub fn new() -> Self {
        Self
    }

    /// Path of the record inside a unit tree
    pub fn record_path(location: &UnitLocation) -> PathBuf {
        location.path().join(TRANSACTION_FILE)
    }

    fn read(path: &Path) -> LifecycleResult<TransactionRecord> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StorageError::io_error(path.to_path_buf(), IoOperation::Read, e))?;

        if let Ok(record) = serde_json::from_str::<TransactionRecord>(&content) {
            return Ok(record);
        }

        serde_yaml::from_str::<TransactionRecord>(&content).map_err(|e| {
            LifecycleError::Serialization(format!(
                "Failed to deserialize transaction record {}: {}",
                path.display(),
                e
            ))
        })
    }
}

impl AuditTrail for FsAuditTrail {
    fn load(&self, location: &UnitLocation) -> LifecycleResult<Option<TransactionRecord>> {
        let path = Self::record_path(location);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn save(&self, location: &UnitLocation, record: &TransactionRecord) -> LifecycleResult<()> {
        let path = Self::record_path(location);
        let yaml = serde_yaml::to_string(record).map_err(|e| {
            LifecycleError::Serialization(format!("Failed to serialize transaction record: {}", e))
        })?;

        crate::package_store::write_in_unit(location, &path, yaml.as_bytes())?;
        debug!("Saved transaction record for {} at {}", record.unit_id, path.display());
        Ok(())
    }
}
