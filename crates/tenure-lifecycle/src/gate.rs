//! Gate results and findings

use serde::{Deserialize, Serialize};
use std::fmt;

/// Validation gate guarding a stage transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateName {
    /// Editing → Review
    CheckEdits,
    /// Review → Pending
    Review,
    /// Pending → Baseline
    Publish,
}

impl fmt::Display for GateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GateName::CheckEdits => "check-edits",
            GateName::Review => "review",
            GateName::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// Whether a finding stops the transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Transition must not proceed
    Blocking,
    /// Reported for awareness only
    Informational,
}

/// What kind of check produced a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    /// Required attribute is null
    MissingValue,
    /// Attribute value outside its enumerated domain
    DomainViolation,
    /// Topology could not be built or a rule failed
    Topology,
    /// Linework does not close into polygons
    PolygonBuild,
    /// Data changed after it was last checked
    StaleCheck,
    /// Reviewer is also an editor
    SegregationOfDuties,
    /// Polygon classification rules
    PolygonRules,
    /// Containment or overlap against other geometry
    Spatial,
    /// Earlier stage record missing or failed
    Prerequisite,
    /// External collaborator failed
    Collaborator,
}

/// What a finding is about
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Subject {
    /// Dataset, e.g. `lines` or `boundary`
    pub dataset: String,
    /// Field, when the finding concerns one attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Features involved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

impl Subject {
    /// Subject covering a whole dataset
    pub fn dataset(dataset: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            ..Self::default()
        }
    }

    /// Subject covering one field of a dataset
    pub fn field(dataset: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            field: Some(field.into()),
            features: Vec::new(),
        }
    }

    /// Attach the features involved
    pub fn with_features(mut self, features: Vec<String>) -> Self {
        self.features = features;
        self
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{}", self.dataset, field),
            None => f.write_str(&self.dataset),
        }
    }
}

/// One human-readable gate finding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// Blocking or informational
    pub severity: Severity,
    /// Kind of check
    pub category: FindingCategory,
    /// What the finding is about
    pub subject: Subject,
    /// Message for the editor or reviewer
    pub message: String,
}

impl Finding {
    /// Blocking finding
    pub fn blocking(
        category: FindingCategory,
        subject: Subject,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Blocking,
            category,
            subject,
            message: message.into(),
        }
    }

    /// Informational finding
    pub fn informational(
        category: FindingCategory,
        subject: Subject,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Informational,
            category,
            subject,
            message: message.into(),
        }
    }

    /// Whether this finding stops the transition
    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Blocking
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let severity = match self.severity {
            Severity::Blocking => "BLOCKING",
            Severity::Informational => "INFO",
        };
        write!(f, "[{}] {}: {}", severity, self.subject, self.message)
    }
}

/// Outcome of running one gate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateResult {
    /// Gate that ran
    pub gate: GateName,
    /// True when no finding is blocking
    pub passed: bool,
    /// Findings in check order
    pub findings: Vec<Finding>,
}

impl GateResult {
    /// Result from an ordered finding list
    pub fn from_findings(gate: GateName, findings: Vec<Finding>) -> Self {
        let passed = !findings.iter().any(Finding::is_blocking);
        Self {
            gate,
            passed,
            findings,
        }
    }

    /// Blocking findings only
    pub fn blocking(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.is_blocking())
    }

    /// Informational findings only
    pub fn informational(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| !f.is_blocking())
    }

    /// One-line summary for logs
    pub fn summary(&self) -> String {
        format!(
            "{} gate {}: {} blocking, {} informational",
            self.gate,
            if self.passed { "passed" } else { "failed" },
            self.blocking().count(),
            self.informational().count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_informational_findings_do_not_fail() {
        let result = GateResult::from_findings(
            GateName::CheckEdits,
            vec![Finding::informational(
                FindingCategory::Spatial,
                Subject::dataset("schedule_a"),
                "1 feature(s) outside boundary",
            )],
        );
        assert!(result.passed);
        assert_eq!(result.informational().count(), 1);
    }

    #[test]
    fn test_any_blocking_fails() {
        let result = GateResult::from_findings(
            GateName::Review,
            vec![
                Finding::informational(FindingCategory::Spatial, Subject::dataset("boundary"), "x"),
                Finding::blocking(
                    FindingCategory::SegregationOfDuties,
                    Subject::dataset("transaction"),
                    "reviewer edited this unit",
                ),
            ],
        );
        assert!(!result.passed);
        assert_eq!(result.summary(), "review gate failed: 1 blocking, 1 informational");
    }

    #[test]
    fn test_finding_display() {
        let finding = Finding::blocking(
            FindingCategory::MissingValue,
            Subject::field("lines", "Status_Code"),
            "missing Status_Code on 1 line(s)",
        );
        assert_eq!(
            finding.to_string(),
            "[BLOCKING] lines.Status_Code: missing Status_Code on 1 line(s)"
        );
    }
}
