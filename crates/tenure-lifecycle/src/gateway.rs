//! Validation gates guarding each stage transition
//!
//! A gate is a pure function of the unit package, its transaction record and
//! the acting user: the same inputs always yield the same findings. Structural
//! prerequisites short-circuit a gate; content checks accumulate.

use crate::audit::TransactionRecord;
use crate::collaborators::{DomainCatalog, GeometryEngine, SystemOfRecord, TopologySpec};
use crate::gate::{Finding, FindingCategory, GateName, GateResult, Subject};
use crate::models::{PolyType, UnitPackage};
use std::collections::BTreeMap;
use std::sync::Arc;
use tenure_storage::Actor;
use tracing::debug;

const LINES: &str = "lines";
const BOUNDARY: &str = "boundary";
const SCHEDULE_A: &str = "schedule_a";
const TRANSACTION: &str = "transaction";

/// Attribute fields a domain may govern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    LegalDescription,
    StatusCode,
    SourceCode,
    PolyType,
    LegislativeTool,
    ForestFileId,
}

impl Field {
    const LINE_FIELDS: [Field; 3] = [Field::LegalDescription, Field::StatusCode, Field::SourceCode];
    const ALL: [Field; 6] = [
        Field::LegalDescription,
        Field::StatusCode,
        Field::SourceCode,
        Field::PolyType,
        Field::LegislativeTool,
        Field::ForestFileId,
    ];

    fn name(self) -> &'static str {
        match self {
            Field::LegalDescription => "Legal_Description",
            Field::StatusCode => "Status_Code",
            Field::SourceCode => "Source_Code",
            Field::PolyType => "Poly_Type",
            Field::LegislativeTool => "Legislative_Tool",
            Field::ForestFileId => "Forest_File_Id",
        }
    }

    fn dataset(self) -> &'static str {
        match self {
            Field::LegalDescription | Field::StatusCode | Field::SourceCode => LINES,
            Field::PolyType | Field::LegislativeTool => BOUNDARY,
            Field::ForestFileId => SCHEDULE_A,
        }
    }

    /// Whether a null is acceptable in the published package
    fn nullable(self) -> bool {
        matches!(self, Field::LegislativeTool | Field::ForestFileId)
    }

    /// (feature key, value) for every record of the field's dataset
    fn values(self, package: &UnitPackage) -> Vec<(&str, Option<&str>)> {
        match self {
            Field::LegalDescription => package
                .lines
                .iter()
                .map(|l| (l.feature_key.as_str(), l.legal_description.as_deref()))
                .collect(),
            Field::StatusCode => package
                .lines
                .iter()
                .map(|l| (l.feature_key.as_str(), l.status_code.as_deref()))
                .collect(),
            Field::SourceCode => package
                .lines
                .iter()
                .map(|l| (l.feature_key.as_str(), l.source_code.as_deref()))
                .collect(),
            Field::PolyType => package
                .boundary
                .iter()
                .map(|p| (p.feature_key.as_str(), p.poly_type.as_deref()))
                .collect(),
            Field::LegislativeTool => package
                .boundary
                .iter()
                .map(|p| (p.feature_key.as_str(), p.legislative_tool.as_deref()))
                .collect(),
            Field::ForestFileId => package
                .schedule_a
                .iter()
                .map(|s| (s.feature_key.as_str(), s.forest_file_id.as_deref()))
                .collect(),
        }
    }
}

/// Everything a gate looks at
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    /// Unit data
    pub package: &'a UnitPackage,
    /// Unit's transaction record, if it has one
    pub record: Option<&'a TransactionRecord>,
    /// Who is asking for the transition
    pub actor: &'a Actor,
}

impl<'a> GateContext<'a> {
    /// Build a gate context
    pub fn new(
        package: &'a UnitPackage,
        record: Option<&'a TransactionRecord>,
        actor: &'a Actor,
    ) -> Self {
        Self {
            package,
            record,
            actor,
        }
    }
}

/// Runs the ordered checks of each gate
pub struct ValidationGateway {
    geometry: Arc<dyn GeometryEngine>,
    domains: Arc<dyn DomainCatalog>,
    system_of_record: Arc<dyn SystemOfRecord>,
    cluster_tolerance: f64,
}

impl ValidationGateway {
    /// Create a gateway over its collaborators
    pub fn new(
        geometry: Arc<dyn GeometryEngine>,
        domains: Arc<dyn DomainCatalog>,
        system_of_record: Arc<dyn SystemOfRecord>,
        cluster_tolerance: f64,
    ) -> Self {
        Self {
            geometry,
            domains,
            system_of_record,
            cluster_tolerance,
        }
    }

    /// Run one gate
    pub fn run_gate(&self, gate: GateName, ctx: &GateContext<'_>) -> GateResult {
        let findings = match gate {
            GateName::CheckEdits => self.check_edits(ctx),
            GateName::Review => self.review(ctx),
            GateName::Publish => self.publish(ctx),
        };

        let result = GateResult::from_findings(gate, findings);
        debug!("{} for {}", result.summary(), ctx.package.unit_id);
        result
    }

    fn check_edits(&self, ctx: &GateContext<'_>) -> Vec<Finding> {
        let package = ctx.package;
        let mut findings = Vec::new();

        for field in Field::LINE_FIELDS {
            let missing: Vec<String> = field
                .values(package)
                .into_iter()
                .filter(|(_, v)| v.is_none())
                .map(|(k, _)| k.to_string())
                .collect();
            if !missing.is_empty() {
                findings.push(Finding::blocking(
                    FindingCategory::MissingValue,
                    Subject::field(LINES, field.name()).with_features(missing.clone()),
                    format!("missing {} on {} line(s)", field.name(), missing.len()),
                ));
            }
        }

        findings.extend(self.domain_findings(package, &Field::LINE_FIELDS, false));
        findings.extend(self.topology_findings(package));

        match self.geometry.build_polygons(&package.buildable_lines()) {
            Ok(0) => findings.push(Finding::blocking(
                FindingCategory::PolygonBuild,
                Subject::dataset(LINES),
                "lines do not close into any polygon",
            )),
            Ok(count) => {
                debug!("{} lines close into {} polygon(s)", package.unit_id, count);
                findings.extend(self.advisory_findings(package));
            }
            Err(e) => findings.push(Finding::blocking(
                FindingCategory::Collaborator,
                Subject::dataset(LINES),
                format!("polygon build failed: {}", e),
            )),
        }

        findings
    }

    fn topology_findings(&self, package: &UnitPackage) -> Vec<Finding> {
        let spec = TopologySpec::boundary(self.cluster_tolerance);
        let topology = match self.geometry.build_topology(&package.active_lines(), &spec) {
            Ok(topology) => topology,
            Err(e) => {
                return vec![Finding::blocking(
                    FindingCategory::Topology,
                    Subject::dataset(LINES),
                    format!("topology could not be built: {}", e),
                )]
            }
        };

        let violations = match self.geometry.validate_topology(&topology) {
            Ok(violations) => violations,
            Err(e) => {
                return vec![Finding::blocking(
                    FindingCategory::Collaborator,
                    Subject::dataset(LINES),
                    format!("topology validation failed: {}", e),
                )]
            }
        };

        let mut by_rule = BTreeMap::new();
        for violation in violations {
            let entry: &mut (Vec<String>, usize) =
                by_rule.entry(violation.rule.to_string()).or_default();
            entry.1 += 1;
            if let Some(key) = violation.feature_key {
                entry.0.push(key);
            }
        }

        by_rule
            .into_iter()
            .map(|(rule, (features, count))| {
                Finding::blocking(
                    FindingCategory::Topology,
                    Subject::dataset(LINES).with_features(features),
                    format!("topology error: {} ({} error(s))", rule, count),
                )
            })
            .collect()
    }

    /// Overlap and Schedule A checks; they never block
    fn advisory_findings(&self, package: &UnitPackage) -> Vec<Finding> {
        let mut findings = Vec::new();
        let boundary = package.resulting_boundary();

        let overlap = self
            .system_of_record
            .other_boundaries(&package.unit_id.current_view_key())
            .and_then(|others| self.geometry.intersects(&boundary, &others));
        match overlap {
            Ok(overlap) if !overlap.is_empty() => findings.push(Finding::informational(
                FindingCategory::Spatial,
                Subject::dataset(BOUNDARY)
                    .with_features(overlap.keys().into_iter().map(str::to_string).collect()),
                format!("boundary overlaps {} feature(s) of other licences", overlap.len()),
            )),
            Ok(_) => {}
            Err(e) => findings.push(Finding::informational(
                FindingCategory::Collaborator,
                Subject::dataset(BOUNDARY),
                format!("overlap check skipped: {}", e),
            )),
        }

        let schedule = package.schedule_a_features();
        if !schedule.is_empty() {
            match self.geometry.spatial_difference(&schedule, &boundary) {
                Ok(outside) if !outside.is_empty() => findings.push(Finding::informational(
                    FindingCategory::Spatial,
                    Subject::dataset(SCHEDULE_A)
                        .with_features(outside.keys().into_iter().map(str::to_string).collect()),
                    format!("{} Schedule A feature(s) fall outside the boundary", outside.len()),
                )),
                Ok(_) => {}
                Err(e) => findings.push(Finding::informational(
                    FindingCategory::Collaborator,
                    Subject::dataset(SCHEDULE_A),
                    format!("Schedule A check skipped: {}", e),
                )),
            }
        }

        findings
    }

    fn review(&self, ctx: &GateContext<'_>) -> Vec<Finding> {
        let package = ctx.package;
        let mut findings = Vec::new();

        // Segregation of duties is checked before anything else can short-circuit.
        if let Some(record) = ctx.record {
            if record.is_editor(ctx.actor) {
                findings.push(Finding::blocking(
                    FindingCategory::SegregationOfDuties,
                    Subject::dataset(TRANSACTION),
                    format!("{} edited or checked this unit and cannot approve it", ctx.actor),
                ));
            }
        }

        let checked_at = match ctx.record.and_then(TransactionRecord::checked_at) {
            Some(at) => at,
            None => {
                findings.push(Finding::blocking(
                    FindingCategory::Prerequisite,
                    Subject::dataset(TRANSACTION),
                    "check-edits has not passed for this unit",
                ));
                return findings;
            }
        };

        if let Some(modified) = package.last_modified() {
            if modified > checked_at {
                findings.push(Finding::blocking(
                    FindingCategory::StaleCheck,
                    Subject::dataset(LINES),
                    format!(
                        "unit modified at {} after its last check at {}; run check-edits again",
                        modified.to_rfc3339(),
                        checked_at.to_rfc3339()
                    ),
                ));
            }
        }

        findings.extend(self.polygon_rules(package));
        findings
    }

    fn polygon_rules(&self, package: &UnitPackage) -> Vec<Finding> {
        let mut findings = Vec::new();

        let untagged: Vec<String> = package
            .boundary
            .iter()
            .filter(|p| p.tag().is_none())
            .map(|p| p.feature_key.clone())
            .collect();
        if !untagged.is_empty() {
            findings.push(Finding::blocking(
                FindingCategory::PolygonRules,
                Subject::field(BOUNDARY, Field::PolyType.name()).with_features(untagged.clone()),
                format!("{} polygon(s) without a valid Poly_Type", untagged.len()),
            ));
        }

        let replacements = package.polygons_tagged(&[PolyType::Replacement]);
        if !replacements.is_empty() {
            let others: Vec<String> = package
                .boundary
                .iter()
                .filter(|p| p.tag().is_some_and(|t| t != PolyType::Replacement))
                .map(|p| p.feature_key.clone())
                .collect();
            if !others.is_empty() {
                findings.push(Finding::blocking(
                    FindingCategory::PolygonRules,
                    Subject::field(BOUNDARY, Field::PolyType.name()).with_features(others),
                    "mixed Replacement with other poly types",
                ));
            }

            let schedule = package.schedule_a_features();
            if !schedule.is_empty() {
                let container = replacements.iter().map(|p| p.to_feature()).collect();
                match self.geometry.contains(&container, &schedule) {
                    Ok(true) => {}
                    Ok(false) => findings.push(Finding::blocking(
                        FindingCategory::Spatial,
                        Subject::dataset(SCHEDULE_A),
                        "Schedule A is not contained within the replacement boundary",
                    )),
                    Err(e) => findings.push(Finding::blocking(
                        FindingCategory::Collaborator,
                        Subject::dataset(SCHEDULE_A),
                        format!("containment check failed: {}", e),
                    )),
                }
            }
        }

        let without_tool: Vec<String> = package
            .boundary
            .iter()
            .filter(|p| p.tag().is_some_and(|t| t != PolyType::CurrentView))
            .filter(|p| p.legislative_tool.as_deref().map_or(true, |t| t.trim().is_empty()))
            .map(|p| p.feature_key.clone())
            .collect();
        if !without_tool.is_empty() {
            findings.push(Finding::blocking(
                FindingCategory::MissingValue,
                Subject::field(BOUNDARY, Field::LegislativeTool.name())
                    .with_features(without_tool.clone()),
                format!(
                    "missing Legislative_Tool on {} non-Current_View polygon(s)",
                    without_tool.len()
                ),
            ));
        }

        findings
    }

    fn publish(&self, ctx: &GateContext<'_>) -> Vec<Finding> {
        if !ctx.record.is_some_and(TransactionRecord::review_passed) {
            return vec![Finding::blocking(
                FindingCategory::Prerequisite,
                Subject::dataset(TRANSACTION),
                "review has not passed for this unit",
            )];
        }

        self.domain_findings(ctx.package, &Field::ALL, true)
    }

    /// One finding per (dataset, field) for out-of-domain values, plus one for
    /// nulls in non-nullable fields when `include_nulls` is set
    fn domain_findings(
        &self,
        package: &UnitPackage,
        fields: &[Field],
        include_nulls: bool,
    ) -> Vec<Finding> {
        let mut findings = Vec::new();

        for field in fields {
            let Some(allowed) = self.domains.enumerated_values(field.name()) else {
                continue;
            };

            let values = field.values(package);
            let mut nulls = Vec::new();
            let mut outside = Vec::new();
            for (key, value) in values {
                match value {
                    None => nulls.push(key.to_string()),
                    Some(v) if !allowed.contains(v) => outside.push(key.to_string()),
                    Some(_) => {}
                }
            }

            if include_nulls && !field.nullable() && !nulls.is_empty() {
                findings.push(Finding::blocking(
                    FindingCategory::DomainViolation,
                    Subject::field(field.dataset(), field.name()).with_features(nulls.clone()),
                    format!("domain violation: {} null {} value(s)", nulls.len(), field.name()),
                ));
            }

            if !outside.is_empty() {
                let allowed: Vec<&str> = allowed.iter().map(String::as_str).collect();
                findings.push(Finding::blocking(
                    FindingCategory::DomainViolation,
                    Subject::field(field.dataset(), field.name()).with_features(outside.clone()),
                    format!(
                        "domain violation: {} {} value(s) outside [{}]",
                        outside.len(),
                        field.name(),
                        allowed.join(", ")
                    ),
                ));
            }
        }

        findings
    }
}
