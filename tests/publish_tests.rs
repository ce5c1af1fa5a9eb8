//! Publication: downstream reconciliation, archiving and retry after partial failure

use tenure_lifecycle::test_support::{polygon, Fixture, PackageBuilder};
use tenure_lifecycle::{DatasetKind, DownstreamRow, LifecycleError, UnitPackage};
use tenure_storage::{Actor, Stage, UnitId};

fn editor() -> Actor {
    Actor::new("editor")
}

fn reviewer() -> Actor {
    Actor::new("reviewer")
}

fn add_parcel(package: &mut UnitPackage) {
    package
        .boundary
        .push(polygon("P2", "Addition", Some("OIC 2024-117"), "d,e"));
}

fn pending_with_addition(fixture: &Fixture) -> UnitId {
    let unit = fixture.seed_baseline(PackageBuilder::tfl49().build());
    fixture.run_to_pending(&unit, &editor(), &reviewer(), add_parcel);
    unit
}

/// Rows with publication timestamps cleared
fn comparable(rows: Vec<DownstreamRow>) -> Vec<DownstreamRow> {
    rows.into_iter()
        .map(|mut row| {
            row.updated_at = None;
            row
        })
        .collect()
}

#[test]
fn test_publish_updates_changed_datasets_and_archives_baseline() {
    let fixture = Fixture::new();
    let unit = pending_with_addition(&fixture);

    let outcome = fixture.orchestrator.publish(&unit, &reviewer()).unwrap();
    assert_eq!(outcome.to, Stage::Baseline);

    let change_set = outcome.change_set.unwrap();
    assert_eq!(
        change_set.datasets(),
        vec![DatasetKind::CurrentView, DatasetKind::Additions]
    );
    assert!(outcome.apply_report.unwrap().is_complete());

    let additions = fixture.rows(DatasetKind::Additions);
    assert_eq!(additions.len(), 1);
    assert_eq!(additions[0].unit_key, "TFL49");
    assert_eq!(additions[0].feature_class_skey, Some(831));
    assert_eq!(additions[0].updated_by, Some(reviewer()));
    assert_eq!(fixture.rows(DatasetKind::CurrentView).len(), 2);

    let archived = outcome.archived.unwrap();
    assert!(archived.starts_with(&fixture.roots.archive));
    assert!(archived
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with("TFL_49_")));

    let status = fixture.orchestrator.status(&unit).unwrap();
    assert_eq!(status.unit.stage, Stage::Baseline);
    let submitted = status.record.unwrap().submitted.unwrap();
    assert!(submitted.passed);

    let baseline = fixture.load(&fixture.location(&unit, Stage::Baseline));
    assert_eq!(baseline.boundary.len(), 2);
    assert!(!fixture.location(&unit, Stage::Pending).path().exists());
}

#[test]
fn test_publish_without_differences_writes_nothing() {
    let fixture = Fixture::new();
    let unit = fixture.seed_baseline(PackageBuilder::tfl49().build());
    fixture.run_to_pending(&unit, &editor(), &reviewer(), |_| {});

    let outcome = fixture.orchestrator.publish(&unit, &reviewer()).unwrap();

    let change_set = outcome.change_set.unwrap();
    assert!(change_set.is_empty());
    assert_eq!(change_set.decisions.len(), DatasetKind::ALL.len());
    for kind in DatasetKind::ALL {
        assert!(!fixture.staging.backup_path(kind).exists(), "{} backed up", kind);
        assert!(!fixture.staging.dataset_path(kind).exists(), "{} written", kind);
    }
    assert_eq!(outcome.to, Stage::Baseline);
}

#[test]
fn test_publish_retry_after_partial_failure_matches_clean_run() {
    let failing = Fixture::new();
    let unit = pending_with_addition(&failing);
    failing.datasets.fail_appends(DatasetKind::Additions);

    let err = failing.orchestrator.publish(&unit, &reviewer()).unwrap_err();
    assert!(err.is_retryable());
    match &err {
        LifecycleError::ReconciliationPartialFailure(report) => {
            assert_eq!(report.succeeded.len(), 1);
            assert_eq!(report.failed.len(), 1);
            assert_eq!(report.failed[0].dataset, DatasetKind::Additions);
        }
        other => panic!("expected partial failure, got {:?}", other),
    }

    let status = failing.orchestrator.status(&unit).unwrap();
    assert_eq!(status.unit.stage, Stage::Pending);
    assert!(!status.record.unwrap().submitted.unwrap().passed);

    failing.datasets.heal();
    failing.orchestrator.publish(&unit, &reviewer()).unwrap();

    let clean = Fixture::new();
    let clean_unit = pending_with_addition(&clean);
    clean.orchestrator.publish(&clean_unit, &reviewer()).unwrap();

    for kind in [DatasetKind::CurrentView, DatasetKind::Additions] {
        assert_eq!(
            comparable(failing.rows(kind)),
            comparable(clean.rows(kind)),
            "{} differs after retry",
            kind
        );
    }
}

#[test]
fn test_second_publication_replaces_rows_by_key() {
    let fixture = Fixture::new();
    let unit = pending_with_addition(&fixture);
    fixture.orchestrator.publish(&unit, &reviewer()).unwrap();

    fixture.run_to_pending(&unit, &Actor::new("second-editor"), &reviewer(), |package| {
        package.boundary.retain(|p| p.feature_key != "P2");
        package
            .boundary
            .push(polygon("P3", "Addition", Some("OIC 2025-004"), "f"));
    });
    let outcome = fixture.orchestrator.publish(&unit, &reviewer()).unwrap();

    let additions = fixture.rows(DatasetKind::Additions);
    assert_eq!(additions.len(), 1);
    assert_eq!(additions[0].feature_key, "P3");
    assert!(fixture.staging.backup_path(DatasetKind::Additions).exists());

    let archives = std::fs::read_dir(&fixture.roots.archive)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .count();
    assert_eq!(archives, 2);
    assert!(outcome.archived.is_some());
}

#[test]
fn test_publish_requires_review() {
    let fixture = Fixture::new();
    let unit = fixture.seed_baseline(PackageBuilder::tfl49().build());
    fixture.orchestrator.checkout(&unit, &editor()).unwrap();

    let err = fixture.orchestrator.publish(&unit, &reviewer()).unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::InvalidTransition {
            from: Stage::Editing,
            to: Stage::Baseline,
            ..
        }
    ));
}

#[test]
fn test_unchanged_cycle_after_publication_publishes_nothing() {
    let fixture = Fixture::new();
    let unit = pending_with_addition(&fixture);
    fixture.orchestrator.publish(&unit, &reviewer()).unwrap();
    let published = fixture.load(&fixture.location(&unit, Stage::Baseline));
    fixture.record.mirror(&published);

    fixture.orchestrator.checkout(&unit, &editor()).unwrap();
    let working = fixture.load(&fixture.location(&unit, Stage::Editing));
    assert_eq!(working.boundary.len(), 2);
    assert!(working
        .boundary
        .iter()
        .all(|p| p.poly_type.as_deref() == Some("Current_View")));
    assert!(working.instruments().is_empty());

    fixture.orchestrator.submit_for_review(&unit, &editor()).unwrap();
    fixture.orchestrator.approve(&unit, &reviewer()).unwrap();
    let outcome = fixture.orchestrator.publish(&unit, &reviewer()).unwrap();

    let change_set = outcome.change_set.unwrap();
    assert!(change_set.is_empty(), "republished {:?}", change_set.datasets());
    let additions = fixture.rows(DatasetKind::Additions);
    assert_eq!(additions.len(), 1);
    assert_eq!(additions[0].feature_key, "P2");
}

#[test]
fn test_preflight_failure_leaves_datasets_untouched() {
    let fixture = Fixture::new();
    let unit = pending_with_addition(&fixture);
    fixture.relocator.fail_preflight();

    let err = fixture.orchestrator.publish(&unit, &reviewer()).unwrap_err();
    assert!(matches!(err, LifecycleError::Relocation(_)));
    assert!(err.requires_intervention());

    for kind in DatasetKind::ALL {
        assert!(!fixture.staging.dataset_path(kind).exists(), "{} written", kind);
        assert!(!fixture.staging.backup_path(kind).exists(), "{} backed up", kind);
    }
    assert_eq!(fixture.orchestrator.status(&unit).unwrap().unit.stage, Stage::Pending);
    assert!(fixture.location(&unit, Stage::Baseline).path().is_dir());
}

#[test]
fn test_publish_retry_keeps_backup_from_before_first_attempt() {
    let fixture = Fixture::new();
    let unit = pending_with_addition(&fixture);
    fixture.orchestrator.publish(&unit, &reviewer()).unwrap();

    fixture.run_to_pending(&unit, &Actor::new("second-editor"), &reviewer(), |package| {
        package.boundary.retain(|p| p.feature_key != "P2");
        package
            .boundary
            .push(polygon("P3", "Addition", Some("OIC 2025-004"), "f"));
    });
    fixture.datasets.fail_appends(DatasetKind::Additions);
    fixture.orchestrator.publish(&unit, &reviewer()).unwrap_err();

    let open = fixture
        .orchestrator
        .status(&unit)
        .unwrap()
        .record
        .unwrap()
        .open_publication
        .unwrap();
    let first = fixture.staging.read_backup(DatasetKind::Additions).unwrap().unwrap();
    assert_eq!(first.change_set, open);

    fixture.datasets.heal();
    let outcome = fixture.orchestrator.publish(&unit, &reviewer()).unwrap();
    assert_eq!(outcome.change_set.unwrap().id, open);

    let backup = fixture.staging.read_backup(DatasetKind::Additions).unwrap().unwrap();
    assert_eq!(backup, first);
    let keys: Vec<&str> = backup.rows.iter().map(|r| r.feature_key.as_str()).collect();
    assert_eq!(keys, vec!["P2"]);

    let record = fixture.orchestrator.status(&unit).unwrap().record.unwrap();
    assert!(record.open_publication.is_none());
}
