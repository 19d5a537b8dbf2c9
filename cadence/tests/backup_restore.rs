//! Snapshot tests: restore round-trip, safety copies and retention cleanup.

use std::fs;
use std::path::Path;

use cadence::backup::{RetentionPolicy, SnapshotKind};
use cadence::config::RunMode;
use cadence::error::SchedulerError;
use cadence::test_support::{TestProject, plan_fixture};
use serde_json::Value;

/// Export the full state and return the combined document.
fn exported_state(project: &TestProject, name: &str) -> Value {
    let dir = project.root().join(name);
    project.facade.export_json(&dir).expect("export");
    read_json(&dir.join("state.json"))
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&fs::read_to_string(path).expect("read export")).expect("parse export")
}

/// Restoring a snapshot taken with no intervening writes reproduces the
/// exported state exactly, even after later progress.
#[test]
fn restore_round_trip_reproduces_state() {
    let project = TestProject::planned(&plan_fixture(), RunMode::default()).expect("project");
    let facade = &project.facade;
    facade.start_task("T1").expect("start");
    facade.complete_task("T1").expect("complete");

    let before = exported_state(&project, "before");
    let snapshot = facade.backup(SnapshotKind::Manual, "checkpoint").expect("backup");
    facade.restore(&snapshot.name).expect("immediate restore");
    assert_eq!(exported_state(&project, "immediate"), before);

    facade.start_task("T2").expect("start T2");
    facade.complete_task("T2").expect("complete T2");
    assert_ne!(exported_state(&project, "progressed"), before);

    let outcome = facade.restore(&snapshot.name).expect("restore");
    assert_eq!(outcome.restored.name, snapshot.name);
    assert_eq!(outcome.safety.kind, SnapshotKind::Safety);
    assert_eq!(exported_state(&project, "after"), before);

    // The safety copy holds the replaced state.
    facade.restore(&outcome.safety.name).expect("undo restore");
    let status = facade.get_current_status().expect("status");
    assert_eq!(status.completed_tasks, 2);
}

/// `restore_latest` skips safety copies and picks the newest regular one.
#[test]
fn restore_latest_ignores_safety_snapshots() {
    let project = TestProject::planned(&plan_fixture(), RunMode::default()).expect("project");
    let facade = &project.facade;
    let checkpoint = facade.backup(SnapshotKind::Manual, "zero").expect("backup");
    facade.start_task("T1").expect("start");
    facade.complete_task("T1").expect("complete");

    let outcome = facade.restore_latest().expect("restore latest");
    assert_eq!(outcome.restored.name, checkpoint.name);
    assert_eq!(facade.get_current_status().expect("status").completed_tasks, 0);

    let again = facade.restore_latest().expect("restore latest again");
    assert_eq!(again.restored.name, checkpoint.name);
}

/// A task captured in_progress comes back in_progress, execution row
/// included, and can be completed by its performer.
#[test]
fn restore_keeps_tasks_captured_in_progress() {
    let project = TestProject::planned(&plan_fixture(), RunMode::default()).expect("project");
    let facade = &project.facade;
    facade.start_task("T1").expect("start");
    let before = exported_state(&project, "before");
    let snapshot = facade.backup(SnapshotKind::Manual, "mid_task").expect("backup");

    facade.restore(&snapshot.name).expect("immediate restore");
    assert_eq!(exported_state(&project, "immediate"), before);

    facade.complete_task("T1").expect("complete");
    facade.restore(&snapshot.name).expect("restore");
    assert_eq!(exported_state(&project, "after"), before);
    let m1 = facade.get_milestone_status("M1").expect("M1");
    assert_eq!(m1.in_progress_tasks, 1);
    assert_eq!(m1.pending_tasks, 1);
    facade.complete_task("T1").expect("complete after restore");
}

/// Corrupt snapshots fail verification and are never restored.
#[test]
fn corrupt_snapshot_is_rejected() {
    let project = TestProject::planned(&plan_fixture(), RunMode::default()).expect("project");
    let facade = &project.facade;
    let snapshot = facade.backup(SnapshotKind::Manual, "broken").expect("backup");
    fs::write(&snapshot.path, b"not a database").expect("corrupt");

    let report = facade.verify_backup(&snapshot.name).expect("verify");
    assert!(!report.is_restorable());

    let err = facade.restore(&snapshot.name).unwrap_err();
    assert!(matches!(err, SchedulerError::SnapshotInvalid { .. }));
    assert!(!err.is_fatal());
    assert!(facade.get_current_status().expect("status").planned);

    let err = facade.restore("manual_missing_20240101_000000_000000.db").unwrap_err();
    assert!(matches!(err, SchedulerError::NotFound { .. }));
}

/// Cleanup keeps manual snapshots and the newest `keep_minimum` others.
#[test]
fn cleanup_keeps_manual_and_minimum() {
    let project = TestProject::new(RunMode::default()).expect("project");
    let facade = &project.facade;
    let manual = facade.backup(SnapshotKind::Manual, "keep").expect("manual");
    let mut autos = Vec::new();
    for index in 0..4 {
        autos.push(
            facade
                .backup(SnapshotKind::Auto, &format!("auto{index}"))
                .expect("auto"),
        );
    }

    // keep_days = 0 puts every snapshot past the cutoff.
    let removed = facade
        .cleanup_backups(&RetentionPolicy {
            keep_days: 0,
            keep_minimum: 2,
        })
        .expect("cleanup");

    let mut removed_names: Vec<String> = removed.into_iter().map(|h| h.name).collect();
    removed_names.sort();
    let mut expected: Vec<String> = autos[..2].iter().map(|h| h.name.clone()).collect();
    expected.sort();
    assert_eq!(removed_names, expected);

    let remaining: Vec<String> = facade
        .list_backups()
        .expect("list")
        .into_iter()
        .map(|h| h.name)
        .collect();
    assert!(remaining.contains(&manual.name));
    assert!(remaining.contains(&autos[3].name));
    assert!(remaining.contains(&autos[2].name));
    assert_eq!(remaining.len(), 3);
}

/// Planning takes an automatic snapshot of the empty store first.
#[test]
fn plan_is_preceded_by_a_snapshot() {
    let project = TestProject::planned(&plan_fixture(), RunMode::default()).expect("project");
    let backups = project.facade.list_backups().expect("list");
    assert!(
        backups
            .iter()
            .any(|b| b.kind == SnapshotKind::Auto && b.tag == "plan")
    );
}
