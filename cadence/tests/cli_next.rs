//! CLI tests for the `cadence` binary.
//!
//! Spawns the binary against a temporary project and verifies exit codes and
//! JSON output for planning, task selection and error reporting.

use std::path::Path;
use std::process::{Command, Output};

use cadence::exit_codes;
use cadence::paths::{InitOptions, init_project};
use cadence::test_support::plan_fixture;
use serde_json::Value;

fn cadence(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cadence"))
        .arg("--root")
        .arg(root)
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("run cadence")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout json")
}

fn planned_root() -> tempfile::TempDir {
    let temp = tempfile::tempdir().expect("tempdir");
    init_project(temp.path(), &InitOptions { force: false }).expect("init");
    let plan_path = temp.path().join("plan.json");
    std::fs::write(
        &plan_path,
        serde_json::to_string(&plan_fixture()).expect("serialize plan"),
    )
    .expect("write plan");
    let output = cadence(temp.path(), &["plan", plan_path.to_str().expect("utf-8 path")]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    temp
}

#[test]
fn next_prints_eligible_task() {
    let temp = planned_root();
    let output = cadence(temp.path(), &["next"]);

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let next = stdout_json(&output);
    assert_eq!(next["outcome"], "eligible");
    assert_eq!(next["task"]["id"], "T1");
}

#[test]
fn next_exits_blocked_while_predecessor_runs() {
    let temp = planned_root();
    assert_eq!(
        cadence(temp.path(), &["start", "T1"]).status.code(),
        Some(exit_codes::OK)
    );

    let output = cadence(temp.path(), &["next"]);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
    assert_eq!(stdout_json(&output)["in_progress"][0], "T1");
}

#[test]
fn next_exits_complete_when_all_tasks_done() {
    let temp = planned_root();
    for id in ["T1", "T2", "T3"] {
        assert_eq!(cadence(temp.path(), &["start", id]).status.code(), Some(0));
        assert_eq!(cadence(temp.path(), &["complete", id]).status.code(), Some(0));
    }

    let output = cadence(temp.path(), &["next"]);
    assert_eq!(output.status.code(), Some(exit_codes::COMPLETE));
    assert_eq!(stdout_json(&output)["outcome"], "project_complete");
}

#[test]
fn task_started_in_one_process_completes_in_another() {
    let temp = planned_root();
    assert_eq!(
        cadence(temp.path(), &["start", "T1"]).status.code(),
        Some(exit_codes::OK)
    );
    let status = stdout_json(&cadence(temp.path(), &["status"]));
    assert_eq!(status["in_progress_tasks"], 1);

    let output = cadence(temp.path(), &["complete", "T1"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&output)["task"]["status"], "completed");
}

#[test]
fn recover_resets_abandoned_work() {
    let temp = planned_root();
    assert_eq!(
        cadence(temp.path(), &["start", "T1"]).status.code(),
        Some(exit_codes::OK)
    );

    let output = cadence(temp.path(), &["recover"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&output)["reset_tasks"][0], "T1");

    let next = stdout_json(&cadence(temp.path(), &["next"]));
    assert_eq!(next["task"]["id"], "T1");
}

#[test]
fn unmet_dependency_is_rejected_with_payload() {
    let temp = planned_root();
    let output = cadence(temp.path(), &["start", "T2"]);

    assert_eq!(output.status.code(), Some(exit_codes::REJECTED));
    let payload: Value = serde_json::from_slice(&output.stderr).expect("stderr json");
    assert_eq!(payload["error"], "dependency_unmet");
    assert_eq!(payload["missing_dependencies"][0], "T1");
    assert_eq!(payload["fatal"], false);
}

#[test]
fn uninitialized_root_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = cadence(temp.path(), &["status"]);

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("cadence init"));
}
