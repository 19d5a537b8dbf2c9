//! Work-queue loop behind `cadence drive`.
//!
//! Each step asks the facade for the next eligible task, starts it, hands a
//! [`WorkItem`] to the [`WorkExecutor`] and applies the [`WorkResult`]. The loop
//! owns no state of its own: stopping at any point leaves the store exactly as
//! the last committed transition left it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::types::Task;
use crate::error::Result;
use crate::facade::{Facade, NextTask};
use crate::machine::Completion;
use crate::process::{command_from_argv, run_command_with_timeout, write_log};

/// Opaque unit of work handed to the performer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub task_id: String,
    pub milestone_id: String,
    pub title: String,
    pub description: String,
    pub max_file_changes: u32,
}

impl From<&Task> for WorkItem {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            milestone_id: task.milestone_id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            max_file_changes: task.max_file_changes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkResult {
    Completed {
        #[serde(default)]
        summary: String,
    },
    Failed {
        #[serde(default)]
        reason: String,
    },
}

/// Performs one work item. An `Err` is treated like [`WorkResult::Failed`].
pub trait WorkExecutor {
    fn perform(&self, item: &WorkItem) -> anyhow::Result<WorkResult>;
}

/// Reason why `drive` stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stop", rename_all = "snake_case")]
pub enum DriveStop {
    ProjectComplete,
    /// Work remains but no task of the current milestone is eligible.
    Blocked {
        milestone_id: String,
        remaining: u32,
    },
    /// A completed milestone must be validated before work continues.
    AwaitingValidation { milestone_id: String },
    /// The performer failed; the task was returned to pending.
    WorkFailed { task_id: String, reason: String },
    StepLimit { max_steps: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriveStep {
    pub item: WorkItem,
    pub summary: String,
    pub completion: Completion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriveOutcome {
    pub steps_executed: u32,
    pub stop: DriveStop,
}

/// Perform eligible tasks until the project completes, nothing is eligible,
/// a validation gate is reached, work fails, or `max_steps` tasks completed.
pub fn drive<E: WorkExecutor, F: FnMut(&DriveStep)>(
    facade: &Facade,
    executor: &E,
    max_steps: u32,
    mut on_step: F,
) -> Result<DriveOutcome> {
    let mode = facade.run_mode();
    let gated = mode.pause_for_validation && !mode.auto_validate;
    let mut steps_executed = 0u32;
    let outcome = |steps_executed, stop| Ok(DriveOutcome { steps_executed, stop });

    loop {
        if gated
            && let Some(milestone_id) = facade.get_current_status()?.awaiting_validation.first()
        {
            return outcome(
                steps_executed,
                DriveStop::AwaitingValidation {
                    milestone_id: milestone_id.clone(),
                },
            );
        }
        if steps_executed >= max_steps {
            return outcome(steps_executed, DriveStop::StepLimit { max_steps });
        }

        let task = match facade.get_next_task(None)? {
            NextTask::ProjectComplete => return outcome(steps_executed, DriveStop::ProjectComplete),
            NextTask::Blocked {
                milestone_id,
                remaining,
                ..
            } => {
                return outcome(
                    steps_executed,
                    DriveStop::Blocked {
                        milestone_id,
                        remaining,
                    },
                );
            }
            NextTask::Eligible { task } => task,
        };

        facade.start_task(&task.id)?;
        let item = WorkItem::from(&task);
        let result = executor.perform(&item).unwrap_or_else(|err| WorkResult::Failed {
            reason: format!("{err:#}"),
        });

        match result {
            WorkResult::Completed { summary } => {
                let completion = facade.complete_task(&task.id)?;
                steps_executed += 1;
                info!(task_id = %task.id, steps_executed, "work item completed");
                on_step(&DriveStep {
                    item,
                    summary,
                    completion,
                });
            }
            WorkResult::Failed { reason } => {
                warn!(task_id = %task.id, reason = %reason, "work item failed");
                facade.release_task(&task.id)?;
                return outcome(
                    steps_executed,
                    DriveStop::WorkFailed {
                        task_id: task.id,
                        reason,
                    },
                );
            }
        }
    }
}

/// Work executor that runs an external command per item.
///
/// The command receives the [`WorkItem`] as JSON on stdin and must print a
/// [`WorkResult`] document on stdout. Timeouts, non-zero exits and malformed
/// output are failures.
pub struct CommandWorkExecutor {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Directory for per-task logs; `None` disables logging.
    pub log_dir: Option<PathBuf>,
}

impl WorkExecutor for CommandWorkExecutor {
    #[instrument(skip_all, fields(task_id = %item.task_id))]
    fn perform(&self, item: &WorkItem) -> anyhow::Result<WorkResult> {
        let input = serde_json::to_vec(item).context("serialize work item")?;
        let cmd = command_from_argv(&self.argv, &self.workdir)?;
        let output =
            run_command_with_timeout(cmd, Some(&input), self.timeout, self.output_limit_bytes)
                .context("run work command")?;

        if let Some(dir) = &self.log_dir {
            let name = format!("{}.log", item.task_id.replace(['/', '\\'], "_"));
            write_log(&dir.join(name), &output.render_log(self.output_limit_bytes))?;
        }

        if output.timed_out {
            return Ok(WorkResult::Failed {
                reason: format!("work command timed out after {}s", self.timeout.as_secs()),
            });
        }
        if !output.status.success() {
            return Ok(WorkResult::Failed {
                reason: format!("work command exited with {:?}", output.status.code()),
            });
        }
        match serde_json::from_slice::<WorkResult>(output.stdout.trim_ascii()) {
            Ok(result) => Ok(result),
            Err(err) => Ok(WorkResult::Failed {
                reason: format!("malformed work result: {err}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunMode;
    use crate::test_support::{ScriptedWorkExecutor, TestProject, plan_fixture};

    #[test]
    fn drive_runs_plan_to_completion() {
        let project = TestProject::planned(&plan_fixture(), RunMode::default()).expect("project");
        let facade = &project.facade;
        let executor = ScriptedWorkExecutor::completing();
        let mut seen = Vec::new();

        let outcome = drive(facade, &executor, 100, |step| seen.push(step.item.task_id.clone()))
            .expect("drive");

        assert_eq!(outcome.stop, DriveStop::ProjectComplete);
        assert_eq!(outcome.steps_executed, 3);
        assert_eq!(seen, vec!["T1", "T2", "T3"]);
    }

    #[test]
    fn failed_work_releases_the_task() {
        let project = TestProject::planned(&plan_fixture(), RunMode::default()).expect("project");
        let facade = &project.facade;
        let executor = ScriptedWorkExecutor::failing_on("T2");

        let outcome = drive(facade, &executor, 100, |_| {}).expect("drive");

        assert_eq!(
            outcome.stop,
            DriveStop::WorkFailed {
                task_id: "T2".to_string(),
                reason: "scripted failure".to_string(),
            }
        );
        let status = facade.get_current_status().expect("status");
        assert_eq!(status.in_progress_tasks, 0);
        assert_eq!(status.completed_tasks, 1);
    }

    #[test]
    fn validation_gate_stops_after_milestone() {
        let mode = RunMode {
            pause_for_validation: true,
            ..RunMode::default()
        };
        let project = TestProject::planned(&plan_fixture(), mode).expect("project");
        let facade = &project.facade;
        let executor = ScriptedWorkExecutor::completing();

        let outcome = drive(facade, &executor, 100, |_| {}).expect("drive");
        assert_eq!(
            outcome.stop,
            DriveStop::AwaitingValidation {
                milestone_id: "M1".to_string()
            }
        );

        facade.validate_milestone("M1").expect("validate");
        let outcome = drive(facade, &executor, 100, |_| {}).expect("drive");
        assert_eq!(
            outcome.stop,
            DriveStop::AwaitingValidation {
                milestone_id: "M2".to_string()
            }
        );

        facade.validate_milestone("M2").expect("validate");
        let outcome = drive(facade, &executor, 100, |_| {}).expect("drive");
        assert_eq!(outcome.stop, DriveStop::ProjectComplete);
        assert_eq!(outcome.steps_executed, 0);
    }

    #[test]
    fn step_limit_is_respected() {
        let project = TestProject::planned(&plan_fixture(), RunMode::default()).expect("project");
        let facade = &project.facade;
        let outcome =
            drive(facade, &ScriptedWorkExecutor::completing(), 1, |_| {}).expect("drive");
        assert_eq!(outcome.stop, DriveStop::StepLimit { max_steps: 1 });
        assert_eq!(outcome.steps_executed, 1);
    }

    #[test]
    fn work_result_json_shape() {
        let result: WorkResult =
            serde_json::from_str(r#"{"status":"completed","summary":"done"}"#).expect("parse");
        assert_eq!(
            result,
            WorkResult::Completed {
                summary: "done".to_string()
            }
        );
        let failed: WorkResult = serde_json::from_str(r#"{"status":"failed"}"#).expect("parse");
        assert!(matches!(failed, WorkResult::Failed { .. }));
    }

    #[test]
    fn drive_stop_json_keeps_failure_reason() {
        let stop = DriveStop::WorkFailed {
            task_id: "T2".to_string(),
            reason: "tests failed".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&stop).expect("serialize"),
            serde_json::json!({"stop": "work_failed", "task_id": "T2", "reason": "tests failed"})
        );
        assert_eq!(
            serde_json::to_value(DriveStop::ProjectComplete).expect("serialize"),
            serde_json::json!({"stop": "project_complete"})
        );
    }

    #[cfg(unix)]
    #[test]
    fn command_executor_parses_stdout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = CommandWorkExecutor {
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                r#"cat >/dev/null; echo '{"status":"completed","summary":"ok"}'"#.to_string(),
            ],
            workdir: temp.path().to_path_buf(),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
            log_dir: Some(temp.path().join("work")),
        };
        let item = WorkItem {
            task_id: "T1".to_string(),
            milestone_id: "M1".to_string(),
            title: "t".to_string(),
            description: String::new(),
            max_file_changes: 10,
        };
        let result = executor.perform(&item).expect("perform");
        assert_eq!(
            result,
            WorkResult::Completed {
                summary: "ok".to_string()
            }
        );
        assert!(temp.path().join("work/T1.log").is_file());
    }
}
