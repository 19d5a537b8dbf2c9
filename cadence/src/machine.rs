//! Milestone/task state machine applied against the store.
//!
//! Each function expects to run inside one transaction (callers go through
//! [`crate::store::Store::transaction`]); a returned error rolls back every
//! write it made. Legality checks live in [`crate::core::transitions`].

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::config::RunMode;
use crate::core::resolver;
use crate::core::transitions;
use crate::core::types::{ExecutionStatus, Milestone, MilestoneStatus, Task, TaskStatus};
use crate::error::Result;
use crate::store::{graph_edges, records, state};

/// Result of a successful `complete_task`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub task: Task,
    /// True when the task's own milestone completed with this task.
    pub milestone_complete: bool,
    /// Every milestone completed by this transition, including vacuous ones
    /// reached while advancing the pointer.
    pub milestones_completed: Vec<String>,
    pub current_milestone_id: Option<String>,
    pub project_complete: bool,
}

pub fn current_milestone_id(conn: &Connection) -> Result<Option<String>> {
    state::get_state(conn, state::CURRENT_MILESTONE_ID)
}

/// All milestones are completed or validated (vacuously true before planning).
pub fn project_complete(conn: &Connection) -> Result<bool> {
    Ok(records::list_milestones(conn)?
        .iter()
        .all(|m| m.status.is_finished()))
}

/// pending -> in_progress for a task of the current milestone whose
/// dependencies are all completed.
pub fn start_task(
    conn: &Connection,
    task_id: &str,
    mode: &RunMode,
    now: DateTime<Utc>,
) -> Result<Task> {
    let task = records::require_task(conn, task_id)?;
    let current = current_milestone_id(conn)?;
    let dependencies = graph_edges::dependencies_of(conn, task_id)?;
    let statuses = records::task_statuses(conn)?;
    let check = resolver::check_dependencies(task_id, &dependencies, &statuses);
    transitions::check_start(&task, current.as_deref(), &check)?;

    records::mark_task_started(conn, task_id, now)?;
    records::insert_execution(conn, task_id, mode.autopilot, now)?;
    info!(task_id, milestone_id = %task.milestone_id, "task started");
    records::require_task(conn, task_id)
}

/// in_progress -> completed, then milestone completion and pointer advance.
pub fn complete_task(
    conn: &Connection,
    task_id: &str,
    mode: &RunMode,
    now: DateTime<Utc>,
) -> Result<Completion> {
    let task = records::require_task(conn, task_id)?;
    transitions::check_complete(&task)?;

    let duration = transitions::duration_secs(task.started_at, now);
    records::mark_task_completed(conn, task_id, now, duration)?;
    records::close_execution(conn, task_id, ExecutionStatus::Completed, now)?;
    refresh_counters(conn)?;
    info!(task_id, duration_secs = ?duration, "task completed");

    let mut milestones_completed = Vec::new();
    let owner = records::require_milestone(conn, &task.milestone_id)?;
    if owner.status == MilestoneStatus::Pending
        && records::task_counts(conn, Some(&owner.id))?.remaining() == 0
    {
        finish_milestone(conn, &owner.id, mode, now)?;
        milestones_completed.push(owner.id.clone());
    }
    milestones_completed.extend(settle(conn, mode, now)?);

    Ok(Completion {
        task: records::require_task(conn, task_id)?,
        milestone_complete: milestones_completed.contains(&owner.id),
        milestones_completed,
        current_milestone_id: current_milestone_id(conn)?,
        project_complete: project_complete(conn)?,
    })
}

/// in_progress -> pending for a task whose work was abandoned.
pub fn release_task(conn: &Connection, task_id: &str, now: DateTime<Utc>) -> Result<Task> {
    let task = records::require_task(conn, task_id)?;
    transitions::check_release(&task)?;
    records::mark_task_pending(conn, task_id)?;
    records::close_execution(conn, task_id, ExecutionStatus::Interrupted, now)?;
    info!(task_id, "task released");
    records::require_task(conn, task_id)
}

/// completed -> validated.
pub fn validate_milestone(
    conn: &Connection,
    milestone_id: &str,
    now: DateTime<Utc>,
) -> Result<Milestone> {
    let milestone = records::require_milestone(conn, milestone_id)?;
    transitions::check_validate(&milestone)?;
    records::mark_milestone_validated(conn, milestone_id, now)?;
    info!(milestone_id, "milestone validated");
    records::require_milestone(conn, milestone_id)
}

/// Return every in_progress task to pending; returns the reset ids.
pub fn reset_interrupted(conn: &Connection, now: DateTime<Utc>) -> Result<Vec<String>> {
    let stuck = records::list_tasks_with_status(conn, TaskStatus::InProgress)?;
    let mut reset = Vec::with_capacity(stuck.len());
    for task in stuck {
        records::mark_task_pending(conn, &task.id)?;
        records::close_execution(conn, &task.id, ExecutionStatus::Interrupted, now)?;
        reset.push(task.id);
    }
    if !reset.is_empty() {
        refresh_counters(conn)?;
        info!(count = reset.len(), "reset interrupted tasks");
    }
    Ok(reset)
}

/// Point the current register at `milestone_id` out of order, then settle.
///
/// Returns milestones completed while settling (the target itself when it has
/// no remaining tasks).
pub fn set_current_milestone(
    conn: &Connection,
    milestone_id: &str,
    mode: &RunMode,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let milestone = records::require_milestone(conn, milestone_id)?;
    transitions::check_pointer_target(&milestone)?;
    point_at(conn, Some(&milestone.id), now)?;
    info!(milestone_id, "current milestone overridden");
    settle(conn, mode, now)
}

/// Bring the current pointer to a stable state: complete the current
/// milestone while it has no remaining tasks and advance to the next pending
/// one, or clear the pointer when none is left.
///
/// Returns the ids of milestones completed along the way.
pub fn settle(conn: &Connection, mode: &RunMode, now: DateTime<Utc>) -> Result<Vec<String>> {
    let mut completed = Vec::new();
    loop {
        let pointer = current_milestone_id(conn)?;
        if let Some(id) = &pointer
            && let Some(milestone) = records::get_milestone(conn, id)?
            && milestone.status == MilestoneStatus::Pending
        {
            if records::task_counts(conn, Some(&milestone.id))?.remaining() > 0 {
                return Ok(completed);
            }
            finish_milestone(conn, &milestone.id, mode, now)?;
            completed.push(milestone.id);
        }

        let milestones = records::list_milestones(conn)?;
        match transitions::next_pending_milestone(&milestones) {
            Some(next) => point_at(conn, Some(&next.id), now)?,
            None => {
                if pointer.is_some() {
                    point_at(conn, None, now)?;
                    info!("all milestones completed");
                }
                return Ok(completed);
            }
        }
    }
}

/// Recompute `total_tasks`/`completed_tasks` from the task table.
pub fn refresh_counters(conn: &Connection) -> Result<()> {
    let counts = records::task_counts(conn, None)?;
    state::set_state_u32(conn, state::TOTAL_TASKS, counts.total)?;
    state::set_state_u32(conn, state::COMPLETED_TASKS, counts.completed)?;
    Ok(())
}

fn finish_milestone(
    conn: &Connection,
    milestone_id: &str,
    mode: &RunMode,
    now: DateTime<Utc>,
) -> Result<()> {
    records::mark_milestone_completed(conn, milestone_id, now)?;
    info!(milestone_id, "milestone completed");
    if mode.auto_validate {
        records::mark_milestone_validated(conn, milestone_id, now)?;
        info!(milestone_id, "milestone auto-validated");
    }
    Ok(())
}

fn point_at(conn: &Connection, milestone_id: Option<&str>, now: DateTime<Utc>) -> Result<()> {
    state::set_state(conn, state::CURRENT_MILESTONE_ID, milestone_id)?;
    if let Some(id) = milestone_id {
        records::mark_milestone_started(conn, id, now)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Invariant, SchedulerError};
    use crate::store::Store;
    use crate::store::records::{NewMilestone, NewTask, insert_milestone, insert_task};

    /// M1 {A}, M2 {} (empty), M3 {B depends on A}.
    fn seeded() -> Store {
        let mut store = Store::open_in_memory().expect("open");
        store
            .transaction(|tx| {
                for (id, order) in [("M1", 0), ("M2", 1), ("M3", 2)] {
                    insert_milestone(
                        tx,
                        &NewMilestone {
                            id,
                            name: id,
                            description: "",
                            order_index: order,
                        },
                    )?;
                }
                for (id, milestone) in [("A", "M1"), ("B", "M3")] {
                    insert_task(
                        tx,
                        &NewTask {
                            id,
                            milestone_id: milestone,
                            title: id,
                            description: "",
                            order_index: 0,
                            max_file_changes: 10,
                        },
                    )?;
                }
                graph_edges::insert_dependency(tx, "B", "A")?;
                settle(tx, &RunMode::default(), Utc::now())?;
                Ok(())
            })
            .expect("seed");
        store
    }

    #[test]
    fn completing_last_task_skips_empty_milestone() {
        let mut store = seeded();
        let mode = RunMode::default();
        let now = Utc::now();
        store
            .transaction(|tx| start_task(tx, "A", &mode, now))
            .expect("start");
        let completion = store
            .transaction(|tx| complete_task(tx, "A", &mode, now))
            .expect("complete");

        assert!(completion.milestone_complete);
        assert_eq!(completion.milestones_completed, vec!["M1", "M2"]);
        assert_eq!(completion.current_milestone_id.as_deref(), Some("M3"));
        assert!(!completion.project_complete);
    }

    #[test]
    fn second_completion_changes_nothing() {
        let mut store = seeded();
        let mode = RunMode::default();
        let now = Utc::now();
        store
            .transaction(|tx| start_task(tx, "A", &mode, now))
            .expect("start");
        store
            .transaction(|tx| complete_task(tx, "A", &mode, now))
            .expect("complete");
        let before = store.read(records::list_tasks).expect("tasks");

        let err = store
            .transaction(|tx| complete_task(tx, "A", &mode, now))
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::IntegrityViolation {
                invariant: Invariant::IllegalTransition,
                ..
            }
        ));
        assert_eq!(store.read(records::list_tasks).expect("tasks"), before);
    }

    #[test]
    fn task_outside_current_milestone_cannot_start() {
        let mut store = seeded();
        let err = store
            .transaction(|tx| start_task(tx, "B", &RunMode::default(), Utc::now()))
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::IntegrityViolation {
                invariant: Invariant::MilestoneOrder,
                ..
            }
        ));
    }

    #[test]
    fn override_then_dependency_still_enforced() {
        let mut store = seeded();
        let mode = RunMode::default();
        store
            .transaction(|tx| set_current_milestone(tx, "M3", &mode, Utc::now()))
            .expect("override");
        let err = store
            .transaction(|tx| start_task(tx, "B", &mode, Utc::now()))
            .unwrap_err();
        match err {
            SchedulerError::DependencyUnmet { task_id, missing } => {
                assert_eq!(task_id, "B");
                assert_eq!(missing, vec!["A"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn reset_interrupted_returns_tasks_to_pending() {
        let mut store = seeded();
        let mode = RunMode {
            autopilot: true,
            ..RunMode::default()
        };
        store
            .transaction(|tx| start_task(tx, "A", &mode, Utc::now()))
            .expect("start");
        let reset = store
            .transaction(|tx| reset_interrupted(tx, Utc::now()))
            .expect("reset");
        assert_eq!(reset, vec!["A"]);

        let (task, executions) = store
            .read(|conn| {
                Ok((
                    records::require_task(conn, "A")?,
                    records::list_executions(conn, "A")?,
                ))
            })
            .expect("read");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.started_at, None);
        assert_eq!(executions[0].status, ExecutionStatus::Interrupted);
        assert!(executions[0].autopilot);
    }

    #[test]
    fn auto_validate_skips_manual_gate() {
        let mut store = seeded();
        let mode = RunMode {
            auto_validate: true,
            ..RunMode::default()
        };
        let now = Utc::now();
        store
            .transaction(|tx| start_task(tx, "A", &mode, now))
            .expect("start");
        store
            .transaction(|tx| complete_task(tx, "A", &mode, now))
            .expect("complete");
        let m1 = store
            .read(|conn| records::require_milestone(conn, "M1"))
            .expect("milestone");
        assert_eq!(m1.status, MilestoneStatus::Validated);

        let err = store
            .transaction(|tx| validate_milestone(tx, "M1", now))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::IntegrityViolation { .. }));
    }
}
