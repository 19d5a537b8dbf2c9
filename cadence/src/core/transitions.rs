//! Legality rules for milestone and task status changes.
//!
//! Pure checks only; `crate::machine` applies them inside a transaction.

use chrono::{DateTime, Utc};

use super::resolver::DependencyCheck;
use super::types::{Milestone, MilestoneStatus, Task, TaskStatus};
use crate::error::{Invariant, Result, SchedulerError};

/// Check that `task` may move pending -> in_progress.
///
/// Order of checks: status, milestone order, dependencies. A task outside the
/// current milestone is rejected even when its dependencies are met.
pub fn check_start(
    task: &Task,
    current_milestone: Option<&str>,
    dependencies: &DependencyCheck,
) -> Result<()> {
    if task.status != TaskStatus::Pending {
        return Err(SchedulerError::violation(
            Invariant::IllegalTransition,
            format!(
                "task '{}' cannot start from status {}",
                task.id,
                task.status.as_str()
            ),
        ));
    }
    match current_milestone {
        Some(current) if current == task.milestone_id => {}
        Some(current) => {
            return Err(SchedulerError::violation(
                Invariant::MilestoneOrder,
                format!(
                    "task '{}' belongs to milestone '{}' but the current milestone is '{}'",
                    task.id, task.milestone_id, current
                ),
            ));
        }
        None => {
            return Err(SchedulerError::violation(
                Invariant::MilestoneOrder,
                format!("task '{}' cannot start: no current milestone", task.id),
            ));
        }
    }
    if !dependencies.satisfied {
        return Err(SchedulerError::DependencyUnmet {
            task_id: task.id.clone(),
            missing: dependencies.missing.clone(),
        });
    }
    Ok(())
}

/// Check that `task` may move in_progress -> completed.
pub fn check_complete(task: &Task) -> Result<()> {
    if task.status != TaskStatus::InProgress {
        return Err(SchedulerError::violation(
            Invariant::IllegalTransition,
            format!(
                "task '{}' cannot complete from status {}",
                task.id,
                task.status.as_str()
            ),
        ));
    }
    Ok(())
}

/// Check that `task` may be released in_progress -> pending.
pub fn check_release(task: &Task) -> Result<()> {
    if task.status != TaskStatus::InProgress {
        return Err(SchedulerError::violation(
            Invariant::IllegalTransition,
            format!(
                "task '{}' cannot be released from status {}",
                task.id,
                task.status.as_str()
            ),
        ));
    }
    Ok(())
}

/// Check that `milestone` may move completed -> validated.
pub fn check_validate(milestone: &Milestone) -> Result<()> {
    if milestone.status != MilestoneStatus::Completed {
        return Err(SchedulerError::violation(
            Invariant::IllegalTransition,
            format!(
                "milestone '{}' cannot be validated from status {}",
                milestone.id,
                milestone.status.as_str()
            ),
        ));
    }
    Ok(())
}

/// The current pointer may only be moved onto a milestone that still has work.
pub fn check_pointer_target(milestone: &Milestone) -> Result<()> {
    if milestone.status != MilestoneStatus::Pending {
        return Err(SchedulerError::violation(
            Invariant::MilestoneOrder,
            format!(
                "milestone '{}' is already {}",
                milestone.id,
                milestone.status.as_str()
            ),
        ));
    }
    Ok(())
}

/// First pending milestone by (`order_index`, id).
pub fn next_pending_milestone(milestones: &[Milestone]) -> Option<&Milestone> {
    milestones
        .iter()
        .filter(|m| m.status == MilestoneStatus::Pending)
        .min_by(|a, b| {
            a.order_index
                .cmp(&b.order_index)
                .then_with(|| a.id.cmp(&b.id))
        })
}

/// Whole seconds between start and completion; `None` without a start stamp.
pub fn duration_secs(
    started_at: Option<DateTime<Utc>>,
    completed_at: DateTime<Utc>,
) -> Option<i64> {
    started_at.map(|start| (completed_at - start).num_seconds().max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task(status: TaskStatus) -> Task {
        Task {
            id: "T1".to_string(),
            milestone_id: "M1".to_string(),
            title: "t".to_string(),
            description: String::new(),
            order_index: 0,
            status,
            max_file_changes: 10,
            started_at: None,
            completed_at: None,
            duration_secs: None,
        }
    }

    fn milestone(id: &str, order: i64, status: MilestoneStatus) -> Milestone {
        Milestone {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            order_index: order,
            status,
            validation_required: false,
            started_at: None,
            completed_at: None,
            validated_at: None,
        }
    }

    fn satisfied() -> DependencyCheck {
        DependencyCheck {
            task_id: "T1".to_string(),
            satisfied: true,
            missing: Vec::new(),
            total_dependencies: 0,
        }
    }

    #[test]
    fn start_requires_current_milestone() {
        let err = check_start(&task(TaskStatus::Pending), Some("M2"), &satisfied()).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::IntegrityViolation {
                invariant: Invariant::MilestoneOrder,
                ..
            }
        ));
        check_start(&task(TaskStatus::Pending), Some("M1"), &satisfied()).expect("start");
    }

    #[test]
    fn completing_twice_is_illegal() {
        let err = check_complete(&task(TaskStatus::Completed)).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::IntegrityViolation {
                invariant: Invariant::IllegalTransition,
                ..
            }
        ));
    }

    #[test]
    fn unmet_dependencies_reported_after_status_checks() {
        let check = DependencyCheck {
            task_id: "T1".to_string(),
            satisfied: false,
            missing: vec!["T0".to_string()],
            total_dependencies: 1,
        };
        let err = check_start(&task(TaskStatus::Pending), Some("M1"), &check).unwrap_err();
        assert!(matches!(err, SchedulerError::DependencyUnmet { .. }));
    }

    #[test]
    fn validate_only_from_completed() {
        assert!(check_validate(&milestone("M1", 0, MilestoneStatus::Pending)).is_err());
        assert!(check_validate(&milestone("M1", 0, MilestoneStatus::Completed)).is_ok());
        assert!(check_validate(&milestone("M1", 0, MilestoneStatus::Validated)).is_err());
    }

    #[test]
    fn next_pending_skips_finished() {
        let milestones = vec![
            milestone("M1", 0, MilestoneStatus::Completed),
            milestone("M3", 2, MilestoneStatus::Pending),
            milestone("M2", 1, MilestoneStatus::Pending),
        ];
        assert_eq!(next_pending_milestone(&milestones).map(|m| m.id.as_str()), Some("M2"));
    }

    #[test]
    fn duration_is_whole_seconds() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 30).unwrap();
        assert_eq!(duration_secs(Some(start), end), Some(90));
        assert_eq!(duration_secs(None, end), None);
    }
}
