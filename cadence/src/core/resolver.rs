//! Dependency-aware task eligibility.
//!
//! A task is eligible when it is pending and every task it depends on is
//! completed. Among eligible tasks of a milestone the lowest `order_index`
//! wins, ties broken by id, so selection is deterministic.

use std::collections::HashMap;

use serde::Serialize;

use super::types::{Task, TaskDependency, TaskStatus};

/// Result of checking a single task's dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyCheck {
    pub task_id: String,
    pub satisfied: bool,
    /// Dependencies that are not completed (or unknown), sorted by id.
    pub missing: Vec<String>,
    pub total_dependencies: usize,
}

/// Compute which dependencies of `task_id` are not yet completed.
pub fn check_dependencies(
    task_id: &str,
    dependencies: &[TaskDependency],
    statuses: &HashMap<String, TaskStatus>,
) -> DependencyCheck {
    let mut total = 0usize;
    let mut missing: Vec<String> = Vec::new();
    for dep in dependencies.iter().filter(|dep| dep.task_id == task_id) {
        total += 1;
        if statuses.get(&dep.depends_on_task_id) != Some(&TaskStatus::Completed) {
            missing.push(dep.depends_on_task_id.clone());
        }
    }
    missing.sort();
    missing.dedup();
    DependencyCheck {
        task_id: task_id.to_string(),
        satisfied: missing.is_empty(),
        missing,
        total_dependencies: total,
    }
}

pub fn is_eligible(
    task: &Task,
    dependencies: &[TaskDependency],
    statuses: &HashMap<String, TaskStatus>,
) -> bool {
    task.status == TaskStatus::Pending
        && check_dependencies(&task.id, dependencies, statuses).satisfied
}

/// Select the next eligible task of `milestone_id`, or `None` if no task of
/// that milestone can start right now.
pub fn next_eligible<'a>(
    tasks: &'a [Task],
    milestone_id: &str,
    dependencies: &[TaskDependency],
    statuses: &HashMap<String, TaskStatus>,
) -> Option<&'a Task> {
    tasks
        .iter()
        .filter(|task| task.milestone_id == milestone_id)
        .filter(|task| is_eligible(task, dependencies, statuses))
        .min_by(|a, b| {
            a.order_index
                .cmp(&b.order_index)
                .then_with(|| a.id.cmp(&b.id))
        })
}

/// Count tasks of `milestone_id` that are not completed.
pub fn remaining_in_milestone(tasks: &[Task], milestone_id: &str) -> usize {
    tasks
        .iter()
        .filter(|task| task.milestone_id == milestone_id && task.status != TaskStatus::Completed)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, milestone: &str, order: i64, status: TaskStatus) -> Task {
        Task {
            id: id.to_string(),
            milestone_id: milestone.to_string(),
            title: format!("{id} title"),
            description: String::new(),
            order_index: order,
            status,
            max_file_changes: 10,
            started_at: None,
            completed_at: None,
            duration_secs: None,
        }
    }

    fn dep(task_id: &str, depends_on: &str) -> TaskDependency {
        TaskDependency {
            task_id: task_id.to_string(),
            depends_on_task_id: depends_on.to_string(),
        }
    }

    fn statuses(tasks: &[Task]) -> HashMap<String, TaskStatus> {
        tasks.iter().map(|t| (t.id.clone(), t.status)).collect()
    }

    #[test]
    fn lowest_order_then_id_wins() {
        let tasks = vec![
            task("b", "M1", 1, TaskStatus::Pending),
            task("a", "M1", 1, TaskStatus::Pending),
            task("c", "M1", 0, TaskStatus::Completed),
        ];
        let picked = next_eligible(&tasks, "M1", &[], &statuses(&tasks)).expect("eligible");
        assert_eq!(picked.id, "a");
    }

    #[test]
    fn unmet_dependency_blocks_task() {
        let tasks = vec![
            task("T1", "M1", 0, TaskStatus::InProgress),
            task("T2", "M1", 1, TaskStatus::Pending),
        ];
        let deps = vec![dep("T2", "T1")];
        assert!(next_eligible(&tasks, "M1", &deps, &statuses(&tasks)).is_none());

        let check = check_dependencies("T2", &deps, &statuses(&tasks));
        assert!(!check.satisfied);
        assert_eq!(check.missing, vec!["T1"]);
        assert_eq!(check.total_dependencies, 1);
    }

    #[test]
    fn cross_milestone_dependency_is_honored() {
        let tasks = vec![
            task("A", "M1", 0, TaskStatus::Completed),
            task("B", "M2", 0, TaskStatus::Pending),
        ];
        let deps = vec![dep("B", "A")];
        let picked = next_eligible(&tasks, "M2", &deps, &statuses(&tasks)).expect("eligible");
        assert_eq!(picked.id, "B");
        assert_eq!(remaining_in_milestone(&tasks, "M1"), 0);
        assert_eq!(remaining_in_milestone(&tasks, "M2"), 1);
    }
}
