//! Bulk import of the milestone/task plan.
//!
//! A plan is applied exactly once per project, in a single transaction: any
//! duplicate id, unknown reference or dependency cycle rejects the whole plan.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RunMode;
use crate::core::complexity::Complexity;
use crate::core::types::Technology;
use crate::error::{Invariant, Result, SchedulerError};
use crate::machine;
use crate::store::records::{self, NewMilestone, NewTask};
use crate::store::{graph_edges, state};

/// Planning input, typically read from a JSON file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanInput {
    #[serde(default)]
    pub complexity: Option<Complexity>,
    /// Requirements text handed to refine producers.
    #[serde(default)]
    pub requirements: String,
    #[serde(default)]
    pub technologies: Vec<Technology>,
    pub milestones: Vec<PlannedMilestone>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedMilestone {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub order_index: i64,
    #[serde(default)]
    pub tasks: Vec<PlannedTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub order_index: i64,
    #[serde(default = "default_max_file_changes")]
    pub max_file_changes: u32,
    /// Ids of tasks (in any milestone) that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_max_file_changes() -> u32 {
    10
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub milestones: usize,
    pub tasks: usize,
    pub dependencies: usize,
    pub current_milestone_id: Option<String>,
    /// Milestones with no tasks, completed as soon as they became current.
    pub milestones_completed: Vec<String>,
}

/// Insert the plan and position the current pointer.
pub fn apply_plan(
    conn: &Connection,
    plan: &PlanInput,
    mode: &RunMode,
    now: DateTime<Utc>,
) -> Result<PlanSummary> {
    if records::count_milestones(conn)? > 0 {
        return Err(SchedulerError::violation(
            Invariant::InvalidPlan,
            "project already has a plan",
        ));
    }
    check_ids(plan)?;

    let mut task_count = 0usize;
    for milestone in &plan.milestones {
        records::insert_milestone(
            conn,
            &NewMilestone {
                id: &milestone.id,
                name: &milestone.name,
                description: &milestone.description,
                order_index: milestone.order_index,
            },
        )?;
        for task in &milestone.tasks {
            records::insert_task(
                conn,
                &NewTask {
                    id: &task.id,
                    milestone_id: &milestone.id,
                    title: &task.title,
                    description: &task.description,
                    order_index: task.order_index,
                    max_file_changes: task.max_file_changes,
                },
            )?;
            task_count += 1;
        }
    }

    let mut dependency_count = 0usize;
    for task in plan.milestones.iter().flat_map(|m| &m.tasks) {
        for depends_on in &task.depends_on {
            graph_edges::insert_dependency(conn, &task.id, depends_on)?;
            dependency_count += 1;
        }
    }

    for technology in &plan.technologies {
        state::upsert_technology(conn, technology)?;
    }
    let complexity = plan.complexity.unwrap_or_default();
    state::set_meta(conn, state::META_COMPLEXITY, complexity.as_str())?;
    state::set_meta(conn, state::META_REQUIREMENTS, &plan.requirements)?;
    state::set_meta(conn, state::META_PLANNED_AT, &now.to_rfc3339())?;

    machine::refresh_counters(conn)?;
    let milestones_completed = machine::settle(conn, mode, now)?;
    let current_milestone_id = machine::current_milestone_id(conn)?;

    info!(
        milestones = plan.milestones.len(),
        tasks = task_count,
        dependencies = dependency_count,
        "plan imported"
    );
    Ok(PlanSummary {
        milestones: plan.milestones.len(),
        tasks: task_count,
        dependencies: dependency_count,
        current_milestone_id,
        milestones_completed,
    })
}

/// Reject blank and duplicate ids up front with a readable message; the
/// store would reject duplicates too, but only by constraint name.
fn check_ids(plan: &PlanInput) -> Result<()> {
    let mut milestone_ids = HashSet::new();
    let mut task_ids = HashSet::new();
    for milestone in &plan.milestones {
        if milestone.id.trim().is_empty() {
            return Err(SchedulerError::violation(
                Invariant::InvalidPlan,
                "milestone id must not be blank",
            ));
        }
        if !milestone_ids.insert(milestone.id.as_str()) {
            return Err(SchedulerError::violation(
                Invariant::UniqueId,
                format!("duplicate milestone id '{}'", milestone.id),
            ));
        }
        for task in &milestone.tasks {
            if task.id.trim().is_empty() {
                return Err(SchedulerError::violation(
                    Invariant::InvalidPlan,
                    format!("task id in milestone '{}' must not be blank", milestone.id),
                ));
            }
            if !task_ids.insert(task.id.as_str()) {
                return Err(SchedulerError::violation(
                    Invariant::UniqueId,
                    format!("duplicate task id '{}'", task.id),
                ));
            }
        }
    }
    Ok(())
}
