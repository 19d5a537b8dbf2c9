//! Milestone, task and execution-log rows.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;

use crate::core::types::{
    ExecutionStatus, Milestone, MilestoneStatus, Task, TaskExecution, TaskStatus,
};
use crate::error::{Result, SchedulerError};

const MILESTONE_COLUMNS: &str = "id, name, description, order_index, status, \
     validation_required, started_at, completed_at, validated_at";

const TASK_COLUMNS: &str = "id, milestone_id, title, description, order_index, status, \
     max_file_changes, started_at, completed_at, duration_secs";

/// Milestone row as created at planning time.
#[derive(Debug, Clone, Copy)]
pub struct NewMilestone<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub description: &'a str,
    pub order_index: i64,
}

/// Task row as created at planning time.
#[derive(Debug, Clone, Copy)]
pub struct NewTask<'a> {
    pub id: &'a str,
    pub milestone_id: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub order_index: i64,
    pub max_file_changes: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub total: u32,
    pub pending: u32,
    pub in_progress: u32,
    pub completed: u32,
}

impl TaskCounts {
    pub fn remaining(&self) -> u32 {
        self.total - self.completed
    }
}

fn milestone_from_row(row: &Row<'_>) -> rusqlite::Result<Milestone> {
    Ok(Milestone {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        order_index: row.get(3)?,
        status: row.get(4)?,
        validation_required: row.get(5)?,
        started_at: row.get(6)?,
        completed_at: row.get(7)?,
        validated_at: row.get(8)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        milestone_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        order_index: row.get(4)?,
        status: row.get(5)?,
        max_file_changes: row.get(6)?,
        started_at: row.get(7)?,
        completed_at: row.get(8)?,
        duration_secs: row.get(9)?,
    })
}

pub fn insert_milestone(conn: &Connection, milestone: &NewMilestone<'_>) -> Result<()> {
    conn.execute(
        "INSERT INTO milestones (id, name, description, order_index) VALUES (?1, ?2, ?3, ?4)",
        params![
            milestone.id,
            milestone.name,
            milestone.description,
            milestone.order_index
        ],
    )?;
    Ok(())
}

pub fn insert_task(conn: &Connection, task: &NewTask<'_>) -> Result<()> {
    conn.execute(
        "INSERT INTO tasks (id, milestone_id, title, description, order_index, max_file_changes)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            task.id,
            task.milestone_id,
            task.title,
            task.description,
            task.order_index,
            task.max_file_changes
        ],
    )?;
    Ok(())
}

pub fn get_milestone(conn: &Connection, id: &str) -> Result<Option<Milestone>> {
    let milestone = conn
        .query_row(
            &format!("SELECT {MILESTONE_COLUMNS} FROM milestones WHERE id = ?1"),
            [id],
            milestone_from_row,
        )
        .optional()?;
    Ok(milestone)
}

pub fn require_milestone(conn: &Connection, id: &str) -> Result<Milestone> {
    get_milestone(conn, id)?.ok_or_else(|| SchedulerError::not_found("milestone", id))
}

/// All milestones ordered by (`order_index`, id).
pub fn list_milestones(conn: &Connection) -> Result<Vec<Milestone>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MILESTONE_COLUMNS} FROM milestones ORDER BY order_index, id"
    ))?;
    let rows = stmt.query_map([], milestone_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn count_milestones(conn: &Connection) -> Result<u32> {
    let count = conn.query_row("SELECT COUNT(*) FROM milestones", [], |row| row.get(0))?;
    Ok(count)
}

pub fn get_task(conn: &Connection, id: &str) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            [id],
            task_from_row,
        )
        .optional()?;
    Ok(task)
}

pub fn require_task(conn: &Connection, id: &str) -> Result<Task> {
    get_task(conn, id)?.ok_or_else(|| SchedulerError::not_found("task", id))
}

/// All tasks ordered by milestone order, then (`order_index`, id).
pub fn list_tasks(conn: &Connection) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         ORDER BY (SELECT m.order_index FROM milestones m WHERE m.id = tasks.milestone_id),
                  milestone_id, order_index, id"
    ))?;
    let rows = stmt.query_map([], task_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_tasks_in_milestone(conn: &Connection, milestone_id: &str) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE milestone_id = ?1 ORDER BY order_index, id"
    ))?;
    let rows = stmt.query_map([milestone_id], task_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn list_tasks_with_status(conn: &Connection, status: TaskStatus) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY order_index, id"
    ))?;
    let rows = stmt.query_map([status], task_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Status of every task, keyed by id.
pub fn task_statuses(conn: &Connection) -> Result<HashMap<String, TaskStatus>> {
    let mut stmt = conn.prepare("SELECT id, status FROM tasks")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
}

/// Per-status counts, optionally restricted to one milestone.
pub fn task_counts(conn: &Connection, milestone_id: Option<&str>) -> Result<TaskCounts> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM tasks
         WHERE ?1 IS NULL OR milestone_id = ?1
         GROUP BY status",
    )?;
    let rows = stmt.query_map([milestone_id], |row| {
        Ok((row.get::<_, TaskStatus>(0)?, row.get::<_, u32>(1)?))
    })?;
    let mut counts = TaskCounts::default();
    for row in rows {
        let (status, count) = row?;
        counts.total += count;
        match status {
            TaskStatus::Pending => counts.pending = count,
            TaskStatus::InProgress => counts.in_progress = count,
            TaskStatus::Completed => counts.completed = count,
        }
    }
    Ok(counts)
}

pub fn mark_task_started(conn: &Connection, id: &str, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = ?2, started_at = ?3, completed_at = NULL, duration_secs = NULL
         WHERE id = ?1",
        params![id, TaskStatus::InProgress, at],
    )?;
    Ok(())
}

pub fn mark_task_completed(
    conn: &Connection,
    id: &str,
    at: DateTime<Utc>,
    duration_secs: Option<i64>,
) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = ?2, completed_at = ?3, duration_secs = ?4 WHERE id = ?1",
        params![id, TaskStatus::Completed, at, duration_secs],
    )?;
    Ok(())
}

/// Return an in-progress task to pending, clearing its start stamp.
pub fn mark_task_pending(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE tasks SET status = ?2, started_at = NULL WHERE id = ?1",
        params![id, TaskStatus::Pending],
    )?;
    Ok(())
}

pub fn mark_milestone_started(conn: &Connection, id: &str, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE milestones SET started_at = COALESCE(started_at, ?2) WHERE id = ?1",
        params![id, at],
    )?;
    Ok(())
}

pub fn mark_milestone_completed(conn: &Connection, id: &str, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE milestones SET status = ?2, completed_at = ?3, validation_required = 1
         WHERE id = ?1",
        params![id, MilestoneStatus::Completed, at],
    )?;
    Ok(())
}

pub fn mark_milestone_validated(conn: &Connection, id: &str, at: DateTime<Utc>) -> Result<()> {
    conn.execute(
        "UPDATE milestones SET status = ?2, validated_at = ?3, validation_required = 0
         WHERE id = ?1",
        params![id, MilestoneStatus::Validated, at],
    )?;
    Ok(())
}

/// Milestones that are completed but not yet validated.
pub fn milestones_awaiting_validation(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM milestones WHERE status = ?1 AND validation_required = 1
         ORDER BY order_index, id",
    )?;
    let rows = stmt.query_map([MilestoneStatus::Completed], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn insert_execution(
    conn: &Connection,
    task_id: &str,
    autopilot: bool,
    at: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO task_executions (task_id, status, autopilot, started_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![task_id, ExecutionStatus::Started, autopilot, at],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Close the open execution row of `task_id` with `status`.
pub fn close_execution(
    conn: &Connection,
    task_id: &str,
    status: ExecutionStatus,
    at: DateTime<Utc>,
) -> Result<usize> {
    let updated = conn.execute(
        "UPDATE task_executions SET status = ?2, ended_at = ?3
         WHERE task_id = ?1 AND status = ?4",
        params![task_id, status, at, ExecutionStatus::Started],
    )?;
    Ok(updated)
}

pub fn list_executions(conn: &Connection, task_id: &str) -> Result<Vec<TaskExecution>> {
    let mut stmt = conn.prepare(
        "SELECT id, task_id, status, autopilot, started_at, ended_at
         FROM task_executions WHERE task_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([task_id], |row| {
        Ok(TaskExecution {
            id: row.get(0)?,
            task_id: row.get(1)?,
            status: row.get(2)?,
            autopilot: row.get(3)?,
            started_at: row.get(4)?,
            ended_at: row.get(5)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}
