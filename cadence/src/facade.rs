//! Execution facade: the single entry point for work performers and the CLI.
//!
//! The facade owns the store behind a mutex, so the scheduler has exactly one
//! writer. Every mutating call is one transaction; snapshots are taken by
//! policy before bulk mutations and before automated recovery.
//!
//! Opening the facade never touches task state: an in_progress task may
//! belong to a performer in another process. Recovery of work abandoned by a
//! crashed performer is the explicit [`Facade::reset_interrupted`].

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::backup::{
    BackupHandle, BackupManager, RestoreOutcome, RetentionPolicy, SnapshotKind, SnapshotReport,
};
use crate::config::RunMode;
use crate::core::resolver::{self, DependencyCheck};
use crate::core::transitions;
use crate::core::types::{Milestone, Task, TaskStatus};
use crate::error::{Result, SchedulerError};
use crate::export::{self, ExportSummary};
use crate::machine::{self, Completion};
use crate::paths::CadencePaths;
use crate::plan::{self, PlanInput, PlanSummary};
use crate::store::records::{self, TaskCounts};
use crate::store::{Store, graph_edges, state};

/// Snapshot of scheduler progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentStatus {
    pub planned: bool,
    pub current_milestone: Option<Milestone>,
    /// Task counts of the current milestone.
    pub current_milestone_tasks: Option<TaskCounts>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub in_progress_tasks: u32,
    pub pending_tasks: u32,
    pub milestones_total: usize,
    pub milestones_finished: usize,
    /// Milestones completed but not yet validated.
    pub awaiting_validation: Vec<String>,
    pub validation_required: bool,
    pub blocked_reason: Option<String>,
    pub project_complete: bool,
    pub refine_phase_status: Option<String>,
}

/// Answer to "what should be worked on next".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NextTask {
    Eligible {
        task: Task,
    },
    /// Work remains in the current milestone but nothing can start.
    Blocked {
        milestone_id: String,
        remaining: u32,
        in_progress: Vec<String>,
    },
    ProjectComplete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MilestoneReport {
    pub milestone: Milestone,
    pub is_current: bool,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub in_progress_tasks: u32,
    pub pending_tasks: u32,
    /// Rounded to one decimal; 100.0 for a milestone without tasks.
    pub completion_percentage: f64,
    pub completed_task_ids: Vec<String>,
    pub remaining_task_ids: Vec<String>,
}

pub struct Facade {
    store: Mutex<Store>,
    backups: BackupManager,
    mode: RunMode,
}

impl Facade {
    /// Open the project's state database.
    pub fn open(paths: &CadencePaths, mode: RunMode) -> Result<Self> {
        let store = Store::open(&paths.db_path)?;
        Ok(Self::new(store, BackupManager::new(&paths.backups_dir), mode))
    }

    pub fn new(store: Store, backups: BackupManager, mode: RunMode) -> Self {
        Self {
            store: Mutex::new(store),
            backups,
            mode,
        }
    }

    pub fn run_mode(&self) -> RunMode {
        self.mode
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    /// A poisoned lock is recovered: every write is transactional, so a
    /// panicking holder cannot leave partial state behind.
    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn with_store<T>(&self, f: impl FnOnce(&mut Store) -> Result<T>) -> Result<T> {
        let mut store = self.lock();
        f(&mut store)
    }

    /// Import the plan (once per project).
    pub fn plan(&self, input: &PlanInput) -> Result<PlanSummary> {
        let mode = self.mode;
        self.with_store(|store| {
            self.backups.backup(store, SnapshotKind::Auto, "plan")?;
            store.transaction(|tx| plan::apply_plan(tx, input, &mode, Utc::now()))
        })
    }

    pub fn get_current_status(&self) -> Result<CurrentStatus> {
        self.with_store(|store| {
            store.read(|conn| {
                let milestones = records::list_milestones(conn)?;
                let counts = records::task_counts(conn, None)?;
                let current = match machine::current_milestone_id(conn)? {
                    Some(id) => records::get_milestone(conn, &id)?,
                    None => None,
                };
                let current_counts = match &current {
                    Some(m) => Some(records::task_counts(conn, Some(&m.id))?),
                    None => None,
                };
                let awaiting_validation = records::milestones_awaiting_validation(conn)?;
                let project_complete = milestones.iter().all(|m| m.status.is_finished());
                let blocked_reason = match (&current, &current_counts) {
                    (Some(m), Some(c)) if c.in_progress == 0 && c.pending > 0 => {
                        let tasks = records::list_tasks_in_milestone(conn, &m.id)?;
                        let edges = graph_edges::list_dependencies(conn)?;
                        let statuses = records::task_statuses(conn)?;
                        resolver::next_eligible(&tasks, &m.id, &edges, &statuses)
                            .is_none()
                            .then(|| {
                                format!(
                                    "no eligible task in milestone '{}': \
                                     {} pending task(s) wait on dependencies",
                                    m.id, c.pending
                                )
                            })
                    }
                    _ => None,
                };
                Ok(CurrentStatus {
                    planned: !milestones.is_empty(),
                    current_milestone_tasks: current_counts,
                    current_milestone: current,
                    total_tasks: counts.total,
                    completed_tasks: counts.completed,
                    in_progress_tasks: counts.in_progress,
                    pending_tasks: counts.pending,
                    milestones_total: milestones.len(),
                    milestones_finished: milestones
                        .iter()
                        .filter(|m| m.status.is_finished())
                        .count(),
                    validation_required: !awaiting_validation.is_empty(),
                    awaiting_validation,
                    blocked_reason,
                    project_complete,
                    refine_phase_status: state::get_state(conn, state::REFINE_PHASE_STATUS)?,
                })
            })
        })
    }

    /// Next eligible task of the current milestone, or (with `task_id`) the
    /// named task if it could start right now.
    ///
    /// Inspecting the current milestone completes it when it has no remaining
    /// tasks, so this call may advance the pointer.
    pub fn get_next_task(&self, task_id: Option<&str>) -> Result<NextTask> {
        let mode = self.mode;
        self.with_store(|store| {
            store.transaction(|tx| {
                machine::settle(tx, &mode, Utc::now())?;
                let current = machine::current_milestone_id(tx)?;

                if let Some(id) = task_id {
                    let task = records::require_task(tx, id)?;
                    let check = resolver::check_dependencies(
                        id,
                        &graph_edges::dependencies_of(tx, id)?,
                        &records::task_statuses(tx)?,
                    );
                    transitions::check_start(&task, current.as_deref(), &check)?;
                    return Ok(NextTask::Eligible { task });
                }

                let Some(milestone_id) = current else {
                    return Ok(NextTask::ProjectComplete);
                };
                let tasks = records::list_tasks_in_milestone(tx, &milestone_id)?;
                let edges = graph_edges::list_dependencies(tx)?;
                let statuses = records::task_statuses(tx)?;
                if let Some(task) =
                    resolver::next_eligible(&tasks, &milestone_id, &edges, &statuses)
                {
                    return Ok(NextTask::Eligible { task: task.clone() });
                }
                let in_progress = tasks
                    .iter()
                    .filter(|t| t.status == TaskStatus::InProgress)
                    .map(|t| t.id.clone())
                    .collect();
                Ok(NextTask::Blocked {
                    remaining: resolver::remaining_in_milestone(&tasks, &milestone_id) as u32,
                    milestone_id,
                    in_progress,
                })
            })
        })
    }

    pub fn start_task(&self, task_id: &str) -> Result<Task> {
        let mode = self.mode;
        self.with_store(|store| {
            store.transaction(|tx| machine::start_task(tx, task_id, &mode, Utc::now()))
        })
    }

    pub fn complete_task(&self, task_id: &str) -> Result<Completion> {
        let mode = self.mode;
        self.with_store(|store| {
            let completion =
                store.transaction(|tx| machine::complete_task(tx, task_id, &mode, Utc::now()))?;
            if mode.snapshot_on_milestone
                && let Some(last) = completion.milestones_completed.last()
            {
                let tag = format!("milestone_{last}");
                if let Err(err) = self.backups.backup(store, SnapshotKind::Auto, &tag) {
                    warn!(error = %err, milestone_id = %last, "milestone snapshot failed");
                }
            }
            Ok(completion)
        })
    }

    /// Return an in_progress task to pending (work abandoned or failed).
    pub fn release_task(&self, task_id: &str) -> Result<Task> {
        self.with_store(|store| {
            store.transaction(|tx| machine::release_task(tx, task_id, Utc::now()))
        })
    }

    pub fn validate_milestone(&self, milestone_id: &str) -> Result<Milestone> {
        self.with_store(|store| {
            store.transaction(|tx| machine::validate_milestone(tx, milestone_id, Utc::now()))
        })
    }

    pub fn validate_dependencies(&self, task_id: &str) -> Result<DependencyCheck> {
        self.with_store(|store| {
            store.read(|conn| {
                records::require_task(conn, task_id)?;
                Ok(resolver::check_dependencies(
                    task_id,
                    &graph_edges::dependencies_of(conn, task_id)?,
                    &records::task_statuses(conn)?,
                ))
            })
        })
    }

    pub fn get_milestone_status(&self, milestone_id: &str) -> Result<MilestoneReport> {
        self.with_store(|store| {
            store.read(|conn| {
                let milestone = records::require_milestone(conn, milestone_id)?;
                let tasks = records::list_tasks_in_milestone(conn, milestone_id)?;
                let counts = records::task_counts(conn, Some(milestone_id))?;
                let is_current =
                    machine::current_milestone_id(conn)?.as_deref() == Some(milestone_id);
                let (completed, remaining): (Vec<&Task>, Vec<&Task>) = tasks
                    .iter()
                    .partition(|t| t.status == TaskStatus::Completed);
                Ok(MilestoneReport {
                    completion_percentage: completion_percentage(counts.completed, counts.total),
                    milestone,
                    is_current,
                    total_tasks: counts.total,
                    completed_tasks: counts.completed,
                    in_progress_tasks: counts.in_progress,
                    pending_tasks: counts.pending,
                    completed_task_ids: completed.into_iter().map(|t| t.id.clone()).collect(),
                    remaining_task_ids: remaining.into_iter().map(|t| t.id.clone()).collect(),
                })
            })
        })
    }

    /// Manual override of the current milestone; snapshot first.
    pub fn set_current_milestone(&self, milestone_id: &str) -> Result<Vec<String>> {
        let mode = self.mode;
        self.with_store(|store| {
            store.read(|conn| records::require_milestone(conn, milestone_id))?;
            self.backups
                .backup(store, SnapshotKind::Auto, &format!("override_{milestone_id}"))?;
            store.transaction(|tx| {
                machine::set_current_milestone(tx, milestone_id, &mode, Utc::now())
            })
        })
    }

    /// Reset every in_progress task to pending, after a snapshot when there
    /// is anything to reset. Only for a performer restarting after a crash:
    /// work another process is still doing would be reset too.
    pub fn reset_interrupted(&self) -> Result<Vec<String>> {
        self.with_store(|store| {
            let stuck = store
                .read(|conn| records::list_tasks_with_status(conn, TaskStatus::InProgress))?;
            if stuck.is_empty() {
                return Ok(Vec::new());
            }
            self.backups.backup(store, SnapshotKind::Auto, "recovery")?;
            let reset = store.transaction(|tx| machine::reset_interrupted(tx, Utc::now()))?;
            warn!(tasks = ?reset, "recovered interrupted tasks");
            Ok(reset)
        })
    }

    pub fn backup(&self, kind: SnapshotKind, tag: &str) -> Result<BackupHandle> {
        self.with_store(|store| self.backups.backup(store, kind, tag))
    }

    pub fn list_backups(&self) -> Result<Vec<BackupHandle>> {
        self.backups.list()
    }

    pub fn verify_backup(&self, name: &str) -> Result<SnapshotReport> {
        let handle = self.backups.find(name)?;
        self.backups.verify(&handle)
    }

    /// Restore the named snapshot. Rows come back exactly as captured,
    /// in_progress tasks included.
    pub fn restore(&self, name: &str) -> Result<RestoreOutcome> {
        let handle = self.backups.find(name)?;
        self.restore_handle(&handle)
    }

    /// Restore the newest non-safety snapshot.
    pub fn restore_latest(&self) -> Result<RestoreOutcome> {
        let handle = self
            .backups
            .latest()?
            .ok_or_else(|| SchedulerError::not_found("snapshot", "latest"))?;
        self.restore_handle(&handle)
    }

    fn restore_handle(&self, handle: &BackupHandle) -> Result<RestoreOutcome> {
        self.with_store(|store| self.backups.restore(store, handle))
    }

    pub fn cleanup_backups(&self, policy: &RetentionPolicy) -> Result<Vec<BackupHandle>> {
        self.backups.cleanup(policy, Utc::now())
    }

    /// Write the JSON export of the full state into `dir`.
    pub fn export_json(&self, dir: &Path) -> anyhow::Result<ExportSummary> {
        let document = self.with_store(|store| store.read(export::collect))?;
        export::write(dir, &document)
    }

    /// Location of the live database, `None` for in-memory stores.
    pub fn db_path(&self) -> Option<PathBuf> {
        self.lock().path().map(Path::to_path_buf)
    }
}

fn completion_percentage(completed: u32, total: u32) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (f64::from(completed) * 1000.0 / f64::from(total)).round() / 10.0
}
