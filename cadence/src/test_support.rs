//! Test-only fixtures: plans, a temporary project and scripted collaborators.

use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use tempfile::TempDir;

use crate::config::RunMode;
use crate::core::complexity::Complexity;
use crate::core::types::{FocusArea, Technology};
use crate::drive::{WorkExecutor, WorkItem, WorkResult};
use crate::facade::Facade;
use crate::paths::{CadencePaths, InitOptions, init_project};
use crate::plan::{PlanInput, PlannedMilestone, PlannedTask};
use crate::process::CancelToken;
use crate::refine::validator::{ValidationRequest, Validator};
use crate::refine::{RefineProducer, RefineRequest, ReviewProducer, ReviewRequest};

/// Planned task with deterministic defaults.
pub fn task(id: &str, order: i64, depends_on: &[&str]) -> PlannedTask {
    PlannedTask {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} instructions"),
        order_index: order,
        max_file_changes: 10,
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
    }
}

pub fn milestone(id: &str, order: i64, tasks: Vec<PlannedTask>) -> PlannedMilestone {
    PlannedMilestone {
        id: id.to_string(),
        name: format!("{id} name"),
        description: String::new(),
        order_index: order,
        tasks,
    }
}

pub fn plan(complexity: Complexity, milestones: Vec<PlannedMilestone>) -> PlanInput {
    PlanInput {
        complexity: Some(complexity),
        requirements: "Build a small todo CLI with persistent storage.".to_string(),
        technologies: vec![Technology {
            name: "rust".to_string(),
            category: "language".to_string(),
            version: "1.85".to_string(),
        }],
        milestones,
    }
}

/// Two milestones: `M1 {T1, T2 -> T1}`, `M2 {T3 -> T2}`; MICRO complexity.
pub fn plan_fixture() -> PlanInput {
    plan(
        Complexity::Micro,
        vec![
            milestone("M1", 0, vec![task("T1", 0, &[]), task("T2", 1, &["T1"])]),
            milestone("M2", 1, vec![task("T3", 0, &["T2"])]),
        ],
    )
}

/// An initialized project in a temporary directory with an open facade.
pub struct TestProject {
    temp: TempDir,
    pub paths: CadencePaths,
    pub facade: Facade,
}

impl TestProject {
    pub fn new(mode: RunMode) -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = init_project(temp.path(), &InitOptions { force: false })?;
        let facade = Facade::open(&paths, mode)?;
        Ok(Self {
            temp,
            paths,
            facade,
        })
    }

    pub fn planned(plan: &PlanInput, mode: RunMode) -> Result<Self> {
        let project = Self::new(mode)?;
        project.facade.plan(plan)?;
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    /// Open the project again the way a restarted process would.
    pub fn reopen(&mut self, mode: RunMode) -> Result<()> {
        self.facade = Facade::open(&self.paths, mode)?;
        Ok(())
    }
}

/// Completes every item, except the one named by `failing_on`.
#[derive(Default)]
pub struct ScriptedWorkExecutor {
    failing_on: Option<String>,
    performed: Mutex<Vec<String>>,
}

impl ScriptedWorkExecutor {
    pub fn completing() -> Self {
        Self::default()
    }

    pub fn failing_on(task_id: &str) -> Self {
        Self {
            failing_on: Some(task_id.to_string()),
            ..Self::default()
        }
    }

    pub fn performed(&self) -> Vec<String> {
        self.performed.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

impl WorkExecutor for ScriptedWorkExecutor {
    fn perform(&self, item: &WorkItem) -> Result<WorkResult> {
        if let Ok(mut performed) = self.performed.lock() {
            performed.push(item.task_id.clone());
        }
        if self.failing_on.as_deref() == Some(item.task_id.as_str()) {
            return Ok(WorkResult::Failed {
                reason: "scripted failure".to_string(),
            });
        }
        Ok(WorkResult::Completed {
            summary: format!("{} done", item.task_id),
        })
    }
}

/// Reports one MEDIUM finding per call, located in `src/<focus>.rs`.
#[derive(Default)]
pub struct ScriptedReviewProducer {
    failing: HashSet<FocusArea>,
    malformed: HashSet<FocusArea>,
    calls: AtomicUsize,
}

impl ScriptedReviewProducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every review for `area` returns an error.
    pub fn failing(mut self, area: FocusArea) -> Self {
        self.failing.insert(area);
        self
    }

    /// Every review for `area` returns a document violating the schema.
    pub fn malformed(mut self, area: FocusArea) -> Self {
        self.malformed.insert(area);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ReviewProducer for ScriptedReviewProducer {
    fn review(&self, request: &ReviewRequest, _cancel: &CancelToken) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let area = request.focus_area;
        if self.failing.contains(&area) {
            return Err(anyhow!("scripted {area} reviewer failure"));
        }
        if self.malformed.contains(&area) {
            return Ok(json!({"notes": "not a findings document"}));
        }
        Ok(json!({"findings": [{
            "severity": "MEDIUM",
            "category": area.as_str(),
            "file": format!("src/{area}.rs"),
            "line": request.iteration,
            "description": format!("{area} finding in iteration {}", request.iteration),
            "suggestion": "tighten it"
        }]}))
    }
}

/// Addresses every finding it receives, or fails when built with `failing()`.
#[derive(Default)]
pub struct ScriptedRefineProducer {
    fail: bool,
    calls: AtomicUsize,
}

impl ScriptedRefineProducer {
    pub fn addressing_all() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RefineProducer for ScriptedRefineProducer {
    fn refine(&self, request: &RefineRequest, _cancel: &CancelToken) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("scripted refine failure"));
        }
        let improvements: Vec<Value> = request
            .findings
            .iter()
            .map(|finding| {
                json!({
                    "finding_id": finding.id,
                    "description": format!("addressed: {}", finding.description),
                    "files_modified": finding.file_path.iter().collect::<Vec<_>>(),
                    "tests_passing": true
                })
            })
            .collect();
        Ok(json!({ "improvements": improvements }))
    }
}

/// Replays scripted validation results; `None` means "cannot run". Once the
/// script is exhausted every call passes.
pub struct ScriptedValidator {
    results: Mutex<VecDeque<Option<bool>>>,
}

impl ScriptedValidator {
    pub fn new(results: Vec<Option<bool>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
        }
    }

    pub fn passing() -> Self {
        Self::new(Vec::new())
    }
}

impl Validator for ScriptedValidator {
    fn validate(&self, _request: &ValidationRequest) -> Result<bool> {
        let next = self
            .results
            .lock()
            .map_err(|_| anyhow!("validator script poisoned"))?
            .pop_front()
            .unwrap_or(Some(true));
        next.ok_or_else(|| anyhow!("scripted validator cannot run"))
    }
}
