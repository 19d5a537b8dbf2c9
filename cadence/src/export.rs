//! JSON export of the full scheduler state.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::Serialize;
use tracing::info;

use crate::config::write_atomic;
use crate::core::types::{
    Finding, Improvement, Milestone, RefineIteration, Task, TaskDependency, Technology,
};
use crate::store::{graph_edges, records, refine_rows, state};

/// Everything the store holds, as exported.
#[derive(Debug, Clone, Serialize)]
pub struct ExportDocument {
    pub metadata: BTreeMap<String, String>,
    pub state: BTreeMap<String, Option<String>>,
    pub technologies: Vec<Technology>,
    pub milestones: Vec<Milestone>,
    pub tasks: Vec<Task>,
    pub dependencies: Vec<TaskDependency>,
    pub refine: RefineExport,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RefineExport {
    pub iterations: Vec<RefineIteration>,
    pub findings: Vec<Finding>,
    pub improvements: Vec<Improvement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportSummary {
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Read the export document inside one read transaction.
pub fn collect(conn: &Connection) -> crate::error::Result<ExportDocument> {
    let iterations = refine_rows::list_iterations(conn, None)?;
    let mut refine = RefineExport::default();
    for iteration in &iterations {
        refine
            .findings
            .extend(refine_rows::findings_for_iteration(conn, iteration.id)?);
        refine
            .improvements
            .extend(refine_rows::improvements_for_iteration(conn, iteration.id)?);
    }
    refine.iterations = iterations;

    Ok(ExportDocument {
        metadata: state::all_meta(conn)?,
        state: state::all_state(conn)?,
        technologies: state::list_technologies(conn)?,
        milestones: records::list_milestones(conn)?,
        tasks: records::list_tasks(conn)?,
        dependencies: graph_edges::list_dependencies(conn)?,
        refine,
    })
}

/// Write one file per section plus `state.json` holding the whole document.
pub fn write(dir: &Path, document: &ExportDocument) -> Result<ExportSummary> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let files = vec![
        write_json(dir, "milestones.json", &document.milestones)?,
        write_json(dir, "tasks.json", &document.tasks)?,
        write_json(dir, "dependencies.json", &document.dependencies)?,
        write_json(dir, "refine.json", &document.refine)?,
        write_json(dir, "state.json", document)?,
    ];

    info!(dir = %dir.display(), files = files.len(), "exported state");
    Ok(ExportSummary {
        dir: dir.to_path_buf(),
        files,
    })
}

fn write_json<T: Serialize + ?Sized>(dir: &Path, name: &str, value: &T) -> Result<PathBuf> {
    let path = dir.join(name);
    let mut json =
        serde_json::to_string_pretty(value).with_context(|| format!("serialize {name}"))?;
    json.push('\n');
    write_atomic(&path, &json)?;
    Ok(path)
}
