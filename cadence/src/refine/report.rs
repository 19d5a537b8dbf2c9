//! Refine phase status, summary and the rendered text report.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use minijinja::{Environment, context};
use rusqlite::Connection;
use serde::Serialize;

use crate::core::complexity::Complexity;
use crate::core::types::{IterationStatus, RefineIteration};
use crate::error::Result;
use crate::facade::Facade;
use crate::store::{refine_rows, state};

const REPORT_TEMPLATE: &str = include_str!("prompts/report.txt");

static REPORTS: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("report", REPORT_TEMPLATE)
        .expect("report template should be valid");
    env
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefineStatus {
    pub run_id: Option<String>,
    pub phase_status: Option<String>,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub iterations: Vec<RefineIteration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefineSummary {
    pub run_id: Option<String>,
    pub phase_status: Option<String>,
    pub complexity: Complexity,
    pub iterations_completed: u32,
    pub max_iterations: u32,
    pub validation_passed: u32,
    pub validation_failed: u32,
    /// Iterations whose validation could not run.
    pub validation_unknown: u32,
    pub producer_failures: u32,
    pub findings_total: u32,
    pub findings_addressed: u32,
    pub findings_by_severity: BTreeMap<String, u32>,
    pub improvements_total: u32,
    pub improvements_passing: u32,
}

pub fn refine_status(facade: &Facade) -> Result<RefineStatus> {
    facade.with_store(|store| store.read(read_status))
}

pub fn refine_summary(facade: &Facade) -> Result<RefineSummary> {
    facade.with_store(|store| store.read(read_summary))
}

/// Plain-text report of the latest refine run.
pub fn render_report(facade: &Facade) -> anyhow::Result<String> {
    let (summary, status) = facade
        .with_store(|store| store.read(|conn| Ok((read_summary(conn)?, read_status(conn)?))))?;
    let rendered = REPORTS.get_template("report")?.render(context! {
        summary => summary,
        iterations => status.iterations,
    })?;
    Ok(rendered)
}

/// State of the latest run; `iterations` is empty before the first run.
pub fn read_status(conn: &Connection) -> Result<RefineStatus> {
    let run_id = state::get_state(conn, state::REFINE_RUN_ID)?;
    let iterations = match &run_id {
        Some(run_id) => refine_rows::list_iterations(conn, Some(run_id))?,
        None => Vec::new(),
    };
    Ok(RefineStatus {
        phase_status: state::get_state(conn, state::REFINE_PHASE_STATUS)?,
        current_iteration: state::get_state_u32(conn, state::REFINE_CURRENT_ITERATION)?,
        max_iterations: state::get_state_u32(conn, state::REFINE_MAX_ITERATIONS)?,
        run_id,
        iterations,
    })
}

pub fn read_summary(conn: &Connection) -> Result<RefineSummary> {
    let status = read_status(conn)?;
    let complexity = state::get_meta(conn, state::META_COMPLEXITY)?
        .as_deref()
        .map(Complexity::parse_or_default)
        .unwrap_or_default();

    let closed: Vec<&RefineIteration> = status
        .iterations
        .iter()
        .filter(|it| it.status == IterationStatus::Completed)
        .collect();
    let count = |wanted: Option<bool>| {
        closed
            .iter()
            .filter(|it| it.validation_passed == wanted)
            .count() as u32
    };

    let (findings_by_severity, findings, improvements) = match &status.run_id {
        Some(run_id) => (
            refine_rows::findings_by_severity(conn, run_id)?,
            refine_rows::finding_totals(conn, run_id)?,
            refine_rows::improvement_totals(conn, run_id)?,
        ),
        None => (BTreeMap::new(), (0, 0), (0, 0)),
    };
    let (findings_total, findings_addressed) = findings;
    let (improvements_total, improvements_passing) = improvements;

    Ok(RefineSummary {
        complexity,
        iterations_completed: closed.len() as u32,
        max_iterations: status.max_iterations,
        validation_passed: count(Some(true)),
        validation_failed: count(Some(false)),
        validation_unknown: count(None),
        producer_failures: closed.iter().map(|it| it.producer_failures).sum(),
        findings_total,
        findings_addressed,
        findings_by_severity,
        improvements_total,
        improvements_passing,
        run_id: status.run_id,
        phase_status: status.phase_status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn summary_before_any_run_is_empty() {
        let store = Store::open_in_memory().expect("open");
        let summary = store.read(read_summary).expect("summary");
        assert_eq!(summary.run_id, None);
        assert_eq!(summary.iterations_completed, 0);
        assert_eq!(summary.complexity, Complexity::Medium);
        assert!(summary.findings_by_severity.is_empty());
    }
}
