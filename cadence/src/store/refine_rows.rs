//! Refine iteration, finding and improvement rows.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::core::types::{
    Finding, FindingDraft, Improvement, ImprovementDraft, IterationStatus, RefineIteration,
};
use crate::error::Result;

const ITERATION_COLUMNS: &str = "id, run_id, iteration_number, status, findings_count, \
     improvements_count, producer_failures, validation_passed, summary, started_at, completed_at";

const FINDING_COLUMNS: &str = "id, iteration_id, focus_area, severity, category, file_path, \
     line_number, description, suggestion, addressed, priority_rank";

/// Values written when an iteration closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationClose {
    pub findings_count: u32,
    pub improvements_count: u32,
    pub producer_failures: u32,
    pub validation_passed: Option<bool>,
    pub summary: String,
    pub completed_at: DateTime<Utc>,
}

fn iteration_from_row(row: &Row<'_>) -> rusqlite::Result<RefineIteration> {
    Ok(RefineIteration {
        id: row.get(0)?,
        run_id: row.get(1)?,
        iteration_number: row.get(2)?,
        status: row.get(3)?,
        findings_count: row.get(4)?,
        improvements_count: row.get(5)?,
        producer_failures: row.get(6)?,
        validation_passed: row.get(7)?,
        summary: row.get(8)?,
        started_at: row.get(9)?,
        completed_at: row.get(10)?,
    })
}

fn finding_from_row(row: &Row<'_>) -> rusqlite::Result<Finding> {
    Ok(Finding {
        id: row.get(0)?,
        iteration_id: row.get(1)?,
        focus_area: row.get(2)?,
        severity: row.get(3)?,
        category: row.get(4)?,
        file_path: row.get(5)?,
        line_number: row.get(6)?,
        description: row.get(7)?,
        suggestion: row.get(8)?,
        addressed: row.get(9)?,
        rank: row.get(10)?,
    })
}

fn improvement_from_row(row: &Row<'_>) -> rusqlite::Result<Improvement> {
    let raw: String = row.get(4)?;
    let files_modified: Vec<String> = serde_json::from_str(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(Improvement {
        id: row.get(0)?,
        iteration_id: row.get(1)?,
        finding_id: row.get(2)?,
        description: row.get(3)?,
        files_modified,
        tests_passing: row.get(5)?,
    })
}

/// Open iteration `number` of `run_id` in status in_progress.
pub fn insert_iteration(
    conn: &Connection,
    run_id: &str,
    number: u32,
    at: DateTime<Utc>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO refine_iterations (run_id, iteration_number, status, started_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![run_id, number, IterationStatus::InProgress, at],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn close_iteration(conn: &Connection, id: i64, close: &IterationClose) -> Result<()> {
    conn.execute(
        "UPDATE refine_iterations SET status = ?2, findings_count = ?3, improvements_count = ?4,
             producer_failures = ?5, validation_passed = ?6, summary = ?7, completed_at = ?8
         WHERE id = ?1",
        params![
            id,
            IterationStatus::Completed,
            close.findings_count,
            close.improvements_count,
            close.producer_failures,
            close.validation_passed,
            close.summary,
            close.completed_at
        ],
    )?;
    Ok(())
}

/// Delete iterations of `run_id` that never closed; findings and improvements
/// go with them via cascade.
pub fn discard_unclosed_iterations(conn: &Connection, run_id: &str) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM refine_iterations WHERE run_id = ?1 AND status <> ?2",
        params![run_id, IterationStatus::Completed],
    )?;
    Ok(removed)
}

/// Iterations of `run_id` (or of every run), oldest first.
pub fn list_iterations(conn: &Connection, run_id: Option<&str>) -> Result<Vec<RefineIteration>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ITERATION_COLUMNS} FROM refine_iterations
         WHERE ?1 IS NULL OR run_id = ?1
         ORDER BY id"
    ))?;
    let rows = stmt.query_map([run_id], iteration_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_iteration(conn: &Connection, id: i64) -> Result<Option<RefineIteration>> {
    let iteration = conn
        .query_row(
            &format!("SELECT {ITERATION_COLUMNS} FROM refine_iterations WHERE id = ?1"),
            [id],
            iteration_from_row,
        )
        .optional()?;
    Ok(iteration)
}

pub fn insert_finding(
    conn: &Connection,
    iteration_id: i64,
    draft: &FindingDraft,
    rank: u32,
) -> Result<Finding> {
    conn.execute(
        "INSERT INTO refine_findings (iteration_id, focus_area, severity, category, file_path,
             line_number, description, suggestion, priority_rank)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            iteration_id,
            draft.focus_area,
            draft.severity,
            draft.category,
            draft.file_path,
            draft.line_number,
            draft.description,
            draft.suggestion,
            rank
        ],
    )?;
    Ok(Finding {
        id: conn.last_insert_rowid(),
        iteration_id,
        focus_area: draft.focus_area,
        severity: draft.severity,
        category: draft.category.clone(),
        file_path: draft.file_path.clone(),
        line_number: draft.line_number,
        description: draft.description.clone(),
        suggestion: draft.suggestion.clone(),
        addressed: false,
        rank,
    })
}

/// Findings of one iteration in aggregation order.
pub fn findings_for_iteration(conn: &Connection, iteration_id: i64) -> Result<Vec<Finding>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {FINDING_COLUMNS} FROM refine_findings
         WHERE iteration_id = ?1 ORDER BY priority_rank, id"
    ))?;
    let rows = stmt.query_map([iteration_id], finding_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn mark_finding_addressed(conn: &Connection, finding_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE refine_findings SET addressed = 1 WHERE id = ?1",
        [finding_id],
    )?;
    Ok(())
}

pub fn insert_improvement(
    conn: &Connection,
    iteration_id: i64,
    draft: &ImprovementDraft,
) -> Result<Improvement> {
    let files = serde_json::to_string(&draft.files_modified).map_err(|err| {
        rusqlite::Error::ToSqlConversionFailure(Box::new(err))
    })?;
    conn.execute(
        "INSERT INTO refine_improvements (iteration_id, finding_id, description, files_modified,
             tests_passing)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            iteration_id,
            draft.finding_id,
            draft.description,
            files,
            draft.tests_passing
        ],
    )?;
    Ok(Improvement {
        id: conn.last_insert_rowid(),
        iteration_id,
        finding_id: draft.finding_id,
        description: draft.description.clone(),
        files_modified: draft.files_modified.clone(),
        tests_passing: draft.tests_passing,
    })
}

pub fn improvements_for_iteration(
    conn: &Connection,
    iteration_id: i64,
) -> Result<Vec<Improvement>> {
    let mut stmt = conn.prepare(
        "SELECT id, iteration_id, finding_id, description, files_modified, tests_passing
         FROM refine_improvements WHERE iteration_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([iteration_id], improvement_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Finding counts of `run_id` keyed by severity label.
pub fn findings_by_severity(conn: &Connection, run_id: &str) -> Result<BTreeMap<String, u32>> {
    let mut stmt = conn.prepare(
        "SELECT f.severity, COUNT(*) FROM refine_findings f
         JOIN refine_iterations i ON i.id = f.iteration_id
         WHERE i.run_id = ?1
         GROUP BY f.severity",
    )?;
    let rows = stmt.query_map([run_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    Ok(rows.collect::<rusqlite::Result<BTreeMap<_, _>>>()?)
}

/// (total, addressed) findings of `run_id`.
pub fn finding_totals(conn: &Connection, run_id: &str) -> Result<(u32, u32)> {
    let totals = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(f.addressed), 0) FROM refine_findings f
         JOIN refine_iterations i ON i.id = f.iteration_id
         WHERE i.run_id = ?1",
        [run_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(totals)
}

/// (total, with passing tests) improvements of `run_id`.
pub fn improvement_totals(conn: &Connection, run_id: &str) -> Result<(u32, u32)> {
    let totals = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(p.tests_passing), 0) FROM refine_improvements p
         JOIN refine_iterations i ON i.id = p.iteration_id
         WHERE i.run_id = ?1",
        [run_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(totals)
}
