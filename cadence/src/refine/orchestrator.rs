//! The refine run: exactly N iterations over the completed project.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::aggregate::aggregate;
use super::pool::{Job, run_bounded};
use super::producer::{
    RefineProducer, RefineRequest, ReviewProducer, ReviewRequest, parse_refine_output,
    parse_review_output,
};
use super::ProducerFailure;
use super::validator::{ValidationRequest, Validator};
use crate::backup::SnapshotKind;
use crate::config::RefineConfig;
use crate::core::complexity::{Complexity, RefinePlan};
use crate::core::types::{
    Finding, FindingDraft, FocusArea, Improvement, ImprovementDraft, RefineIteration, Technology,
};
use crate::error::{Invariant, Result, SchedulerError};
use crate::facade::Facade;
use crate::machine;
use crate::paths::CadencePaths;
use crate::process::CancelToken;
use crate::store::refine_rows::{self, IterationClose};
use crate::store::{records, state};

pub const PHASE_IN_PROGRESS: &str = "in_progress";
pub const PHASE_COMPLETED: &str = "completed";

/// The producers of one run. Shared with worker threads, hence `Arc`.
#[derive(Clone)]
pub struct RefineProducers {
    pub reviewer: Arc<dyn ReviewProducer>,
    pub refiner: Arc<dyn RefineProducer>,
}

#[derive(Debug, Clone)]
pub struct RefineSettings {
    pub refine: RefineConfig,
    /// Validation runs in `paths.root`; logs go under `paths.refine_dir`.
    pub paths: CadencePaths,
}

/// What one closed iteration produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IterationReport {
    pub iteration_number: u32,
    pub max_iterations: u32,
    pub findings: Vec<Finding>,
    pub improvements: Vec<Improvement>,
    pub producer_failures: u32,
    pub validation_passed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefineRunOutcome {
    pub run_id: String,
    pub complexity: Complexity,
    pub max_iterations: u32,
    /// True when an interrupted run was picked up again.
    pub resumed: bool,
    /// Iterations executed by this call.
    pub iterations_run: u32,
    /// Every iteration recorded for the run, oldest first.
    pub iterations: Vec<RefineIteration>,
}

struct RunContext {
    run_id: String,
    plan: RefinePlan,
    requirements: String,
    technologies: Vec<Technology>,
    resumed: bool,
    completed: u32,
}

/// Run (or resume) the refine phase.
///
/// Requires every milestone to be finished. Producer failures and validation
/// results never end the run early; storage failures abort it, and the next
/// call resumes with the same run id.
#[instrument(skip_all)]
pub fn run_refine<F: FnMut(&IterationReport)>(
    facade: &Facade,
    producers: &RefineProducers,
    validator: &dyn Validator,
    settings: &RefineSettings,
    mut on_iteration: F,
) -> Result<RefineRunOutcome> {
    let context = begin_run(facade, &settings.refine)?;
    let max_iterations = context.plan.max_iterations;
    info!(
        run_id = %context.run_id,
        complexity = %context.plan.complexity,
        max_iterations,
        resumed = context.resumed,
        "refine run started"
    );

    let mut iterations_run = 0u32;
    for number in (context.completed + 1)..=max_iterations {
        let report = run_iteration(facade, producers, validator, settings, &context, number)?;
        iterations_run += 1;
        on_iteration(&report);
    }

    let iterations = facade.with_store(|store| {
        store.transaction(|tx| {
            state::set_state(tx, state::REFINE_PHASE_STATUS, Some(PHASE_COMPLETED))?;
            state::set_meta(tx, state::META_REFINE_COMPLETED_AT, &Utc::now().to_rfc3339())?;
            refine_rows::list_iterations(tx, Some(&context.run_id))
        })
    })?;
    info!(run_id = %context.run_id, iterations = iterations.len(), "refine run completed");

    Ok(RefineRunOutcome {
        run_id: context.run_id,
        complexity: context.plan.complexity,
        max_iterations,
        resumed: context.resumed,
        iterations_run,
        iterations,
    })
}

/// Start a new run, or pick up the interrupted one and discard its unclosed
/// iteration.
fn begin_run(facade: &Facade, config: &RefineConfig) -> Result<RunContext> {
    let (complete, phase, run_id, planned) = facade.with_store(|store| {
        store.read(|conn| {
            Ok((
                records::count_milestones(conn)? > 0
                    && machine::project_complete(conn)?
                    && machine::current_milestone_id(conn)?.is_none(),
                state::get_state(conn, state::REFINE_PHASE_STATUS)?,
                state::get_state(conn, state::REFINE_RUN_ID)?,
                state::get_meta(conn, state::META_COMPLEXITY)?,
            ))
        })
    })?;
    if !complete {
        return Err(SchedulerError::violation(
            Invariant::IllegalTransition,
            "refine requires every milestone to be complete",
        ));
    }
    let planned = planned.as_deref().map(Complexity::parse_or_default);
    let plan = config.plan(planned);

    if let (Some(PHASE_IN_PROGRESS), Some(run_id)) = (phase.as_deref(), run_id) {
        return facade.with_store(|store| {
            store.transaction(|tx| {
                let discarded = refine_rows::discard_unclosed_iterations(tx, &run_id)?;
                let completed = refine_rows::list_iterations(tx, Some(&run_id))?.len() as u32;
                let max_iterations = state::get_state_u32(tx, state::REFINE_MAX_ITERATIONS)?;
                state::set_state_u32(tx, state::REFINE_CURRENT_ITERATION, completed)?;
                if discarded > 0 {
                    warn!(run_id = %run_id, discarded, "discarded unclosed refine iteration");
                }
                Ok(RunContext {
                    plan: RefinePlan {
                        max_iterations: if max_iterations == 0 {
                            plan.max_iterations
                        } else {
                            max_iterations
                        },
                        ..plan
                    },
                    requirements: state::get_meta(tx, state::META_REQUIREMENTS)?
                        .unwrap_or_default(),
                    technologies: state::list_technologies(tx)?,
                    run_id,
                    resumed: true,
                    completed,
                })
            })
        });
    }

    facade.backup(SnapshotKind::Auto, "refine")?;
    let run_id = Uuid::new_v4().to_string();
    facade.with_store(|store| {
        store.transaction(|tx| {
            state::set_state(tx, state::REFINE_RUN_ID, Some(&run_id))?;
            state::set_state(tx, state::REFINE_PHASE_STATUS, Some(PHASE_IN_PROGRESS))?;
            state::set_state_u32(tx, state::REFINE_CURRENT_ITERATION, 0)?;
            state::set_state_u32(tx, state::REFINE_MAX_ITERATIONS, plan.max_iterations)?;
            state::set_meta(tx, state::META_REFINE_STARTED_AT, &Utc::now().to_rfc3339())?;
            Ok(RunContext {
                requirements: state::get_meta(tx, state::META_REQUIREMENTS)?.unwrap_or_default(),
                technologies: state::list_technologies(tx)?,
                run_id: run_id.clone(),
                plan: plan.clone(),
                resumed: false,
                completed: 0,
            })
        })
    })
}

#[instrument(skip_all, fields(iteration = number))]
fn run_iteration(
    facade: &Facade,
    producers: &RefineProducers,
    validator: &dyn Validator,
    settings: &RefineSettings,
    context: &RunContext,
    number: u32,
) -> Result<IterationReport> {
    let max_iterations = context.plan.max_iterations;
    let (iteration_id, previous_validation_failed) = facade.with_store(|store| {
        store.transaction(|tx| {
            let previous = refine_rows::list_iterations(tx, Some(&context.run_id))?;
            let failed = previous
                .last()
                .is_some_and(|it| it.validation_passed == Some(false));
            let id = refine_rows::insert_iteration(tx, &context.run_id, number, Utc::now())?;
            Ok((id, failed))
        })
    })?;

    let mut producer_failures = 0u32;

    // Review fan-out.
    let (drafts, review_failures) = review(
        producers,
        &settings.refine,
        context,
        number,
        previous_validation_failed,
    );
    producer_failures += review_failures;
    let ranked = aggregate(drafts, previous_validation_failed);
    let findings = facade.with_store(|store| {
        store.transaction(|tx| {
            ranked
                .iter()
                .enumerate()
                .map(|(index, draft)| {
                    refine_rows::insert_finding(tx, iteration_id, draft, index as u32 + 1)
                })
                .collect::<Result<Vec<_>>>()
        })
    })?;

    // Refine: single producer, alone.
    let improvement_drafts = match refine(producers, &settings.refine, context, number, &findings) {
        Ok(drafts) => drafts,
        Err(failure) => {
            warn!(error = %failure, "refine producer contributed nothing");
            producer_failures += 1;
            Vec::new()
        }
    };
    let improvements = facade.with_store(|store| {
        store.transaction(|tx| {
            let mut improvements = Vec::with_capacity(improvement_drafts.len());
            for draft in &improvement_drafts {
                improvements.push(refine_rows::insert_improvement(tx, iteration_id, draft)?);
                if let Some(finding_id) = draft.finding_id {
                    refine_rows::mark_finding_addressed(tx, finding_id)?;
                }
            }
            Ok(improvements)
        })
    })?;

    // Validate: informational only.
    let request = ValidationRequest {
        workdir: settings.paths.root.clone(),
        log_path: settings.paths.validation_log(&context.run_id, number),
        timeout: Duration::from_secs(settings.refine.validation.timeout_secs),
        output_limit_bytes: settings.refine.validation.output_limit_bytes,
    };
    let validation_passed = match validator.validate(&request) {
        Ok(passed) => Some(passed),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "validation could not run");
            None
        }
    };

    // Close and advance.
    let summary = format!(
        "{} findings, {} improvements, {} producer failures, validation {}",
        findings.len(),
        improvements.len(),
        producer_failures,
        match validation_passed {
            Some(true) => "passed",
            Some(false) => "failed",
            None => "not run",
        }
    );
    let findings = facade.with_store(|store| {
        store.transaction(|tx| {
            refine_rows::close_iteration(
                tx,
                iteration_id,
                &IterationClose {
                    findings_count: findings.len() as u32,
                    improvements_count: improvements.len() as u32,
                    producer_failures,
                    validation_passed,
                    summary: summary.clone(),
                    completed_at: Utc::now(),
                },
            )?;
            state::set_state_u32(tx, state::REFINE_CURRENT_ITERATION, number)?;
            refine_rows::findings_for_iteration(tx, iteration_id)
        })
    })?;
    info!(iteration = number, max_iterations, summary = %summary, "refine iteration closed");

    Ok(IterationReport {
        iteration_number: number,
        max_iterations,
        findings,
        improvements,
        producer_failures,
        validation_passed,
    })
}

/// Fan the review producers out and collect their findings. Returns the
/// union of valid findings and the number of failed producers.
fn review(
    producers: &RefineProducers,
    config: &RefineConfig,
    context: &RunContext,
    number: u32,
    previous_validation_failed: bool,
) -> (Vec<FindingDraft>, u32) {
    let areas: Vec<FocusArea> = context.plan.focus_areas.clone();
    let jobs: Vec<Job<serde_json::Value>> = areas
        .iter()
        .map(|&area| {
            let reviewer = Arc::clone(&producers.reviewer);
            let request = ReviewRequest::new(
                area,
                number,
                context.plan.max_iterations,
                &context.requirements,
                &context.technologies,
                previous_validation_failed,
            );
            Box::new(move |cancel: &CancelToken| reviewer.review(&request?, cancel))
                as Job<serde_json::Value>
        })
        .collect();

    let results = run_bounded(jobs, config.max_workers, config.producer_timeout());
    let mut drafts = Vec::new();
    let mut failures = 0u32;
    for (area, result) in areas.into_iter().zip(results) {
        match result.and_then(|value| parse_review_output(area, &value)) {
            Ok(found) => drafts.extend(found),
            Err(failure) => {
                warn!(focus_area = %area, error = %failure, "review producer contributed nothing");
                failures += 1;
            }
        }
    }
    (drafts, failures)
}

fn refine(
    producers: &RefineProducers,
    config: &RefineConfig,
    context: &RunContext,
    number: u32,
    findings: &[Finding],
) -> Result<Vec<ImprovementDraft>, ProducerFailure> {
    let known: HashSet<i64> = findings.iter().map(|f| f.id).collect();
    let request = RefineRequest::new(
        number,
        context.plan.max_iterations,
        &context.requirements,
        &context.technologies,
        findings.to_vec(),
    );
    let refiner = Arc::clone(&producers.refiner);
    let job: Job<serde_json::Value> =
        Box::new(move |cancel: &CancelToken| refiner.refine(&request?, cancel));
    let result = run_bounded(vec![job], 1, config.producer_timeout())
        .pop()
        .unwrap_or_else(|| Err(ProducerFailure::Errored("no result".to_string())));
    parse_refine_output(&result?, &known)
}
