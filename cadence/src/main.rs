//! `cadence` command-line interface.
//!
//! Thin wrapper over [`cadence::facade::Facade`]: every subcommand opens the
//! project under `--root`, runs one facade operation and prints its result as
//! JSON on stdout. Scheduler errors are printed as a JSON payload on stderr
//! and mapped to the codes in [`cadence::exit_codes`].

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

use cadence::backup::SnapshotKind;
use cadence::config::{CadenceConfig, load_config, require_command};
use cadence::drive::{CommandWorkExecutor, drive};
use cadence::error::SchedulerError;
use cadence::exit_codes;
use cadence::facade::{Facade, NextTask};
use cadence::logging;
use cadence::paths::{CadencePaths, InitOptions, ensure_layout, init_project};
use cadence::plan::PlanInput;
use cadence::refine::producer::CommandProducer;
use cadence::refine::report::{refine_status, render_report};
use cadence::refine::{CommandValidator, RefineProducers, RefineSettings, run_refine};

#[derive(Parser)]
#[command(
    name = "cadence",
    version,
    about = "Persistent milestone/task scheduler with a fixed-iteration refine loop"
)]
struct Cli {
    /// Project root containing `.cadence/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.cadence/` with a default config and an empty state database.
    Init {
        /// Rewrite the config of an existing `.cadence/`.
        #[arg(short, long)]
        force: bool,
    },
    /// Import a plan (JSON) of milestones, tasks and dependencies.
    Plan { file: PathBuf },
    /// Print overall progress.
    Status,
    /// Print the next eligible task, or check a specific one.
    Next { task_id: Option<String> },
    /// Mark a task in_progress.
    Start { task_id: String },
    /// Mark a task completed and advance the milestone pointer.
    Complete { task_id: String },
    /// Return an in_progress task to pending.
    Release { task_id: String },
    /// Reset every in_progress task to pending after a performer crashed.
    Recover,
    /// Report which dependencies of a task are still unmet.
    ValidateDeps { task_id: String },
    /// Mark a completed milestone as validated.
    ValidateMilestone { milestone_id: String },
    /// Print the progress of one milestone.
    Milestone { milestone_id: String },
    /// Move the current milestone pointer to a pending milestone.
    SetCurrent { milestone_id: String },
    /// Take a manual snapshot of the state database.
    Backup {
        #[arg(long, default_value = "manual")]
        tag: String,
    },
    /// List snapshots, newest first.
    Backups,
    /// Check that a snapshot is restorable.
    VerifyBackup { name: String },
    /// Replace the live state with a snapshot.
    Restore {
        #[arg(required_unless_present = "latest", conflicts_with = "latest")]
        name: Option<String>,
        /// Restore the newest non-safety snapshot.
        #[arg(long)]
        latest: bool,
    },
    /// Delete auto and safety snapshots outside the retention policy.
    Cleanup,
    /// Write the full state as JSON files.
    Export {
        /// Defaults to `.cadence/export`.
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Run the configured work command on eligible tasks. Tasks left
    /// in_progress by an earlier run are reset first.
    Drive {
        #[arg(long, default_value_t = 100)]
        max_steps: u32,
    },
    /// Run (or resume) the refine phase with the configured producers.
    Refine,
    /// Print the state of the latest refine run.
    RefineStatus,
    /// Print a plain-text report of the latest refine run.
    RefineReport,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let code = match err.downcast_ref::<SchedulerError>() {
                Some(scheduler_err) => {
                    let payload = serde_json::to_string_pretty(&scheduler_err.payload())
                        .unwrap_or_else(|_| scheduler_err.to_string());
                    eprintln!("{payload}");
                    exit_code_for(scheduler_err)
                }
                None => {
                    eprintln!("{:#}", err);
                    exit_codes::INVALID
                }
            };
            std::process::exit(code);
        }
    }
}

fn exit_code_for(err: &SchedulerError) -> i32 {
    if err.is_fatal() {
        exit_codes::STORAGE
    } else {
        exit_codes::REJECTED
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = CadencePaths::new(&cli.root);

    if let Command::Init { force } = cli.command {
        let paths = init_project(&cli.root, &InitOptions { force })?;
        print_json(&json!({
            "root": paths.root,
            "db_path": paths.db_path,
            "config_path": paths.config_path,
        }))?;
        return Ok(exit_codes::OK);
    }

    let config = open_config(&paths)?;
    let facade = Facade::open(&paths, config.run_mode)?;

    match cli.command {
        Command::Init { .. } => unreachable!("handled above"),
        Command::Plan { file } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("read plan {}", file.display()))?;
            let input: PlanInput = serde_json::from_str(&raw)
                .with_context(|| format!("parse plan {}", file.display()))?;
            print_json(&facade.plan(&input)?)?;
        }
        Command::Status => print_json(&facade.get_current_status()?)?,
        Command::Next { task_id } => {
            let next = facade.get_next_task(task_id.as_deref())?;
            print_json(&next)?;
            return Ok(match next {
                NextTask::Eligible { .. } => exit_codes::OK,
                NextTask::Blocked { .. } => exit_codes::BLOCKED,
                NextTask::ProjectComplete => exit_codes::COMPLETE,
            });
        }
        Command::Start { task_id } => print_json(&facade.start_task(&task_id)?)?,
        Command::Complete { task_id } => print_json(&facade.complete_task(&task_id)?)?,
        Command::Release { task_id } => print_json(&facade.release_task(&task_id)?)?,
        Command::Recover => {
            let reset = facade.reset_interrupted()?;
            print_json(&json!({ "reset_tasks": reset }))?;
        }
        Command::ValidateDeps { task_id } => {
            print_json(&facade.validate_dependencies(&task_id)?)?
        }
        Command::ValidateMilestone { milestone_id } => {
            print_json(&facade.validate_milestone(&milestone_id)?)?
        }
        Command::Milestone { milestone_id } => {
            print_json(&facade.get_milestone_status(&milestone_id)?)?
        }
        Command::SetCurrent { milestone_id } => {
            let reset = facade.set_current_milestone(&milestone_id)?;
            print_json(&json!({ "current_milestone_id": milestone_id, "reset_tasks": reset }))?;
        }
        Command::Backup { tag } => print_json(&facade.backup(SnapshotKind::Manual, &tag)?)?,
        Command::Backups => print_json(&facade.list_backups()?)?,
        Command::VerifyBackup { name } => {
            let report = facade.verify_backup(&name)?;
            print_json(&report)?;
            if !report.is_restorable() {
                return Ok(exit_codes::REJECTED);
            }
        }
        Command::Restore { name, .. } => {
            let outcome = match name {
                Some(name) => facade.restore(&name)?,
                None => facade.restore_latest()?,
            };
            print_json(&outcome)?;
        }
        Command::Cleanup => {
            let removed = facade.cleanup_backups(&config.backup.retention())?;
            print_json(&removed)?;
        }
        Command::Export { dir } => {
            let dir = dir.unwrap_or_else(|| paths.export_dir.clone());
            print_json(&facade.export_json(&dir)?)?;
        }
        Command::Drive { max_steps } => {
            let argv = require_command(&config.agents.work_command, "agents.work_command")?;
            let executor = CommandWorkExecutor {
                argv: argv.to_vec(),
                workdir: paths.root.clone(),
                timeout: config.agents.work_timeout(),
                output_limit_bytes: config.agents.output_limit_bytes,
                log_dir: Some(paths.work_dir.clone()),
            };
            let reset = facade.reset_interrupted()?;
            if !reset.is_empty() {
                eprintln!("reset interrupted tasks to pending: {}", reset.join(", "));
            }
            let outcome = drive(&facade, &executor, max_steps, |step| {
                eprintln!("completed {}: {}", step.item.task_id, step.summary);
            })?;
            print_json(&outcome)?;
        }
        Command::Refine => {
            let producers = command_producers(&config, &paths.root)?;
            let validator = CommandValidator {
                argv: config.refine.validation.command.clone(),
            };
            let settings = RefineSettings {
                refine: config.refine.clone(),
                paths: paths.clone(),
            };
            let outcome = run_refine(&facade, &producers, &validator, &settings, |report| {
                eprintln!(
                    "iteration {}/{}: {} findings, {} improvements, validation {}",
                    report.iteration_number,
                    report.max_iterations,
                    report.findings.len(),
                    report.improvements.len(),
                    match report.validation_passed {
                        Some(true) => "passed",
                        Some(false) => "failed",
                        None => "not run",
                    }
                );
            })?;
            print_json(&outcome)?;
        }
        Command::RefineStatus => print_json(&refine_status(&facade)?)?,
        Command::RefineReport => print!("{}", render_report(&facade)?),
    }
    Ok(exit_codes::OK)
}

/// Load the project config; the state database must already exist.
fn open_config(paths: &CadencePaths) -> Result<CadenceConfig> {
    if !paths.db_path.exists() {
        return Err(anyhow!(
            "no state database at {} (run `cadence init`)",
            paths.db_path.display()
        ));
    }
    ensure_layout(paths)?;
    load_config(&paths.config_path)
}

fn command_producers(config: &CadenceConfig, workdir: &Path) -> Result<RefineProducers> {
    let producer = |argv: &[String]| {
        Arc::new(CommandProducer {
            argv: argv.to_vec(),
            workdir: workdir.to_path_buf(),
            timeout: config.refine.producer_timeout(),
            output_limit_bytes: config.agents.output_limit_bytes,
        })
    };
    let reviewer = require_command(&config.agents.review_command, "agents.review_command")?;
    let refiner = require_command(&config.agents.refine_command, "agents.refine_command")?;
    Ok(RefineProducers {
        reviewer: producer(reviewer),
        refiner: producer(refiner),
    })
}

/// Print `value` as pretty JSON on stdout.
fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}
