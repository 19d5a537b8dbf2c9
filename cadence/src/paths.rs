//! Layout of `.cadence/` and project initialization.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::config::{CadenceConfig, write_config};
use crate::store::Store;

/// All canonical paths within `.cadence/` for a project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CadencePaths {
    pub root: PathBuf,
    pub cadence_dir: PathBuf,
    pub db_path: PathBuf,
    pub backups_dir: PathBuf,
    pub config_path: PathBuf,
    pub export_dir: PathBuf,
    /// Per-iteration validation and producer logs of refine runs.
    pub refine_dir: PathBuf,
    /// Logs of the work command run by `cadence drive`.
    pub work_dir: PathBuf,
    pub gitignore_path: PathBuf,
}

impl CadencePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let cadence_dir = root.join(".cadence");
        Self {
            root: root.clone(),
            cadence_dir: cadence_dir.clone(),
            db_path: cadence_dir.join("state.db"),
            backups_dir: cadence_dir.join("backups"),
            config_path: cadence_dir.join("config.toml"),
            export_dir: cadence_dir.join("export"),
            refine_dir: cadence_dir.join("refine"),
            work_dir: cadence_dir.join("work"),
            gitignore_path: cadence_dir.join(".gitignore"),
        }
    }

    pub fn iteration_dir(&self, run_id: &str, iteration: u32) -> PathBuf {
        self.refine_dir.join(run_id).join(format!("iter-{iteration:03}"))
    }

    /// Validation log location for one refine iteration.
    pub fn validation_log(&self, run_id: &str, iteration: u32) -> PathBuf {
        self.iteration_dir(run_id, iteration).join("validation.log")
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, rewrite the config file of an existing `.cadence/`. The state
    /// database is never replaced.
    pub force: bool,
}

/// Create `.cadence/` scaffolding and an empty state database in `root`.
///
/// Fails if `.cadence/` already exists unless `options.force` is set.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<CadencePaths> {
    let paths = CadencePaths::new(root);
    if paths.cadence_dir.exists() && !options.force {
        return Err(anyhow!(
            "cadence init: .cadence already exists (use --force to overwrite)"
        ));
    }
    if paths.cadence_dir.exists() && !paths.cadence_dir.is_dir() {
        return Err(anyhow!("cadence init: .cadence exists but is not a directory"));
    }

    create_dir(&paths.cadence_dir)?;
    create_dir(&paths.backups_dir)?;
    create_dir(&paths.export_dir)?;
    create_dir(&paths.refine_dir)?;
    create_dir(&paths.work_dir)?;

    fs::write(&paths.gitignore_path, CADENCE_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &CadenceConfig::default())?;
    Store::open(&paths.db_path)
        .with_context(|| format!("create state database {}", paths.db_path.display()))?;

    Ok(paths)
}

/// Ensure the directories a facade writes into exist.
pub fn ensure_layout(paths: &CadencePaths) -> Result<()> {
    create_dir(&paths.cadence_dir)?;
    create_dir(&paths.backups_dir)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const CADENCE_GITIGNORE: &str = "backups/\nexport/\nrefine/\nwork/\nstate.db-wal\nstate.db-shm\n";
