//! Scheduler configuration stored under `.cadence/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::backup::RetentionPolicy;
use crate::core::complexity::{Complexity, RefinePlan};

/// Scheduler configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CadenceConfig {
    pub run_mode: RunMode,
    pub agents: AgentsConfig,
    pub refine: RefineConfig,
    pub backup: BackupConfig,
}

/// Behavior switches for the execution facade.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunMode {
    /// Work is performed without a human confirming each task; recorded on
    /// every execution log row.
    pub autopilot: bool,
    /// Completed milestones are validated immediately.
    pub auto_validate: bool,
    /// Take an `auto` snapshot whenever a milestone completes.
    pub snapshot_on_milestone: bool,
    /// `drive` stops when a milestone completes and awaits validation.
    pub pause_for_validation: bool,
}

/// External commands behind `cadence drive` and `cadence refine`.
///
/// The work command receives a `WorkItem` as JSON on stdin; producers receive
/// their rendered prompt. Each prints a JSON document on stdout. Empty
/// commands are only an error for the subcommand that needs them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentsConfig {
    pub work_command: Vec<String>,
    pub review_command: Vec<String>,
    pub refine_command: Vec<String>,
    /// Wall-clock budget for one work item, in seconds.
    pub work_timeout_secs: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RefineConfig {
    /// Overrides the tier recorded at planning time.
    pub complexity: Option<Complexity>,
    /// Overrides the tier's iteration count; never below 5.
    pub max_iterations: Option<u32>,
    /// Per-producer wall-clock budget in seconds.
    pub producer_timeout_secs: u64,
    /// Upper bound on concurrently running review producers.
    pub max_workers: usize,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Command run after each refine step (e.g. `["cargo","test"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate validation logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BackupConfig {
    pub keep_days: u32,
    pub keep_minimum: usize,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            complexity: None,
            max_iterations: None,
            producer_timeout_secs: 10 * 60,
            max_workers: 6,
            validation: ValidationConfig::default(),
        }
    }
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            work_command: Vec::new(),
            review_command: Vec::new(),
            refine_command: Vec::new(),
            work_timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            command: vec!["cargo".to_string(), "test".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            keep_days: 30,
            keep_minimum: 5,
        }
    }
}

impl CadenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agents.work_timeout_secs == 0 {
            return Err(anyhow!("agents.work_timeout_secs must be > 0"));
        }
        if self.agents.output_limit_bytes == 0 {
            return Err(anyhow!("agents.output_limit_bytes must be > 0"));
        }
        if self.refine.producer_timeout_secs == 0 {
            return Err(anyhow!("refine.producer_timeout_secs must be > 0"));
        }
        if self.refine.max_workers == 0 {
            return Err(anyhow!("refine.max_workers must be > 0"));
        }
        let validation = &self.refine.validation;
        if validation.command.is_empty() || validation.command[0].trim().is_empty() {
            return Err(anyhow!("refine.validation.command must be a non-empty array"));
        }
        if validation.timeout_secs == 0 {
            return Err(anyhow!("refine.validation.timeout_secs must be > 0"));
        }
        if validation.output_limit_bytes == 0 {
            return Err(anyhow!("refine.validation.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

impl AgentsConfig {
    pub fn work_timeout(&self) -> Duration {
        Duration::from_secs(self.work_timeout_secs)
    }
}

/// Require a configured command, naming the config key when it is missing.
pub fn require_command<'a>(command: &'a [String], key: &str) -> Result<&'a [String]> {
    match command.first() {
        Some(program) if !program.trim().is_empty() => Ok(command),
        _ => Err(anyhow!("{key} is not configured in .cadence/config.toml")),
    }
}

impl RefineConfig {
    /// Resolve the refine plan: configured tier, else the planned tier, else
    /// MEDIUM; then the iteration override.
    pub fn plan(&self, planned: Option<Complexity>) -> RefinePlan {
        self.complexity
            .or(planned)
            .unwrap_or_default()
            .refine_plan()
            .with_max_iterations(self.max_iterations)
    }

    pub fn producer_timeout(&self) -> Duration {
        Duration::from_secs(self.producer_timeout_secs)
    }
}

impl BackupConfig {
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            keep_days: self.keep_days,
            keep_minimum: self.keep_minimum,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CadenceConfig::default()`.
pub fn load_config(path: &Path) -> Result<CadenceConfig> {
    if !path.exists() {
        let cfg = CadenceConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CadenceConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CadenceConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, CadenceConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = CadenceConfig {
            run_mode: RunMode {
                autopilot: true,
                snapshot_on_milestone: true,
                ..RunMode::default()
            },
            refine: RefineConfig {
                complexity: Some(Complexity::Large),
                max_iterations: Some(7),
                ..RefineConfig::default()
            },
            ..CadenceConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[refine]\ncomplexity = \"SMALL\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.refine.complexity, Some(Complexity::Small));
        assert_eq!(cfg.backup, BackupConfig::default());
        assert_eq!(cfg.refine.plan(None).max_iterations, 5);
    }

    #[test]
    fn empty_validation_command_is_rejected() {
        let mut cfg = CadenceConfig::default();
        cfg.refine.validation.command.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("validation.command"));
    }

    #[test]
    fn missing_agent_command_names_the_key() {
        let cfg = CadenceConfig::default();
        let err = require_command(&cfg.agents.work_command, "agents.work_command").unwrap_err();
        assert!(err.to_string().contains("agents.work_command"));
        let command = vec!["sh".to_string(), "-c".to_string(), "true".to_string()];
        assert_eq!(require_command(&command, "x").expect("configured").len(), 3);
    }

    #[test]
    fn plan_prefers_configured_tier_over_planned() {
        let cfg = RefineConfig {
            complexity: Some(Complexity::Enterprise),
            ..RefineConfig::default()
        };
        assert_eq!(cfg.plan(Some(Complexity::Micro)).reviewer_count(), 6);
        assert_eq!(RefineConfig::default().plan(Some(Complexity::Micro)).reviewer_count(), 2);
        assert_eq!(RefineConfig::default().plan(None).max_iterations, 6);
    }
}
