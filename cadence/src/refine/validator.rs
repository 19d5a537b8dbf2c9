//! Validation step of a refine iteration (e.g. the project's test command).
//!
//! The result is informational: it steers finding priority in the next
//! iteration and is recorded, but never stops the loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::process::{command_from_argv, run_command_with_timeout, write_log};

#[derive(Debug, Clone)]
pub struct ValidationRequest {
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// `Ok(passed)` when validation ran; `Err` when it could not run at all.
pub trait Validator: Send + Sync {
    fn validate(&self, request: &ValidationRequest) -> Result<bool>;
}

/// Runs a configured command; exit status 0 passes, a timeout fails.
pub struct CommandValidator {
    pub argv: Vec<String>,
}

impl Validator for CommandValidator {
    fn validate(&self, request: &ValidationRequest) -> Result<bool> {
        let cmd = command_from_argv(&self.argv, &request.workdir)?;
        let output =
            run_command_with_timeout(cmd, None, request.timeout, request.output_limit_bytes)
                .with_context(|| format!("run validation command {:?}", self.argv))?;
        write_log(&request.log_path, &output.render_log(request.output_limit_bytes))?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "validation timed out");
            return Ok(false);
        }
        let passed = output.status.success();
        info!(passed, exit_code = ?output.status.code(), "validation finished");
        Ok(passed)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn request(temp: &tempfile::TempDir) -> ValidationRequest {
        ValidationRequest {
            workdir: temp.path().to_path_buf(),
            log_path: temp.path().join("iter-001/validation.log"),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1000,
        }
    }

    fn sh(script: &str) -> CommandValidator {
        CommandValidator {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        }
    }

    #[test]
    fn exit_status_decides_and_log_is_written() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(sh("echo ok").validate(&request(&temp)).expect("run"));
        let log = fs::read_to_string(temp.path().join("iter-001/validation.log")).expect("log");
        assert!(log.contains("ok"));

        assert!(!sh("echo broken >&2; exit 3").validate(&request(&temp)).expect("run"));
    }

    #[test]
    fn missing_program_cannot_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let validator = CommandValidator {
            argv: vec!["cadence-no-such-program".to_string()],
        };
        assert!(validator.validate(&request(&temp)).is_err());
    }
}
