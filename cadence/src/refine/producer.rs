//! Review and refine producers: requests, output parsing and prompts.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, anyhow};
use jsonschema::{Validator, validator_for};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::ProducerFailure;
use crate::core::types::{Finding, FindingDraft, FocusArea, ImprovementDraft, Severity, Technology};
use crate::process::{CancelToken, command_from_argv, run_command_cancellable};

const REVIEW_SCHEMA: &str = include_str!("../../schemas/review_output.schema.json");
const REFINE_SCHEMA: &str = include_str!("../../schemas/refine_output.schema.json");
const REVIEW_TEMPLATE: &str = include_str!("prompts/review.md");
const REFINE_TEMPLATE: &str = include_str!("prompts/refine.md");

static REVIEW_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile_schema(REVIEW_SCHEMA));
static REFINE_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| compile_schema(REFINE_SCHEMA));

static PROMPTS: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    env.add_template("review", REVIEW_TEMPLATE)
        .expect("review template should be valid");
    env.add_template("refine", REFINE_TEMPLATE)
        .expect("refine template should be valid");
    env
});

fn compile_schema(raw: &str) -> Validator {
    let schema: Value = serde_json::from_str(raw).expect("embedded schema should be valid json");
    validator_for(&schema).expect("embedded schema should compile")
}

/// Input of one review producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewRequest {
    pub focus_area: FocusArea,
    pub iteration: u32,
    pub max_iterations: u32,
    pub requirements: String,
    pub technologies: Vec<Technology>,
    pub previous_validation_failed: bool,
    pub prompt: String,
}

/// Input of the refine producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefineRequest {
    pub iteration: u32,
    pub max_iterations: u32,
    pub requirements: String,
    pub technologies: Vec<Technology>,
    /// Aggregated findings in rank order.
    pub findings: Vec<Finding>,
    pub prompt: String,
}

/// Reviews the project from one focus area. Returns the raw JSON document.
///
/// Implementations should stop early once `cancel` fires; the caller waits
/// for them either way.
pub trait ReviewProducer: Send + Sync {
    fn review(&self, request: &ReviewRequest, cancel: &CancelToken) -> anyhow::Result<Value>;
}

/// Applies changes for the aggregated findings. Returns the raw JSON document.
///
/// The only writer to the project while it runs; a cancelled refine must have
/// stopped writing when it returns.
pub trait RefineProducer: Send + Sync {
    fn refine(&self, request: &RefineRequest, cancel: &CancelToken) -> anyhow::Result<Value>;
}

impl ReviewRequest {
    pub fn new(
        focus_area: FocusArea,
        iteration: u32,
        max_iterations: u32,
        requirements: &str,
        technologies: &[Technology],
        previous_validation_failed: bool,
    ) -> anyhow::Result<Self> {
        let prompt = PROMPTS.get_template("review")?.render(context! {
            focus_area => focus_area.as_str(),
            iteration,
            max_iterations,
            requirements => requirements.trim(),
            technologies,
            previous_validation_failed,
        })?;
        Ok(Self {
            focus_area,
            iteration,
            max_iterations,
            requirements: requirements.to_string(),
            technologies: technologies.to_vec(),
            previous_validation_failed,
            prompt,
        })
    }
}

impl RefineRequest {
    pub fn new(
        iteration: u32,
        max_iterations: u32,
        requirements: &str,
        technologies: &[Technology],
        findings: Vec<Finding>,
    ) -> anyhow::Result<Self> {
        let prompt = PROMPTS.get_template("refine")?.render(context! {
            iteration,
            max_iterations,
            requirements => requirements.trim(),
            technologies,
            findings => &findings,
        })?;
        Ok(Self {
            iteration,
            max_iterations,
            requirements: requirements.to_string(),
            technologies: technologies.to_vec(),
            findings,
            prompt,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ReviewOutput {
    findings: Vec<RawFinding>,
}

#[derive(Debug, Deserialize)]
struct RawFinding {
    severity: String,
    category: Option<String>,
    file: Option<String>,
    line: Option<u32>,
    description: String,
    suggestion: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefineOutput {
    improvements: Vec<RawImprovement>,
}

#[derive(Debug, Deserialize)]
struct RawImprovement {
    finding_id: Option<i64>,
    description: String,
    #[serde(default)]
    files_modified: Vec<String>,
    tests_passing: bool,
}

fn check_schema(validator: &Validator, value: &Value) -> Result<(), ProducerFailure> {
    let messages: Vec<String> = validator.iter_errors(value).map(|err| err.to_string()).collect();
    if messages.is_empty() {
        Ok(())
    } else {
        Err(ProducerFailure::Malformed(messages.join("; ")))
    }
}

/// Validate and convert a review document. A finding without a category is
/// filed under the producer's focus area.
pub fn parse_review_output(
    focus_area: FocusArea,
    value: &Value,
) -> Result<Vec<FindingDraft>, ProducerFailure> {
    check_schema(&REVIEW_VALIDATOR, value)?;
    let output: ReviewOutput = serde_json::from_value(value.clone())
        .map_err(|err| ProducerFailure::Malformed(err.to_string()))?;

    output
        .findings
        .into_iter()
        .map(|raw| {
            let severity = Severity::parse(&raw.severity).ok_or_else(|| {
                ProducerFailure::Malformed(format!("unknown severity {}", raw.severity))
            })?;
            Ok(FindingDraft {
                focus_area,
                severity,
                category: raw
                    .category
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| focus_area.as_str().to_string()),
                file_path: raw.file.filter(|f| !f.trim().is_empty()),
                line_number: raw.line,
                description: raw.description,
                suggestion: raw.suggestion.unwrap_or_default(),
            })
        })
        .collect()
}

/// Validate and convert a refine document. References to findings outside
/// `known_findings` are dropped to `None`.
pub fn parse_refine_output(
    value: &Value,
    known_findings: &HashSet<i64>,
) -> Result<Vec<ImprovementDraft>, ProducerFailure> {
    check_schema(&REFINE_VALIDATOR, value)?;
    let output: RefineOutput = serde_json::from_value(value.clone())
        .map_err(|err| ProducerFailure::Malformed(err.to_string()))?;

    Ok(output
        .improvements
        .into_iter()
        .map(|raw| {
            let finding_id = raw.finding_id.filter(|id| {
                let known = known_findings.contains(id);
                if !known {
                    debug!(finding_id = id, "improvement references unknown finding");
                }
                known
            });
            ImprovementDraft {
                finding_id,
                description: raw.description,
                files_modified: raw.files_modified,
                tests_passing: raw.tests_passing,
            }
        })
        .collect())
}

/// Producer backed by an external command: the rendered prompt goes to
/// stdin, a JSON document is expected on stdout.
pub struct CommandProducer {
    pub argv: Vec<String>,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CommandProducer {
    fn run(&self, prompt: &str, cancel: &CancelToken) -> anyhow::Result<Value> {
        let cmd = command_from_argv(&self.argv, &self.workdir)?;
        let output = run_command_cancellable(
            cmd,
            Some(prompt.as_bytes()),
            self.timeout,
            self.output_limit_bytes,
            cancel,
        )
        .context("run producer command")?;
        if output.timed_out {
            return Err(anyhow!("producer command timed out"));
        }
        if output.cancelled {
            return Err(anyhow!("producer command cancelled"));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "producer command exited with {:?}",
                output.status.code()
            ));
        }
        serde_json::from_slice(output.stdout.trim_ascii()).context("parse producer output")
    }
}

impl ReviewProducer for CommandProducer {
    fn review(&self, request: &ReviewRequest, cancel: &CancelToken) -> anyhow::Result<Value> {
        self.run(&request.prompt, cancel)
    }
}

impl RefineProducer for CommandProducer {
    fn refine(&self, request: &RefineRequest, cancel: &CancelToken) -> anyhow::Result<Value> {
        self.run(&request.prompt, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn review_output_defaults_category_to_focus() {
        let value = json!({"findings": [
            {"severity": "high", "file": "src/lib.rs", "line": 12, "description": "missing check"}
        ]});
        let drafts = parse_review_output(FocusArea::Security, &value).expect("parse");
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].severity, Severity::High);
        assert_eq!(drafts[0].category, "security");
        assert_eq!(drafts[0].line_number, Some(12));
    }

    #[test]
    fn review_output_violating_schema_is_malformed() {
        let value = json!({"findings": [{"severity": "URGENT", "description": "x"}]});
        let err = parse_review_output(FocusArea::Gaps, &value).unwrap_err();
        assert!(matches!(err, ProducerFailure::Malformed(_)));

        let err = parse_review_output(FocusArea::Gaps, &json!({"notes": []})).unwrap_err();
        assert!(matches!(err, ProducerFailure::Malformed(_)));
    }

    #[test]
    fn unknown_finding_reference_becomes_none() {
        let value = json!({"improvements": [
            {
                "finding_id": 7,
                "description": "fixed",
                "files_modified": ["a.rs"],
                "tests_passing": true
            },
            {"finding_id": 99, "description": "other", "tests_passing": false}
        ]});
        let known = HashSet::from([7]);
        let drafts = parse_refine_output(&value, &known).expect("parse");
        assert_eq!(drafts[0].finding_id, Some(7));
        assert_eq!(drafts[1].finding_id, None);
        assert!(drafts[1].files_modified.is_empty());
    }

    #[test]
    fn review_prompt_mentions_focus_and_technologies() {
        let technologies = vec![Technology {
            name: "rusqlite".to_string(),
            category: "storage".to_string(),
            version: "0.37".to_string(),
        }];
        let request = ReviewRequest::new(
            FocusArea::EdgeCases,
            2,
            5,
            "Build a scheduler.",
            &technologies,
            true,
        )
        .expect("render");
        assert!(request.prompt.contains("edge_cases"));
        assert!(request.prompt.contains("rusqlite (storage 0.37)"));
        assert!(request.prompt.contains("validation command failed"));
    }

    #[test]
    fn refine_prompt_without_findings() {
        let request = RefineRequest::new(1, 5, "Build it.", &[], Vec::new()).expect("render");
        assert!(request.prompt.contains("No findings were reported"));
    }
}
