//! Shared deterministic types for scheduler core logic.
//!
//! Records mirror the persisted rows one-to-one. Status enums carry their
//! storage spelling via `as_str`/`parse` so the store and the JSON payloads
//! agree on a single representation.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Completed,
    Validated,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Validated => "validated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "validated" => Some(Self::Validated),
            _ => None,
        }
    }

    /// Completed or validated: all tasks are done.
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    Pending,
    InProgress,
    Completed,
}

impl IterationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Outcome recorded in the task execution log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Started,
    Completed,
    Interrupted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Review perspective assigned to one review producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusArea {
    Gaps,
    Quality,
    Integration,
    EdgeCases,
    Security,
    Performance,
}

impl FocusArea {
    /// Canonical order; also the default category priority.
    pub const ALL: [FocusArea; 6] = [
        Self::Gaps,
        Self::Quality,
        Self::Integration,
        Self::EdgeCases,
        Self::Security,
        Self::Performance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gaps => "gaps",
            Self::Quality => "quality",
            Self::Integration => "integration",
            Self::EdgeCases => "edge_cases",
            Self::Security => "security",
            Self::Performance => "performance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|area| area.as_str() == s)
    }
}

impl fmt::Display for FocusArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Milestone {
    pub id: String,
    pub name: String,
    pub description: String,
    pub order_index: i64,
    pub status: MilestoneStatus,
    pub validation_required: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub validated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub id: String,
    pub milestone_id: String,
    pub title: String,
    /// Opaque instruction text handed to the work performer.
    pub description: String,
    pub order_index: i64,
    pub status: TaskStatus,
    pub max_file_changes: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
}

/// Edge `task_id -> depends_on_task_id`: `task_id` may not start until
/// `depends_on_task_id` is completed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TaskDependency {
    pub task_id: String,
    pub depends_on_task_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskExecution {
    pub id: i64,
    pub task_id: String,
    pub status: ExecutionStatus,
    pub autopilot: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Technology {
    pub name: String,
    pub category: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefineIteration {
    pub id: i64,
    pub run_id: String,
    pub iteration_number: u32,
    pub status: IterationStatus,
    pub findings_count: u32,
    pub improvements_count: u32,
    pub producer_failures: u32,
    pub validation_passed: Option<bool>,
    pub summary: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Review finding before it is ranked and persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FindingDraft {
    pub focus_area: FocusArea,
    pub severity: Severity,
    pub category: String,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub description: String,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub id: i64,
    pub iteration_id: i64,
    pub focus_area: FocusArea,
    pub severity: Severity,
    pub category: String,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub description: String,
    pub suggestion: String,
    pub addressed: bool,
    pub rank: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImprovementDraft {
    pub finding_id: Option<i64>,
    pub description: String,
    pub files_modified: Vec<String>,
    pub tests_passing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Improvement {
    pub id: i64,
    pub iteration_id: i64,
    pub finding_id: Option<i64>,
    pub description: String,
    pub files_modified: Vec<String>,
    pub tests_passing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [TaskStatus::Pending, TaskStatus::InProgress, TaskStatus::Completed] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MilestoneStatus::parse("done"), None);
    }

    #[test]
    fn severity_parse_is_case_insensitive() {
        assert_eq!(Severity::parse("high"), Some(Severity::High));
        assert_eq!(Severity::parse("Low"), Some(Severity::Low));
        assert_eq!(Severity::parse("critical"), None);
    }

    #[test]
    fn severity_orders_high_first() {
        let mut severities = vec![Severity::Low, Severity::High, Severity::Medium];
        severities.sort();
        assert_eq!(severities, vec![Severity::High, Severity::Medium, Severity::Low]);
    }

    #[test]
    fn focus_area_serializes_snake_case() {
        let json = serde_json::to_string(&FocusArea::EdgeCases).expect("serialize");
        assert_eq!(json, "\"edge_cases\"");
        assert_eq!(FocusArea::parse("edge_cases"), Some(FocusArea::EdgeCases));
    }
}
