//! Structured error taxonomy for scheduler operations.
//!
//! Every facade operation either fully succeeds or returns one of these
//! variants with the transaction rolled back. Producer failures inside the
//! refine loop are not represented here: they are recovered locally (see
//! [`crate::refine::ProducerFailure`]).

use std::fmt;

use rusqlite::ErrorCode;
use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = SchedulerError> = std::result::Result<T, E>;

/// Named invariant reported by [`SchedulerError::IntegrityViolation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Invariant {
    /// Status change not allowed by the milestone/task state machine.
    IllegalTransition,
    /// Dependency edge would close a cycle in the task graph.
    CyclicDependency,
    /// Reference to a milestone or task that does not exist.
    ForeignKey,
    /// Duplicate primary identifier.
    UniqueId,
    /// Work attempted outside the current milestone.
    MilestoneOrder,
    /// Planning input rejected as a whole.
    InvalidPlan,
}

impl Invariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IllegalTransition => "illegal_transition",
            Self::CyclicDependency => "cyclic_dependency",
            Self::ForeignKey => "foreign_key",
            Self::UniqueId => "unique_id",
            Self::MilestoneOrder => "milestone_order",
            Self::InvalidPlan => "invalid_plan",
        }
    }
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("integrity violation ({invariant}): {detail}")]
    IntegrityViolation { invariant: Invariant, detail: String },

    #[error("task '{task_id}' has unmet dependencies: {}", missing.join(", "))]
    DependencyUnmet { task_id: String, missing: Vec<String> },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("storage failure: {0}")]
    Storage(#[source] rusqlite::Error),

    #[error("backup failure: {context}")]
    Backup {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot '{name}' is not restorable: {reason}")]
    SnapshotInvalid { name: String, reason: String },

    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: i64, supported: i64 },
}

impl SchedulerError {
    pub fn violation(invariant: Invariant, detail: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            invariant,
            detail: detail.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn backup(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Backup {
            context: context.into(),
            source,
        }
    }

    /// Storage-layer failures are fatal; restoring the latest snapshot is the
    /// recommended recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Backup { .. } | Self::SchemaVersion { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::IntegrityViolation { .. } => "integrity_violation",
            Self::DependencyUnmet { .. } => "dependency_unmet",
            Self::NotFound { .. } => "not_found",
            Self::Storage(_) => "storage_failure",
            Self::Backup { .. } => "backup_failure",
            Self::SnapshotInvalid { .. } => "snapshot_invalid",
            Self::SchemaVersion { .. } => "schema_version",
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        let (invariant, missing) = match self {
            Self::IntegrityViolation { invariant, .. } => (Some(*invariant), Vec::new()),
            Self::DependencyUnmet { missing, .. } => (None, missing.clone()),
            _ => (None, Vec::new()),
        };
        ErrorPayload {
            error: self.kind(),
            invariant,
            message: self.to_string(),
            missing_dependencies: missing,
            fatal: self.is_fatal(),
        }
    }
}

/// Constraint failures raised by SQLite itself are integrity violations, not
/// storage failures: the transaction is rolled back and the store is healthy.
impl From<rusqlite::Error> for SchedulerError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, message) = &err
            && code.code == ErrorCode::ConstraintViolation
        {
            let detail = message.clone().unwrap_or_else(|| code.to_string());
            let invariant = match code.extended_code {
                rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                | rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE => Invariant::UniqueId,
                rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Invariant::ForeignKey,
                _ => Invariant::IllegalTransition,
            };
            return Self::violation(invariant, detail);
        }
        Self::Storage(err)
    }
}

/// JSON shape returned to callers of the facade boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invariant: Option<Invariant>,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_dependencies: Vec<String>,
    pub fatal: bool,
}
