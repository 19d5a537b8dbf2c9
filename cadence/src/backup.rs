//! Point-in-time snapshots of the state database.
//!
//! Snapshots are plain SQLite files written with `VACUUM INTO`, named
//! `<kind>_<tag>_<YYYYmmdd_HHMMSS_micro>.db` inside the backups directory.
//! The name carries everything `list` needs, so no side index is kept.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Result, SchedulerError};
use crate::store::{self, REQUIRED_TABLES, SCHEMA_VERSION, Store};

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

static SNAPSHOT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(auto|manual|safety)_(.+)_(\d{8}_\d{6}_\d{6})\.db$").expect("snapshot regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotKind {
    /// Taken by policy before bulk mutations and on milestone boundaries.
    Auto,
    /// Requested explicitly; never removed by cleanup.
    Manual,
    /// Taken right before a restore overwrites live state.
    Safety,
}

impl SnapshotKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
            Self::Safety => "safety",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            "safety" => Some(Self::Safety),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupHandle {
    pub name: String,
    pub path: PathBuf,
    pub kind: SnapshotKind,
    pub tag: String,
    pub created_at: DateTime<Utc>,
}

/// Result of inspecting a snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotReport {
    pub name: String,
    pub size_bytes: u64,
    pub integrity_ok: bool,
    pub missing_tables: Vec<String>,
    pub schema_version: Option<i64>,
    pub milestones: u32,
    pub tasks: u32,
    pub problems: Vec<String>,
}

impl SnapshotReport {
    pub fn is_restorable(&self) -> bool {
        self.integrity_ok
            && self.missing_tables.is_empty()
            && self.schema_version == Some(SCHEMA_VERSION)
            && self.problems.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    pub restored: BackupHandle,
    /// Snapshot of the state that was replaced.
    pub safety: BackupHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_days: u32,
    pub keep_minimum: usize,
}

#[derive(Debug, Clone)]
pub struct BackupManager {
    dir: PathBuf,
}

impl BackupManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a consistent snapshot of `store`.
    pub fn backup(&self, store: &Store, kind: SnapshotKind, tag: &str) -> Result<BackupHandle> {
        fs::create_dir_all(&self.dir).map_err(|err| {
            SchedulerError::backup(format!("create {}", self.dir.display()), err)
        })?;

        let tag = sanitize_tag(tag);
        let mut created_at = Utc::now();
        let (name, path) = loop {
            let name = format!(
                "{}_{}_{}.db",
                kind.as_str(),
                tag,
                created_at.format(TIMESTAMP_FORMAT)
            );
            let path = self.dir.join(&name);
            if !path.exists() {
                break (name, path);
            }
            created_at += Duration::microseconds(1);
        };

        store
            .connection()
            .execute("VACUUM INTO ?1", [path.to_string_lossy().as_ref()])?;
        info!(snapshot = %name, "wrote snapshot");

        Ok(BackupHandle {
            name,
            path,
            kind,
            tag,
            created_at: truncate_to_micros(created_at),
        })
    }

    /// Snapshots in the backups directory, newest first.
    pub fn list(&self) -> Result<Vec<BackupHandle>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(SchedulerError::backup(
                    format!("read {}", self.dir.display()),
                    err,
                ));
            }
        };

        let mut handles = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                SchedulerError::backup(format!("read {}", self.dir.display()), err)
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(handle) = parse_snapshot_name(&self.dir, &name) {
                handles.push(handle);
            }
        }
        handles.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(handles)
    }

    /// Newest snapshot that is not a pre-restore safety copy.
    pub fn latest(&self) -> Result<Option<BackupHandle>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|handle| handle.kind != SnapshotKind::Safety))
    }

    pub fn find(&self, name: &str) -> Result<BackupHandle> {
        self.list()?
            .into_iter()
            .find(|handle| handle.name == name)
            .ok_or_else(|| SchedulerError::not_found("snapshot", name))
    }

    /// Inspect a snapshot: integrity check, required tables, schema marker.
    ///
    /// Unreadable files produce a report with problems rather than an error.
    pub fn verify(&self, handle: &BackupHandle) -> Result<SnapshotReport> {
        let size_bytes = fs::metadata(&handle.path)
            .map_err(|err| SchedulerError::backup(format!("stat {}", handle.path.display()), err))?
            .len();
        let mut report = SnapshotReport {
            name: handle.name.clone(),
            size_bytes,
            integrity_ok: false,
            missing_tables: Vec::new(),
            schema_version: None,
            milestones: 0,
            tasks: 0,
            problems: Vec::new(),
        };
        if let Err(err) = inspect_snapshot(&handle.path, &mut report) {
            report.problems.push(err.to_string());
        }
        Ok(report)
    }

    /// Replace live state with `handle`, after verifying it and taking a
    /// safety snapshot of the current state.
    pub fn restore(&self, store: &mut Store, handle: &BackupHandle) -> Result<RestoreOutcome> {
        let report = self.verify(handle)?;
        if !report.is_restorable() {
            let mut reasons = report.problems.clone();
            if !report.integrity_ok {
                reasons.push("integrity check failed".to_string());
            }
            if !report.missing_tables.is_empty() {
                reasons.push(format!("missing tables: {}", report.missing_tables.join(", ")));
            }
            if report.schema_version != Some(SCHEMA_VERSION) {
                reasons.push(format!(
                    "schema version {:?}, expected {SCHEMA_VERSION}",
                    report.schema_version
                ));
            }
            return Err(SchedulerError::SnapshotInvalid {
                name: handle.name.clone(),
                reason: reasons.join("; "),
            });
        }

        let safety = self.backup(store, SnapshotKind::Safety, "pre_restore")?;
        store.replace_from_snapshot(&handle.path)?;
        info!(snapshot = %handle.name, safety = %safety.name, "restored snapshot");
        Ok(RestoreOutcome {
            restored: handle.clone(),
            safety,
        })
    }

    /// Remove `auto`/`safety` snapshots older than `keep_days`, always keeping
    /// the newest `keep_minimum` of them. `manual` snapshots are never removed.
    pub fn cleanup(
        &self,
        policy: &RetentionPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<BackupHandle>> {
        let cutoff = now - Duration::days(i64::from(policy.keep_days));
        let mut removed = Vec::new();
        let candidates = self
            .list()?
            .into_iter()
            .filter(|handle| handle.kind != SnapshotKind::Manual)
            .skip(policy.keep_minimum);
        for handle in candidates {
            if handle.created_at >= cutoff {
                continue;
            }
            fs::remove_file(&handle.path).map_err(|err| {
                SchedulerError::backup(format!("remove {}", handle.path.display()), err)
            })?;
            for suffix in ["-wal", "-shm"] {
                let side = PathBuf::from(format!("{}{suffix}", handle.path.display()));
                if side.exists()
                    && let Err(err) = fs::remove_file(&side)
                {
                    warn!(
                        path = %side.display(),
                        error = %err,
                        "failed to remove snapshot side file"
                    );
                }
            }
            removed.push(handle);
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), "cleaned up snapshots");
        }
        Ok(removed)
    }
}

fn inspect_snapshot(path: &Path, report: &mut SnapshotReport) -> Result<()> {
    let conn = store::open_read_only(path)?;
    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    report.integrity_ok = integrity == "ok";
    if !report.integrity_ok {
        report.problems.push(format!("integrity_check: {integrity}"));
        return Ok(());
    }

    for table in REQUIRED_TABLES {
        let exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table],
            |row| row.get(0),
        )?;
        if !exists {
            report.missing_tables.push(table.to_string());
        }
    }
    if !report.missing_tables.is_empty() {
        return Ok(());
    }

    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM project_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .ok();
    report.schema_version = version.and_then(|raw| raw.parse().ok());
    report.milestones = conn.query_row("SELECT COUNT(*) FROM milestones", [], |row| row.get(0))?;
    report.tasks = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
    Ok(())
}

fn parse_snapshot_name(dir: &Path, name: &str) -> Option<BackupHandle> {
    let caps = SNAPSHOT_NAME.captures(name)?;
    let kind = SnapshotKind::parse(&caps[1])?;
    let created_at = NaiveDateTime::parse_from_str(&caps[3], TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    Some(BackupHandle {
        name: name.to_string(),
        path: dir.join(name),
        kind,
        tag: caps[2].to_string(),
        created_at,
    })
}

fn sanitize_tag(tag: &str) -> String {
    let cleaned: String = tag
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "snapshot".to_string()
    } else {
        cleaned
    }
}

/// Snapshot names carry microseconds; keep handles comparable with parsed ones.
fn truncate_to_micros(at: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = at.timestamp_subsec_nanos();
    at - Duration::nanoseconds(i64::from(nanos % 1_000))
}
