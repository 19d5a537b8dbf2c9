//! Transactional SQLite storage for milestones, tasks and refine records.
//!
//! Every mutation goes through [`Store::transaction`], which opens an
//! IMMEDIATE transaction: the closure either returns `Ok` and commits, or
//! returns `Err`/panics and the transaction rolls back, leaving state exactly
//! as it was. Query helpers in the submodules take `&Connection`, so they work
//! on a plain connection and inside a transaction alike.

pub mod graph_edges;
pub mod records;
pub mod refine_rows;
pub mod state;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use tracing::debug;

use crate::core::types::{
    ExecutionStatus, FocusArea, IterationStatus, MilestoneStatus, Severity, TaskStatus,
};
use crate::error::{Result, SchedulerError};

/// Monotonic marker recorded under `project_metadata.schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Tables holding project state, parents before children.
pub(crate) const TABLES: [&str; 10] = [
    "project_metadata",
    "project_state",
    "technologies",
    "milestones",
    "tasks",
    "task_dependencies",
    "task_executions",
    "refine_iterations",
    "refine_findings",
    "refine_improvements",
];

/// Tables a snapshot must contain to be considered restorable.
pub(crate) const REQUIRED_TABLES: [&str; 4] =
    ["project_metadata", "project_state", "milestones", "tasks"];

pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.path).finish()
    }
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// The parent directory must already exist.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!(path = %path.display(), journal = %journal, "opened state database");
        configure(&conn)?;
        apply_schema(&conn)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        apply_schema(&conn)?;
        Ok(Self { conn, path: None })
    }

    /// On-disk location, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside an IMMEDIATE transaction.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Run read-only queries against one consistent snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Replace every project table with the contents of `snapshot` in a single
    /// transaction.
    ///
    /// The snapshot must carry the same schema version as the live store.
    pub(crate) fn replace_from_snapshot(&mut self, snapshot: &Path) -> Result<()> {
        let location = snapshot.to_string_lossy().into_owned();
        self.conn
            .execute("ATTACH DATABASE ?1 AS snapshot", [&location])?;
        let copied = copy_snapshot_tables(&mut self.conn);
        let detached = self.conn.execute("DETACH DATABASE snapshot", []);
        copied?;
        detached?;
        debug!(snapshot = %snapshot.display(), "replaced live state from snapshot");
        Ok(())
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    if let Some(found) = read_schema_version(conn, "main")?
        && found > SCHEMA_VERSION
    {
        return Err(SchedulerError::SchemaVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT INTO project_metadata (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Read the schema marker of the attached database `schema` (`main`,
/// `snapshot`), or `None` when it has no metadata table yet.
fn read_schema_version(conn: &Connection, schema: &str) -> Result<Option<i64>> {
    let has_table: bool = conn.query_row(
        &format!(
            "SELECT EXISTS (SELECT 1 FROM {schema}.sqlite_master
             WHERE type = 'table' AND name = 'project_metadata')"
        ),
        [],
        |row| row.get(0),
    )?;
    if !has_table {
        return Ok(None);
    }
    let raw: Option<String> = conn
        .query_row(
            &format!("SELECT value FROM {schema}.project_metadata WHERE key = 'schema_version'"),
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw.and_then(|value| value.parse().ok()))
}

fn copy_snapshot_tables(conn: &mut Connection) -> Result<()> {
    let found = read_schema_version(conn, "snapshot")?.unwrap_or(0);
    if found != SCHEMA_VERSION {
        return Err(SchedulerError::SchemaVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch("PRAGMA defer_foreign_keys = ON")?;
    for table in TABLES.iter().rev() {
        tx.execute(&format!("DELETE FROM main.{table}"), [])?;
    }
    for table in TABLES {
        tx.execute(
            &format!("INSERT INTO main.{table} SELECT * FROM snapshot.{table}"),
            [],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Open a snapshot file read-only, without applying the schema.
pub(crate) fn open_read_only(path: &Path) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    Ok(conn)
}

macro_rules! text_enum_sql {
    ($($ty:ty),+ $(,)?) => {$(
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = value.as_str()?;
                <$ty>::parse(raw).ok_or_else(|| {
                    FromSqlError::Other(
                        format!("unknown {} value '{raw}'", stringify!($ty)).into(),
                    )
                })
            }
        }
    )+};
}

text_enum_sql!(
    MilestoneStatus,
    TaskStatus,
    IterationStatus,
    ExecutionStatus,
    Severity,
    FocusArea,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_applies_schema_and_version() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.db");
        let store = Store::open(&path).expect("open");
        let version = store
            .read(|conn| read_schema_version(conn, "main"))
            .expect("version");
        assert_eq!(version, Some(SCHEMA_VERSION));
        drop(store);

        // Re-opening is idempotent.
        Store::open(&path).expect("reopen");
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.db");
        {
            let mut store = Store::open(&path).expect("open");
            store
                .transaction(|tx| {
                    state::set_meta(tx, "schema_version", "99")?;
                    Ok(())
                })
                .expect("bump version");
        }
        let err = Store::open(&path).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::SchemaVersion {
                found: 99,
                supported: SCHEMA_VERSION
            }
        ));
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let mut store = Store::open_in_memory().expect("open");
        let result: Result<()> = store.transaction(|tx| {
            state::set_state(tx, "current_milestone_id", Some("M1"))?;
            Err(SchedulerError::not_found("milestone", "M1"))
        });
        assert!(result.is_err());
        let value = store
            .read(|conn| state::get_state(conn, "current_milestone_id"))
            .expect("read");
        assert_eq!(value, None);
    }

    #[test]
    fn enum_columns_reject_unknown_text() {
        let store = Store::open_in_memory().expect("open");
        let err = store
            .read(|conn| {
                let status: TaskStatus = conn.query_row("SELECT 'paused'", [], |row| row.get(0))?;
                Ok(status)
            })
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Storage(_)));
    }
}
