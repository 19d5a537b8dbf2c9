//! Key/value registers: `project_state`, `project_metadata` and the
//! technology constraint list.

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension, params};

use crate::core::types::Technology;
use crate::error::Result;

pub const CURRENT_MILESTONE_ID: &str = "current_milestone_id";
pub const TOTAL_TASKS: &str = "total_tasks";
pub const COMPLETED_TASKS: &str = "completed_tasks";
pub const REFINE_RUN_ID: &str = "refine_run_id";
pub const REFINE_PHASE_STATUS: &str = "refine_phase_status";
pub const REFINE_CURRENT_ITERATION: &str = "refine_current_iteration";
pub const REFINE_MAX_ITERATIONS: &str = "refine_max_iterations";

pub const META_COMPLEXITY: &str = "project_complexity";
pub const META_REQUIREMENTS: &str = "requirements_text";
pub const META_PLANNED_AT: &str = "planned_at";
pub const META_REFINE_STARTED_AT: &str = "refine_started_at";
pub const META_REFINE_COMPLETED_AT: &str = "refine_completed_at";

pub fn get_state(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value: Option<Option<String>> = conn
        .query_row(
            "SELECT value FROM project_state WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.flatten())
}

/// Set (or clear, with `None`) a state register.
pub fn set_state(conn: &Connection, key: &str, value: Option<&str>) -> Result<()> {
    conn.execute(
        "INSERT INTO project_state (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Numeric register; missing or unparsable values read as zero.
pub fn get_state_u32(conn: &Connection, key: &str) -> Result<u32> {
    Ok(get_state(conn, key)?
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0))
}

pub fn set_state_u32(conn: &Connection, key: &str, value: u32) -> Result<()> {
    set_state(conn, key, Some(&value.to_string()))
}

pub fn all_state(conn: &Connection) -> Result<BTreeMap<String, Option<String>>> {
    let mut stmt = conn.prepare("SELECT key, value FROM project_state ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (key, value) = row?;
        out.insert(key, value);
    }
    Ok(out)
}

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM project_metadata WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO project_metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn all_meta(conn: &Connection) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare("SELECT key, value FROM project_metadata ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut out = BTreeMap::new();
    for row in rows {
        let (key, value) = row?;
        out.insert(key, value);
    }
    Ok(out)
}

pub fn upsert_technology(conn: &Connection, technology: &Technology) -> Result<()> {
    conn.execute(
        "INSERT INTO technologies (name, category, version) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET category = excluded.category, version = excluded.version",
        params![technology.name, technology.category, technology.version],
    )?;
    Ok(())
}

pub fn list_technologies(conn: &Connection) -> Result<Vec<Technology>> {
    let mut stmt =
        conn.prepare("SELECT name, category, version FROM technologies ORDER BY category, name")?;
    let rows = stmt.query_map([], |row| {
        Ok(Technology {
            name: row.get(0)?,
            category: row.get(1)?,
            version: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn state_register_set_clear_and_count() {
        let mut store = Store::open_in_memory().expect("open");
        store
            .transaction(|tx| {
                set_state(tx, CURRENT_MILESTONE_ID, Some("M1"))?;
                set_state_u32(tx, TOTAL_TASKS, 4)?;
                Ok(())
            })
            .expect("write");
        store
            .transaction(|tx| set_state(tx, CURRENT_MILESTONE_ID, None))
            .expect("clear");

        let (current, total, missing) = store
            .read(|conn| {
                Ok((
                    get_state(conn, CURRENT_MILESTONE_ID)?,
                    get_state_u32(conn, TOTAL_TASKS)?,
                    get_state_u32(conn, COMPLETED_TASKS)?,
                ))
            })
            .expect("read");
        assert_eq!(current, None);
        assert_eq!(total, 4);
        assert_eq!(missing, 0);
    }

    #[test]
    fn technologies_are_upserted_by_name() {
        let mut store = Store::open_in_memory().expect("open");
        store
            .transaction(|tx| {
                upsert_technology(
                    tx,
                    &Technology {
                        name: "sqlite".into(),
                        category: "storage".into(),
                        version: "3.45".into(),
                    },
                )?;
                upsert_technology(
                    tx,
                    &Technology {
                        name: "sqlite".into(),
                        category: "storage".into(),
                        version: "3.46".into(),
                    },
                )
            })
            .expect("upsert");
        let techs = store.read(list_technologies).expect("list");
        assert_eq!(techs.len(), 1);
        assert_eq!(techs[0].version, "3.46");
    }
}
