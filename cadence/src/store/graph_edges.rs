//! Task dependency edges.

use rusqlite::{Connection, params};
use tracing::debug;

use super::records;
use crate::core::graph;
use crate::core::types::TaskDependency;
use crate::error::{Invariant, Result, SchedulerError};

/// Every edge, ordered by (`task_id`, `depends_on_task_id`).
pub fn list_dependencies(conn: &Connection) -> Result<Vec<TaskDependency>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, depends_on_task_id FROM task_dependencies
         ORDER BY task_id, depends_on_task_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(TaskDependency {
            task_id: row.get(0)?,
            depends_on_task_id: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn dependencies_of(conn: &Connection, task_id: &str) -> Result<Vec<TaskDependency>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, depends_on_task_id FROM task_dependencies
         WHERE task_id = ?1 ORDER BY depends_on_task_id",
    )?;
    let rows = stmt.query_map([task_id], |row| {
        Ok(TaskDependency {
            task_id: row.get(0)?,
            depends_on_task_id: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Insert `task_id -> depends_on`, rejecting unknown tasks and edges that
/// would close a cycle.
///
/// Must be called inside the transaction that owns the insert so the cycle
/// check and the write see the same graph.
pub fn insert_dependency(conn: &Connection, task_id: &str, depends_on: &str) -> Result<()> {
    for id in [task_id, depends_on] {
        if records::get_task(conn, id)?.is_none() {
            return Err(SchedulerError::violation(
                Invariant::ForeignKey,
                format!("dependency {task_id} -> {depends_on} references unknown task '{id}'"),
            ));
        }
    }

    let edges = list_dependencies(conn)?;
    if let Some(path) = graph::cycle_path(&edges, task_id, depends_on) {
        return Err(SchedulerError::violation(
            Invariant::CyclicDependency,
            format!("dependency cycle: {}", path.join(" -> ")),
        ));
    }

    conn.execute(
        "INSERT INTO task_dependencies (task_id, depends_on_task_id) VALUES (?1, ?2)",
        params![task_id, depends_on],
    )?;
    debug!(task_id, depends_on, "inserted dependency");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::store::records::{NewMilestone, NewTask, insert_milestone, insert_task};

    fn seeded() -> Store {
        let mut store = Store::open_in_memory().expect("open");
        store
            .transaction(|tx| {
                insert_milestone(
                    tx,
                    &NewMilestone {
                        id: "M1",
                        name: "M1",
                        description: "",
                        order_index: 0,
                    },
                )?;
                for (order, id) in ["T1", "T2", "T3"].into_iter().enumerate() {
                    insert_task(
                        tx,
                        &NewTask {
                            id,
                            milestone_id: "M1",
                            title: id,
                            description: "",
                            order_index: order as i64,
                            max_file_changes: 10,
                        },
                    )?;
                }
                Ok(())
            })
            .expect("seed");
        store
    }

    #[test]
    fn closing_a_cycle_is_rejected_and_rolled_back() {
        let mut store = seeded();
        store
            .transaction(|tx| {
                insert_dependency(tx, "T2", "T1")?;
                insert_dependency(tx, "T3", "T2")
            })
            .expect("chain");

        let err = store
            .transaction(|tx| insert_dependency(tx, "T1", "T3"))
            .unwrap_err();
        match err {
            SchedulerError::IntegrityViolation { invariant, detail } => {
                assert_eq!(invariant, Invariant::CyclicDependency);
                assert!(detail.contains("T1 -> T3 -> T2 -> T1"), "{detail}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let edges = store.read(list_dependencies).expect("edges");
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut store = seeded();
        let err = store
            .transaction(|tx| insert_dependency(tx, "T1", "T1"))
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::IntegrityViolation {
                invariant: Invariant::CyclicDependency,
                ..
            }
        ));
    }

    #[test]
    fn unknown_task_is_foreign_key_violation() {
        let mut store = seeded();
        let err = store
            .transaction(|tx| insert_dependency(tx, "T1", "T9"))
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::IntegrityViolation {
                invariant: Invariant::ForeignKey,
                ..
            }
        ));
    }

    #[test]
    fn duplicate_edge_is_unique_violation() {
        let mut store = seeded();
        store
            .transaction(|tx| insert_dependency(tx, "T2", "T1"))
            .expect("edge");
        let err = store
            .transaction(|tx| insert_dependency(tx, "T2", "T1"))
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::IntegrityViolation {
                invariant: Invariant::UniqueId,
                ..
            }
        ));
    }
}
