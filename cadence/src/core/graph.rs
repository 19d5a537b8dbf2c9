//! Cycle detection for the task dependency graph.

use std::collections::{HashMap, HashSet};

use super::types::TaskDependency;

/// Return the dependency path that adding `task_id -> depends_on` would close,
/// or `None` if the edge keeps the graph acyclic.
///
/// The returned path starts and ends at `task_id`
/// (e.g. `["T1", "T2", "T3", "T1"]`). A self edge yields `["T1", "T1"]`.
pub fn cycle_path(
    edges: &[TaskDependency],
    task_id: &str,
    depends_on: &str,
) -> Option<Vec<String>> {
    if task_id == depends_on {
        return Some(vec![task_id.to_string(), depends_on.to_string()]);
    }

    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        adjacency
            .entry(edge.task_id.as_str())
            .or_default()
            .push(edge.depends_on_task_id.as_str());
    }
    for targets in adjacency.values_mut() {
        targets.sort_unstable();
    }

    // The new edge closes a cycle iff `task_id` is reachable from `depends_on`.
    let mut parents: HashMap<&str, &str> = HashMap::new();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![depends_on];
    visited.insert(depends_on);

    while let Some(node) = stack.pop() {
        if node == task_id {
            let mut path = vec![task_id.to_string()];
            let mut cursor = node;
            while let Some(parent) = parents.get(cursor) {
                path.push((*parent).to_string());
                cursor = *parent;
            }
            path.reverse();
            path.insert(0, task_id.to_string());
            return Some(path);
        }
        if let Some(next) = adjacency.get(node) {
            for &target in next.iter().rev() {
                if visited.insert(target) {
                    parents.insert(target, node);
                    stack.push(target);
                }
            }
        }
    }

    None
}

pub fn would_create_cycle(edges: &[TaskDependency], task_id: &str, depends_on: &str) -> bool {
    cycle_path(edges, task_id, depends_on).is_some()
}
