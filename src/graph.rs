//! Dependency graph: cycle rejection, readiness and dependent traversal.
//!
//! Edges run from a dependent task to each of its prerequisites and are only
//! written when the dependent is created. All traversals use explicit
//! worklists with visited sets, never recursion.

use crate::storage;
use crate::store::StoreError;
use crate::types::{TaskId, TaskStatus};
use eyre::Result;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{HashSet, VecDeque};

/// SQL predicate, over a task aliased `t`, true when some prerequisite of
/// `t` has not completed.
pub(crate) const HAS_UNMET_PREREQUISITE: &str = "EXISTS (\
     SELECT 1 FROM task_dependencies d \
     JOIN tasks dep ON dep.id = d.depends_on_id \
     WHERE d.task_id = t.id AND dep.status != 'completed')";

/// Ids `task_id` declares as prerequisites.
pub fn prerequisites_of(conn: &Connection, task_id: TaskId) -> Result<Vec<TaskId>> {
    let mut stmt = conn.prepare_cached("SELECT depends_on_id FROM task_dependencies WHERE task_id = ?1 ORDER BY depends_on_id")?;
    let ids = stmt
        .query_map(params![task_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<TaskId>>>()?;
    Ok(ids)
}

/// Ids of tasks that declare `task_id` as a prerequisite, with their status.
pub fn dependents_of(conn: &Connection, task_id: TaskId) -> Result<Vec<(TaskId, TaskStatus)>> {
    let mut stmt = conn.prepare_cached(
        r#"
        SELECT t.id, t.status FROM task_dependencies d
        JOIN tasks t ON t.id = d.task_id
        WHERE d.depends_on_id = ?1
        ORDER BY t.id
        "#,
    )?;
    let rows = stmt
        .query_map(params![task_id], |row| Ok((row.get::<_, TaskId>(0)?, storage::status_column(row, 1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Whether `task_id` is pending with every prerequisite completed.
/// False for a missing task.
pub fn is_ready(conn: &Connection, task_id: TaskId) -> Result<bool> {
    let ready: Option<bool> = conn
        .query_row(
            &format!(
                "SELECT t.status = 'pending' AND NOT {} FROM tasks t WHERE t.id = ?1",
                HAS_UNMET_PREREQUISITE
            ),
            params![task_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(ready.unwrap_or(false))
}

/// Validate the prerequisite list of `new_id`, a task row inserted in the
/// current transaction and not yet committed.
///
/// Fails with `UnknownDependency` for an id with no task row and with
/// `CircularDependency` when any prerequisite reaches back to `new_id`.
pub fn check_prerequisites(conn: &Connection, new_id: TaskId, depends_on: &[TaskId]) -> Result<()> {
    for &dep in depends_on {
        if dep == new_id {
            return Err(eyre::eyre!(StoreError::CircularDependency(dep)));
        }
        if !storage::task_exists(conn, dep)? {
            return Err(eyre::eyre!(StoreError::UnknownDependency(dep)));
        }
    }
    if let Some(dep) = find_cycle(conn, new_id, depends_on)? {
        return Err(eyre::eyre!(StoreError::CircularDependency(dep)));
    }
    Ok(())
}

enum Visit {
    Enter(TaskId),
    Leave(TaskId),
}

/// Walk the prerequisite chain from each of `depends_on`. Returns the
/// declared prerequisite whose walk re-enters a node on the current path
/// (including `root` itself). Shared ancestors (diamonds) are not cycles.
pub fn find_cycle(conn: &Connection, root: TaskId, depends_on: &[TaskId]) -> Result<Option<TaskId>> {
    let mut on_path: HashSet<TaskId> = HashSet::from([root]);
    let mut finished: HashSet<TaskId> = HashSet::new();

    for &start in depends_on {
        let mut stack = vec![Visit::Enter(start)];

        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(node) => {
                    if on_path.contains(&node) {
                        return Ok(Some(start));
                    }
                    if finished.contains(&node) {
                        continue;
                    }
                    on_path.insert(node);
                    stack.push(Visit::Leave(node));
                    for prerequisite in prerequisites_of(conn, node)? {
                        stack.push(Visit::Enter(prerequisite));
                    }
                }
                Visit::Leave(node) => {
                    on_path.remove(&node);
                    finished.insert(node);
                }
            }
        }
    }

    Ok(None)
}

/// Tasks to cancel when `root` becomes cancelled or permanently failed:
/// every non-terminal dependent, and, transitively, the non-terminal
/// dependents of those. Terminal dependents stop the walk. Breadth-first,
/// each task visited once.
pub fn cascade_targets(conn: &Connection, root: TaskId) -> Result<Vec<TaskId>> {
    let mut visited: HashSet<TaskId> = HashSet::from([root]);
    let mut queue: VecDeque<TaskId> = VecDeque::from([root]);
    let mut targets = Vec::new();

    while let Some(current) = queue.pop_front() {
        for (dependent, status) in dependents_of(conn, current)? {
            if status.is_terminal() || !visited.insert(dependent) {
                continue;
            }
            targets.push(dependent);
            queue.push_back(dependent);
        }
    }

    Ok(targets)
}
