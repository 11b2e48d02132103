//! Task lifecycle: creation and guarded state transitions.
//!
//! Every function runs against a transaction opened by `Store` and returns an
//! `Outcome` for routine guard failures. Cascading cancellation happens in the
//! same transaction as the transition that triggered it.

use crate::graph;
use crate::storage::{self, TaskState, to_db_time};
use crate::store::{Cancellation, Outcome, StoreError};
use crate::types::{NewTask, Task, TaskId, TaskStatus, TaskUpdate};
use chrono::{DateTime, Utc};
use eyre::Result;
use rusqlite::{Connection, params};
use std::collections::HashSet;

/// Insert a task with its edges and tags. An unknown or cyclic prerequisite
/// fails the call; the caller's transaction then discards the row.
pub(crate) fn create(conn: &Connection, task: &NewTask, now: DateTime<Utc>) -> Result<TaskId> {
    let id = storage::insert_task(conn, task, now)?;

    let mut seen = HashSet::new();
    let depends_on: Vec<TaskId> = task.depends_on.iter().copied().filter(|dep| seen.insert(*dep)).collect();
    graph::check_prerequisites(conn, id, &depends_on)?;

    for &dep in &depends_on {
        storage::insert_edge(conn, id, dep)?;
    }
    for tag in &task.tags {
        storage::insert_tag(conn, id, tag)?;
    }
    Ok(id)
}

/// Load the guard state of `id`, or the outcome to report when `id` is
/// missing or not in one of `allowed`.
fn guard<T>(conn: &Connection, id: TaskId, allowed: &[TaskStatus]) -> Result<Result<TaskState, Outcome<T>>> {
    match storage::fetch_state(conn, id)? {
        None => Ok(Err(Outcome::NotFound(id))),
        Some(state) if !allowed.contains(&state.status) => Ok(Err(Outcome::NotApplicable {
            id,
            status: Some(state.status),
        })),
        Some(state) => Ok(Ok(state)),
    }
}

fn reload(conn: &Connection, id: TaskId) -> Result<Task> {
    storage::fetch_task(conn, id)?.ok_or_else(|| eyre::eyre!(StoreError::NotFound(id)))
}

/// Completion only applies to an in-progress task. A missing task is reported
/// as not applicable rather than not found.
pub(crate) fn complete(conn: &Connection, id: TaskId, result: &str, now: DateTime<Utc>) -> Result<Outcome<Task>> {
    match guard(conn, id, &[TaskStatus::InProgress])? {
        Ok(_) => {}
        Err(Outcome::NotFound(id)) => return Ok(Outcome::NotApplicable { id, status: None }),
        Err(outcome) => return Ok(outcome),
    }

    let ts = to_db_time(now);
    conn.execute(
        r#"
        UPDATE tasks SET status = 'completed', result = ?1, completed_at = ?2, updated_at = ?2
        WHERE id = ?3
        "#,
        params![result, ts, id],
    )?;
    Ok(Outcome::Applied(reload(conn, id)?))
}

/// Auto-retry while the budget lasts; otherwise fail permanently and cancel
/// everything downstream.
pub(crate) fn fail(conn: &Connection, id: TaskId, error: &str, now: DateTime<Utc>) -> Result<Outcome<Task>> {
    let state = match guard(conn, id, &[TaskStatus::InProgress])? {
        Ok(state) => state,
        Err(outcome) => return Ok(outcome),
    };

    let ts = to_db_time(now);
    if state.retries < state.max_retries {
        conn.execute(
            r#"
            UPDATE tasks SET status = 'pending', retries = retries + 1, error = ?1, updated_at = ?2
            WHERE id = ?3
            "#,
            params![error, ts, id],
        )?;
    } else {
        conn.execute(
            r#"
            UPDATE tasks SET status = 'failed', error = ?1, completed_at = ?2, updated_at = ?2
            WHERE id = ?3
            "#,
            params![error, ts, id],
        )?;
        cascade_cancel(conn, id, now)?;
    }
    Ok(Outcome::Applied(reload(conn, id)?))
}

/// Manual retry: FAILED back to PENDING with a fresh retry budget.
pub(crate) fn retry(conn: &Connection, id: TaskId, now: DateTime<Utc>) -> Result<Outcome<Task>> {
    if let Err(outcome) = guard(conn, id, &[TaskStatus::Failed])? {
        return Ok(outcome);
    }

    conn.execute(
        r#"
        UPDATE tasks SET status = 'pending', retries = 0, error = NULL,
            started_at = NULL, completed_at = NULL, updated_at = ?1
        WHERE id = ?2
        "#,
        params![to_db_time(now), id],
    )?;
    Ok(Outcome::Applied(reload(conn, id)?))
}

pub(crate) fn cancel(conn: &Connection, id: TaskId, now: DateTime<Utc>) -> Result<Outcome<Cancellation>> {
    if let Err(outcome) = guard(conn, id, &[TaskStatus::Pending, TaskStatus::InProgress])? {
        return Ok(outcome);
    }

    conn.execute(
        "UPDATE tasks SET status = 'cancelled', updated_at = ?1 WHERE id = ?2",
        params![to_db_time(now), id],
    )?;
    let cascaded = cascade_cancel(conn, id, now)?;
    Ok(Outcome::Applied(Cancellation {
        task: reload(conn, id)?,
        cascaded,
    }))
}

/// Edit a pending task. Fields left `None` keep their value.
pub(crate) fn update(conn: &Connection, id: TaskId, update: &TaskUpdate, now: DateTime<Utc>) -> Result<Outcome<Task>> {
    if let Err(outcome) = guard(conn, id, &[TaskStatus::Pending])? {
        return Ok(outcome);
    }

    conn.execute(
        r#"
        UPDATE tasks SET
            title = COALESCE(?1, title),
            description = COALESCE(?2, description),
            priority = COALESCE(?3, priority),
            updated_at = ?4
        WHERE id = ?5
        "#,
        params![update.title, update.description, update.priority, to_db_time(now), id],
    )?;
    Ok(Outcome::Applied(reload(conn, id)?))
}

pub(crate) fn add_tag(conn: &Connection, id: TaskId, tag: &str) -> Result<Outcome<()>> {
    if !storage::task_exists(conn, id)? {
        return Ok(Outcome::NotFound(id));
    }
    if !storage::insert_tag(conn, id, tag)? {
        log::debug!("Tag {:?} already on task {}", tag, id);
    }
    Ok(Outcome::Applied(()))
}

pub(crate) fn remove_tag(conn: &Connection, id: TaskId, tag: &str) -> Result<Outcome<()>> {
    if !storage::task_exists(conn, id)? {
        return Ok(Outcome::NotFound(id));
    }
    if !storage::delete_tag(conn, id, tag)? {
        log::debug!("Tag {:?} not on task {}", tag, id);
    }
    Ok(Outcome::Applied(()))
}

/// Cancel every non-terminal transitive dependent of `root`.
pub(crate) fn cascade_cancel(conn: &Connection, root: TaskId, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
    let targets = graph::cascade_targets(conn, root)?;
    let ts = to_db_time(now);
    let mut stmt = conn.prepare_cached(
        "UPDATE tasks SET status = 'cancelled', updated_at = ?1 WHERE id = ?2 AND status IN ('pending', 'in_progress')",
    )?;
    for &id in &targets {
        stmt.execute(params![ts, id])?;
    }
    if !targets.is_empty() {
        log::info!("Cascade from task {} cancelled dependents {:?}", root, targets);
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::storage::{Storage, now};
    use tempfile::TempDir;

    fn setup_test_storage() -> (TempDir, Storage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(&StoreConfig::for_root(temp_dir.path())).unwrap();
        (temp_dir, storage)
    }

    fn add(storage: &mut Storage, task: NewTask) -> TaskId {
        storage.write(|tx| create(tx, &task, now())).unwrap()
    }

    fn claim(storage: &mut Storage, id: TaskId) {
        storage
            .write(|tx| {
                tx.execute(
                    "UPDATE tasks SET status = 'in_progress', started_at = ?1 WHERE id = ?2",
                    params![to_db_time(now()), id],
                )?;
                Ok(())
            })
            .unwrap();
    }

    fn status_of(storage: &Storage, id: TaskId) -> TaskStatus {
        storage
            .read(|tx| storage::fetch_task(tx, id))
            .unwrap()
            .unwrap()
            .status
    }

    #[test]
    fn test_create_dedups_prerequisites() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let a = add(&mut storage, NewTask::new("A", "d"));
        let b = add(&mut storage, NewTask::new("B", "d").depends_on([a, a, a]));
        let prerequisites = storage.read(|tx| graph::prerequisites_of(tx, b)).unwrap();
        assert_eq!(prerequisites, vec![a]);
    }

    #[test]
    fn test_create_with_unknown_prerequisite_writes_nothing() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let task = NewTask::new("Orphan", "d").depends_on([77]).tag("x");
        let err = storage.write(|tx| create(tx, &task, now())).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::UnknownDependency(77))
        ));

        let (tasks, tags): (i64, i64) = storage
            .read(|tx| {
                Ok((
                    tx.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?,
                    tx.query_row("SELECT COUNT(*) FROM task_tags", [], |row| row.get(0))?,
                ))
            })
            .unwrap();
        assert_eq!((tasks, tags), (0, 0));
    }

    #[test]
    fn test_complete_requires_in_progress() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let id = add(&mut storage, NewTask::new("A", "d"));

        let outcome = storage.write(|tx| complete(tx, id, "done", now())).unwrap();
        assert_eq!(
            outcome,
            Outcome::NotApplicable {
                id,
                status: Some(TaskStatus::Pending)
            }
        );

        claim(&mut storage, id);
        let task = storage
            .write(|tx| complete(tx, id, "done", now()))
            .unwrap()
            .applied()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result.as_deref(), Some("done"));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_complete_missing_task_not_applicable() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let outcome = storage.write(|tx| complete(tx, 404, "x", now())).unwrap();
        assert_eq!(outcome, Outcome::NotApplicable { id: 404, status: None });
    }

    #[test]
    fn test_fail_counts_retries_then_fails() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let id = add(&mut storage, NewTask::new("Flaky", "d").max_retries(1));

        claim(&mut storage, id);
        let task = storage.write(|tx| fail(tx, id, "boom", now())).unwrap().applied().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 1);
        assert_eq!(task.error.as_deref(), Some("boom"));
        assert!(task.completed_at.is_none());

        claim(&mut storage, id);
        let task = storage.write(|tx| fail(tx, id, "boom again", now())).unwrap().applied().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retries, 1);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_fail_missing_task() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let outcome = storage.write(|tx| fail(tx, 5, "x", now())).unwrap();
        assert_eq!(outcome, Outcome::NotFound(5));
    }

    #[test]
    fn test_permanent_failure_cascades() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let a = add(&mut storage, NewTask::new("A", "d").max_retries(0));
        let b = add(&mut storage, NewTask::new("B", "d").depends_on([a]));

        claim(&mut storage, a);
        storage.write(|tx| fail(tx, a, "fatal", now())).unwrap();
        assert_eq!(status_of(&storage, a), TaskStatus::Failed);
        assert_eq!(status_of(&storage, b), TaskStatus::Cancelled);
    }

    #[test]
    fn test_retry_resets_failed_task() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let id = add(&mut storage, NewTask::new("A", "d").max_retries(0));
        claim(&mut storage, id);
        storage.write(|tx| fail(tx, id, "fatal", now())).unwrap();

        let task = storage.write(|tx| retry(tx, id, now())).unwrap().applied().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 0);
        assert!(task.error.is_none());
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());

        let again = storage.write(|tx| retry(tx, id, now())).unwrap();
        assert!(!again.is_applied());
    }

    #[test]
    fn test_cancel_reports_cascade() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let a = add(&mut storage, NewTask::new("A", "d"));
        let b = add(&mut storage, NewTask::new("B", "d").depends_on([a]));
        let c = add(&mut storage, NewTask::new("C", "d").depends_on([b]));

        let cancellation = storage.write(|tx| cancel(tx, a, now())).unwrap().applied().unwrap();
        assert_eq!(cancellation.task.status, TaskStatus::Cancelled);
        assert_eq!(cancellation.cascaded, vec![b, c]);

        let again = storage.write(|tx| cancel(tx, a, now())).unwrap();
        assert_eq!(
            again,
            Outcome::NotApplicable {
                id: a,
                status: Some(TaskStatus::Cancelled)
            }
        );
    }

    #[test]
    fn test_update_only_pending() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let id = add(&mut storage, NewTask::new("Old", "desc").priority(1));

        let edit = TaskUpdate::new().title("New").priority(9);
        let task = storage.write(|tx| update(tx, id, &edit, now())).unwrap().applied().unwrap();
        assert_eq!(task.title, "New");
        assert_eq!(task.description, "desc");
        assert_eq!(task.priority, 9);
        assert!(task.updated_at >= task.created_at);

        claim(&mut storage, id);
        let outcome = storage.write(|tx| update(tx, id, &edit, now())).unwrap();
        assert!(matches!(outcome, Outcome::NotApplicable { .. }));
    }

    #[test]
    fn test_tags_on_missing_task() {
        let (_temp_dir, mut storage) = setup_test_storage();
        assert_eq!(storage.write(|tx| add_tag(tx, 3, "x")).unwrap(), Outcome::NotFound(3));
        assert_eq!(storage.write(|tx| remove_tag(tx, 3, "x")).unwrap(), Outcome::NotFound(3));
    }

    #[test]
    fn test_tag_add_and_remove_idempotent() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let id = add(&mut storage, NewTask::new("A", "d"));

        for _ in 0..2 {
            assert!(storage.write(|tx| add_tag(tx, id, "backend")).unwrap().is_applied());
        }
        assert_eq!(storage.read(|tx| storage::tags_for(tx, id)).unwrap(), vec!["backend"]);

        for _ in 0..2 {
            assert!(storage.write(|tx| remove_tag(tx, id, "backend")).unwrap().is_applied());
        }
        assert!(storage.read(|tx| storage::tags_for(tx, id)).unwrap().is_empty());
    }
}
