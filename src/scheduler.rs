//! Scheduler: claim the next ready task, and recover abandoned claims.
//!
//! Both operations expect to run inside an immediate transaction so the
//! selecting read already holds the write lock.

use crate::graph::HAS_UNMET_PREREQUISITE;
use crate::storage::{self, TASK_COLUMNS, row_to_task, to_db_time};
use crate::types::{Task, TaskId, TaskStatus};
use chrono::{DateTime, Duration, Utc};
use eyre::Result;
use rusqlite::{Connection, OptionalExtension, params};

/// Claim the ready task with the highest priority, oldest first among equals.
/// Returns the row as read before the claim with the new status and times.
pub(crate) fn claim_next(conn: &Connection, now: DateTime<Utc>) -> Result<Option<Task>> {
    let sql = format!(
        r#"
        SELECT {} FROM tasks t
        WHERE t.status = 'pending' AND NOT {}
        ORDER BY t.priority DESC, t.created_at ASC, t.id ASC
        LIMIT 1
        "#,
        TASK_COLUMNS, HAS_UNMET_PREREQUISITE
    );
    let Some(mut task) = conn.query_row(&sql, [], row_to_task).optional()? else {
        return Ok(None);
    };

    let claimed = conn.execute(
        "UPDATE tasks SET status = 'in_progress', started_at = ?1, updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
        params![to_db_time(now), task.id],
    )?;
    if claimed != 1 {
        eyre::bail!("Task {} changed status while being claimed", task.id);
    }

    task.status = TaskStatus::InProgress;
    task.started_at = Some(now);
    task.updated_at = now;
    storage::hydrate(conn, std::slice::from_mut(&mut task))?;
    Ok(Some(task))
}

/// Reset in-progress tasks last touched before `now - timeout` to pending.
/// Returns the recovered ids.
pub(crate) fn recover_stale(conn: &Connection, timeout: Duration, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
    let Some(cutoff) = now.checked_sub_signed(timeout) else {
        return Ok(Vec::new());
    };
    let cutoff = to_db_time(cutoff);

    let mut stmt = conn.prepare("SELECT id FROM tasks WHERE status = 'in_progress' AND updated_at < ?1 ORDER BY id")?;
    let ids = stmt
        .query_map(params![cutoff], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<TaskId>>>()?;
    if ids.is_empty() {
        return Ok(ids);
    }

    conn.execute(
        r#"
        UPDATE tasks SET status = 'pending', started_at = NULL, updated_at = ?1
        WHERE status = 'in_progress' AND updated_at < ?2
        "#,
        params![to_db_time(now), cutoff],
    )?;
    Ok(ids)
}
