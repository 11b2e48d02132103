//! Read-only views: queue status, paginated listings, ready and blocked sets.

use crate::graph::HAS_UNMET_PREREQUISITE;
use crate::storage::{self, TASK_COLUMNS, optional_time_column, status_column, time_column, to_db_time};
use crate::types::{Page, QueueStatus, Task, TaskFilter, TaskStatus, TaskSummary};
use chrono::{DateTime, Duration, Utc};
use eyre::Result;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

/// Claim order, shared by every listing.
const CLAIM_ORDER: &str = "ORDER BY t.priority DESC, t.created_at ASC, t.id ASC";

/// Per-status counts and derived metrics at `now`.
pub(crate) fn status(conn: &Connection, now: DateTime<Utc>) -> Result<QueueStatus> {
    let mut status = QueueStatus::default();

    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
    let rows = stmt.query_map([], |row| Ok((status_column(row, 0)?, row.get::<_, i64>(1)?)))?;
    for row in rows {
        let (task_status, count) = row?;
        let count = count as usize;
        match task_status {
            TaskStatus::Pending => status.pending = count,
            TaskStatus::InProgress => status.in_progress = count,
            TaskStatus::Completed => status.completed = count,
            TaskStatus::Failed => status.failed = count,
            TaskStatus::Cancelled => status.cancelled = count,
        }
    }
    status.total = TaskStatus::ALL.iter().map(|s| status.count(*s)).sum();

    let ready: i64 = conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM tasks t WHERE t.status = 'pending' AND NOT {}",
            HAS_UNMET_PREREQUISITE
        ),
        [],
        |row| row.get(0),
    )?;
    status.pending_ready = ready as usize;
    status.pending_blocked = status.pending.saturating_sub(status.pending_ready);

    status.avg_completion_secs = avg_completion_secs(conn)?;

    let hour_ago = to_db_time(now - Duration::hours(1));
    let recent: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE status = 'completed' AND completed_at >= ?1",
        params![hour_ago],
        |row| row.get(0),
    )?;
    status.completed_last_hour = recent as usize;

    let oldest: Option<DateTime<Utc>> = conn
        .query_row(
            "SELECT created_at FROM tasks WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1",
            [],
            |row| time_column(row, 0),
        )
        .optional()?;
    status.oldest_pending_age_secs = oldest.map(|created| (now - created).num_seconds());

    Ok(status)
}

/// Mean seconds from claim to completion over completed tasks carrying both
/// timestamps.
fn avg_completion_secs(conn: &Connection) -> Result<Option<f64>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT started_at, completed_at FROM tasks
        WHERE status = 'completed' AND started_at IS NOT NULL AND completed_at IS NOT NULL
        "#,
    )?;
    let spans = stmt
        .query_map([], |row| Ok((optional_time_column(row, 0)?, optional_time_column(row, 1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let durations: Vec<f64> = spans
        .into_iter()
        .filter_map(|(started, completed)| Some((completed? - started?).num_microseconds()? as f64 / 1_000_000.0))
        .collect();
    if durations.is_empty() {
        return Ok(None);
    }
    Ok(Some(durations.iter().sum::<f64>() / durations.len() as f64))
}

/// `FROM ... WHERE ...` clause and bound values for a filter.
fn filter_clause(filter: &TaskFilter) -> (String, Vec<Value>) {
    let mut sql = String::from("FROM tasks t");
    let mut conditions = Vec::new();
    let mut values = Vec::new();

    if let Some(tag) = &filter.tag {
        sql.push_str(" JOIN task_tags tt ON tt.task_id = t.id");
        conditions.push("tt.tag = ?");
        values.push(Value::Text(tag.clone()));
    }
    if let Some(status) = filter.status {
        conditions.push("t.status = ?");
        values.push(Value::Text(status.as_str().to_string()));
    }
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    (sql, values)
}

/// Count matches and prepare the bound values for one page.
fn paginate(conn: &Connection, filter: &TaskFilter) -> Result<(String, Vec<Value>, usize)> {
    let (from, mut values) = filter_clause(filter);
    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) {}", from),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;
    values.push(Value::Integer(i64::try_from(filter.limit).unwrap_or(i64::MAX)));
    values.push(Value::Integer(i64::try_from(filter.offset).unwrap_or(i64::MAX)));
    Ok((from, values, total as usize))
}

pub(crate) fn list_tasks(conn: &Connection, filter: &TaskFilter) -> Result<Page<Task>> {
    let (from, values, total) = paginate(conn, filter)?;
    let sql = format!("SELECT {} {} {} LIMIT ? OFFSET ?", TASK_COLUMNS, from, CLAIM_ORDER);
    let items = storage::query_tasks(conn, &sql, params_from_iter(values.iter()))?;
    Ok(Page { items, total })
}

pub(crate) fn summary(conn: &Connection, filter: &TaskFilter) -> Result<Page<TaskSummary>> {
    let (from, values, total) = paginate(conn, filter)?;
    let sql = format!(
        "SELECT t.id, t.title, t.status, t.priority {} {} LIMIT ? OFFSET ?",
        from, CLAIM_ORDER
    );
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params_from_iter(values.iter()), |row| {
            Ok(TaskSummary {
                id: row.get(0)?,
                title: row.get(1)?,
                status: status_column(row, 2)?,
                priority: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Page { items, total })
}

/// Every claimable task, in claim order.
pub(crate) fn ready(conn: &Connection) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks t WHERE t.status = 'pending' AND NOT {} {}",
        TASK_COLUMNS, HAS_UNMET_PREREQUISITE, CLAIM_ORDER
    );
    storage::query_tasks(conn, &sql, [])
}

/// Pending tasks held back by at least one prerequisite.
pub(crate) fn blocked(conn: &Connection) -> Result<Vec<Task>> {
    let sql = format!(
        "SELECT {} FROM tasks t WHERE t.status = 'pending' AND {} {}",
        TASK_COLUMNS, HAS_UNMET_PREREQUISITE, CLAIM_ORDER
    );
    storage::query_tasks(conn, &sql, [])
}
