//! Storage layer for Initiative: SQLite schema, migrations and row mapping.

use crate::config::StoreConfig;
use crate::types::{NewTask, Task, TaskId, TaskStatus};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use eyre::{Context, Result};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Params, Row, Transaction, TransactionBehavior, params, params_from_iter};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Schema level this binary writes. Bump together with `MIGRATIONS`.
pub const SCHEMA_VERSION: i64 = 3;

/// Ordered schema migrations; entry `n` upgrades level `n` to `n + 1`.
pub(crate) const MIGRATIONS: &[&str] = &[
    // v1: tasks, dependency edges, tags
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        description TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        priority INTEGER NOT NULL DEFAULT 0,
        worker_id TEXT,
        result TEXT,
        error TEXT,
        retries INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 2,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS task_dependencies (
        task_id INTEGER NOT NULL,
        depends_on_id INTEGER NOT NULL,
        PRIMARY KEY (task_id, depends_on_id),
        FOREIGN KEY (task_id) REFERENCES tasks(id),
        FOREIGN KEY (depends_on_id) REFERENCES tasks(id)
    );

    CREATE TABLE IF NOT EXISTS task_tags (
        task_id INTEGER NOT NULL,
        tag TEXT NOT NULL,
        PRIMARY KEY (task_id, tag),
        FOREIGN KEY (task_id) REFERENCES tasks(id)
    );
    "#,
    // v2: claim and finish timestamps
    r#"
    ALTER TABLE tasks ADD COLUMN started_at TEXT;
    ALTER TABLE tasks ADD COLUMN completed_at TEXT;
    "#,
    // v3: lookup indexes for the scheduler, cascades and tag filters
    r#"
    CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, priority DESC, created_at, id);
    CREATE INDEX IF NOT EXISTS idx_dependencies_target ON task_dependencies(depends_on_id);
    CREATE INDEX IF NOT EXISTS idx_tags_tag ON task_tags(tag);
    "#,
];

/// Task columns in `row_to_task` order. Queries alias `tasks` as `t`.
pub(crate) const TASK_COLUMNS: &str = "t.id, t.title, t.description, t.status, t.priority, t.worker_id, \
     t.result, t.error, t.retries, t.max_retries, t.started_at, t.completed_at, t.created_at, t.updated_at";

/// Max ids bound into one `IN (...)` list.
const HYDRATE_CHUNK: usize = 500;

/// Storage handle owning one SQLite connection.
pub struct Storage {
    path: PathBuf,
    db: Connection,
}

impl Storage {
    /// Open (creating if needed) the database and bring its schema up to date.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let db = Connection::open(&config.db_path)
            .with_context(|| format!("Failed to open SQLite database {}", config.db_path.display()))?;
        db.busy_timeout(config.busy_timeout)
            .context("Failed to set busy timeout")?;
        let mode: String = db
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .context("Failed to enable WAL journal")?;
        log::debug!("Journal mode for {}: {}", config.db_path.display(), mode);
        db.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;")
            .context("Failed to configure connection")?;

        let mut storage = Self {
            path: config.db_path.clone(),
            db,
        };
        storage.migrate()?;

        Ok(storage)
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply pending migrations under the write lock.
    fn migrate(&mut self) -> Result<()> {
        let tx = self
            .db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to lock database for migration")?;

        tx.execute_batch("CREATE TABLE IF NOT EXISTS meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);")
            .context("Failed to create meta table")?;

        let current = schema_version(&tx)?;
        if current > SCHEMA_VERSION {
            eyre::bail!(
                "Database schema v{} is newer than this binary supports (v{})",
                current,
                SCHEMA_VERSION
            );
        }

        for (level, sql) in MIGRATIONS.iter().enumerate().skip(current as usize) {
            tx.execute_batch(sql)
                .with_context(|| format!("Failed to apply schema migration v{}", level + 1))?;
            log::info!("Applied schema migration v{} to {}", level + 1, self.path.display());
        }

        if current != SCHEMA_VERSION {
            tx.execute(
                "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
                params![SCHEMA_VERSION.to_string()],
            )?;
        }

        tx.commit().context("Failed to commit migration")?;
        Ok(())
    }

    /// Run `f` in an immediate transaction: the write lock is taken before
    /// the first read, so concurrent writers serialize instead of racing.
    pub fn write<T>(&mut self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self
            .db
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("Failed to begin write transaction")?;
        let value = f(&tx)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(value)
    }

    /// Run `f` against one consistent read snapshot.
    pub fn read<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let tx = self
            .db
            .unchecked_transaction()
            .context("Failed to begin read transaction")?;
        let value = f(&tx)?;
        tx.commit().context("Failed to finish read transaction")?;
        Ok(value)
    }
}

/// Current schema level recorded in `meta`; 0 for a fresh or legacy file.
pub(crate) fn schema_version(conn: &Connection) -> Result<i64> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = 'schema_version'", [], |row| row.get(0))
        .optional()?;
    match value {
        Some(v) => v
            .parse()
            .with_context(|| format!("Corrupt schema_version marker: {}", v)),
        None => Ok(0),
    }
}

/// Current time at the precision the database keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so lexical order matches chronological order.
pub(crate) fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_time(idx, &s)
}

pub(crate) fn optional_time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| parse_time(idx, &s)).transpose()
}

pub(crate) fn status_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<TaskStatus> {
    let s: String = row.get(idx)?;
    s.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Convert a row selected with `TASK_COLUMNS`. Tags and `blocked_by` are
/// left empty for `hydrate`.
pub(crate) fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: status_column(row, 3)?,
        priority: row.get(4)?,
        worker_id: row.get(5)?,
        result: row.get(6)?,
        error: row.get(7)?,
        retries: row.get(8)?,
        max_retries: row.get(9)?,
        started_at: optional_time_column(row, 10)?,
        completed_at: optional_time_column(row, 11)?,
        created_at: time_column(row, 12)?,
        updated_at: time_column(row, 13)?,
        tags: vec![],
        blocked_by: vec![],
    })
}

/// Status and retry counters, enough to evaluate a transition guard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TaskState {
    pub status: TaskStatus,
    pub retries: u32,
    pub max_retries: u32,
}

pub(crate) fn fetch_state(conn: &Connection, id: TaskId) -> Result<Option<TaskState>> {
    let state = conn
        .query_row(
            "SELECT status, retries, max_retries FROM tasks WHERE id = ?1",
            params![id],
            |row| {
                Ok(TaskState {
                    status: status_column(row, 0)?,
                    retries: row.get(1)?,
                    max_retries: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(state)
}

pub(crate) fn task_exists(conn: &Connection, id: TaskId) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM tasks WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    Ok(found.is_some())
}

/// Fetch one fully hydrated task.
pub(crate) fn fetch_task(conn: &Connection, id: TaskId) -> Result<Option<Task>> {
    let sql = format!("SELECT {} FROM tasks t WHERE t.id = ?1", TASK_COLUMNS);
    let task = conn.query_row(&sql, params![id], row_to_task).optional()?;
    match task {
        Some(mut task) => {
            hydrate(conn, std::slice::from_mut(&mut task))?;
            Ok(Some(task))
        }
        None => Ok(None),
    }
}

/// Run a `TASK_COLUMNS` query and hydrate the results.
pub(crate) fn query_tasks<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let mut tasks = stmt
        .query_map(params, row_to_task)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    hydrate(conn, &mut tasks)?;
    Ok(tasks)
}

/// Fill tags and `blocked_by` for a batch of tasks with two queries per chunk.
pub(crate) fn hydrate(conn: &Connection, tasks: &mut [Task]) -> Result<()> {
    for chunk in tasks.chunks_mut(HYDRATE_CHUNK) {
        let ids: Vec<TaskId> = chunk.iter().map(|t| t.id).collect();
        let placeholders = vec!["?"; ids.len()].join(",");

        let mut tags: HashMap<TaskId, Vec<String>> = HashMap::new();
        let mut stmt = conn.prepare(&format!(
            "SELECT task_id, tag FROM task_tags WHERE task_id IN ({}) ORDER BY tag",
            placeholders
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            Ok((row.get::<_, TaskId>(0)?, row.get::<_, String>(1)?))
        })?;
        for row in rows {
            let (id, tag) = row?;
            tags.entry(id).or_default().push(tag);
        }

        let mut blocked: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT d.task_id, d.depends_on_id FROM task_dependencies d
            JOIN tasks dep ON dep.id = d.depends_on_id
            WHERE d.task_id IN ({}) AND dep.status != 'completed'
            ORDER BY d.depends_on_id
            "#,
            placeholders
        ))?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            Ok((row.get::<_, TaskId>(0)?, row.get::<_, TaskId>(1)?))
        })?;
        for row in rows {
            let (id, dep) = row?;
            blocked.entry(id).or_default().push(dep);
        }

        for task in chunk.iter_mut() {
            task.tags = tags.remove(&task.id).unwrap_or_default();
            task.blocked_by = blocked.remove(&task.id).unwrap_or_default();
        }
    }
    Ok(())
}

/// Insert a pending task row and return its id.
pub(crate) fn insert_task(conn: &Connection, task: &NewTask, now: DateTime<Utc>) -> Result<TaskId> {
    let ts = to_db_time(now);
    conn.execute(
        r#"
        INSERT INTO tasks (title, description, status, priority, max_retries, created_at, updated_at)
        VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?5)
        "#,
        params![task.title, task.description, task.priority, task.max_retries, ts],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn insert_edge(conn: &Connection, task_id: TaskId, depends_on_id: TaskId) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)",
        params![task_id, depends_on_id],
    )?;
    Ok(())
}

/// Returns false when the tag was already present.
pub(crate) fn insert_tag(conn: &Connection, task_id: TaskId, tag: &str) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO task_tags (task_id, tag) VALUES (?1, ?2)",
        params![task_id, tag],
    )?;
    Ok(changed > 0)
}

/// Returns false when the tag was not present.
pub(crate) fn delete_tag(conn: &Connection, task_id: TaskId, tag: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM task_tags WHERE task_id = ?1 AND tag = ?2",
        params![task_id, tag],
    )?;
    Ok(changed > 0)
}

pub(crate) fn tags_for(conn: &Connection, task_id: TaskId) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT tag FROM task_tags WHERE task_id = ?1 ORDER BY tag")?;
    let tags = stmt
        .query_map(params![task_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(tags)
}

/// Prerequisites of `task_id` that have not completed.
pub(crate) fn blocked_by(conn: &Connection, task_id: TaskId) -> Result<Vec<TaskId>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT d.depends_on_id FROM task_dependencies d
        JOIN tasks dep ON dep.id = d.depends_on_id
        WHERE d.task_id = ?1 AND dep.status != 'completed'
        ORDER BY d.depends_on_id
        "#,
    )?;
    let ids = stmt
        .query_map(params![task_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<TaskId>>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup_test_storage() -> (TempDir, Storage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(&StoreConfig::for_root(temp_dir.path())).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_open_creates_database() {
        let (temp_dir, storage) = setup_test_storage();
        assert!(storage.path().exists());
        assert!(temp_dir.path().join(crate::config::STORE_DIR).exists());

        let version = storage.read(|tx| schema_version(tx)).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::for_root(temp_dir.path());
        drop(Storage::open(&config).unwrap());
        let storage = Storage::open(&config).unwrap();
        assert_eq!(storage.read(|tx| schema_version(tx)).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_wal_enabled() {
        let (_temp_dir, storage) = setup_test_storage();
        let mode: String = storage
            .read(|tx| Ok(tx.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn test_migrates_legacy_layout_without_data_loss() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("legacy.db");

        // A database written before versioning: v1 tables, no meta marker.
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(MIGRATIONS[0]).unwrap();
            conn.execute(
                "INSERT INTO tasks (title, description, status, priority, created_at, updated_at)
                 VALUES ('Legacy', 'old row', 'pending', 4, '2026-01-01T00:00:00.123456+00:00', '2026-01-01T00:00:00.123456+00:00')",
                [],
            )
            .unwrap();
            conn.execute("INSERT INTO task_tags (task_id, tag) VALUES (1, 'old')", [])
                .unwrap();
        }

        let storage = Storage::open(&StoreConfig::new(&db_path)).unwrap();
        assert_eq!(storage.read(|tx| schema_version(tx)).unwrap(), SCHEMA_VERSION);

        let task = storage.read(|tx| fetch_task(tx, 1)).unwrap().unwrap();
        assert_eq!(task.title, "Legacy");
        assert_eq!(task.priority, 4);
        assert_eq!(task.tags, vec!["old"]);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn test_newer_schema_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::for_root(temp_dir.path());
        {
            let storage = Storage::open(&config).unwrap();
            drop(storage);
            let conn = Connection::open(&config.db_path).unwrap();
            conn.execute(
                "UPDATE meta SET value = ?1 WHERE key = 'schema_version'",
                params![(SCHEMA_VERSION + 1).to_string()],
            )
            .unwrap();
        }
        assert!(Storage::open(&config).is_err());
    }

    #[test]
    fn test_db_time_is_fixed_width() {
        let a = to_db_time(DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc));
        let b = to_db_time(
            DateTime::parse_from_rfc3339("2026-01-01T00:00:00.5Z")
                .unwrap()
                .with_timezone(&Utc),
        );
        assert_eq!(a, "2026-01-01T00:00:00.000000Z");
        assert_eq!(b, "2026-01-01T00:00:00.500000Z");
        assert!(a < b);
    }

    #[test]
    fn test_insert_and_fetch_task() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let now = now();

        let id = storage
            .write(|tx| {
                let id = insert_task(tx, &NewTask::new("Test task", "A test description").priority(5), now)?;
                insert_tag(tx, id, "test")?;
                insert_tag(tx, id, "example")?;
                Ok(id)
            })
            .unwrap();

        let task = storage.read(|tx| fetch_task(tx, id)).unwrap().unwrap();
        assert_eq!(task.title, "Test task");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 5);
        assert_eq!(task.created_at, now);
        assert_eq!(task.tags, vec!["example", "test"]);
    }

    #[test]
    fn test_tag_insert_is_idempotent() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let (first, second) = storage
            .write(|tx| {
                let id = insert_task(tx, &NewTask::new("t", "d"), now())?;
                Ok((insert_tag(tx, id, "dup")?, insert_tag(tx, id, "dup")?))
            })
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let (_temp_dir, mut storage) = setup_test_storage();
        let result: Result<()> = storage.write(|tx| {
            insert_task(tx, &NewTask::new("Doomed", "d"), now())?;
            eyre::bail!("abort");
        });
        assert!(result.is_err());

        let count: i64 = storage
            .read(|tx| Ok(tx.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(count, 0);
    }
}
