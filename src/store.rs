//! High-level store API for Initiative.
//!
//! A `Store` is the explicit handle every caller goes through. Each public
//! operation runs as one SQLite transaction; mutating operations take the
//! write lock before reading, so concurrent workers holding their own
//! `Store` on the same file serialize safely.

use crate::config::{DB_FILE, STORE_DIR, StoreConfig};
use crate::storage::{self, Storage};
use crate::types::{NewTask, Page, QueueStatus, Task, TaskFilter, TaskId, TaskStatus, TaskSummary, TaskUpdate};
use crate::{graph, lifecycle, report, scheduler};
use eyre::{Context, Result};
use rusqlite::{ErrorCode, Transaction};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Errors that can occur during store operations.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Referenced task does not exist.
    NotFound(TaskId),
    /// Operation not permitted from the task's current status.
    InvalidState { id: TaskId, status: TaskStatus },
    /// The named prerequisite would close a dependency cycle.
    CircularDependency(TaskId),
    /// The named prerequisite does not exist.
    UnknownDependency(TaskId),
    /// Durability layer failure. Only `retryable` failures are worth retrying.
    Storage { message: String, retryable: bool },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Storage { retryable: true, .. })
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "task not found: {}", id),
            StoreError::InvalidState { id, status } => {
                write!(f, "operation not applicable to task {} in status {}", id, status)
            }
            StoreError::CircularDependency(id) => {
                write!(f, "circular dependency detected: task {} would create a cycle", id)
            }
            StoreError::UnknownDependency(id) => write!(f, "unknown dependency: task {} does not exist", id),
            StoreError::Storage { message, retryable } => {
                if *retryable {
                    write!(f, "storage busy, retry later: {}", message)
                } else {
                    write!(f, "storage error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Whether a failed operation hit a transient storage condition.
pub fn is_retryable(report: &eyre::Report) -> bool {
    report
        .downcast_ref::<StoreError>()
        .is_some_and(StoreError::is_retryable)
}

/// Result of a guarded transition. `NotFound` and `NotApplicable` are routine
/// outcomes, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Applied(T),
    /// `status` is `None` when the task does not exist; `complete` reports a
    /// missing task this way.
    NotApplicable { id: TaskId, status: Option<TaskStatus> },
    NotFound(TaskId),
}

impl<T> Outcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Outcome::Applied(value) => Some(value),
            _ => None,
        }
    }

    /// Turn routine outcomes into `StoreError` for `?`-style callers.
    pub fn into_result(self) -> Result<T, StoreError> {
        match self {
            Outcome::Applied(value) => Ok(value),
            Outcome::NotApplicable {
                id,
                status: Some(status),
            } => Err(StoreError::InvalidState { id, status }),
            Outcome::NotApplicable { id, status: None } | Outcome::NotFound(id) => Err(StoreError::NotFound(id)),
        }
    }
}

/// A cancelled task and the dependents cancelled along with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Cancellation {
    pub task: Task,
    pub cascaded: Vec<TaskId>,
}

/// The main Initiative store.
pub struct Store {
    storage: Storage,
}

impl Store {
    /// Initialize a new store in `root/.initiative`.
    pub fn init(root: &Path) -> Result<Self> {
        fs::create_dir_all(root.join(STORE_DIR)).context("Failed to create .initiative directory")?;
        Self::with_config(&StoreConfig::for_root(root))
    }

    /// Open an existing store in `root/.initiative`.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.join(STORE_DIR).join(DB_FILE).exists() {
            eyre::bail!("No .initiative store found. Run 'initiative init' first.");
        }
        Self::with_config(&StoreConfig::for_root(root))
    }

    /// Open (creating if needed) the database named by `config`.
    pub fn with_config(config: &StoreConfig) -> Result<Self> {
        let storage = Storage::open(config).map_err(classify)?;
        log::debug!("Database connected: {}", storage.path().display());
        Ok(Self { storage })
    }

    /// Path of the underlying database file.
    pub fn db_path(&self) -> &Path {
        self.storage.path()
    }

    fn write<T>(&mut self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        self.storage.write(f).map_err(classify)
    }

    fn read<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        self.storage.read(f).map_err(classify)
    }

    /// Create a pending task. Rejects the whole call, writing nothing, when a
    /// prerequisite is unknown or would close a cycle.
    pub fn create_task(&mut self, task: NewTask) -> Result<TaskId> {
        let now = storage::now();
        let id = self.write(|tx| lifecycle::create(tx, &task, now))?;
        log::info!(
            "Task added: id={} title={:?} depends_on={:?} tags={:?}",
            id,
            task.title,
            task.depends_on,
            task.tags
        );
        Ok(id)
    }

    /// Get a task by ID.
    pub fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        self.read(|tx| storage::fetch_task(tx, id))
    }

    /// Claim the highest-priority ready task, oldest first among equals.
    pub fn claim_next(&mut self) -> Result<Option<Task>> {
        let now = storage::now();
        let task = self.write(|tx| scheduler::claim_next(tx, now))?;
        match &task {
            Some(task) => log::info!("Task started: id={} title={:?}", task.id, task.title),
            None => log::debug!("No pending tasks available"),
        }
        Ok(task)
    }

    /// Mark an in-progress task completed.
    pub fn complete(&mut self, id: TaskId, result: &str) -> Result<Outcome<Task>> {
        let now = storage::now();
        let outcome = self.write(|tx| lifecycle::complete(tx, id, result, now))?;
        log_outcome("complete", id, &outcome);
        Ok(outcome)
    }

    /// Record a failure of an in-progress task: back to pending while retries
    /// remain, otherwise permanently failed with dependents cancelled.
    pub fn fail(&mut self, id: TaskId, error: &str) -> Result<Outcome<Task>> {
        let now = storage::now();
        let outcome = self.write(|tx| lifecycle::fail(tx, id, error, now))?;
        if let Outcome::Applied(task) = &outcome {
            match task.status {
                TaskStatus::Pending => log::info!(
                    "Task auto-retried: id={} retries={}/{}",
                    id,
                    task.retries,
                    task.max_retries
                ),
                _ => log::info!("Task permanently failed: id={}", id),
            }
        } else {
            log_outcome("fail", id, &outcome);
        }
        Ok(outcome)
    }

    /// Manually return a failed task to pending with a fresh retry budget.
    pub fn retry(&mut self, id: TaskId) -> Result<Outcome<Task>> {
        let now = storage::now();
        let outcome = self.write(|tx| lifecycle::retry(tx, id, now))?;
        log_outcome("retry", id, &outcome);
        Ok(outcome)
    }

    /// Cancel a pending or in-progress task and its non-terminal dependents.
    pub fn cancel(&mut self, id: TaskId) -> Result<Outcome<Cancellation>> {
        let now = storage::now();
        let outcome = self.write(|tx| lifecycle::cancel(tx, id, now))?;
        log_outcome("cancel", id, &outcome);
        Ok(outcome)
    }

    /// Edit title, description, or priority of a pending task.
    pub fn update(&mut self, id: TaskId, update: &TaskUpdate) -> Result<Outcome<Task>> {
        let now = storage::now();
        let outcome = self.write(|tx| lifecycle::update(tx, id, update, now))?;
        log_outcome("update", id, &outcome);
        Ok(outcome)
    }

    /// Add a tag. Adding a tag the task already has is a no-op.
    pub fn add_tag(&mut self, id: TaskId, tag: &str) -> Result<Outcome<()>> {
        let outcome = self.write(|tx| lifecycle::add_tag(tx, id, tag))?;
        if outcome.is_applied() {
            log::info!("Tag added: task_id={} tag={:?}", id, tag);
        }
        Ok(outcome)
    }

    /// Remove a tag. Removing an absent tag is a no-op.
    pub fn remove_tag(&mut self, id: TaskId, tag: &str) -> Result<Outcome<()>> {
        let outcome = self.write(|tx| lifecycle::remove_tag(tx, id, tag))?;
        if outcome.is_applied() {
            log::info!("Tag removed: task_id={} tag={:?}", id, tag);
        }
        Ok(outcome)
    }

    /// Tags of a task, sorted. Empty for a missing task.
    pub fn tags(&self, id: TaskId) -> Result<Vec<String>> {
        self.read(|tx| storage::tags_for(tx, id))
    }

    /// Prerequisites of a task that have not completed.
    pub fn blocked_by(&self, id: TaskId) -> Result<Vec<TaskId>> {
        self.read(|tx| storage::blocked_by(tx, id))
    }

    /// Whether a task is pending with all prerequisites completed.
    pub fn is_ready(&self, id: TaskId) -> Result<bool> {
        self.read(|tx| graph::is_ready(tx, id))
    }

    /// Paginated task listing.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Page<Task>> {
        self.read(|tx| report::list_tasks(tx, filter))
    }

    /// Paginated id/title/status/priority listing.
    pub fn summary(&self, filter: &TaskFilter) -> Result<Page<TaskSummary>> {
        self.read(|tx| report::summary(tx, filter))
    }

    /// Aggregate counts and derived metrics.
    pub fn status(&self) -> Result<QueueStatus> {
        let now = storage::now();
        self.read(|tx| report::status(tx, now))
    }

    /// Claimable tasks in claim order.
    pub fn ready(&self) -> Result<Vec<Task>> {
        self.read(|tx| report::ready(tx))
    }

    /// Pending tasks waiting on at least one prerequisite.
    pub fn blocked(&self) -> Result<Vec<Task>> {
        self.read(|tx| report::blocked(tx))
    }

    /// Return in-progress tasks not touched within `timeout` to pending.
    pub fn recover_stale(&mut self, timeout: Duration) -> Result<usize> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let now = storage::now();
        let recovered = self.write(|tx| scheduler::recover_stale(tx, timeout, now))?;
        if !recovered.is_empty() {
            log::warn!("Recovered {} stale task(s): {:?}", recovered.len(), recovered);
        }
        Ok(recovered.len())
    }
}

fn log_outcome<T>(op: &str, id: TaskId, outcome: &Outcome<T>) {
    match outcome {
        Outcome::Applied(_) => log::info!("Task {}: id={}", op, id),
        Outcome::NotApplicable { status: Some(status), .. } => {
            log::debug!("Task {} not applicable: id={} status={}", op, id, status)
        }
        Outcome::NotApplicable { status: None, .. } => {
            log::debug!("Task {} not applicable, no such task: id={}", op, id)
        }
        Outcome::NotFound(_) => log::debug!("Task {} on missing task: id={}", op, id),
    }
}

/// Tag SQLite failures with `StoreError::Storage` so callers can tell
/// transient lock contention from everything else.
fn classify(report: eyre::Report) -> eyre::Report {
    if report.downcast_ref::<StoreError>().is_some() {
        return report;
    }
    let storage_error = report
        .chain()
        .find_map(|cause| cause.downcast_ref::<rusqlite::Error>())
        .map(|err| StoreError::Storage {
            message: err.to_string(),
            retryable: is_busy(err),
        });
    match storage_error {
        Some(err) => report.wrap_err(err),
        None => report,
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}
