//! Shared test infrastructure for Initiative integration tests.
//!
//! Provides TestEnv helper for consistent test setup/teardown.

#![allow(dead_code)]

use chrono::{Duration, SecondsFormat, Utc};
use initiative::{NewTask, Store, Task, TaskFilter, TaskId, TaskStatus};
use rusqlite::{Connection, params};
use std::path::Path;
use tempfile::TempDir;

/// Test environment with automatic cleanup.
pub struct TestEnv {
    pub temp_dir: TempDir,
    pub store: Store,
}

impl TestEnv {
    /// Create a new test environment with an initialized store.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = Store::init(temp_dir.path()).expect("Failed to init store");
        Self { temp_dir, store }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Open a second store handle on the same database, as another worker would.
    pub fn open_worker(&self) -> Store {
        Store::open(self.root()).expect("Failed to open store")
    }

    /// Add a task with default priority and no prerequisites.
    pub fn add(&mut self, title: &str) -> TaskId {
        self.add_task(NewTask::new(title, "test task"))
    }

    pub fn add_with_priority(&mut self, title: &str, priority: i64) -> TaskId {
        self.add_task(NewTask::new(title, "test task").priority(priority))
    }

    /// Add a task depending on `after`.
    pub fn add_after(&mut self, title: &str, after: &[TaskId]) -> TaskId {
        self.add_task(NewTask::new(title, "test task").depends_on(after.iter().copied()))
    }

    pub fn add_task(&mut self, task: NewTask) -> TaskId {
        self.store.create_task(task).expect("Failed to create task")
    }

    pub fn get(&self, id: TaskId) -> Task {
        self.store
            .get_task(id)
            .expect("Failed to get task")
            .expect("Task should exist")
    }

    pub fn status_of(&self, id: TaskId) -> TaskStatus {
        self.get(id).status
    }

    /// Claim the next task, asserting it is `id`.
    pub fn claim(&mut self, id: TaskId) -> Task {
        let task = self
            .store
            .claim_next()
            .expect("Failed to claim")
            .expect("Expected a claimable task");
        assert_eq!(task.id, id, "Claimed an unexpected task");
        task
    }

    /// Claim then complete `id`.
    pub fn finish(&mut self, id: TaskId) -> Task {
        self.claim(id);
        self.store
            .complete(id, "done")
            .expect("Failed to complete")
            .applied()
            .expect("Completion should apply")
    }

    /// Claim then fail `id`.
    pub fn claim_and_fail(&mut self, id: TaskId, error: &str) -> Task {
        self.claim(id);
        self.store
            .fail(id, error)
            .expect("Failed to fail")
            .applied()
            .expect("Failure should apply")
    }

    /// Rewrite `updated_at` of a task to `minutes` ago.
    pub fn backdate(&self, id: TaskId, minutes: i64) {
        let conn = Connection::open(self.store.db_path()).expect("Failed to open raw connection");
        let ts = (Utc::now() - Duration::minutes(minutes)).to_rfc3339_opts(SecondsFormat::Micros, true);
        conn.execute("UPDATE tasks SET updated_at = ?1 WHERE id = ?2", params![ts, id])
            .expect("Failed to backdate task");
    }

    /// Number of dependency edges stored.
    pub fn edge_count(&self) -> i64 {
        let conn = Connection::open(self.store.db_path()).expect("Failed to open raw connection");
        conn.query_row("SELECT COUNT(*) FROM task_dependencies", [], |row| row.get(0))
            .expect("Failed to count edges")
    }

    /// Assert that a task is ready to claim.
    pub fn assert_ready(&self, id: TaskId) {
        let ready = self.store.ready().expect("Failed to get ready tasks");
        assert!(
            ready.iter().any(|t| t.id == id),
            "Expected task {} to be ready, but it wasn't. Ready tasks: {:?}",
            id,
            ready.iter().map(|t| t.id).collect::<Vec<_>>()
        );
    }

    /// Assert that a task is NOT ready to claim.
    pub fn assert_not_ready(&self, id: TaskId) {
        let ready = self.store.ready().expect("Failed to get ready tasks");
        assert!(
            !ready.iter().any(|t| t.id == id),
            "Expected task {} to NOT be ready, but it was",
            id
        );
    }

    pub fn ready_count(&self) -> usize {
        self.store.ready().expect("Failed to get ready tasks").len()
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.store
            .list_tasks(&TaskFilter::new().status(status))
            .expect("Failed to list tasks")
            .total
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
