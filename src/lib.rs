//! Initiative: a durable task queue for many independent workers.
//!
//! Workers pull tasks, report success or failure, and the queue enforces
//! priority order, dependency order, retries and cascading cancellation.
//! State lives in one SQLite database; every operation is one transaction.
//!
//! # Example
//!
//! ```no_run
//! use initiative::{NewTask, Store};
//! use std::path::Path;
//!
//! let mut store = Store::init(Path::new(".")).unwrap();
//!
//! let schema = store.create_task(NewTask::new("Design schema", "tables and indexes").priority(5)).unwrap();
//! let api = store
//!     .create_task(NewTask::new("Build API", "handlers").depends_on([schema]).tag("backend"))
//!     .unwrap();
//!
//! // Only the schema task is ready.
//! let task = store.claim_next().unwrap().unwrap();
//! assert_eq!(task.id, schema);
//!
//! store.complete(schema, "done").unwrap();
//! assert_eq!(store.claim_next().unwrap().unwrap().id, api);
//! ```

mod graph;
mod lifecycle;
mod report;
mod scheduler;
mod storage;
mod store;
mod types;

pub mod client;
pub mod config;
pub mod daemon;
pub mod protocol;
pub mod stdio;

// Re-export public API
pub use client::Client;
pub use config::{FileConfig, StoreConfig};
pub use daemon::{Daemon, DaemonConfig, is_daemon_running, start_daemon};
pub use protocol::{Request, Response, dispatch};
pub use storage::SCHEMA_VERSION;
pub use store::{Cancellation, Outcome, Store, StoreError, is_retryable};
pub use types::{
    NewTask, Page, QueueStatus, Task, TaskFilter, TaskId, TaskStatus, TaskSummary, TaskUpdate, ValidationError,
    validate_tag,
};
