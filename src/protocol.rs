//! Line-delimited JSON protocol shared by the daemon and the stdio server.

use crate::store::{Outcome, Store, is_retryable};
use crate::types::{
    DEFAULT_MAX_RETRIES, DEFAULT_PAGE_LIMIT, NewTask, QueueStatus, Task, TaskFilter, TaskId, TaskStatus, TaskSummary,
    TaskUpdate, ValidationError, validate_tag,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_limit() -> usize {
    DEFAULT_PAGE_LIMIT
}

/// Request sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Create a pending task.
    CreateTask {
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        priority: i64,
        #[serde(default = "default_max_retries")]
        max_retries: u32,
        #[serde(default)]
        depends_on: Vec<TaskId>,
        #[serde(default)]
        tags: Vec<String>,
    },

    /// Get a task by ID.
    GetTask { id: TaskId },

    /// Claim the next ready task.
    ClaimNext,

    Complete { id: TaskId, result: String },

    Fail { id: TaskId, error: String },

    Retry { id: TaskId },

    Cancel { id: TaskId },

    /// Edit a pending task.
    Update {
        id: TaskId,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        priority: Option<i64>,
    },

    AddTag { id: TaskId, tag: String },

    RemoveTag { id: TaskId, tag: String },

    /// Paginated full listing.
    ListTasks {
        #[serde(default)]
        status: Option<TaskStatus>,
        #[serde(default)]
        tag: Option<String>,
        #[serde(default = "default_limit")]
        limit: usize,
        #[serde(default)]
        offset: usize,
    },

    /// Paginated id/title/status/priority listing.
    Summary {
        #[serde(default)]
        status: Option<TaskStatus>,
        #[serde(default)]
        tag: Option<String>,
        #[serde(default = "default_limit")]
        limit: usize,
        #[serde(default)]
        offset: usize,
    },

    /// Aggregate queue status.
    Status,

    /// Claimable tasks.
    Ready,

    /// Pending tasks with unmet prerequisites.
    Blocked,

    /// Return claims idle longer than `timeout_secs` to pending.
    RecoverStale { timeout_secs: u64 },

    /// Ping to check if the server is alive.
    Ping,

    /// Stop the server.
    Shutdown,
}

/// Response sent back to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Created { id: TaskId },

    Task { task: Task },

    /// A page of tasks, or a full set when `total` equals the item count.
    Tasks { tasks: Vec<Task>, total: usize },

    Summaries { items: Vec<TaskSummary>, total: usize },

    Status { status: QueueStatus },

    Cancelled { task: Task, cascaded: Vec<TaskId> },

    Recovered { count: usize },

    /// Nothing is ready to claim.
    NoTask,

    NotFound { id: TaskId },

    /// The task's status does not permit the operation. `status` is absent
    /// when `complete` names a missing task.
    NotApplicable {
        id: TaskId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<TaskStatus>,
    },

    /// Operation succeeded.
    Ok,

    /// Pong response to ping.
    Pong,

    /// Error response. `retryable` marks transient storage conditions.
    Error { message: String, retryable: bool },
}

impl Response {
    /// Create a non-retryable error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            retryable: false,
        }
    }

    fn failure(err: eyre::Report) -> Self {
        log::warn!("Request failed: {:#}", err);
        Self::Error {
            message: err.to_string(),
            retryable: is_retryable(&err),
        }
    }

    fn invalid(err: ValidationError) -> Self {
        log::debug!("Request rejected: {}", err);
        Self::error(err.to_string())
    }

    fn from_outcome<T>(outcome: Outcome<T>, applied: impl FnOnce(T) -> Response) -> Self {
        match outcome {
            Outcome::Applied(value) => applied(value),
            Outcome::NotApplicable { id, status } => Response::NotApplicable { id, status },
            Outcome::NotFound(id) => Response::NotFound { id },
        }
    }
}

fn filter(status: Option<TaskStatus>, tag: Option<String>, limit: usize, offset: usize) -> TaskFilter {
    TaskFilter {
        status,
        tag,
        limit,
        offset,
    }
}

/// Execute one request against `store`. `Shutdown` is acknowledged here; the
/// transport decides what stopping means.
pub fn dispatch(store: &mut Store, request: Request) -> Response {
    match request {
        Request::CreateTask {
            title,
            description,
            priority,
            max_retries,
            depends_on,
            tags,
        } => {
            let task = NewTask::new(title, description)
                .priority(priority)
                .max_retries(max_retries)
                .depends_on(depends_on)
                .tags(tags);
            if let Err(e) = task.validate() {
                return Response::invalid(e);
            }
            match store.create_task(task) {
                Ok(id) => Response::Created { id },
                Err(e) => Response::failure(e),
            }
        }

        Request::GetTask { id } => match store.get_task(id) {
            Ok(Some(task)) => Response::Task { task },
            Ok(None) => Response::NotFound { id },
            Err(e) => Response::failure(e),
        },

        Request::ClaimNext => match store.claim_next() {
            Ok(Some(task)) => Response::Task { task },
            Ok(None) => Response::NoTask,
            Err(e) => Response::failure(e),
        },

        Request::Complete { id, result } => match store.complete(id, &result) {
            Ok(outcome) => Response::from_outcome(outcome, |task| Response::Task { task }),
            Err(e) => Response::failure(e),
        },

        Request::Fail { id, error } => match store.fail(id, &error) {
            Ok(outcome) => Response::from_outcome(outcome, |task| Response::Task { task }),
            Err(e) => Response::failure(e),
        },

        Request::Retry { id } => match store.retry(id) {
            Ok(outcome) => Response::from_outcome(outcome, |task| Response::Task { task }),
            Err(e) => Response::failure(e),
        },

        Request::Cancel { id } => match store.cancel(id) {
            Ok(outcome) => Response::from_outcome(outcome, |c| Response::Cancelled {
                task: c.task,
                cascaded: c.cascaded,
            }),
            Err(e) => Response::failure(e),
        },

        Request::Update {
            id,
            title,
            description,
            priority,
        } => {
            let update = TaskUpdate {
                title,
                description,
                priority,
            };
            if let Err(e) = update.validate() {
                return Response::invalid(e);
            }
            match store.update(id, &update) {
                Ok(outcome) => Response::from_outcome(outcome, |task| Response::Task { task }),
                Err(e) => Response::failure(e),
            }
        }

        Request::AddTag { id, tag } => {
            if let Err(e) = validate_tag(&tag) {
                return Response::invalid(e);
            }
            match store.add_tag(id, &tag) {
                Ok(outcome) => Response::from_outcome(outcome, |()| Response::Ok),
                Err(e) => Response::failure(e),
            }
        }

        Request::RemoveTag { id, tag } => {
            if let Err(e) = validate_tag(&tag) {
                return Response::invalid(e);
            }
            match store.remove_tag(id, &tag) {
                Ok(outcome) => Response::from_outcome(outcome, |()| Response::Ok),
                Err(e) => Response::failure(e),
            }
        }

        Request::ListTasks {
            status,
            tag,
            limit,
            offset,
        } => {
            let filter = filter(status, tag, limit, offset);
            if let Err(e) = filter.validate() {
                return Response::invalid(e);
            }
            match store.list_tasks(&filter) {
                Ok(page) => Response::Tasks {
                    tasks: page.items,
                    total: page.total,
                },
                Err(e) => Response::failure(e),
            }
        }

        Request::Summary {
            status,
            tag,
            limit,
            offset,
        } => {
            let filter = filter(status, tag, limit, offset);
            if let Err(e) = filter.validate() {
                return Response::invalid(e);
            }
            match store.summary(&filter) {
                Ok(page) => Response::Summaries {
                    items: page.items,
                    total: page.total,
                },
                Err(e) => Response::failure(e),
            }
        }

        Request::Status => match store.status() {
            Ok(status) => Response::Status { status },
            Err(e) => Response::failure(e),
        },

        Request::Ready => match store.ready() {
            Ok(tasks) => Response::Tasks {
                total: tasks.len(),
                tasks,
            },
            Err(e) => Response::failure(e),
        },

        Request::Blocked => match store.blocked() {
            Ok(tasks) => Response::Tasks {
                total: tasks.len(),
                tasks,
            },
            Err(e) => Response::failure(e),
        },

        Request::RecoverStale { timeout_secs } => match store.recover_stale(Duration::from_secs(timeout_secs)) {
            Ok(count) => Response::Recovered { count },
            Err(e) => Response::failure(e),
        },

        Request::Ping => Response::Pong,

        Request::Shutdown => Response::Ok,
    }
}
