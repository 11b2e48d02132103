//! Core data types for the Initiative task queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier assigned by the store on creation. Never reused.
pub type TaskId = i64;

/// Automatic retries granted to a task unless the creator says otherwise.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Page size used when a listing does not ask for one.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

pub const MAX_TITLE_LEN: usize = 500;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;
pub const MIN_PRIORITY: i64 = -1_000;
pub const MAX_PRIORITY: i64 = 1_000;
pub const MAX_RETRIES_LIMIT: u32 = 100;
pub const MAX_TAGS: usize = 20;
pub const MAX_TAG_LEN: usize = 64;
pub const MAX_PAGE_LIMIT: usize = 500;

/// The unit of work tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,

    /// Short description of the work
    pub title: String,

    /// Longer description of what needs to be done
    pub description: String,

    /// Current lifecycle state
    pub status: TaskStatus,

    /// Higher = more urgent
    pub priority: i64,

    /// Claimant identity. Present in the schema, not written by any operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,

    /// Set on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Set on failure, cleared by manual retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Automatic retry attempts consumed
    pub retries: u32,

    /// Ceiling for automatic retries
    pub max_retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Sorted, distinct labels
    #[serde(default)]
    pub tags: Vec<String>,

    /// Prerequisites that have not reached `Completed`. Derived on read.
    #[serde(default)]
    pub blocked_by: Vec<TaskId>,
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    /// Name used on the wire and in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal for cascade purposes. `Failed` can still be retried by hand.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidStatus(s.to_string()))
    }
}

/// Id/title/status/priority projection of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskSummary {
    pub id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub priority: i64,
}

/// Parameters for creating a task.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub priority: i64,
    pub max_retries: u32,
    pub depends_on: Vec<TaskId>,
    pub tags: Vec<String>,
}

impl NewTask {
    /// Create a task request with the default priority, retry ceiling, and no edges or tags.
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            depends_on: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Declare prerequisites. Duplicates are ignored.
    pub fn depends_on(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.depends_on.extend(ids);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags.extend(tags.into_iter().map(|t| t.into()));
        self
    }

    /// Check the request-level limits applied by the protocol layer.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_title(&self.title)?;
        validate_description(&self.description)?;
        validate_priority(self.priority)?;
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ValidationError::MaxRetriesOutOfRange);
        }
        if self.tags.len() > MAX_TAGS {
            return Err(ValidationError::TooManyTags);
        }
        for tag in &self.tags {
            validate_tag(tag)?;
        }
        Ok(())
    }
}

/// Partial edit of a pending task. `None` leaves the field as is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

impl TaskUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(title) = &self.title {
            validate_title(title)?;
        }
        if let Some(description) = &self.description {
            validate_description(description)?;
        }
        if let Some(priority) = self.priority {
            validate_priority(priority)?;
        }
        Ok(())
    }
}

/// Listing filter with pagination.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub tag: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for TaskFilter {
    fn default() -> Self {
        Self {
            status: None,
            tag: None,
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.limit == 0 || self.limit > MAX_PAGE_LIMIT {
            return Err(ValidationError::InvalidLimit);
        }
        Ok(())
    }
}

/// One page of a listing plus the unpaginated match count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

/// Aggregate view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Pending tasks whose prerequisites have all completed
    pub pending_ready: usize,
    /// Pending tasks waiting on at least one prerequisite
    pub pending_blocked: usize,
    /// Mean claim-to-completion time over completed tasks
    pub avg_completion_secs: Option<f64>,
    pub completed_last_hour: usize,
    pub oldest_pending_age_secs: Option<i64>,
}

impl QueueStatus {
    pub fn count(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Cancelled => self.cancelled,
        }
    }
}

/// Request-level validation failures.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyTitle,
    TitleTooLong,
    InvalidCharacters,
    DescriptionTooLong,
    PriorityOutOfRange,
    MaxRetriesOutOfRange,
    TooManyTags,
    InvalidTag(String),
    InvalidLimit,
    InvalidStatus(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyTitle => write!(f, "title cannot be empty"),
            ValidationError::TitleTooLong => write!(f, "title exceeds {} characters", MAX_TITLE_LEN),
            ValidationError::InvalidCharacters => write!(f, "title contains control characters"),
            ValidationError::DescriptionTooLong => {
                write!(f, "description exceeds {} characters", MAX_DESCRIPTION_LEN)
            }
            ValidationError::PriorityOutOfRange => {
                write!(f, "priority must be between {} and {}", MIN_PRIORITY, MAX_PRIORITY)
            }
            ValidationError::MaxRetriesOutOfRange => {
                write!(f, "max_retries must be at most {}", MAX_RETRIES_LIMIT)
            }
            ValidationError::TooManyTags => write!(f, "a task may carry at most {} tags", MAX_TAGS),
            ValidationError::InvalidTag(tag) => write!(
                f,
                "invalid tag '{}': must be 1-{} alphanumeric characters, hyphens or underscores",
                tag, MAX_TAG_LEN
            ),
            ValidationError::InvalidLimit => write!(f, "limit must be between 1 and {}", MAX_PAGE_LIMIT),
            ValidationError::InvalidStatus(s) => write!(f, "unknown status '{}'", s),
        }
    }
}

impl std::error::Error for ValidationError {}

fn validate_title(title: &str) -> Result<(), ValidationError> {
    if title.trim().is_empty() {
        return Err(ValidationError::EmptyTitle);
    }
    if title.chars().count() > MAX_TITLE_LEN {
        return Err(ValidationError::TitleTooLong);
    }
    if title.chars().any(|c| c.is_control()) {
        return Err(ValidationError::InvalidCharacters);
    }
    Ok(())
}

fn validate_description(description: &str) -> Result<(), ValidationError> {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(ValidationError::DescriptionTooLong);
    }
    Ok(())
}

fn validate_priority(priority: i64) -> Result<(), ValidationError> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(ValidationError::PriorityOutOfRange);
    }
    Ok(())
}

/// Tags: alphanumeric + hyphens/underscores, no spaces.
pub fn validate_tag(tag: &str) -> Result<(), ValidationError> {
    let len = tag.chars().count();
    if len == 0 || len > MAX_TAG_LEN || !tag.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
        return Err(ValidationError::InvalidTag(tag.to_string()));
    }
    Ok(())
}
