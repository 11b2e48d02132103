//! CLI argument parsing for Initiative.

use clap::{Parser, Subcommand};
use initiative::{TaskId, TaskStatus};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "initiative",
    about = "Durable multi-worker task queue with dependency ordering",
    version = env!("GIT_DESCRIBE"),
    after_help = "Logs are written to: ~/.local/share/initiative/logs/initiative.log"
)]
pub struct Cli {
    /// Directory holding the .initiative store (default: current directory)
    #[arg(short = 'd', long, global = true)]
    pub dir: Option<PathBuf>,

    /// Config file (default: <dir>/.initiative/initiative.yaml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file, overriding the config file
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Initialize a new store in the target directory
    Init,

    /// Add a task
    Add {
        /// Task title
        title: String,

        /// Description
        #[arg(short = 'D', long, default_value = "")]
        description: String,

        /// Priority (higher = more urgent)
        #[arg(short, long, default_value = "0", allow_negative_numbers = true)]
        priority: i64,

        /// Automatic retries before the task fails permanently
        #[arg(short = 'r', long, default_value = "2")]
        max_retries: u32,

        /// Prerequisite task IDs (comma-separated)
        #[arg(short = 'a', long, value_delimiter = ',')]
        after: Vec<TaskId>,

        /// Tags (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// Show a task
    Get {
        /// Task ID
        id: TaskId,
    },

    /// Claim the next ready task
    Next,

    /// Mark a claimed task completed
    Complete {
        /// Task ID
        id: TaskId,

        /// Result text
        #[arg(default_value = "")]
        result: String,
    },

    /// Report a claimed task as failed
    Fail {
        /// Task ID
        id: TaskId,

        /// Error text
        error: String,
    },

    /// Return a failed task to the queue
    Retry {
        /// Task ID
        id: TaskId,
    },

    /// Cancel a task and everything that depends on it
    Cancel {
        /// Task ID
        id: TaskId,
    },

    /// Edit a pending task
    Update {
        /// Task ID
        id: TaskId,

        /// New title
        #[arg(long)]
        title: Option<String>,

        /// New description
        #[arg(short = 'D', long)]
        description: Option<String>,

        /// New priority
        #[arg(short, long, allow_negative_numbers = true)]
        priority: Option<i64>,
    },

    /// Add a tag to a task
    Tag {
        /// Task ID
        id: TaskId,

        /// Tag
        tag: String,
    },

    /// Remove a tag from a task
    Untag {
        /// Task ID
        id: TaskId,

        /// Tag
        tag: String,
    },

    /// List tasks
    List {
        /// Filter by status (pending, in_progress, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Filter by tag
        #[arg(short, long)]
        tag: Option<String>,

        /// Page size
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Tasks to skip
        #[arg(short, long, default_value = "0")]
        offset: usize,
    },

    /// List id, title, status and priority only
    Summary {
        /// Filter by status
        #[arg(short, long)]
        status: Option<TaskStatus>,

        /// Filter by tag
        #[arg(short, long)]
        tag: Option<String>,

        /// Page size
        #[arg(short, long, default_value = "50")]
        limit: usize,

        /// Tasks to skip
        #[arg(short, long, default_value = "0")]
        offset: usize,
    },

    /// Show queue counts and metrics
    Status,

    /// Show tasks that are ready to claim
    Ready,

    /// Show pending tasks waiting on prerequisites
    Blocked,

    /// Return stale claims to the queue
    Recover {
        /// Idle seconds before a claim counts as stale (default: from config)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Serve the JSON protocol on stdin/stdout
    Serve,

    /// Run the daemon in foreground
    Daemon,

    /// Stop the running daemon
    DaemonStop,

    /// Check daemon status
    DaemonStatus,
}
