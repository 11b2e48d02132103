//! Initiative CLI - a durable multi-worker task queue.

use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use initiative::{
    Client, Daemon, DaemonConfig, FileConfig, NewTask, Outcome, Store, StoreConfig, Task, TaskFilter, TaskStatus,
    TaskUpdate, is_daemon_running, stdio,
};
use log::info;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

mod cli;

use cli::{Cli, Command};

fn setup_logging() -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("initiative")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("initiative.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn get_store_dir(cli: &Cli) -> PathBuf {
    cli.dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

fn load_config(cli: &Cli, root: &Path) -> Result<FileConfig> {
    match &cli.config {
        Some(path) => FileConfig::load(path),
        None => FileConfig::discover(root),
    }
}

fn store_config(cli: &Cli, root: &Path, file: &FileConfig) -> StoreConfig {
    let mut config = file.store_config(root);
    if let Some(db) = &cli.db {
        config.db_path = db.clone();
    }
    config
}

fn open_store(config: &StoreConfig) -> Result<Store> {
    if !config.db_path.exists() {
        bail!(
            "No database at {}. Run 'initiative init' first.",
            config.db_path.display()
        );
    }
    Store::with_config(config).context("Failed to open store")
}

fn format_status(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Pending => "pending".green(),
        TaskStatus::InProgress => "in_progress".yellow(),
        TaskStatus::Completed => "completed".blue(),
        TaskStatus::Failed => "failed".red(),
        TaskStatus::Cancelled => "cancelled".dimmed(),
    }
}

fn print_line(task: &Task) {
    let tags = if task.tags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", task.tags.join(", "))
    };
    println!(
        "{} {} P{} {}{}",
        format_status(task.status),
        task.id.to_string().cyan(),
        task.priority,
        task.title,
        tags.dimmed()
    );
}

fn print_task(task: &Task) {
    println!("{}: {}", "ID".bold(), task.id.to_string().cyan());
    println!("{}: {}", "Title".bold(), task.title);
    println!("{}: {}", "Status".bold(), format_status(task.status));
    println!("{}: P{}", "Priority".bold(), task.priority);
    println!("{}: {}/{}", "Retries".bold(), task.retries, task.max_retries);
    if !task.description.is_empty() {
        println!("{}: {}", "Description".bold(), task.description);
    }
    if !task.tags.is_empty() {
        println!("{}: {}", "Tags".bold(), task.tags.join(", "));
    }
    if !task.blocked_by.is_empty() {
        let ids: Vec<String> = task.blocked_by.iter().map(|id| id.to_string()).collect();
        println!("{}: {}", "Blocked by".bold(), ids.join(", "));
    }
    if let Some(result) = &task.result {
        println!("{}: {}", "Result".bold(), result);
    }
    if let Some(error) = &task.error {
        println!("{}: {}", "Error".bold(), error.red());
    }
    println!("{}: {}", "Created".bold(), task.created_at);
    println!("{}: {}", "Updated".bold(), task.updated_at);
    if let Some(started_at) = &task.started_at {
        println!("{}: {}", "Started".bold(), started_at);
    }
    if let Some(completed_at) = &task.completed_at {
        println!("{}: {}", "Finished".bold(), completed_at);
    }
}

/// Unwrap an applied outcome, or explain why nothing happened.
fn applied<T>(outcome: Outcome<T>, action: &str) -> Result<T> {
    match outcome {
        Outcome::Applied(value) => Ok(value),
        Outcome::NotApplicable {
            id,
            status: Some(status),
        } => bail!("Cannot {} task {}: it is {}", action, id, status),
        Outcome::NotApplicable { id, status: None } => bail!("Cannot {} task {}: no such task", action, id),
        Outcome::NotFound(id) => bail!("Task not found: {}", id),
    }
}

fn run(cli: Cli) -> Result<()> {
    let store_dir = get_store_dir(&cli);
    let file = load_config(&cli, &store_dir)?;
    let config = store_config(&cli, &store_dir, &file);

    match cli.command {
        Command::Init => {
            Store::with_config(&config).context("Failed to initialize store")?;
            println!("{} Initialized store at {}", "✓".green(), config.db_path.display());
        }

        Command::Add {
            title,
            description,
            priority,
            max_retries,
            after,
            tags,
        } => {
            let mut store = open_store(&config)?;
            let task = NewTask::new(title, description)
                .priority(priority)
                .max_retries(max_retries)
                .depends_on(after)
                .tags(tags);
            task.validate()?;

            let title = task.title.clone();
            let id = store.create_task(task).context("Failed to add task")?;
            println!("{} Added: {} {}", "✓".green(), id.to_string().cyan(), title);
        }

        Command::Get { id } => {
            let store = open_store(&config)?;
            match store.get_task(id).context("Failed to get task")? {
                Some(task) => print_task(&task),
                None => bail!("Task not found: {}", id),
            }
        }

        Command::Next => {
            let mut store = open_store(&config)?;
            match store.claim_next().context("Failed to claim task")? {
                Some(task) => {
                    println!("{} Claimed:", "→".blue());
                    print_task(&task);
                }
                None => println!("{}", "No tasks ready".dimmed()),
            }
        }

        Command::Complete { id, result } => {
            let mut store = open_store(&config)?;
            let task = applied(store.complete(id, &result)?, "complete")?;
            println!("{} Completed: {} {}", "✓".green(), task.id.to_string().cyan(), task.title);
        }

        Command::Fail { id, error } => {
            let mut store = open_store(&config)?;
            let task = applied(store.fail(id, &error)?, "fail")?;
            match task.status {
                TaskStatus::Pending => println!(
                    "{} Requeued: {} (retry {}/{})",
                    "↻".yellow(),
                    task.id.to_string().cyan(),
                    task.retries,
                    task.max_retries
                ),
                _ => println!("{} Failed: {} {}", "✗".red(), task.id.to_string().cyan(), task.title),
            }
        }

        Command::Retry { id } => {
            let mut store = open_store(&config)?;
            let task = applied(store.retry(id)?, "retry")?;
            println!("{} Requeued: {} {}", "↻".yellow(), task.id.to_string().cyan(), task.title);
        }

        Command::Cancel { id } => {
            let mut store = open_store(&config)?;
            let cancellation = applied(store.cancel(id)?, "cancel")?;
            println!("{} Cancelled: {}", "✓".green(), id.to_string().cyan());
            if !cancellation.cascaded.is_empty() {
                let ids: Vec<String> = cancellation.cascaded.iter().map(|id| id.to_string()).collect();
                println!("  {} Also cancelled: {}", "⊘".red(), ids.join(", "));
            }
        }

        Command::Update {
            id,
            title,
            description,
            priority,
        } => {
            let mut store = open_store(&config)?;
            let update = TaskUpdate {
                title,
                description,
                priority,
            };
            update.validate()?;
            let task = applied(store.update(id, &update)?, "update")?;
            println!("{} Updated: {} {}", "✓".green(), task.id.to_string().cyan(), task.title);
        }

        Command::Tag { id, tag } => {
            initiative::validate_tag(&tag)?;
            let mut store = open_store(&config)?;
            applied(store.add_tag(id, &tag)?, "tag")?;
            println!("{} Tagged {} with {}", "✓".green(), id.to_string().cyan(), tag);
        }

        Command::Untag { id, tag } => {
            let mut store = open_store(&config)?;
            applied(store.remove_tag(id, &tag)?, "untag")?;
            println!("{} Removed {} from {}", "✓".green(), tag, id.to_string().cyan());
        }

        Command::List {
            status,
            tag,
            limit,
            offset,
        } => {
            let store = open_store(&config)?;
            let filter = TaskFilter {
                status,
                tag,
                limit,
                offset,
            };
            filter.validate()?;
            let page = store.list_tasks(&filter).context("Failed to list tasks")?;

            if page.items.is_empty() {
                println!("{}", "No tasks found".dimmed());
            } else {
                for task in &page.items {
                    print_line(task);
                }
                println!("{}", format!("{} of {} task(s)", page.items.len(), page.total).dimmed());
            }
        }

        Command::Summary {
            status,
            tag,
            limit,
            offset,
        } => {
            let store = open_store(&config)?;
            let filter = TaskFilter {
                status,
                tag,
                limit,
                offset,
            };
            filter.validate()?;
            let page = store.summary(&filter).context("Failed to summarize tasks")?;
            for item in &page.items {
                println!(
                    "{} {} P{} {}",
                    format_status(item.status),
                    item.id.to_string().cyan(),
                    item.priority,
                    item.title
                );
            }
            println!("{}", format!("{} of {} task(s)", page.items.len(), page.total).dimmed());
        }

        Command::Status => {
            let store = open_store(&config)?;
            let status = store.status().context("Failed to read status")?;
            println!("{}: {}", "Total".bold(), status.total);
            for task_status in TaskStatus::ALL {
                println!("  {}: {}", format_status(task_status), status.count(task_status));
            }
            println!("{}: {} ready, {} blocked", "Pending".bold(), status.pending_ready, status.pending_blocked);
            if let Some(avg) = status.avg_completion_secs {
                println!("{}: {:.1}s", "Avg completion".bold(), avg);
            }
            println!("{}: {}", "Completed last hour".bold(), status.completed_last_hour);
            if let Some(age) = status.oldest_pending_age_secs {
                println!("{}: {}s", "Oldest pending".bold(), age);
            }
        }

        Command::Ready => {
            let store = open_store(&config)?;
            let tasks = store.ready().context("Failed to get ready tasks")?;

            if tasks.is_empty() {
                println!("{}", "No ready tasks".dimmed());
            } else {
                println!("{} {} task(s) ready to claim:", "→".blue(), tasks.len());
                for task in tasks {
                    println!("  {} P{} {}", task.id.to_string().cyan(), task.priority, task.title);
                }
            }
        }

        Command::Blocked => {
            let store = open_store(&config)?;
            let tasks = store.blocked().context("Failed to get blocked tasks")?;

            if tasks.is_empty() {
                println!("{}", "No blocked tasks".dimmed());
            } else {
                println!("{} {} task(s) blocked:", "⊘".red(), tasks.len());
                for task in tasks {
                    let ids: Vec<String> = task.blocked_by.iter().map(|id| id.to_string()).collect();
                    println!(
                        "  {} P{} {} {}",
                        task.id.to_string().cyan(),
                        task.priority,
                        task.title,
                        format!("(waiting on {})", ids.join(", ")).dimmed()
                    );
                }
            }
        }

        Command::Recover { timeout_secs } => {
            let mut store = open_store(&config)?;
            let timeout = timeout_secs
                .map(std::time::Duration::from_secs)
                .unwrap_or_else(|| file.stale_timeout());
            let count = store.recover_stale(timeout).context("Failed to recover stale tasks")?;
            println!("{} Recovered {} stale task(s)", "✓".green(), count);
        }

        Command::Serve => {
            let mut store = open_store(&config)?;
            let stdin = io::stdin();
            let handled = stdio::serve(&mut store, stdin.lock(), io::stdout().lock())?;
            info!("Stdio session ended after {} request(s)", handled);
        }

        Command::Daemon => {
            println!("{} Starting daemon for {}", "→".blue(), store_dir.display());

            let mut daemon_config = DaemonConfig::from_file(&store_dir, &file);
            daemon_config.store = config;
            let mut daemon = Daemon::new(daemon_config).context("Failed to create daemon")?;

            let rt = tokio::runtime::Runtime::new().context("Failed to create runtime")?;
            rt.block_on(async { daemon.run().await }).context("Daemon error")?;
        }

        Command::DaemonStop => {
            if !is_daemon_running(&store_dir) {
                println!("{} Daemon is not running", "✗".red());
                std::process::exit(1);
            }

            let mut client = Client::connect(&store_dir, false).context("Failed to connect to daemon")?;
            client.shutdown().context("Failed to shutdown daemon")?;
            println!("{} Daemon stopped", "✓".green());
        }

        Command::DaemonStatus => {
            if is_daemon_running(&store_dir) {
                println!("{} Daemon is running", "✓".green());

                if let Ok(mut client) = Client::connect(&store_dir, false)
                    && client.ping().is_ok()
                {
                    println!("  {} Responding to requests", "✓".green());
                }
            } else {
                println!("{} Daemon is not running", "✗".red());
            }
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    info!("Command: {:?}", std::env::args().collect::<Vec<_>>());

    if let Err(e) = run(cli) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
