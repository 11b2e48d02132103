//! Client for connecting to the Initiative daemon.

use crate::daemon::{DaemonConfig, is_daemon_running, start_daemon};
use crate::protocol::{Request, Response};
use crate::store::{Cancellation, Outcome};
use crate::types::{NewTask, Page, QueueStatus, Task, TaskFilter, TaskId, TaskSummary, TaskUpdate};
use eyre::{Context, Result, bail};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client for communicating with the Initiative daemon.
pub struct Client {
    root: PathBuf,
    stream: UnixStream,
}

/// Map an unexpected response, including `Error`, to a report.
fn unexpected(response: Response) -> eyre::Report {
    match response {
        Response::Error { message, .. } => eyre::eyre!("{}", message),
        other => eyre::eyre!("Unexpected response: {:?}", other),
    }
}

/// Decode a guarded-transition response.
fn outcome<T>(response: Response, applied: impl FnOnce(Response) -> Result<T>) -> Result<Outcome<T>> {
    match response {
        Response::NotFound { id } => Ok(Outcome::NotFound(id)),
        Response::NotApplicable { id, status } => Ok(Outcome::NotApplicable { id, status }),
        Response::Error { .. } => Err(unexpected(response)),
        other => applied(other).map(Outcome::Applied),
    }
}

fn task(response: Response) -> Result<Task> {
    match response {
        Response::Task { task } => Ok(task),
        other => Err(unexpected(other)),
    }
}

fn ack(response: Response) -> Result<()> {
    match response {
        Response::Ok => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn tasks(response: Response) -> Result<Page<Task>> {
    match response {
        Response::Tasks { tasks, total } => Ok(Page { items: tasks, total }),
        other => Err(unexpected(other)),
    }
}

impl Client {
    /// Connect to the daemon, optionally auto-starting it if not running.
    pub fn connect(root: &Path, auto_start: bool) -> Result<Self> {
        let config = DaemonConfig::new(root);
        let socket_path = config.socket_path();

        let stream = match UnixStream::connect(&socket_path) {
            Ok(stream) => stream,
            Err(_) if auto_start => {
                if !is_daemon_running(root) {
                    start_daemon(root).context("Failed to auto-start daemon")?;

                    let mut attempts = 0;
                    loop {
                        if attempts > 20 {
                            bail!("Daemon failed to start in time");
                        }
                        std::thread::sleep(Duration::from_millis(50));
                        if let Ok(stream) = UnixStream::connect(&socket_path) {
                            break stream;
                        }
                        attempts += 1;
                    }
                } else {
                    UnixStream::connect(&socket_path).context("Failed to connect to daemon")?
                }
            }
            Err(e) => {
                bail!("Failed to connect to daemon: {}. Is it running?", e);
            }
        };

        stream
            .set_read_timeout(Some(Duration::from_secs(30)))
            .context("Failed to set read timeout")?;

        Ok(Self {
            root: root.to_path_buf(),
            stream,
        })
    }

    /// Get the store root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Send a request and read one response line. `None` when the daemon
    /// closed the connection first.
    fn send(&mut self, request: &Request) -> Result<Option<Response>> {
        let request_json = serde_json::to_string(request)?;
        writeln!(self.stream, "{}", request_json)?;
        self.stream.flush()?;

        let mut reader = BufReader::new(&self.stream);
        let mut response_line = String::new();
        if reader.read_line(&mut response_line)? == 0 {
            return Ok(None);
        }

        let response: Response = serde_json::from_str(&response_line).context("Failed to parse response")?;
        Ok(Some(response))
    }

    fn request(&mut self, request: Request) -> Result<Response> {
        match self.send(&request)? {
            Some(response) => Ok(response),
            None => bail!("Daemon closed the connection"),
        }
    }

    pub fn create_task(&mut self, new: NewTask) -> Result<TaskId> {
        let response = self.request(Request::CreateTask {
            title: new.title,
            description: new.description,
            priority: new.priority,
            max_retries: new.max_retries,
            depends_on: new.depends_on,
            tags: new.tags,
        })?;

        match response {
            Response::Created { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub fn get_task(&mut self, id: TaskId) -> Result<Option<Task>> {
        match self.request(Request::GetTask { id })? {
            Response::Task { task } => Ok(Some(task)),
            Response::NotFound { .. } => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    pub fn claim_next(&mut self) -> Result<Option<Task>> {
        match self.request(Request::ClaimNext)? {
            Response::Task { task } => Ok(Some(task)),
            Response::NoTask => Ok(None),
            other => Err(unexpected(other)),
        }
    }

    pub fn complete(&mut self, id: TaskId, result: &str) -> Result<Outcome<Task>> {
        let response = self.request(Request::Complete {
            id,
            result: result.to_string(),
        })?;
        outcome(response, task)
    }

    pub fn fail(&mut self, id: TaskId, error: &str) -> Result<Outcome<Task>> {
        let response = self.request(Request::Fail {
            id,
            error: error.to_string(),
        })?;
        outcome(response, task)
    }

    pub fn retry(&mut self, id: TaskId) -> Result<Outcome<Task>> {
        let response = self.request(Request::Retry { id })?;
        outcome(response, task)
    }

    pub fn cancel(&mut self, id: TaskId) -> Result<Outcome<Cancellation>> {
        let response = self.request(Request::Cancel { id })?;
        outcome(response, |response| match response {
            Response::Cancelled { task, cascaded } => Ok(Cancellation { task, cascaded }),
            other => Err(unexpected(other)),
        })
    }

    pub fn update(&mut self, id: TaskId, update: TaskUpdate) -> Result<Outcome<Task>> {
        let response = self.request(Request::Update {
            id,
            title: update.title,
            description: update.description,
            priority: update.priority,
        })?;
        outcome(response, task)
    }

    pub fn add_tag(&mut self, id: TaskId, tag: &str) -> Result<Outcome<()>> {
        let response = self.request(Request::AddTag {
            id,
            tag: tag.to_string(),
        })?;
        outcome(response, ack)
    }

    pub fn remove_tag(&mut self, id: TaskId, tag: &str) -> Result<Outcome<()>> {
        let response = self.request(Request::RemoveTag {
            id,
            tag: tag.to_string(),
        })?;
        outcome(response, ack)
    }

    pub fn list_tasks(&mut self, filter: &TaskFilter) -> Result<Page<Task>> {
        let response = self.request(Request::ListTasks {
            status: filter.status,
            tag: filter.tag.clone(),
            limit: filter.limit,
            offset: filter.offset,
        })?;
        tasks(response)
    }

    pub fn summary(&mut self, filter: &TaskFilter) -> Result<Page<TaskSummary>> {
        let response = self.request(Request::Summary {
            status: filter.status,
            tag: filter.tag.clone(),
            limit: filter.limit,
            offset: filter.offset,
        })?;

        match response {
            Response::Summaries { items, total } => Ok(Page { items, total }),
            other => Err(unexpected(other)),
        }
    }

    pub fn status(&mut self) -> Result<QueueStatus> {
        match self.request(Request::Status)? {
            Response::Status { status } => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub fn ready(&mut self) -> Result<Vec<Task>> {
        Ok(tasks(self.request(Request::Ready)?)?.items)
    }

    pub fn blocked(&mut self) -> Result<Vec<Task>> {
        Ok(tasks(self.request(Request::Blocked)?)?.items)
    }

    pub fn recover_stale(&mut self, timeout: Duration) -> Result<usize> {
        let response = self.request(Request::RecoverStale {
            timeout_secs: timeout.as_secs(),
        })?;

        match response {
            Response::Recovered { count } => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    /// Shutdown the daemon.
    pub fn shutdown(&mut self) -> Result<()> {
        match self.send(&Request::Shutdown)? {
            Some(response) => ack(response),
            None => {
                log::debug!("Daemon closed the connection while shutting down");
                Ok(())
            }
        }
    }

    /// Ping the daemon.
    pub fn ping(&mut self) -> Result<()> {
        match self.request(Request::Ping)? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}
