//! Background daemon serving the queue over a Unix socket.
//!
//! The daemon provides:
//! - A single `Store` shared by every connected client, serialized through
//!   one request channel
//! - A periodic sweep that returns stale claims to the queue
//! - A PID file so other processes can find it

use crate::config::{DEFAULT_STALE_TIMEOUT_SECS, DEFAULT_SWEEP_INTERVAL_SECS, FileConfig, STORE_DIR, StoreConfig};
use crate::protocol::{Request, Response, dispatch};
use crate::store::Store;
use eyre::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::interval;

/// Socket file name within the .initiative directory.
const SOCKET_FILE: &str = "daemon.sock";

/// PID file name within the .initiative directory.
const PID_FILE: &str = "daemon.pid";

type RequestSender = mpsc::Sender<(Request, mpsc::Sender<Response>)>;

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Root directory containing .initiative
    pub root: PathBuf,

    /// Database the daemon serves
    pub store: StoreConfig,

    /// How often to sweep for stale claims
    pub sweep_interval: Duration,

    /// Claims idle this long are returned to pending
    pub stale_timeout: Duration,
}

impl DaemonConfig {
    /// Create config with default settings.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            store: StoreConfig::for_root(&root),
            root,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            stale_timeout: Duration::from_secs(DEFAULT_STALE_TIMEOUT_SECS),
        }
    }

    /// Create config from a loaded `initiative.yaml`.
    pub fn from_file(root: impl Into<PathBuf>, file: &FileConfig) -> Self {
        let root = root.into();
        Self {
            store: file.store_config(&root),
            root,
            sweep_interval: file.sweep_interval(),
            stale_timeout: file.stale_timeout(),
        }
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> PathBuf {
        self.root.join(STORE_DIR).join(SOCKET_FILE)
    }

    /// Get the PID file path.
    pub fn pid_path(&self) -> PathBuf {
        self.root.join(STORE_DIR).join(PID_FILE)
    }
}

/// The Initiative daemon.
pub struct Daemon {
    config: DaemonConfig,
    store: Store,
}

impl Daemon {
    /// Create a new daemon instance.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let store = Store::with_config(&config.store).context("Failed to open store")?;

        Ok(Self { config, store })
    }

    /// Run the daemon until a `Shutdown` request or Ctrl-C arrives.
    pub async fn run(&mut self) -> Result<()> {
        // Clean up any stale socket
        let socket_path = self.config.socket_path();
        if socket_path.exists() {
            fs::remove_file(&socket_path).ok();
        }

        let pid_path = self.config.pid_path();
        fs::write(&pid_path, std::process::id().to_string()).context("Failed to write PID file")?;

        let listener = UnixListener::bind(&socket_path).context("Failed to bind to Unix socket")?;
        log::info!("Daemon listening on {:?}", socket_path);

        let (tx, mut rx) = mpsc::channel::<(Request, mpsc::Sender<Response>)>(100);
        tokio::spawn(Self::accept_connections(listener, tx));

        let mut sweep = interval(self.config.sweep_interval);
        let mut shutdown = false;

        while !shutdown {
            tokio::select! {
                Some((request, response_tx)) = rx.recv() => {
                    shutdown = matches!(request, Request::Shutdown);
                    let response = dispatch(&mut self.store, request);
                    if response_tx.send(response).await.is_err() {
                        log::debug!("Client disconnected before its response was sent");
                    }
                }

                _ = sweep.tick() => self.sweep(),

                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupt received");
                    shutdown = true;
                }
            }
        }
        log::info!("Daemon shutting down");

        fs::remove_file(&socket_path).ok();
        fs::remove_file(&pid_path).ok();

        Ok(())
    }

    /// Return stale claims to the queue.
    fn sweep(&mut self) {
        match self.store.recover_stale(self.config.stale_timeout) {
            Ok(0) => log::debug!("Sweep found no stale claims"),
            Ok(count) => log::info!("Sweep recovered {} stale claim(s)", count),
            Err(e) => log::warn!("Stale sweep failed: {:#}", e),
        }
    }

    async fn accept_connections(listener: UnixListener, tx: RequestSender) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let tx_clone = tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, tx_clone).await {
                            log::warn!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single client connection, one request per line.
    async fn handle_connection(stream: UnixStream, tx: RequestSender) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await.context("Failed to read line")? {
            if line.trim().is_empty() {
                continue;
            }

            let request: Request = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(e) => {
                    let response = Response::error(format!("Invalid request: {}", e));
                    writer.write_all(encode(&response)?.as_bytes()).await?;
                    continue;
                }
            };
            let is_shutdown = matches!(request, Request::Shutdown);

            let (resp_tx, mut resp_rx) = mpsc::channel(1);
            tx.send((request, resp_tx))
                .await
                .context("Failed to send request to daemon")?;

            if let Some(response) = resp_rx.recv().await {
                writer.write_all(encode(&response)?.as_bytes()).await?;
                writer.flush().await?;
            }

            if is_shutdown {
                break;
            }
        }

        Ok(())
    }
}

fn encode(response: &Response) -> Result<String> {
    let mut json = serde_json::to_string(response)?;
    json.push('\n');
    Ok(json)
}

/// Check if a daemon is running for the given store path.
pub fn is_daemon_running(root: &Path) -> bool {
    let config = DaemonConfig::new(root);
    let socket_path = config.socket_path();
    let pid_path = config.pid_path();

    if !socket_path.exists() {
        return false;
    }

    if let Ok(pid_str) = fs::read_to_string(&pid_path)
        && let Ok(pid) = pid_str.trim().parse::<i32>()
    {
        // Signal 0 checks the process exists without signalling it
        unsafe {
            if libc::kill(pid, 0) == 0 {
                return true;
            }
        }
    }

    // Stale socket, clean up
    fs::remove_file(&socket_path).ok();
    fs::remove_file(&pid_path).ok();
    false
}

/// Start the daemon as a background process.
pub fn start_daemon(root: &Path) -> Result<()> {
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe().context("Failed to get current executable")?;

    Command::new(exe)
        .arg("--dir")
        .arg(root)
        .arg("daemon")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to spawn daemon process")?;

    std::thread::sleep(Duration::from_millis(100));

    Ok(())
}
