//! Dev server supervision.
//!
//! A [`DevServer`] runs an instance's auxiliary long-running command (a web
//! server, a watcher) inside its own terminal session next to the agent's.
//!
//! ## State machine
//!
//! ```text
//! Stopped ──start──▶ Building ──▶ Starting ──▶ Running ──stop──▶ Stopped
//!    ▲                  │            │            │
//!    └───build failed───┘            │            └──session gone──▶ Crashed
//!    └────────launch timeout─────────┘                                 │
//!                                                    Building ◀─start──┘
//! ```

pub mod output;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use records::{DevServerConfig, DevServerRecord, DevServerStatus};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::oneshot;

pub use output::{OutputBuffer, MAX_OUTPUT_LINES};

use crate::session::{SessionError, SessionFactory, TerminalSession};

/// Lines of previous output replayed in a crash report.
const CRASH_TAIL_LINES: usize = 20;

/// Crash count at which the configuration warning is shown.
const CRASH_WARNING_THRESHOLD: u32 = 3;

/// Ctrl-C.
const INTERRUPT: &str = "\x03";

/// Errors raised by the dev server supervisor.
#[derive(Error, Debug)]
pub enum DevServerError {
    /// A start was requested while a previous one is still active.
    #[error("dev server is already running")]
    AlreadyRunning,

    /// No dev command has been configured.
    #[error("dev command not configured")]
    NotConfigured,

    /// The build command could not be launched.
    #[error("failed to run build command: {0}")]
    BuildSpawn(#[source] std::io::Error),

    /// The build command exited unsuccessfully.
    #[error("build failed with exit code {exit_code:?}")]
    BuildFailed {
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
    },

    /// The dev command's session could not be launched.
    #[error("failed to start dev server: {0}")]
    StartFailed(#[source] SessionError),

    /// The dev command's session never appeared.
    #[error("timed out waiting for dev server session {0}")]
    StartTimeout(String),

    /// Force-closing the session during stop failed.
    #[error("failed to stop dev server: {0}")]
    StopFailed(#[source] SessionError),

    /// Attaching needs a running server.
    #[error("dev server is not running (status: {0})")]
    NotRunning(DevServerStatus),

    /// The server is marked running but its session is gone.
    #[error("dev server session does not exist")]
    SessionMissing,

    /// Handing the terminal to the session failed.
    #[error("failed to attach to dev server: {0}")]
    AttachFailed(#[source] SessionError),
}

/// Timing knobs for start and stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevServerTimings {
    /// Time between Ctrl-C and force-closing the session.
    pub grace_period: Duration,
    /// Time a freshly launched session gets to appear.
    pub start_timeout: Duration,
}

impl Default for DevServerTimings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            start_timeout: Duration::from_secs(2),
        }
    }
}

/// What an instance needs from its dev server. Implemented by [`DevServer`];
/// tests substitute fakes.
#[async_trait]
pub trait DevServerControl: Send + Sync {
    /// Current status.
    fn status(&self) -> DevServerStatus;

    /// Commands the server runs.
    fn config(&self) -> &DevServerConfig;

    /// Crashes observed so far.
    fn crash_count(&self) -> u32;

    /// Buffered output, newline separated.
    fn output(&self) -> String;

    /// Shared handle on the output buffer for concurrent readers.
    fn output_buffer(&self) -> Arc<OutputBuffer>;

    /// Whether the server is launching or up.
    fn is_running(&self) -> bool {
        matches!(
            self.status(),
            DevServerStatus::Running | DevServerStatus::Starting
        )
    }

    /// Whether the session exists and shows any output.
    async fn session_exists(&self) -> bool;

    /// Appends newly captured lines to the output buffer.
    async fn update_output(&mut self);

    /// Captures output and reports whether anything new was appended.
    async fn has_updated(&mut self) -> bool;

    /// Builds and launches the dev command.
    async fn start(&mut self) -> Result<(), DevServerError>;

    /// Interrupts and tears down the dev command.
    async fn stop(&mut self) -> Result<(), DevServerError>;

    /// Detects a vanished session and records a crash.
    async fn check_health(&mut self);

    /// Hands the operator's terminal to the running server's session.
    async fn attach(&self) -> Result<oneshot::Receiver<()>, DevServerError>;

    /// Persisted form.
    fn to_record(&self) -> DevServerRecord {
        DevServerRecord {
            config: self.config().clone(),
            status: self.status(),
            crash_count: self.crash_count(),
        }
    }
}

/// Raw (unprefixed) session name for an instance's dev server.
pub fn dev_session_name(instance_title: &str) -> String {
    let name: String = instance_title
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '.' { '_' } else { c })
        .collect();
    format!("{name}_dev")
}

/// Quotes `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// The command line run inside the dev session: `sh -c '<K=V …> <command>'`.
pub fn dev_command_line(config: &DevServerConfig) -> String {
    let mut command = String::new();
    for (key, value) in &config.env {
        command.push_str(&format!("{key}={value} "));
    }
    command.push_str(&config.dev_command);
    format!("sh -c {}", shell_quote(&command))
}

/// Lines in `current` that follow the overlap with the end of `previous`.
fn unseen_lines<'a>(previous: &[String], current: &'a [String]) -> &'a [String] {
    let max = previous.len().min(current.len());
    for overlap in (1..=max).rev() {
        if previous[previous.len() - overlap..] == current[..overlap] {
            return &current[overlap..];
        }
    }
    current
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}

/// Supervises one dev command in its own terminal session.
pub struct DevServer {
    config: DevServerConfig,
    status: DevServerStatus,
    crash_count: u32,
    output: Arc<OutputBuffer>,
    session: Option<Box<dyn TerminalSession>>,
    sessions: Arc<dyn SessionFactory>,
    worktree_path: PathBuf,
    instance_title: String,
    timings: DevServerTimings,
    /// Non-blank lines of the last pane capture.
    last_capture: Vec<String>,
}

impl DevServer {
    /// Creates a stopped dev server for the instance `instance_title` working
    /// in `worktree_path`.
    pub fn new(
        config: DevServerConfig,
        worktree_path: PathBuf,
        instance_title: &str,
        sessions: Arc<dyn SessionFactory>,
        timings: DevServerTimings,
    ) -> Self {
        Self {
            config,
            status: DevServerStatus::Stopped,
            crash_count: 0,
            output: Arc::new(OutputBuffer::new()),
            session: None,
            sessions,
            worktree_path,
            instance_title: instance_title.to_string(),
            timings,
            last_capture: Vec::new(),
        }
    }

    /// Rebuilds a dev server from its record. A server recorded as active is
    /// reconnected to its session if that session survived; otherwise it is
    /// reported as stopped.
    pub async fn from_record(
        record: DevServerRecord,
        worktree_path: PathBuf,
        instance_title: &str,
        sessions: Arc<dyn SessionFactory>,
        timings: DevServerTimings,
    ) -> Self {
        let mut server = Self::new(record.config, worktree_path, instance_title, sessions, timings);
        server.crash_count = record.crash_count;
        server.status = record.status;

        if record.status.is_active() {
            let session = server.new_session();
            if session.exists().await {
                server.status = DevServerStatus::Running;
                server.session = Some(session);
            } else {
                tracing::info!(
                    instance = %server.instance_title,
                    "Dev server session did not survive, marking stopped"
                );
                server.status = DevServerStatus::Stopped;
            }
        }
        server
    }

    fn new_session(&self) -> Box<dyn TerminalSession> {
        self.sessions.create(
            &dev_session_name(&self.instance_title),
            &dev_command_line(&self.config),
        )
    }

    /// Captures the pane and appends lines not seen in the previous capture.
    async fn capture_new_lines(&mut self) -> Result<usize, SessionError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(0);
        };
        let content = session.capture_pane().await?;
        let current: Vec<String> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect();

        let fresh = unseen_lines(&self.last_capture, &current);
        for line in fresh {
            self.output.push(line.as_str());
        }
        let appended = fresh.len();
        self.last_capture = current;
        Ok(appended)
    }

    async fn run_build(&self) -> Result<(), DevServerError> {
        tracing::info!(
            instance = %self.instance_title,
            command = %self.config.build_command,
            "Running dev server build"
        );
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.config.build_command)
            .current_dir(&self.worktree_path)
            .output()
            .await
            .map_err(DevServerError::BuildSpawn)?;

        self.output.push_text(&String::from_utf8_lossy(&output.stdout));
        self.output.push_text(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(())
        } else {
            Err(DevServerError::BuildFailed {
                exit_code: output.status.code(),
            })
        }
    }

    async fn launch(&mut self) -> Result<(), DevServerError> {
        let session = self.new_session();

        if session.exists().await {
            tracing::info!(session = %session.name(), "Killing stale dev server session");
            if let Err(e) = session.close().await {
                tracing::warn!(session = %session.name(), error = %e, "Failed to kill stale session");
            }
        }

        // The session's own wait for its window is the only wait; this
        // deadline bounds the whole launch.
        let started =
            tokio::time::timeout(self.timings.start_timeout, session.start(&self.worktree_path))
                .await;
        let failure = match started {
            Ok(Ok(())) => None,
            Ok(Err(SessionError::StartTimeout(_))) | Err(_) => {
                Some(DevServerError::StartTimeout(session.name().to_string()))
            }
            Ok(Err(e)) => Some(DevServerError::StartFailed(e)),
        };
        if let Some(error) = failure {
            if let Err(e) = session.close().await {
                tracing::debug!(session = %session.name(), error = %e, "Teardown after failed launch failed");
            }
            return Err(error);
        }

        // The server runs unattended; only the session itself needs to live.
        if let Err(e) = session.detach_safely().await {
            tracing::debug!(session = %session.name(), error = %e, "Detaching dev session failed");
        }

        self.session = Some(session);
        self.last_capture.clear();
        Ok(())
    }

    fn record_crash(&mut self) {
        let previous = self.output.tail(CRASH_TAIL_LINES);
        self.crash_count += 1;
        self.status = DevServerStatus::Crashed;

        if previous.is_empty() {
            self.output
                .push(format!("[{}] Dev server crashed! No output available.", timestamp()));
        } else {
            self.output
                .push(format!("[{}] Dev server crashed! Last output:", timestamp()));
            for line in previous {
                self.output.push(format!("  {line}"));
            }
        }
        self.output.push(format!("Crash count: {}", self.crash_count));
        if self.crash_count >= CRASH_WARNING_THRESHOLD {
            self.output
                .push("Multiple crashes detected. Check your dev server configuration.");
        }

        tracing::warn!(
            instance = %self.instance_title,
            crash_count = self.crash_count,
            "Dev server crashed"
        );
    }
}

#[async_trait]
impl DevServerControl for DevServer {
    fn status(&self) -> DevServerStatus {
        self.status
    }

    fn config(&self) -> &DevServerConfig {
        &self.config
    }

    fn crash_count(&self) -> u32 {
        self.crash_count
    }

    fn output(&self) -> String {
        self.output.snapshot()
    }

    fn output_buffer(&self) -> Arc<OutputBuffer> {
        Arc::clone(&self.output)
    }

    async fn session_exists(&self) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        if !session.exists().await {
            return false;
        }
        matches!(session.capture_pane().await, Ok(content) if !content.is_empty())
    }

    async fn update_output(&mut self) {
        if let Err(e) = self.capture_new_lines().await {
            tracing::debug!(instance = %self.instance_title, error = %e, "Dev server capture failed");
        }
    }

    async fn has_updated(&mut self) -> bool {
        matches!(self.capture_new_lines().await, Ok(n) if n > 0)
    }

    async fn start(&mut self) -> Result<(), DevServerError> {
        if self.status.is_active() {
            return Err(DevServerError::AlreadyRunning);
        }
        if self.config.dev_command.trim().is_empty() {
            return Err(DevServerError::NotConfigured);
        }

        self.status = DevServerStatus::Building;
        if !self.config.build_command.trim().is_empty() {
            if let Err(e) = self.run_build().await {
                tracing::error!(instance = %self.instance_title, error = %e, "Dev server build failed");
                self.status = DevServerStatus::Stopped;
                return Err(e);
            }
        }

        self.status = DevServerStatus::Starting;
        if let Err(e) = self.launch().await {
            tracing::error!(instance = %self.instance_title, error = %e, "Dev server launch failed");
            self.status = DevServerStatus::Stopped;
            return Err(e);
        }

        self.output.push(format!(
            "[{}] Starting dev server: {}",
            timestamp(),
            self.config.dev_command
        ));
        self.status = DevServerStatus::Running;
        tracing::info!(instance = %self.instance_title, "Dev server running");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DevServerError> {
        let Some(session) = self.session.take() else {
            self.status = DevServerStatus::Stopped;
            return Ok(());
        };

        if let Err(e) = session.send_keys(INTERRUPT).await {
            tracing::debug!(session = %session.name(), error = %e, "Failed to interrupt dev server");
        }
        tokio::time::sleep(self.timings.grace_period).await;

        let result = if session.exists().await {
            session.close().await.map_err(DevServerError::StopFailed)
        } else {
            Ok(())
        };

        self.status = DevServerStatus::Stopped;
        self.last_capture.clear();
        tracing::info!(instance = %self.instance_title, "Dev server stopped");
        result
    }

    async fn check_health(&mut self) {
        if self.status != DevServerStatus::Running {
            return;
        }

        self.update_output().await;

        let alive = match self.session.as_ref() {
            Some(session) => session.exists().await,
            None => false,
        };
        if !alive {
            self.record_crash();
        }
    }

    async fn attach(&self) -> Result<oneshot::Receiver<()>, DevServerError> {
        if self.status != DevServerStatus::Running {
            return Err(DevServerError::NotRunning(self.status));
        }
        let session = self.session.as_deref().ok_or(DevServerError::SessionMissing)?;
        if !session.exists().await {
            return Err(DevServerError::SessionMissing);
        }
        session.attach().await.map_err(DevServerError::AttachFailed)
    }
}
