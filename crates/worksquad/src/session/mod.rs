//! Reattachable terminal sessions.
//!
//! A [`TerminalSession`] is a named, multiplexer-owned terminal that keeps
//! running after the process that created it exits. Instances and dev servers
//! only talk to sessions through this trait; [`TmuxSession`] is the concrete
//! adapter backed by the `tmux` binary.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐  new-session / kill-session / capture-pane / send-keys
//! │  TmuxSession   │──────────────────────────────────────────────▶ tmux server
//! │  (per-session  │
//! │   async mutex) │  attach-session (pty)
//! │                │──────────────────────────────────────────────▶ tmux client
//! └────────────────┘
//! ```

pub mod pty;
pub mod tmux;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

pub use pty::PtyClient;
pub use tmux::{sanitize_session_name, TmuxSession, TmuxSessionFactory};

/// First delay when polling for a freshly launched session.
pub const WAIT_INITIAL_BACKOFF: Duration = Duration::from_millis(5);

/// Upper bound for the polling delay.
pub const WAIT_MAX_BACKOFF: Duration = Duration::from_millis(50);

/// How long a freshly launched session gets to appear.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur during terminal session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The multiplexer binary is not installed.
    #[error("terminal multiplexer not available: {0}")]
    NotAvailable(String),

    /// A multiplexer command exited unsuccessfully.
    #[error("{command} failed for session {session}: {stderr}")]
    CommandFailed {
        /// The subcommand that failed.
        command: String,
        /// Session it targeted.
        session: String,
        /// Captured standard error.
        stderr: String,
    },

    /// The session does not exist.
    #[error("session not found: {0}")]
    NotFound(String),

    /// A session with this name is already running.
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// The session never became visible after launch.
    #[error("timed out waiting for session {0} to start")]
    StartTimeout(String),

    /// The session has no attached client to operate on.
    #[error("session {0} is not attached")]
    NotAttached(String),

    /// The pty attachment failed.
    #[error("pty error: {0}")]
    Pty(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A reattachable terminal session.
///
/// Implementations serialize their own commands, so a shared reference may be
/// used from the control loop and from an attach task at the same time.
#[async_trait]
pub trait TerminalSession: Send + Sync {
    /// The multiplexer-level name of this session.
    fn name(&self) -> &str;

    /// Launches the session's program in `workdir` and connects to it.
    async fn start(&self, workdir: &Path) -> Result<(), SessionError>;

    /// Reconnects to a session that survived a previous run or a pause.
    async fn restore(&self) -> Result<(), SessionError>;

    /// Terminates the session and everything running in it.
    async fn close(&self) -> Result<(), SessionError>;

    /// Drops this process's connection while leaving the session running.
    async fn detach_safely(&self) -> Result<(), SessionError>;

    /// Whether the multiplexer still knows about this session.
    async fn exists(&self) -> bool;

    /// Captures the visible pane, including escape sequences.
    async fn capture_pane(&self) -> Result<String, SessionError>;

    /// Captures a line range of the pane history. `"-"` means the start or
    /// end of the history.
    async fn capture_range(&self, from: &str, to: &str) -> Result<String, SessionError>;

    /// Types `text` literally into the session.
    async fn send_keys(&self, text: &str) -> Result<(), SessionError>;

    /// Presses Enter.
    async fn tap_enter(&self) -> Result<(), SessionError>;

    /// Hands the operator's terminal to the session. The receiver completes
    /// when the operator detaches.
    async fn attach(&self) -> Result<oneshot::Receiver<()>, SessionError>;

    /// Resizes the detached client.
    async fn set_detached_size(&self, width: u16, height: u16) -> Result<(), SessionError>;

    /// Reports `(updated, has_prompt)`: whether the pane changed since the
    /// last call and whether the agent is waiting on a confirmation prompt.
    async fn has_updated(&self) -> (bool, bool);
}

/// Creates sessions. Instances and dev servers receive one of these instead
/// of constructing adapters themselves.
pub trait SessionFactory: Send + Sync {
    /// Builds an unconnected session that will run `program` when started.
    fn create(&self, name: &str, program: &str) -> Box<dyn TerminalSession>;
}

/// Polls `session.exists()` with doubling backoff until it reports true or
/// `timeout` elapses.
pub async fn wait_for_session(session: &dyn TerminalSession, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut delay = WAIT_INITIAL_BACKOFF;

    loop {
        if session.exists().await {
            return true;
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return false;
        }
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(WAIT_MAX_BACKOFF);
    }
}
