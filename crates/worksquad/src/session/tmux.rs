//! tmux-backed terminal sessions.
//!
//! Every tmux invocation for a session runs while holding that session's
//! async mutex, so the control loop's capture-pane sweeps never interleave
//! with a user-triggered send-keys or kill-session.

use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::sync::{oneshot, Mutex};

use super::pty::{PtyClient, DEFAULT_COLS, DEFAULT_ROWS};
use super::{wait_for_session, SessionError, SessionFactory, TerminalSession, WAIT_TIMEOUT};

/// Prefix applied to every session this tool creates.
pub const SESSION_PREFIX: &str = "worksquad_";

/// Scrollback kept by each session.
const HISTORY_LIMIT: &str = "10000";

/// Confirmation prompts printed by the supported agents, keyed by a fragment
/// of the program name.
const PROMPT_PATTERNS: &[(&str, &str)] = &[
    ("claude", "No, and tell Claude what to do differently"),
    ("aider", "(Y)es/(N)o/(D)on't ask again"),
    ("gemini", "Yes, allow once"),
];

/// Builds the tmux session name for a raw title: whitespace removed, dots
/// replaced (tmux treats `.` as a pane separator), and the tool prefix added.
pub fn sanitize_session_name(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '.' { '_' } else { c })
        .collect();
    format!("{SESSION_PREFIX}{sanitized}")
}

/// Whether `content` shows a confirmation prompt for `program`.
pub fn detect_prompt(program: &str, content: &str) -> bool {
    PROMPT_PATTERNS
        .iter()
        .any(|(fragment, prompt)| program.contains(fragment) && content.contains(prompt))
}

/// Arguments for launching `program` in a detached session.
fn new_session_args(
    name: &str,
    workdir: &Path,
    cols: u16,
    rows: u16,
    program: &str,
) -> Vec<String> {
    vec![
        "new-session".to_string(),
        "-d".to_string(),
        "-s".to_string(),
        name.to_string(),
        "-c".to_string(),
        workdir.to_string_lossy().into_owned(),
        "-x".to_string(),
        cols.to_string(),
        "-y".to_string(),
        rows.to_string(),
        program.to_string(),
    ]
}

/// Runs one tmux command, mapping a missing binary to
/// [`SessionError::NotAvailable`].
async fn run_tmux<S: AsRef<str>>(args: &[S]) -> Result<Output, SessionError> {
    Command::new("tmux")
        .args(args.iter().map(AsRef::as_ref))
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SessionError::NotAvailable("tmux".to_string())
            } else {
                SessionError::Io(e)
            }
        })
}

/// Runs one tmux command and fails on a non-zero exit.
async fn run_checked<S: AsRef<str>>(args: &[S], session: &str) -> Result<String, SessionError> {
    let output = run_tmux(args).await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(SessionError::CommandFailed {
            command: args.first().map(|a| a.as_ref().to_string()).unwrap_or_default(),
            session: session.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Mutable state guarded by the per-session mutex.
struct TmuxState {
    /// Background client keeping the window sized; absent while detached.
    client: Option<PtyClient>,
    /// Digest of the last pane capture seen by `has_updated`.
    last_digest: Option<String>,
    cols: u16,
    rows: u16,
}

/// Exact-match `has-session`.
async fn has_session(name: &str) -> bool {
    let target = format!("-t={name}");
    matches!(run_tmux(&["has-session", target.as_str()]).await, Ok(out) if out.status.success())
}

impl TmuxState {
    fn attach_client(&mut self, name: &str) -> Result<(), SessionError> {
        if self.client.as_ref().is_some_and(PtyClient::is_running) {
            return Ok(());
        }
        let client = PtyClient::spawn(
            name,
            "tmux",
            &["attach-session", "-t", name],
            self.cols,
            self.rows,
        )?;
        client.start_drain_loop();
        self.client = Some(client);
        Ok(())
    }

    async fn detach_client(&mut self) -> Result<(), SessionError> {
        match self.client.take() {
            Some(client) => client.close().await,
            None => Ok(()),
        }
    }
}

/// A terminal session backed by a tmux session.
pub struct TmuxSession {
    name: String,
    program: String,
    state: Mutex<TmuxState>,
}

impl TmuxSession {
    /// Creates an unconnected session for `raw_name` running `program`.
    pub fn new(raw_name: &str, program: &str) -> Self {
        Self {
            name: sanitize_session_name(raw_name),
            program: program.to_string(),
            state: Mutex::new(TmuxState {
                client: None,
                last_digest: None,
                cols: DEFAULT_COLS,
                rows: DEFAULT_ROWS,
            }),
        }
    }

    /// The program launched by [`TerminalSession::start`].
    pub fn program(&self) -> &str {
        &self.program
    }

    async fn kill_quietly(&self) {
        let mut state = self.state.lock().await;
        let _ = state.detach_client().await;
        if let Err(e) = run_checked(&["kill-session", "-t", self.name.as_str()], &self.name).await {
            tracing::debug!(session = %self.name, error = %e, "Teardown kill-session failed");
        }
    }
}

#[async_trait]
impl TerminalSession for TmuxSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, workdir: &Path) -> Result<(), SessionError> {
        {
            let state = self.state.lock().await;
            if has_session(&self.name).await {
                return Err(SessionError::AlreadyExists(self.name.clone()));
            }
            let args = new_session_args(&self.name, workdir, state.cols, state.rows, &self.program);
            run_checked(&args[..], &self.name).await?;
        }

        if !wait_for_session(self, WAIT_TIMEOUT).await {
            self.kill_quietly().await;
            return Err(SessionError::StartTimeout(self.name.clone()));
        }

        {
            let _state = self.state.lock().await;
            if let Err(e) = run_checked(
                &["set-option", "-t", self.name.as_str(), "history-limit", HISTORY_LIMIT],
                &self.name,
            )
            .await
            {
                tracing::warn!(session = %self.name, error = %e, "Failed to raise history limit");
            }
        }

        if let Err(e) = self.restore().await {
            self.kill_quietly().await;
            return Err(e);
        }

        tracing::info!(session = %self.name, program = %self.program, "Started tmux session");
        Ok(())
    }

    async fn restore(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        if !has_session(&self.name).await {
            return Err(SessionError::NotFound(self.name.clone()));
        }
        state.attach_client(&self.name)?;
        tracing::debug!(session = %self.name, "Restored tmux session");
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        let detach = state.detach_client().await;
        state.last_digest = None;

        if has_session(&self.name).await {
            run_checked(&["kill-session", "-t", self.name.as_str()], &self.name).await?;
        }
        detach?;

        tracing::info!(session = %self.name, "Closed tmux session");
        Ok(())
    }

    async fn detach_safely(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        state.detach_client().await?;
        tracing::debug!(session = %self.name, "Detached tmux session");
        Ok(())
    }

    async fn exists(&self) -> bool {
        let _state = self.state.lock().await;
        has_session(&self.name).await
    }

    async fn capture_pane(&self) -> Result<String, SessionError> {
        let _state = self.state.lock().await;
        run_checked(
            &["capture-pane", "-p", "-e", "-J", "-t", self.name.as_str()],
            &self.name,
        )
        .await
    }

    async fn capture_range(&self, from: &str, to: &str) -> Result<String, SessionError> {
        let _state = self.state.lock().await;
        run_checked(
            &["capture-pane", "-p", "-e", "-J", "-S", from, "-E", to, "-t", self.name.as_str()],
            &self.name,
        )
        .await
    }

    async fn send_keys(&self, text: &str) -> Result<(), SessionError> {
        let _state = self.state.lock().await;
        run_checked(&["send-keys", "-l", "-t", self.name.as_str(), text], &self.name).await?;
        Ok(())
    }

    async fn tap_enter(&self) -> Result<(), SessionError> {
        let _state = self.state.lock().await;
        run_checked(&["send-keys", "-t", self.name.as_str(), "Enter"], &self.name).await?;
        Ok(())
    }

    async fn attach(&self) -> Result<oneshot::Receiver<()>, SessionError> {
        let state = self.state.lock().await;
        if !has_session(&self.name).await {
            return Err(SessionError::NotFound(self.name.clone()));
        }

        let mut child = Command::new("tmux")
            .args(["attach-session", "-t", self.name.as_str()])
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        drop(state);

        let (done_tx, done_rx) = oneshot::channel();
        let name = self.name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(session = %name, %status, "Operator detached"),
                Err(e) => tracing::warn!(session = %name, error = %e, "Attach client failed"),
            }
            let _ = done_tx.send(());
        });

        Ok(done_rx)
    }

    async fn set_detached_size(&self, width: u16, height: u16) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        state.cols = width;
        state.rows = height;
        match state.client.as_mut() {
            Some(client) => client.resize(width, height).await,
            None => Err(SessionError::NotAttached(self.name.clone())),
        }
    }

    async fn has_updated(&self) -> (bool, bool) {
        let mut state = self.state.lock().await;
        let content = match run_checked(
            &["capture-pane", "-p", "-e", "-J", "-t", self.name.as_str()],
            &self.name,
        )
        .await
        {
            Ok(content) => content,
            Err(e) => {
                tracing::debug!(session = %self.name, error = %e, "Capture failed during update check");
                return (false, false);
            }
        };

        let has_prompt = detect_prompt(&self.program, &content);
        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        let updated = state.last_digest.as_deref() != Some(digest.as_str());
        state.last_digest = Some(digest);
        (updated, has_prompt)
    }
}

/// Creates [`TmuxSession`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TmuxSessionFactory;

impl SessionFactory for TmuxSessionFactory {
    fn create(&self, name: &str, program: &str) -> Box<dyn TerminalSession> {
        Box::new(TmuxSession::new(name, program))
    }
}
