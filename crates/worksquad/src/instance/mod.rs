//! Instance lifecycle.
//!
//! An [`Instance`] is one agent working session. It exclusively owns a
//! [`Worktree`] and a primary [`TerminalSession`], and optionally a dev server.
//! Every operation that touches those resources is gated on the `started`
//! flag.
//!
//! ## Lifecycle
//!
//! ```text
//!            start(true)                 pause()
//!   Ready ───────────────▶ Running ◀──────────────▶ Paused
//!                           ▲   │        resume()
//!                 poll tick │   ▼
//!                         Ready/Loading
//!
//!   kill() is valid from every state and releases everything.
//! ```
//!
//! Acquisition during `start` is tracked on a [`Rollback`] stack so a failure
//! half-way through releases exactly what was acquired.

pub mod error;
pub mod rollback;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use records::{DevServerConfig, InstanceRecord, InstanceStatus};
use tokio::sync::oneshot;

pub use error::{combine_errors, ErrorKind, InstanceError, MULTIPLE_ERRORS_HEADER};
pub use rollback::{Rollback, UndoStep};

use crate::clipboard::Clipboard;
use crate::devserver::{DevServer, DevServerControl, DevServerTimings};
use crate::session::{SessionFactory, TerminalSession};
use crate::worktree::{DiffStats, Worktree, WorktreeError, WorktreeFactory};

/// Delay between typing a prompt and pressing Enter, so the agent does not
/// read the carriage return as part of a pasted block.
pub const PROMPT_SUBMIT_DELAY: Duration = Duration::from_millis(100);

/// Factories and services shared by every instance.
#[derive(Clone)]
pub struct Backends {
    /// Creates terminal sessions.
    pub sessions: Arc<dyn SessionFactory>,
    /// Creates worktrees.
    pub worktrees: Arc<dyn WorktreeFactory>,
    /// Where the worktree path is copied on pause, if anywhere.
    pub clipboard: Option<Clipboard>,
    /// Timing for dev servers created by instances.
    pub dev_server_timings: DevServerTimings,
}

/// Options for creating an instance.
#[derive(Debug, Clone, Default)]
pub struct InstanceOptions {
    /// Unique title.
    pub title: String,
    /// Path inside the repository to work on.
    pub path: PathBuf,
    /// Agent command, e.g. `claude` or `aider --model sonnet`.
    pub program: String,
    /// Confirm agent prompts automatically.
    pub auto_yes: bool,
}

/// One agent working session.
pub struct Instance {
    title: String,
    path: PathBuf,
    branch: String,
    status: InstanceStatus,
    program: String,
    height: u16,
    width: u16,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    auto_yes: bool,
    /// Initial prompt to send once started; never persisted.
    prompt: Option<String>,
    diff_stats: Option<DiffStats>,

    started: bool,
    session: Option<Box<dyn TerminalSession>>,
    worktree: Option<Box<dyn Worktree>>,
    dev_server: Option<Box<dyn DevServerControl>>,
    backends: Backends,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("title", &self.title)
            .field("path", &self.path)
            .field("branch", &self.branch)
            .field("status", &self.status)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Creates an instance that has not acquired any resources.
    pub fn new(options: InstanceOptions, backends: Backends) -> Result<Self, InstanceError> {
        let path = std::path::absolute(&options.path).map_err(|source| {
            InstanceError::InvalidPath {
                path: options.path.clone(),
                source,
            }
        })?;
        let now = Utc::now();

        Ok(Self {
            title: options.title,
            path,
            branch: String::new(),
            status: InstanceStatus::Ready,
            program: options.program,
            height: 0,
            width: 0,
            created_at: now,
            updated_at: now,
            auto_yes: options.auto_yes,
            prompt: None,
            diff_stats: None,
            started: false,
            session: None,
            worktree: None,
            dev_server: None,
            backends,
        })
    }

    /// Unique title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Absolute workspace root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Branch assigned on first start.
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Lifecycle status.
    pub fn status(&self) -> InstanceStatus {
        self.status
    }

    /// Agent command.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Whether prompts are confirmed automatically.
    pub fn auto_yes(&self) -> bool {
        self.auto_yes
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether resources have been acquired.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Whether the instance is paused.
    pub fn paused(&self) -> bool {
        self.status == InstanceStatus::Paused
    }

    /// Last computed diff statistics.
    pub fn diff_stats(&self) -> Option<&DiffStats> {
        self.diff_stats.as_ref()
    }

    /// Directory of the worktree, once one has been planned.
    pub fn worktree_path(&self) -> Option<&Path> {
        self.worktree.as_deref().map(|w| w.worktree_path())
    }

    /// Sets the status.
    pub fn set_status(&mut self, status: InstanceStatus) {
        if self.status != status {
            tracing::debug!(instance = %self.title, from = %self.status, to = %status, "Status changed");
        }
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Stores a prompt to send after the first start.
    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = Some(prompt.into());
    }

    /// Removes and returns the pending prompt.
    pub fn take_prompt(&mut self) -> Option<String> {
        self.prompt.take()
    }

    /// Renames the instance. Only allowed before resources are named after
    /// the title.
    pub fn set_title(&mut self, title: impl Into<String>) -> Result<(), InstanceError> {
        if self.started {
            return Err(InstanceError::TitleLocked);
        }
        self.title = title.into();
        Ok(())
    }

    /// The dev server, if one has been configured.
    pub fn dev_server(&self) -> Option<&dyn DevServerControl> {
        self.dev_server.as_deref()
    }

    /// Mutable access to the dev server.
    pub fn dev_server_mut(&mut self) -> Option<&mut (dyn DevServerControl + 'static)> {
        self.dev_server.as_deref_mut()
    }

    /// Installs a dev server, replacing any previous one.
    pub fn set_dev_server(&mut self, server: Box<dyn DevServerControl>) {
        self.dev_server = Some(server);
    }

    /// Acquires the instance's resources.
    ///
    /// With `first_time_setup` a worktree and branch are created and the
    /// agent is launched in it. Without it, the existing terminal session is
    /// reconnected. On failure everything acquired so far is released and
    /// any release failures are attached to the returned error.
    pub async fn start(&mut self, first_time_setup: bool) -> Result<(), InstanceError> {
        if self.title.trim().is_empty() {
            return Err(InstanceError::EmptyTitle);
        }

        if self.session.is_none() {
            self.session = Some(self.backends.sessions.create(&self.title, &self.program));
        }

        let mut rollback = Rollback::new();
        let result = if first_time_setup {
            self.acquire(&mut rollback).await
        } else {
            self.reconnect().await
        };

        if let Err(error) = result {
            tracing::error!(instance = %self.title, error = %error, "Start failed, rolling back");
            let cleanup = self.unwind(rollback).await;
            return Err(InstanceError::with_cleanup(error, cleanup));
        }

        self.started = true;
        self.set_status(InstanceStatus::Running);
        tracing::info!(instance = %self.title, branch = %self.branch, "Instance started");
        Ok(())
    }

    async fn acquire(&mut self, rollback: &mut Rollback) -> Result<(), InstanceError> {
        let (worktree, branch) = self
            .backends
            .worktrees
            .create(&self.path, &self.title)
            .await
            .map_err(InstanceError::worktree("failed to create git worktree"))?;
        self.branch = branch;
        self.worktree = Some(worktree);
        // Setup can fail after the checkout or branch already exists.
        rollback.push(UndoStep::CleanupWorktree);

        let worktree = self
            .worktree
            .as_deref_mut()
            .ok_or(InstanceError::NotStarted("start"))?;
        worktree
            .setup()
            .await
            .map_err(InstanceError::worktree("failed to setup git worktree"))?;
        let workdir = worktree.worktree_path().to_path_buf();

        let session = self.session.as_deref().ok_or(InstanceError::NotStarted("start"))?;
        session
            .start(&workdir)
            .await
            .map_err(InstanceError::session("failed to start new session"))?;
        rollback.push(UndoStep::CloseSession);
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), InstanceError> {
        let session = self.session.as_deref().ok_or(InstanceError::NotStarted("restore"))?;
        session
            .restore()
            .await
            .map_err(InstanceError::session("failed to restore existing session"))
    }

    async fn unwind(&mut self, rollback: Rollback) -> Vec<InstanceError> {
        let mut errors = Vec::new();
        for step in rollback.unwind() {
            match step {
                UndoStep::CloseSession => {
                    if let Some(session) = self.session.as_deref() {
                        if let Err(e) = session.close().await {
                            errors.push(InstanceError::session("failed to close tmux session")(e));
                        }
                    }
                }
                UndoStep::CleanupWorktree => {
                    if let Some(worktree) = self.worktree.take() {
                        if let Err(e) = worktree.cleanup().await {
                            errors.push(InstanceError::worktree("failed to cleanup git worktree")(
                                e,
                            ));
                            self.worktree = Some(worktree);
                        }
                    }
                }
            }
        }
        errors
    }

    /// Releases every resource: dev server, terminal session, then worktree
    /// and branch. All steps are attempted even when earlier ones fail.
    pub async fn kill(&mut self) -> Result<(), InstanceError> {
        if !self.started {
            return Ok(());
        }

        let mut errors = Vec::new();

        if let Some(mut server) = self.dev_server.take() {
            if let Err(e) = server.stop().await {
                errors.push(InstanceError::dev_server("failed to stop dev server")(e));
            }
        }

        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                errors.push(InstanceError::session("failed to close tmux session")(e));
                self.session = Some(session);
            }
        }

        if let Some(worktree) = self.worktree.take() {
            if let Err(e) = worktree.cleanup().await {
                errors.push(InstanceError::worktree("failed to cleanup git worktree")(e));
                self.worktree = Some(worktree);
            }
        }

        if errors.is_empty() {
            self.started = false;
            self.diff_stats = None;
            tracing::info!(instance = %self.title, "Instance killed");
        }
        combine_errors(errors)
    }

    /// Commits any uncommitted work locally and detaches the terminal,
    /// leaving the worktree and the agent process in place.
    pub async fn pause(&mut self) -> Result<(), InstanceError> {
        if !self.started {
            return Err(InstanceError::NotStarted("pause"));
        }
        if self.paused() {
            return Err(InstanceError::AlreadyPaused);
        }

        let worktree = self.worktree.as_deref().ok_or(InstanceError::NotStarted("pause"))?;
        let dirty = worktree
            .is_dirty()
            .await
            .map_err(InstanceError::worktree("failed to check if worktree is dirty"))?;
        if dirty {
            let message = format!(
                "[worksquad] update from '{}' on {} (paused)",
                self.title,
                Local::now().format("%d %b %y %H:%M %Z")
            );
            worktree
                .commit_changes(&message)
                .await
                .map_err(InstanceError::worktree("failed to commit changes"))?;
        }
        let worktree_path = worktree.worktree_path().to_path_buf();

        if let Some(session) = self.session.as_deref() {
            if let Err(e) = session.detach_safely().await {
                tracing::warn!(instance = %self.title, error = %e, "Failed to detach session, pausing anyway");
            }
        }

        self.set_status(InstanceStatus::Paused);
        tracing::info!(instance = %self.title, committed = dirty, "Instance paused");

        if let Some(clipboard) = &self.backends.clipboard {
            if let Err(e) = clipboard.copy(&worktree_path.to_string_lossy()).await {
                tracing::debug!(error = %e, "Could not copy worktree path to clipboard");
            }
        }
        Ok(())
    }

    /// Brings a paused instance back: recreates the worktree if it was
    /// removed and reconnects to (or relaunches) the agent.
    pub async fn resume(&mut self) -> Result<(), InstanceError> {
        if !self.started {
            return Err(InstanceError::NotStarted("resume"));
        }
        if !self.paused() {
            return Err(InstanceError::NotPaused);
        }

        let worktree = self.worktree.as_deref_mut().ok_or(InstanceError::NotStarted("resume"))?;
        let checked_out = worktree
            .is_branch_checked_out()
            .await
            .map_err(InstanceError::worktree("failed to check if branch is checked out"))?;
        if checked_out {
            return Err(InstanceError::BranchCheckedOut(worktree.branch_name().to_string()));
        }

        let present = tokio::fs::try_exists(worktree.worktree_path())
            .await
            .map_err(|e| {
                InstanceError::worktree("failed to check if worktree exists")(WorktreeError::Io(e))
            })?;
        if !present {
            tracing::info!(instance = %self.title, "Worktree missing, recreating");
            worktree
                .setup()
                .await
                .map_err(InstanceError::worktree("failed to setup git worktree"))?;
        }
        let workdir = worktree.worktree_path().to_path_buf();

        let session = self.session.as_deref().ok_or(InstanceError::NotStarted("resume"))?;
        let reconnected = if session.exists().await {
            match session.restore().await {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(instance = %self.title, error = %e, "Restore failed, starting a new session");
                    false
                }
            }
        } else {
            false
        };

        if !reconnected {
            if let Err(e) = session.start(&workdir).await {
                let error = InstanceError::session("failed to start new session")(e);
                let mut cleanup = Vec::new();
                if let Some(worktree) = self.worktree.as_deref() {
                    if let Err(e) = worktree.cleanup().await {
                        cleanup.push(InstanceError::worktree("failed to cleanup git worktree")(e));
                    }
                }
                return Err(InstanceError::with_cleanup(error, cleanup));
            }
        }

        self.set_status(InstanceStatus::Running);
        tracing::info!(instance = %self.title, reconnected, "Instance resumed");
        Ok(())
    }

    /// Types `prompt` into the agent and submits it.
    pub async fn send_prompt(&self, prompt: &str) -> Result<(), InstanceError> {
        let session = self.live_session("send prompt to")?;
        session
            .send_keys(prompt)
            .await
            .map_err(InstanceError::session("error sending keys to tmux session"))?;
        tokio::time::sleep(PROMPT_SUBMIT_DELAY).await;
        session
            .tap_enter()
            .await
            .map_err(InstanceError::session("error tapping enter"))
    }

    /// Sends raw keys to the agent.
    pub async fn send_keys(&self, keys: &str) -> Result<(), InstanceError> {
        let session = self.live_session("send keys to")?;
        if self.paused() {
            return Err(InstanceError::Paused("send keys to"));
        }
        session
            .send_keys(keys)
            .await
            .map_err(InstanceError::session("error sending keys to tmux session"))
    }

    /// `(updated, has_prompt)` for the agent's pane.
    pub async fn has_updated(&self) -> (bool, bool) {
        match self.session.as_deref() {
            Some(session) if self.started => session.has_updated().await,
            _ => (false, false),
        }
    }

    /// Presses Enter for the agent when auto-confirm is enabled.
    pub async fn tap_enter(&self) {
        if !self.started || !self.auto_yes {
            return;
        }
        if let Some(session) = self.session.as_deref() {
            if let Err(e) = session.tap_enter().await {
                tracing::error!(instance = %self.title, error = %e, "Error tapping enter");
            }
        }
    }

    /// The agent's visible pane; empty when not started or paused.
    pub async fn preview(&self) -> Result<String, InstanceError> {
        match self.session.as_deref() {
            Some(session) if self.started && !self.paused() => session
                .capture_pane()
                .await
                .map_err(InstanceError::session("failed to capture pane")),
            _ => Ok(String::new()),
        }
    }

    /// The agent's full scrollback; empty when not started or paused.
    pub async fn preview_full_history(&self) -> Result<String, InstanceError> {
        match self.session.as_deref() {
            Some(session) if self.started && !self.paused() => session
                .capture_range("-", "-")
                .await
                .map_err(InstanceError::session("failed to capture history")),
            _ => Ok(String::new()),
        }
    }

    /// Hands the operator's terminal to the agent.
    pub async fn attach(&self) -> Result<oneshot::Receiver<()>, InstanceError> {
        let session = self.live_session("attach")?;
        session
            .attach()
            .await
            .map_err(InstanceError::session("failed to attach"))
    }

    /// Resizes the agent's window to the preview pane.
    pub async fn set_preview_size(&mut self, width: u16, height: u16) -> Result<(), InstanceError> {
        if self.started && self.paused() {
            return Err(InstanceError::Paused("set preview size for"));
        }
        let session = self.live_session("set preview size for")?;
        session
            .set_detached_size(width, height)
            .await
            .map_err(InstanceError::session("failed to resize"))?;
        self.width = width;
        self.height = height;
        Ok(())
    }

    /// Name of the repository the instance works on.
    pub fn repo_name(&self) -> Result<String, InstanceError> {
        if !self.started {
            return Err(InstanceError::NotStarted("get repo name for"));
        }
        self.worktree
            .as_deref()
            .map(|w| w.repo_name())
            .ok_or(InstanceError::NotStarted("get repo name for"))
    }

    /// Whether the agent's terminal session still exists.
    pub async fn terminal_alive(&self) -> bool {
        match self.session.as_deref() {
            Some(session) => session.exists().await,
            None => false,
        }
    }

    /// Recomputes diff statistics. Cleared when not started, kept while
    /// paused, and absent while the base commit is unknown.
    pub async fn update_diff_stats(&mut self) -> Result<(), InstanceError> {
        if !self.started {
            self.diff_stats = None;
            return Ok(());
        }
        if self.paused() {
            return Ok(());
        }
        let Some(worktree) = self.worktree.as_deref() else {
            self.diff_stats = None;
            return Ok(());
        };

        match worktree.diff().await {
            Ok(stats) => {
                self.diff_stats = Some(stats);
                Ok(())
            }
            Err(WorktreeError::BaseCommitUnknown) => {
                self.diff_stats = None;
                Ok(())
            }
            Err(e) => Err(InstanceError::worktree("failed to get diff stats")(e)),
        }
    }

    /// Creates the dev server from the repository's settings if none exists
    /// yet, then starts it.
    pub async fn start_dev_server(&mut self) -> Result<(), InstanceError> {
        if self.dev_server.is_none() {
            let worktree = self
                .worktree
                .as_deref()
                .ok_or(InstanceError::NotStarted("start dev server for"))?;
            let settings = crate::settings::load_settings(worktree.repo_path())?;
            if !settings.is_configured() {
                return Err(InstanceError::NoDevServer);
            }
            let server = DevServer::new(
                settings.to_config(),
                worktree.worktree_path().to_path_buf(),
                &self.title,
                Arc::clone(&self.backends.sessions),
                self.backends.dev_server_timings,
            );
            self.dev_server = Some(Box::new(server));
        }

        let server = self.dev_server.as_deref_mut().ok_or(InstanceError::NoDevServer)?;
        server
            .start()
            .await
            .map_err(InstanceError::dev_server("failed to start dev server"))
    }

    /// Stops the dev server.
    pub async fn stop_dev_server(&mut self) -> Result<(), InstanceError> {
        let server = self.dev_server.as_deref_mut().ok_or(InstanceError::NoDevServer)?;
        server
            .stop()
            .await
            .map_err(InstanceError::dev_server("failed to stop dev server"))
    }

    /// Hands the terminal to the running dev server's session.
    pub async fn attach_dev_server(&self) -> Result<oneshot::Receiver<()>, InstanceError> {
        let server = self.dev_server.as_deref().ok_or(InstanceError::NoDevServer)?;
        server
            .attach()
            .await
            .map_err(InstanceError::dev_server("failed to attach to dev server"))
    }

    /// Stops the current dev server, if running, and replaces it with one built
    /// from `config`. The new server is left stopped.
    pub async fn reconfigure_dev_server(
        &mut self,
        config: DevServerConfig,
    ) -> Result<(), InstanceError> {
        let worktree_path = self
            .worktree
            .as_deref()
            .ok_or(InstanceError::NotStarted("reconfigure dev server for"))?
            .worktree_path()
            .to_path_buf();

        if let Some(mut server) = self.dev_server.take() {
            if server.is_running() {
                if let Err(e) = server.stop().await {
                    tracing::warn!(
                        instance = %self.title,
                        error = %e,
                        "Failed to stop dev server before reconfiguring"
                    );
                }
            }
        }

        self.dev_server = Some(Box::new(DevServer::new(
            config,
            worktree_path,
            &self.title,
            Arc::clone(&self.backends.sessions),
            self.backends.dev_server_timings,
        )));
        tracing::info!(instance = %self.title, "Dev server reconfigured");
        Ok(())
    }

    fn live_session(&self, operation: &'static str) -> Result<&dyn TerminalSession, InstanceError> {
        if !self.started {
            return Err(InstanceError::NotStarted(operation));
        }
        self.session
            .as_deref()
            .ok_or(InstanceError::NotStarted(operation))
    }

    /// Persisted form.
    pub fn to_record(&self) -> InstanceRecord {
        InstanceRecord {
            title: self.title.clone(),
            path: self.path.clone(),
            branch: self.branch.clone(),
            status: self.status,
            height: self.height,
            width: self.width,
            created_at: self.created_at,
            updated_at: Utc::now(),
            program: self.program.clone(),
            auto_yes: self.auto_yes,
            worktree: self
                .worktree
                .as_deref()
                .map(|w| {
                    let mut record = w.to_record();
                    record.session_name = self.title.clone();
                    record
                })
                .unwrap_or_default(),
            diff_stats: self.diff_stats.clone().map(Into::into).unwrap_or_default(),
            dev_server: self.dev_server.as_deref().map(|d| d.to_record()),
        }
    }

    /// Rebuilds an instance from its record. A paused instance is marked
    /// started with an unconnected session; any other instance reconnects
    /// to its session.
    pub async fn from_record(
        record: InstanceRecord,
        backends: Backends,
    ) -> Result<Self, InstanceError> {
        let mut instance = Self::rebuild(record, backends).await;
        if instance.paused() {
            instance.adopt_detached();
        } else {
            instance.start(false).await?;
        }
        Ok(instance)
    }

    /// Rebuilds an instance whose session could not be reconnected, e.g.
    /// after the multiplexer server went away. It comes back paused and
    /// still owns its worktree and branch: resume relaunches the agent and
    /// kill releases everything.
    pub async fn from_record_detached(record: InstanceRecord, backends: Backends) -> Self {
        let mut instance = Self::rebuild(record, backends).await;
        instance.status = InstanceStatus::Paused;
        instance.adopt_detached();
        instance
    }

    fn adopt_detached(&mut self) {
        self.started = true;
        self.session = Some(self.backends.sessions.create(&self.title, &self.program));
    }

    async fn rebuild(record: InstanceRecord, backends: Backends) -> Self {
        let worktree = backends.worktrees.restore(&record.worktree);
        let dev_server: Option<Box<dyn DevServerControl>> = match record.dev_server {
            Some(server) => Some(Box::new(
                DevServer::from_record(
                    server,
                    worktree.worktree_path().to_path_buf(),
                    &record.title,
                    Arc::clone(&backends.sessions),
                    backends.dev_server_timings,
                )
                .await,
            )),
            None => None,
        };

        Self {
            title: record.title,
            path: record.path,
            branch: record.branch,
            status: record.status,
            program: record.program,
            height: record.height,
            width: record.width,
            created_at: record.created_at,
            updated_at: record.updated_at,
            auto_yes: record.auto_yes,
            prompt: None,
            diff_stats: Some(DiffStats::from(record.diff_stats)).filter(|d| !d.is_empty()),
            started: false,
            session: None,
            worktree: Some(worktree),
            dev_server,
            backends,
        }
    }
}
