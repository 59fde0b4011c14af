//! In-memory doubles for the session, worktree and dev server seams.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use records::{DevServerConfig, DevServerStatus, WorktreeRecord};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::devserver::{DevServerControl, DevServerError, OutputBuffer};
use crate::session::{SessionError, SessionFactory, TerminalSession};
use crate::worktree::{DiffStats, Worktree, WorktreeError, WorktreeFactory};

/// Something a fake session was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Keys(String),
    Enter,
}

/// Observable and scriptable state of a [`FakeSession`].
#[derive(Debug, Default)]
pub struct FakeSessionState {
    pub exists: bool,
    pub attached: bool,
    pub never_appears: bool,
    /// `start` never returns.
    pub hang_start: bool,
    pub started_in: Option<PathBuf>,
    pub start_calls: usize,
    pub restore_calls: usize,
    pub close_calls: usize,
    pub detach_calls: usize,
    pub events: Vec<(Instant, SessionEvent)>,
    pub pane: String,
    pub history: String,
    pub updated: bool,
    pub has_prompt: bool,
    pub size: Option<(u16, u16)>,
    pub fail_start: bool,
    pub fail_restore: bool,
    pub fail_close: bool,
    pub fail_detach: bool,
}

impl FakeSessionState {
    /// Literal key strings sent, in order.
    pub fn sent_keys(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|(_, event)| match event {
                SessionEvent::Keys(keys) => Some(keys.clone()),
                SessionEvent::Enter => None,
            })
            .collect()
    }
}

pub type SharedSessionState = Arc<Mutex<FakeSessionState>>;

fn scripted(name: &str, command: &str) -> SessionError {
    SessionError::CommandFailed {
        command: command.to_string(),
        session: name.to_string(),
        stderr: "scripted failure".to_string(),
    }
}

pub struct FakeSession {
    name: String,
    state: SharedSessionState,
}

impl FakeSession {
    pub fn new(name: &str) -> Self {
        Self::with_state(name, Arc::default())
    }

    pub fn with_state(name: &str, state: SharedSessionState) -> Self {
        Self {
            name: name.to_string(),
            state,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeSessionState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl TerminalSession for FakeSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, workdir: &Path) -> Result<(), SessionError> {
        let hang = {
            let mut state = self.state();
            state.start_calls += 1;
            state.hang_start
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state();
        if state.fail_start {
            return Err(scripted(&self.name, "new-session"));
        }
        if state.never_appears {
            // Mirrors tmux giving up on a window that never showed up.
            state.exists = false;
            return Err(SessionError::StartTimeout(self.name.clone()));
        }
        state.started_in = Some(workdir.to_path_buf());
        state.exists = true;
        state.attached = true;
        Ok(())
    }

    async fn restore(&self) -> Result<(), SessionError> {
        let mut state = self.state();
        state.restore_calls += 1;
        if state.fail_restore {
            return Err(scripted(&self.name, "attach-session"));
        }
        if !state.exists {
            return Err(SessionError::NotFound(self.name.clone()));
        }
        state.attached = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        let mut state = self.state();
        state.close_calls += 1;
        if state.fail_close {
            return Err(scripted(&self.name, "kill-session"));
        }
        state.exists = false;
        state.attached = false;
        Ok(())
    }

    async fn detach_safely(&self) -> Result<(), SessionError> {
        let mut state = self.state();
        state.detach_calls += 1;
        if state.fail_detach {
            return Err(scripted(&self.name, "detach"));
        }
        state.attached = false;
        Ok(())
    }

    async fn exists(&self) -> bool {
        self.state().exists
    }

    async fn capture_pane(&self) -> Result<String, SessionError> {
        let state = self.state();
        if !state.exists {
            return Err(SessionError::NotFound(self.name.clone()));
        }
        Ok(state.pane.clone())
    }

    async fn capture_range(&self, _from: &str, _to: &str) -> Result<String, SessionError> {
        let state = self.state();
        if !state.exists {
            return Err(SessionError::NotFound(self.name.clone()));
        }
        Ok(format!("{}{}", state.history, state.pane))
    }

    async fn send_keys(&self, text: &str) -> Result<(), SessionError> {
        self.state()
            .events
            .push((Instant::now(), SessionEvent::Keys(text.to_string())));
        Ok(())
    }

    async fn tap_enter(&self) -> Result<(), SessionError> {
        self.state().events.push((Instant::now(), SessionEvent::Enter));
        Ok(())
    }

    async fn attach(&self) -> Result<oneshot::Receiver<()>, SessionError> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Ok(rx)
    }

    async fn set_detached_size(&self, width: u16, height: u16) -> Result<(), SessionError> {
        let mut state = self.state();
        if !state.attached {
            return Err(SessionError::NotAttached(self.name.clone()));
        }
        state.size = Some((width, height));
        Ok(())
    }

    async fn has_updated(&self) -> (bool, bool) {
        let state = self.state();
        (state.updated, state.has_prompt)
    }
}

/// Hands out [`FakeSession`]s and remembers them by name.
#[derive(Default)]
pub struct FakeSessionFactory {
    created: Mutex<Vec<(String, String)>>,
    states: Mutex<HashMap<String, SharedSessionState>>,
    presets: Mutex<HashMap<String, SharedSessionState>>,
}

impl FakeSessionFactory {
    /// State the next session called `name` will start with.
    pub fn preset(&self, name: &str) -> SharedSessionState {
        let state: SharedSessionState = Arc::default();
        self.presets
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&state));
        state
    }

    /// `(name, program)` of every session created so far.
    pub fn created(&self) -> Vec<(String, String)> {
        self.created.lock().unwrap().clone()
    }

    /// State of the most recent session called `name`.
    pub fn state(&self, name: &str) -> Option<SharedSessionState> {
        self.states.lock().unwrap().get(name).cloned()
    }
}

impl SessionFactory for FakeSessionFactory {
    fn create(&self, name: &str, program: &str) -> Box<dyn TerminalSession> {
        let state = self
            .presets
            .lock()
            .unwrap()
            .remove(name)
            .unwrap_or_default();
        self.created
            .lock()
            .unwrap()
            .push((name.to_string(), program.to_string()));
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&state));
        Box::new(FakeSession::with_state(name, state))
    }
}

/// Observable and scriptable state of a [`FakeWorktree`].
#[derive(Debug, Default)]
pub struct FakeWorktreeState {
    pub setup_calls: usize,
    pub cleanup_calls: usize,
    pub dirty: bool,
    pub commits: Vec<String>,
    pub checked_out: bool,
    pub diff: DiffStats,
    pub fail_setup: bool,
    /// With `fail_setup`, create the directory before failing.
    pub partial_setup: bool,
    pub fail_cleanup: bool,
    pub fail_dirty_check: bool,
    pub fail_commit: bool,
}

pub type SharedWorktreeState = Arc<Mutex<FakeWorktreeState>>;

fn worktree_failure(command: &str) -> WorktreeError {
    WorktreeError::CommandFailed {
        command: command.to_string(),
        exit_code: Some(1),
        stderr: "scripted failure".to_string(),
    }
}

/// A worktree that creates and removes a real directory but runs no git.
pub struct FakeWorktree {
    repo_path: PathBuf,
    worktree_path: PathBuf,
    branch_name: String,
    base_commit_sha: String,
    state: SharedWorktreeState,
}

impl FakeWorktree {
    pub fn new(repo_path: PathBuf, worktree_path: PathBuf, branch_name: &str) -> Self {
        Self {
            repo_path,
            worktree_path,
            branch_name: branch_name.to_string(),
            base_commit_sha: String::new(),
            state: Arc::default(),
        }
    }

    pub fn shared(&self) -> SharedWorktreeState {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl Worktree for FakeWorktree {
    async fn setup(&mut self) -> Result<(), WorktreeError> {
        {
            let mut state = self.state.lock().unwrap();
            state.setup_calls += 1;
            if state.fail_setup {
                if state.partial_setup {
                    std::fs::create_dir_all(&self.worktree_path)?;
                }
                return Err(worktree_failure("git worktree add"));
            }
        }
        std::fs::create_dir_all(&self.worktree_path)?;
        if self.base_commit_sha.is_empty() {
            self.base_commit_sha = "0123abcd".to_string();
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), WorktreeError> {
        let mut state = self.state.lock().unwrap();
        state.cleanup_calls += 1;
        if state.fail_cleanup {
            return Err(worktree_failure("git worktree remove"));
        }
        if self.worktree_path.exists() {
            std::fs::remove_dir_all(&self.worktree_path)?;
        }
        Ok(())
    }

    async fn is_dirty(&self) -> Result<bool, WorktreeError> {
        let state = self.state.lock().unwrap();
        if state.fail_dirty_check {
            return Err(worktree_failure("git status"));
        }
        Ok(state.dirty)
    }

    async fn commit_changes(&self, message: &str) -> Result<(), WorktreeError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_commit {
            return Err(worktree_failure("git commit"));
        }
        state.commits.push(message.to_string());
        state.dirty = false;
        Ok(())
    }

    async fn is_branch_checked_out(&self) -> Result<bool, WorktreeError> {
        Ok(self.state.lock().unwrap().checked_out)
    }

    async fn diff(&self) -> Result<DiffStats, WorktreeError> {
        if self.base_commit_sha.is_empty() {
            return Err(WorktreeError::BaseCommitUnknown);
        }
        Ok(self.state.lock().unwrap().diff.clone())
    }

    fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn worktree_path(&self) -> &Path {
        &self.worktree_path
    }

    fn branch_name(&self) -> &str {
        &self.branch_name
    }

    fn base_commit_sha(&self) -> &str {
        &self.base_commit_sha
    }

    fn to_record(&self) -> WorktreeRecord {
        WorktreeRecord {
            repo_path: self.repo_path.clone(),
            worktree_path: self.worktree_path.clone(),
            session_name: String::new(),
            branch_name: self.branch_name.clone(),
            base_commit_sha: self.base_commit_sha.clone(),
        }
    }
}

/// Plans [`FakeWorktree`]s under `root`.
pub struct FakeWorktreeFactory {
    root: PathBuf,
    states: Mutex<HashMap<String, SharedWorktreeState>>,
    presets: Mutex<HashMap<String, SharedWorktreeState>>,
    pub fail_create: bool,
}

impl FakeWorktreeFactory {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            states: Mutex::default(),
            presets: Mutex::default(),
            fail_create: false,
        }
    }

    /// State the next worktree for `name` will start with.
    pub fn preset(&self, name: &str) -> SharedWorktreeState {
        let state: SharedWorktreeState = Arc::default();
        self.presets
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::clone(&state));
        state
    }

    /// State of the most recent worktree planned or restored for `name`.
    pub fn state(&self, name: &str) -> Option<SharedWorktreeState> {
        self.states.lock().unwrap().get(name).cloned()
    }

    fn track(&self, name: &str, mut worktree: FakeWorktree) -> FakeWorktree {
        if let Some(state) = self.presets.lock().unwrap().remove(name) {
            worktree.state = state;
        }
        self.states
            .lock()
            .unwrap()
            .insert(name.to_string(), worktree.shared());
        worktree
    }
}

#[async_trait]
impl WorktreeFactory for FakeWorktreeFactory {
    async fn create(
        &self,
        repo_path: &Path,
        name: &str,
    ) -> Result<(Box<dyn Worktree>, String), WorktreeError> {
        if self.fail_create {
            return Err(WorktreeError::NotARepository(repo_path.to_path_buf()));
        }
        let branch = format!("ws/{name}");
        let worktree = FakeWorktree::new(repo_path.to_path_buf(), self.root.join(name), &branch);
        let worktree = self.track(name, worktree);
        Ok((Box::new(worktree), branch))
    }

    fn restore(&self, record: &WorktreeRecord) -> Box<dyn Worktree> {
        let name = record
            .worktree_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut worktree = FakeWorktree::new(
            record.repo_path.clone(),
            record.worktree_path.clone(),
            &record.branch_name,
        );
        worktree.base_commit_sha = record.base_commit_sha.clone();
        Box::new(self.track(&name, worktree))
    }
}

/// Observable and scriptable state of a [`FakeDevServer`].
#[derive(Debug, Default)]
pub struct FakeDevServerState {
    pub status: DevServerStatus,
    pub start_calls: usize,
    pub stop_calls: usize,
    pub health_checks: usize,
    pub attach_calls: usize,
    pub fail_stop: bool,
}

pub type SharedDevServerState = Arc<Mutex<FakeDevServerState>>;

pub struct FakeDevServer {
    config: DevServerConfig,
    output: Arc<OutputBuffer>,
    state: SharedDevServerState,
}

impl FakeDevServer {
    pub fn new() -> Self {
        Self {
            config: DevServerConfig {
                dev_command: "npm run dev".to_string(),
                ..DevServerConfig::default()
            },
            output: Arc::new(OutputBuffer::new()),
            state: Arc::default(),
        }
    }

    pub fn shared(&self) -> SharedDevServerState {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl DevServerControl for FakeDevServer {
    fn status(&self) -> DevServerStatus {
        self.state.lock().unwrap().status
    }

    fn config(&self) -> &DevServerConfig {
        &self.config
    }

    fn crash_count(&self) -> u32 {
        0
    }

    fn output(&self) -> String {
        self.output.snapshot()
    }

    fn output_buffer(&self) -> Arc<OutputBuffer> {
        Arc::clone(&self.output)
    }

    async fn session_exists(&self) -> bool {
        self.is_running()
    }

    async fn update_output(&mut self) {}

    async fn has_updated(&mut self) -> bool {
        false
    }

    async fn start(&mut self) -> Result<(), DevServerError> {
        let mut state = self.state.lock().unwrap();
        state.start_calls += 1;
        if state.status.is_active() {
            return Err(DevServerError::AlreadyRunning);
        }
        state.status = DevServerStatus::Running;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DevServerError> {
        let mut state = self.state.lock().unwrap();
        state.stop_calls += 1;
        state.status = DevServerStatus::Stopped;
        if state.fail_stop {
            return Err(DevServerError::StopFailed(SessionError::NotFound(
                "scripted_dev".to_string(),
            )));
        }
        Ok(())
    }

    async fn check_health(&mut self) {
        self.state.lock().unwrap().health_checks += 1;
    }

    async fn attach(&self) -> Result<oneshot::Receiver<()>, DevServerError> {
        let mut state = self.state.lock().unwrap();
        state.attach_calls += 1;
        if state.status != DevServerStatus::Running {
            return Err(DevServerError::NotRunning(state.status));
        }
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Ok(rx)
    }
}
