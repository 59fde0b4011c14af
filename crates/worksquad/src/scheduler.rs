//! Scheduler for the instances of one repository.
//!
//! The [`Scheduler`] owns every [`Instance`] and runs as a single actor:
//! operator commands arrive over an mpsc channel with oneshot replies, and
//! two sweeps run on timers in the same `select!` loop:
//!
//! - **metadata** (500 ms): agent activity to `Running`/`Ready`, auto-confirm,
//!   diff statistics and dev server health;
//! - **preview** (100 ms): pane capture of the selected instance.
//!
//! Because commands and sweeps never run concurrently, no instance needs a
//! lock. Failures inside a sweep become [`SchedulerEvent::Notice`]s; they
//! never stop the loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use records::{DevServerConfig, DevServerStatus, InstanceStatus};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::instance::{Backends, Instance, InstanceError, InstanceOptions};
use crate::storage::{StateStore, StoreError};

/// Capacity of the event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Errors returned by scheduler operations.
#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The instance limit has been reached.
    #[error("you can't create more than {0} instances")]
    LimitReached(usize),

    /// Another instance already uses the title.
    #[error("instance with title '{0}' already exists")]
    DuplicateTitle(String),

    /// No instance has the title.
    #[error("instance '{0}' not found")]
    NotFound(String),

    /// An instance operation failed.
    #[error(transparent)]
    Instance(#[from] InstanceError),

    /// Reading or writing the state file failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The scheduler loop is gone.
    #[error("scheduler is not running")]
    Closed,
}

/// Events published by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    /// An instance changed status.
    StatusChanged {
        title: String,
        status: InstanceStatus,
    },
    /// A dev server's session disappeared.
    DevServerCrashed { title: String, crash_count: u32 },
    /// An instance was killed and removed.
    InstanceRemoved { title: String },
    /// A transient message for the operator.
    Notice { message: String },
}

/// Scheduler settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Path new instances work on.
    pub workspace: PathBuf,
    /// Default agent command.
    pub program: String,
    /// Default auto-confirm.
    pub auto_yes: bool,
    /// Instance limit.
    pub max_instances: usize,
    /// Metadata sweep period.
    pub metadata_interval: Duration,
    /// Preview sweep period.
    pub preview_interval: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &Config, workspace: PathBuf) -> Self {
        Self {
            workspace,
            program: config.session.program.clone(),
            auto_yes: config.session.auto_yes,
            max_instances: config.session.max_instances,
            metadata_interval: config.poller.metadata_interval(),
            preview_interval: config.poller.preview_interval(),
        }
    }
}

/// Request to create an instance.
#[derive(Debug, Clone, Default)]
pub struct NewInstance {
    pub title: String,
    /// Prompt sent once the agent is running.
    pub prompt: Option<String>,
    /// Overrides the default agent command.
    pub program: Option<String>,
    /// Overrides the default auto-confirm.
    pub auto_yes: Option<bool>,
}

/// Listing entry for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSummary {
    pub title: String,
    pub branch: String,
    pub status: InstanceStatus,
    pub program: String,
    pub path: PathBuf,
    pub worktree_path: Option<PathBuf>,
    pub added: usize,
    pub removed: usize,
    pub dev_server: Option<DevServerStatus>,
    pub created_at: DateTime<Utc>,
}

impl InstanceSummary {
    fn of(instance: &Instance) -> Self {
        let (added, removed) = instance
            .diff_stats()
            .map(|d| (d.added, d.removed))
            .unwrap_or_default();
        Self {
            title: instance.title().to_string(),
            branch: instance.branch().to_string(),
            status: instance.status(),
            program: instance.program().to_string(),
            path: instance.path().to_path_buf(),
            worktree_path: instance.worktree_path().map(PathBuf::from),
            added,
            removed,
            dev_server: instance.dev_server().map(|d| d.status()),
            created_at: instance.created_at(),
        }
    }
}

/// Dev server state of one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DevServerSummary {
    pub status: DevServerStatus,
    pub crash_count: u32,
    pub config: DevServerConfig,
    pub output: String,
}

type Reply<T> = oneshot::Sender<Result<T, SchedulerError>>;

/// Commands accepted by the scheduler loop.
pub enum Command {
    Create {
        request: NewInstance,
        reply: Reply<InstanceSummary>,
    },
    Pause {
        title: String,
        reply: Reply<()>,
    },
    Resume {
        title: String,
        reply: Reply<()>,
    },
    Kill {
        title: String,
        reply: Reply<()>,
    },
    SendPrompt {
        title: String,
        text: String,
        reply: Reply<()>,
    },
    Attach {
        title: String,
        reply: Reply<oneshot::Receiver<()>>,
    },
    StartDevServer {
        title: String,
        reply: Reply<()>,
    },
    StopDevServer {
        title: String,
        reply: Reply<()>,
    },
    DevServerInfo {
        title: String,
        reply: Reply<Option<DevServerSummary>>,
    },
    AttachDevServer {
        title: String,
        reply: Reply<oneshot::Receiver<()>>,
    },
    /// `title: None` applies to every instance that has a dev server.
    ReconfigureDevServer {
        title: Option<String>,
        config: DevServerConfig,
        reply: Reply<Vec<String>>,
    },
    Select {
        title: String,
        reply: Reply<()>,
    },
    Preview {
        title: String,
        reply: Reply<String>,
    },
    List {
        reply: oneshot::Sender<Vec<InstanceSummary>>,
    },
    Save {
        reply: Reply<()>,
    },
}

/// Cloneable client for a running scheduler loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

/// Creates a handle and the command receiver to pass to [`Scheduler::run`].
pub fn channel() -> (SchedulerHandle, mpsc::Receiver<Command>) {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    (SchedulerHandle { tx }, rx)
}

impl SchedulerHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)?
    }

    pub async fn create(&self, request: NewInstance) -> Result<InstanceSummary, SchedulerError> {
        self.request(|reply| Command::Create { request, reply }).await
    }

    pub async fn pause(&self, title: &str) -> Result<(), SchedulerError> {
        let title = title.to_string();
        self.request(|reply| Command::Pause { title, reply }).await
    }

    pub async fn resume(&self, title: &str) -> Result<(), SchedulerError> {
        let title = title.to_string();
        self.request(|reply| Command::Resume { title, reply }).await
    }

    pub async fn kill(&self, title: &str) -> Result<(), SchedulerError> {
        let title = title.to_string();
        self.request(|reply| Command::Kill { title, reply }).await
    }

    pub async fn send_prompt(&self, title: &str, text: &str) -> Result<(), SchedulerError> {
        let (title, text) = (title.to_string(), text.to_string());
        self.request(|reply| Command::SendPrompt { title, text, reply })
            .await
    }

    pub async fn attach(&self, title: &str) -> Result<oneshot::Receiver<()>, SchedulerError> {
        let title = title.to_string();
        self.request(|reply| Command::Attach { title, reply }).await
    }

    pub async fn start_dev_server(&self, title: &str) -> Result<(), SchedulerError> {
        let title = title.to_string();
        self.request(|reply| Command::StartDevServer { title, reply })
            .await
    }

    pub async fn stop_dev_server(&self, title: &str) -> Result<(), SchedulerError> {
        let title = title.to_string();
        self.request(|reply| Command::StopDevServer { title, reply })
            .await
    }

    pub async fn dev_server_status(
        &self,
        title: &str,
    ) -> Result<Option<DevServerSummary>, SchedulerError> {
        let title = title.to_string();
        self.request(|reply| Command::DevServerInfo { title, reply })
            .await
    }

    pub async fn attach_dev_server(
        &self,
        title: &str,
    ) -> Result<oneshot::Receiver<()>, SchedulerError> {
        let title = title.to_string();
        self.request(|reply| Command::AttachDevServer { title, reply })
            .await
    }

    pub async fn reconfigure_dev_servers(
        &self,
        title: Option<&str>,
        config: DevServerConfig,
    ) -> Result<Vec<String>, SchedulerError> {
        let title = title.map(str::to_string);
        self.request(|reply| Command::ReconfigureDevServer { title, config, reply })
            .await
    }

    pub async fn select(&self, title: &str) -> Result<(), SchedulerError> {
        let title = title.to_string();
        self.request(|reply| Command::Select { title, reply }).await
    }

    pub async fn preview(&self, title: &str) -> Result<String, SchedulerError> {
        let title = title.to_string();
        self.request(|reply| Command::Preview { title, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<InstanceSummary>, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::List { reply })
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    pub async fn save(&self) -> Result<(), SchedulerError> {
        self.request(|reply| Command::Save { reply }).await
    }
}

/// Owns the instances of one repository and drives their background sweeps.
pub struct Scheduler {
    settings: SchedulerSettings,
    instances: Vec<Instance>,
    store: StateStore,
    backends: Backends,
    selected: Option<String>,
    previews: HashMap<String, String>,
    event_tx: broadcast::Sender<SchedulerEvent>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new(settings: SchedulerSettings, store: StateStore, backends: Backends) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings,
            instances: Vec::new(),
            store,
            backends,
            selected: None,
            previews: HashMap::new(),
            event_tx,
        }
    }

    /// Returns a receiver for scheduler events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    fn emit_event(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn notice(&self, message: String) {
        warn!(message = %message, "Notice");
        self.emit_event(SchedulerEvent::Notice { message });
    }

    /// Restores persisted instances. An instance whose agent session is gone
    /// comes back paused with its worktree, so it can still be resumed or
    /// killed.
    pub async fn load(&mut self) -> Result<usize, SchedulerError> {
        let state = self.store.load()?;
        for record in state.instances {
            let title = record.title.clone();
            if self.get(&title).is_some() {
                warn!(instance = %title, "Skipping duplicate record");
                continue;
            }
            match Instance::from_record(record.clone(), self.backends.clone()).await {
                Ok(instance) => {
                    debug!(instance = %title, status = %instance.status(), "Instance restored");
                    self.instances.push(instance);
                }
                Err(e) => {
                    error!(instance = %title, error = %e, "Failed to restore instance");
                    self.notice(format!(
                        "failed to restore '{title}': {e}; it is paused, resume it to relaunch the agent"
                    ));
                    let instance =
                        Instance::from_record_detached(record, self.backends.clone()).await;
                    self.instances.push(instance);
                }
            }
        }
        info!(count = self.instances.len(), "Instances loaded");
        Ok(self.instances.len())
    }

    /// Writes every started instance to the state file.
    pub fn save(&self) -> Result<(), SchedulerError> {
        let records = self
            .instances
            .iter()
            .filter(|i| i.started())
            .map(Instance::to_record)
            .collect();
        self.store.save_instances(records)?;
        Ok(())
    }

    /// Number of managed instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Looks an instance up by title.
    pub fn get(&self, title: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.title() == title)
    }

    /// Mutable lookup by title.
    pub fn get_mut(&mut self, title: &str) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.title() == title)
    }

    fn require(&mut self, title: &str) -> Result<&mut Instance, SchedulerError> {
        self.instances
            .iter_mut()
            .find(|i| i.title() == title)
            .ok_or_else(|| SchedulerError::NotFound(title.to_string()))
    }

    /// Listing of every instance in creation order.
    pub fn summaries(&self) -> Vec<InstanceSummary> {
        self.instances.iter().map(InstanceSummary::of).collect()
    }

    /// Creates and starts an instance, then sends its initial prompt.
    pub async fn create(
        &mut self,
        request: NewInstance,
    ) -> Result<InstanceSummary, SchedulerError> {
        if self.instances.len() >= self.settings.max_instances {
            return Err(SchedulerError::LimitReached(self.settings.max_instances));
        }
        if self.get(&request.title).is_some() {
            return Err(SchedulerError::DuplicateTitle(request.title));
        }

        let options = InstanceOptions {
            title: request.title,
            path: self.settings.workspace.clone(),
            program: request.program.unwrap_or_else(|| self.settings.program.clone()),
            auto_yes: request.auto_yes.unwrap_or(self.settings.auto_yes),
        };
        let mut instance = Instance::new(options, self.backends.clone())?;
        if let Some(prompt) = request.prompt {
            instance.set_prompt(prompt);
        }

        instance.set_status(InstanceStatus::Loading);
        self.emit_status(&instance);
        instance.start(true).await?;
        self.emit_status(&instance);

        if let Some(prompt) = instance.take_prompt() {
            if let Err(e) = instance.send_prompt(&prompt).await {
                self.notice(format!("failed to send prompt to '{}': {e}", instance.title()));
            }
        }

        let summary = InstanceSummary::of(&instance);
        self.instances.push(instance);
        self.save()?;
        Ok(summary)
    }

    /// Pauses an instance.
    pub async fn pause(&mut self, title: &str) -> Result<(), SchedulerError> {
        self.require(title)?.pause().await?;
        self.previews.remove(title);
        self.emit_status_of(title);
        self.save()
    }

    /// Resumes a paused instance.
    pub async fn resume(&mut self, title: &str) -> Result<(), SchedulerError> {
        self.require(title)?.resume().await?;
        self.emit_status_of(title);
        self.save()
    }

    /// Kills an instance and removes it. An instance whose kill failed stays
    /// listed so the kill can be retried.
    pub async fn kill(&mut self, title: &str) -> Result<(), SchedulerError> {
        self.require(title)?.kill().await?;

        self.instances.retain(|i| i.title() != title);
        self.previews.remove(title);
        if self.selected.as_deref() == Some(title) {
            self.selected = None;
        }
        info!(instance = %title, "Instance removed");
        self.emit_event(SchedulerEvent::InstanceRemoved {
            title: title.to_string(),
        });
        self.save()
    }

    /// Sends a prompt to an instance's agent.
    pub async fn send_prompt(&mut self, title: &str, text: &str) -> Result<(), SchedulerError> {
        self.require(title)?.send_prompt(text).await?;
        Ok(())
    }

    /// Attaches the operator's terminal to an instance.
    pub async fn attach(&mut self, title: &str) -> Result<oneshot::Receiver<()>, SchedulerError> {
        Ok(self.require(title)?.attach().await?)
    }

    /// Starts an instance's dev server, creating it from the repository's
    /// settings on first use.
    pub async fn start_dev_server(&mut self, title: &str) -> Result<(), SchedulerError> {
        self.require(title)?.start_dev_server().await?;
        self.save()
    }

    /// Stops an instance's dev server.
    pub async fn stop_dev_server(&mut self, title: &str) -> Result<(), SchedulerError> {
        self.require(title)?.stop_dev_server().await?;
        self.save()
    }

    /// Dev server state of an instance, if it has one.
    pub async fn dev_server_status(
        &mut self,
        title: &str,
    ) -> Result<Option<DevServerSummary>, SchedulerError> {
        let instance = self.require(title)?;
        let Some(server) = instance.dev_server_mut() else {
            return Ok(None);
        };
        server.update_output().await;
        Ok(Some(DevServerSummary {
            status: server.status(),
            crash_count: server.crash_count(),
            config: server.config().clone(),
            output: server.output(),
        }))
    }

    /// Attaches the operator's terminal to an instance's running dev server.
    pub async fn attach_dev_server(
        &mut self,
        title: &str,
    ) -> Result<oneshot::Receiver<()>, SchedulerError> {
        Ok(self.require(title)?.attach_dev_server().await?)
    }

    /// Stops an instance's dev server and replaces it with one built from
    /// `config`.
    pub async fn reconfigure_dev_server(
        &mut self,
        title: &str,
        config: DevServerConfig,
    ) -> Result<(), SchedulerError> {
        self.require(title)?.reconfigure_dev_server(config).await?;
        self.save()
    }

    /// Applies `config` to every instance that already has a dev server and
    /// returns their titles. Instances without one pick the settings up on
    /// their first start.
    pub async fn reconfigure_dev_servers(
        &mut self,
        config: DevServerConfig,
    ) -> Result<Vec<String>, SchedulerError> {
        let mut reconfigured = Vec::new();
        for instance in &mut self.instances {
            if instance.dev_server().is_none() {
                continue;
            }
            match instance.reconfigure_dev_server(config.clone()).await {
                Ok(()) => reconfigured.push(instance.title().to_string()),
                Err(e) => {
                    warn!(
                        instance = %instance.title(),
                        error = %e,
                        "Failed to reconfigure dev server"
                    );
                }
            }
        }
        self.save()?;
        Ok(reconfigured)
    }

    /// Chooses the instance the preview sweep follows.
    pub fn select(&mut self, title: &str) -> Result<(), SchedulerError> {
        if self.get(title).is_none() {
            return Err(SchedulerError::NotFound(title.to_string()));
        }
        self.selected = Some(title.to_string());
        Ok(())
    }

    /// The instance the preview sweep follows: the selection, else the first.
    pub fn selected(&self) -> Option<&Instance> {
        match &self.selected {
            Some(title) => self.get(title),
            None => self.instances.first(),
        }
    }

    /// Last captured preview of an instance, capturing now if none is cached.
    pub async fn preview(&mut self, title: &str) -> Result<String, SchedulerError> {
        if let Some(cached) = self.previews.get(title) {
            return Ok(cached.clone());
        }
        let content = self
            .get(title)
            .ok_or_else(|| SchedulerError::NotFound(title.to_string()))?
            .preview()
            .await?;
        self.previews.insert(title.to_string(), content.clone());
        Ok(content)
    }

    fn emit_status(&self, instance: &Instance) {
        self.emit_event(SchedulerEvent::StatusChanged {
            title: instance.title().to_string(),
            status: instance.status(),
        });
    }

    fn emit_status_of(&self, title: &str) {
        if let Some(instance) = self.get(title) {
            self.emit_status(instance);
        }
    }

    /// Refreshes status, diff statistics and dev server health of every
    /// running instance.
    pub async fn metadata_tick(&mut self) {
        let mut events = Vec::new();

        for instance in &mut self.instances {
            if !instance.started() || instance.paused() {
                continue;
            }

            let before = instance.status();
            let (updated, has_prompt) = instance.has_updated().await;
            if updated {
                instance.set_status(InstanceStatus::Running);
            } else if has_prompt {
                instance.tap_enter().await;
            } else {
                instance.set_status(InstanceStatus::Ready);
            }
            if instance.status() != before {
                events.push(SchedulerEvent::StatusChanged {
                    title: instance.title().to_string(),
                    status: instance.status(),
                });
            }

            if let Err(e) = instance.update_diff_stats().await {
                warn!(instance = %instance.title(), error = %e, "Failed to update diff stats");
            }

            let title = instance.title().to_string();
            if let Some(server) = instance.dev_server_mut() {
                let crashes = server.crash_count();
                server.check_health().await;
                if server.crash_count() > crashes {
                    events.push(SchedulerEvent::DevServerCrashed {
                        title,
                        crash_count: server.crash_count(),
                    });
                }
            }
        }

        for event in events {
            self.emit_event(event);
        }
    }

    /// Captures the selected instance's pane and its dev server output.
    pub async fn preview_tick(&mut self) {
        let title = match self.selected() {
            Some(instance) if instance.started() && !instance.paused() => {
                instance.title().to_string()
            }
            _ => return,
        };

        let Some(instance) = self.get_mut(&title) else {
            return;
        };
        let content = instance.preview().await;
        if let Some(server) = instance.dev_server_mut() {
            if server.is_running() {
                server.update_output().await;
            }
        }

        match content {
            Ok(content) => {
                self.previews.insert(title, content);
            }
            Err(e) => debug!(instance = %title, error = %e, "Preview capture failed"),
        }
    }

    /// Stops running dev servers and saves.
    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        info!("Scheduler shutting down");
        for instance in &mut self.instances {
            let running = instance.dev_server().is_some_and(|d| d.is_running());
            if running {
                if let Err(e) = instance.stop_dev_server().await {
                    warn!(instance = %instance.title(), error = %e, "Failed to stop dev server");
                }
            }
        }
        self.save()
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Create { request, reply } => {
                let _ = reply.send(self.create(request).await);
            }
            Command::Pause { title, reply } => {
                let _ = reply.send(self.pause(&title).await);
            }
            Command::Resume { title, reply } => {
                let _ = reply.send(self.resume(&title).await);
            }
            Command::Kill { title, reply } => {
                let _ = reply.send(self.kill(&title).await);
            }
            Command::SendPrompt { title, text, reply } => {
                let _ = reply.send(self.send_prompt(&title, &text).await);
            }
            Command::Attach { title, reply } => {
                let _ = reply.send(self.attach(&title).await);
            }
            Command::StartDevServer { title, reply } => {
                let _ = reply.send(self.start_dev_server(&title).await);
            }
            Command::StopDevServer { title, reply } => {
                let _ = reply.send(self.stop_dev_server(&title).await);
            }
            Command::DevServerInfo { title, reply } => {
                let _ = reply.send(self.dev_server_status(&title).await);
            }
            Command::AttachDevServer { title, reply } => {
                let _ = reply.send(self.attach_dev_server(&title).await);
            }
            Command::ReconfigureDevServer {
                title: Some(title),
                config,
                reply,
            } => {
                let result = self
                    .reconfigure_dev_server(&title, config)
                    .await
                    .map(|()| vec![title]);
                let _ = reply.send(result);
            }
            Command::ReconfigureDevServer {
                title: None,
                config,
                reply,
            } => {
                let _ = reply.send(self.reconfigure_dev_servers(config).await);
            }
            Command::Select { title, reply } => {
                let _ = reply.send(self.select(&title));
            }
            Command::Preview { title, reply } => {
                let _ = reply.send(self.preview(&title).await);
            }
            Command::List { reply } => {
                let _ = reply.send(self.summaries());
            }
            Command::Save { reply } => {
                let _ = reply.send(self.save());
            }
        }
    }

    /// Serves commands and runs the sweeps until `shutdown_token` is
    /// cancelled or every handle is dropped, then shuts down.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        shutdown_token: CancellationToken,
    ) -> Result<(), SchedulerError> {
        let mut metadata = tokio::time::interval(self.settings.metadata_interval);
        metadata.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut preview = tokio::time::interval(self.settings.preview_interval);
        preview.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(instances = self.instances.len(), "Scheduler running");
        loop {
            tokio::select! {
                biased;
                _ = shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("All scheduler handles dropped");
                        break;
                    }
                },
                _ = metadata.tick() => self.metadata_tick().await,
                _ = preview.tick() => self.preview_tick().await,
            }
        }

        self.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devserver::{DevServer, DevServerTimings};
    use crate::testing::{FakeDevServer, FakeSessionFactory, FakeWorktreeFactory, SessionEvent};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Harness {
        sessions: Arc<FakeSessionFactory>,
        worktrees: Arc<FakeWorktreeFactory>,
        dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir_all(dir.path().join("repo")).unwrap();
            Self {
                sessions: Arc::new(FakeSessionFactory::default()),
                worktrees: Arc::new(FakeWorktreeFactory::new(&dir.path().join("worktrees"))),
                dir,
            }
        }

        fn backends(&self) -> Backends {
            Backends {
                sessions: self.sessions.clone(),
                worktrees: self.worktrees.clone(),
                clipboard: None,
                dev_server_timings: DevServerTimings {
                    grace_period: Duration::from_millis(10),
                    start_timeout: Duration::from_millis(200),
                },
            }
        }

        fn settings(&self, max_instances: usize) -> SchedulerSettings {
            SchedulerSettings {
                workspace: self.dir.path().join("repo"),
                program: "claude".to_string(),
                auto_yes: false,
                max_instances,
                metadata_interval: Duration::from_millis(500),
                preview_interval: Duration::from_millis(100),
            }
        }

        fn store(&self) -> StateStore {
            StateStore::new(self.dir.path().join("state.json"))
        }

        fn scheduler(&self, max_instances: usize) -> Scheduler {
            Scheduler::new(self.settings(max_instances), self.store(), self.backends())
        }
    }

    fn named(title: &str) -> NewInstance {
        NewInstance {
            title: title.to_string(),
            ..NewInstance::default()
        }
    }

    #[tokio::test]
    async fn test_create_starts_and_saves() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        let mut events = scheduler.subscribe();

        let summary = scheduler.create(named("t1")).await.unwrap();
        assert_eq!(summary.status, InstanceStatus::Running);
        assert_eq!(summary.branch, "ws/t1");
        assert_eq!(scheduler.len(), 1);

        assert_eq!(
            events.recv().await.unwrap(),
            SchedulerEvent::StatusChanged {
                title: "t1".to_string(),
                status: InstanceStatus::Loading
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            SchedulerEvent::StatusChanged {
                title: "t1".to_string(),
                status: InstanceStatus::Running
            }
        );

        let state = h.store().load().unwrap();
        assert_eq!(state.instances.len(), 1);
        assert_eq!(state.instances[0].title, "t1");
    }

    #[tokio::test]
    async fn test_create_enforces_limit() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(2);
        scheduler.create(named("t1")).await.unwrap();
        scheduler.create(named("t2")).await.unwrap();

        let err = scheduler.create(named("t3")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::LimitReached(2)));
        assert_eq!(scheduler.len(), 2);
        assert!(h.sessions.state("t3").is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_title() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler.create(named("t1")).await.unwrap();

        let err = scheduler.create(named("t1")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTitle(ref t) if t == "t1"));
        assert_eq!(h.sessions.created().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_create_is_not_listed() {
        let h = Harness::new();
        h.sessions.preset("t1").lock().unwrap().fail_start = true;
        let mut scheduler = h.scheduler(10);

        let err = scheduler.create(named("t1")).await.unwrap_err();
        assert!(err.to_string().starts_with("failed to start new session"));
        assert!(scheduler.is_empty());

        let err = scheduler.create(named("")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Instance(InstanceError::EmptyTitle)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_sends_initial_prompt() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler
            .create(NewInstance {
                title: "t1".to_string(),
                prompt: Some("fix the tests".to_string()),
                program: Some("aider".to_string()),
                auto_yes: Some(true),
            })
            .await
            .unwrap();

        assert_eq!(h.sessions.created(), vec![("t1".to_string(), "aider".to_string())]);
        let session = h.sessions.state("t1").unwrap();
        let session = session.lock().unwrap();
        assert_eq!(session.sent_keys(), vec!["fix the tests".to_string()]);
        assert_eq!(session.events.last().map(|e| &e.1), Some(&SessionEvent::Enter));
        assert!(scheduler.get("t1").unwrap().auto_yes());
    }

    #[tokio::test]
    async fn test_pause_resume_kill_by_title() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        let mut events = scheduler.subscribe();
        scheduler.create(named("t1")).await.unwrap();

        scheduler.pause("t1").await.unwrap();
        assert!(scheduler.get("t1").unwrap().paused());
        scheduler.resume("t1").await.unwrap();
        assert_eq!(scheduler.get("t1").unwrap().status(), InstanceStatus::Running);

        scheduler.kill("t1").await.unwrap();
        assert!(scheduler.is_empty());
        assert!(h.store().load().unwrap().instances.is_empty());

        let mut removed = false;
        while let Ok(event) = events.try_recv() {
            removed |= event == SchedulerEvent::InstanceRemoved { title: "t1".to_string() };
        }
        assert!(removed);

        let err = scheduler.pause("t1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_kill_keeps_instance() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler.create(named("t1")).await.unwrap();
        h.worktrees.state("t1").unwrap().lock().unwrap().fail_cleanup = true;

        assert!(scheduler.kill("t1").await.is_err());
        assert_eq!(scheduler.len(), 1);

        h.worktrees.state("t1").unwrap().lock().unwrap().fail_cleanup = false;
        scheduler.kill("t1").await.unwrap();
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_metadata_tick_sets_status() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler.create(named("t1")).await.unwrap();
        let session = h.sessions.state("t1").unwrap();

        scheduler.metadata_tick().await;
        assert_eq!(scheduler.get("t1").unwrap().status(), InstanceStatus::Ready);

        session.lock().unwrap().updated = true;
        scheduler.metadata_tick().await;
        assert_eq!(scheduler.get("t1").unwrap().status(), InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_metadata_tick_auto_confirms_prompt() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler
            .create(NewInstance {
                auto_yes: Some(true),
                ..named("t1")
            })
            .await
            .unwrap();
        let session = h.sessions.state("t1").unwrap();
        session.lock().unwrap().has_prompt = true;

        scheduler.metadata_tick().await;

        let events = session.lock().unwrap().events.clone();
        assert_eq!(events.last().map(|e| &e.1), Some(&SessionEvent::Enter));
        assert_eq!(scheduler.get("t1").unwrap().status(), InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_metadata_tick_skips_paused() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler.create(named("t1")).await.unwrap();
        scheduler.pause("t1").await.unwrap();

        scheduler.metadata_tick().await;
        assert_eq!(scheduler.get("t1").unwrap().status(), InstanceStatus::Paused);
    }

    #[tokio::test]
    async fn test_metadata_tick_reports_dev_server_crash_once() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler.create(named("t1")).await.unwrap();

        let instance = scheduler.get_mut("t1").unwrap();
        let server = DevServer::new(
            DevServerConfig {
                dev_command: "npm run dev".to_string(),
                ..DevServerConfig::default()
            },
            instance.worktree_path().unwrap().to_path_buf(),
            "t1",
            h.sessions.clone(),
            h.backends().dev_server_timings,
        );
        instance.set_dev_server(Box::new(server));
        scheduler.start_dev_server("t1").await.unwrap();

        let mut events = scheduler.subscribe();
        h.sessions.state("t1_dev").unwrap().lock().unwrap().exists = false;
        scheduler.metadata_tick().await;
        scheduler.metadata_tick().await;

        let crashes: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, SchedulerEvent::DevServerCrashed { .. }))
            .collect();
        assert_eq!(
            crashes,
            vec![SchedulerEvent::DevServerCrashed {
                title: "t1".to_string(),
                crash_count: 1
            }]
        );

        let status = scheduler.dev_server_status("t1").await.unwrap().unwrap();
        assert_eq!(status.status, DevServerStatus::Crashed);
        assert!(status.output.contains("Crash count: 1"));
    }

    #[tokio::test]
    async fn test_dev_server_without_settings() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler.create(named("t1")).await.unwrap();

        assert!(scheduler.dev_server_status("t1").await.unwrap().is_none());
        let err = scheduler.start_dev_server("t1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Instance(InstanceError::NoDevServer)));
    }

    #[tokio::test]
    async fn test_preview_tick_follows_selection() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler.create(named("t1")).await.unwrap();
        scheduler.create(named("t2")).await.unwrap();
        h.sessions.state("t1").unwrap().lock().unwrap().pane = "one".to_string();
        h.sessions.state("t2").unwrap().lock().unwrap().pane = "two".to_string();

        scheduler.preview_tick().await;
        assert_eq!(scheduler.previews.get("t1").map(String::as_str), Some("one"));
        assert!(!scheduler.previews.contains_key("t2"));

        scheduler.select("t2").unwrap();
        scheduler.preview_tick().await;
        assert_eq!(scheduler.preview("t2").await.unwrap(), "two");
        assert!(scheduler.select("nope").is_err());
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let h = Harness::new();
        {
            let mut scheduler = h.scheduler(10);
            scheduler.create(named("t1")).await.unwrap();
            scheduler.create(named("t2")).await.unwrap();
            scheduler.pause("t1").await.unwrap();
        }

        // t2's agent survived; t1 is paused and needs no session.
        h.sessions.preset("t2").lock().unwrap().exists = true;
        let mut scheduler = h.scheduler(10);
        assert_eq!(scheduler.load().await.unwrap(), 2);

        assert!(scheduler.get("t1").unwrap().paused());
        assert_eq!(scheduler.get("t2").unwrap().status(), InstanceStatus::Running);
        scheduler.resume("t1").await.unwrap();
    }

    #[tokio::test]
    async fn test_instance_with_lost_session_comes_back_paused() {
        let h = Harness::new();
        {
            let mut scheduler = h.scheduler(10);
            scheduler.create(named("t1")).await.unwrap();
        }

        // Sessions created from here on do not exist, as after a reboot.
        let mut scheduler = h.scheduler(10);
        let mut events = scheduler.subscribe();
        assert_eq!(scheduler.load().await.unwrap(), 1);
        assert!(matches!(events.try_recv().unwrap(), SchedulerEvent::Notice { .. }));

        let summaries = scheduler.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, InstanceStatus::Paused);

        let err = scheduler.create(named("t1")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTitle(_)));

        scheduler.save().unwrap();
        let saved = h.store().load().unwrap().instances;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].status, InstanceStatus::Paused);
    }

    #[tokio::test]
    async fn test_instance_with_lost_session_counts_toward_limit() {
        let h = Harness::new();
        {
            let mut scheduler = h.scheduler(1);
            scheduler.create(named("t1")).await.unwrap();
        }

        let mut scheduler = h.scheduler(1);
        scheduler.load().await.unwrap();
        let err = scheduler.create(named("t2")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::LimitReached(1)));
    }

    #[tokio::test]
    async fn test_instance_with_lost_session_can_be_killed() {
        let h = Harness::new();
        let worktree_path = {
            let mut scheduler = h.scheduler(10);
            let summary = scheduler.create(named("t1")).await.unwrap();
            summary.worktree_path.unwrap()
        };

        let mut scheduler = h.scheduler(10);
        scheduler.load().await.unwrap();
        scheduler.kill("t1").await.unwrap();

        assert!(scheduler.is_empty());
        assert!(!worktree_path.exists());
        let worktree = h.worktrees.state("t1").unwrap();
        assert_eq!(worktree.lock().unwrap().cleanup_calls, 1);
        assert!(h.store().load().unwrap().instances.is_empty());

        // The title is free again.
        scheduler.create(named("t1")).await.unwrap();
        assert_eq!(h.store().load().unwrap().instances.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_dev_servers() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler.create(named("t1")).await.unwrap();
        let server = FakeDevServer::new();
        let state = server.shared();
        scheduler.get_mut("t1").unwrap().set_dev_server(Box::new(server));
        scheduler.start_dev_server("t1").await.unwrap();
        scheduler.metadata_tick().await;
        assert_eq!(state.lock().unwrap().start_calls, 1);
        assert_eq!(state.lock().unwrap().health_checks, 1);

        scheduler.shutdown().await.unwrap();
        assert_eq!(state.lock().unwrap().stop_calls, 1);
        assert_eq!(state.lock().unwrap().status, DevServerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_attach_dev_server_by_title() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler.create(named("t1")).await.unwrap();

        let err = scheduler.attach_dev_server("t1").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Instance(InstanceError::NoDevServer)));
        let err = scheduler.attach_dev_server("nope").await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));

        let server = FakeDevServer::new();
        let state = server.shared();
        scheduler.get_mut("t1").unwrap().set_dev_server(Box::new(server));
        assert!(scheduler.attach_dev_server("t1").await.is_err());

        scheduler.start_dev_server("t1").await.unwrap();
        let detached = scheduler.attach_dev_server("t1").await.unwrap();
        detached.await.unwrap();
        assert_eq!(state.lock().unwrap().attach_calls, 2);
    }

    #[tokio::test]
    async fn test_reconfigure_applies_to_instances_with_dev_server() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler.create(named("t1")).await.unwrap();
        scheduler.create(named("t2")).await.unwrap();
        let server = FakeDevServer::new();
        let state = server.shared();
        scheduler.get_mut("t1").unwrap().set_dev_server(Box::new(server));
        scheduler.start_dev_server("t1").await.unwrap();

        let config = DevServerConfig {
            dev_command: "pnpm dev".to_string(),
            ..DevServerConfig::default()
        };
        let reconfigured = scheduler.reconfigure_dev_servers(config.clone()).await.unwrap();

        assert_eq!(reconfigured, vec!["t1".to_string()]);
        assert_eq!(state.lock().unwrap().stop_calls, 1);
        let status = scheduler.dev_server_status("t1").await.unwrap().unwrap();
        assert_eq!(status.status, DevServerStatus::Stopped);
        assert_eq!(status.config, config);
        assert!(scheduler.dev_server_status("t2").await.unwrap().is_none());

        let saved = h.store().load().unwrap();
        let t1 = saved.instances.iter().find(|r| r.title == "t1").unwrap();
        assert_eq!(t1.dev_server.as_ref().unwrap().config, config);
    }

    #[tokio::test]
    async fn test_reconfigure_single_instance_creates_dev_server() {
        let h = Harness::new();
        let mut scheduler = h.scheduler(10);
        scheduler.create(named("t1")).await.unwrap();

        let config = DevServerConfig {
            dev_command: "npm start".to_string(),
            ..DevServerConfig::default()
        };
        scheduler.reconfigure_dev_server("t1", config.clone()).await.unwrap();
        scheduler.start_dev_server("t1").await.unwrap();

        let status = scheduler.dev_server_status("t1").await.unwrap().unwrap();
        assert_eq!(status.status, DevServerStatus::Running);
        assert_eq!(status.config, config);
        assert!(h.sessions.state("t1_dev").is_some());
    }

    #[tokio::test]
    async fn test_run_serves_handle_until_cancelled() {
        let h = Harness::new();
        let scheduler = h.scheduler(1);
        let (handle, commands) = channel();
        let token = CancellationToken::new();
        let task = tokio::spawn(scheduler.run(commands, token.clone()));

        handle.create(named("t1")).await.unwrap();
        let err = handle.create(named("t2")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::LimitReached(1)));

        let list = handle.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title, "t1");
        handle.send_prompt("t1", "hi").await.unwrap();
        handle.pause("t1").await.unwrap();

        token.cancel();
        task.await.unwrap().unwrap();

        assert!(matches!(handle.list().await, Err(SchedulerError::Closed)));
        let state = h.store().load().unwrap();
        assert_eq!(state.instances[0].status, InstanceStatus::Paused);
    }
}
