//! # Worksquad Library
//!
//! This crate runs several coding agents side by side, each on its own branch
//! and in its own reattachable terminal, without them stepping on each other.
//!
//! ## Overview
//!
//! - **Instances**: one agent working session, owning a git worktree and a
//!   tmux session, with start/pause/resume/kill semantics that keep both
//!   resources consistent under partial failure
//! - **Dev servers**: an optional auxiliary command per instance with build,
//!   launch, crash detection and a bounded output buffer
//! - **Scheduler**: the single control loop that owns the instances, serves
//!   operator commands and runs the background sweeps
//! - **Persistence**: per-repository state file and dev server settings
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Scheduler                           │
//! │      commands (mpsc) ─┐   metadata 500ms ─┐  preview 100ms  │
//! ├───────────────────────┴───────────────────┴─────────────────┤
//! │                                                              │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                       Instance                         │  │
//! │  │  ┌──────────────┐ ┌─────────────────┐ ┌─────────────┐  │  │
//! │  │  │   Worktree   │ │ TerminalSession │ │  DevServer  │  │  │
//! │  │  │    (git)     │ │     (tmux)      │ │   (tmux)    │  │  │
//! │  │  └──────────────┘ └─────────────────┘ └─────────────┘  │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                                                              │
//! │  StateStore (state.json)          settings (.worksquad/)     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`instance`]: Instance lifecycle, errors and rollback
//! - [`session`]: Terminal session contract and the tmux adapter
//! - [`worktree`]: Worktree contract and the git adapter
//! - [`devserver`]: Dev server supervision and output buffering
//! - [`scheduler`]: The control loop
//! - [`storage`]: Per-repository state file
//! - [`settings`]: Per-repository dev server settings
//! - [`clipboard`]: Best-effort clipboard writes
//! - [`logging`]: Tracing setup

pub mod clipboard;
pub mod config;
pub mod devserver;
pub mod instance;
pub mod logging;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod storage;
pub mod worktree;

#[cfg(test)]
pub(crate) mod testing;

// Re-export records for convenience
pub use records;

pub use config::{Config, ConfigError};
pub use devserver::{DevServer, DevServerControl, DevServerError, DevServerTimings, OutputBuffer};
pub use instance::{Backends, ErrorKind, Instance, InstanceError, InstanceOptions};
pub use scheduler::{
    NewInstance, Scheduler, SchedulerError, SchedulerEvent, SchedulerHandle, SchedulerSettings,
};
pub use session::{SessionError, SessionFactory, TerminalSession, TmuxSession, TmuxSessionFactory};
pub use storage::{StateStore, StoreError};
pub use worktree::{GitWorktree, GitWorktreeFactory, Worktree, WorktreeError, WorktreeFactory};
