//! # Worksquad Records Library
//!
//! This crate defines the on-disk schemas shared by the worksquad engine and
//! any tool that inspects its state.
//!
//! ## Overview
//!
//! - **Instance records**: one JSON object per working session, including its
//!   worktree coordinates, last diff statistics and dev server state
//! - **State file**: the per-repository file holding the instance array
//! - **Dev server settings**: the project-wide defaults kept in the repository
//!
//! Status enums serialize as integers so older state files keep loading.
//!
//! ## Modules
//!
//! - [`instance`]: Instance, worktree, diff and dev server records
//! - [`state`]: The per-repository state file
//! - [`settings`]: Dev server settings
//! - [`error`]: Error types

pub mod error;
pub mod instance;
pub mod settings;
pub mod state;

pub use error::{RecordError, Result};
pub use instance::{
    DevServerConfig, DevServerRecord, DevServerStatus, DiffStatsRecord, InstanceRecord,
    InstanceStatus, WorktreeRecord,
};
pub use settings::{DevServerSettings, SETTINGS_DIR, SETTINGS_FILE_NAME};
pub use state::{StateFile, STATE_FILE_NAME};
