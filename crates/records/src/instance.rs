//! Persisted instance records.
//!
//! One [`InstanceRecord`] is written per working session. Status fields are
//! stored as small integers so that state files stay compatible across
//! releases that only append new states.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RecordError;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum InstanceStatus {
    /// The agent is producing output.
    Running,
    /// The agent is idle and waiting for input.
    #[default]
    Ready,
    /// Resources are being acquired.
    Loading,
    /// The terminal is detached and the work is committed locally.
    Paused,
}

impl From<InstanceStatus> for u8 {
    fn from(status: InstanceStatus) -> Self {
        match status {
            InstanceStatus::Running => 0,
            InstanceStatus::Ready => 1,
            InstanceStatus::Loading => 2,
            InstanceStatus::Paused => 3,
        }
    }
}

impl TryFrom<u8> for InstanceStatus {
    type Error = RecordError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(InstanceStatus::Running),
            1 => Ok(InstanceStatus::Ready),
            2 => Ok(InstanceStatus::Loading),
            3 => Ok(InstanceStatus::Paused),
            other => Err(RecordError::UnknownInstanceStatus(other)),
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Ready => "ready",
            InstanceStatus::Loading => "loading",
            InstanceStatus::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Status of a dev server supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DevServerStatus {
    /// No process is running.
    #[default]
    Stopped,
    /// The build command is running.
    Building,
    /// The dev command has been launched and its session is not yet visible.
    Starting,
    /// The dev command's session is alive.
    Running,
    /// The session disappeared while it was supposed to be running.
    Crashed,
}

impl DevServerStatus {
    /// Whether a start request must be rejected in this state.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DevServerStatus::Running | DevServerStatus::Starting | DevServerStatus::Building
        )
    }
}

impl From<DevServerStatus> for u8 {
    fn from(status: DevServerStatus) -> Self {
        match status {
            DevServerStatus::Stopped => 0,
            DevServerStatus::Building => 1,
            DevServerStatus::Starting => 2,
            DevServerStatus::Running => 3,
            DevServerStatus::Crashed => 4,
        }
    }
}

impl TryFrom<u8> for DevServerStatus {
    type Error = RecordError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DevServerStatus::Stopped),
            1 => Ok(DevServerStatus::Building),
            2 => Ok(DevServerStatus::Starting),
            3 => Ok(DevServerStatus::Running),
            4 => Ok(DevServerStatus::Crashed),
            other => Err(RecordError::UnknownDevServerStatus(other)),
        }
    }
}

impl std::fmt::Display for DevServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DevServerStatus::Stopped => "stopped",
            DevServerStatus::Building => "building",
            DevServerStatus::Starting => "starting",
            DevServerStatus::Running => "running",
            DevServerStatus::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Commands a dev server runs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DevServerConfig {
    /// Optional one-shot build run before the dev command.
    #[serde(default)]
    pub build_command: String,
    /// The long-running dev command.
    #[serde(default)]
    pub dev_command: String,
    /// Environment variables prefixed onto the dev command line.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// Persisted worktree coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeRecord {
    /// Root of the repository the worktree was created from.
    pub repo_path: PathBuf,
    /// Directory of the checkout.
    pub worktree_path: PathBuf,
    /// Instance title the worktree was created for.
    pub session_name: String,
    /// Branch checked out in the worktree.
    pub branch_name: String,
    /// Commit the branch was created from.
    pub base_commit_sha: String,
}

/// Persisted diff statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffStatsRecord {
    /// Number of added lines.
    pub added: usize,
    /// Number of removed lines.
    pub removed: usize,
    /// Raw diff text.
    pub content: String,
}

/// Persisted dev server state.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DevServerRecord {
    /// Commands the server runs.
    pub config: DevServerConfig,
    /// Last known status.
    pub status: DevServerStatus,
    /// Crashes observed so far.
    pub crash_count: u32,
}

/// One persisted working session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Unique title.
    pub title: String,
    /// Absolute workspace root.
    pub path: PathBuf,
    /// Branch assigned on first start.
    #[serde(default)]
    pub branch: String,
    /// Lifecycle status.
    pub status: InstanceStatus,
    /// Preview height.
    #[serde(default)]
    pub height: u16,
    /// Preview width.
    #[serde(default)]
    pub width: u16,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// Agent command.
    pub program: String,
    /// Auto-confirm prompts.
    #[serde(default)]
    pub auto_yes: bool,
    /// Worktree coordinates.
    #[serde(default)]
    pub worktree: WorktreeRecord,
    /// Last computed diff statistics.
    #[serde(default)]
    pub diff_stats: DiffStatsRecord,
    /// Dev server state, if one was ever configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_server: Option<DevServerRecord>,
}
