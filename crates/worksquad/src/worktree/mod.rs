//! Isolated branch checkouts.
//!
//! Each instance works in its own [`Worktree`]: a separate checkout of a
//! dedicated branch, created from the operator's repository and removed when
//! the instance is killed. [`GitWorktree`] implements the trait with the `git`
//! command-line tool.

pub mod diff;
pub mod git;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use records::WorktreeRecord;
use thiserror::Error;

use crate::settings::SettingsError;

pub use diff::DiffStats;
pub use git::{find_repo_root, sanitize_branch_name, GitWorktree, GitWorktreeFactory};

/// Errors that can occur during worktree operations.
#[derive(Error, Debug)]
pub enum WorktreeError {
    /// The `git` binary is not installed.
    #[error("git is not available")]
    NotAvailable,

    /// The path is not inside a git repository.
    #[error("not a git repository: {0}")]
    NotARepository(PathBuf),

    /// A git command exited unsuccessfully.
    #[error("`{command}` failed (exit code {exit_code:?}): {stderr}")]
    CommandFailed {
        /// The command line that failed.
        command: String,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The diff base has not been recorded yet.
    #[error("base commit SHA not set")]
    BaseCommitUnknown,

    /// Copying project files into the checkout failed.
    #[error("failed to copy project files: {0}")]
    ProjectFiles(#[from] SettingsError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A branch checkout owned by one instance.
#[async_trait]
pub trait Worktree: Send + Sync {
    /// Creates the checkout on disk, reusing the branch if it already exists.
    async fn setup(&mut self) -> Result<(), WorktreeError>;

    /// Removes the checkout and deletes its branch.
    async fn cleanup(&self) -> Result<(), WorktreeError>;

    /// Whether the checkout has uncommitted changes.
    async fn is_dirty(&self) -> Result<bool, WorktreeError>;

    /// Stages everything and records one local commit.
    async fn commit_changes(&self, message: &str) -> Result<(), WorktreeError>;

    /// Whether the branch is checked out in the main repository.
    async fn is_branch_checked_out(&self) -> Result<bool, WorktreeError>;

    /// Diff of the checkout against the base commit.
    async fn diff(&self) -> Result<DiffStats, WorktreeError>;

    /// Root of the repository the checkout belongs to.
    fn repo_path(&self) -> &Path;

    /// Directory of the checkout.
    fn worktree_path(&self) -> &Path;

    /// Branch checked out in the worktree.
    fn branch_name(&self) -> &str;

    /// Commit the branch started from; empty until the first setup.
    fn base_commit_sha(&self) -> &str;

    /// Final component of the repository path.
    fn repo_name(&self) -> String {
        self.repo_path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Persisted coordinates of this worktree.
    fn to_record(&self) -> WorktreeRecord;
}

/// Creates worktrees for new instances and rebuilds them from records.
#[async_trait]
pub trait WorktreeFactory: Send + Sync {
    /// Plans a worktree for `name` in the repository containing `repo_path`.
    /// Nothing is created on disk until [`Worktree::setup`].
    async fn create(
        &self,
        repo_path: &Path,
        name: &str,
    ) -> Result<(Box<dyn Worktree>, String), WorktreeError>;

    /// Rebuilds a worktree handle from persisted coordinates.
    fn restore(&self, record: &WorktreeRecord) -> Box<dyn Worktree>;
}
