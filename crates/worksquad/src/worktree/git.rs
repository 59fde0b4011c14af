//! `git` command-line worktree adapter.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use records::WorktreeRecord;
use tokio::process::Command;

use super::{DiffStats, Worktree, WorktreeError, WorktreeFactory};
use crate::settings;
use crate::storage::{repo_data_dir, WORKTREES_DIR};

/// Runs `git -C <dir> <args…>`.
async fn run_git_raw(dir: &Path, args: &[&str]) -> Result<Output, WorktreeError> {
    Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WorktreeError::NotAvailable
            } else {
                WorktreeError::Io(e)
            }
        })
}

/// Runs a git command and returns its trimmed stdout, failing on a non-zero
/// exit.
async fn run_git(dir: &Path, args: &[&str]) -> Result<String, WorktreeError> {
    let output = run_git_raw(dir, args).await?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string());
    }

    Err(WorktreeError::CommandFailed {
        command: format!("git {}", args.join(" ")),
        exit_code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Resolves the top-level directory of the repository containing `path`.
pub async fn find_repo_root(path: &Path) -> Result<PathBuf, WorktreeError> {
    match run_git(path, &["rev-parse", "--show-toplevel"]).await {
        Ok(root) => Ok(PathBuf::from(root)),
        Err(WorktreeError::CommandFailed { .. }) => {
            Err(WorktreeError::NotARepository(path.to_path_buf()))
        }
        Err(e) => Err(e),
    }
}

/// Turns a title into a valid branch name component: lowercase, spaces to
/// dashes, anything outside `[a-z0-9-_/.]` dropped, runs of dashes collapsed.
pub fn sanitize_branch_name(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.to_lowercase().chars() {
        let c = if c.is_whitespace() { '-' } else { c };
        if !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.')) {
            continue;
        }
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches(|c| c == '-' || c == '/').to_string()
}

/// A worktree managed through the `git` CLI.
#[derive(Debug, Clone)]
pub struct GitWorktree {
    repo_path: PathBuf,
    worktree_path: PathBuf,
    session_name: String,
    branch_name: String,
    base_commit_sha: String,
}

impl GitWorktree {
    /// Builds a handle from known coordinates.
    pub fn new(
        repo_path: PathBuf,
        worktree_path: PathBuf,
        session_name: String,
        branch_name: String,
        base_commit_sha: String,
    ) -> Self {
        Self {
            repo_path,
            worktree_path,
            session_name,
            branch_name,
            base_commit_sha,
        }
    }

    async fn branch_exists(&self) -> Result<bool, WorktreeError> {
        let reference = format!("refs/heads/{}", self.branch_name);
        let output =
            run_git_raw(&self.repo_path, &["show-ref", "--verify", "--quiet", &reference]).await?;
        Ok(output.status.success())
    }

    fn worktree_path_str(&self) -> String {
        self.worktree_path.to_string_lossy().into_owned()
    }

    async fn add_from_new_branch(&mut self) -> Result<(), WorktreeError> {
        // A stale registration for this path would make `worktree add` fail.
        let _ = run_git(&self.repo_path, &["worktree", "prune"]).await;

        let head = run_git(&self.repo_path, &["rev-parse", "HEAD"]).await?;
        let path = self.worktree_path_str();
        run_git(
            &self.repo_path,
            &["worktree", "add", "-b", &self.branch_name, &path, &head],
        )
        .await?;
        self.base_commit_sha = head;
        Ok(())
    }

    async fn add_from_existing_branch(&mut self) -> Result<(), WorktreeError> {
        let _ = run_git(&self.repo_path, &["worktree", "prune"]).await;

        let path = self.worktree_path_str();
        run_git(&self.repo_path, &["worktree", "add", &path, &self.branch_name]).await?;
        Ok(())
    }

    /// Everything setup does after `worktree add` succeeded.
    async fn prepare_checkout(&mut self) -> Result<(), WorktreeError> {
        if self.base_commit_sha.is_empty() {
            self.base_commit_sha =
                run_git(&self.repo_path, &["merge-base", "HEAD", &self.branch_name]).await?;
        }
        settings::copy_settings_to_worktree(&self.repo_path, &self.worktree_path)?;
        settings::copy_env_files(&self.repo_path, &self.worktree_path)?;
        Ok(())
    }

    /// Undoes a `worktree add` whose follow-up failed. The branch is only
    /// deleted when setup created it.
    async fn discard_checkout(&self, created_branch: bool) {
        let path = self.worktree_path_str();
        if let Err(e) = run_git(&self.repo_path, &["worktree", "remove", "-f", &path]).await {
            tracing::warn!(worktree = %path, error = %e, "Failed to remove partial worktree");
        }
        if created_branch {
            if let Err(e) = run_git(&self.repo_path, &["branch", "-D", &self.branch_name]).await {
                tracing::warn!(branch = %self.branch_name, error = %e, "Failed to delete branch");
            }
        }
        let _ = run_git(&self.repo_path, &["worktree", "prune"]).await;
    }
}

#[async_trait]
impl Worktree for GitWorktree {
    async fn setup(&mut self) -> Result<(), WorktreeError> {
        if let Some(parent) = self.worktree_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let created_branch = !self.branch_exists().await?;
        if created_branch {
            self.add_from_new_branch().await?;
        } else {
            self.add_from_existing_branch().await?;
        }

        if let Err(e) = self.prepare_checkout().await {
            self.discard_checkout(created_branch).await;
            return Err(e);
        }

        tracing::info!(
            worktree = %self.worktree_path.display(),
            branch = %self.branch_name,
            base = %self.base_commit_sha,
            "Worktree ready"
        );
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), WorktreeError> {
        let mut first_error = None;

        if self.worktree_path.exists() {
            let path = self.worktree_path_str();
            if let Err(e) = run_git(&self.repo_path, &["worktree", "remove", "-f", &path]).await {
                first_error.get_or_insert(e);
            }
        }

        match self.branch_exists().await {
            Ok(true) => {
                if let Err(e) =
                    run_git(&self.repo_path, &["branch", "-D", &self.branch_name]).await
                {
                    first_error.get_or_insert(e);
                }
            }
            Ok(false) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = run_git(&self.repo_path, &["worktree", "prune"]).await {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(branch = %self.branch_name, "Worktree removed");
                Ok(())
            }
        }
    }

    async fn is_dirty(&self) -> Result<bool, WorktreeError> {
        let status = run_git(&self.worktree_path, &["status", "--porcelain"]).await?;
        Ok(!status.trim().is_empty())
    }

    async fn commit_changes(&self, message: &str) -> Result<(), WorktreeError> {
        run_git(&self.worktree_path, &["add", "-A"]).await?;
        run_git(&self.worktree_path, &["commit", "-m", message, "--no-verify"]).await?;
        tracing::info!(branch = %self.branch_name, "Committed worktree changes");
        Ok(())
    }

    async fn is_branch_checked_out(&self) -> Result<bool, WorktreeError> {
        let current = run_git(&self.repo_path, &["branch", "--show-current"]).await?;
        Ok(current.trim() == self.branch_name)
    }

    async fn diff(&self) -> Result<DiffStats, WorktreeError> {
        if self.base_commit_sha.is_empty() {
            return Err(WorktreeError::BaseCommitUnknown);
        }

        // Intent-to-add makes untracked files show up in the diff.
        run_git(&self.worktree_path, &["add", "-N", "."]).await?;
        let content =
            run_git(&self.worktree_path, &["--no-pager", "diff", &self.base_commit_sha]).await?;
        Ok(DiffStats::from_diff(content))
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
            session_name: self.session_name.clone(),
            branch_name: self.branch_name.clone(),
            base_commit_sha: self.base_commit_sha.clone(),
        }
    }
}

/// Creates [`GitWorktree`]s under `<data_dir>/<repo identity>/worktrees`.
#[derive(Debug, Clone)]
pub struct GitWorktreeFactory {
    data_dir: PathBuf,
    branch_prefix: String,
}

impl GitWorktreeFactory {
    /// Creates a factory storing checkouts below `data_dir` and naming
    /// branches `<branch_prefix><title>`.
    pub fn new(data_dir: PathBuf, branch_prefix: String) -> Self {
        Self {
            data_dir,
            branch_prefix,
        }
    }
}

#[async_trait]
impl WorktreeFactory for GitWorktreeFactory {
    async fn create(
        &self,
        repo_path: &Path,
        name: &str,
    ) -> Result<(Box<dyn Worktree>, String), WorktreeError> {
        let repo_root = find_repo_root(repo_path).await?;
        let sanitized = sanitize_branch_name(name);
        let branch_name = format!("{}{}", self.branch_prefix, sanitized);

        // The timestamp keeps a recreated title from colliding with a
        // directory that is still being removed.
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let dir_name = format!("{}_{:x}", sanitized.replace('/', "-"), nanos);
        let worktree_path = repo_data_dir(&self.data_dir, &repo_root)
            .join(WORKTREES_DIR)
            .join(dir_name);

        let worktree = GitWorktree::new(
            repo_root,
            worktree_path,
            name.to_string(),
            branch_name.clone(),
            String::new(),
        );
        Ok((Box::new(worktree), branch_name))
    }

    fn restore(&self, record: &WorktreeRecord) -> Box<dyn Worktree> {
        Box::new(GitWorktree::new(
            record.repo_path.clone(),
            record.worktree_path.clone(),
            record.session_name.clone(),
            record.branch_name.clone(),
            record.base_commit_sha.clone(),
        ))
    }
}
