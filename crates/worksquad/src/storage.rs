//! Per-repository state persistence.
//!
//! Each repository gets its own directory under the data directory, named by
//! the SHA-256 of the repository root, holding `state.json` and the
//! `worktrees/` checkouts. Writes go to a temp file that is then renamed over
//! the target so a crash never leaves a truncated state file.

use std::fs;
use std::path::{Path, PathBuf};

use records::{InstanceRecord, RecordError, StateFile, STATE_FILE_NAME};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Directory, inside a repository's data directory, holding its worktrees.
pub const WORKTREES_DIR: &str = "worktrees";

/// Errors raised by the state store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The state file exists but is not valid.
    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        /// Offending file.
        path: PathBuf,
        /// Parse error.
        #[source]
        source: RecordError,
    },

    /// Serializing the state failed.
    #[error("failed to serialize state: {0}")]
    Serialize(#[source] RecordError),

    /// A filesystem operation failed.
    #[error("{action} {path}: {source}")]
    Io {
        /// What was being done.
        action: &'static str,
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Stable identifier of a repository: the hex SHA-256 of its root path.
pub fn repo_identity(repo_root: &Path) -> String {
    hex::encode(Sha256::digest(repo_root.to_string_lossy().as_bytes()))
}

/// Directory holding everything stored for `repo_root`.
pub fn repo_data_dir(data_dir: &Path, repo_root: &Path) -> PathBuf {
    data_dir.join(repo_identity(repo_root))
}

/// Loads and saves the state file of one repository.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Creates a store for `repo_root` under `data_dir`.
    pub fn for_repo(data_dir: &Path, repo_root: &Path) -> Self {
        Self::new(repo_data_dir(data_dir, repo_root).join(STATE_FILE_NAME))
    }

    /// Creates a store backed by an explicit file.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the state file. A missing file yields the default state.
    pub fn load(&self) -> Result<StateFile, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No state file, starting empty");
                return Ok(StateFile::default());
            }
            Err(e) => {
                return Err(StoreError::Io {
                    action: "failed to read",
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let state = StateFile::from_json(&contents).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(
            path = %self.path.display(),
            instances = state.instances.len(),
            "Loaded state"
        );
        Ok(state)
    }

    /// Writes the state file atomically.
    pub fn save(&self, state: &StateFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                action: "failed to create directory",
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let contents = state.to_json_pretty().map_err(StoreError::Serialize)?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, contents).map_err(|e| StoreError::Io {
            action: "failed to write",
            path: temp_path.clone(),
            source: e,
        })?;
        fs::rename(&temp_path, &self.path).map_err(|e| StoreError::Io {
            action: "failed to replace",
            path: self.path.clone(),
            source: e,
        })?;

        tracing::debug!(
            path = %self.path.display(),
            instances = state.instances.len(),
            "Saved state"
        );
        Ok(())
    }

    /// Replaces the saved instances, keeping the rest of the state.
    pub fn save_instances(&self, instances: Vec<InstanceRecord>) -> Result<(), StoreError> {
        let mut state = self.load()?;
        state.instances = instances;
        self.save(&state)
    }

    /// Removes every saved instance.
    pub fn delete_all_instances(&self) -> Result<(), StoreError> {
        self.save_instances(Vec::new())
    }
}
