//! Per-repository dev server settings.
//!
//! Settings live in `<repo>/.worksquad/settings.json` so they can be committed
//! alongside the project. New worktrees receive a copy of the settings file
//! together with any `.env` / `.env.*` files from the repository root.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use records::{DevServerSettings, RecordError, SETTINGS_DIR, SETTINGS_FILE_NAME};
use thiserror::Error;

/// Errors raised while reading, writing or copying settings.
#[derive(Error, Debug)]
pub enum SettingsError {
    /// The settings file exists but could not be parsed.
    #[error("invalid settings file {path}: {source}")]
    Invalid {
        /// Offending file.
        path: PathBuf,
        /// Parse error.
        #[source]
        source: RecordError,
    },

    /// Serializing settings failed.
    #[error("failed to serialize settings: {0}")]
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

impl SettingsError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Location of the settings file for `repo`.
pub fn settings_path(repo: &Path) -> PathBuf {
    repo.join(SETTINGS_DIR).join(SETTINGS_FILE_NAME)
}

/// Whether `repo` has a settings file.
pub fn settings_exist(repo: &Path) -> bool {
    settings_path(repo).is_file()
}

/// Loads the settings for `repo`, falling back to defaults when the file is
/// missing.
pub fn load_settings(repo: &Path) -> Result<DevServerSettings, SettingsError> {
    let path = settings_path(repo);
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "No dev server settings, using defaults");
            return Ok(DevServerSettings::default());
        }
        Err(e) => return Err(SettingsError::io("failed to read", &path, e)),
    };

    DevServerSettings::from_json(&contents)
        .map_err(|source| SettingsError::Invalid { path, source })
}

/// Writes `settings` into `repo`, stamping `updated_at`.
pub fn save_settings(settings: &mut DevServerSettings, repo: &Path) -> Result<(), SettingsError> {
    let path = settings_path(repo);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| SettingsError::io("failed to create directory", parent, e))?;
    }

    settings.updated_at = Utc::now();
    let contents = settings.to_json_pretty().map_err(SettingsError::Serialize)?;

    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents)
        .map_err(|e| SettingsError::io("failed to write", &temp_path, e))?;
    fs::rename(&temp_path, &path).map_err(|e| SettingsError::io("failed to replace", &path, e))?;

    tracing::info!(path = %path.display(), "Saved dev server settings");
    Ok(())
}

/// Copies the repository's settings file into a worktree. A repository
/// without settings is left alone.
pub fn copy_settings_to_worktree(repo: &Path, worktree: &Path) -> Result<(), SettingsError> {
    let source = settings_path(repo);
    let contents = match fs::read(&source) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(SettingsError::io("failed to read", &source, e)),
    };

    let target_dir = worktree.join(SETTINGS_DIR);
    fs::create_dir_all(&target_dir)
        .map_err(|e| SettingsError::io("failed to create directory", &target_dir, e))?;
    let target = target_dir.join(SETTINGS_FILE_NAME);
    fs::write(&target, contents).map_err(|e| SettingsError::io("failed to write", &target, e))
}

/// Whether `name` is an environment file (`.env` or `.env.<suffix>`).
fn is_env_file(name: &str) -> bool {
    name == ".env" || (name.len() > 5 && name.starts_with(".env."))
}

/// Copies `.env` and `.env.*` files from the repository root into a worktree.
/// Returns how many files were copied.
pub fn copy_env_files(repo: &Path, worktree: &Path) -> Result<usize, SettingsError> {
    let entries = fs::read_dir(repo).map_err(|e| SettingsError::io("failed to read", repo, e))?;

    let mut copied = 0;
    for entry in entries {
        let entry = entry.map_err(|e| SettingsError::io("failed to read", repo, e))?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !is_file || !is_env_file(name) {
            continue;
        }

        let target = worktree.join(name);
        fs::copy(entry.path(), &target)
            .map_err(|e| SettingsError::io("failed to copy", &target, e))?;
        copied += 1;
    }

    if copied > 0 {
        tracing::debug!(worktree = %worktree.display(), copied, "Copied env files");
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_defaults() {
        let repo = TempDir::new().unwrap();
        assert!(!settings_exist(repo.path()));
        let settings = load_settings(repo.path()).unwrap();
        assert!(!settings.is_configured());
    }

    #[test]
    fn test_save_then_load() {
        let repo = TempDir::new().unwrap();
        let mut settings = DevServerSettings {
            dev_command: "npm run dev".to_string(),
            ..DevServerSettings::default()
        };
        save_settings(&mut settings, repo.path()).unwrap();

        assert!(settings_exist(repo.path()));
        assert!(!settings_path(repo.path()).with_extension("json.tmp").exists());

        let loaded = load_settings(repo.path()).unwrap();
        assert_eq!(loaded.dev_command, "npm run dev");
        assert_eq!(loaded.updated_at, settings.updated_at);
    }

    #[test]
    fn test_invalid_file_is_error() {
        let repo = TempDir::new().unwrap();
        fs::create_dir_all(repo.path().join(SETTINGS_DIR)).unwrap();
        fs::write(settings_path(repo.path()), "{ nope").unwrap();

        let err = load_settings(repo.path()).unwrap_err();
        assert!(matches!(err, SettingsError::Invalid { .. }));
    }

    #[test]
    fn test_copy_settings_into_worktree() {
        let repo = TempDir::new().unwrap();
        let worktree = TempDir::new().unwrap();

        // Nothing to copy yet.
        copy_settings_to_worktree(repo.path(), worktree.path()).unwrap();
        assert!(!settings_exist(worktree.path()));

        let mut settings = DevServerSettings {
            dev_command: "cargo run".to_string(),
            ..DevServerSettings::default()
        };
        save_settings(&mut settings, repo.path()).unwrap();
        copy_settings_to_worktree(repo.path(), worktree.path()).unwrap();

        let copied = load_settings(worktree.path()).unwrap();
        assert_eq!(copied.dev_command, "cargo run");
    }

    #[test]
    fn test_copy_env_files_only() {
        let repo = TempDir::new().unwrap();
        let worktree = TempDir::new().unwrap();
        fs::write(repo.path().join(".env"), "A=1\n").unwrap();
        fs::write(repo.path().join(".env.local"), "B=2\n").unwrap();
        fs::write(repo.path().join(".envrc"), "use nix\n").unwrap();
        fs::write(repo.path().join("README.md"), "# hi\n").unwrap();
        fs::create_dir(repo.path().join(".env.d")).unwrap();

        let copied = copy_env_files(repo.path(), worktree.path()).unwrap();
        assert_eq!(copied, 2);
        assert_eq!(fs::read_to_string(worktree.path().join(".env")).unwrap(), "A=1\n");
        assert!(worktree.path().join(".env.local").exists());
        assert!(!worktree.path().join(".envrc").exists());
        assert!(!worktree.path().join("README.md").exists());
    }

    #[test]
    fn test_env_file_names() {
        assert!(is_env_file(".env"));
        assert!(is_env_file(".env.production"));
        assert!(!is_env_file(".env."));
        assert!(!is_env_file("env"));
        assert!(!is_env_file(".environment"));
    }
}
