//! Instance error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::devserver::DevServerError;
use crate::session::SessionError;
use crate::settings::SettingsError;
use crate::worktree::WorktreeError;

/// Header of an error that aggregates several cleanup failures.
pub const MULTIPLE_ERRORS_HEADER: &str = "multiple cleanup errors occurred:";

/// Broad classes of instance failures, used to decide how a caller reports
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; nothing was changed.
    Validation,
    /// Acquiring a resource failed; partial acquisitions were rolled back.
    ResourceSetup,
    /// Releasing one or more resources failed.
    ResourceCleanup,
    /// The operation is not valid in the current state.
    StateConflict,
    /// An auxiliary process failed to build or start.
    ExternalProcess,
}

/// Errors returned by [`Instance`](super::Instance) operations.
#[derive(Error, Debug)]
pub enum InstanceError {
    /// The instance has no title.
    #[error("instance title cannot be empty")]
    EmptyTitle,

    /// The workspace path could not be made absolute.
    #[error("failed to get absolute path for {path}: {source}")]
    InvalidPath {
        /// Path as given.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The operation needs a started instance.
    #[error("cannot {0} instance that has not been started")]
    NotStarted(&'static str),

    /// The operation needs an instance that is not paused.
    #[error("cannot {0} instance that is paused")]
    Paused(&'static str),

    /// The title is fixed once resources have been named after it.
    #[error("cannot change title of a started instance")]
    TitleLocked,

    /// Pause was requested twice.
    #[error("instance is already paused")]
    AlreadyPaused,

    /// Resume was requested for an instance that is not paused.
    #[error("can only resume paused instances")]
    NotPaused,

    /// The branch is checked out in the main repository.
    #[error("cannot resume: branch {0} is checked out, please switch to a different branch")]
    BranchCheckedOut(String),

    /// No dev server has been configured for this instance.
    #[error("no dev server configured")]
    NoDevServer,

    /// The repository's dev server settings could not be read.
    #[error("failed to load dev server settings: {0}")]
    Settings(#[from] SettingsError),

    /// A worktree operation failed.
    #[error("{action}: {source}")]
    Worktree {
        /// What was being attempted.
        action: &'static str,
        /// Underlying error.
        #[source]
        source: WorktreeError,
    },

    /// A terminal session operation failed.
    #[error("{action}: {source}")]
    Session {
        /// What was being attempted.
        action: &'static str,
        /// Underlying error.
        #[source]
        source: SessionError,
    },

    /// A dev server operation failed.
    #[error("{action}: {source}")]
    DevServer {
        /// What was being attempted.
        action: &'static str,
        /// Underlying error.
        #[source]
        source: DevServerError,
    },

    /// An operation failed and undoing its partial work failed too.
    #[error("{error} (cleanup error: {})", join_messages(.cleanup, "; "))]
    RolledBack {
        /// The original failure.
        error: Box<InstanceError>,
        /// Failures hit while undoing.
        cleanup: Vec<InstanceError>,
    },

    /// Several independent cleanup steps failed.
    #[error("{}", format_multiple(.0))]
    Multiple(Vec<InstanceError>),
}

impl InstanceError {
    pub(crate) fn worktree(action: &'static str) -> impl FnOnce(WorktreeError) -> Self {
        move |source| Self::Worktree { action, source }
    }

    pub(crate) fn session(action: &'static str) -> impl FnOnce(SessionError) -> Self {
        move |source| Self::Session { action, source }
    }

    pub(crate) fn dev_server(action: &'static str) -> impl FnOnce(DevServerError) -> Self {
        move |source| Self::DevServer { action, source }
    }

    /// Attaches undo failures to `error`. Without any, `error` is returned
    /// unchanged.
    pub fn with_cleanup(error: InstanceError, cleanup: Vec<InstanceError>) -> Self {
        if cleanup.is_empty() {
            error
        } else {
            Self::RolledBack {
                error: Box::new(error),
                cleanup,
            }
        }
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyTitle | Self::InvalidPath { .. } | Self::Settings(_) => {
                ErrorKind::Validation
            }
            Self::NotStarted(_)
            | Self::Paused(_)
            | Self::TitleLocked
            | Self::AlreadyPaused
            | Self::NotPaused
            | Self::BranchCheckedOut(_)
            | Self::NoDevServer => ErrorKind::StateConflict,
            Self::DevServer { .. } => ErrorKind::ExternalProcess,
            Self::Multiple(_) => ErrorKind::ResourceCleanup,
            Self::RolledBack { error, .. } => error.kind(),
            Self::Worktree { .. } | Self::Session { .. } => ErrorKind::ResourceSetup,
        }
    }
}

fn join_messages(errors: &[InstanceError], separator: &str) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(separator)
}

fn format_multiple(errors: &[InstanceError]) -> String {
    let mut message = MULTIPLE_ERRORS_HEADER.to_string();
    for error in errors {
        message.push_str("\n  - ");
        message.push_str(&error.to_string());
    }
    message
}

/// Folds independent failures into one result: none is success, one is
/// returned as-is, several become [`InstanceError::Multiple`].
pub fn combine_errors(mut errors: Vec<InstanceError>) -> Result<(), InstanceError> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(InstanceError::Multiple(errors)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close_failure() -> InstanceError {
        InstanceError::Session {
            action: "failed to close tmux session",
            source: SessionError::NotFound("worksquad_t1".to_string()),
        }
    }

    #[test]
    fn test_combine_none() {
        assert!(combine_errors(Vec::new()).is_ok());
    }

    #[test]
    fn test_combine_one_is_unchanged() {
        let err = combine_errors(vec![close_failure()]).unwrap_err();
        assert!(matches!(err, InstanceError::Session { .. }));
        assert_eq!(
            err.to_string(),
            "failed to close tmux session: session not found: worksquad_t1"
        );
    }

    #[test]
    fn test_combine_many_lists_every_message() {
        let err = combine_errors(vec![
            InstanceError::dev_server("failed to stop dev server")(DevServerError::AlreadyRunning),
            close_failure(),
        ])
        .unwrap_err();

        assert_eq!(
            err.to_string(),
            "multiple cleanup errors occurred:\n  \
             - failed to stop dev server: dev server is already running\n  \
             - failed to close tmux session: session not found: worksquad_t1"
        );
        assert_eq!(err.kind(), ErrorKind::ResourceCleanup);
    }

    #[test]
    fn test_with_cleanup() {
        let plain = InstanceError::with_cleanup(InstanceError::EmptyTitle, Vec::new());
        assert!(matches!(plain, InstanceError::EmptyTitle));

        let rolled = InstanceError::with_cleanup(
            InstanceError::session("failed to start new session")(SessionError::StartTimeout(
                "worksquad_t1".to_string(),
            )),
            vec![close_failure()],
        );
        let message = rolled.to_string();
        assert!(message.starts_with("failed to start new session: timed out"));
        assert!(message.contains("(cleanup error: failed to close tmux session"));
        assert_eq!(rolled.kind(), ErrorKind::ResourceSetup);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(InstanceError::EmptyTitle.kind(), ErrorKind::Validation);
        assert_eq!(InstanceError::AlreadyPaused.kind(), ErrorKind::StateConflict);
        assert_eq!(
            InstanceError::BranchCheckedOut("ws/t1".to_string()).kind(),
            ErrorKind::StateConflict
        );
        assert_eq!(
            InstanceError::dev_server("failed to start dev server")(DevServerError::NotConfigured)
                .kind(),
            ErrorKind::ExternalProcess
        );
    }
}
