//! Run error types.

use std::time::Duration;

use crate::cli::{LaunchError, ProtocolError, RemoteError, StreamError};

/// Hint shown for protocol errors, which usually mean version skew.
const UPDATE_HINT: &str = "try updating to the latest version of mirrord";

/// Errors that end a mirrord run.
#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    /// The binary could not be started.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// The binary produced output the driver does not understand.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No terminal event arrived before the deadline.
    #[error("mirrord process timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The binary reported a failure on stderr.
    #[error("mirrord failed: {0}")]
    Remote(#[from] RemoteError),

    /// Process stdout was not available.
    #[error("Process stdout not available")]
    NoStdout,

    /// I/O error while talking to the process.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StreamError> for ExecError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(e) => Self::Io(e),
            StreamError::Protocol(e) => Self::Protocol(e),
        }
    }
}

impl ExecError {
    /// Actionable hint for the user, if there is one.
    #[must_use]
    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Launch(LaunchError::NotFound(_)) => {
                Some("check the mirrord binary path in the driver configuration".to_string())
            }
            Self::Launch(LaunchError::PermissionDenied(path)) => Some(format!(
                "make sure {} is executable",
                path.display()
            )),
            Self::Protocol(_) => Some(UPDATE_HINT.to_string()),
            Self::Remote(e) => e.help().map(str::to_string),
            Self::Launch(LaunchError::Io(_)) | Self::Timeout(_) | Self::NoStdout | Self::Io(_) => {
                None
            }
        }
    }

    /// Timeouts are presented to the user as a cancellation, not a crash.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
