//! Errors reported by, or about, the mirrord binary's output.

use serde::{Deserialize, Serialize};

/// Prefix the binary puts in front of the failure record on stderr.
const STDERR_PREFIX: &str = "Error: ";

/// Output from the mirrord binary that could not be understood.
///
/// This usually means the binary and the driver disagree on the protocol
/// version.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The line is not valid structured data.
    #[error("failed to parse a message from the mirrord binary: {reason}")]
    Malformed {
        /// The offending input.
        input: String,
        /// Parser diagnostic.
        reason: String,
    },
    /// The record parsed but is inconsistent for its kind.
    #[error("invalid message received from the mirrord binary: {0}")]
    Invalid(String),
}

impl ProtocolError {
    pub(crate) fn malformed(input: &str, err: &serde_json::Error) -> Self {
        Self::Malformed {
            input: input.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Structured failure record the binary writes to stderr when it exits
/// with an error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub causes: Vec<String>,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub related: Vec<String>,
}

impl RemoteError {
    /// Build a failure from the binary's stderr.
    ///
    /// Text that is not a failure record is kept verbatim as the message.
    #[must_use]
    pub fn from_stderr(stderr: &str) -> Self {
        let trimmed = stderr.trim();
        let record = trimmed.strip_prefix(STDERR_PREFIX).unwrap_or(trimmed);

        match serde_json::from_str::<Self>(record) {
            Ok(error) => error,
            Err(e) => {
                tracing::debug!(error = %e, stderr = %trimmed, "stderr is not a failure record");
                Self {
                    message: trimmed.to_string(),
                    severity: String::new(),
                    causes: Vec::new(),
                    help: String::new(),
                    labels: Vec::new(),
                    related: Vec::new(),
                }
            }
        }
    }

    /// Help text, if the binary supplied any.
    #[must_use]
    pub fn help(&self) -> Option<&str> {
        Some(self.help.as_str()).filter(|help| !help.trim().is_empty())
    }
}
