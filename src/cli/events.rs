//! Event types from the mirrord progress stream.
//!
//! This module defines the records the mirrord binary writes to stdout when
//! it runs with `MIRRORD_PROGRESS_MODE=json`. Every line is one record; the
//! wire format is a flat object with optional fields, which is validated
//! into the [`Event`] sum type so that each variant only carries the fields
//! its kind requires.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cli::ProtocolError;

/// Name of the task whose successful `FinishedTask` record carries the
/// execution result.
pub const COMPLETION_MARKER: &str = "mirrord preparing to launch";

/// Discriminant of a progress record, as it appears in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    NewTask,
    FinishedTask,
    Warning,
}

/// A decoded progress record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A task (or sub-task) has started.
    NewTask {
        /// Task name.
        name: String,
        /// Name of the owning task, if any.
        parent: Option<String>,
        /// Optional detail appended to the status text.
        message: Option<String>,
    },
    /// A task has finished.
    FinishedTask {
        /// Task name.
        name: String,
        /// Name of the owning task, if any.
        parent: Option<String>,
        /// Whether the task succeeded.
        success: bool,
        /// Free text, or the JSON result payload for the completion marker.
        message: Option<String>,
    },
    /// A warning the user should see.
    Warning {
        /// Task name the warning was raised under.
        name: String,
        /// Name of the owning task, if any.
        parent: Option<String>,
        /// Warning text.
        message: Option<String>,
    },
}

impl Event {
    /// Returns the kind of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewTask { .. } => EventKind::NewTask,
            Self::FinishedTask { .. } => EventKind::FinishedTask,
            Self::Warning { .. } => EventKind::Warning,
        }
    }

    /// Returns the task name.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::NewTask { name, .. }
            | Self::FinishedTask { name, .. }
            | Self::Warning { name, .. } => name,
        }
    }

    /// Returns the owning task name, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        match self {
            Self::NewTask { parent, .. }
            | Self::FinishedTask { parent, .. }
            | Self::Warning { parent, .. } => parent.as_deref(),
        }
    }

    /// Returns the success flag. Only `FinishedTask` has one.
    #[must_use]
    pub fn success(&self) -> Option<bool> {
        match self {
            Self::FinishedTask { success, .. } => Some(*success),
            _ => None,
        }
    }

    /// Returns the message text, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::NewTask { message, .. }
            | Self::FinishedTask { message, .. }
            | Self::Warning { message, .. } => message.as_deref(),
        }
    }

    /// Returns true if this is the `FinishedTask` record for the completion marker.
    #[must_use]
    pub fn is_completion(&self) -> bool {
        matches!(self, Self::FinishedTask { name, .. } if name == COMPLETION_MARKER)
    }

    /// Text shown in the progress surface: the task name, suffixed with
    /// `": " + message` when a message is present.
    #[must_use]
    pub fn status_text(&self) -> String {
        match self.message() {
            Some(message) => format!("{}: {message}", self.name()),
            None => self.name().to_string(),
        }
    }
}

/// Flat wire representation of a progress record.
#[derive(Debug, Deserialize)]
pub(crate) struct WireEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    name: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

impl TryFrom<WireEvent> for Event {
    type Error = ProtocolError;

    fn try_from(wire: WireEvent) -> Result<Self, Self::Error> {
        let WireEvent {
            kind,
            name,
            parent,
            success,
            message,
        } = wire;

        match (kind, success) {
            (EventKind::FinishedTask, Some(success)) => Ok(Self::FinishedTask {
                name,
                parent,
                success,
                message,
            }),
            (EventKind::FinishedTask, None) => Err(ProtocolError::Invalid(format!(
                "`FinishedTask` record for `{name}` has no `success` field"
            ))),
            (EventKind::NewTask | EventKind::Warning, Some(_)) => Err(ProtocolError::Invalid(
                format!("`{kind:?}` record for `{name}` carries a `success` field"),
            )),
            (EventKind::NewTask, None) => Ok(Self::NewTask {
                name,
                parent,
                message,
            }),
            (EventKind::Warning, None) => Ok(Self::Warning {
                name,
                parent,
                message,
            }),
        }
    }
}

/// Result payload of a successful run: the environment to inject into the
/// user's process, and the patched executable path on platforms that need one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    environment: BTreeMap<String, String>,
    #[serde(default)]
    patched_path: Option<String>,
}

impl ExecutionResult {
    #[must_use]
    pub fn new(environment: BTreeMap<String, String>, patched_path: Option<String>) -> Self {
        Self {
            environment,
            patched_path,
        }
    }

    /// Decode the payload embedded in the completion record's `message`.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if the payload is not a valid result.
    pub fn from_payload(payload: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(payload).map_err(|e| ProtocolError::malformed(payload, &e))
    }

    /// Environment variables to set for the launched process.
    #[must_use]
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Path of the substitute executable, if one was produced.
    #[must_use]
    pub fn patched_path(&self) -> Option<&str> {
        self.patched_path.as_deref()
    }

    /// Return a copy of this result with one more environment variable.
    ///
    /// An existing value for `key` is kept.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.entry(key.into()).or_insert_with(|| value.into());
        self
    }

    /// Split the result into its environment and patched path.
    #[must_use]
    pub fn into_parts(self) -> (BTreeMap<String, String>, Option<String>) {
        (self.environment, self.patched_path)
    }
}
