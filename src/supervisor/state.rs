//! Execution state machine.

use std::fmt;

use crate::cli::{Event, ExecutionResult, ProtocolError};
use crate::supervisor::{ExecError, Progress, ProgressSender, WarningClassifier};

/// Status text published when a run starts.
pub const STARTING_STATUS: &str = "mirrord is starting...";

/// Status text published once the result has been received.
pub const RUNNING_STATUS: &str = "mirrord is running";

/// Current state of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionState {
    #[default]
    Starting,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionState {
    /// Returns true for states a run never leaves.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Terminal result of a run.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The binary announced success and delivered a result.
    Success(ExecutionResult),
    /// The run ended without a result (stream ended, or the caller aborted).
    Cancelled,
    /// The run failed.
    Failed(ExecError),
}

impl ExecutionOutcome {
    /// Returns the result of a successful run.
    #[must_use]
    pub fn success(&self) -> Option<&ExecutionResult> {
        match self {
            Self::Success(result) => Some(result),
            _ => None,
        }
    }

    /// Returns the error of a failed run.
    #[must_use]
    pub fn error(&self) -> Option<&ExecError> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// State the outcome corresponds to.
    #[must_use]
    pub fn state(&self) -> ExecutionState {
        match self {
            Self::Success(_) => ExecutionState::Succeeded,
            Self::Cancelled => ExecutionState::Cancelled,
            Self::Failed(_) => ExecutionState::Failed,
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(result) => write!(
                f,
                "success ({} environment variables)",
                result.environment().len()
            ),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Consumes decoded events and resolves to an [`ExecutionOutcome`].
///
/// Each handler returns `Some(outcome)` exactly once, on the transition into
/// a terminal state; afterwards every input is ignored.
#[derive(Debug)]
pub struct ExecutionStateMachine {
    state: ExecutionState,
    classifier: WarningClassifier,
    progress: ProgressSender,
    status: Option<String>,
    warnings: usize,
}

impl ExecutionStateMachine {
    #[must_use]
    pub fn new(classifier: WarningClassifier, progress: ProgressSender) -> Self {
        Self {
            state: ExecutionState::Starting,
            classifier,
            progress,
            status: None,
            warnings: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Last status text published.
    #[must_use]
    pub fn current_status(&self) -> Option<&str> {
        self.status.as_deref()
    }

    /// Number of warnings seen so far.
    #[must_use]
    pub fn warnings(&self) -> usize {
        self.warnings
    }

    /// Enter `Running` and publish the initial status.
    pub fn start(&mut self) {
        if self.state == ExecutionState::Starting {
            self.transition(ExecutionState::Running);
            self.set_status(STARTING_STATUS.to_string());
        }
    }

    /// Handle one decoded event.
    pub fn on_event(&mut self, event: Event) -> Option<ExecutionOutcome> {
        if self.ignore_after_terminal() {
            return None;
        }
        self.start();

        match event {
            Event::FinishedTask {
                name,
                success: true,
                message,
                ..
            } if name == crate::cli::COMPLETION_MARKER => {
                let outcome = match message {
                    None => Err(ProtocolError::Invalid(format!(
                        "`{name}` finished without a result payload"
                    ))),
                    Some(payload) => ExecutionResult::from_payload(&payload),
                };
                match outcome {
                    Ok(result) => {
                        self.set_status(RUNNING_STATUS.to_string());
                        self.transition(ExecutionState::Succeeded);
                        Some(ExecutionOutcome::Success(result))
                    }
                    Err(e) => self.on_error(e.into()),
                }
            }
            Event::FinishedTask {
                name,
                success: false,
                message,
                ..
            } if name == crate::cli::COMPLETION_MARKER => {
                // Not terminal: the binary may still recover or exit on its own.
                tracing::warn!(
                    task = %name,
                    message = ?message,
                    "mirrord reported a failed launch step, waiting for more output"
                );
                None
            }
            Event::Warning { message, name, .. } => {
                match message {
                    Some(message) => self.warn(message),
                    None => tracing::debug!(task = %name, "Warning without message ignored"),
                }
                None
            }
            event @ (Event::NewTask { .. } | Event::FinishedTask { .. }) => {
                self.set_status(event.status_text());
                None
            }
        }
    }

    /// Handle a stream or decode error. Always terminal.
    pub fn on_error(&mut self, error: ExecError) -> Option<ExecutionOutcome> {
        if self.ignore_after_terminal() {
            return None;
        }
        tracing::error!(error = %error, status = ?self.status, "mirrord run failed");
        self.transition(ExecutionState::Failed);
        Some(ExecutionOutcome::Failed(error))
    }

    /// Handle the end of the stream. Terminal unless a result was already
    /// published.
    pub fn on_end_of_stream(&mut self) -> Option<ExecutionOutcome> {
        if self.ignore_after_terminal() {
            return None;
        }
        tracing::info!(status = ?self.status, "mirrord output ended without a result");
        self.transition(ExecutionState::Cancelled);
        Some(ExecutionOutcome::Cancelled)
    }

    fn warn(&mut self, message: String) {
        self.warnings = self.warnings.saturating_add(1);
        let suppression = self.classifier.classify(&message);
        tracing::warn!(warning = %message, suppression = ?suppression, "mirrord warning");
        self.progress.send(Progress::Warning {
            message,
            suppression,
        });
    }

    fn set_status(&mut self, text: String) {
        tracing::debug!(status = %text, "Status update");
        self.progress.send(Progress::Status(text.clone()));
        self.status = Some(text);
    }

    fn ignore_after_terminal(&self) -> bool {
        if self.state.is_terminal() {
            tracing::debug!(state = ?self.state, "Input after terminal state ignored");
            true
        } else {
            false
        }
    }

    fn transition(&mut self, new_state: ExecutionState) {
        tracing::debug!(from = ?self.state, to = ?new_state, "State transition");
        self.state = new_state;
    }
}
