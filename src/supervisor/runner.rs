//! Run orchestration for `mirrord ext`.
//!
//! This module connects the process launcher, the stream decoder and the
//! state machine: one worker task per run consumes the process output while
//! the caller waits on the result channel with a deadline.

use std::path::PathBuf;
use std::pin::pin;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::cli::{read_events, MirrordCommand, RemoteError, SupervisedProcess, Terminate};
use crate::config::DriverConfig;
use crate::supervisor::{
    progress_channel, result_channel, ExecError, ExecutionOutcome, ExecutionState,
    ExecutionStateMachine, Progress, ProgressReceiver, ResultReceiver, ResultSender,
    WaitError, WarningClassifier,
};

/// Default deadline for the result of a run.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Default time a process gets to exit before it is killed.
pub const DEFAULT_TERMINATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Variable added to every successful result so debuggers keep their ports.
pub const IGNORE_DEBUGGER_PORTS_ENV: &str = "MIRRORD_IGNORE_DEBUGGER_PORTS";

/// Default value for [`IGNORE_DEBUGGER_PORTS_ENV`].
pub const DEFAULT_DEBUGGER_PORTS: &str = "35000-65535";

/// Worker loop: decode `stdout` line by line, feed the state machine and
/// publish its terminal outcome.
///
/// The sender is completed exactly once. Returns the machine's final state.
pub async fn drive<R>(
    stdout: R,
    mut machine: ExecutionStateMachine,
    mut sender: ResultSender,
) -> ExecutionState
where
    R: AsyncRead + Unpin,
{
    machine.start();
    let mut events = pin!(read_events(stdout));

    while let Some(item) = events.next().await {
        let step = match item {
            Ok(event) => machine.on_event(event),
            Err(e) => machine.on_error(e.into()),
        };
        if let Some(outcome) = step {
            sender.complete(outcome);
            return machine.state();
        }
    }

    if let Some(outcome) = machine.on_end_of_stream() {
        sender.complete(outcome);
    }
    machine.state()
}

/// Wait for the worker's outcome within `deadline`.
///
/// On timeout, caller abort or failure, `process` is terminated. A
/// `Cancelled` outcome from the worker means the output ended on its own, so
/// the process is left for the caller to inspect.
pub async fn await_outcome<P>(
    receiver: &mut ResultReceiver,
    process: &mut P,
    deadline: Duration,
    cancel: Option<&CancellationToken>,
) -> ExecutionOutcome
where
    P: Terminate + ?Sized,
{
    let waited = match cancel {
        Some(cancel) => tokio::select! {
            biased;

            () = cancel.cancelled() => {
                tracing::info!("mirrord run cancelled by caller");
                terminate_logged(process).await;
                return ExecutionOutcome::Cancelled;
            }
            waited = receiver.wait(deadline) => waited,
        },
        None => receiver.wait(deadline).await,
    };

    match waited {
        Ok(outcome @ ExecutionOutcome::Failed(_)) => {
            terminate_logged(process).await;
            outcome
        }
        Ok(outcome) => outcome,
        Err(WaitError::Elapsed(deadline)) => {
            tracing::error!(deadline_secs = deadline.as_secs(), "mirrord process timed out");
            terminate_logged(process).await;
            ExecutionOutcome::Failed(ExecError::Timeout(deadline))
        }
    }
}

async fn terminate_logged<P: Terminate + ?Sized>(process: &mut P) {
    if let Err(e) = process.terminate().await {
        tracing::warn!(error = %e, "Failed to terminate mirrord");
    }
}

/// Launches `mirrord ext` runs and resolves them to an outcome.
#[derive(Debug, Clone)]
pub struct ExecSupervisor {
    binary: PathBuf,
    timeout: Duration,
    grace: Duration,
    classifier: WarningClassifier,
    debugger_ports: Option<String>,
    cancel: Option<CancellationToken>,
}

impl ExecSupervisor {
    /// Create a supervisor for the given binary with default settings.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            timeout: DEFAULT_TIMEOUT,
            grace: DEFAULT_TERMINATE_TIMEOUT,
            classifier: WarningClassifier::with_default_rules(),
            debugger_ports: Some(DEFAULT_DEBUGGER_PORTS.to_string()),
            cancel: None,
        }
    }

    /// Create a supervisor from the driver configuration.
    #[must_use]
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            timeout: config.timeout(),
            grace: config.shutdown_grace(),
            classifier: config.warning_classifier(),
            debugger_ports: config.debugger_ports(),
            cancel: None,
        }
    }

    /// Set the deadline for the result.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the grace period for process shutdown.
    #[must_use]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Replace the warning classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: WarningClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Set, or clear, the debugger port range added to results.
    #[must_use]
    pub fn with_debugger_ports(mut self, ports: Option<String>) -> Self {
        self.debugger_ports = ports;
        self
    }

    /// Set a cancellation token that aborts runs.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Get the binary path.
    #[must_use]
    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    /// Launch the binary and start the worker.
    ///
    /// # Errors
    ///
    /// Returns `ExecError::Launch` if the process cannot be started.
    pub fn start(&self, command: &MirrordCommand) -> Result<Run, ExecError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("mirrord_run", %run_id, command = command.command());
        let _enter = span.enter();

        let mut process = SupervisedProcess::spawn(&self.binary, command)?;
        let stdout = process.take_stdout().ok_or(ExecError::NoStdout)?;
        let stderr = process.take_stderr().map(|stderr| tokio::spawn(collect_stderr(stderr)));

        let (progress_tx, progress_rx) = progress_channel();
        let (result_tx, result_rx) = result_channel();
        let machine = ExecutionStateMachine::new(self.classifier.clone(), progress_tx);

        let worker = tokio::spawn(
            async move {
                let state = drive(stdout, machine, result_tx).await;
                tracing::debug!(state = ?state, "Worker finished");
                state
            }
            .instrument(span.clone()),
        );

        Ok(Run {
            run_id,
            process,
            receiver: result_rx,
            progress: Some(progress_rx),
            stderr,
            worker,
            timeout: self.timeout,
            grace: self.grace,
            debugger_ports: self.debugger_ports.clone(),
            cancel: self.cancel.clone(),
        })
    }

    /// Run `command` to an outcome, passing every progress update to
    /// `on_progress` as it arrives.
    ///
    /// Launch failures are reported as `ExecutionOutcome::Failed`.
    pub async fn execute<F>(&self, command: &MirrordCommand, mut on_progress: F) -> ExecutionOutcome
    where
        F: FnMut(&Progress),
    {
        let mut run = match self.start(command) {
            Ok(run) => run,
            Err(e) => return ExecutionOutcome::Failed(e),
        };
        let Some(mut progress) = run.take_progress() else {
            return run.outcome().await;
        };

        let mut pending = pin!(run.outcome());
        let mut progress_open = true;
        let outcome = loop {
            tokio::select! {
                biased;

                update = progress.recv(), if progress_open => match update {
                    Some(update) => on_progress(&update),
                    None => progress_open = false,
                },
                outcome = &mut pending => break outcome,
            }
        };

        while let Some(update) = progress.try_recv() {
            on_progress(&update);
        }
        outcome
    }
}

/// A launched run.
#[derive(Debug)]
pub struct Run {
    run_id: Uuid,
    process: SupervisedProcess,
    receiver: ResultReceiver,
    progress: Option<ProgressReceiver>,
    stderr: Option<JoinHandle<String>>,
    worker: JoinHandle<ExecutionState>,
    timeout: Duration,
    grace: Duration,
    debugger_ports: Option<String>,
    cancel: Option<CancellationToken>,
}

impl Run {
    /// Identifier used in logs for this run.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Take the progress receiver. Only the first call returns it.
    pub fn take_progress(&mut self) -> Option<ProgressReceiver> {
        self.progress.take()
    }

    /// Wait for the run to finish.
    pub async fn outcome(mut self) -> ExecutionOutcome {
        let outcome = await_outcome(
            &mut self.receiver,
            &mut self.process,
            self.timeout,
            self.cancel.as_ref(),
        )
        .await;

        let outcome = match outcome {
            ExecutionOutcome::Success(result) => {
                if let Err(e) = self.process.release(self.grace).await {
                    tracing::warn!(run_id = %self.run_id, error = %e, "Failed to release mirrord");
                }
                let result = match &self.debugger_ports {
                    Some(ports) => result.with_env(IGNORE_DEBUGGER_PORTS_ENV, ports.clone()),
                    None => result,
                };
                ExecutionOutcome::Success(result)
            }
            ExecutionOutcome::Cancelled if !self.aborted() => self.resolve_end_of_stream().await,
            other => other,
        };

        self.stop_tasks();
        tracing::info!(run_id = %self.run_id, outcome = %outcome, "mirrord run finished");
        outcome
    }

    /// Stop the worker and stderr reader. A grandchild that inherited the
    /// pipes can keep them open after the process itself is gone.
    fn stop_tasks(&mut self) {
        if !self.worker.is_finished() {
            tracing::debug!(run_id = %self.run_id, "Aborting worker");
            self.worker.abort();
        }
        if let Some(stderr) = self.stderr.take() {
            stderr.abort();
        }
    }

    fn aborted(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    /// The output ended without a result: a non-zero exit is a remote
    /// failure described on stderr, anything else stays `Cancelled`.
    async fn resolve_end_of_stream(&mut self) -> ExecutionOutcome {
        let status = match self.process.wait_timeout(self.grace).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                tracing::warn!(run_id = %self.run_id, "mirrord closed its output but kept running");
                terminate_logged(&mut self.process).await;
                return ExecutionOutcome::Cancelled;
            }
            Err(e) => return ExecutionOutcome::Failed(ExecError::Io(e)),
        };

        if status.success() {
            tracing::warn!(run_id = %self.run_id, "invalid output of the mirrord binary");
            return ExecutionOutcome::Cancelled;
        }

        let stderr = match self.stderr.take() {
            Some(handle) => match tokio::time::timeout(self.grace, handle).await {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    tracing::debug!(error = %e, "stderr reader failed");
                    String::new()
                }
                Err(_) => String::new(),
            },
            None => String::new(),
        };

        let error = if stderr.trim().is_empty() {
            RemoteError::from_stderr(&format!("mirrord exited with {status}"))
        } else {
            RemoteError::from_stderr(&stderr)
        };
        ExecutionOutcome::Failed(ExecError::Remote(error))
    }
}

async fn collect_stderr<R: AsyncRead + Unpin>(mut stderr: R) -> String {
    let mut buf = Vec::new();
    if let Err(e) = stderr.read_to_end(&mut buf).await {
        tracing::debug!(error = %e, "Failed to read mirrord stderr");
    }
    let text = String::from_utf8_lossy(&buf).into_owned();
    if !text.is_empty() {
        tracing::debug!(stderr = %text, "mirrord stderr");
    }
    text
}
