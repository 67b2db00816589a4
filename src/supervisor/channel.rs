//! Channels between the run worker and its caller.
//!
//! Two channels connect a worker to the caller:
//!
//! - the progress channel, an unbounded stream of status and warning updates
//!   that never blocks the worker;
//! - the result channel, a one-shot slot that is completed exactly once.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::supervisor::{ExecutionOutcome, SuppressionId};

/// A progress update for the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// New "current operation" text.
    Status(String),
    /// A warning from the binary, with its suppression id if it is a known one.
    Warning {
        message: String,
        suppression: Option<SuppressionId>,
    },
}

/// Create a progress channel.
#[must_use]
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSender { tx }, ProgressReceiver { rx })
}

/// Sending half of the progress channel.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<Progress>,
}

impl ProgressSender {
    /// Publish an update. Updates sent after the receiver is gone are dropped.
    pub fn send(&self, progress: Progress) {
        if self.tx.send(progress).is_err() {
            tracing::trace!("Progress receiver dropped");
        }
    }
}

/// Receiving half of the progress channel.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<Progress>,
}

impl ProgressReceiver {
    /// Wait for the next update. Returns `None` once the worker is done.
    pub async fn recv(&mut self) -> Option<Progress> {
        self.rx.recv().await
    }

    /// Take an update if one is ready.
    pub fn try_recv(&mut self) -> Option<Progress> {
        self.rx.try_recv().ok()
    }

    /// Convert into a `Stream` of updates.
    #[must_use]
    pub fn into_stream(self) -> UnboundedReceiverStream<Progress> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/// Create a result channel.
#[must_use]
pub fn result_channel() -> (ResultSender, ResultReceiver) {
    let (tx, rx) = oneshot::channel();
    (ResultSender { tx: Some(tx) }, ResultReceiver { rx })
}

/// Writing half of the result channel.
///
/// Dropping a sender that was never completed completes it with
/// [`ExecutionOutcome::Cancelled`], so a waiting caller is always released.
#[derive(Debug)]
pub struct ResultSender {
    tx: Option<oneshot::Sender<ExecutionOutcome>>,
}

impl ResultSender {
    /// Complete the channel.
    ///
    /// Only the first call has an effect. Returns `true` if this call
    /// delivered the outcome to a waiting receiver.
    pub fn complete(&mut self, outcome: ExecutionOutcome) -> bool {
        let Some(tx) = self.tx.take() else {
            tracing::debug!(outcome = %outcome, "Result already published, ignoring");
            return false;
        };
        match tx.send(outcome) {
            Ok(()) => true,
            Err(outcome) => {
                tracing::debug!(outcome = %outcome, "Result receiver gone, outcome discarded");
                false
            }
        }
    }

    /// Check whether `complete` was already called.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.tx.is_none()
    }
}

impl Drop for ResultSender {
    fn drop(&mut self) {
        if !self.is_completed() {
            self.complete(ExecutionOutcome::Cancelled);
        }
    }
}

/// Why a wait on the result channel ended without an outcome.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The deadline passed.
    #[error("deadline of {}ms elapsed", .0.as_millis())]
    Elapsed(Duration),
}

/// Reading half of the result channel.
#[derive(Debug)]
pub struct ResultReceiver {
    rx: oneshot::Receiver<ExecutionOutcome>,
}

impl ResultReceiver {
    /// Wait up to `deadline` for the outcome.
    ///
    /// # Errors
    ///
    /// Returns `WaitError::Elapsed` if the deadline passes first.
    pub async fn wait(&mut self, deadline: Duration) -> Result<ExecutionOutcome, WaitError> {
        match tokio::time::timeout(deadline, &mut self.rx).await {
            Ok(Ok(outcome)) => Ok(outcome),
            // The sender completes on drop, so this only happens if it was leaked.
            Ok(Err(_)) => Ok(ExecutionOutcome::Cancelled),
            Err(_) => Err(WaitError::Elapsed(deadline)),
        }
    }
}
