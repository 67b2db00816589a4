//! Run a mirrord subcommand and capture its stdout.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::cli::{MirrordCommand, RemoteError, SupervisedProcess, Terminate};
use crate::supervisor::ExecError;

/// Run `command` until the process exits and return its stdout.
///
/// A non-zero exit is reported as `ExecError::Remote`, built from the
/// process's stderr.
///
/// # Errors
///
/// Returns `ExecError::Launch` if the binary cannot be started,
/// `ExecError::Timeout` if it does not exit within `timeout`, and
/// `ExecError::Remote` if it exits unsuccessfully.
pub async fn run_to_completion(
    binary: &Path,
    command: &MirrordCommand,
    timeout: Duration,
) -> Result<String, ExecError> {
    let mut process = SupervisedProcess::spawn(binary, command)?;
    let stdout = process.take_stdout().ok_or(ExecError::NoStdout)?;
    let stderr = process.take_stderr();

    let collected = async {
        let (stdout, stderr) = tokio::join!(read_all(Some(stdout)), read_all(stderr));
        let status = process.wait().await?;
        Ok::<_, std::io::Error>((status, stdout?, stderr?))
    };

    let waited = tokio::time::timeout(timeout, collected).await;
    let (status, stdout, stderr) = match waited {
        Ok(result) => result?,
        Err(_) => {
            tracing::error!(
                command = command.command(),
                timeout_secs = timeout.as_secs(),
                "mirrord command timed out"
            );
            if let Err(e) = process.terminate().await {
                tracing::warn!(error = %e, "Failed to terminate mirrord");
            }
            return Err(ExecError::Timeout(timeout));
        }
    };

    tracing::debug!(command = command.command(), %status, "mirrord command exited");

    if status.success() {
        Ok(stdout)
    } else if stderr.trim().is_empty() {
        Err(ExecError::Remote(RemoteError::from_stderr(&format!(
            "mirrord exited with {status}"
        ))))
    } else {
        Err(ExecError::Remote(RemoteError::from_stderr(&stderr)))
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
