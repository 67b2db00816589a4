//! `mirrord ls`: list the targets mirrord can impersonate.

use std::path::Path;
use std::time::Duration;

use crate::cli::{MirrordCommand, ProtocolError};
use crate::commands::run_to_completion;
use crate::supervisor::ExecError;

/// Shown when the cluster has no target to offer.
pub const NO_TARGETS_MESSAGE: &str = "No mirrord target available in the configured namespace. \
     You can run targetless, or set a different target namespace or kubeconfig in the mirrord configuration file.";

/// Parse the JSON output of `mirrord ls -o json`.
///
/// # Errors
///
/// Returns `ProtocolError::Malformed` if the output is not a JSON array of
/// strings.
pub fn parse_targets(output: &str) -> Result<Vec<String>, ProtocolError> {
    serde_json::from_str(output.trim()).map_err(|e| ProtocolError::malformed(output, &e))
}

/// Run `mirrord ls` and return the available targets.
///
/// An empty list is not an error; callers show [`NO_TARGETS_MESSAGE`].
///
/// `config_file` is passed with `-f` so the listing uses the same
/// namespace and kubeconfig as the run.
///
/// # Errors
///
/// Returns `ExecError` if the command fails or its output cannot be parsed.
pub async fn list_targets(
    binary: &Path,
    config_file: Option<&str>,
    timeout: Duration,
) -> Result<Vec<String>, ExecError> {
    let mut command = MirrordCommand::ls();
    if let Some(path) = config_file {
        command = command.config_file(path);
    }

    let output = run_to_completion(binary, &command, timeout).await?;
    tracing::debug!(output = %output, "Parsing mirrord ls output");

    let targets = parse_targets(&output)?;
    tracing::debug!(count = targets.len(), "Listed mirrord targets");
    Ok(targets)
}
