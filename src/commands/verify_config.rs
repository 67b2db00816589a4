//! `mirrord verify-config`: check a mirrord configuration file before a run.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cli::{MirrordCommand, ProtocolError};
use crate::commands::run_to_completion;
use crate::supervisor::ExecError;

/// Verdict of `verify-config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyStatus {
    Success,
    Fail,
}

/// Output of `mirrord verify-config --ide`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedConfig {
    #[serde(rename = "type")]
    pub status: VerifyStatus,
    /// The resolved configuration, present on success.
    #[serde(default)]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl VerifiedConfig {
    /// Parse the JSON written to stdout.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if the output is not a verification
    /// record.
    pub fn parse(output: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(output.trim()).map_err(|e| ProtocolError::malformed(output, &e))
    }

    /// True if the configuration has errors and mirrord should not run.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == VerifyStatus::Fail || !self.errors.is_empty()
    }

    /// True if the configuration names a target.
    ///
    /// The target is either a plain string or an object with a non-null
    /// `path`.
    #[must_use]
    pub fn target_set(&self) -> bool {
        let Some(target) = self.config.as_ref().and_then(|config| config.get("target")) else {
            return false;
        };
        match target {
            serde_json::Value::String(_) => true,
            serde_json::Value::Object(fields) => {
                fields.get("path").is_some_and(|path| !path.is_null())
            }
            _ => false,
        }
    }
}

/// Run `mirrord verify-config --ide <path>` and parse its verdict.
///
/// # Errors
///
/// Returns `ExecError` if the command fails or its output cannot be parsed.
pub async fn verify_config(
    binary: &Path,
    config_path: &str,
    timeout: Duration,
) -> Result<VerifiedConfig, ExecError> {
    let output = run_to_completion(binary, &MirrordCommand::verify_config(config_path), timeout).await?;
    let verified = VerifiedConfig::parse(&output)?;

    for warning in &verified.warnings {
        tracing::warn!(path = %config_path, warning = %warning, "mirrord config warning");
    }
    for error in &verified.errors {
        tracing::error!(path = %config_path, error = %error, "mirrord config error");
    }
    tracing::debug!(status = ?verified.status, target_set = verified.target_set(), "Verified config");

    Ok(verified)
}
