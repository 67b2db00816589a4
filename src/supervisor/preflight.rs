//! Checks and environment handling done before mirrord is launched.
//!
//! `project_env` is the environment of the process the user is about to
//! run: the system environment merged with the run configuration's own
//! variables.

use std::collections::BTreeMap;
use std::path::Path;

/// Forces mirrord on (`1`) or off (`0`) for a single run configuration.
pub const ACTIVE_ENV: &str = "MIRRORD_ACTIVE";

/// Path of the mirrord configuration file for a run configuration.
pub const CONFIG_FILE_ENV: &str = "MIRRORD_CONFIG_FILE";

/// Macro in [`CONFIG_FILE_ENV`] replaced with the project directory.
pub const PROJECT_PATH_MACRO: &str = "$ProjectPath$";

/// Variable mirrord sets in the processes it runs.
const RESOLVED_CONFIG_ENV: &str = "MIRRORD_RESOLVED_CONFIG";

/// Variables mirrord uses to load its layer.
const PRELOAD_ENVS: &[&str] = &["LD_PRELOAD", "DYLD_INSERT_LIBRARIES"];

/// Name fragment of the mirrord layer library.
const LAYER_LIBRARY: &str = "libmirrord";

/// mirrord variables found in an environment that should not have them.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Detected mirrord environment variables that were probably left behind by a previous execution: {}. \
     Please check your project launch configuration and remove environment variables that you do not recognize.",
    .keys.join(", ")
)]
pub struct LeftoverEnvError {
    pub keys: Vec<String>,
}

/// Whether mirrord should run for this launch.
///
/// `MIRRORD_ACTIVE=1` forces it on, `MIRRORD_ACTIVE=0` forces it off, any
/// other value (or none) defers to `enabled`.
#[must_use]
pub fn is_enabled(project_env: &BTreeMap<String, String>, enabled: bool) -> bool {
    match project_env.get(ACTIVE_ENV).map(String::as_str) {
        Some("1") => true,
        Some("0") => false,
        _ => enabled,
    }
}

/// Fail if the environment still carries variables from an earlier run.
///
/// This check applies whether or not mirrord is enabled.
///
/// # Errors
///
/// Returns `LeftoverEnvError` listing the offending keys.
pub fn check_leftover_env(project_env: &BTreeMap<String, String>) -> Result<(), LeftoverEnvError> {
    let keys: Vec<String> = project_env
        .iter()
        .filter(|(key, value)| {
            key.as_str() == RESOLVED_CONFIG_ENV
                || (PRELOAD_ENVS.contains(&key.as_str()) && value.contains(LAYER_LIBRARY))
        })
        .map(|(key, _)| key.clone())
        .collect();

    if keys.is_empty() {
        Ok(())
    } else {
        tracing::debug!(keys = ?keys, "Found leftover mirrord environment variables");
        Err(LeftoverEnvError { keys })
    }
}

/// Read the config file path from `MIRRORD_CONFIG_FILE`, expanding the
/// `$ProjectPath$` macro.
///
/// If the macro is used but no project directory is known, the value is
/// returned unexpanded.
#[must_use]
pub fn resolve_config_path(
    project_env: &BTreeMap<String, String>,
    project_dir: Option<&Path>,
) -> Option<String> {
    let raw = project_env.get(CONFIG_FILE_ENV)?;
    if !raw.contains(PROJECT_PATH_MACRO) {
        return Some(raw.clone());
    }

    match project_dir {
        Some(dir) => Some(raw.replace(PROJECT_PATH_MACRO, &dir.to_string_lossy())),
        None => {
            tracing::warn!(
                value = %raw,
                "Failed to evaluate `ProjectPath` macro used in `{CONFIG_FILE_ENV}` environment variable"
            );
            Some(raw.clone())
        }
    }
}
