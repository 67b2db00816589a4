//! Configuration types.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::supervisor::{
    SuppressionId, WarningClassifier, WarningRule, WarningRuleError, DEFAULT_DEBUGGER_PORTS,
};

/// A user-defined warning rule.
///
/// Either `contains` (all substrings must occur) or `pattern` (a regex) is
/// used; `pattern` wins when both are set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningRuleConfig {
    /// Suppression id for matching warnings.
    pub id: SuppressionId,
    #[serde(default)]
    pub contains: Vec<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

impl WarningRuleConfig {
    /// Build the rule.
    ///
    /// # Errors
    ///
    /// Returns `WarningRuleError` if the rule is empty or the pattern is invalid.
    pub fn to_rule(&self) -> Result<WarningRule, WarningRuleError> {
        match &self.pattern {
            Some(pattern) => WarningRule::pattern(pattern, self.id),
            None => WarningRule::contains_all(self.contains.iter().cloned(), self.id),
        }
    }
}

/// Configuration for the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Path to the mirrord binary.
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    /// Seconds to wait for the launch result.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Milliseconds a process gets between SIGTERM and SIGKILL.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Whether mirrord runs when `MIRRORD_ACTIVE` is not set.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Warning classes the user silenced.
    #[serde(default)]
    pub suppressed_warnings: BTreeSet<SuppressionId>,
    /// Extra warning rules, consulted after the built-in ones.
    #[serde(default)]
    pub warning_rules: Vec<WarningRuleConfig>,
    /// Port range excluded from mirrord for debuggers. Empty disables it.
    #[serde(default = "default_ignore_debugger_ports")]
    pub ignore_debugger_ports: String,
    /// Extra environment for the mirrord process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_binary() -> PathBuf {
    PathBuf::from("mirrord")
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_enabled() -> bool {
    true
}

fn default_ignore_debugger_ports() -> String {
    DEFAULT_DEBUGGER_PORTS.to_string()
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            timeout_secs: default_timeout_secs(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            enabled: default_enabled(),
            suppressed_warnings: BTreeSet::new(),
            warning_rules: Vec::new(),
            ignore_debugger_ports: default_ignore_debugger_ports(),
            env: BTreeMap::new(),
        }
    }
}

impl DriverConfig {
    /// Deadline for the launch result.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Grace period for process shutdown.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Debugger port range, unless disabled.
    #[must_use]
    pub fn debugger_ports(&self) -> Option<String> {
        let ports = self.ignore_debugger_ports.trim();
        (!ports.is_empty()).then(|| ports.to_string())
    }

    /// Check if warnings of this class should be hidden.
    #[must_use]
    pub fn is_suppressed(&self, id: SuppressionId) -> bool {
        self.suppressed_warnings.contains(&id)
    }

    /// Built-in warning rules followed by the configured ones.
    ///
    /// Invalid configured rules are logged and skipped.
    #[must_use]
    pub fn warning_classifier(&self) -> WarningClassifier {
        let mut classifier = WarningClassifier::with_default_rules();
        for rule in &self.warning_rules {
            match rule.to_rule() {
                Ok(rule) => classifier.add_rule(rule),
                Err(e) => tracing::warn!(id = %rule.id, error = %e, "Skipping invalid warning rule"),
            }
        }
        classifier
    }
}
