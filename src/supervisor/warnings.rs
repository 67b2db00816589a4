//! Warning classification.
//!
//! Warnings from the mirrord binary are free text. A small ordered rule set
//! maps known warnings to a stable suppression id, so the user can silence a
//! whole class of warning instead of a single message.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Stable key for a class of warnings the user may silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionId {
    /// The remote agent and the local binary are different versions.
    AgentVersionMismatch,
    /// mirrord runs without a target.
    RunningTargetless,
    /// The local binary may be out of date.
    PossiblyOutdatedBinary,
}

impl SuppressionId {
    /// Key used in configuration files.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentVersionMismatch => "agent_version_mismatch",
            Self::RunningTargetless => "running_targetless",
            Self::PossiblyOutdatedBinary => "possibly_outdated_binary",
        }
    }

    /// Human readable description of the warning class.
    #[must_use]
    pub fn presentable_name(self) -> &'static str {
        match self {
            Self::AgentVersionMismatch => "mirrord agent version mismatch",
            Self::RunningTargetless => "mirrord running targetless",
            Self::PossiblyOutdatedBinary => "possibly outdated mirrord binary is used",
        }
    }
}

impl fmt::Display for SuppressionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for warning rule construction.
#[derive(thiserror::Error, Debug)]
pub enum WarningRuleError {
    /// Invalid regex pattern.
    #[error("Invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    /// A containment rule with nothing to look for.
    #[error("Warning rule has no substrings")]
    Empty,
}

#[derive(Debug, Clone)]
enum Matcher {
    /// Every substring must occur in the message.
    ContainsAll(Vec<String>),
    Pattern(Regex),
}

/// Maps warnings matching a predicate to a suppression id.
#[derive(Debug, Clone)]
pub struct WarningRule {
    matcher: Matcher,
    id: SuppressionId,
}

impl WarningRule {
    /// Rule that matches when the message contains all of `needles`.
    ///
    /// # Errors
    ///
    /// Returns `WarningRuleError::Empty` if `needles` is empty.
    pub fn contains_all<I, S>(needles: I, id: SuppressionId) -> Result<Self, WarningRuleError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let needles: Vec<String> = needles.into_iter().map(Into::into).collect();
        if needles.is_empty() {
            return Err(WarningRuleError::Empty);
        }
        Ok(Self {
            matcher: Matcher::ContainsAll(needles),
            id,
        })
    }

    /// Rule that matches a regular expression.
    ///
    /// # Errors
    ///
    /// Returns `WarningRuleError::InvalidPattern` if the regex is invalid.
    pub fn pattern(pattern: &str, id: SuppressionId) -> Result<Self, WarningRuleError> {
        Ok(Self {
            matcher: Matcher::Pattern(Regex::new(pattern)?),
            id,
        })
    }

    /// Check if the warning matches this rule.
    #[must_use]
    pub fn matches(&self, message: &str) -> bool {
        match &self.matcher {
            Matcher::ContainsAll(needles) => needles.iter().all(|n| message.contains(n.as_str())),
            Matcher::Pattern(regex) => regex.is_match(message),
        }
    }

    /// Get the suppression id.
    #[must_use]
    pub fn id(&self) -> SuppressionId {
        self.id
    }
}

/// Ordered rule set. The first matching rule decides.
#[derive(Debug, Clone)]
pub struct WarningClassifier {
    rules: Vec<WarningRule>,
}

impl Default for WarningClassifier {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

impl WarningClassifier {
    /// Create a classifier with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Create a classifier with the built-in rules.
    #[must_use]
    pub fn with_default_rules() -> Self {
        let rules = Self::default_rules()
            .into_iter()
            .filter_map(|result| match result {
                Ok(rule) => Some(rule),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to build default warning rule");
                    None
                }
            })
            .collect();
        Self { rules }
    }

    /// Append a rule. It is consulted after every existing rule.
    pub fn add_rule(&mut self, rule: WarningRule) {
        self.rules.push(rule);
    }

    /// Classify a warning message.
    #[must_use]
    pub fn classify(&self, message: &str) -> Option<SuppressionId> {
        self.rules
            .iter()
            .find(|rule| rule.matches(message))
            .map(WarningRule::id)
    }

    /// Check if the classifier is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Get the number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Get all rules.
    #[must_use]
    pub fn rules(&self) -> &[WarningRule] {
        &self.rules
    }

    fn default_rules() -> Vec<Result<WarningRule, WarningRuleError>> {
        vec![WarningRule::contains_all(
            ["Agent version", "does not match the local mirrord version"],
            SuppressionId::AgentVersionMismatch,
        )]
    }
}
