//! Colored CLI display utilities for driver output.
//!
//! Progress goes to stderr so stdout stays free for the machine-readable
//! result.

use std::collections::BTreeSet;
use std::io::{self, Write};

use chrono::Utc;
use owo_colors::OwoColorize;

use crate::cli::ExecutionResult;
use crate::commands::VerifiedConfig;
use crate::supervisor::{ExecError, Progress, SuppressionId};

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Truncate a string to a maximum number of characters, adding ellipsis if
/// truncated.
#[must_use]
pub fn truncate(s: &str, max_len: usize, raw_mode: bool) -> String {
    if raw_mode || s.chars().count() <= max_len {
        return s.to_string();
    }
    if max_len <= 3 {
        return "...".to_string();
    }
    let kept: String = s.chars().take(max_len - 3).collect();
    format!("{kept}...")
}

/// Returns true if the user silenced this update.
#[must_use]
pub fn is_hidden(progress: &Progress, suppressed: &BTreeSet<SuppressionId>) -> bool {
    match progress {
        Progress::Warning {
            suppression: Some(id),
            ..
        } => suppressed.contains(id),
        _ => false,
    }
}

/// Print a progress update unless it is suppressed.
pub fn print_progress(progress: &Progress, suppressed: &BTreeSet<SuppressionId>, raw_mode: bool) {
    if is_hidden(progress, suppressed) {
        tracing::debug!(?progress, "Suppressed warning not shown");
        return;
    }
    match progress {
        Progress::Status(text) => print_status(text, raw_mode),
        Progress::Warning {
            message,
            suppression,
        } => print_warning(message, *suppression),
    }
}

/// Print the current operation.
pub fn print_status(text: &str, raw_mode: bool) {
    eprintln!(
        "{} {} {}",
        timestamp().dimmed(),
        "[STATUS]".blue().bold(),
        truncate(text, 120, raw_mode)
    );
    let _ = io::stderr().flush();
}

/// Print a warning from the binary.
pub fn print_warning(message: &str, suppression: Option<SuppressionId>) {
    match suppression {
        Some(id) => eprintln!(
            "{} {} {} {}",
            timestamp().dimmed(),
            "[WARN]".yellow().bold(),
            message,
            format!(
                "({}, silence with suppressed_warnings = [\"{id}\"])",
                id.presentable_name()
            )
            .dimmed()
        ),
        None => eprintln!("{} {} {}", timestamp().dimmed(), "[WARN]".yellow().bold(), message),
    }
    let _ = io::stderr().flush();
}

/// Print a failed run with its hint.
pub fn print_error(error: &ExecError) {
    if error.is_cancellation() {
        eprintln!("{} {}", "[CANCELLED]".yellow().bold(), error);
    } else {
        eprintln!("{} {}", "[ERROR]".red().bold(), error);
    }
    if let Some(hint) = error.hint() {
        eprintln!("{} {}", "[HINT]".cyan().bold(), hint.dimmed());
    }
    let _ = io::stderr().flush();
}

/// Print a run that ended without a result.
pub fn print_cancelled() {
    eprintln!(
        "{} {} mirrord exited without a result",
        timestamp().dimmed(),
        "[CANCELLED]".yellow().bold()
    );
    let _ = io::stderr().flush();
}

/// Print a successful run.
pub fn print_done(result: &ExecutionResult) {
    eprintln!(
        "{} {} {} environment variables{}",
        timestamp().dimmed(),
        "[DONE]".green().bold(),
        result.environment().len(),
        result
            .patched_path()
            .map_or(String::new(), |path| format!(", patched executable {path}"))
            .dimmed()
    );
    let _ = io::stderr().flush();
}

/// Print the warnings and errors of a verified configuration.
pub fn print_verified(verified: &VerifiedConfig) {
    for warning in &verified.warnings {
        print_warning(warning, None);
    }
    for error in &verified.errors {
        eprintln!("{} {}", "[ERROR]".red().bold(), error);
    }
    if !verified.is_error() {
        eprintln!(
            "{} {} config is valid (target {})",
            timestamp().dimmed(),
            "[DONE]".green().bold(),
            if verified.target_set() { "set" } else { "not set" }
        );
    }
    let _ = io::stderr().flush();
}
