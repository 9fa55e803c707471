use crate::classify::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure taxonomy every component acts on. Raw subprocess text never
/// reaches recovery logic; it is always reduced to one of these first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Auth,
    MergeConflict,
    DirtyWorkdir,
    Timeout,
    NotFound,
    Generic,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Auth => "auth",
            ErrorKind::MergeConflict => "merge_conflict",
            ErrorKind::DirtyWorkdir => "dirty_workdir",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Generic => "generic",
        }
    }

    /// Remediation text shown next to the failure.
    pub fn hint(&self) -> &'static str {
        match self {
            ErrorKind::Network => {
                "Network unreachable. Check your connection or VPN; the next poll retries automatically."
            }
            ErrorKind::Auth => {
                "Authentication failed. Check your credentials or SSH key, then run `git fetch` by hand once."
            }
            ErrorKind::MergeConflict => {
                "Merge conflict. Resolve the conflicted files and commit; auto-pull stays paused until then."
            }
            ErrorKind::DirtyWorkdir => {
                "Uncommitted changes block this operation. Commit them, or confirm the auto-stash to retry."
            }
            ErrorKind::Timeout => {
                "Git did not answer in time. The remote may be slow; the next poll tries again."
            }
            ErrorKind::NotFound => {
                "Git or the requested ref was not found. Check that git is installed and the branch exists."
            }
            ErrorKind::Generic => "Git reported an error; see the message above for details.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorCategory> for ErrorKind {
    fn from(value: ErrorCategory) -> Self {
        match value {
            ErrorCategory::Network => ErrorKind::Network,
            ErrorCategory::Auth => ErrorKind::Auth,
            ErrorCategory::MergeConflict => ErrorKind::MergeConflict,
            ErrorCategory::DirtyWorkdir => ErrorKind::DirtyWorkdir,
            ErrorCategory::Generic => ErrorKind::Generic,
        }
    }
}

/// Fragments of git output that mean "the thing you named does not exist".
const MISSING_REF_PATTERNS: &[&str] = &[
    "did not match any file(s) known to git",
    "unknown revision",
    "not a valid object name",
    "not a git repository",
    "couldn't find remote ref",
];

#[derive(Debug, Clone, Error)]
pub enum CommandError {
    #[error("`{command}` timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },
    #[error("`{command}`: executable not found")]
    NotFound { command: String },
    #[error("`{command}` could not start: {reason}")]
    Spawn { command: String, reason: String },
    #[error("refusing unsafe ref name {name:?}")]
    InvalidRef { name: String },
    #[error("`{command}` failed ({}): {}", exit_label(.code), first_line(.stderr))]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
        category: ErrorCategory,
    },
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::Timeout { .. } => ErrorKind::Timeout,
            CommandError::NotFound { .. } => ErrorKind::NotFound,
            CommandError::Spawn { .. } | CommandError::InvalidRef { .. } => ErrorKind::Generic,
            CommandError::Failed {
                stderr, category, ..
            } => {
                if *category == ErrorCategory::Generic
                    && MISSING_REF_PATTERNS
                        .iter()
                        .any(|pattern| stderr.contains(pattern))
                {
                    ErrorKind::NotFound
                } else {
                    ErrorKind::from(*category)
                }
            }
        }
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::new(self.kind(), self.to_string())
    }
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit {code}"),
        None => "signal".to_string(),
    }
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no diagnostic output")
}

/// A classified failure ready for the operator-facing surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub hint: String,
}

impl ErrorReport {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: kind.hint().to_string(),
        }
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.hint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(stderr: &str, category: ErrorCategory) -> CommandError {
        CommandError::Failed {
            command: "git checkout nope".to_string(),
            code: Some(1),
            stderr: stderr.to_string(),
            category,
        }
    }

    #[test]
    fn missing_pathspec_maps_to_not_found() {
        let err = failed(
            "error: pathspec 'nope' did not match any file(s) known to git",
            ErrorCategory::Generic,
        );
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn classified_category_wins_over_missing_ref_text() {
        let err = failed(
            "fatal: unable to access 'https://example.invalid/': Could not resolve host",
            ErrorCategory::Network,
        );
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[test]
    fn display_uses_first_non_empty_stderr_line() {
        let err = failed("\n  fatal: boom\nmore detail", ErrorCategory::Generic);
        assert_eq!(err.to_string(), "`git checkout nope` failed (exit 1): fatal: boom");
    }

    #[test]
    fn every_kind_has_a_distinct_hint() {
        let kinds = [
            ErrorKind::Network,
            ErrorKind::Auth,
            ErrorKind::MergeConflict,
            ErrorKind::DirtyWorkdir,
            ErrorKind::Timeout,
            ErrorKind::NotFound,
            ErrorKind::Generic,
        ];
        let hints: std::collections::HashSet<_> = kinds.iter().map(|kind| kind.hint()).collect();
        assert_eq!(hints.len(), kinds.len());
    }
}
