use serde::{Deserialize, Serialize};

/// Bumped whenever a rule is added, removed or reordered.
pub const CLASSIFICATION_TABLE_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Auth,
    MergeConflict,
    DirtyWorkdir,
    Generic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Git's conflict markers are upper-case on purpose; "conflict" in a
    /// branch name or commit subject must not match.
    CaseSensitive,
    CaseInsensitive,
}

#[derive(Debug, Clone, Copy)]
pub struct ClassificationRule {
    pub category: ErrorCategory,
    pub pattern: &'static str,
    pub mode: MatchMode,
}

const fn rule(category: ErrorCategory, pattern: &'static str, mode: MatchMode) -> ClassificationRule {
    ClassificationRule {
        category,
        pattern,
        mode,
    }
}

use ErrorCategory::{Auth, DirtyWorkdir, MergeConflict, Network};
use MatchMode::{CaseInsensitive, CaseSensitive};

/// Evaluated top to bottom, first hit wins. Dirty-tree phrases come first
/// because git mentions "merge" in them ("... before you merge"); auth comes
/// before network because both end in "Could not read from remote repository".
/// Insensitive patterns are written in lower case.
pub const CLASSIFICATION_TABLE: &[ClassificationRule] = &[
    rule(DirtyWorkdir, "your local changes to the following files would be overwritten", CaseInsensitive),
    rule(DirtyWorkdir, "untracked working tree files would be overwritten", CaseInsensitive),
    rule(DirtyWorkdir, "please commit your changes or stash them", CaseInsensitive),
    rule(DirtyWorkdir, "please move or remove them before", CaseInsensitive),
    rule(DirtyWorkdir, "you have unstaged changes", CaseInsensitive),
    rule(DirtyWorkdir, "uncommitted changes", CaseInsensitive),
    rule(MergeConflict, "CONFLICT (", CaseSensitive),
    rule(MergeConflict, "Automatic merge failed", CaseSensitive),
    rule(MergeConflict, "fix conflicts and then commit", CaseSensitive),
    rule(MergeConflict, "You have unmerged paths", CaseSensitive),
    rule(MergeConflict, "unmerged files", CaseSensitive),
    rule(MergeConflict, "Merge conflict", CaseSensitive),
    rule(Auth, "authentication failed", CaseInsensitive),
    rule(Auth, "permission denied", CaseInsensitive),
    rule(Auth, "could not read username", CaseInsensitive),
    rule(Auth, "could not read password", CaseInsensitive),
    rule(Auth, "invalid username or password", CaseInsensitive),
    rule(Auth, "host key verification failed", CaseInsensitive),
    rule(Auth, "terminal prompts disabled", CaseInsensitive),
    rule(Auth, "the requested url returned error: 403", CaseInsensitive),
    rule(Auth, "the requested url returned error: 401", CaseInsensitive),
    rule(Network, "could not resolve host", CaseInsensitive),
    rule(Network, "could not resolve hostname", CaseInsensitive),
    rule(Network, "unable to access", CaseInsensitive),
    rule(Network, "failed to connect", CaseInsensitive),
    rule(Network, "connection refused", CaseInsensitive),
    rule(Network, "connection timed out", CaseInsensitive),
    rule(Network, "connection reset", CaseInsensitive),
    rule(Network, "operation timed out", CaseInsensitive),
    rule(Network, "network is unreachable", CaseInsensitive),
    rule(Network, "no route to host", CaseInsensitive),
    rule(Network, "the remote end hung up unexpectedly", CaseInsensitive),
    rule(Network, "early eof", CaseInsensitive),
    rule(Network, "ssl_connect", CaseInsensitive),
    rule(Network, "tls connection", CaseInsensitive),
    rule(Network, "could not read from remote repository", CaseInsensitive),
];

/// `message` is whatever the caller has (usually stdout or the error text),
/// `stderr` the diagnostic stream. Both are searched.
pub fn classify(message: &str, stderr: &str) -> ErrorCategory {
    classify_with(CLASSIFICATION_TABLE, message, stderr)
}

pub fn classify_with(table: &[ClassificationRule], message: &str, stderr: &str) -> ErrorCategory {
    let lowered_message = message.to_lowercase();
    let lowered_stderr = stderr.to_lowercase();
    for entry in table {
        let hit = match entry.mode {
            MatchMode::CaseSensitive => {
                message.contains(entry.pattern) || stderr.contains(entry.pattern)
            }
            MatchMode::CaseInsensitive => {
                lowered_message.contains(entry.pattern) || lowered_stderr.contains(entry.pattern)
            }
        };
        if hit {
            return entry.category;
        }
    }
    ErrorCategory::Generic
}
