use crate::branch::{validate_branch_name, REF_FORMAT};
use crate::command::{CommandOutput, CommandTimeout, GitExecutor};
use crate::error::CommandError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadState {
    /// Branch name, or `HEAD@<short-sha>` when detached.
    pub name: String,
    pub detached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StashPush {
    Stashed,
    NothingToStash,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: u32,
    pub insertions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub commit: String,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitProbe {
    pub version: String,
    pub in_repository: bool,
}

/// Typed version-control operations over a [`GitExecutor`]. Every ref name
/// is validated before it reaches an argument vector.
pub struct Git<E> {
    exec: Arc<E>,
    remote: String,
}

impl<E> Clone for Git<E> {
    fn clone(&self) -> Self {
        Self {
            exec: self.exec.clone(),
            remote: self.remote.clone(),
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

fn checked(name: &str) -> Result<&str, CommandError> {
    if validate_branch_name(name) {
        Ok(name)
    } else {
        Err(CommandError::InvalidRef {
            name: name.to_string(),
        })
    }
}

impl<E: GitExecutor> Git<E> {
    pub fn new(exec: Arc<E>, remote: impl Into<String>) -> Self {
        Self {
            exec,
            remote: remote.into(),
        }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.exec
    }

    async fn run(&self, args: Vec<String>, timeout: CommandTimeout) -> Result<CommandOutput, CommandError> {
        self.exec.exec(args, timeout).await
    }

    /// For checks where failure just means "no".
    async fn run_silent(&self, args: Vec<String>, timeout: CommandTimeout) -> Option<CommandOutput> {
        match self.run(args, timeout).await {
            Ok(output) => Some(output),
            Err(err) => {
                debug!(error = %err, "git_check_negative");
                None
            }
        }
    }

    pub async fn current_branch(&self) -> Result<HeadState, CommandError> {
        let output = self
            .run(argv(&["rev-parse", "--abbrev-ref", "HEAD"]), CommandTimeout::Short)
            .await?;
        let name = output.stdout.trim();
        if name != "HEAD" {
            return Ok(HeadState {
                name: name.to_string(),
                detached: false,
            });
        }
        let sha = self
            .run(argv(&["rev-parse", "--short", "HEAD"]), CommandTimeout::Short)
            .await?;
        Ok(HeadState {
            name: format!("HEAD@{}", sha.stdout.trim()),
            detached: true,
        })
    }

    pub async fn fetch(&self) -> Result<(), CommandError> {
        self.run(argv(&["fetch", "--all", "--prune"]), CommandTimeout::Fetch)
            .await
            .map(|_| ())
    }

    pub async fn list_local_refs(&self) -> Result<String, CommandError> {
        let format = format!("--format={REF_FORMAT}");
        let output = self
            .run(
                argv(&["for-each-ref", "--sort=-committerdate", &format, "refs/heads/"]),
                CommandTimeout::Short,
            )
            .await?;
        Ok(output.stdout)
    }

    pub async fn list_remote_refs(&self) -> Result<String, CommandError> {
        let format = format!("--format={REF_FORMAT}");
        let prefix = format!("refs/remotes/{}/", checked(&self.remote)?);
        let output = self
            .run(
                argv(&["for-each-ref", "--sort=-committerdate", &format, &prefix]),
                CommandTimeout::Short,
            )
            .await?;
        Ok(output.stdout)
    }

    /// Checks out `branch`. A branch that only exists on the remote is
    /// created locally with tracking.
    pub async fn checkout(&self, branch: &str, remote_only: bool) -> Result<(), CommandError> {
        let branch = checked(branch)?;
        let args = if remote_only {
            let upstream = format!("{}/{}", checked(&self.remote)?, branch);
            argv(&["checkout", "-b", branch, "--track", &upstream])
        } else {
            argv(&["checkout", branch])
        };
        self.run(args, CommandTimeout::Default).await.map(|_| ())
    }

    pub async fn pull(&self, branch: &str) -> Result<(), CommandError> {
        let branch = checked(branch)?;
        let remote = checked(&self.remote)?;
        self.run(argv(&["pull", remote, branch]), CommandTimeout::Fetch)
            .await
            .map(|_| ())
    }

    pub async fn is_dirty(&self) -> Result<bool, CommandError> {
        let output = self
            .run(argv(&["status", "--porcelain"]), CommandTimeout::Short)
            .await?;
        Ok(!output.stdout.trim().is_empty())
    }

    /// Stashes tracked and untracked changes. Git exits 0 with a message
    /// when there is nothing to stash; that is reported separately.
    pub async fn stash_push(&self, message: &str) -> Result<StashPush, CommandError> {
        let output = self
            .run(
                argv(&["stash", "push", "--include-untracked", "-m", message]),
                CommandTimeout::Default,
            )
            .await?;
        if output.stdout.contains("No local changes to save")
            || output.stderr.contains("No local changes to save")
        {
            return Ok(StashPush::NothingToStash);
        }
        Ok(StashPush::Stashed)
    }

    pub async fn stash_pop(&self) -> Result<(), CommandError> {
        self.run(argv(&["stash", "pop"]), CommandTimeout::Default)
            .await
            .map(|_| ())
    }

    pub async fn diff_stats(&self, from: &str, to: &str) -> Result<DiffStats, CommandError> {
        let range = format!("{}...{}", checked(from)?, checked(to)?);
        let output = self
            .run(argv(&["diff", "--shortstat", &range]), CommandTimeout::Default)
            .await?;
        Ok(parse_shortstat(&output.stdout))
    }

    pub async fn recent_commits(&self, branch: &str, limit: usize) -> Result<Vec<CommitSummary>, CommandError> {
        let branch = checked(branch)?;
        let count = limit.max(1).to_string();
        let output = self
            .run(
                argv(&["log", "--format=%h|%s|%cI", "-n", &count, branch, "--"]),
                CommandTimeout::Short,
            )
            .await?;
        Ok(output.stdout.lines().filter_map(parse_commit_line).collect())
    }

    pub async fn delete_branch(&self, branch: &str, force: bool) -> Result<(), CommandError> {
        let branch = checked(branch)?;
        let flag = if force { "-D" } else { "-d" };
        self.run(argv(&["branch", flag, branch]), CommandTimeout::Short)
            .await
            .map(|_| ())
    }

    pub async fn branch_exists(&self, branch: &str) -> bool {
        let Ok(branch) = checked(branch) else {
            return false;
        };
        let reference = format!("refs/heads/{branch}");
        self.run_silent(
            argv(&["show-ref", "--verify", "--quiet", &reference]),
            CommandTimeout::Short,
        )
        .await
        .is_some()
    }

    /// Tool availability and repository check, run once at startup.
    pub async fn probe(&self) -> Result<GitProbe, CommandError> {
        let version = self.run(argv(&["--version"]), CommandTimeout::Short).await?;
        let in_repository = self
            .run_silent(argv(&["rev-parse", "--is-inside-work-tree"]), CommandTimeout::Short)
            .await
            .is_some_and(|output| output.stdout.trim() == "true");
        Ok(GitProbe {
            version: version.stdout.trim().to_string(),
            in_repository,
        })
    }
}

/// Parses ` 3 files changed, 10 insertions(+), 2 deletions(-)`. Any part may
/// be missing; empty output means no difference.
pub fn parse_shortstat(text: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for part in text.trim().split(',') {
        let mut words = part.split_whitespace();
        let Some(count) = words.next().and_then(|word| word.parse::<u32>().ok()) else {
            continue;
        };
        let label = words.next().unwrap_or("");
        if label.starts_with("file") {
            stats.files_changed = count;
        } else if label.starts_with("insertion") {
            stats.insertions = count;
        } else if label.starts_with("deletion") {
            stats.deletions = count;
        }
    }
    stats
}

fn parse_commit_line(line: &str) -> Option<CommitSummary> {
    let mut parts = line.splitn(3, '|');
    let commit = parts.next()?.trim();
    if commit.is_empty() {
        return None;
    }
    let subject = parts.next().unwrap_or("").to_string();
    let date = parts
        .next()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
        .map(|parsed| parsed.with_timezone(&Utc));
    Some(CommitSummary {
        commit: commit.to_string(),
        subject,
        date,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorCategory;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Vec<String>>>,
        replies: Mutex<VecDeque<Result<CommandOutput, CommandError>>>,
    }

    impl Recorder {
        fn reply(self, stdout: &str) -> Self {
            self.replies.lock().expect("replies").push_back(Ok(CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
            }));
            self
        }

        fn fail(self, stderr: &str) -> Self {
            self.replies.lock().expect("replies").push_back(Err(CommandError::Failed {
                command: "git".to_string(),
                code: Some(128),
                stderr: stderr.to_string(),
                category: crate::classify::classify("", stderr),
            }));
            self
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().expect("calls").clone()
        }
    }

    impl GitExecutor for Recorder {
        async fn exec(&self, args: Vec<String>, _timeout: CommandTimeout) -> Result<CommandOutput, CommandError> {
            self.calls.lock().expect("calls").push(args);
            self.replies
                .lock()
                .expect("replies")
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput::default()))
        }
    }

    fn fixture(recorder: Recorder) -> (Git<Recorder>, Arc<Recorder>) {
        let exec = Arc::new(recorder);
        (Git::new(exec.clone(), "origin"), exec)
    }

    #[tokio::test]
    async fn detached_head_reports_short_sha() {
        let (git, exec) = fixture(Recorder::default().reply("HEAD\n").reply("abc1234\n"));
        let head = git.current_branch().await.expect("head");
        assert_eq!(head.name, "HEAD@abc1234");
        assert!(head.detached);
        assert_eq!(exec.calls()[1], argv(&["rev-parse", "--short", "HEAD"]));
    }

    #[tokio::test]
    async fn attached_head_is_single_call() {
        let (git, exec) = fixture(Recorder::default().reply("main\n"));
        let head = git.current_branch().await.expect("head");
        assert_eq!(head.name, "main");
        assert!(!head.detached);
        assert_eq!(exec.calls().len(), 1);
    }

    #[tokio::test]
    async fn remote_only_checkout_tracks_upstream() {
        let (git, exec) = fixture(Recorder::default());
        git.checkout("feature-b", true).await.expect("checkout");
        assert_eq!(
            exec.calls()[0],
            argv(&["checkout", "-b", "feature-b", "--track", "origin/feature-b"])
        );
    }

    #[tokio::test]
    async fn unsafe_names_never_reach_the_executor() {
        let (git, exec) = fixture(Recorder::default());
        let err = git.checkout("--orphan", false).await.expect_err("rejected");
        assert!(matches!(err, CommandError::InvalidRef { .. }));
        assert!(git.delete_branch("a;rm -rf /", true).await.is_err());
        assert!(!git.branch_exists("../x").await);
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn probe_outside_a_work_tree_is_not_an_error() {
        let (git, _) = fixture(
            Recorder::default()
                .reply("git version 2.43.0\n")
                .fail("fatal: not a git repository (or any of the parent directories): .git"),
        );
        let probe = git.probe().await.expect("probe");
        assert_eq!(probe.version, "git version 2.43.0");
        assert!(!probe.in_repository);
    }

    #[tokio::test]
    async fn branch_existence_is_a_quiet_yes_or_no() {
        let (git, exec) = fixture(Recorder::default().reply("").fail(""));
        assert!(git.branch_exists("main").await);
        assert!(!git.branch_exists("gone").await);
        assert_eq!(
            exec.calls()[1],
            argv(&["show-ref", "--verify", "--quiet", "refs/heads/gone"])
        );
    }

    #[tokio::test]
    async fn nothing_to_stash_is_distinguished() {
        let (git, _) = fixture(Recorder::default().reply("No local changes to save\n"));
        assert_eq!(git.stash_push("watchtower").await.expect("push"), StashPush::NothingToStash);
        let (git, exec) = fixture(Recorder::default().reply("Saved working directory and index state\n"));
        assert_eq!(git.stash_push("watchtower").await.expect("push"), StashPush::Stashed);
        assert_eq!(
            exec.calls()[0],
            argv(&["stash", "push", "--include-untracked", "-m", "watchtower"])
        );
    }

    #[tokio::test]
    async fn dirty_check_reads_porcelain_status() {
        let (git, _) = fixture(Recorder::default().reply("?? notes.txt\n"));
        assert!(git.is_dirty().await.expect("status"));
        let (git, _) = fixture(Recorder::default().reply(""));
        assert!(!git.is_dirty().await.expect("status"));
    }

    #[tokio::test]
    async fn delete_uses_safe_or_forced_flag() {
        let (git, exec) = fixture(Recorder::default());
        git.delete_branch("old", false).await.expect("delete");
        git.delete_branch("old", true).await.expect("delete");
        let calls = exec.calls();
        assert_eq!(calls[0], argv(&["branch", "-d", "old"]));
        assert_eq!(calls[1], argv(&["branch", "-D", "old"]));
    }

    #[tokio::test]
    async fn failures_pass_through_unchanged() {
        let recorder = Recorder::default();
        recorder.replies.lock().expect("replies").push_back(Err(CommandError::Failed {
            command: "git pull origin main".to_string(),
            code: Some(1),
            stderr: "CONFLICT (content): Merge conflict in a.txt".to_string(),
            category: ErrorCategory::MergeConflict,
        }));
        let (git, _) = fixture(recorder);
        let err = git.pull("main").await.expect_err("conflict");
        assert_eq!(err.kind(), crate::error::ErrorKind::MergeConflict);
    }

    #[test]
    fn shortstat_parses_partial_output() {
        assert_eq!(
            parse_shortstat(" 3 files changed, 10 insertions(+), 2 deletions(-)\n"),
            DiffStats {
                files_changed: 3,
                insertions: 10,
                deletions: 2
            }
        );
        assert_eq!(
            parse_shortstat(" 1 file changed, 1 deletion(-)"),
            DiffStats {
                files_changed: 1,
                insertions: 0,
                deletions: 1
            }
        );
        assert_eq!(parse_shortstat(""), DiffStats::default());
    }

    #[tokio::test]
    async fn recent_commits_parse_log_lines() {
        let (git, _) = fixture(Recorder::default().reply(
            "abc1234|Fix login|2024-05-01T10:00:00+02:00\ndef5678|Add a|b|not-a-date\n",
        ));
        let commits = git.recent_commits("main", 5).await.expect("log");
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].subject, "Fix login");
        assert!(commits[0].date.is_some());
        assert_eq!(commits[1].subject, "Add a");
        assert!(commits[1].date.is_none());
    }
}
