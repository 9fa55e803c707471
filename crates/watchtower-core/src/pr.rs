use crate::branch::validate_branch_name;
use crate::cache::CommitCache;
use crate::command::{run, CommandTimeout, RunOptions};
use crate::error::CommandError;
use crate::store::{Scope, Store, StoreError, Update};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrState::Open => "open",
            PrState::Closed => "closed",
            PrState::Merged => "merged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub state: PrState,
    pub title: String,
}

impl PrInfo {
    pub fn is_merged(&self) -> bool {
        self.state == PrState::Merged
    }
}

#[derive(Debug, Error)]
pub enum PrError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("unreadable pr listing: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Stale(#[from] StoreError),
}

/// First entry wins; the CLI lists the most recent PR first.
pub fn parse_pr_list(json: &str) -> Result<Option<PrInfo>, serde_json::Error> {
    let entries: Vec<PrInfo> = serde_json::from_str(json)?;
    Ok(entries.into_iter().next())
}

/// Looks up PR state per branch, cached by commit.
pub struct PrLookup {
    program: String,
    cwd: PathBuf,
    cache: Mutex<CommitCache<Option<PrInfo>>>,
}

impl PrLookup {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self::with_program("gh", cwd)
    }

    pub fn with_program(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cwd: cwd.into(),
            cache: Mutex::new(CommitCache::new()),
        }
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, CommitCache<Option<PrInfo>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cached(&self, branch: &str, commit: &str) -> Option<Option<PrInfo>> {
        self.cache().get(branch, commit)
    }

    /// Merged status from cache only; never shells out.
    pub fn is_merged(&self, branch: &str, commit: &str) -> bool {
        matches!(self.cached(branch, commit), Some(Some(info)) if info.is_merged())
    }

    pub fn invalidate_moved<'a>(&self, tips: impl IntoIterator<Item = (&'a str, &'a str)>) -> usize {
        self.cache().invalidate_moved(tips)
    }

    pub async fn lookup(&self, branch: &str, commit: &str) -> Result<Option<PrInfo>, PrError> {
        if let Some(hit) = self.cached(branch, commit) {
            return Ok(hit);
        }
        if !validate_branch_name(branch) {
            return Err(CommandError::InvalidRef {
                name: branch.to_string(),
            }
            .into());
        }
        let args: Vec<String> = [
            "pr", "list", "--head", branch, "--state", "all", "--json", "number,state,title",
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect();
        let options = RunOptions::with_timeout(CommandTimeout::Default).in_dir(&self.cwd);
        let output = run(&self.program, &args, &options).await?;
        let info = parse_pr_list(&output.stdout)?;
        self.cache().insert(branch, commit, info.clone());
        Ok(info)
    }

    /// Looks up the selected branch and publishes the result, unless the
    /// selection moved while the lookup was in flight.
    pub async fn refresh_selected(&self, store: &Store) -> Result<Option<PrInfo>, PrError> {
        let stamp = store.stamp(Scope::Selection);
        let target = store.read(|snapshot| {
            snapshot
                .selected_branch()
                .map(|branch| (branch.name.clone(), branch.tip().to_string()))
        });
        let Some((name, commit)) = target else {
            return Ok(None);
        };
        let info = self.lookup(&name, &commit).await?;
        if let Err(err) = store.apply_stamped(stamp, [Update::SelectedPr(info.clone())]) {
            debug!(branch = %name, "pr_result_discarded");
            return Err(err.into());
        }
        Ok(info)
    }
}
