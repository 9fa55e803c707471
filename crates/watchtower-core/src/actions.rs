use crate::branch::validate_branch_name;
use crate::command::GitExecutor;
use crate::error::{CommandError, ErrorKind, ErrorReport};
use crate::git::{CommitSummary, DiffStats, Git};
use crate::process::ProcessManager;
use crate::reload::{NoopReload, ReloadHook};
use crate::stash::{PendingOperation, RecoveryOutcome, StashRecovery};
use crate::store::{Scope, Store, ToastLevel, Update};
use crate::sync::OperationLock;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Done,
    /// Blocked by local changes; parked for stash confirmation.
    NeedsConfirmation(PendingOperation),
    Failed(ErrorReport),
    /// Refused before anything ran.
    Rejected(String),
}

pub struct Actions<E> {
    git: Git<E>,
    store: Store,
    lock: Arc<OperationLock>,
    recovery: Arc<StashRecovery>,
    reload: Arc<dyn ReloadHook>,
    server: Option<Arc<ProcessManager>>,
    restart_on_switch: bool,
    refresh: Option<Arc<Notify>>,
}

impl<E: GitExecutor> Actions<E> {
    pub fn new(git: Git<E>, store: Store, lock: Arc<OperationLock>, recovery: Arc<StashRecovery>) -> Self {
        Self {
            git,
            store,
            lock,
            recovery,
            reload: Arc::new(NoopReload),
            server: None,
            restart_on_switch: false,
            refresh: None,
        }
    }

    pub fn with_reload(mut self, reload: Arc<dyn ReloadHook>) -> Self {
        self.reload = reload;
        self
    }

    pub fn with_server(mut self, server: Arc<ProcessManager>, restart_on_switch: bool) -> Self {
        self.server = Some(server);
        self.restart_on_switch = restart_on_switch;
        self
    }

    /// Wakes the poll loop after an action so the list catches up at once.
    pub fn with_refresh(mut self, refresh: Arc<Notify>) -> Self {
        self.refresh = Some(refresh);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn switch(&self, branch: &str) -> ActionOutcome {
        if !validate_branch_name(branch) {
            return self.reject(format!("{branch:?} is not a valid branch name"));
        }
        let outcome = {
            let _guard = self.lock.acquire("switch").await;
            self.switch_locked(branch).await
        };
        if outcome == ActionOutcome::Done {
            self.after_switch().await;
        }
        outcome
    }

    async fn switch_locked(&self, branch: &str) -> ActionOutcome {
        let operation = PendingOperation::Switch {
            branch: branch.to_string(),
        };
        self.recovery.clear_if_unrelated(&self.store, &operation);

        let current = self.store.read(|snapshot| snapshot.current_branch.clone());
        if current.as_deref() == Some(branch) {
            self.recovery.resolve(&self.store, &operation);
            return self.reject(format!("Already on {branch}"));
        }

        match self.git.is_dirty().await {
            Ok(true) => {
                let report = ErrorReport::new(
                    ErrorKind::DirtyWorkdir,
                    format!("Local changes block the switch to {branch}"),
                );
                info!(branch, "switch_blocked_dirty");
                self.recovery.begin(&self.store, operation.clone(), report);
                return ActionOutcome::NeedsConfirmation(operation);
            }
            Ok(false) => {}
            // let checkout decide; its failure is classified below
            Err(err) => debug!(error = %err, "dirty_check_failed"),
        }

        match self.checkout(branch).await {
            Ok(()) => {
                self.recovery.resolve(&self.store, &operation);
                self.switched(branch);
                ActionOutcome::Done
            }
            Err(err) if err.kind() == ErrorKind::DirtyWorkdir => {
                self.recovery.begin(&self.store, operation.clone(), err.report());
                ActionOutcome::NeedsConfirmation(operation)
            }
            Err(err) => self.fail(&format!("Switch to {branch}"), err),
        }
    }

    async fn checkout(&self, branch: &str) -> Result<(), CommandError> {
        let remote_only = self
            .store
            .read(|snapshot| snapshot.branch(branch).is_some_and(|entry| !entry.is_local));
        self.git.checkout(branch, remote_only).await
    }

    fn switched(&self, branch: &str) {
        self.store.supersede(Scope::Checkout);
        let mut branches = self.store.read(|snapshot| snapshot.branches.clone());
        for entry in branches.iter_mut().filter(|entry| entry.name == branch) {
            entry.is_new = false;
            entry.new_at = None;
            entry.is_local = true;
        }
        self.store.apply([
            Update::Branches(branches),
            Update::CurrentBranch {
                name: Some(branch.to_string()),
                detached: false,
            },
            Update::MergeConflict(false),
            Update::LastError(None),
        ]);
        self.store.select_name(branch);
        info!(branch, "branch_switched");
        self.store.notify(ToastLevel::Success, format!("Switched to {branch}"));
        self.reload.notify_clients("branch_switch");
    }

    async fn after_switch(&self) {
        if self.restart_on_switch {
            if let Some(server) = &self.server {
                if server.last_command().await.is_some() {
                    if let ActionOutcome::Failed(report) = self.restart_server().await {
                        warn!(message = %report.message, "server_restart_after_switch_failed");
                    }
                }
            }
        }
        self.request_refresh();
    }

    /// Pulls the current branch.
    pub async fn pull(&self) -> ActionOutcome {
        let (current, detached) = self
            .store
            .read(|snapshot| (snapshot.current_branch.clone(), snapshot.detached));
        let Some(branch) = current.filter(|_| !detached) else {
            return self.reject("Nothing to pull on a detached HEAD".to_string());
        };
        let outcome = {
            let _guard = self.lock.acquire("pull").await;
            self.pull_locked(&branch).await
        };
        if outcome == ActionOutcome::Done {
            self.request_refresh();
        }
        outcome
    }

    async fn pull_locked(&self, branch: &str) -> ActionOutcome {
        let operation = PendingOperation::Pull {
            branch: branch.to_string(),
        };
        self.recovery.clear_if_unrelated(&self.store, &operation);
        match self.git.pull(branch).await {
            Ok(()) => {
                self.recovery.resolve(&self.store, &operation);
                self.pulled(branch);
                ActionOutcome::Done
            }
            Err(err) => match err.kind() {
                ErrorKind::DirtyWorkdir => {
                    self.recovery.begin(&self.store, operation.clone(), err.report());
                    ActionOutcome::NeedsConfirmation(operation)
                }
                ErrorKind::MergeConflict => {
                    let report = err.report();
                    warn!(branch, "pull_merge_conflict");
                    self.store.apply([
                        Update::MergeConflict(true),
                        Update::LastError(Some(report.clone())),
                    ]);
                    self.store.notify(ToastLevel::Error, report.hint.clone());
                    ActionOutcome::Failed(report)
                }
                _ => self.fail(&format!("Pull of {branch}"), err),
            },
        }
    }

    fn pulled(&self, branch: &str) {
        let mut branches = self.store.read(|snapshot| snapshot.branches.clone());
        for entry in branches.iter_mut().filter(|entry| entry.name == branch) {
            if let Some(remote_commit) = entry.remote_commit.clone() {
                entry.commit = remote_commit;
            }
            entry.has_updates = false;
        }
        self.store.apply([
            Update::Branches(branches),
            Update::MergeConflict(false),
            Update::LastError(None),
        ]);
        info!(branch, "branch_pulled");
        self.store.notify(ToastLevel::Success, format!("Pulled latest {branch}"));
        self.reload.notify_clients("pull");
    }

    /// Stashes, retries the parked operation, and restores the stash if
    /// the retry fails.
    pub async fn confirm_stash(&self) -> ActionOutcome {
        let (outcome, switched) = {
            let _guard = self.lock.acquire("stash_confirm").await;
            let recovered = self
                .recovery
                .confirm(&self.git, &self.store, |operation| self.retry(operation))
                .await;
            match recovered {
                RecoveryOutcome::Completed(PendingOperation::Switch { branch }) => {
                    self.switched(&branch);
                    (ActionOutcome::Done, true)
                }
                RecoveryOutcome::Completed(PendingOperation::Pull { branch }) => {
                    self.pulled(&branch);
                    (ActionOutcome::Done, false)
                }
                other => (self.unrecovered(other), false),
            }
        };
        if switched {
            self.after_switch().await;
        } else if outcome == ActionOutcome::Done {
            self.request_refresh();
        }
        outcome
    }

    fn unrecovered(&self, outcome: RecoveryOutcome) -> ActionOutcome {
        match outcome {
            RecoveryOutcome::Completed(_) => ActionOutcome::Done,
            RecoveryOutcome::NothingToStash => ActionOutcome::Failed(ErrorReport::new(
                ErrorKind::Generic,
                "Nothing to stash; the operation was blocked by something else",
            )),
            RecoveryOutcome::StashFailed(report)
            | RecoveryOutcome::RetryFailedRestored(report)
            | RecoveryOutcome::RetryFailedStashKept(report) => ActionOutcome::Failed(report),
            RecoveryOutcome::NotPending => self.reject("No operation is waiting for a stash".to_string()),
        }
    }

    async fn retry(&self, operation: PendingOperation) -> Result<(), CommandError> {
        match operation {
            PendingOperation::Switch { branch } => self.checkout(&branch).await,
            PendingOperation::Pull { branch } => self.git.pull(&branch).await,
        }
    }

    pub fn cancel_stash(&self) -> bool {
        self.recovery.cancel(&self.store)
    }

    pub fn acknowledge_stash_warning(&self) -> bool {
        self.recovery.acknowledge_warning(&self.store)
    }

    /// Clears the sticky conflict flag once the operator has resolved the
    /// merge outside the tool.
    pub fn resolve_conflict(&self) -> bool {
        if !self.store.read(|snapshot| snapshot.merge_conflict) {
            return false;
        }
        self.store.update(Update::MergeConflict(false));
        info!("merge_conflict_cleared");
        self.store
            .log_activity(ToastLevel::Info, "Merge conflict marked resolved; auto-pull re-enabled");
        true
    }

    pub async fn delete_branch(&self, branch: &str, force: bool) -> ActionOutcome {
        if !validate_branch_name(branch) {
            return self.reject(format!("{branch:?} is not a valid branch name"));
        }
        let (current, is_local) = self.store.read(|snapshot| {
            (
                snapshot.current_branch.clone(),
                snapshot.branch(branch).map(|entry| entry.is_local),
            )
        });
        if current.as_deref() == Some(branch) {
            return self.reject(format!("Cannot delete {branch}: it is checked out"));
        }
        match is_local {
            Some(true) => {}
            Some(false) => return self.reject(format!("{branch} only exists on the remote")),
            // not listed yet; ask git before touching anything
            None if !self.git.branch_exists(branch).await => {
                return self.reject(format!("No local branch named {branch}"));
            }
            None => {}
        }
        let result = {
            let _guard = self.lock.acquire("delete_branch").await;
            self.git.delete_branch(branch, force).await
        };
        match result {
            Ok(()) => {
                info!(branch, force, "branch_deleted_locally");
                self.store.notify(ToastLevel::Success, format!("Deleted {branch}"));
                self.request_refresh();
                ActionOutcome::Done
            }
            Err(err) if !force && err.to_string().contains("not fully merged") => {
                let report = ErrorReport::new(
                    ErrorKind::Generic,
                    format!("{branch} is not fully merged; force-delete it to discard its commits"),
                );
                self.store.update(Update::LastError(Some(report.clone())));
                self.store.notify(ToastLevel::Warning, report.message.clone());
                ActionOutcome::Failed(report)
            }
            Err(err) => self.fail(&format!("Delete of {branch}"), err),
        }
    }

    /// Changes on `branch` relative to its merge base with the current
    /// branch. Read-only, so it does not take the operation lock.
    pub async fn diff_stats(&self, branch: &str) -> Result<DiffStats, ErrorReport> {
        let (current, target) = self.store.read(|snapshot| {
            let target = match snapshot.branch(branch) {
                Some(entry) if !entry.is_local => format!("{}/{}", self.git.remote(), branch),
                _ => branch.to_string(),
            };
            (snapshot.current_branch.clone(), target)
        });
        let Some(current) = current else {
            return Err(ErrorReport::new(ErrorKind::Generic, "No current branch to compare against"));
        };
        self.git
            .diff_stats(&current, &target)
            .await
            .map_err(|err| err.report())
    }

    pub async fn recent_commits(&self, branch: &str, limit: usize) -> Result<Vec<CommitSummary>, ErrorReport> {
        let target = self.store.read(|snapshot| match snapshot.branch(branch) {
            Some(entry) if !entry.is_local => format!("{}/{}", self.git.remote(), branch),
            _ => branch.to_string(),
        });
        self.git
            .recent_commits(&target, limit)
            .await
            .map_err(|err| err.report())
    }

    pub async fn restart_server(&self) -> ActionOutcome {
        let Some(server) = &self.server else {
            return self.reject("No server command is configured".to_string());
        };
        match server.restart().await {
            Ok(started) => {
                info!(pid = ?started.pid, "server_restarted");
                self.store.notify(ToastLevel::Info, "Server restarted");
                ActionOutcome::Done
            }
            Err(err) => {
                let report = ErrorReport::new(ErrorKind::Generic, err.to_string());
                warn!(error = %err, "server_restart_failed");
                self.store.notify(ToastLevel::Error, format!("Server restart failed: {err}"));
                ActionOutcome::Failed(report)
            }
        }
    }

    fn request_refresh(&self) {
        if let Some(refresh) = &self.refresh {
            refresh.notify_one();
        }
    }

    fn reject(&self, reason: String) -> ActionOutcome {
        debug!(reason = %reason, "action_rejected");
        self.store.toast(ToastLevel::Warning, reason.clone());
        ActionOutcome::Rejected(reason)
    }

    fn fail(&self, label: &str, err: CommandError) -> ActionOutcome {
        let report = err.report();
        warn!(action = label, kind = %report.kind, "action_failed");
        self.store.update(Update::LastError(Some(report.clone())));
        self.store
            .notify(ToastLevel::Error, format!("{label} failed: {}", report.hint));
        ActionOutcome::Failed(report)
    }
}
