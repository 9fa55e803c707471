use crate::error::{CommandError, ErrorKind, ErrorReport};
use crate::git::{Git, StashPush};
use crate::command::GitExecutor;
use crate::store::{StashWarning, Store, ToastLevel, Update};
use crate::sync::{retry_with_backoff, Backoff};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingOperation {
    Switch { branch: String },
    Pull { branch: String },
}

impl PendingOperation {
    pub fn branch(&self) -> &str {
        match self {
            PendingOperation::Switch { branch } | PendingOperation::Pull { branch } => branch,
        }
    }
}

impl fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingOperation::Switch { branch } => write!(f, "switch to {branch}"),
            PendingOperation::Pull { branch } => write!(f, "pull of {branch}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecoveryPhase {
    #[default]
    Idle,
    AwaitingConfirm,
    Stashing,
    Retrying,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Operation went through; the changes stay in the stash.
    Completed(PendingOperation),
    /// Stash reported nothing to save. The operation is not retried.
    NothingToStash,
    StashFailed(ErrorReport),
    /// Retry failed and the stash was popped back.
    RetryFailedRestored(ErrorReport),
    /// Retry failed and the pop failed too; the stash warning is up.
    RetryFailedStashKept(ErrorReport),
    NotPending,
}

/// `Idle -> AwaitingConfirm -> Stashing -> Retrying -> Idle`. A failed retry
/// pops the stash back; a failed pop raises a warning that only an explicit
/// acknowledgement clears.
#[derive(Default)]
pub struct StashRecovery {
    phase: Mutex<RecoveryPhase>,
    pop_policy: Backoff,
}

fn pop_is_retryable(err: &CommandError) -> bool {
    matches!(err.kind(), ErrorKind::Generic | ErrorKind::Timeout)
}

impl StashRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pop_policy(pop_policy: Backoff) -> Self {
        Self {
            phase: Mutex::new(RecoveryPhase::Idle),
            pop_policy,
        }
    }

    pub fn phase(&self) -> RecoveryPhase {
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, phase: RecoveryPhase) {
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = phase;
    }

    /// Parks `operation` and asks for confirmation. Replaces any earlier
    /// pending operation.
    pub fn begin(&self, store: &Store, operation: PendingOperation, report: ErrorReport) {
        info!(operation = %operation, "stash_recovery_offered");
        let prompt = format!(
            "Local changes block the {operation}. Press y to stash and retry, n to cancel."
        );
        store.apply([
            Update::PendingOperation(Some(operation)),
            Update::LastError(Some(report)),
        ]);
        store.notify(ToastLevel::Warning, prompt);
        self.set_phase(RecoveryPhase::AwaitingConfirm);
    }

    pub fn cancel(&self, store: &Store) -> bool {
        let pending = store.read(|snapshot| snapshot.pending_operation.clone());
        self.set_phase(RecoveryPhase::Idle);
        let Some(operation) = pending else {
            return false;
        };
        store.update(Update::PendingOperation(None));
        store.log_activity(ToastLevel::Info, format!("Cancelled the {operation}"));
        true
    }

    /// Drops a pending operation that a new, unrelated operation supersedes.
    pub fn clear_if_unrelated(&self, store: &Store, next: &PendingOperation) {
        let pending = store.read(|snapshot| snapshot.pending_operation.clone());
        if let Some(operation) = pending {
            if &operation != next {
                store.update(Update::PendingOperation(None));
                self.set_phase(RecoveryPhase::Idle);
            }
        }
    }

    /// Clears `operation` if it is the one parked; it went through without
    /// a stash.
    pub fn resolve(&self, store: &Store, operation: &PendingOperation) -> bool {
        let pending = store.read(|snapshot| snapshot.pending_operation.clone());
        if pending.as_ref() != Some(operation) {
            return false;
        }
        store.update(Update::PendingOperation(None));
        self.set_phase(RecoveryPhase::Idle);
        true
    }

    /// Stash, retry, restore. `retry` re-runs the parked operation without
    /// taking the operation lock (the caller already holds it).
    pub async fn confirm<E, F, Fut>(&self, git: &Git<E>, store: &Store, retry: F) -> RecoveryOutcome
    where
        E: GitExecutor,
        F: FnOnce(PendingOperation) -> Fut,
        Fut: Future<Output = Result<(), CommandError>>,
    {
        let Some(operation) = store.read(|snapshot| snapshot.pending_operation.clone()) else {
            self.set_phase(RecoveryPhase::Idle);
            return RecoveryOutcome::NotPending;
        };

        self.set_phase(RecoveryPhase::Stashing);
        let message = format!("git-watchtower: auto-stash before {operation}");
        match git.stash_push(&message).await {
            Ok(StashPush::Stashed) => {}
            Ok(StashPush::NothingToStash) => {
                warn!(operation = %operation, "stash_nothing_to_save");
                store.notify(
                    ToastLevel::Error,
                    format!("Nothing to stash; the {operation} was blocked by something else"),
                );
                self.set_phase(RecoveryPhase::AwaitingConfirm);
                return RecoveryOutcome::NothingToStash;
            }
            Err(err) => {
                let report = err.report();
                warn!(operation = %operation, kind = %report.kind, "stash_push_failed");
                store.update(Update::LastError(Some(report.clone())));
                store.notify(ToastLevel::Error, format!("Stash failed: {}", report.message));
                self.set_phase(RecoveryPhase::AwaitingConfirm);
                return RecoveryOutcome::StashFailed(report);
            }
        }

        self.set_phase(RecoveryPhase::Retrying);
        let retried = retry(operation.clone()).await;
        let outcome = match retried {
            Ok(()) => {
                info!(operation = %operation, "stash_recovery_completed");
                store.notify(
                    ToastLevel::Success,
                    format!("Stashed local changes and completed the {operation}. Run `git stash pop` to restore them."),
                );
                RecoveryOutcome::Completed(operation)
            }
            Err(retry_err) => {
                let report = retry_err.report();
                let popped = retry_with_backoff(
                    self.pop_policy,
                    |_| git.stash_pop(),
                    pop_is_retryable,
                )
                .await;
                match popped {
                    Ok(()) => {
                        warn!(operation = %operation, kind = %report.kind, "stash_retry_failed_restored");
                        store.update(Update::LastError(Some(report.clone())));
                        store.notify(
                            ToastLevel::Warning,
                            format!("The {operation} failed again; your changes were restored from the stash."),
                        );
                        RecoveryOutcome::RetryFailedRestored(report)
                    }
                    Err(pop_err) => {
                        error!(
                            operation = %operation,
                            retry_kind = %report.kind,
                            pop_kind = %pop_err.kind(),
                            "stash_pop_failed"
                        );
                        let message = format!(
                            "Your changes are still stashed: the {operation} failed and `git stash pop` failed too ({}). Restore them by hand with `git stash pop`.",
                            pop_err
                        );
                        store.apply([
                            Update::LastError(Some(report.clone())),
                            Update::StashWarning(Some(StashWarning {
                                message: message.clone(),
                                raised_at: Utc::now(),
                            })),
                        ]);
                        store.notify(ToastLevel::Error, message);
                        RecoveryOutcome::RetryFailedStashKept(report)
                    }
                }
            }
        };
        store.update(Update::PendingOperation(None));
        self.set_phase(RecoveryPhase::Idle);
        outcome
    }

    pub fn acknowledge_warning(&self, store: &Store) -> bool {
        let raised = store.read(|snapshot| snapshot.stash_warning.is_some());
        if raised {
            store.update(Update::StashWarning(None));
            store.log_activity(ToastLevel::Info, "Stash warning acknowledged");
        }
        raised
    }
}
