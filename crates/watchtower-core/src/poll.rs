use crate::branch::{reconcile, Branch};
use crate::command::GitExecutor;
use crate::config::WatchConfig;
use crate::error::{ErrorKind, ErrorReport};
use crate::git::Git;
use crate::pr::PrLookup;
use crate::reload::{NoopReload, ReloadHook};
use crate::stash::{PendingOperation, StashRecovery};
use crate::store::{PollPhase, Scope, Store, ToastLevel, Update};
use crate::sync::OperationLock;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fetches slower than this are logged.
pub const SLOW_FETCH_WARN: Duration = Duration::from_secs(15);
/// Fetches slower than this double the interval.
pub const SLOW_FETCH_BACKOFF: Duration = Duration::from_secs(30);
/// Fetches faster than this restore the configured interval.
pub const FAST_FETCH: Duration = Duration::from_secs(5);
/// Backing off never pushes the interval past this.
pub const MAX_ADAPTIVE_INTERVAL: Duration = Duration::from_secs(60);
/// Consecutive network failures before the offline flag goes up.
pub const OFFLINE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalChange {
    Unchanged,
    Warned,
    BackedOff(Duration),
    Restored(Duration),
}

/// Integral controller over fetch latency. The thresholds are fixed; only
/// the baseline comes from configuration.
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    baseline: Duration,
    current: Duration,
}

impl AdaptiveInterval {
    pub fn new(baseline: Duration) -> Self {
        Self {
            baseline,
            current: baseline,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn baseline(&self) -> Duration {
        self.baseline
    }

    pub fn observe(&mut self, fetch: Duration) -> IntervalChange {
        let fetch_ms = fetch.as_millis() as u64;
        if fetch > SLOW_FETCH_BACKOFF {
            // a baseline already above the cap is left alone
            if self.current >= MAX_ADAPTIVE_INTERVAL {
                warn!(fetch_ms, interval_ms = self.current.as_millis() as u64, "fetch_very_slow");
                return IntervalChange::Warned;
            }
            self.current = (self.current * 2).min(MAX_ADAPTIVE_INTERVAL);
            warn!(fetch_ms, interval_ms = self.current.as_millis() as u64, "fetch_very_slow_backoff");
            return IntervalChange::BackedOff(self.current);
        }
        if fetch > SLOW_FETCH_WARN {
            warn!(fetch_ms, "fetch_slow");
            return IntervalChange::Warned;
        }
        if fetch < FAST_FETCH && self.current != self.baseline {
            self.current = self.baseline;
            info!(interval_ms = self.current.as_millis() as u64, "poll_interval_restored");
            return IntervalChange::Restored(self.current);
        }
        IntervalChange::Unchanged
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    consecutive: u32,
    offline: bool,
}

impl FailureTracker {
    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn offline(&self) -> bool {
        self.offline
    }

    /// Returns true if this success ended an offline stretch.
    pub fn record_success(&mut self) -> bool {
        let was_offline = self.offline;
        self.consecutive = 0;
        self.offline = false;
        was_offline
    }

    /// Returns true if this failure just flipped the offline flag.
    pub fn record_failure(&mut self, kind: ErrorKind) -> bool {
        if kind != ErrorKind::Network {
            // the streak is of network failures only; offline stays sticky
            self.consecutive = 0;
            return false;
        }
        self.consecutive += 1;
        if self.consecutive >= OFFLINE_THRESHOLD && !self.offline {
            self.offline = true;
            return true;
        }
        false
    }
}

/// What the previous cycles saw. Lives as long as the engine.
#[derive(Debug, Clone, Default)]
pub struct PollMemory {
    known: HashSet<String>,
    previous: HashMap<String, Branch>,
    order: Vec<String>,
    initialized: bool,
}

impl PollMemory {
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn knows(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    fn remember(&mut self, branches: &[Branch]) {
        self.previous.clear();
        self.order.clear();
        for branch in branches {
            self.known.insert(branch.name.clone());
            self.order.push(branch.name.clone());
            self.previous.insert(branch.name.clone(), branch.clone());
        }
        self.initialized = true;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleReport {
    pub new: Vec<String>,
    pub deleted: Vec<String>,
    pub updated: Vec<String>,
}

/// Diffs `fresh` against the previous cycle and sets the lifecycle flags.
/// The very first cycle marks nothing new. Names that vanished are kept,
/// flagged deleted. Updates `memory` for the next cycle.
pub fn apply_lifecycle(
    memory: &mut PollMemory,
    fresh: Vec<Branch>,
    current: Option<&str>,
    now: DateTime<Utc>,
) -> (Vec<Branch>, LifecycleReport) {
    let mut report = LifecycleReport::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut branches = Vec::with_capacity(fresh.len());

    for mut branch in fresh {
        let is_current = current == Some(branch.name.as_str());
        let previous = memory.previous.get(&branch.name);
        if memory.initialized && !memory.known.contains(&branch.name) {
            branch.is_new = true;
            branch.new_at = Some(now);
            report.new.push(branch.name.clone());
        } else if let Some(previous) = previous.filter(|previous| previous.is_new) {
            branch.is_new = true;
            branch.new_at = previous.new_at;
        }
        if is_current {
            branch.is_new = false;
            branch.new_at = None;
        }
        branch.just_updated = match previous {
            Some(previous) if !previous.is_deleted => previous.tip() != branch.tip() && !is_current,
            _ => false,
        };
        if branch.just_updated {
            report.updated.push(branch.name.clone());
        }
        seen.insert(branch.name.clone());
        branches.push(branch);
    }

    for name in &memory.order {
        if seen.contains(name) {
            continue;
        }
        let Some(previous) = memory.previous.get(name) else {
            continue;
        };
        let mut gone = previous.clone();
        if !gone.is_deleted {
            gone.is_deleted = true;
            gone.deleted_at = Some(now);
            report.deleted.push(gone.name.clone());
        }
        gone.is_new = false;
        gone.new_at = None;
        gone.has_updates = false;
        gone.just_updated = false;
        branches.push(gone);
    }

    memory.remember(&branches);
    (branches, report)
}

fn rank(branch: &Branch, current: Option<&str>, merged: bool) -> u8 {
    if branch.is_deleted {
        3
    } else if merged && current != Some(branch.name.as_str()) {
        2
    } else if branch.is_new {
        0
    } else {
        1
    }
}

/// New first, then ordinary, then merged (unless current), then deleted.
/// Date descending inside each band, name as the tie-break.
pub fn order_branches<F>(branches: &mut [Branch], current: Option<&str>, is_merged: F)
where
    F: Fn(&Branch) -> bool,
{
    let mut keyed: Vec<(u8, Branch)> = branches
        .iter()
        .map(|branch| (rank(branch, current, is_merged(branch)), branch.clone()))
        .collect();
    keyed.sort_by(|(rank_a, a), (rank_b, b)| {
        rank_a
            .cmp(rank_b)
            .then_with(|| b.date.cmp(&a.date))
            .then_with(|| a.name.cmp(&b.name))
    });
    for (slot, (_, branch)) in branches.iter_mut().zip(keyed) {
        *slot = branch;
    }
}

/// Index and name to select after a reorder: same name if still listed,
/// else the old index clamped into range.
pub fn preserve_selection(branches: &[Branch], name: Option<&str>, index: usize) -> (usize, Option<String>) {
    if let Some(name) = name {
        if let Some(position) = branches.iter().position(|branch| branch.name == name) {
            return (position, Some(name.to_string()));
        }
    }
    if branches.is_empty() {
        return (0, None);
    }
    let index = index.min(branches.len() - 1);
    (index, Some(branches[index].name.clone()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoPull {
    NotNeeded,
    Disabled,
    BlockedByConflict,
    AwaitingStash,
    Pulled,
    Conflict,
    Dirty,
    Failed(ErrorKind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub fetch_error: Option<ErrorKind>,
    pub fetch_elapsed: Duration,
    pub interval: IntervalChange,
    pub lifecycle: LifecycleReport,
    pub auto_pull: AutoPull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another operation held the lock.
    Skipped,
    Completed(CycleReport),
    Failed(ErrorReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub auto_pull: bool,
    pub sound: bool,
}

impl PollSettings {
    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            interval: config.poll_interval(),
            auto_pull: config.auto_pull,
            sound: config.sound,
        }
    }
}

/// Drives `Idle -> Fetching -> Reconciling -> (AutoPulling) -> Idle`. A
/// cycle never runs while a user action holds the operation lock; a busy
/// lock skips the cycle instead of queueing it.
pub struct PollEngine<E> {
    git: Git<E>,
    store: Store,
    lock: Arc<OperationLock>,
    recovery: Arc<StashRecovery>,
    reload: Arc<dyn ReloadHook>,
    prs: Option<Arc<PrLookup>>,
    settings: PollSettings,
    memory: PollMemory,
    interval: AdaptiveInterval,
    failures: FailureTracker,
    refresh: Arc<Notify>,
}

impl<E: GitExecutor> PollEngine<E> {
    pub fn new(
        git: Git<E>,
        store: Store,
        lock: Arc<OperationLock>,
        recovery: Arc<StashRecovery>,
        settings: PollSettings,
    ) -> Self {
        store.update(Update::PollInterval(settings.interval.as_millis() as u64));
        Self {
            git,
            store,
            lock,
            recovery,
            reload: Arc::new(NoopReload),
            prs: None,
            settings,
            memory: PollMemory::default(),
            interval: AdaptiveInterval::new(settings.interval),
            failures: FailureTracker::default(),
            refresh: Arc::new(Notify::new()),
        }
    }

    pub fn with_reload(mut self, reload: Arc<dyn ReloadHook>) -> Self {
        self.reload = reload;
        self
    }

    pub fn with_pr_lookup(mut self, prs: Arc<PrLookup>) -> Self {
        self.prs = Some(prs);
        self
    }

    /// Share this to wake the loop early, e.g. after a user action.
    pub fn refresh_handle(&self) -> Arc<Notify> {
        self.refresh.clone()
    }

    pub fn memory(&self) -> &PollMemory {
        &self.memory
    }

    pub fn interval(&self) -> &AdaptiveInterval {
        &self.interval
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let lock = self.lock.clone();
        let Some(_guard) = lock.try_acquire("poll") else {
            debug!(holder = ?lock.holder(), "poll_skipped_busy");
            return CycleOutcome::Skipped;
        };
        let outcome = self.cycle().await;
        self.store.update(Update::Phase(PollPhase::Idle));
        outcome
    }

    async fn cycle(&mut self) -> CycleOutcome {
        self.store.update(Update::Phase(PollPhase::Fetching));

        let head = match self.git.current_branch().await {
            Ok(head) => head,
            Err(err) => {
                let report = err.report();
                warn!(kind = %report.kind, "poll_head_failed");
                self.store.update(Update::LastError(Some(report.clone())));
                return CycleOutcome::Failed(report);
            }
        };

        let started = Instant::now();
        let fetched = self.git.fetch().await;
        let fetch_elapsed = started.elapsed();
        let fetch_error = self.record_fetch(fetched.err(), fetch_elapsed);
        let interval = self.interval.observe(fetch_elapsed);
        self.store.update(Update::PollInterval(self.interval.current().as_millis() as u64));

        self.store.update(Update::Phase(PollPhase::Reconciling));
        let listed = async {
            let local = self.git.list_local_refs().await?;
            let remote = self.git.list_remote_refs().await?;
            Ok::<_, crate::error::CommandError>((local, remote))
        }
        .await;
        let (local, remote) = match listed {
            Ok(listing) => listing,
            Err(err) => {
                let report = err.report();
                warn!(kind = %report.kind, "poll_list_refs_failed");
                self.store.update(Update::LastError(Some(report.clone())));
                return CycleOutcome::Failed(report);
            }
        };

        let fresh = reconcile(&local, &remote, self.git.remote());
        if let Some(prs) = &self.prs {
            let dropped = prs.invalidate_moved(fresh.iter().map(|branch| (branch.name.as_str(), branch.tip())));
            if dropped > 0 {
                debug!(dropped, "pr_cache_invalidated");
            }
        }
        let current = (!head.detached).then_some(head.name.as_str());
        let (mut branches, lifecycle) = apply_lifecycle(&mut self.memory, fresh, current, Utc::now());
        let prs = self.prs.clone();
        order_branches(&mut branches, current, |branch| {
            prs.as_ref()
                .is_some_and(|prs| prs.is_merged(&branch.name, branch.tip()))
        });

        let (prev_index, prev_name) = self
            .store
            .read(|snapshot| (snapshot.selected_index, snapshot.selected_name.clone()));
        let (index, name) = preserve_selection(&branches, prev_name.as_deref(), prev_index);
        if name != prev_name {
            self.store.supersede(Scope::Selection);
        }

        let mut updates = vec![
            Update::Branches(branches.clone()),
            Update::CurrentBranch {
                name: Some(head.name.clone()),
                detached: head.detached,
            },
            Update::Selection { index, name },
        ];
        if let Some(first) = lifecycle.updated.first() {
            updates.push(Update::Flash {
                branch: Some(first.clone()),
                sound: self.settings.sound,
            });
        }
        self.store.apply(updates);
        self.log_lifecycle(&lifecycle);

        let auto_pull = match current {
            Some(current) => self.auto_pull(current, &mut branches).await,
            None => AutoPull::NotNeeded,
        };

        CycleOutcome::Completed(CycleReport {
            fetch_error,
            fetch_elapsed,
            interval,
            lifecycle,
            auto_pull,
        })
    }

    fn record_fetch(&mut self, error: Option<crate::error::CommandError>, elapsed: Duration) -> Option<ErrorKind> {
        match error {
            None => {
                if self.failures.record_success() {
                    info!("remote_reachable_again");
                    self.store.notify(ToastLevel::Success, "Back online");
                }
                self.store.apply([
                    Update::Failures {
                        consecutive: 0,
                        offline: false,
                    },
                    Update::LastFetch {
                        at: Utc::now(),
                        elapsed_ms: elapsed.as_millis() as u64,
                    },
                ]);
                None
            }
            Some(err) => {
                let report = err.report();
                // tolerated: the listing below still shows what is known locally
                warn!(kind = %report.kind, elapsed_ms = elapsed.as_millis() as u64, "fetch_failed");
                let went_offline = self.failures.record_failure(report.kind);
                self.store.apply([
                    Update::Failures {
                        consecutive: self.failures.consecutive(),
                        offline: self.failures.offline(),
                    },
                    Update::LastError(Some(report.clone())),
                ]);
                if went_offline {
                    warn!(failures = self.failures.consecutive(), "remote_offline");
                    self.store.notify(
                        ToastLevel::Warning,
                        format!("Offline: {} fetches in a row failed. {}", OFFLINE_THRESHOLD, report.hint),
                    );
                }
                Some(report.kind)
            }
        }
    }

    fn log_lifecycle(&self, lifecycle: &LifecycleReport) {
        for name in &lifecycle.new {
            info!(branch = %name, "branch_new");
            self.store.log_activity(ToastLevel::Info, format!("New branch {name}"));
        }
        for name in &lifecycle.deleted {
            info!(branch = %name, "branch_deleted");
            self.store.log_activity(ToastLevel::Warning, format!("Branch {name} was deleted"));
        }
        for name in &lifecycle.updated {
            info!(branch = %name, "branch_updated");
            self.store.log_activity(ToastLevel::Info, format!("Branch {name} has new commits"));
        }
    }

    /// Pulls the current branch when it is behind. Dirtiness is not
    /// re-checked first; a dirty failure is parked for stash recovery.
    async fn auto_pull(&mut self, current: &str, branches: &mut [Branch]) -> AutoPull {
        let Some(position) = branches.iter().position(|branch| branch.name == current) else {
            return AutoPull::NotNeeded;
        };
        if !branches[position].has_updates {
            return AutoPull::NotNeeded;
        }
        if !self.settings.auto_pull {
            return AutoPull::Disabled;
        }
        let (conflict, pending) = self
            .store
            .read(|snapshot| (snapshot.merge_conflict, snapshot.pending_operation.is_some()));
        if conflict {
            debug!(branch = %current, "auto_pull_blocked_conflict");
            return AutoPull::BlockedByConflict;
        }
        if pending {
            return AutoPull::AwaitingStash;
        }

        self.store.update(Update::Phase(PollPhase::AutoPulling));
        match self.git.pull(current).await {
            Ok(()) => {
                let branch = &mut branches[position];
                if let Some(remote_commit) = branch.remote_commit.clone() {
                    branch.commit = remote_commit;
                }
                branch.has_updates = false;
                self.memory.remember(branches);
                self.store.update(Update::Branches(branches.to_vec()));
                self.store.notify(ToastLevel::Success, format!("Pulled latest {current}"));
                info!(branch = %current, "auto_pull_ok");
                self.reload.notify_clients("auto_pull");
                AutoPull::Pulled
            }
            Err(err) => {
                let report = err.report();
                warn!(branch = %current, kind = %report.kind, "auto_pull_failed");
                match report.kind {
                    ErrorKind::MergeConflict => {
                        self.store.apply([
                            Update::MergeConflict(true),
                            Update::LastError(Some(report.clone())),
                        ]);
                        self.store.notify(ToastLevel::Error, report.hint.clone());
                        AutoPull::Conflict
                    }
                    ErrorKind::DirtyWorkdir => {
                        self.recovery.begin(
                            &self.store,
                            PendingOperation::Pull {
                                branch: current.to_string(),
                            },
                            report,
                        );
                        AutoPull::Dirty
                    }
                    kind => {
                        self.store.update(Update::LastError(Some(report.clone())));
                        self.store
                            .notify(ToastLevel::Error, format!("Auto-pull failed: {}", report.message));
                        AutoPull::Failed(kind)
                    }
                }
            }
        }
    }

    /// Cycles until `shutdown` flips to true or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.current().as_millis() as u64, "poll_loop_started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let cancelled = tokio::select! {
                outcome = self.run_cycle() => {
                    if let CycleOutcome::Failed(report) = outcome {
                        debug!(kind = %report.kind, "poll_cycle_failed");
                    }
                    false
                }
                _ = shutdown.changed() => true,
            };
            if cancelled {
                // the dropped cycle released the lock; git itself runs to completion
                self.store.update(Update::Phase(PollPhase::Idle));
                info!("poll_cycle_cancelled");
                break;
            }
            let wait = self.interval.current();
            let refresh = self.refresh.clone();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = refresh.notified() => {
                    debug!("poll_refresh_requested");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("poll_loop_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::reconcile;
    use crate::command::{CommandOutput, CommandTimeout};
    use crate::error::CommandError;
    use crate::testing::{failure, network_failure, ok, ScriptedGit, MERGE_CONFLICT};
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).single().expect("date")
    }

    fn listing(entries: &[(&str, &str, u32)]) -> Vec<Branch> {
        let raw: String = entries
            .iter()
            .map(|(name, commit, day)| format!("refs/heads/{name}|2024-05-{day:02}T12:00:00Z|{commit}|subject {name}\n"))
            .collect();
        reconcile(&raw, "", "origin")
    }

    fn names(branches: &[Branch]) -> Vec<&str> {
        branches.iter().map(|branch| branch.name.as_str()).collect()
    }

    #[test]
    fn interval_doubles_to_cap_and_restores() {
        let mut interval = AdaptiveInterval::new(Duration::from_secs(5));
        let slow = Duration::from_secs(31);
        assert_eq!(interval.observe(slow), IntervalChange::BackedOff(Duration::from_secs(10)));
        for _ in 0..10 {
            interval.observe(slow);
            assert!(interval.current() <= MAX_ADAPTIVE_INTERVAL);
        }
        assert_eq!(interval.current(), MAX_ADAPTIVE_INTERVAL);
        assert_eq!(interval.observe(Duration::from_secs(20)), IntervalChange::Warned);
        assert_eq!(interval.observe(Duration::from_secs(10)), IntervalChange::Unchanged);
        assert_eq!(
            interval.observe(Duration::from_secs(1)),
            IntervalChange::Restored(Duration::from_secs(5))
        );
        assert_eq!(interval.observe(Duration::from_secs(1)), IntervalChange::Unchanged);
    }

    #[test]
    fn interval_above_cap_is_not_shrunk_by_backoff() {
        let mut interval = AdaptiveInterval::new(Duration::from_secs(120));
        assert_eq!(interval.observe(Duration::from_secs(45)), IntervalChange::Warned);
        assert_eq!(interval.current(), Duration::from_secs(120));
    }

    #[test]
    fn three_network_failures_go_offline_and_one_success_clears() {
        let mut tracker = FailureTracker::default();
        assert!(!tracker.record_failure(ErrorKind::Network));
        assert!(!tracker.record_failure(ErrorKind::Network));
        assert!(tracker.record_failure(ErrorKind::Network));
        assert!(tracker.offline());
        assert!(!tracker.record_failure(ErrorKind::Network));
        assert!(tracker.record_success());
        assert_eq!(tracker.consecutive(), 0);
        assert!(!tracker.offline());
    }

    #[test]
    fn other_failures_break_the_network_streak() {
        let mut tracker = FailureTracker::default();
        tracker.record_failure(ErrorKind::Network);
        tracker.record_failure(ErrorKind::Network);
        tracker.record_failure(ErrorKind::Auth);
        assert!(!tracker.record_failure(ErrorKind::Network));
        assert!(!tracker.offline());
    }

    #[test]
    fn first_cycle_marks_nothing_new() {
        let mut memory = PollMemory::default();
        let (branches, report) = apply_lifecycle(&mut memory, listing(&[("main", "a", 1)]), Some("main"), at(1));
        assert!(branches.iter().all(|branch| !branch.is_new));
        assert!(report.new.is_empty());
        assert!(memory.is_initialized());
    }

    #[test]
    fn new_flag_is_sticky_until_current() {
        let mut memory = PollMemory::default();
        apply_lifecycle(&mut memory, listing(&[("main", "a", 1)]), Some("main"), at(1));
        let (second, report) = apply_lifecycle(
            &mut memory,
            listing(&[("main", "a", 1), ("feature", "f", 2)]),
            Some("main"),
            at(2),
        );
        assert_eq!(report.new, vec!["feature".to_string()]);
        let feature = second.iter().find(|b| b.name == "feature").expect("feature");
        assert!(feature.is_new);
        assert_eq!(feature.new_at, Some(at(2)));

        let (third, report) = apply_lifecycle(
            &mut memory,
            listing(&[("main", "a", 1), ("feature", "f", 2)]),
            Some("main"),
            at(3),
        );
        assert!(report.new.is_empty());
        let feature = third.iter().find(|b| b.name == "feature").expect("feature");
        assert!(feature.is_new);
        assert_eq!(feature.new_at, Some(at(2)));

        let (fourth, _) = apply_lifecycle(
            &mut memory,
            listing(&[("main", "a", 1), ("feature", "f", 2)]),
            Some("feature"),
            at(4),
        );
        let feature = fourth.iter().find(|b| b.name == "feature").expect("feature");
        assert!(!feature.is_new);
    }

    #[test]
    fn vanished_branch_is_retained_as_deleted() {
        let mut memory = PollMemory::default();
        apply_lifecycle(&mut memory, listing(&[("main", "a", 1), ("old", "o", 1)]), Some("main"), at(1));
        let (branches, report) = apply_lifecycle(&mut memory, listing(&[("main", "a", 1)]), Some("main"), at(2));
        assert_eq!(report.deleted, vec!["old".to_string()]);
        let old = branches.iter().find(|b| b.name == "old").expect("retained");
        assert!(old.is_deleted);
        assert_eq!(old.deleted_at, Some(at(2)));

        let (branches, report) = apply_lifecycle(&mut memory, listing(&[("main", "a", 1)]), Some("main"), at(3));
        assert!(report.deleted.is_empty());
        let old = branches.iter().find(|b| b.name == "old").expect("still retained");
        assert_eq!(old.deleted_at, Some(at(2)));
    }

    #[test]
    fn moved_tip_is_just_updated_unless_current() {
        let mut memory = PollMemory::default();
        apply_lifecycle(&mut memory, listing(&[("main", "a", 1), ("dev", "d1", 1)]), Some("main"), at(1));
        let (branches, report) = apply_lifecycle(
            &mut memory,
            listing(&[("main", "a2", 2), ("dev", "d2", 2)]),
            Some("main"),
            at(2),
        );
        assert_eq!(report.updated, vec!["dev".to_string()]);
        assert!(!branches.iter().find(|b| b.name == "main").expect("main").just_updated);

        let (branches, report) = apply_lifecycle(
            &mut memory,
            listing(&[("main", "a2", 2), ("dev", "d2", 2)]),
            Some("main"),
            at(3),
        );
        assert!(report.updated.is_empty());
        assert!(branches.iter().all(|b| !b.just_updated));
    }

    #[test]
    fn ordering_bands() {
        let mut branches = listing(&[("fresh", "f", 1), ("merged", "m", 9), ("plain", "p", 5), ("main", "x", 2)]);
        for branch in branches.iter_mut().filter(|branch| branch.name == "fresh") {
            branch.is_new = true;
        }
        let mut gone = branches[0].clone();
        gone.name = "gone".to_string();
        gone.is_deleted = true;
        gone.date = at(20);
        branches.push(gone);
        order_branches(&mut branches, Some("main"), |branch| branch.name == "merged");
        assert_eq!(names(&branches), vec!["fresh", "plain", "main", "merged", "gone"]);
    }

    #[test]
    fn merged_current_branch_is_not_sunk() {
        let mut branches = listing(&[("merged", "m", 9), ("plain", "p", 5)]);
        order_branches(&mut branches, Some("merged"), |branch| branch.name == "merged");
        assert_eq!(names(&branches), vec!["merged", "plain"]);
    }

    #[test]
    fn selection_follows_name_then_clamps() {
        let branches = listing(&[("a", "1", 3), ("b", "2", 2), ("c", "3", 1)]);
        assert_eq!(preserve_selection(&branches, Some("c"), 0), (2, Some("c".to_string())));
        assert_eq!(preserve_selection(&branches, Some("zzz"), 7), (2, Some("c".to_string())));
        assert_eq!(preserve_selection(&[], Some("a"), 3), (0, None));
    }

    const LOCAL_REFS: &str = "refs/heads/main|2024-05-01T10:00:00Z|aaa|Initial\nrefs/heads/feature-a|2024-05-02T10:00:00Z|bbb|Feature a\n";
    const REMOTE_REFS: &str = "refs/remotes/origin/HEAD|2024-05-01T10:00:00Z|aaa|Initial\nrefs/remotes/origin/main|2024-05-01T10:00:00Z|aaa|Initial\nrefs/remotes/origin/feature-a|2024-05-02T10:00:00Z|bbb|Feature a\n";

    fn engine(exec: &Arc<ScriptedGit>, auto_pull: bool) -> (PollEngine<ScriptedGit>, Store, Arc<OperationLock>) {
        let store = Store::default();
        let lock = Arc::new(OperationLock::new());
        let engine = PollEngine::new(
            Git::new(exec.clone(), "origin"),
            store.clone(),
            lock.clone(),
            Arc::new(StashRecovery::new()),
            PollSettings {
                interval: Duration::from_secs(5),
                auto_pull,
                sound: true,
            },
        );
        (engine, store, lock)
    }

    fn script_refs(exec: &ScriptedGit, local: &str, remote: &str) {
        exec.once(&["for-each-ref", "--sort=-committerdate", &format!("--format={}", crate::branch::REF_FORMAT), "refs/heads/"], ok(local));
        exec.once(&["for-each-ref", "--sort=-committerdate", &format!("--format={}", crate::branch::REF_FORMAT), "refs/remotes/origin/"], ok(remote));
    }

    #[tokio::test]
    async fn cycle_skips_while_lock_is_held() {
        let exec = Arc::new(ScriptedGit::new());
        let (mut engine, _, lock) = engine(&exec, true);
        let _held = lock.acquire("switch").await;
        assert_eq!(engine.run_cycle().await, CycleOutcome::Skipped);
        assert!(exec.calls().is_empty());
    }

    #[tokio::test]
    async fn detached_head_is_reported() {
        let exec = Arc::new(ScriptedGit::new());
        exec.always(&["rev-parse", "--abbrev-ref"], ok("HEAD\n"));
        exec.always(&["rev-parse", "--short"], ok("abc1234\n"));
        script_refs(&exec, LOCAL_REFS, REMOTE_REFS);
        let (mut engine, store, _) = engine(&exec, true);
        assert!(matches!(engine.run_cycle().await, CycleOutcome::Completed(_)));
        let snapshot = store.snapshot();
        assert_eq!(snapshot.current_branch.as_deref(), Some("HEAD@abc1234"));
        assert!(snapshot.detached);
        assert_eq!(snapshot.phase, PollPhase::Idle);
    }

    #[tokio::test]
    async fn fetch_failure_is_tolerated_and_counted() {
        let exec = Arc::new(ScriptedGit::new());
        exec.always(&["rev-parse"], ok("main\n"));
        exec.always(&["fetch"], Err(network_failure()));
        let (mut engine, store, _) = engine(&exec, true);
        for cycle in 1..=3 {
            script_refs(&exec, LOCAL_REFS, REMOTE_REFS);
            let CycleOutcome::Completed(report) = engine.run_cycle().await else {
                panic!("cycle {cycle} should complete");
            };
            assert_eq!(report.fetch_error, Some(ErrorKind::Network));
        }
        let snapshot = store.snapshot();
        assert!(snapshot.offline);
        assert_eq!(snapshot.consecutive_failures, 3);
        assert_eq!(snapshot.branches.len(), 2);
        assert_eq!(snapshot.toast.map(|t| t.level), Some(ToastLevel::Warning));
    }

    #[tokio::test]
    async fn listing_failure_fails_the_cycle() {
        let exec = Arc::new(ScriptedGit::new());
        exec.always(&["rev-parse"], ok("main\n"));
        exec.always(&["for-each-ref"], Err(failure("for-each-ref", "fatal: not a git repository")));
        let (mut engine, store, _) = engine(&exec, true);
        let CycleOutcome::Failed(report) = engine.run_cycle().await else {
            panic!("should fail");
        };
        assert_eq!(report.kind, ErrorKind::NotFound);
        assert_eq!(store.read(|s| s.phase), PollPhase::Idle);
    }

    #[tokio::test]
    async fn auto_pull_conflict_is_sticky() {
        let exec = Arc::new(ScriptedGit::new());
        exec.always(&["rev-parse"], ok("main\n"));
        exec.always(&["pull"], Err(failure("pull origin main", MERGE_CONFLICT)));
        let behind = "refs/remotes/origin/main|2024-05-03T10:00:00Z|ccc|Upstream\n";
        let (mut engine, store, _) = engine(&exec, true);

        script_refs(&exec, LOCAL_REFS, behind);
        let CycleOutcome::Completed(report) = engine.run_cycle().await else {
            panic!("complete");
        };
        assert_eq!(report.auto_pull, AutoPull::Conflict);
        assert!(store.read(|s| s.merge_conflict));

        script_refs(&exec, LOCAL_REFS, behind);
        let CycleOutcome::Completed(report) = engine.run_cycle().await else {
            panic!("complete");
        };
        assert_eq!(report.auto_pull, AutoPull::BlockedByConflict);
        assert_eq!(exec.count(&["pull"]), 1);
    }

    #[tokio::test]
    async fn dirty_auto_pull_parks_a_pending_pull() {
        let exec = Arc::new(ScriptedGit::new());
        exec.always(&["rev-parse"], ok("main\n"));
        exec.once(
            &["pull"],
            Err(failure(
                "pull origin main",
                "error: Your local changes to the following files would be overwritten by merge:\n\ta.txt",
            )),
        );
        let (mut engine, store, _) = engine(&exec, true);
        script_refs(&exec, LOCAL_REFS, "refs/remotes/origin/main|2024-05-03T10:00:00Z|ccc|Upstream\n");
        let CycleOutcome::Completed(report) = engine.run_cycle().await else {
            panic!("complete");
        };
        assert_eq!(report.auto_pull, AutoPull::Dirty);
        assert_eq!(
            store.read(|s| s.pending_operation.clone()),
            Some(PendingOperation::Pull {
                branch: "main".to_string()
            })
        );
        assert!(!store.read(|s| s.merge_conflict));
    }

    #[tokio::test]
    async fn auto_pull_disabled_leaves_branch_behind() {
        let exec = Arc::new(ScriptedGit::new());
        exec.always(&["rev-parse"], ok("main\n"));
        let (mut engine, store, _) = engine(&exec, false);
        script_refs(&exec, LOCAL_REFS, "refs/remotes/origin/main|2024-05-03T10:00:00Z|ccc|Upstream\n");
        let CycleOutcome::Completed(report) = engine.run_cycle().await else {
            panic!("complete");
        };
        assert_eq!(report.auto_pull, AutoPull::Disabled);
        assert_eq!(exec.count(&["pull"]), 0);
        assert!(store.read(|s| s.branch("main").map(|b| b.has_updates)).unwrap_or(false));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_on_shutdown() {
        let exec = Arc::new(ScriptedGit::new());
        exec.always(&["rev-parse"], ok("main\n"));
        let (engine, _, _) = engine(&exec, true);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx));
        tokio::time::sleep(Duration::from_secs(12)).await;
        tx.send(true).expect("send");
        handle.await.expect("join");
        assert!(exec.count(&["fetch"]) >= 2);
    }

    struct StalledFetch;

    impl GitExecutor for StalledFetch {
        async fn exec(&self, args: Vec<String>, _timeout: CommandTimeout) -> Result<CommandOutput, CommandError> {
            if args.first().map(String::as_str) == Some("fetch") {
                std::future::pending::<()>().await;
            }
            Ok(CommandOutput {
                stdout: "main\n".to_string(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_an_in_flight_fetch() {
        let store = Store::default();
        let lock = Arc::new(OperationLock::new());
        let engine = PollEngine::new(
            Git::new(Arc::new(StalledFetch), "origin"),
            store.clone(),
            lock.clone(),
            Arc::new(StashRecovery::new()),
            PollSettings {
                interval: Duration::from_secs(5),
                auto_pull: true,
                sound: true,
            },
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.read(|s| s.phase), PollPhase::Fetching);
        assert!(lock.is_locked());

        tx.send(true).expect("send");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits promptly")
            .expect("join");
        assert!(!lock.is_locked());
        assert_eq!(store.read(|s| s.phase), PollPhase::Idle);
    }
}
