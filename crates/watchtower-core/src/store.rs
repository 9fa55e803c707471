use crate::branch::Branch;
use crate::error::ErrorReport;
use crate::pr::PrInfo;
use crate::stash::PendingOperation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;

pub const SERVER_LOG_CAPACITY: usize = 500;
pub const ACTIVITY_CAPACITY: usize = 50;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    #[default]
    Idle,
    Fetching,
    Reconciling,
    AutoPulling,
}

impl PollPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollPhase::Idle => "idle",
            PollPhase::Fetching => "fetching",
            PollPhase::Reconciling => "reconciling",
            PollPhase::AutoPulling => "auto_pulling",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl ToastLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToastLevel::Info => "info",
            ToastLevel::Success => "success",
            ToastLevel::Warning => "warning",
            ToastLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toast {
    pub level: ToastLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub level: ToastLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Raised when stashed work could not be restored. Only an explicit
/// acknowledgement clears it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashWarning {
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub running: bool,
    pub crashed: bool,
    pub pid: Option<u32>,
    pub command: Option<String>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub text: String,
    pub is_error: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub branches: Vec<Branch>,
    pub current_branch: Option<String>,
    pub detached: bool,
    pub selected_index: usize,
    pub selected_name: Option<String>,
    pub terminal_size: (u16, u16),
    pub poll_interval_ms: u64,
    pub consecutive_failures: u32,
    pub offline: bool,
    pub merge_conflict: bool,
    pub pending_operation: Option<PendingOperation>,
    pub stash_warning: Option<StashWarning>,
    pub last_fetch: Option<DateTime<Utc>>,
    pub last_fetch_ms: Option<u64>,
    pub phase: PollPhase,
    pub toast: Option<Toast>,
    pub flash_branch: Option<String>,
    pub sound_seq: u64,
    pub last_error: Option<ErrorReport>,
    pub server: ServerStatus,
    pub server_logs: VecDeque<LogLine>,
    pub selected_pr: Option<PrInfo>,
    pub activity: VecDeque<ActivityEntry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            branches: Vec::new(),
            current_branch: None,
            detached: false,
            selected_index: 0,
            selected_name: None,
            terminal_size: (80, 24),
            poll_interval_ms: 5_000,
            consecutive_failures: 0,
            offline: false,
            merge_conflict: false,
            pending_operation: None,
            stash_warning: None,
            last_fetch: None,
            last_fetch_ms: None,
            phase: PollPhase::Idle,
            toast: None,
            flash_branch: None,
            sound_seq: 0,
            last_error: None,
            server: ServerStatus::default(),
            server_logs: VecDeque::new(),
            selected_pr: None,
            activity: VecDeque::new(),
        }
    }
}

impl Snapshot {
    pub fn branch(&self, name: &str) -> Option<&Branch> {
        self.branches.iter().find(|branch| branch.name == name)
    }

    pub fn selected_branch(&self) -> Option<&Branch> {
        self.branches.get(self.selected_index)
    }
}

/// Addressable fields of the snapshot. `as_str` is the serialized field
/// name, which is what single-key reads return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    Branches,
    CurrentBranch,
    Detached,
    SelectedIndex,
    SelectedName,
    TerminalSize,
    PollIntervalMs,
    ConsecutiveFailures,
    Offline,
    MergeConflict,
    PendingOperation,
    StashWarning,
    LastFetch,
    LastFetchMs,
    Phase,
    Toast,
    FlashBranch,
    SoundSeq,
    LastError,
    Server,
    ServerLogs,
    SelectedPr,
    Activity,
}

impl StateKey {
    pub const ALL: [StateKey; 23] = [
        StateKey::Branches,
        StateKey::CurrentBranch,
        StateKey::Detached,
        StateKey::SelectedIndex,
        StateKey::SelectedName,
        StateKey::TerminalSize,
        StateKey::PollIntervalMs,
        StateKey::ConsecutiveFailures,
        StateKey::Offline,
        StateKey::MergeConflict,
        StateKey::PendingOperation,
        StateKey::StashWarning,
        StateKey::LastFetch,
        StateKey::LastFetchMs,
        StateKey::Phase,
        StateKey::Toast,
        StateKey::FlashBranch,
        StateKey::SoundSeq,
        StateKey::LastError,
        StateKey::Server,
        StateKey::ServerLogs,
        StateKey::SelectedPr,
        StateKey::Activity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::Branches => "branches",
            StateKey::CurrentBranch => "current_branch",
            StateKey::Detached => "detached",
            StateKey::SelectedIndex => "selected_index",
            StateKey::SelectedName => "selected_name",
            StateKey::TerminalSize => "terminal_size",
            StateKey::PollIntervalMs => "poll_interval_ms",
            StateKey::ConsecutiveFailures => "consecutive_failures",
            StateKey::Offline => "offline",
            StateKey::MergeConflict => "merge_conflict",
            StateKey::PendingOperation => "pending_operation",
            StateKey::StashWarning => "stash_warning",
            StateKey::LastFetch => "last_fetch",
            StateKey::LastFetchMs => "last_fetch_ms",
            StateKey::Phase => "phase",
            StateKey::Toast => "toast",
            StateKey::FlashBranch => "flash_branch",
            StateKey::SoundSeq => "sound_seq",
            StateKey::LastError => "last_error",
            StateKey::Server => "server",
            StateKey::ServerLogs => "server_logs",
            StateKey::SelectedPr => "selected_pr",
            StateKey::Activity => "activity",
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum Update {
    Branches(Vec<Branch>),
    CurrentBranch { name: Option<String>, detached: bool },
    Selection { index: usize, name: Option<String> },
    TerminalSize(u16, u16),
    PollInterval(u64),
    Failures { consecutive: u32, offline: bool },
    MergeConflict(bool),
    PendingOperation(Option<PendingOperation>),
    StashWarning(Option<StashWarning>),
    LastFetch { at: DateTime<Utc>, elapsed_ms: u64 },
    Phase(PollPhase),
    Toast(Option<Toast>),
    /// One-shot highlight; `sound` bumps the sound request counter.
    Flash { branch: Option<String>, sound: bool },
    LastError(Option<ErrorReport>),
    Server(ServerStatus),
    ServerLog(LogLine),
    ClearServerLogs,
    SelectedPr(Option<PrInfo>),
    Activity(ActivityEntry),
}

impl Update {
    fn keys(&self) -> &'static [StateKey] {
        match self {
            Update::Branches(_) => &[StateKey::Branches],
            Update::CurrentBranch { .. } => &[StateKey::CurrentBranch, StateKey::Detached],
            Update::Selection { .. } => &[StateKey::SelectedIndex, StateKey::SelectedName],
            Update::TerminalSize(..) => &[StateKey::TerminalSize],
            Update::PollInterval(_) => &[StateKey::PollIntervalMs],
            Update::Failures { .. } => &[StateKey::ConsecutiveFailures, StateKey::Offline],
            Update::MergeConflict(_) => &[StateKey::MergeConflict],
            Update::PendingOperation(_) => &[StateKey::PendingOperation],
            Update::StashWarning(_) => &[StateKey::StashWarning],
            Update::LastFetch { .. } => &[StateKey::LastFetch, StateKey::LastFetchMs],
            Update::Phase(_) => &[StateKey::Phase],
            Update::Toast(_) => &[StateKey::Toast],
            Update::Flash { .. } => &[StateKey::FlashBranch, StateKey::SoundSeq],
            Update::LastError(_) => &[StateKey::LastError],
            Update::Server(_) => &[StateKey::Server],
            Update::ServerLog(_) | Update::ClearServerLogs => &[StateKey::ServerLogs],
            Update::SelectedPr(_) => &[StateKey::SelectedPr],
            Update::Activity(_) => &[StateKey::Activity],
        }
    }

    fn apply_to(self, snapshot: &mut Snapshot) {
        match self {
            Update::Branches(branches) => snapshot.branches = branches,
            Update::CurrentBranch { name, detached } => {
                snapshot.current_branch = name;
                snapshot.detached = detached;
            }
            Update::Selection { index, name } => {
                snapshot.selected_index = index;
                snapshot.selected_name = name;
            }
            Update::TerminalSize(cols, rows) => snapshot.terminal_size = (cols, rows),
            Update::PollInterval(ms) => snapshot.poll_interval_ms = ms,
            Update::Failures {
                consecutive,
                offline,
            } => {
                snapshot.consecutive_failures = consecutive;
                snapshot.offline = offline;
            }
            Update::MergeConflict(flag) => snapshot.merge_conflict = flag,
            Update::PendingOperation(pending) => snapshot.pending_operation = pending,
            Update::StashWarning(warning) => snapshot.stash_warning = warning,
            Update::LastFetch { at, elapsed_ms } => {
                snapshot.last_fetch = Some(at);
                snapshot.last_fetch_ms = Some(elapsed_ms);
            }
            Update::Phase(phase) => snapshot.phase = phase,
            Update::Toast(toast) => snapshot.toast = toast,
            Update::Flash { branch, sound } => {
                snapshot.flash_branch = branch;
                if sound {
                    snapshot.sound_seq += 1;
                }
            }
            Update::LastError(report) => snapshot.last_error = report,
            Update::Server(status) => snapshot.server = status,
            Update::ServerLog(line) => {
                push_capped(&mut snapshot.server_logs, line, SERVER_LOG_CAPACITY)
            }
            Update::ClearServerLogs => snapshot.server_logs.clear(),
            Update::SelectedPr(info) => snapshot.selected_pr = info,
            Update::Activity(entry) => push_capped(&mut snapshot.activity, entry, ACTIVITY_CAPACITY),
        }
    }
}

fn push_capped<T>(buffer: &mut VecDeque<T>, item: T, capacity: usize) {
    buffer.push_back(item);
    while buffer.len() > capacity {
        buffer.pop_front();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub keys: Vec<StateKey>,
    pub version: u64,
}

/// Independent supersession domains for stamped writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Moves whenever the selected branch changes.
    Selection,
    /// Moves whenever the checked-out branch changes.
    Checkout,
}

impl Scope {
    fn slot(self) -> usize {
        match self {
            Scope::Selection => 0,
            Scope::Checkout => 1,
        }
    }
}

/// Taken before slow work and handed back with its result; the write is
/// refused if anything in the same [`Scope`] moved in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp {
    scope: Scope,
    generation: u64,
}

impl Stamp {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("stale write for {scope:?}: stamped at generation {stamped}, store is at {current}")]
    Stale {
        scope: Scope,
        stamped: u64,
        current: u64,
    },
}

struct Inner {
    snapshot: Snapshot,
    version: u64,
    generations: [u64; 2],
}

/// Cheap to clone; every clone is a handle to the same snapshot.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(Snapshot::default())
    }
}

impl Store {
    pub fn new(initial: Snapshot) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                snapshot: initial,
                version: 0,
                generations: [0; 2],
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // no writer panics while holding the lock; recover the data if one does
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn commit(&self, inner: &mut Inner, updates: Vec<Update>) -> u64 {
        if updates.is_empty() {
            return inner.version;
        }
        let mut keys: Vec<StateKey> = Vec::new();
        for update in updates {
            for key in update.keys() {
                if !keys.contains(key) {
                    keys.push(*key);
                }
            }
            update.apply_to(&mut inner.snapshot);
        }
        inner.version += 1;
        let version = inner.version;
        // no receivers is fine
        let _ = self.events.send(StoreEvent { keys, version });
        version
    }

    /// Applies a batch atomically and returns the new version.
    pub fn apply(&self, updates: impl IntoIterator<Item = Update>) -> u64 {
        let updates: Vec<Update> = updates.into_iter().collect();
        let mut inner = self.lock();
        self.commit(&mut inner, updates)
    }

    pub fn update(&self, update: Update) -> u64 {
        self.apply([update])
    }

    pub fn read<T>(&self, f: impl FnOnce(&Snapshot) -> T) -> T {
        let inner = self.lock();
        f(&inner.snapshot)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.read(Snapshot::clone)
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Single-key read in serialized form.
    pub fn get(&self, key: StateKey) -> Value {
        let value = self.read(|snapshot| serde_json::to_value(snapshot));
        match value {
            Ok(Value::Object(mut fields)) => fields.remove(key.as_str()).unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.events.subscribe(),
            filter: None,
        }
    }

    pub fn subscribe_keys(&self, keys: &[StateKey]) -> Subscription {
        Subscription {
            receiver: self.events.subscribe(),
            filter: Some(keys.iter().copied().collect()),
        }
    }

    pub fn stamp(&self, scope: Scope) -> Stamp {
        let inner = self.lock();
        Stamp {
            scope,
            generation: inner.generations[scope.slot()],
        }
    }

    /// Invalidates every outstanding stamp of `scope` and returns a fresh one.
    pub fn supersede(&self, scope: Scope) -> Stamp {
        let mut inner = self.lock();
        inner.generations[scope.slot()] += 1;
        Stamp {
            scope,
            generation: inner.generations[scope.slot()],
        }
    }

    pub fn is_current(&self, stamp: Stamp) -> bool {
        self.lock().generations[stamp.scope.slot()] == stamp.generation
    }

    /// Applies `updates` only if nothing in the stamp's scope moved since
    /// the stamp was taken. Check and write happen under one lock.
    pub fn apply_stamped(&self, stamp: Stamp, updates: impl IntoIterator<Item = Update>) -> Result<u64, StoreError> {
        let updates: Vec<Update> = updates.into_iter().collect();
        let mut inner = self.lock();
        let current = inner.generations[stamp.scope.slot()];
        if current != stamp.generation {
            return Err(StoreError::Stale {
                scope: stamp.scope,
                stamped: stamp.generation,
                current,
            });
        }
        Ok(self.commit(&mut inner, updates))
    }

    /// Moves the selection to `index`, clamped to the list.
    pub fn select_index(&self, index: usize) -> usize {
        let mut inner = self.lock();
        let len = inner.snapshot.branches.len();
        let index = if len == 0 { 0 } else { index.min(len - 1) };
        let name = inner.snapshot.branches.get(index).map(|branch| branch.name.clone());
        if inner.snapshot.selected_index != index || inner.snapshot.selected_name != name {
            inner.generations[Scope::Selection.slot()] += 1;
            self.commit(&mut inner, vec![Update::Selection { index, name }, Update::SelectedPr(None)]);
        }
        index
    }

    pub fn select_name(&self, name: &str) -> bool {
        let position = self.read(|snapshot| snapshot.branches.iter().position(|branch| branch.name == name));
        match position {
            Some(index) => {
                self.select_index(index);
                true
            }
            None => false,
        }
    }

    pub fn move_selection(&self, delta: isize) -> usize {
        let current = self.read(|snapshot| snapshot.selected_index);
        self.select_index(current.saturating_add_signed(delta))
    }

    pub fn toast(&self, level: ToastLevel, message: impl Into<String>) -> u64 {
        self.update(Update::Toast(Some(Toast {
            level,
            message: message.into(),
            at: Utc::now(),
        })))
    }

    pub fn log_activity(&self, level: ToastLevel, message: impl Into<String>) -> u64 {
        self.update(Update::Activity(ActivityEntry {
            level,
            message: message.into(),
            at: Utc::now(),
        }))
    }

    /// Toast plus activity entry in one event.
    pub fn notify(&self, level: ToastLevel, message: impl Into<String>) -> u64 {
        let message = message.into();
        let at = Utc::now();
        self.apply([
            Update::Toast(Some(Toast {
                level,
                message: message.clone(),
                at,
            })),
            Update::Activity(ActivityEntry { level, message, at }),
        ])
    }
}

/// A filtered view of the change stream.
pub struct Subscription {
    receiver: broadcast::Receiver<StoreEvent>,
    filter: Option<HashSet<StateKey>>,
}

impl Subscription {
    /// Next event touching a watched key. After falling behind, a single
    /// event naming every watched key is returned so the consumer re-reads.
    /// `None` once the store is gone.
    pub async fn next(&mut self) -> Option<StoreEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if let Some(event) = self.filtered(event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let keys = match &self.filter {
                        Some(filter) => StateKey::ALL
                            .iter()
                            .copied()
                            .filter(|key| filter.contains(key))
                            .collect(),
                        None => StateKey::ALL.to_vec(),
                    };
                    return Some(StoreEvent { keys, version: 0 });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn filtered(&self, event: StoreEvent) -> Option<StoreEvent> {
        let Some(filter) = &self.filter else {
            return Some(event);
        };
        let keys: Vec<StateKey> = event
            .keys
            .into_iter()
            .filter(|key| filter.contains(key))
            .collect();
        if keys.is_empty() {
            None
        } else {
            Some(StoreEvent {
                keys,
                version: event.version,
            })
        }
    }
}
