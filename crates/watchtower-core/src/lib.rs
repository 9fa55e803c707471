pub mod actions;
pub mod branch;
pub mod cache;
pub mod classify;
pub mod command;
pub mod config;
pub mod error;
pub mod git;
pub mod poll;
pub mod pr;
pub mod process;
pub mod reload;
pub mod stash;
pub mod store;
pub mod sync;
pub mod watch;

#[cfg(test)]
mod testing;

pub use actions::{ActionOutcome, Actions};
pub use branch::Branch;
pub use command::{CommandOutput, CommandTimeout, GitCli, GitExecutor};
pub use config::{ConfigError, ServerMode, WatchConfig};
pub use error::{CommandError, ErrorKind, ErrorReport};
pub use git::Git;
pub use poll::{CycleOutcome, PollEngine, PollSettings};
pub use process::{ProcessError, ProcessManager};
pub use reload::{LoggingReload, NoopReload, ReloadHook};
pub use stash::{PendingOperation, StashRecovery};
pub use store::{Snapshot, StateKey, Store, Update};
pub use sync::OperationLock;
pub use watch::FileWatcher;
