use crate::reload::ReloadHook;
use crate::sync::Debounce;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const RELOAD_DEBOUNCE: Duration = Duration::from_millis(300);

/// Directories whose churn never means "the app changed".
const IGNORED_DIRS: &[&str] = &[".git", ".watchtower"];

pub fn is_relevant(path: &Path) -> bool {
    !path.components().any(|component| match component {
        Component::Normal(name) => IGNORED_DIRS.iter().any(|ignored| name == *ignored),
        _ => false,
    })
}

/// Recursive watch of the working tree that calls the reload hook once per
/// settled burst of changes. Dropping or closing it stops both the OS
/// watcher and the debounce task.
pub struct FileWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FileWatcher {
    pub fn spawn(root: impl Into<PathBuf>, reload: Arc<dyn ReloadHook>) -> notify::Result<Self> {
        Self::spawn_with_delay(root, reload, RELOAD_DEBOUNCE)
    }

    pub fn spawn_with_delay(
        root: impl Into<PathBuf>,
        reload: Arc<dyn ReloadHook>,
        delay: Duration,
    ) -> notify::Result<Self> {
        let root = root.into();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                for path in event.paths {
                    if is_relevant(&path) {
                        let _ = event_tx.send(path);
                    }
                }
            }
            Err(err) => warn!(error = %err, "file_watch_error"),
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!(root = %root.display(), "file_watch_started");
        let task = tokio::spawn(debounce_loop(event_rx, reload, delay));
        Ok(Self {
            root,
            _watcher: watcher,
            task,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn close(self) {
        debug!(root = %self.root.display(), "file_watch_closed");
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn debounce_loop(mut events: mpsc::UnboundedReceiver<PathBuf>, reload: Arc<dyn ReloadHook>, delay: Duration) {
    let mut debounce = Debounce::new(delay);
    let mut changed = 0usize;
    loop {
        let deadline = debounce.deadline();
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(path) => {
                        debug!(path = %path.display(), "file_changed");
                        changed += 1;
                        debounce.trigger(Instant::now());
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if debounce.take_ready(Instant::now()) {
                    debug!(changed, "file_changes_settled");
                    changed = 0;
                    reload.notify_clients("files_changed");
                }
            }
        }
    }
}
