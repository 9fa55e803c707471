use crate::store::{LogLine, ServerStatus, Store, ToastLevel, Update};
use chrono::Utc;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, error, info, warn};

pub const STOP_GRACE: Duration = Duration::from_secs(3);
pub const RESTART_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("server command is empty")]
    EmptyCommand,
    #[error("cannot parse server command: {0}")]
    Parse(String),
    #[error("cannot start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("no server command has been started yet")]
    NoPreviousCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Started {
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// Exited within the grace period; no forced kill was sent.
    Graceful,
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRecord {
    pub code: Option<i32>,
    pub intentional: bool,
    pub crashed: bool,
}

/// Splits a command line into an argv. Single and double quotes group
/// words; nothing else is interpreted.
pub fn parse_command_line(command_line: &str) -> Result<Vec<String>, ProcessError> {
    let argv = shell_words::split(command_line).map_err(|err| ProcessError::Parse(err.to_string()))?;
    if argv.is_empty() {
        return Err(ProcessError::EmptyCommand);
    }
    Ok(argv)
}

fn platform_argv(command_line: &str) -> Result<Vec<String>, ProcessError> {
    if cfg!(windows) {
        if command_line.trim().is_empty() {
            return Err(ProcessError::EmptyCommand);
        }
        return Ok(vec!["cmd".to_string(), "/C".to_string(), command_line.to_string()]);
    }
    parse_command_line(command_line)
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) -> io::Result<()> {
    // the child leads its own group, so -pid reaches its descendants too
    let status = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if status == 0 {
        return Ok(());
    }
    let status = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if status == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

struct Running {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitRecord>>,
    kill: Option<oneshot::Sender<()>>,
    stopping: Arc<AtomicBool>,
}

#[derive(Default)]
struct State {
    running: Option<Running>,
    last_command: Option<String>,
}

/// At most one child per manager. The command line is split into an argv and
/// run without a shell, except `cmd /C` on Windows. Stopping sends SIGTERM
/// to the process group, then SIGKILL after the grace period.
pub struct ProcessManager {
    cwd: PathBuf,
    store: Store,
    grace: Duration,
    settle: Duration,
    state: Mutex<State>,
}

async fn forward_lines<R>(reader: R, is_error: bool, store: Store)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        store.update(Update::ServerLog(LogLine {
            text: line,
            is_error,
            at: Utc::now(),
        }));
    }
}

async fn wait_for_exit(exit: &mut watch::Receiver<Option<ExitRecord>>) -> Option<ExitRecord> {
    if let Ok(record) = exit.wait_for(Option::is_some).await {
        return *record;
    }
    // the watcher task is gone; whatever it last published is final
    *exit.borrow()
}

impl ProcessManager {
    pub fn new(cwd: impl Into<PathBuf>, store: Store) -> Self {
        Self {
            cwd: cwd.into(),
            store,
            grace: STOP_GRACE,
            settle: RESTART_SETTLE,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_timings(mut self, grace: Duration, settle: Duration) -> Self {
        self.grace = grace;
        self.settle = settle;
        self
    }

    pub async fn is_running(&self) -> bool {
        let state = self.state.lock().await;
        state
            .running
            .as_ref()
            .is_some_and(|running| running.exit.borrow().is_none())
    }

    pub async fn pid(&self) -> Option<u32> {
        let state = self.state.lock().await;
        state.running.as_ref().and_then(|running| running.pid)
    }

    pub async fn last_command(&self) -> Option<String> {
        self.state.lock().await.last_command.clone()
    }

    /// Starts `command_line`, stopping any previous child first.
    pub async fn start(&self, command_line: &str) -> Result<Started, ProcessError> {
        let mut state = self.state.lock().await;
        self.start_locked(&mut state, command_line).await
    }

    pub async fn stop(&self) -> StopOutcome {
        let mut state = self.state.lock().await;
        self.stop_locked(&mut state).await
    }

    /// Stop, settle, start again with the last command line.
    pub async fn restart(&self) -> Result<Started, ProcessError> {
        let mut state = self.state.lock().await;
        let command = state.last_command.clone().ok_or(ProcessError::NoPreviousCommand)?;
        self.stop_locked(&mut state).await;
        tokio::time::sleep(self.settle).await;
        info!(command = %command, "server_restart");
        self.start_locked(&mut state, &command).await
    }

    /// Resolves when the current child exits. `None` if nothing runs.
    pub async fn wait(&self) -> Option<ExitRecord> {
        let mut exit = {
            let state = self.state.lock().await;
            state.running.as_ref()?.exit.clone()
        };
        wait_for_exit(&mut exit).await
    }

    async fn start_locked(&self, state: &mut State, command_line: &str) -> Result<Started, ProcessError> {
        if state.running.is_some() {
            self.stop_locked(state).await;
        }
        state.last_command = Some(command_line.to_string());

        let argv = match platform_argv(command_line) {
            Ok(argv) => argv,
            Err(err) => {
                self.report_start_failure(command_line, &err);
                return Err(err);
            }
        };
        self.store.update(Update::ClearServerLogs);
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&self.cwd)
            .env("FORCE_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = ProcessError::Spawn {
                    command: command_line.to_string(),
                    source,
                };
                self.report_start_failure(command_line, &err);
                return Err(err);
            }
        };
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, false, self.store.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, true, self.store.clone()));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let stopping = Arc::new(AtomicBool::new(false));
        let watcher_stopping = stopping.clone();
        let store = self.store.clone();
        let watched_command = command_line.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = status.ok().and_then(|status| status.code());
            let intentional = watcher_stopping.load(Ordering::SeqCst);
            let crashed = !intentional && code.is_some_and(|code| code != 0);
            if crashed {
                warn!(?code, command = %watched_command, "server_crashed");
                store.notify(
                    ToastLevel::Error,
                    format!("Server exited with code {}", code.unwrap_or_default()),
                );
            } else {
                info!(?code, intentional, "server_exited");
            }
            store.update(Update::Server(ServerStatus {
                running: false,
                crashed,
                pid: None,
                command: Some(watched_command),
                exit_code: code,
            }));
            let _ = exit_tx.send(Some(ExitRecord {
                code,
                intentional,
                crashed,
            }));
        });

        state.running = Some(Running {
            pid,
            exit: exit_rx,
            kill: Some(kill_tx),
            stopping,
        });
        self.store.update(Update::Server(ServerStatus {
            running: true,
            crashed: false,
            pid,
            command: Some(command_line.to_string()),
            exit_code: None,
        }));
        info!(?pid, command = %command_line, "server_started");
        Ok(Started { pid })
    }

    fn report_start_failure(&self, command_line: &str, err: &ProcessError) {
        error!(command = %command_line, error = %err, "server_start_failed");
        self.store.update(Update::Server(ServerStatus {
            running: false,
            crashed: false,
            pid: None,
            command: Some(command_line.to_string()),
            exit_code: None,
        }));
        self.store
            .notify(ToastLevel::Error, format!("Server failed to start: {err}"));
    }

    async fn stop_locked(&self, state: &mut State) -> StopOutcome {
        let Some(mut running) = state.running.take() else {
            return StopOutcome::NotRunning;
        };
        running.stopping.store(true, Ordering::SeqCst);
        if running.exit.borrow().is_some() {
            return StopOutcome::NotRunning;
        }

        #[cfg(unix)]
        if let Some(pid) = running.pid {
            if let Err(err) = signal_group(pid, libc::SIGTERM) {
                debug!(pid, error = %err, "server_sigterm_failed");
            }
        }
        #[cfg(not(unix))]
        if let Some(kill) = running.kill.take() {
            let _ = kill.send(());
        }

        // dropping the timeout future cancels the forced kill
        match tokio::time::timeout(self.grace, wait_for_exit(&mut running.exit)).await {
            Ok(_) => {
                info!(pid = ?running.pid, "server_stopped");
                if cfg!(unix) {
                    StopOutcome::Graceful
                } else {
                    StopOutcome::Forced
                }
            }
            Err(_) => {
                warn!(pid = ?running.pid, grace_ms = self.grace.as_millis() as u64, "server_force_kill");
                #[cfg(unix)]
                if let Some(pid) = running.pid {
                    let _ = signal_group(pid, libc::SIGKILL);
                }
                if let Some(kill) = running.kill.take() {
                    let _ = kill.send(());
                }
                wait_for_exit(&mut running.exit).await;
                StopOutcome::Forced
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_respects_quotes() {
        let argv = parse_command_line(r#"npm run dev -- --host "0.0.0.0" --title 'my app'"#).expect("parse");
        assert_eq!(
            argv,
            vec!["npm", "run", "dev", "--", "--host", "0.0.0.0", "--title", "my app"]
        );
        let argv = parse_command_line("echo $(whoami); rm -rf /").expect("parse");
        assert_eq!(argv[1], "$(whoami);");
        assert!(matches!(parse_command_line("   "), Err(ProcessError::EmptyCommand)));
        assert!(matches!(parse_command_line("echo 'open"), Err(ProcessError::Parse(_))));
    }

    #[tokio::test]
    async fn stop_without_child_is_noop() {
        let manager = ProcessManager::new(".", Store::default());
        assert_eq!(manager.stop().await, StopOutcome::NotRunning);
        assert!(matches!(manager.restart().await, Err(ProcessError::NoPreviousCommand)));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_not_raised() {
        let store = Store::default();
        let manager = ProcessManager::new(".", store.clone());
        let err = manager.start("watchtower-no-such-server --port 1").await.expect_err("spawn");
        assert!(matches!(err, ProcessError::Spawn { .. }));
        let snapshot = store.snapshot();
        assert!(!snapshot.server.running);
        assert_eq!(snapshot.toast.map(|t| t.level), Some(ToastLevel::Error));
    }

    #[cfg(unix)]
    fn alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn graceful_stop_skips_forced_kill() {
        let store = Store::default();
        let manager = ProcessManager::new(".", store.clone());
        let started = manager.start("sleep 30").await.expect("start");
        assert!(manager.is_running().await);
        assert!(store.read(|s| s.server.running));
        let begun = std::time::Instant::now();
        assert_eq!(manager.stop().await, StopOutcome::Graceful);
        assert!(begun.elapsed() < STOP_GRACE);
        assert!(!alive(started.pid.expect("pid")));
        let server = store.read(|s| s.server.clone());
        assert!(!server.running);
        assert!(!server.crashed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stubborn_child_is_force_killed() {
        let manager = ProcessManager::new(".", Store::default())
            .with_timings(Duration::from_millis(300), Duration::from_millis(10));
        let started = manager
            .start(r#"sh -c 'trap "" TERM; while true; do sleep 0.1; done'"#)
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.stop().await, StopOutcome::Forced);
        assert!(!alive(started.pid.expect("pid")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_start_stops_the_first() {
        let manager = ProcessManager::new(".", Store::default());
        let first = manager.start("sleep 30").await.expect("first");
        let second = manager.start("sleep 30").await.expect("second");
        assert_ne!(first.pid, second.pid);
        assert!(!alive(first.pid.expect("pid")));
        assert!(alive(second.pid.expect("pid")));
        assert_eq!(manager.stop().await, StopOutcome::Graceful);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_marks_crashed() {
        let store = Store::default();
        let manager = ProcessManager::new(".", store.clone());
        manager.start("sh -c 'exit 3'").await.expect("start");
        let record = manager.wait().await.expect("exit");
        assert_eq!(record.code, Some(3));
        assert!(record.crashed);
        assert!(!record.intentional);
        let server = store.read(|s| s.server.clone());
        assert!(server.crashed);
        assert_eq!(server.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_lines_are_captured_and_tagged() {
        let store = Store::default();
        let manager = ProcessManager::new(".", store.clone());
        manager
            .start("sh -c 'echo ready; echo oops >&2'")
            .await
            .expect("start");
        manager.wait().await.expect("exit");
        let mut logs = Vec::new();
        for _ in 0..50 {
            logs = store.read(|s| s.server_logs.iter().cloned().collect::<Vec<_>>());
            if logs.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(logs.len(), 2);
        let ready = logs.iter().find(|line| line.text == "ready").expect("stdout line");
        assert!(!ready.is_error);
        let oops = logs.iter().find(|line| line.text == "oops").expect("stderr line");
        assert!(oops.is_error);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restart_reuses_last_command() {
        let manager = ProcessManager::new(".", Store::default())
            .with_timings(Duration::from_secs(3), Duration::from_millis(10));
        let first = manager.start("sleep 30").await.expect("start");
        let second = manager.restart().await.expect("restart");
        assert_ne!(first.pid, second.pid);
        assert_eq!(manager.last_command().await.as_deref(), Some("sleep 30"));
        manager.stop().await;
    }
}
