use chrono::Local;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};
use watchtower_core::pr::PrLookup;
use watchtower_core::store::{Snapshot, StateKey};
use watchtower_core::sync::Throttle;
use watchtower_core::{ActionOutcome, Actions, GitCli, Store};

const PRINT_THROTTLE: Duration = Duration::from_millis(250);
const LOG_LIMIT: usize = 10;

const WATCHED: [StateKey; 12] = [
    StateKey::Branches,
    StateKey::CurrentBranch,
    StateKey::SelectedIndex,
    StateKey::Offline,
    StateKey::MergeConflict,
    StateKey::PendingOperation,
    StateKey::StashWarning,
    StateKey::Toast,
    StateKey::FlashBranch,
    StateKey::SoundSeq,
    StateKey::Server,
    StateKey::SelectedPr,
];

const HELP: &str = "commands: s <branch> switch | p pull | y/n confirm/cancel stash | r restart server | d <branch> diff | g <branch> log | x/X <branch> delete/force | j/k move | c conflict resolved | ack stash warning | l list | q quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Switch(String),
    Pull,
    ConfirmStash,
    CancelStash,
    RestartServer,
    Diff(String),
    Log(String),
    Delete { branch: String, force: bool },
    Down,
    Up,
    ResolveConflict,
    Acknowledge,
    List,
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".to_string());
    };
    let argument = words.next().map(str::to_string);
    if words.next().is_some() {
        return Err(format!("too many arguments for {verb}"));
    }
    let needs_branch = |argument: Option<String>| argument.ok_or_else(|| format!("{verb} needs a branch name"));
    let command = match verb {
        "s" => Command::Switch(needs_branch(argument)?),
        "d" => Command::Diff(needs_branch(argument)?),
        "g" => Command::Log(needs_branch(argument)?),
        "x" => Command::Delete {
            branch: needs_branch(argument)?,
            force: false,
        },
        "X" => Command::Delete {
            branch: needs_branch(argument)?,
            force: true,
        },
        _ if argument.is_some() => return Err(format!("{verb} takes no argument")),
        "p" => Command::Pull,
        "y" => Command::ConfirmStash,
        "n" => Command::CancelStash,
        "r" => Command::RestartServer,
        "j" => Command::Down,
        "k" => Command::Up,
        "c" => Command::ResolveConflict,
        "ack" => Command::Acknowledge,
        "l" => Command::List,
        "h" | "?" => Command::Help,
        "q" => Command::Quit,
        other => return Err(format!("unknown command {other:?}")),
    };
    Ok(command)
}

pub struct Console {
    actions: Actions<GitCli>,
    prs: Option<Arc<PrLookup>>,
}

impl Console {
    pub fn new(actions: Actions<GitCli>, prs: Option<Arc<PrLookup>>) -> Self {
        Self { actions, prs }
    }

    /// Returns on `q` or shutdown. A closed stdin waits for shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        println!("{HELP}");
        let console = &self;
        drive(BufReader::new(tokio::io::stdin()), shutdown, |command| console.dispatch(command)).await;
    }

    async fn dispatch(&self, command: Command) {
        let store = self.actions.store();
        let outcome = match command {
            Command::Switch(branch) => self.actions.switch(&branch).await,
            Command::Pull => self.actions.pull().await,
            Command::ConfirmStash => self.actions.confirm_stash().await,
            Command::CancelStash => {
                if !self.actions.cancel_stash() {
                    println!("nothing is waiting for a stash");
                }
                return;
            }
            Command::RestartServer => self.actions.restart_server().await,
            Command::Diff(branch) => {
                match self.actions.diff_stats(&branch).await {
                    Ok(stats) => println!(
                        "{branch}: {} files changed, +{} -{}",
                        stats.files_changed, stats.insertions, stats.deletions
                    ),
                    Err(report) => println!("diff failed: {} ({})", report.message, report.hint),
                }
                return;
            }
            Command::Log(branch) => {
                match self.actions.recent_commits(&branch, LOG_LIMIT).await {
                    Ok(commits) => {
                        for entry in commits {
                            let when = entry
                                .date
                                .map(|date| date.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
                                .unwrap_or_default();
                            println!("{} {} {when}", entry.commit, entry.subject);
                        }
                    }
                    Err(report) => println!("log failed: {} ({})", report.message, report.hint),
                }
                return;
            }
            Command::Delete { branch, force } => self.actions.delete_branch(&branch, force).await,
            Command::Down => {
                store.move_selection(1);
                self.refresh_pr(store.clone());
                return;
            }
            Command::Up => {
                store.move_selection(-1);
                self.refresh_pr(store.clone());
                return;
            }
            Command::ResolveConflict => {
                if !self.actions.resolve_conflict() {
                    println!("no merge conflict is flagged");
                }
                return;
            }
            Command::Acknowledge => {
                if !self.actions.acknowledge_stash_warning() {
                    println!("no stash warning to acknowledge");
                }
                return;
            }
            Command::List => {
                for line in render(&store.snapshot(), &[StateKey::Branches]) {
                    println!("{line}");
                }
                return;
            }
            Command::Help => {
                println!("{HELP}");
                return;
            }
            Command::Quit => return,
        };
        if let ActionOutcome::Failed(report) = &outcome {
            debug!(kind = %report.kind, "console_action_failed");
        }
    }

    fn refresh_pr(&self, store: Store) {
        let Some(prs) = self.prs.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = prs.refresh_selected(&store).await {
                debug!(error = %err, "pr_refresh_skipped");
            }
        });
    }
}

/// Feeds parsed commands to `handle`. Shutdown stops the next read; a
/// command already running is awaited to completion.
async fn drive<R, F, Fut>(reader: R, mut shutdown: watch::Receiver<bool>, mut handle: F)
where
    R: AsyncBufRead + Unpin,
    F: FnMut(Command) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut lines = reader.lines();
    loop {
        if *shutdown.borrow() {
            return;
        }
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.changed() => return,
        };
        let Ok(Some(line)) = line else {
            debug!("console_stdin_closed");
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            return;
        };
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse_command(&line) {
            Ok(command) => command,
            Err(reason) => {
                println!("? {reason}");
                continue;
            }
        };
        if command == Command::Quit {
            info!("console_quit");
            return;
        }
        handle(command).await;
    }
}

/// Prints the lines for each settled batch of changes, at most once per
/// throttle window.
pub async fn print_changes(store: Store, mut shutdown: watch::Receiver<bool>) {
    let mut subscription = store.subscribe_keys(&WATCHED);
    let mut throttle = Throttle::new(PRINT_THROTTLE);
    let mut pending: Vec<StateKey> = Vec::new();
    loop {
        let wait = throttle.remaining(Instant::now());
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else {
                    break;
                };
                for key in event.keys {
                    if !pending.contains(&key) {
                        pending.push(key);
                    }
                }
            }
            _ = tokio::time::sleep(wait), if !pending.is_empty() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        if pending.is_empty() || !throttle.allow(Instant::now()) {
            continue;
        }
        let snapshot = store.snapshot();
        if pending.contains(&StateKey::SoundSeq) && snapshot.sound_seq > 0 {
            print!("\x07");
        }
        for line in render(&snapshot, &pending) {
            println!("{line}");
        }
        pending.clear();
    }
}

pub fn render(snapshot: &Snapshot, keys: &[StateKey]) -> Vec<String> {
    let mut lines = Vec::new();
    let touched = |key: StateKey| keys.contains(&key);

    if touched(StateKey::Toast) {
        if let Some(toast) = &snapshot.toast {
            lines.push(format!("[{}] {}", toast.level.as_str(), toast.message));
        }
    }
    if touched(StateKey::StashWarning) {
        if let Some(warning) = &snapshot.stash_warning {
            lines.push(format!("!! {} (type `ack` once handled)", warning.message));
        }
    }
    if touched(StateKey::PendingOperation) {
        if let Some(operation) = &snapshot.pending_operation {
            lines.push(format!("waiting: {operation} (y = stash and retry, n = cancel)"));
        }
    }
    if touched(StateKey::Offline) || touched(StateKey::MergeConflict) {
        let mut flags = Vec::new();
        if snapshot.offline {
            flags.push("offline");
        }
        if snapshot.merge_conflict {
            flags.push("merge conflict (auto-pull paused, `c` when resolved)");
        }
        if !flags.is_empty() {
            lines.push(format!("status: {}", flags.join(", ")));
        }
    }
    if touched(StateKey::FlashBranch) {
        if let Some(branch) = &snapshot.flash_branch {
            lines.push(format!("* {branch} has new commits"));
        }
    }
    if touched(StateKey::Branches) || touched(StateKey::CurrentBranch) || touched(StateKey::SelectedIndex) {
        lines.extend(render_branches(snapshot));
    }
    if touched(StateKey::Server) {
        let server = &snapshot.server;
        let status = match (server.running, server.crashed, server.exit_code) {
            (true, _, _) => format!("running (pid {})", server.pid.map_or("?".to_string(), |pid| pid.to_string())),
            (false, true, code) => format!("crashed (exit {})", code.map_or("?".to_string(), |code| code.to_string())),
            (false, false, _) => "stopped".to_string(),
        };
        if server.command.is_some() {
            lines.push(format!("server: {status}"));
        }
    }
    if touched(StateKey::SelectedPr) {
        if let Some(pr) = &snapshot.selected_pr {
            lines.push(format!("PR #{} [{}] {}", pr.number, pr.state.as_str(), pr.title));
        }
    }
    lines
}

fn render_branches(snapshot: &Snapshot) -> Vec<String> {
    let mut lines = Vec::with_capacity(snapshot.branches.len() + 1);
    let fetched = snapshot
        .last_fetch
        .map(|at| at.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    lines.push(format!(
        "-- on {} | fetched {} | every {}s --",
        snapshot.current_branch.as_deref().unwrap_or("?"),
        fetched,
        snapshot.poll_interval_ms / 1000
    ));
    for (index, branch) in snapshot.branches.iter().enumerate() {
        let cursor = if index == snapshot.selected_index { '>' } else { ' ' };
        let current = if snapshot.current_branch.as_deref() == Some(branch.name.as_str()) {
            '*'
        } else {
            ' '
        };
        let mut tags = Vec::new();
        if branch.is_new {
            tags.push("new");
        }
        if branch.is_deleted {
            tags.push("deleted");
        }
        if branch.has_updates {
            tags.push("behind");
        }
        if !branch.is_local {
            tags.push("remote");
        }
        let tags = if tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", tags.join(","))
        };
        lines.push(format!("{cursor}{current} {}{tags}  {}", branch.name, branch.subject));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchtower_core::store::{Update, ToastLevel};
    use watchtower_core::{branch::reconcile, PendingOperation};

    #[test]
    fn parses_commands_and_arguments() {
        assert_eq!(parse_command("s feature-a"), Ok(Command::Switch("feature-a".to_string())));
        assert_eq!(
            parse_command("X old"),
            Ok(Command::Delete {
                branch: "old".to_string(),
                force: true
            })
        );
        assert_eq!(parse_command("  ack "), Ok(Command::Acknowledge));
        assert_eq!(parse_command("q"), Ok(Command::Quit));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(parse_command("s").is_err());
        assert!(parse_command("p main").is_err());
        assert!(parse_command("s a b").is_err());
        assert!(parse_command("zz").is_err());
        assert!(parse_command("").is_err());
    }

    #[test]
    fn renders_branch_list_with_markers() {
        let store = Store::default();
        store.apply([
            Update::Branches(reconcile(
                "refs/heads/main|2024-05-01T10:00:00Z|aaa|Initial\n",
                "refs/remotes/origin/main|2024-05-02T10:00:00Z|bbb|Upstream\nrefs/remotes/origin/feature-b|2024-05-03T10:00:00Z|ccc|Feature b\n",
                "origin",
            )),
            Update::CurrentBranch {
                name: Some("main".to_string()),
                detached: false,
            },
        ]);
        store.select_name("main");
        let lines = render(&store.snapshot(), &[StateKey::Branches]);
        assert!(lines[0].starts_with("-- on main"));
        assert!(lines.iter().any(|line| line.starts_with(">* main [behind]")));
        assert!(lines.iter().any(|line| line.contains("feature-b [remote]")));
    }

    #[test]
    fn renders_only_touched_keys() {
        let store = Store::default();
        store.update(Update::PendingOperation(Some(PendingOperation::Pull {
            branch: "main".to_string(),
        })));
        store.toast(ToastLevel::Warning, "Local changes block the pull");
        let snapshot = store.snapshot();

        let lines = render(&snapshot, &[StateKey::Toast]);
        assert_eq!(lines, vec!["[warning] Local changes block the pull".to_string()]);

        let lines = render(&snapshot, &[StateKey::PendingOperation]);
        assert_eq!(lines, vec!["waiting: pull of main (y = stash and retry, n = cancel)".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_lets_the_running_command_finish() {
        let (tx, rx) = watch::channel(false);
        let tx = Arc::new(tx);
        let handled = Arc::new(std::sync::Mutex::new(Vec::new()));
        drive(&b"p\ns main\n"[..], rx, |command| {
            let tx = tx.clone();
            let handled = handled.clone();
            async move {
                tx.send(true).expect("send");
                tokio::time::sleep(Duration::from_millis(30)).await;
                handled.lock().expect("handled").push(command);
            }
        })
        .await;
        assert_eq!(*handled.lock().expect("handled"), vec![Command::Pull]);
    }

    #[tokio::test]
    async fn quit_and_closed_input_end_the_loop() {
        let (_tx, rx) = watch::channel(false);
        let mut handled = Vec::new();
        drive(&b"\nbogus\nq\np\n"[..], rx, |command| {
            handled.push(command);
            std::future::ready(())
        })
        .await;
        assert!(handled.is_empty());

        let (tx, rx) = watch::channel(false);
        drop(tx);
        drive(&b""[..], rx, |_| std::future::ready(())).await;
    }
}
