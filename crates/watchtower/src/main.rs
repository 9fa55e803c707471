mod console;

use anyhow::{bail, Context};
use clap::Parser;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use watchtower_core::pr::PrLookup;
use watchtower_core::store::ToastLevel;
use watchtower_core::{
    Actions, FileWatcher, Git, GitCli, LoggingReload, OperationLock, PollEngine, PollSettings, ProcessManager,
    ReloadHook, StashRecovery, Store, WatchConfig,
};

#[derive(Parser, Debug)]
#[command(name = "git-watchtower", version)]
struct Args {
    /// Repository to watch.
    #[arg(long, env = "WATCHTOWER_PROJECT", default_value = ".")]
    project: PathBuf,
    /// Config file; defaults to .watchtower.toml in the project.
    #[arg(long, env = "WATCHTOWER_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "WATCHTOWER_REMOTE")]
    remote: Option<String>,
    #[arg(long = "interval-ms", env = "WATCHTOWER_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,
    #[arg(long, default_value_t = false)]
    no_auto_pull: bool,
    #[arg(long, default_value_t = false)]
    no_sound: bool,
    /// Dev-server command line to supervise.
    #[arg(long, env = "WATCHTOWER_SERVER_COMMAND")]
    server_command: Option<String>,
    #[arg(long, default_value_t = false)]
    no_restart_on_switch: bool,
    #[arg(long, default_value_t = false)]
    no_watch: bool,
    #[arg(long, default_value_t = false)]
    no_pr_status: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let project = args
        .project
        .canonicalize()
        .with_context(|| format!("project directory {} is not accessible", args.project.display()))?;
    let log_dir = resolve_log_dir(&args.log_dir, &project);
    let log_guard = init_logging(&log_dir);

    let config = resolve_config(&args, &project)?;
    info!(
        project = %project.display(),
        remote = %config.remote,
        interval_ms = config.poll_interval_ms,
        auto_pull = config.auto_pull,
        server_mode = config.server.mode.as_str(),
        "watchtower_start"
    );

    let git = Git::new(Arc::new(GitCli::new(&project)), config.remote.clone());
    let probe = git.probe().await.context("git is not available")?;
    if !probe.in_repository {
        bail!("{} is not inside a git working tree", project.display());
    }
    info!(version = %probe.version, "git_probe");

    let store = Store::default();
    let lock = Arc::new(OperationLock::new());
    let recovery = Arc::new(StashRecovery::new());
    let reload: Arc<dyn ReloadHook> = Arc::new(LoggingReload);
    let prs = (!args.no_pr_status).then(|| Arc::new(PrLookup::new(&project)));

    let mut engine = PollEngine::new(
        git.clone(),
        store.clone(),
        lock.clone(),
        recovery.clone(),
        PollSettings::from_config(&config),
    )
    .with_reload(reload.clone());
    if let Some(prs) = &prs {
        engine = engine.with_pr_lookup(prs.clone());
    }
    let mut actions = Actions::new(git, store.clone(), lock, recovery)
        .with_reload(reload.clone())
        .with_refresh(engine.refresh_handle());

    let server = config
        .server_command()
        .map(|command| (command.to_string(), Arc::new(ProcessManager::new(&project, store.clone()))));
    if let Some((command, manager)) = &server {
        actions = actions.with_server(manager.clone(), config.server.restart_on_switch);
        match manager.start(command).await {
            Ok(started) => info!(pid = ?started.pid, command = %command, "server_started"),
            Err(err) => {
                // the dashboard stays useful without the server
                error!(error = %err, "server_start_failed");
                store.notify(ToastLevel::Error, format!("Server failed to start: {err}"));
            }
        }
    }

    let watcher = if args.no_watch {
        None
    } else {
        match FileWatcher::spawn(&project, reload.clone()) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(error = %err, "file_watch_unavailable");
                None
            }
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_task = tokio::spawn(engine.run(shutdown_rx.clone()));
    let printer_task = tokio::spawn(console::print_changes(store.clone(), shutdown_rx.clone()));

    let shutdown_tx = Arc::new(shutdown_tx);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl_c");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    // the console returns on q or shutdown, never mid-command
    let console = console::Console::new(actions, prs);
    console.run(shutdown_rx).await;

    info!("watchtower_shutdown");
    let _ = shutdown_tx.send(true);
    if let Some(watcher) = watcher {
        watcher.close();
    }
    if let Some((_, manager)) = &server {
        let outcome = manager.stop().await;
        info!(outcome = ?outcome, "server_stopped");
    }
    let _ = poll_task.await;
    let _ = printer_task.await;
    info!("watchtower_stop");
    drop(log_guard);
    // a blocked stdin read would otherwise hold the runtime open until enter
    std::process::exit(0);
}

/// File first, then environment/flags on top; validated before the core
/// sees it.
fn resolve_config(args: &Args, project: &Path) -> anyhow::Result<WatchConfig> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| WatchConfig::path_in(project));
    let mut config = WatchConfig::load(&path)?;
    if let Some(remote) = &args.remote {
        config.remote = remote.clone();
    }
    if let Some(interval) = args.poll_interval_ms {
        config.poll_interval_ms = interval;
    }
    if args.no_auto_pull || env_false("WATCHTOWER_AUTO_PULL") {
        config.auto_pull = false;
    }
    if args.no_sound || env_false("WATCHTOWER_SOUND") {
        config.sound = false;
    }
    if let Some(command) = &args.server_command {
        config.server.mode = watchtower_core::ServerMode::Command;
        config.server.command = Some(command.clone());
    }
    if let Ok(mode) = std::env::var("WATCHTOWER_SERVER_MODE") {
        config.server.mode = mode.parse().map_err(anyhow::Error::msg)?;
    }
    if args.no_restart_on_switch {
        config.server.restart_on_switch = false;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn env_false(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(value.trim().to_lowercase().as_str(), "0" | "false" | "no" | "off"),
        Err(_) => false,
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

fn resolve_log_dir(log_dir_flag: &str, project: &Path) -> PathBuf {
    let dir = if !log_dir_flag.trim().is_empty() {
        PathBuf::from(log_dir_flag)
    } else {
        match std::env::var("WATCHTOWER_LOG_DIR") {
            Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
            _ => PathBuf::from(".watchtower/logs"),
        }
    };
    if dir.is_absolute() {
        dir
    } else {
        project.join(dir)
    }
}

fn init_logging(log_dir: &Path) -> Option<LogGuard> {
    let level = std::env::var("WATCHTOWER_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let stdout_enabled = env_true("WATCHTOWER_LOG_STDOUT");
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone(), stdout_enabled));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let _ = file.flush();
        }
    }
}

struct MultiWriter {
    stdout_enabled: bool,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>, stdout_enabled: bool) -> Self {
        Self { stdout_enabled, file }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.stdout_enabled {
            let _ = io::stdout().write_all(buf);
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.stdout_enabled {
            let _ = io::stdout().flush();
        }
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &Path) -> io::Result<LogGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("git-watchtower.log"))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}
