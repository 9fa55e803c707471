use crate::classify::classify;
use crate::error::CommandError;
use crate::sync::with_timeout;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Pathological output (a runaway hook, a binary diff) is cut here.
pub const OUTPUT_LIMIT: usize = 10 * 1024 * 1024;

const SHORT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const FETCH_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTimeout {
    /// Local probes: rev-parse, status, for-each-ref.
    Short,
    Default,
    /// Anything that talks to a remote.
    Fetch,
    Custom(Duration),
}

impl CommandTimeout {
    pub fn duration(self) -> Duration {
        match self {
            CommandTimeout::Short => Duration::from_millis(SHORT_TIMEOUT_MS),
            CommandTimeout::Default => Duration::from_millis(DEFAULT_TIMEOUT_MS),
            CommandTimeout::Fetch => Duration::from_millis(FETCH_TIMEOUT_MS),
            CommandTimeout::Custom(limit) => limit,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: CommandTimeout,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: CommandTimeout::Default,
            cwd: None,
            envs: Vec::new(),
        }
    }
}

impl RunOptions {
    pub fn with_timeout(timeout: CommandTimeout) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

/// The text used in errors and logs. Arguments only; output never lands here.
pub fn command_text(program: &str, args: &[String]) -> String {
    let mut text = program.to_string();
    for arg in args {
        text.push(' ');
        text.push_str(arg);
    }
    text
}

pub async fn run(program: &str, args: &[String], options: &RunOptions) -> Result<CommandOutput, CommandError> {
    let text = command_text(program, args);
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &options.envs {
        command.env(key, value);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(CommandError::NotFound { command: text });
        }
        Err(err) => {
            return Err(CommandError::Spawn {
                command: text,
                reason: err.to_string(),
            });
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let limit = options.timeout.duration();
    // Owned by its own task: a timed-out or abandoned child keeps running
    // and is still drained and reaped. Killing git mid-write can leave
    // index.lock behind.
    let work = tokio::spawn(async move {
        let (stdout, stderr, status) = tokio::join!(
            read_capped(stdout, OUTPUT_LIMIT),
            read_capped(stderr, OUTPUT_LIMIT),
            child.wait()
        );
        (stdout, stderr, status)
    });

    let (stdout, stderr, status) = match with_timeout(limit, work).await {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            return Err(CommandError::Spawn {
                command: text,
                reason: err.to_string(),
            });
        }
        Err(_) => {
            warn!(command = %text, timeout_ms = limit.as_millis() as u64, "command_timeout");
            return Err(CommandError::Timeout {
                command: text,
                timeout_ms: limit.as_millis() as u64,
            });
        }
    };
    let status = status.map_err(|err| CommandError::Spawn {
        command: text.clone(),
        reason: err.to_string(),
    })?;

    let stdout = String::from_utf8_lossy(&stdout).to_string();
    let stderr = String::from_utf8_lossy(&stderr).to_string();
    if status.success() {
        debug!(command = %text, "command_ok");
        return Ok(CommandOutput { stdout, stderr });
    }
    let category = classify(&stdout, &stderr);
    debug!(command = %text, code = ?status.code(), ?category, "command_failed");
    Err(CommandError::Failed {
        command: text,
        code: status.code(),
        stderr,
        category,
    })
}

async fn read_capped<R>(reader: Option<R>, limit: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut buffer = Vec::new();
    let _ = (&mut reader).take(limit as u64).read_to_end(&mut buffer).await;
    if buffer.len() >= limit {
        debug!(limit, "command_output_truncated");
    }
    // keep draining so the child never blocks on a full pipe
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
    buffer
}

/// The seam between typed git operations and the process that runs them.
pub trait GitExecutor: Send + Sync + 'static {
    fn exec(
        &self,
        args: Vec<String>,
        timeout: CommandTimeout,
    ) -> impl Future<Output = Result<CommandOutput, CommandError>> + Send;
}

/// Runs the installed `git` binary inside the project directory.
#[derive(Debug, Clone)]
pub struct GitCli {
    program: String,
    cwd: PathBuf,
}

impl GitCli {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: "git".to_string(),
            cwd: cwd.into(),
        }
    }

    pub fn with_program(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cwd: cwd.into(),
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }
}

impl GitExecutor for GitCli {
    async fn exec(&self, args: Vec<String>, timeout: CommandTimeout) -> Result<CommandOutput, CommandError> {
        let options = RunOptions::with_timeout(timeout)
            .in_dir(&self.cwd)
            // a credential prompt would hang until the timeout
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C");
        run(&self.program, &args, &options).await
    }
}
