use crate::branch::validate_branch_name;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = ".watchtower.toml";
pub const MIN_POLL_INTERVAL_MS: u64 = 1_000;
pub const MAX_POLL_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("poll_interval_ms must be between 1000 and 300000, got {0}")]
    PollInterval(u64),
    #[error("invalid remote name {0:?}")]
    Remote(String),
    #[error("server.mode = \"command\" needs a non-empty server.command")]
    MissingServerCommand,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    #[default]
    None,
    Command,
}

impl ServerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerMode::None => "none",
            ServerMode::Command => "command",
        }
    }
}

impl std::str::FromStr for ServerMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(ServerMode::None),
            "command" => Ok(ServerMode::Command),
            other => Err(format!("unknown server mode {other:?} (expected none or command)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub mode: ServerMode,
    pub command: Option<String>,
    pub restart_on_switch: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: ServerMode::None,
            command: None,
            restart_on_switch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub remote: String,
    pub poll_interval_ms: u64,
    pub auto_pull: bool,
    pub sound: bool,
    pub server: ServerConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            auto_pull: true,
            sound: true,
            server: ServerConfig::default(),
        }
    }
}

impl WatchConfig {
    pub fn path_in(project_dir: &Path) -> PathBuf {
        project_dir.join(CONFIG_FILE_NAME)
    }

    /// Loads `path`, or defaults when the file does not exist. Unlike a
    /// missing file, a malformed one is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&self.poll_interval_ms) {
            return Err(ConfigError::PollInterval(self.poll_interval_ms));
        }
        if !validate_branch_name(&self.remote) {
            return Err(ConfigError::Remote(self.remote.clone()));
        }
        if self.server.mode == ServerMode::Command
            && self
                .server
                .command
                .as_deref()
                .map_or(true, |command| command.trim().is_empty())
        {
            return Err(ConfigError::MissingServerCommand);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The server command to supervise, when one is configured.
    pub fn server_command(&self) -> Option<&str> {
        match self.server.mode {
            ServerMode::Command => self.server.command.as_deref(),
            ServerMode::None => None,
        }
    }
}
