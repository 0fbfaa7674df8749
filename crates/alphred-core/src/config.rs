//! Configuration parsing for the assistant daemon.
//!
//! key=value format, `#` comments, optionally quoted values.
//! Precedence: CLI flags > `--config` file > `.alphred/config` > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Project-local config file consulted when `--config` is not given.
pub const LOCAL_CONFIG_PATH: &str = ".alphred/config";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
}

/// Daemon configuration shared by the chat server and the worker.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Storage and HTTP
    pub db_path: PathBuf,
    pub port: u16,

    // LLM
    pub llm_base_url: String,
    pub model: String,
    /// Tried once when the primary model fails.
    pub fallback_model: Option<String>,
    pub llm_timeout_sec: u32,

    // Tool providers
    pub tool_timeout_sec: u32,
    pub handshake_timeout_sec: u32,

    // Task execution
    pub max_turns: u32,
    pub poll_interval_sec: u32,
    pub task_lease_sec: u32,
    pub worker_skill: String,

    // Chat
    pub chat_skill: String,
    pub memory_recent_limit: usize,
    pub memory_top_k: usize,

    // Skills
    /// Directories scanned for `<name>/SKILL.md` manifests, in priority order.
    pub skills_dirs: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: dirs::data_local_dir().map_or_else(
                || PathBuf::from("alphred.db"),
                |d| d.join("alphred").join("alphred.db"),
            ),
            port: 8000,
            llm_base_url: "http://127.0.0.1:4000/v1".to_string(),
            model: "groq/llama-3.3-70b-versatile".to_string(),
            fallback_model: Some("gemini/gemini-1.5-flash".to_string()),
            llm_timeout_sec: 120,
            tool_timeout_sec: 60,
            handshake_timeout_sec: 15,
            max_turns: 10,
            poll_interval_sec: 5,
            task_lease_sec: 900,
            worker_skill: "general".to_string(),
            chat_skill: "task-manager".to_string(),
            memory_recent_limit: 50,
            memory_top_k: 5,
            skills_dirs: default_skills_dirs(),
        }
    }
}

/// Project-local skills first, then the user's global directory.
fn default_skills_dirs() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(".alphred/skills")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".alphred").join("skills"));
    }
    paths
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load `explicit` if given, else `.alphred/config` under `root` if it exists, else defaults.
    pub fn discover(explicit: Option<&Path>, root: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let local = root.join(LOCAL_CONFIG_PATH);
        if local.is_file() {
            return Self::from_file(&local);
        }
        Ok(Self::default())
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, &path.display().to_string())
    }

    /// Parse config content (key=value format).
    fn parse_content(&mut self, content: &str, source: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value, source)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str, source: &str) -> Result<(), ConfigError> {
        match key {
            "db_path" => self.db_path = PathBuf::from(value),
            "port" => self.port = Self::parse_int(key, value)?,
            "llm_base_url" => self.llm_base_url = value.trim_end_matches('/').to_string(),
            "model" => self.model = value.to_string(),
            "fallback_model" => {
                self.fallback_model = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                }
            }
            "llm_timeout_sec" => self.llm_timeout_sec = Self::parse_int(key, value)?,
            "tool_timeout_sec" => self.tool_timeout_sec = Self::parse_int(key, value)?,
            "handshake_timeout_sec" => self.handshake_timeout_sec = Self::parse_int(key, value)?,
            "max_turns" => {
                let turns: u32 = Self::parse_int(key, value)?;
                if turns == 0 {
                    return Err(ConfigError::InvalidInt {
                        key: key.to_string(),
                        value: value.to_string(),
                    });
                }
                self.max_turns = turns;
            }
            "poll_interval_sec" => self.poll_interval_sec = Self::parse_int(key, value)?,
            "task_lease_sec" => self.task_lease_sec = Self::parse_int(key, value)?,
            "worker_skill" => self.worker_skill = value.to_string(),
            "chat_skill" => self.chat_skill = value.to_string(),
            "memory_recent_limit" => self.memory_recent_limit = Self::parse_int(key, value)?,
            "memory_top_k" => self.memory_top_k = Self::parse_int(key, value)?,
            "skills_dirs" => {
                self.skills_dirs = value.split_whitespace().map(PathBuf::from).collect();
            }
            _ => {
                warn!(key, source, "unknown config key, ignoring");
            }
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, root: &Path) {
        if self.db_path.is_relative() {
            self.db_path = root.join(&self.db_path);
        }
        self.skills_dirs = self
            .skills_dirs
            .iter()
            .map(|dir| {
                if dir.is_relative() {
                    root.join(dir)
                } else {
                    dir.clone()
                }
            })
            .collect();
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.llm_timeout_sec))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.tool_timeout_sec))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.handshake_timeout_sec))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.poll_interval_sec))
    }

    pub fn task_lease(&self) -> Duration {
        Duration::from_secs(u64::from(self.task_lease_sec))
    }
}
