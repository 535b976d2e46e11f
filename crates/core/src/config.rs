//! # devjail Engine Configuration
//!
//! Configuration is loaded from multiple sources in order of precedence:
//! 1. Command-line flags (applied by the daemon after loading)
//! 2. Environment variables (`DEVJAIL_*`)
//! 3. Configuration file (`--config`, or `devjail.toml` in the project root)
//! 4. Built-in defaults

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "devjail.toml";

const DEFAULT_DENY_PATTERNS: &[&str] = &[
    ".git/**",
    "**/.git/**",
    "**/node_modules/**",
    ".env",
    "**/.env*",
];

const DEFAULT_ALLOW_PATTERNS: &[&str] = &["**"];

const DEFAULT_BACKUP_DIR: &str = ".devjail_backups";
const DEFAULT_MAX_READ_BYTES: u64 = 2_000_000;
const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_048_576; // 1 MiB
const DEFAULT_CLOSE_GRACE_MS: u64 = 2_000;
const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the sandboxed operation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory every operation is confined to
    pub project_root: PathBuf,

    /// Shell binary spawned by `term.open`
    pub shell: String,

    /// Arguments passed to the shell
    pub shell_args: Vec<String>,

    /// When false, `term.open` fails with `ShellDisabled`
    pub allow_shell: bool,

    /// Backup directory, relative to the project root
    pub backup_dir: PathBuf,

    /// Glob patterns a path must match before deny rules are consulted
    pub allow_patterns: Vec<String>,

    /// Glob patterns rejected on every operation
    pub deny_patterns: Vec<String>,

    /// Upper bound on a single `fs.read`
    pub max_read_bytes: u64,

    pub session: SessionConfig,

    pub llm: LlmConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            shell: default_shell(),
            shell_args: Vec::new(),
            allow_shell: true,
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            allow_patterns: DEFAULT_ALLOW_PATTERNS.iter().map(|p| p.to_string()).collect(),
            deny_patterns: DEFAULT_DENY_PATTERNS.iter().map(|p| p.to_string()).collect(),
            max_read_bytes: DEFAULT_MAX_READ_BYTES,
            session: SessionConfig::default(),
            llm: LlmConfig::default(),
        }
    }
}

/// Terminal session tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Bytes buffered per session before the oldest output is dropped
    pub output_limit_bytes: usize,
    /// Time `close` waits after SIGTERM before SIGKILL
    pub close_grace_ms: u64,
    /// Upper bound on writing a command to the shell's stdin
    pub write_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Chat-completions endpoint used by `edit.suggest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// No key means the offline fallback provider is used
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub timeout_s: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.deepseek.com".to_string(),
            model: "deepseek-coder".to_string(),
            timeout_s: 60,
        }
    }
}

impl EngineConfig {
    /// Load configuration for `project_root`.
    ///
    /// `path_override` takes precedence over `devjail.toml` inside the root.
    /// A missing default file is not an error; a missing explicit file is.
    pub fn load(project_root: &Path, path_override: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path_override {
            Some(path) => Self::from_file(path)?,
            None => {
                let candidate = project_root.join(CONFIG_FILE_NAME);
                if candidate.is_file() {
                    Self::from_file(&candidate)?
                } else {
                    Self::default()
                }
            }
        };

        config.project_root = project_root.to_path_buf();
        config.apply_env_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `DEVJAIL_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = non_empty("DEVJAIL_PROJECT_ROOT") {
            self.project_root = PathBuf::from(value);
        }

        if let Some(value) = non_empty("DEVJAIL_SHELL") {
            self.shell = value;
        }

        if let Some(value) = non_empty("DEVJAIL_ALLOW_SHELL") {
            if let Some(flag) = parse_bool(&value) {
                self.allow_shell = flag;
            }
        }

        if let Some(value) = non_empty("DEVJAIL_BACKUP_DIR") {
            self.backup_dir = PathBuf::from(value);
        }

        if let Some(value) = non_empty("DEVJAIL_LLM_API_KEY") {
            self.llm.api_key = Some(value);
        }

        if let Some(value) = non_empty("DEVJAIL_LLM_BASE_URL") {
            self.llm.base_url = value;
        }

        if let Some(value) = non_empty("DEVJAIL_LLM_MODEL") {
            self.llm.model = value;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shell.trim().is_empty() {
            return Err(ConfigError::Invalid("shell must not be empty".into()));
        }
        if self.backup_dir.is_absolute()
            || self
                .backup_dir
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)))
        {
            return Err(ConfigError::Invalid(format!(
                "backup_dir '{}' must be a plain path relative to the project root",
                self.backup_dir.display()
            )));
        }
        if self.session.output_limit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "session.output_limit_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(unix)]
fn default_shell() -> String {
    "/bin/bash".to_string()
}

#[cfg(not(unix))]
fn default_shell() -> String {
    "cmd.exe".to_string()
}
