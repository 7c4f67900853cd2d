//! Global configuration parsing, validation, and environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{AppError, Result};

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ServerConfig {
    /// Interface the HTTP listener binds to.
    pub bind: String,
    /// TCP port for both the REST API and the `/ws/pty` upgrade path.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7777,
        }
    }
}

/// Interactive PTY session settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct SessionConfig {
    /// Helper executable that owns the PTY (`agent-console-pty`).
    pub helper_program: String,
    /// Arguments placed before the helper argv contract.
    pub helper_args: Vec<String>,
    /// Working directory handed to the helper via `--cwd`.
    pub working_dir: Option<PathBuf>,
    /// Pass `--debug` to the helper.
    pub debug: bool,
    /// Command identifiers clients may start.
    pub allowed_commands: Vec<String>,
    /// Delay between the graceful terminate request and the forced kill.
    pub grace_period_ms: u64,
    /// Cap for a single WebSocket message in either direction.
    pub max_message_bytes: usize,
    /// Cap for a single `input` payload forwarded to the helper.
    pub max_input_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            helper_program: "agent-console-pty".into(),
            helper_args: Vec::new(),
            working_dir: None,
            debug: false,
            allowed_commands: vec!["claude".into(), "codex".into()],
            grace_period_ms: 1500,
            max_message_bytes: 2 * 1024 * 1024,
            max_input_bytes: 16 * 1024,
        }
    }
}

impl SessionConfig {
    /// Grace window for two-phase helper shutdown.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// Task engine and snapshot settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct TaskConfig {
    /// Snapshot file holding persisted tasks.
    pub state_file: PathBuf,
    /// Quiet period before a scheduled snapshot write.
    pub persist_debounce_ms: u64,
    /// Heartbeat log interval for running tasks; 0 disables it.
    pub heartbeat_ms: u64,
    /// Lowest id handed out to new tasks.
    pub first_task_id: u64,
    /// Default working directory for task processes.
    pub working_dir: Option<PathBuf>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("tasks-state.json"),
            persist_debounce_ms: 1200,
            heartbeat_ms: 10_000,
            first_task_id: 1,
            working_dir: None,
        }
    }
}

impl TaskConfig {
    /// Debounce window for snapshot writes.
    #[must_use]
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    /// Heartbeat interval, or `None` when disabled.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_ms > 0).then(|| Duration::from_millis(self.heartbeat_ms))
    }
}

/// Claude CLI invocation defaults.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct ClaudeConfig {
    /// Executable name or path.
    pub program: String,
    /// MCP configuration file required for batch tasks.
    pub mcp_config_path: Option<PathBuf>,
    /// Default `--output-format` when the caller does not pass one.
    pub output_format: String,
    /// Default `--max-turns` when the caller does not pass one.
    pub max_turns: Option<u32>,
    /// Add `--dangerously-skip-permissions`.
    pub skip_permissions: bool,
    /// `--debug` filter; `"1"`/`"true"` enable it without a value.
    pub debug: Option<String>,
    /// `--append-system-prompt` for synchronous chat runs.
    pub chat_system_prompt: Option<String>,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            program: "claude".into(),
            mcp_config_path: None,
            output_format: "stream-json".into(),
            max_turns: None,
            skip_permissions: false,
            debug: None,
            chat_system_prompt: None,
        }
    }
}

/// Codex CLI invocation defaults.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct CodexConfig {
    /// Executable name or path.
    pub program: String,
    /// Default `--model`.
    pub model: Option<String>,
    /// Default `--profile`.
    pub profile: Option<String>,
    /// Default `--sandbox`.
    pub sandbox: Option<String>,
    /// Add `--skip-git-repo-check` unless the request says otherwise.
    pub skip_git_check: bool,
    /// `-c key=value` overrides used when the request carries none.
    pub config_overrides: Vec<String>,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            program: "codex".into(),
            model: None,
            profile: None,
            sandbox: Some("danger-full-access".into()),
            skip_git_check: false,
            config_overrides: Vec::new(),
        }
    }
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct GlobalConfig {
    /// HTTP listener.
    pub server: ServerConfig,
    /// Interactive sessions over `/ws/pty`.
    pub sessions: SessionConfig,
    /// Batch task engine.
    pub tasks: TaskConfig,
    /// Claude CLI defaults.
    pub claude: ClaudeConfig,
    /// Codex CLI defaults.
    pub codex: CodexConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-variable overrides on top of the parsed file.
    ///
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(port) = env_value("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(err) => warn!(%err, value = %port, "ignoring invalid PORT"),
            }
        }
        if let Some(path) = env_value("CLAUDE_MCP_CONFIG_PATH") {
            self.claude.mcp_config_path = Some(PathBuf::from(path));
        }
        if let Some(turns) = env_value("CLAUDE_MAX_TURNS") {
            match turns.parse() {
                Ok(turns) => self.claude.max_turns = Some(turns),
                Err(err) => warn!(%err, value = %turns, "ignoring invalid CLAUDE_MAX_TURNS"),
            }
        }
        if let Some(format) = env_value("CLAUDE_OUTPUT_FORMAT") {
            self.claude.output_format = format;
        }
        if let Some(model) = env_value("CODEX_MODEL") {
            self.codex.model = Some(model);
        }
        if let Some(profile) = env_value("CODEX_PROFILE") {
            self.codex.profile = Some(profile);
        }
        if let Some(sandbox) = env_value("CODEX_SANDBOX") {
            self.codex.sandbox = Some(sandbox);
        }
    }

    /// Whether `command` (already normalized) is on the session allow-list.
    #[must_use]
    pub fn is_command_allowed(&self, command: &str) -> bool {
        self.sessions
            .allowed_commands
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(command))
    }

    fn validate(&mut self) -> Result<()> {
        if self.sessions.max_message_bytes == 0 {
            return Err(AppError::Config(
                "sessions.max_message_bytes must be greater than zero".into(),
            ));
        }

        if self.sessions.allowed_commands.is_empty() {
            return Err(AppError::Config(
                "sessions.allowed_commands must not be empty".into(),
            ));
        }

        if self.tasks.persist_debounce_ms == 0 {
            return Err(AppError::Config(
                "tasks.persist_debounce_ms must be greater than zero".into(),
            ));
        }

        for dir in [&mut self.sessions.working_dir, &mut self.tasks.working_dir]
            .into_iter()
            .flatten()
        {
            *dir = dir
                .canonicalize()
                .map_err(|err| AppError::Config(format!("working_dir {} invalid: {err}", dir.display())))?;
        }

        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}
