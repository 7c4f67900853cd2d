//! Deterministic command-line construction for batch tasks.
//!
//! Per-call values win over configuration. Defaults such as
//! `--output-format` and `--max-turns` are only added when the caller did
//! not pass them through `extraArgs`.

use std::path::Path;

use crate::config::{ClaudeConfig, CodexConfig};
use crate::orchestrator::request::{truthy, ClaudeTaskRequest, CodexTaskRequest};
use crate::pty::commands::push_debug_flag;
use crate::ws::messages::StringOrList;

/// How a task's stdout is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Plain text; chunks are logged as-is.
    Raw,
    /// One JSON object on stdout, parsed at exit.
    FinalJson,
    /// Claude `stream-json` events.
    ClaudeStream,
    /// Claude `stream-json` events from a synchronous chat run; only
    /// assistant text is logged.
    ClaudeChat,
    /// Codex `exec --json` events.
    CodexStream,
}

/// A fully resolved invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Executable.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Stdout interpretation.
    pub output_mode: OutputMode,
    /// Resolved model label, if any.
    pub model: Option<String>,
    /// Resolved profile (Codex).
    pub profile: Option<String>,
    /// Resolved sandbox (Codex).
    pub sandbox: Option<String>,
}

impl Invocation {
    /// Display form: program and args, quoting any with whitespace.
    #[must_use]
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(quote_arg)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn quote_arg(arg: &str) -> String {
    if arg.chars().any(char::is_whitespace) {
        format!("'{}'", arg.replace('\'', r"'\''"))
    } else {
        arg.to_owned()
    }
}

const OUTPUT_FORMAT_KEYS: &[&str] = &["output-format", "outputFormat"];
const MAX_TURNS_KEYS: &[&str] = &["max-turns", "maxTurns"];

/// Build the Claude headless invocation. `mcp_config` must already be resolved.
#[must_use]
pub fn claude_invocation(
    config: &ClaudeConfig,
    request: &ClaudeTaskRequest,
    mcp_config: &Path,
) -> Invocation {
    let extra = request.extra_args.as_ref();
    let mut args = vec!["--verbose".to_owned()];

    if config.skip_permissions {
        args.push("--dangerously-skip-permissions".to_owned());
    }
    push_debug_flag(&mut args, config.debug.as_deref());

    let explicit_format = extra.and_then(|extra| extra.value_of(OUTPUT_FORMAT_KEYS));
    let has_format = extra.is_some_and(|extra| extra.has_key(OUTPUT_FORMAT_KEYS));
    if !has_format && !config.output_format.is_empty() {
        args.push("--output-format".to_owned());
        args.push(config.output_format.clone());
    }

    args.push("--mcp-config".to_owned());
    args.push(mcp_config.display().to_string());

    let has_turns = extra.is_some_and(|extra| extra.has_key(MAX_TURNS_KEYS));
    if let Some(turns) = config.max_turns.filter(|_| !has_turns) {
        args.push("--max-turns".to_owned());
        args.push(turns.to_string());
    }

    if let Some(extra) = extra {
        args.extend(extra.to_args());
    }

    args.push("-p".to_owned());
    args.push(request.prompt.clone());

    let effective_format = if has_format {
        explicit_format.unwrap_or_default()
    } else {
        config.output_format.clone()
    };
    let output_mode = match effective_format.as_str() {
        "json" => OutputMode::FinalJson,
        "stream-json" => OutputMode::ClaudeStream,
        _ => OutputMode::Raw,
    };

    Invocation {
        program: config.program.clone(),
        args,
        output_mode,
        model: Some("claude-headless".to_owned()),
        profile: None,
        sandbox: None,
    }
}

/// Build the synchronous chat invocation: always `stream-json`, no
/// pass-through arguments.
#[must_use]
pub fn claude_chat_invocation(config: &ClaudeConfig, prompt: &str, mcp_config: &Path) -> Invocation {
    let mut args = vec![
        "-p".to_owned(),
        prompt.to_owned(),
        "--output-format".to_owned(),
        "stream-json".to_owned(),
        "--verbose".to_owned(),
        "--mcp-config".to_owned(),
        mcp_config.display().to_string(),
    ];
    if let Some(system) = non_empty(config.chat_system_prompt.as_deref()) {
        args.push("--append-system-prompt".to_owned());
        args.push(system);
    }
    if let Some(turns) = config.max_turns {
        args.push("--max-turns".to_owned());
        args.push(turns.to_string());
    }
    if config.skip_permissions {
        args.push("--dangerously-skip-permissions".to_owned());
    }

    Invocation {
        program: config.program.clone(),
        args,
        output_mode: OutputMode::ClaudeChat,
        model: None,
        profile: None,
        sandbox: None,
    }
}

/// Build `codex exec --json ...`.
#[must_use]
pub fn codex_invocation(config: &CodexConfig, request: &CodexTaskRequest) -> Invocation {
    let mut args = vec!["exec".to_owned(), "--json".to_owned()];

    let model = non_empty(request.model.as_deref()).or_else(|| non_empty(config.model.as_deref()));
    if let Some(ref model) = model {
        args.push("--model".to_owned());
        args.push(model.clone());
    }

    let profile =
        non_empty(request.profile.as_deref()).or_else(|| non_empty(config.profile.as_deref()));
    if let Some(ref profile) = profile {
        args.push("--profile".to_owned());
        args.push(profile.clone());
    }

    let sandbox =
        non_empty(request.sandbox.as_deref()).or_else(|| non_empty(config.sandbox.as_deref()));
    if let Some(ref sandbox) = sandbox {
        args.push("--sandbox".to_owned());
        args.push(sandbox.clone());
    }

    let skip_git = request
        .skip_git_check
        .as_ref()
        .map_or(config.skip_git_check, truthy);
    if skip_git {
        args.push("--skip-git-repo-check".to_owned());
    }

    let mut overrides = request
        .config_overrides
        .as_ref()
        .map(StringOrList::entries)
        .unwrap_or_default();
    if overrides.is_empty() {
        overrides.clone_from(&config.config_overrides);
    }
    for entry in overrides {
        args.push("-c".to_owned());
        args.push(entry);
    }

    if let Some(ref extra) = request.extra_args {
        args.extend(extra.to_args());
    }

    args.push(request.prompt.clone());

    Invocation {
        program: config.program.clone(),
        args,
        output_mode: OutputMode::CodexStream,
        model,
        profile,
        sandbox,
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}
