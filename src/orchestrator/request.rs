//! Task submission payloads.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::ws::messages::StringOrList;

/// Extra CLI arguments: a flat list, or a `{flag: value}` map rendered as
/// `--flag value` (`--flag` alone for null or empty values).
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ExtraArgs {
    /// Appended verbatim (non-string and blank entries are dropped).
    List(Vec<Value>),
    /// Rendered as flags.
    Map(Map<String, Value>),
}

impl ExtraArgs {
    /// Whether a map form sets any of `keys`.
    #[must_use]
    pub fn has_key(&self, keys: &[&str]) -> bool {
        match self {
            Self::Map(map) => keys.iter().any(|key| map.contains_key(*key)),
            Self::List(_) => false,
        }
    }

    /// Value of the first of `keys` present in a map form, as a string.
    #[must_use]
    pub fn value_of(&self, keys: &[&str]) -> Option<String> {
        match self {
            Self::Map(map) => keys
                .iter()
                .find_map(|key| map.get(*key))
                .and_then(render_value),
            Self::List(_) => None,
        }
    }

    /// Render into CLI arguments.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        match self {
            Self::List(items) => items
                .iter()
                .filter_map(Value::as_str)
                .filter(|arg| !arg.trim().is_empty())
                .map(str::to_owned)
                .collect(),
            Self::Map(map) => {
                let mut args = Vec::new();
                for (key, value) in map {
                    if key.is_empty() {
                        continue;
                    }
                    args.push(format!("--{key}"));
                    if let Some(rendered) = render_value(value) {
                        args.push(rendered);
                    }
                }
                args
            }
        }
    }
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// `POST /api/agent/submit` body.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ClaudeTaskRequest {
    /// Prompt passed with `-p`.
    pub prompt: String,
    /// MCP config overriding the configured default.
    pub mcp_config_path: Option<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// Extra `--flag value` pairs.
    pub extra_args: Option<ExtraArgs>,
    /// Importance hint.
    pub importance: Option<String>,
    /// Urgency hint.
    pub urgency: Option<String>,
}

/// `POST /api/codex/submit` and `/api/codex/chat` body.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CodexTaskRequest {
    /// Prompt, passed last.
    pub prompt: String,
    /// `--model`.
    pub model: Option<String>,
    /// `--profile`.
    pub profile: Option<String>,
    /// `--sandbox`.
    pub sandbox: Option<String>,
    /// Working directory.
    pub cwd: Option<PathBuf>,
    /// `-c` overrides.
    pub config_overrides: Option<StringOrList>,
    /// Extra arguments before the prompt.
    pub extra_args: Option<ExtraArgs>,
    /// `--skip-git-repo-check`; accepts booleans and `"1"`/`"true"`/`"yes"`/`"on"`.
    pub skip_git_check: Option<Value>,
    /// Importance hint.
    pub importance: Option<String>,
    /// Urgency hint.
    pub urgency: Option<String>,
}

/// Loosely-typed boolean.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_i64().is_some_and(|n| n != 0),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        _ => false,
    }
}

/// External task registration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ExternalTaskRequest {
    /// Prompt or description.
    pub prompt: String,
    /// Display command.
    pub command: Option<String>,
    /// Provider label.
    pub provider: Option<String>,
    /// Model label.
    pub model: Option<String>,
    /// Importance hint.
    pub importance: Option<String>,
    /// Urgency hint.
    pub urgency: Option<String>,
}
