//! Unit tests for batch task command-line construction.

use std::path::Path;

use serde_json::json;

use agent_console::config::GlobalConfig;
use agent_console::orchestrator::args::{
    claude_chat_invocation, claude_invocation, codex_invocation, OutputMode,
};
use agent_console::orchestrator::request::{ClaudeTaskRequest, CodexTaskRequest, ExtraArgs};
use agent_console::ws::messages::StringOrList;

fn config() -> GlobalConfig {
    GlobalConfig::from_toml_str("").expect("default config")
}

fn claude_request(prompt: &str) -> ClaudeTaskRequest {
    ClaudeTaskRequest {
        prompt: prompt.into(),
        ..ClaudeTaskRequest::default()
    }
}

fn codex_request(prompt: &str) -> CodexTaskRequest {
    CodexTaskRequest {
        prompt: prompt.into(),
        ..CodexTaskRequest::default()
    }
}

// ── Claude ──────────────────────────────────────────────────────────────────

/// Defaults come first and the prompt is passed last with `-p`.
#[test]
fn claude_default_arguments() {
    let mut config = config();
    config.claude.max_turns = Some(5);
    let invocation = claude_invocation(
        &config.claude,
        &claude_request("fix the build"),
        Path::new("/etc/mcp.json"),
    );

    assert_eq!(invocation.program, "claude");
    assert_eq!(
        invocation.args,
        vec![
            "--verbose",
            "--output-format",
            "stream-json",
            "--mcp-config",
            "/etc/mcp.json",
            "--max-turns",
            "5",
            "-p",
            "fix the build",
        ]
    );
    assert_eq!(invocation.output_mode, OutputMode::ClaudeStream);
}

/// `extraArgs` replaces the configured output format and turn cap.
#[test]
fn claude_extra_args_override_defaults() {
    let mut config = config();
    config.claude.max_turns = Some(5);
    let request = ClaudeTaskRequest {
        prompt: "go".into(),
        extra_args: Some(ExtraArgs::Map(
            json!({"output-format": "json", "maxTurns": 2, "verbose-tools": null})
                .as_object()
                .cloned()
                .expect("object"),
        )),
        ..ClaudeTaskRequest::default()
    };
    let invocation = claude_invocation(&config.claude, &request, Path::new("/m.json"));

    assert!(!invocation.args.contains(&"5".to_owned()));
    assert_eq!(
        invocation.args,
        vec![
            "--verbose",
            "--mcp-config",
            "/m.json",
            "--maxTurns",
            "2",
            "--output-format",
            "json",
            "--verbose-tools",
            "-p",
            "go",
        ]
    );
    assert_eq!(invocation.output_mode, OutputMode::FinalJson);
}

/// An output format other than json or stream-json reads stdout raw.
#[test]
fn claude_text_format_is_raw() {
    let mut config = config();
    config.claude.output_format = "text".into();
    let invocation = claude_invocation(&config.claude, &claude_request("x"), Path::new("/m"));
    assert_eq!(invocation.output_mode, OutputMode::Raw);
}

/// Chat runs put the prompt first and always stream JSON.
#[test]
fn claude_chat_arguments() {
    let mut config = config();
    config.claude.max_turns = Some(4);
    config.claude.skip_permissions = true;
    config.claude.chat_system_prompt = Some("report saved paths".into());
    let invocation =
        claude_chat_invocation(&config.claude, "draw a cat", Path::new("/etc/mcp.json"));

    assert_eq!(
        invocation.args,
        vec![
            "-p",
            "draw a cat",
            "--output-format",
            "stream-json",
            "--verbose",
            "--mcp-config",
            "/etc/mcp.json",
            "--append-system-prompt",
            "report saved paths",
            "--max-turns",
            "4",
            "--dangerously-skip-permissions",
        ]
    );
    assert_eq!(invocation.output_mode, OutputMode::ClaudeChat);
    assert_eq!(invocation.model, None);
}

/// Without a configured system prompt the flag is left out.
#[test]
fn claude_chat_without_system_prompt() {
    let invocation = claude_chat_invocation(&config().claude, "hi", Path::new("/m.json"));
    assert!(!invocation.args.iter().any(|arg| arg == "--append-system-prompt"));
}

/// The display form quotes arguments containing whitespace.
#[test]
fn display_quotes_whitespace() {
    let invocation = claude_invocation(
        &config().claude,
        &claude_request("it's done"),
        Path::new("/m"),
    );
    assert!(invocation.display().ends_with(r"-p 'it'\''s done'"));
}

// ── Codex ───────────────────────────────────────────────────────────────────

/// Configured sandbox applies; the prompt is the last argument.
#[test]
fn codex_default_arguments() {
    let invocation = codex_invocation(&config().codex, &codex_request("summarize"));
    assert_eq!(invocation.program, "codex");
    assert_eq!(
        invocation.args,
        vec!["exec", "--json", "--sandbox", "danger-full-access", "summarize"]
    );
    assert_eq!(invocation.output_mode, OutputMode::CodexStream);
    assert_eq!(invocation.sandbox.as_deref(), Some("danger-full-access"));
}

/// Per-request values win and every optional flag lands in order.
#[test]
fn codex_request_values_win() {
    let mut config = config();
    config.codex.model = Some("gpt-5".into());
    config.codex.config_overrides = vec!["ignored=1".into()];

    let request = CodexTaskRequest {
        prompt: "go".into(),
        model: Some("o3".into()),
        profile: Some("fast".into()),
        sandbox: Some("read-only".into()),
        config_overrides: Some(StringOrList::Many(vec!["a=1".into()])),
        extra_args: Some(ExtraArgs::List(vec![json!("--color"), json!(3), json!("never")])),
        skip_git_check: Some(json!("yes")),
        ..CodexTaskRequest::default()
    };
    let invocation = codex_invocation(&config.codex, &request);
    assert_eq!(
        invocation.args,
        vec![
            "exec",
            "--json",
            "--model",
            "o3",
            "--profile",
            "fast",
            "--sandbox",
            "read-only",
            "--skip-git-repo-check",
            "-c",
            "a=1",
            "--color",
            "never",
            "go",
        ]
    );
    assert_eq!(invocation.model.as_deref(), Some("o3"));
}

/// Configured overrides apply when the request has none.
#[test]
fn codex_config_overrides_fallback() {
    let mut config = config();
    config.codex.config_overrides = vec!["x=1".into()];
    config.codex.sandbox = None;
    let invocation = codex_invocation(&config.codex, &codex_request("p"));
    assert_eq!(invocation.args, vec!["exec", "--json", "-c", "x=1", "p"]);
}
