//! Allow-listed command resolution for interactive sessions.

use crate::config::GlobalConfig;
use crate::ws::messages::StartRequest;
use tracing::warn;

/// Program and arguments a `start` message resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Normalized command identifier (`claude`, `codex`, ...).
    pub id: String,
    /// Executable handed to the helper.
    pub program: String,
    /// Arguments after the program.
    pub args: Vec<String>,
}

/// Resolve a `start` request against the session allow-list.
///
/// Returns `None` when the command is missing or not allowed.
#[must_use]
pub fn resolve_command(request: &StartRequest, config: &GlobalConfig) -> Option<CommandSpec> {
    let id = request.command.trim().to_lowercase();
    if id.is_empty() {
        return None;
    }
    if !config.is_command_allowed(&id) {
        warn!(command = %request.command, "command not allowed");
        return None;
    }

    let subcommand = request
        .subcommand
        .as_deref()
        .map(str::trim)
        .filter(|sub| !sub.is_empty());
    let client_args = request
        .args
        .iter()
        .filter(|arg| !arg.trim().is_empty())
        .cloned();

    let (program, args) = match id.as_str() {
        "claude" => {
            let claude = &config.claude;
            let mut args = Vec::new();
            if let Some(sub) = subcommand {
                args.push(sub.to_owned());
            }
            args.push("--verbose".to_owned());
            if claude.skip_permissions {
                args.push("--dangerously-skip-permissions".to_owned());
            }
            push_debug_flag(&mut args, claude.debug.as_deref());

            let mcp = request
                .mcp_config_path
                .as_deref()
                .map(str::trim)
                .filter(|path| !path.is_empty())
                .map(str::to_owned)
                .or_else(|| {
                    claude
                        .mcp_config_path
                        .as_ref()
                        .map(|path| path.display().to_string())
                });
            match mcp {
                Some(path) => {
                    args.push("--mcp-config".to_owned());
                    args.push(path);
                }
                None => warn!("no MCP config path set; interactive claude session may lack MCP context"),
            }

            if let Some(turns) = claude.max_turns {
                args.push("--max-turns".to_owned());
                args.push(turns.to_string());
            }
            args.extend(client_args);
            (claude.program.clone(), args)
        }
        "codex" => {
            let mut args = Vec::new();
            if let Some(sub) = subcommand {
                args.push(sub.to_owned());
            }
            let overrides = request
                .config_overrides
                .as_ref()
                .map(crate::ws::messages::StringOrList::entries)
                .unwrap_or_default();
            for entry in overrides {
                args.push("-c".to_owned());
                args.push(entry);
            }
            args.extend(client_args);
            (config.codex.program.clone(), args)
        }
        other => (other.to_owned(), client_args.collect()),
    };

    Some(CommandSpec { id, program, args })
}

/// `--debug` with an optional filter; `"1"` and `"true"` mean no filter.
pub(crate) fn push_debug_flag(args: &mut Vec<String>, debug: Option<&str>) {
    let Some(value) = debug.map(str::trim).filter(|v| !v.is_empty()) else {
        return;
    };
    args.push("--debug".to_owned());
    if value != "1" && !value.eq_ignore_ascii_case("true") {
        args.push(value.to_owned());
    }
}
