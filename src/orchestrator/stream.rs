//! Structured output accumulators for the JSON output modes.
//!
//! Each accumulator consumes complete stdout lines (see
//! [`LineSplitter`](crate::orchestrator::output::LineSplitter)) in emission
//! order and builds up the task's `resultText` and `resultMeta`.

use serde_json::{json, Map, Value};

use crate::orchestrator::args::Invocation;

/// Pull display text out of a loosely-shaped payload.
///
/// Strings are returned as-is, arrays are joined by newlines, and objects
/// yield their `text`, `content` or `message` field.
#[must_use]
pub fn extract_text(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(extract_text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                text.clone()
            } else if let Some(content @ Value::Array(_)) = map.get("content") {
                extract_text(content)
            } else if let Some(Value::String(message)) = map.get("message") {
                message.clone()
            } else {
                String::new()
            }
        }
        _ => String::new(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::String(text) => !text.is_empty(),
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// First truthy field among `keys`, falling back to `msg` itself.
fn pick<'a>(msg: &'a Value, keys: &[&str]) -> &'a Value {
    keys.iter()
        .filter_map(|key| msg.get(*key))
        .find(|value| is_truthy(value))
        .unwrap_or(msg)
}

/// Accumulates `codex exec --json` events.
#[derive(Debug, Default)]
pub struct CodexAccumulator {
    assistant_messages: Vec<String>,
    reasoning: Vec<String>,
    errors: Vec<String>,
    last_token_info: Option<Value>,
    events: usize,
}

impl CodexAccumulator {
    /// Fresh accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one stdout line; returns the log lines it produces.
    ///
    /// Lines that are not JSON are kept verbatim as log lines.
    pub fn handle_line(&mut self, line: &str) -> Vec<String> {
        match serde_json::from_str::<Value>(line) {
            Ok(event) => self.handle_event(&event).into_iter().collect(),
            Err(_) => vec![line.to_owned()],
        }
    }

    fn handle_event(&mut self, event: &Value) -> Option<String> {
        self.events += 1;
        let msg = event.get("msg").filter(|msg| msg.is_object())?;
        let kind = msg.get("type").and_then(Value::as_str).unwrap_or_default();

        match kind {
            "agent_message" => {
                let text = extract_text(pick(msg, &["message", "text"]));
                (!text.is_empty()).then(|| {
                    self.assistant_messages.push(text.clone());
                    format!("[CODEX CHAT] {text}")
                })
            }
            "agent_reasoning" | "agent_thought" | "agent_reasoning_section_break" => {
                let text = extract_text(pick(msg, &["text", "message"]));
                (!text.is_empty()).then(|| {
                    self.reasoning.push(text.clone());
                    format!("[CODEX REASONING] {text}")
                })
            }
            "task_started" => Some("[CODEX] Task started".to_owned()),
            "command_started" => {
                let command = msg.get("command").map(value_display).unwrap_or_default();
                let mut text = format!("Command: {command}");
                if let Some(description) = msg
                    .get("description")
                    .filter(|value| is_truthy(value))
                    .map(value_display)
                {
                    text.push_str(&format!(" | Description: {description}"));
                }
                Some(format!("[CODEX COMMAND] {text}"))
            }
            "command_output" => {
                let text = extract_text(pick(msg, &["output", "text"]));
                (!text.is_empty()).then(|| format!("[CODEX OUTPUT] {text}"))
            }
            "command_completed" => {
                let text = extract_text(pick(msg, &["summary", "output"]));
                (!text.is_empty()).then(|| format!("[CODEX COMMAND DONE] {text}"))
            }
            "token_count" => {
                self.last_token_info = Some(pick(msg, &["info"]).clone());
                None
            }
            "error" => {
                let text = extract_text(pick(msg, &["message"]));
                (!text.is_empty()).then(|| {
                    self.errors.push(text.clone());
                    format!("[CODEX ERROR] {text}")
                })
            }
            "result" => {
                let text = extract_text(pick(msg, &["output", "text", "result"]));
                (!text.is_empty()).then(|| {
                    self.assistant_messages.push(text.clone());
                    format!("[CODEX RESULT] {text}")
                })
            }
            other => {
                let payload = ["message", "text"]
                    .iter()
                    .filter_map(|key| msg.get(*key))
                    .find(|value| is_truthy(value))?;
                let text = extract_text(payload);
                (!text.is_empty()).then(|| format!("[CODEX {other}] {text}"))
            }
        }
    }

    /// Record a failure that did not come from the event stream.
    pub fn push_error(&mut self, message: String) {
        self.errors.push(message);
    }

    /// Number of JSON events consumed.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events
    }

    /// Assistant messages joined by newlines, if any.
    #[must_use]
    pub fn result_text(&self) -> Option<String> {
        let joined = self.assistant_messages.join("\n");
        let trimmed = joined.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_owned())
    }

    /// `resultMeta` for the finished task.
    #[must_use]
    pub fn result_meta(&self, invocation: &Invocation, exit_code: Option<i32>) -> Value {
        let mut meta = json!({
            "provider": "codex",
            "model": invocation.model,
            "profile": invocation.profile,
            "sandbox": invocation.sandbox,
            "token_usage": self.last_token_info,
            "exit_code": exit_code,
        });
        if let Some(map) = meta.as_object_mut() {
            if !self.errors.is_empty() {
                map.insert("errors".into(), json!(self.errors));
            }
            if !self.reasoning.is_empty() {
                map.insert("reasoning".into(), json!(self.reasoning));
            }
        }
        meta
    }
}

fn value_display(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

const CHAT_META_KEYS: &[&str] = &[
    "num_turns",
    "duration_ms",
    "duration_api_ms",
    "is_error",
    "total_cost_usd",
    "usage",
    "session_id",
];

fn assistant_blocks(event: &Value) -> Vec<String> {
    match event.get("message").and_then(|message| message.get("content")) {
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str).unwrap_or("text") == "text")
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .filter(|text| !text.trim().is_empty())
            .map(str::to_owned)
            .collect(),
        Some(other) => {
            let text = extract_text(other);
            if text.trim().is_empty() {
                Vec::new()
            } else {
                vec![text]
            }
        }
        None => Vec::new(),
    }
}

/// Accumulates Claude `stream-json` events.
///
/// `assistant` events contribute their text blocks; the closing `result`
/// event becomes `resultMeta` and its `result` string wins as `resultText`.
#[derive(Debug, Default)]
pub struct ClaudeStreamAccumulator {
    assistant_text: Vec<String>,
    result_event: Option<Value>,
}

impl ClaudeStreamAccumulator {
    /// Fresh accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one stdout line and return the assistant text blocks it
    /// carried. Non-JSON lines are ignored; raw chunks are already logged
    /// by the caller.
    pub fn handle_line(&mut self, line: &str) -> Vec<String> {
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            return Vec::new();
        };
        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                let blocks = assistant_blocks(&event);
                self.assistant_text.extend(blocks.iter().cloned());
                blocks
            }
            Some("result") => {
                self.result_event = Some(event);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    /// All assistant text seen so far, joined and trimmed.
    #[must_use]
    pub fn assistant_response(&self) -> String {
        self.assistant_text.join("\n").trim().to_owned()
    }

    /// Summary fields of the `result` event, for chat replies.
    #[must_use]
    pub fn chat_meta(&self) -> Value {
        let mut meta = Map::new();
        if let Some(ref event) = self.result_event {
            for key in CHAT_META_KEYS {
                if let Some(value) = event.get(*key) {
                    meta.insert((*key).to_owned(), value.clone());
                }
            }
        }
        Value::Object(meta)
    }

    /// Final `(resultText, resultMeta)`.
    #[must_use]
    pub fn finish(&self) -> (Option<String>, Option<Value>) {
        let from_result = self
            .result_event
            .as_ref()
            .and_then(|event| event.get("result"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_owned);
        let text = from_result.or_else(|| {
            let joined = self.assistant_response();
            (!joined.is_empty()).then_some(joined)
        });
        (text, self.result_event.clone())
    }
}

/// Outcome of parsing a `json` output-format stdout at exit.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalJson {
    /// Stdout did not look like a JSON object.
    Absent,
    /// Parsed; `text` is the assistant-visible result, if any.
    Parsed {
        /// Whole object.
        meta: Value,
        /// `result` string, or joined message contents.
        text: Option<String>,
    },
    /// Looked like JSON but failed to parse.
    Invalid(String),
}

/// Parse the single JSON object a `--output-format json` run prints.
#[must_use]
pub fn parse_final_json(stdout: &str) -> FinalJson {
    let trimmed = stdout.trim();
    if !trimmed.starts_with('{') {
        return FinalJson::Absent;
    }
    let parsed: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(err) => return FinalJson::Invalid(err.to_string()),
    };

    let text = if let Some(result) = parsed.get("result").and_then(Value::as_str) {
        Some(result.to_owned())
    } else if let Some(Value::Array(messages)) = parsed.get("messages") {
        let joined = messages
            .iter()
            .map(message_text)
            .collect::<Vec<_>>()
            .join("\n");
        Some(joined.trim().to_owned())
    } else {
        None
    };

    FinalJson::Parsed {
        meta: parsed,
        text: text.filter(|text| !text.is_empty()),
    }
}

fn message_text(message: &Value) -> String {
    match message.get("content") {
        Some(Value::Array(entries)) => entries
            .iter()
            .map(|entry| {
                entry
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned()
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::String(content)) => content.clone(),
        _ => message
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
    }
}
