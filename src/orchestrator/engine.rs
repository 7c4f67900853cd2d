//! Task engine: submission, supervision and state of batch agent runs.
//!
//! Each submitted task is supervised by one tokio task that owns the child
//! process. Output chunks are folded into the shared task table under a
//! short, await-free lock; status changes are published on a per-task
//! `watch` channel so callers can wait for completion.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{BytesCodec, FramedRead};
use tracing::{info, info_span, warn, Instrument};

use super::args::{
    claude_chat_invocation, claude_invocation, codex_invocation, Invocation, OutputMode,
};
use super::heartbeat::{Heartbeat, HeartbeatSample};
use super::output::{ChunkDecoder, LineSplitter};
use super::request::{ClaudeTaskRequest, CodexTaskRequest, ExternalTaskRequest};
use super::stream::{parse_final_json, ClaudeStreamAccumulator, CodexAccumulator, FinalJson};
use crate::config::GlobalConfig;
use crate::models::task::{OutputStream, Priority, Task, TaskKind, TaskStats, TaskStatus};
use crate::persistence::{PersistHandle, PersistedSnapshot, SnapshotSource};
use crate::{AppError, Result};

#[derive(Debug)]
struct TaskEntry {
    task: Task,
    status_tx: watch::Sender<TaskStatus>,
    heartbeat: Option<Heartbeat>,
}

impl TaskEntry {
    fn new(task: Task) -> Self {
        let (status_tx, _) = watch::channel(task.status);
        Self {
            task,
            status_tx,
            heartbeat: None,
        }
    }
}

#[derive(Debug)]
struct TaskTable {
    tasks: BTreeMap<String, TaskEntry>,
    next_id: u64,
    persisted_at: Option<DateTime<Utc>>,
}

/// Owner of every task record.
#[derive(Debug)]
pub struct TaskEngine {
    config: Arc<GlobalConfig>,
    table: Mutex<TaskTable>,
    persist: PersistHandle,
}

impl TaskEngine {
    /// Empty engine. `persist` receives a request after every mutation.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, persist: PersistHandle) -> Self {
        let next_id = config.tasks.first_task_id.max(1);
        Self {
            config,
            table: Mutex::new(TaskTable {
                tasks: BTreeMap::new(),
                next_id,
                persisted_at: None,
            }),
            persist,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load a persisted snapshot. Returns the number of tasks restored.
    pub fn rehydrate(&self, snapshot: PersistedSnapshot) -> usize {
        let persisted_at = snapshot.saved_at;
        let (tasks, next_id) = snapshot.restore(self.config.tasks.first_task_id, Utc::now());
        let restored = tasks.len();

        let mut table = self.lock();
        for task in tasks {
            table.tasks.insert(task.id.clone(), TaskEntry::new(task));
        }
        table.next_id = table.next_id.max(next_id);
        table.persisted_at = persisted_at;
        drop(table);

        info!(restored, next_id, "tasks rehydrated");
        restored
    }

    /// Start a Claude headless run.
    ///
    /// A configured MCP config path that does not exist yields a `failed`
    /// task without spawning anything.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rejected` for an empty prompt and
    /// `AppError::Config` when no MCP config path is configured at all.
    pub fn submit_claude(self: &Arc<Self>, request: ClaudeTaskRequest) -> Result<Task> {
        require_prompt(&request.prompt)?;

        let mcp_config = request
            .mcp_config_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.config.claude.mcp_config_path.clone())
            .ok_or_else(|| {
                AppError::Config(
                    "mcpConfigPath is required (set claude.mcp_config_path or CLAUDE_MCP_CONFIG_PATH)"
                        .into(),
                )
            })?;

        let invocation = claude_invocation(&self.config.claude, &request, &mcp_config);
        let mut task = self.new_task(&request.prompt, &invocation, TaskKind::ClaudeCli);
        task.provider = Some("claude".into());
        task.importance = Priority::normalize(request.importance.as_deref());
        task.urgency = Priority::normalize(request.urgency.as_deref());

        if !mcp_config.exists() {
            let message = format!("ERROR: MCP config file not found at {}", mcp_config.display());
            warn!(task_id = %task.id, path = %mcp_config.display(), "mcp config missing; task not started");
            task.fail(&message, Utc::now());
            self.insert(task.clone());
            self.persist.flush_now();
            return Ok(task);
        }

        let cwd = request.cwd.or_else(|| self.config.tasks.working_dir.clone());
        self.insert(task.clone());
        self.persist.schedule();
        self.launch(task.id.clone(), invocation, cwd);
        Ok(task)
    }

    /// Start a synchronous Claude chat run. Callers wait on
    /// [`TaskEngine::wait_terminal`] for the reply.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rejected` for an empty prompt and `AppError::Task`
    /// when no MCP config file exists; no task is recorded then.
    pub fn submit_claude_chat(self: &Arc<Self>, request: ClaudeTaskRequest) -> Result<Task> {
        require_prompt(&request.prompt)?;

        let mcp_config = request
            .mcp_config_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .or_else(|| self.config.claude.mcp_config_path.clone())
            .filter(|path| path.exists())
            .ok_or_else(|| AppError::Task("MCP configuration not found".into()))?;

        let invocation = claude_chat_invocation(&self.config.claude, &request.prompt, &mcp_config);
        let mut task = self.new_task(&request.prompt, &invocation, TaskKind::ClaudeChat);
        task.provider = Some("claude".into());
        task.importance = Priority::normalize(request.importance.as_deref());
        task.urgency = Priority::normalize(request.urgency.as_deref());

        let cwd = request.cwd.or_else(|| self.config.tasks.working_dir.clone());
        self.insert(task.clone());
        self.persist.schedule();
        self.launch(task.id.clone(), invocation, cwd);
        Ok(task)
    }

    /// Start `codex exec --json`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rejected` for an empty prompt.
    pub fn submit_codex(self: &Arc<Self>, request: CodexTaskRequest) -> Result<Task> {
        require_prompt(&request.prompt)?;

        let invocation = codex_invocation(&self.config.codex, &request);
        let mut task = self.new_task(&request.prompt, &invocation, TaskKind::CodexExec);
        task.provider = Some("codex".into());
        task.model.clone_from(&invocation.model);
        task.importance = Priority::normalize(request.importance.as_deref());
        task.urgency = Priority::normalize(request.urgency.as_deref());

        let cwd = request.cwd.or_else(|| self.config.tasks.working_dir.clone());
        self.insert(task.clone());
        self.persist.schedule();
        self.launch(task.id.clone(), invocation, cwd);
        Ok(task)
    }

    /// Record a task run by an executor outside this process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Rejected` for an empty prompt.
    pub fn register_external(&self, request: ExternalTaskRequest) -> Result<Task> {
        require_prompt(&request.prompt)?;
        let now = Utc::now();
        let id = self.allocate_id();
        let command = request.command.unwrap_or_default();
        let mut task = Task::new(id, request.prompt, command, TaskKind::External, now);
        task.provider = request.provider;
        task.model = request.model;
        task.importance = Priority::normalize(request.importance.as_deref());
        task.urgency = Priority::normalize(request.urgency.as_deref());
        task.mark_external(now);

        info!(task_id = %task.id, "external task registered");
        self.insert(task.clone());
        self.persist.schedule();
        Ok(task)
    }

    /// Close an external task with the executor's outcome.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id and `AppError::Rejected`
    /// if the task is not in `external` status.
    pub fn finish_external(
        &self,
        id: &str,
        exit_code: Option<i32>,
        result_text: Option<String>,
    ) -> Result<Task> {
        let task = self
            .update(id, |task, now| {
                if task.status != TaskStatus::External {
                    return Err(AppError::Rejected(format!(
                        "task {id} is {}, not external",
                        task.status.as_str()
                    )));
                }
                if let Some(text) = result_text {
                    task.push_log(&text, now);
                    task.result_text = Some(text);
                }
                task.finish(exit_code, now);
                Ok(task.clone())
            })
            .ok_or_else(|| AppError::NotFound(format!("task {id}")))??;
        self.persist.flush_now();
        Ok(task)
    }

    /// Set or clear the manual done flag.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id and `AppError::Rejected`
    /// for completed tasks.
    pub fn mark_done(&self, id: &str, done: bool) -> Result<Task> {
        let task = self
            .update(id, |task, now| {
                if task.set_manual_done(done, now) {
                    Ok(task.clone())
                } else {
                    Err(AppError::Rejected(format!("task {id} is already completed")))
                }
            })
            .ok_or_else(|| AppError::NotFound(format!("task {id}")))??;
        self.persist.schedule();
        Ok(task)
    }

    /// Copy of one task.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().tasks.get(id).map(|entry| entry.task.clone())
    }

    /// All tasks, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .lock()
            .tasks
            .values()
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| id_order(&a.id).cmp(&id_order(&b.id)))
        });
        tasks
    }

    /// Counts per status.
    #[must_use]
    pub fn stats(&self) -> TaskStats {
        TaskStats::tally(self.lock().tasks.values().map(|entry| &entry.task))
    }

    /// Time of the last successful snapshot write.
    #[must_use]
    pub fn persisted_at(&self) -> Option<DateTime<Utc>> {
        self.lock().persisted_at
    }

    /// Wait until the task reaches `completed` or `failed`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id.
    pub async fn wait_terminal(&self, id: &str) -> Result<Task> {
        let mut status_rx = self
            .lock()
            .tasks
            .get(id)
            .map(|entry| entry.status_tx.subscribe())
            .ok_or_else(|| AppError::NotFound(format!("task {id}")))?;

        status_rx
            .wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| AppError::Task(format!("task {id} status channel closed")))?;

        self.get(id)
            .ok_or_else(|| AppError::NotFound(format!("task {id}")))
    }

    fn allocate_id(&self) -> String {
        let mut table = self.lock();
        let id = table.next_id;
        table.next_id = id.saturating_add(1);
        id.to_string()
    }

    /// Spawned runs are reported as `running` from submission on; the pid
    /// is attached once the child starts.
    fn new_task(&self, prompt: &str, invocation: &Invocation, kind: TaskKind) -> Task {
        let now = Utc::now();
        let mut task = Task::new(
            self.allocate_id(),
            prompt.to_owned(),
            invocation.display(),
            kind,
            now,
        );
        task.mark_running(None, now);
        task.model.clone_from(&invocation.model);
        task
    }

    fn insert(&self, task: Task) {
        self.lock()
            .tasks
            .insert(task.id.clone(), TaskEntry::new(task));
    }

    /// Mutate one task under the lock. Publishes status changes and stops
    /// the heartbeat once the task is terminal.
    fn update<R>(&self, id: &str, apply: impl FnOnce(&mut Task, DateTime<Utc>) -> R) -> Option<R> {
        let mut table = self.lock();
        let entry = table.tasks.get_mut(id)?;
        let before = entry.task.status;
        let result = apply(&mut entry.task, Utc::now());
        let after = entry.task.status;
        if after != before {
            entry.status_tx.send_replace(after);
        }
        if after.is_terminal() {
            entry.heartbeat = None;
        }
        Some(result)
    }

    fn launch(self: &Arc<Self>, task_id: String, invocation: Invocation, cwd: Option<PathBuf>) {
        let engine = Arc::clone(self);
        let span = info_span!("task", task_id = %task_id, program = %invocation.program);
        tokio::spawn(async move { engine.supervise(task_id, invocation, cwd).await }.instrument(span));
    }

    async fn supervise(self: Arc<Self>, task_id: String, invocation: Invocation, cwd: Option<PathBuf>) {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = cwd {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(%err, "task spawn failed");
                let message = format!("Failed to start {}: {err}", invocation.program);
                self.update(&task_id, |task, now| task.fail(&message, now));
                self.persist.flush_now();
                return;
            }
        };

        let pid = child.id();
        self.update(&task_id, |task, now| task.attach_pid(pid, now));
        self.persist.schedule();
        info!(pid = ?pid, command = %invocation.display(), "task started");
        self.start_heartbeat(&task_id);

        let (chunk_tx, mut chunk_rx) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_chunks(stdout, OutputStream::Stdout, chunk_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_chunks(stderr, OutputStream::Stderr, chunk_tx.clone()));
        }
        drop(chunk_tx);

        let mut pipeline = OutputPipeline::new(invocation.output_mode);
        while let Some((stream, chunk)) = chunk_rx.recv().await {
            self.update(&task_id, |task, now| pipeline.on_chunk(task, stream, &chunk, now));
            self.persist.schedule();
        }

        match child.wait().await {
            Ok(status) => {
                let exit_code = status.code();
                info!(exit_code = ?exit_code, "task exited");
                self.update(&task_id, |task, now| {
                    pipeline.on_exit(task, &invocation, exit_code, now);
                    task.finish(exit_code, now);
                });
            }
            Err(err) => {
                warn!(%err, "task wait failed");
                let message = format!("Failed to wait for {}: {err}", invocation.program);
                self.update(&task_id, |task, now| task.fail(&message, now));
            }
        }
        self.persist.flush_now();
    }

    fn start_heartbeat(self: &Arc<Self>, task_id: &str) {
        let Some(interval) = self.config.tasks.heartbeat_interval() else {
            return;
        };
        let engine: Weak<Self> = Arc::downgrade(self);
        let id = task_id.to_owned();
        let heartbeat = Heartbeat::spawn(task_id.to_owned(), interval, move || {
            let engine = engine.upgrade()?;
            let table = engine.lock();
            let task = &table.tasks.get(&id)?.task;
            (task.status == TaskStatus::Running).then(|| HeartbeatSample {
                status: task.status.as_str(),
                idle_ms: task.idle_ms(Utc::now()),
                pid: task.pid,
                stdout_bytes: task.stdout_bytes,
                stderr_bytes: task.stderr_bytes,
            })
        });

        let mut table = self.lock();
        if let Some(entry) = table.tasks.get_mut(task_id) {
            if !entry.task.status.is_terminal() {
                entry.heartbeat = Some(heartbeat);
            }
        }
    }
}

impl SnapshotSource for TaskEngine {
    fn capture(&self, saved_at: DateTime<Utc>) -> PersistedSnapshot {
        let table = self.lock();
        PersistedSnapshot::capture(
            table.next_id,
            table.tasks.values().map(|entry| &entry.task),
            saved_at,
        )
    }

    fn mark_persisted(&self, saved_at: DateTime<Utc>) {
        self.lock().persisted_at = Some(saved_at);
    }
}

fn require_prompt(prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(AppError::Rejected("prompt is required".into()));
    }
    Ok(())
}

fn exit_label(exit_code: Option<i32>) -> String {
    exit_code.map_or_else(|| "signal".to_owned(), |code| code.to_string())
}

fn id_order(id: &str) -> (u64, &str) {
    (id.parse().unwrap_or(u64::MAX), id)
}

async fn forward_chunks<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, bytes::BytesMut)>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(reader, BytesCodec::new());
    while let Some(chunk) = frames.next().await {
        match chunk {
            Ok(chunk) => {
                if tx.send((stream, chunk)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(?stream, %err, "task output read failed");
                break;
            }
        }
    }
}

/// Per-task output interpretation for one [`OutputMode`].
#[derive(Debug)]
struct OutputPipeline {
    mode: OutputMode,
    stdout: ChunkDecoder,
    stderr: ChunkDecoder,
    lines: LineSplitter,
    codex: CodexAccumulator,
    claude: ClaudeStreamAccumulator,
}

impl OutputPipeline {
    fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            stdout: ChunkDecoder::new(),
            stderr: ChunkDecoder::new(),
            lines: LineSplitter::new(),
            codex: CodexAccumulator::new(),
            claude: ClaudeStreamAccumulator::new(),
        }
    }

    fn on_chunk(&mut self, task: &mut Task, stream: OutputStream, chunk: &[u8], now: DateTime<Utc>) {
        let text = match stream {
            OutputStream::Stdout => self.stdout.decode(chunk),
            OutputStream::Stderr => self.stderr.decode(chunk),
        };
        self.on_text(task, stream, &text, chunk.len(), now);
    }

    fn on_text(
        &mut self,
        task: &mut Task,
        stream: OutputStream,
        text: &str,
        byte_len: usize,
        now: DateTime<Utc>,
    ) {
        task.record_stream(stream, text, byte_len, now);
        match (self.mode, stream) {
            (OutputMode::CodexStream, OutputStream::Stdout) => {
                for line in self.lines.push(text) {
                    self.codex_line(task, &line, now);
                }
            }
            (OutputMode::CodexStream, OutputStream::Stderr) => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    task.push_log(&format!("[CODEX STDERR] {trimmed}\n"), now);
                }
            }
            (OutputMode::ClaudeChat, OutputStream::Stdout) => {
                for line in self.lines.push(text) {
                    self.chat_line(task, &line, now);
                }
            }
            (OutputMode::ClaudeChat, OutputStream::Stderr) => {}
            (OutputMode::ClaudeStream, OutputStream::Stdout) => {
                task.push_log(text, now);
                for line in self.lines.push(text) {
                    self.claude.handle_line(&line);
                }
            }
            _ => task.push_log(text, now),
        }
    }

    fn chat_line(&mut self, task: &mut Task, line: &str, now: DateTime<Utc>) {
        for block in self.claude.handle_line(line) {
            task.push_log(&format!("[CLAUDE CHAT] {block}"), now);
        }
    }

    fn codex_line(&mut self, task: &mut Task, line: &str, now: DateTime<Utc>) {
        for entry in self.codex.handle_line(line) {
            task.push_log(&format!("{entry}\n"), now);
        }
    }

    fn on_exit(
        &mut self,
        task: &mut Task,
        invocation: &Invocation,
        exit_code: Option<i32>,
        now: DateTime<Utc>,
    ) {
        let stdout_rest = self.stdout.finish();
        if !stdout_rest.is_empty() {
            self.on_text(task, OutputStream::Stdout, &stdout_rest, 0, now);
        }
        let stderr_rest = self.stderr.finish();
        if !stderr_rest.is_empty() {
            self.on_text(task, OutputStream::Stderr, &stderr_rest, 0, now);
        }
        let last_line = self.lines.finish();

        match self.mode {
            OutputMode::Raw => {}
            OutputMode::FinalJson => match parse_final_json(&task.stdout) {
                FinalJson::Parsed { meta, text } => {
                    task.result_meta = Some(meta);
                    if let Some(text) = text {
                        task.push_log(&format!("\n[AI Result]\n{text}\n"), now);
                        task.result_text = Some(text);
                    }
                }
                FinalJson::Invalid(err) => {
                    warn!(%err, "final result is not valid json");
                    task.push_log(&format!("[AI Result] could not parse JSON output: {err}\n"), now);
                }
                FinalJson::Absent => {}
            },
            OutputMode::ClaudeStream => {
                if let Some(line) = last_line {
                    self.claude.handle_line(&line);
                }
                let (text, meta) = self.claude.finish();
                task.result_meta = meta;
                if let Some(text) = text {
                    task.push_log(&format!("\n[AI Result]\n{text}\n"), now);
                    task.result_text = Some(text);
                }
            }
            OutputMode::ClaudeChat => {
                if let Some(line) = last_line {
                    self.chat_line(task, &line, now);
                }
                if exit_code == Some(0) {
                    task.result_text = Some(self.claude.assistant_response());
                    task.result_meta = Some(self.claude.chat_meta());
                } else {
                    let message = format!("[ERROR] Claude exited with code {}", exit_label(exit_code));
                    task.push_log(&message, now);
                }
            }
            OutputMode::CodexStream => {
                if let Some(line) = last_line {
                    self.codex_line(task, &line, now);
                }
                info!(events = self.codex.event_count(), "codex stream closed");
                if exit_code != Some(0) {
                    self.codex
                        .push_error(format!("Codex exited with code {}", exit_label(exit_code)));
                }
                task.result_text = self.codex.result_text();
                task.result_meta = Some(self.codex.result_meta(invocation, exit_code));
            }
        }
    }
}
