//! Process bridge: one supervised helper process per interactive session.
//!
//! The helper owns the PTY; this side only speaks the line protocol in
//! [`crate::pty::protocol`]. Four tasks run per bridge:
//!
//! - a stdout reader turning helper lines into [`BridgeEvent`]s,
//! - a stderr reader keeping a bounded tail,
//! - a stdin writer draining [`ControlMessage`]s,
//! - an exit monitor that owns the [`Child`] and runs two-phase shutdown.
//!
//! Shutdown sends `terminate` first and force-kills the helper once the grace
//! period elapses. The kill timer lives inside the exit monitor's `select!`,
//! so it is dropped as soon as the helper exits on its own.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::pty::codec::{Decoded, ServerCodec};
use crate::pty::protocol::{ControlMessage, HelperLine, HelperMessage};
use crate::pty::writer::run_writer;
use crate::text::push_bounded_tail;
use crate::{AppError, Result};

/// Characters of helper stderr kept for diagnostics.
pub const STDERR_TAIL_CHARS: usize = 2000;

/// Capacity of the event and control channels.
const CHANNEL_CAPACITY: usize = 256;

/// How long the exit monitor waits for the stdout reader to drain after the
/// helper exits, so a helper-reported `exit` wins over the fallback.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything needed to launch a helper.
#[derive(Debug, Clone, Default)]
pub struct BridgeSpec {
    /// Helper executable.
    pub helper_program: String,
    /// Arguments placed before the argv contract.
    pub helper_args: Vec<String>,
    /// Working directory for the target command.
    pub cwd: Option<PathBuf>,
    /// Initial rows.
    pub rows: Option<u16>,
    /// Initial columns.
    pub cols: Option<u16>,
    /// Pass `--debug`.
    pub debug: bool,
    /// Target command.
    pub command: String,
    /// Target arguments.
    pub args: Vec<String>,
    /// Extra environment for the helper and its child.
    pub env: BTreeMap<String, String>,
    /// Delay between `terminate` and the forced kill.
    pub grace_period: Duration,
}

impl BridgeSpec {
    /// Helper argv: `[--cwd <dir>] [--cols N] [--rows N] [--debug] -- <command> [args...]`.
    #[must_use]
    pub fn helper_argv(&self) -> Vec<String> {
        let mut argv = self.helper_args.clone();
        if let Some(ref cwd) = self.cwd {
            argv.push("--cwd".into());
            argv.push(cwd.display().to_string());
        }
        if let Some(cols) = self.cols {
            argv.push("--cols".into());
            argv.push(cols.to_string());
        }
        if let Some(rows) = self.rows {
            argv.push("--rows".into());
            argv.push(rows.to_string());
        }
        if self.debug {
            argv.push("--debug".into());
        }
        argv.push("--".into());
        argv.push(self.command.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Typed events produced by a bridge, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The helper reported the command running.
    Ready {
        /// Child pid inside the PTY.
        pid: Option<u32>,
    },
    /// Terminal output.
    Output {
        /// Base64 exactly as the helper sent it.
        data: String,
        /// Decoded bytes.
        bytes: Bytes,
    },
    /// The session ended. Emitted at most once.
    Exit {
        /// Exit code.
        exit_code: Option<i32>,
        /// Terminating signal.
        signal: Option<Value>,
    },
    /// Recoverable failure (bad line, decode error, helper error message).
    Error {
        /// Description.
        message: String,
    },
    /// Answer to a ping.
    Pong {
        /// Echoed timestamp.
        ts: Option<Value>,
    },
    /// Unrecognised helper object.
    Debug(Value),
    /// Helper stderr text.
    Stderr(String),
}

#[derive(Debug, Default)]
struct BridgeFlags {
    alive: AtomicBool,
    exited: AtomicBool,
}

impl BridgeFlags {
    /// Mark exited; returns `true` only for the first caller.
    fn mark_exited(&self) -> bool {
        self.alive.store(false, Ordering::SeqCst);
        !self.exited.swap(true, Ordering::SeqCst)
    }
}

/// Handle to a running helper.
///
/// Dropping the handle disposes the session.
#[derive(Debug)]
pub struct ProcessBridge {
    id: String,
    flags: Arc<BridgeFlags>,
    stderr_tail: Arc<Mutex<String>>,
    control_tx: mpsc::Sender<ControlMessage>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ProcessBridge {
    /// Spawn the helper and start its supervision tasks.
    ///
    /// Returns the handle and the receiving end of its event stream.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bridge` if the helper cannot be spawned or its
    /// stdio cannot be captured.
    pub fn spawn(spec: BridgeSpec) -> Result<(Self, mpsc::Receiver<BridgeEvent>)> {
        let id = uuid::Uuid::new_v4().to_string();

        let mut cmd = Command::new(&spec.helper_program);
        cmd.args(spec.helper_argv())
            .envs(&spec.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Bridge(format!(
                "failed to spawn helper {}: {err}",
                spec.helper_program
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Bridge("failed to capture helper stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Bridge("failed to capture helper stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Bridge("failed to capture helper stderr".into()))?;

        let helper_pid = child.id();
        let flags = Arc::new(BridgeFlags::default());
        flags.alive.store(true, Ordering::SeqCst);
        let stderr_tail = Arc::new(Mutex::new(String::new()));

        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let span = info_span!("bridge", session_id = %id, command = %spec.command);
        info!(parent: &span, helper_pid, "helper spawned");

        let stdout_task = tokio::spawn(
            read_stdout(
                id.clone(),
                stdout,
                Arc::clone(&flags),
                event_tx.clone(),
                cancel.clone(),
            )
            .instrument(span.clone()),
        );

        tokio::spawn(
            read_stderr(
                stderr,
                Arc::clone(&stderr_tail),
                event_tx.clone(),
                cancel.clone(),
            )
            .instrument(span.clone()),
        );

        let writer_id = id.clone();
        let writer_cancel = cancel.clone();
        tokio::spawn(
            async move {
                if let Err(err) = run_writer(writer_id, stdin, control_rx, writer_cancel).await {
                    debug!(%err, "bridge writer stopped with error");
                }
            }
            .instrument(span.clone()),
        );

        tokio::spawn(
            monitor_exit(ExitMonitor {
                child,
                grace: spec.grace_period,
                flags: Arc::clone(&flags),
                event_tx,
                shutdown_rx,
                stdout_task,
                cancel,
            })
            .instrument(span),
        );

        let bridge = Self {
            id,
            flags,
            stderr_tail,
            control_tx,
            shutdown_tx: Some(shutdown_tx),
        };
        Ok((bridge, event_rx))
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The helper process is still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.flags.alive.load(Ordering::SeqCst)
    }

    /// Bounded tail of helper stderr.
    #[must_use]
    pub fn stderr_tail(&self) -> String {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forward bytes to the PTY. Empty input is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bridge` when the helper is no longer reading.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.send(ControlMessage::Input {
            encoding: Some("base64".into()),
            data: STANDARD.encode(bytes),
        })
        .await
    }

    /// Resize the PTY.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bridge` when the helper is no longer reading.
    pub async fn resize(&self, rows: Option<u16>, cols: Option<u16>) -> Result<()> {
        if rows.is_none() && cols.is_none() {
            return Ok(());
        }
        self.send(ControlMessage::Resize { rows, cols }).await
    }

    /// Ask the helper to deliver `signal` (default `SIGTERM`) to its child.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bridge` when the helper is no longer reading.
    pub async fn terminate(&self, signal: Option<&str>) -> Result<()> {
        self.send(ControlMessage::Terminate {
            signal: Some(signal.unwrap_or("SIGTERM").to_owned()),
        })
        .await
    }

    /// Probe the helper; the answer arrives as [`BridgeEvent::Pong`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bridge` when the helper is no longer reading.
    pub async fn ping(&self, ts: Option<Value>) -> Result<()> {
        self.send(ControlMessage::Ping { ts }).await
    }

    /// Request termination and arm the forced-kill timer. Idempotent.
    pub fn dispose(&mut self) {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return;
        };
        if self.is_alive() {
            let terminate = ControlMessage::Terminate {
                signal: Some("SIGTERM".into()),
            };
            if self.control_tx.try_send(terminate).is_err() {
                debug!(session_id = %self.id, "terminate not queued; relying on forced kill");
            }
        }
        // The monitor may already be gone when the helper has exited.
        let _ = shutdown_tx.send(());
    }

    async fn send(&self, msg: ControlMessage) -> Result<()> {
        if !self.is_alive() {
            return Err(AppError::Bridge("session is not running".into()));
        }
        self.control_tx
            .send(msg)
            .await
            .map_err(|_| AppError::Bridge("helper control channel closed".into()))
    }
}

impl Drop for ProcessBridge {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Translate one parsed helper line into a bridge event.
///
/// Exit lines are filtered through `flags` so at most one exit is emitted.
fn helper_line_to_event(line: HelperLine, flags: &BridgeFlags) -> Option<BridgeEvent> {
    let message = match line {
        HelperLine::Other(value) => return Some(BridgeEvent::Debug(value)),
        HelperLine::Message(message) => message,
    };

    match message {
        HelperMessage::Ready { pid } => Some(BridgeEvent::Ready { pid }),
        HelperMessage::Output { data } => match STANDARD.decode(data.as_bytes()) {
            Ok(bytes) => Some(BridgeEvent::Output {
                data,
                bytes: Bytes::from(bytes),
            }),
            Err(err) => Some(BridgeEvent::Error {
                message: format!("failed to decode output: {err}"),
            }),
        },
        HelperMessage::Exit { exit_code, signal } => flags
            .mark_exited()
            .then_some(BridgeEvent::Exit { exit_code, signal }),
        HelperMessage::Error { message, code } => Some(BridgeEvent::Error {
            message: code.map_or_else(|| message.clone(), |code| format!("{code}: {message}")),
        }),
        HelperMessage::Pong { ts } => Some(BridgeEvent::Pong { ts }),
    }
}

async fn read_stdout<R>(
    session_id: String,
    stdout: R,
    flags: Arc<BridgeFlags>,
    event_tx: mpsc::Sender<BridgeEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, ServerCodec::new());

    loop {
        let item = tokio::select! {
            () = cancel.cancelled() => break,
            item = framed.next() => item,
        };

        let event = match item {
            None => {
                debug!(session_id, "bridge reader: helper stdout closed");
                break;
            }
            Some(Err(err)) => {
                warn!(session_id, %err, "bridge reader: IO error, stopping");
                break;
            }
            Some(Ok(Decoded::Message(line))) => helper_line_to_event(line, &flags),
            Some(Ok(Decoded::Invalid { reason, preview })) => {
                warn!(session_id, error = %reason, raw_line = %preview, "bridge reader: malformed line");
                Some(BridgeEvent::Error { message: reason })
            }
        };

        if let Some(event) = event {
            if event_tx.send(event).await.is_err() {
                debug!(session_id, "bridge reader: event receiver dropped");
                break;
            }
        }
    }
}

async fn read_stderr<R>(
    mut stderr: R,
    tail: Arc<Mutex<String>>,
    event_tx: mpsc::Sender<BridgeEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; 4096];
    loop {
        let read = tokio::select! {
            () = cancel.cancelled() => break,
            read = stderr.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        let text = String::from_utf8_lossy(&buf[..n]).into_owned();
        debug!(stderr = %text.trim_end(), "helper stderr");
        {
            let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
            push_bounded_tail(&mut tail, &text, STDERR_TAIL_CHARS);
        }
        if event_tx.send(BridgeEvent::Stderr(text)).await.is_err() {
            break;
        }
    }
}

struct ExitMonitor {
    child: Child,
    grace: Duration,
    flags: Arc<BridgeFlags>,
    event_tx: mpsc::Sender<BridgeEvent>,
    shutdown_rx: oneshot::Receiver<()>,
    stdout_task: JoinHandle<()>,
    cancel: CancellationToken,
}

async fn monitor_exit(monitor: ExitMonitor) {
    let ExitMonitor {
        mut child,
        grace,
        flags,
        event_tx,
        mut shutdown_rx,
        stdout_task,
        cancel,
    } = monitor;

    let status = tokio::select! {
        status = child.wait() => status,
        // A dropped sender means the handle is gone; shut down the same way.
        _ = &mut shutdown_rx => {
            debug!(grace_ms = grace.as_millis(), "dispose requested, arming kill timer");
            tokio::select! {
                status = child.wait() => status,
                () = tokio::time::sleep(grace) => {
                    warn!("helper did not exit within grace period, killing");
                    if let Err(err) = child.kill().await {
                        warn!(%err, "failed to kill helper");
                    }
                    child.wait().await
                }
            }
        }
    };

    let (exit_code, signal) = match status {
        Ok(status) => (status.code(), exit_signal(&status)),
        Err(err) => {
            warn!(%err, "error waiting for helper process");
            (None, None)
        }
    };
    info!(exit_code, "helper exited");

    // Let a helper-reported exit line arrive before deciding on the fallback.
    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stdout_task)
        .await
        .is_err()
    {
        debug!("stdout reader still running after helper exit");
    }
    cancel.cancel();

    if flags.mark_exited() {
        let _ = event_tx.send(BridgeEvent::Exit { exit_code, signal }).await;
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<Value> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(Value::from)
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<Value> {
    None
}
