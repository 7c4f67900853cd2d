#![forbid(unsafe_code)]

//! `agent-console-pty` — PTY helper spawned once per interactive session.
//!
//! Runs the target command inside a pseudo-terminal and speaks the
//! newline-delimited JSON helper protocol on its own stdio: control
//! messages arrive on stdin, output and lifecycle messages leave on
//! stdout. Diagnostics go to stderr only.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use agent_console::pty::codec::{Decoded, HelperCodec};
use agent_console::pty::protocol::{ControlMessage, HelperMessage};
use agent_console::{AppError, Result};

const READ_CHUNK_BYTES: usize = 4096;

/// Time allowed for trailing PTY output after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Parser)]
#[command(name = "agent-console-pty", about = "PTY helper for agent-console", version)]
struct Cli {
    /// Working directory for the command.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Terminal columns.
    #[arg(long, default_value_t = 120)]
    cols: u16,

    /// Terminal rows.
    #[arg(long, default_value_t = 30)]
    rows: u16,

    /// Log protocol diagnostics to stderr.
    #[arg(long)]
    debug: bool,

    /// Command and arguments, after `--`.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?;
    let result = runtime.block_on(run(args));
    // Blocking stdin and pty reads never return on their own.
    runtime.shutdown_timeout(SHUTDOWN_TIMEOUT);
    result
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}

async fn run(args: Cli) -> Result<()> {
    let (out_tx, out_rx) = mpsc::channel::<HelperMessage>(256);
    let writer = tokio::spawn(write_messages(out_rx));

    let session = match open_session(&args) {
        Ok(session) => session,
        Err(err) => {
            error!(%err, "failed to start command");
            let _ = out_tx
                .send(HelperMessage::Error {
                    message: err.to_string(),
                    code: Some("spawn_failed".into()),
                })
                .await;
            drop(out_tx);
            let _ = writer.await;
            return Err(err);
        }
    };
    let PtySession {
        master,
        child,
        reader,
        writer: pty_writer,
    } = session;

    let pid = child.process_id();
    let _ = out_tx.send(HelperMessage::Ready { pid }).await;

    let output = tokio::task::spawn_blocking({
        let out_tx = out_tx.clone();
        move || pump_output(reader, &out_tx)
    });
    let exited = wait_child(child);

    let control = Control {
        master,
        writer: pty_writer,
        pid,
        out_tx: out_tx.clone(),
        debug: args.debug,
    };
    let exit = control.run(exited).await;

    if tokio::time::timeout(DRAIN_TIMEOUT, output).await.is_err() {
        debug!("pty output still open after child exit");
    }
    let _ = out_tx.send(exit).await;
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

// ── PTY setup ───────────────────────────────────────────

struct PtySession {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

fn open_session(args: &Cli) -> Result<PtySession> {
    let (program, rest) = args
        .command
        .split_first()
        .ok_or_else(|| AppError::Config("no command given".into()))?;

    let pair = native_pty_system()
        .openpty(PtySize {
            rows: args.rows,
            cols: args.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| AppError::Bridge(format!("failed to open pty: {err}")))?;

    let mut builder = CommandBuilder::new(program);
    builder.args(rest);
    if let Some(ref cwd) = args.cwd {
        builder.cwd(cwd);
    }
    if std::env::var_os("TERM").is_none() {
        builder.env("TERM", "xterm-256color");
    }

    let child = pair
        .slave
        .spawn_command(builder)
        .map_err(|err| AppError::Bridge(format!("failed to spawn {program}: {err}")))?;
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| AppError::Bridge(format!("failed to clone pty reader: {err}")))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|err| AppError::Bridge(format!("failed to take pty writer: {err}")))?;

    Ok(PtySession {
        master: pair.master,
        child,
        reader,
        writer,
    })
}

// ── Output ──────────────────────────────────────────────

async fn write_messages(mut rx: mpsc::Receiver<HelperMessage>) {
    let mut sink = FramedWrite::new(tokio::io::stdout(), HelperCodec::new());
    while let Some(message) = rx.recv().await {
        if let Err(err) = sink.send(message).await {
            debug!(%err, "stdout closed");
            break;
        }
    }
}

fn pump_output(mut reader: Box<dyn Read + Send>, out_tx: &mpsc::Sender<HelperMessage>) {
    let mut buf = [0u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let data = STANDARD.encode(&buf[..n]);
                if out_tx.blocking_send(HelperMessage::Output { data }).is_err() {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            // EIO once the slave side is gone.
            Err(err) => {
                debug!(%err, "pty read ended");
                break;
            }
        }
    }
}

fn wait_child(child: Box<dyn Child + Send + Sync>) -> oneshot::Receiver<HelperMessage> {
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let _ = tx.send(reap(child));
    });
    rx
}

/// Block until the child exits and describe how it ended.
#[cfg(unix)]
fn reap(mut child: Box<dyn Child + Send + Sync>) -> HelperMessage {
    use nix::errno::Errno;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::Pid;

    let Some(pid) = child.process_id().and_then(|pid| i32::try_from(pid).ok()) else {
        return reap_portable(child);
    };
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return HelperMessage::Exit {
                    exit_code: Some(code),
                    signal: None,
                };
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                return HelperMessage::Exit {
                    exit_code: None,
                    signal: Some(serde_json::Value::String(signal.as_str().to_owned())),
                };
            }
            Ok(_) | Err(Errno::EINTR) => {}
            Err(err) => {
                warn!(%err, pid, "waitpid failed");
                return HelperMessage::Exit {
                    exit_code: child
                        .try_wait()
                        .ok()
                        .flatten()
                        .and_then(|status| i32::try_from(status.exit_code()).ok()),
                    signal: None,
                };
            }
        }
    }
}

#[cfg(not(unix))]
fn reap(child: Box<dyn Child + Send + Sync>) -> HelperMessage {
    reap_portable(child)
}

fn reap_portable(mut child: Box<dyn Child + Send + Sync>) -> HelperMessage {
    match child.wait() {
        Ok(status) => HelperMessage::Exit {
            exit_code: i32::try_from(status.exit_code()).ok(),
            signal: None,
        },
        Err(err) => {
            warn!(%err, "failed to wait for child");
            HelperMessage::Exit {
                exit_code: None,
                signal: None,
            }
        }
    }
}

// ── Control ─────────────────────────────────────────────

struct Control {
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    pid: Option<u32>,
    out_tx: mpsc::Sender<HelperMessage>,
    debug: bool,
}

impl Control {
    /// Apply control messages until the child exits; returns the `exit` message.
    async fn run(mut self, mut exited: oneshot::Receiver<HelperMessage>) -> HelperMessage {
        let mut lines = FramedRead::new(tokio::io::stdin(), HelperCodec::new());
        let mut stdin_open = true;

        loop {
            tokio::select! {
                biased;
                exit = &mut exited => {
                    return exit.unwrap_or(HelperMessage::Exit { exit_code: None, signal: None });
                }
                line = lines.next(), if stdin_open => match line {
                    Some(Ok(Decoded::Message(message))) => self.apply(message).await,
                    Some(Ok(Decoded::Invalid { reason, preview })) => {
                        if self.debug {
                            warn!(%reason, line = %preview, "discarding unreadable control line");
                        }
                    }
                    Some(Err(err)) => {
                        warn!(%err, "stdin read failed, hanging up child");
                        stdin_open = false;
                        self.signal("SIGHUP");
                    }
                    None => {
                        debug!("stdin closed, hanging up child");
                        stdin_open = false;
                        self.signal("SIGHUP");
                    }
                },
            }
        }
    }

    async fn apply(&mut self, message: ControlMessage) {
        match message {
            ControlMessage::Input { encoding, data } => {
                let bytes = if encoding.as_deref() == Some("base64") {
                    match STANDARD.decode(data.as_bytes()) {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            warn!(%err, "invalid base64 input");
                            return;
                        }
                    }
                } else {
                    data.into_bytes()
                };
                if let Err(err) = self.writer.write_all(&bytes).and_then(|()| self.writer.flush()) {
                    warn!(%err, "failed to write to pty");
                }
            }
            ControlMessage::Resize { rows, cols } => {
                let Ok(current) = self.master.get_size() else {
                    return;
                };
                let size = PtySize {
                    rows: rows.unwrap_or(current.rows),
                    cols: cols.unwrap_or(current.cols),
                    ..current
                };
                if let Err(err) = self.master.resize(size) {
                    warn!(%err, "failed to resize pty");
                }
            }
            ControlMessage::Terminate { signal } => {
                self.signal(signal.as_deref().unwrap_or("SIGTERM"));
            }
            ControlMessage::Ping { ts } => {
                let _ = self.out_tx.send(HelperMessage::Pong { ts }).await;
            }
        }
    }

    #[cfg(unix)]
    fn signal(&self, name: &str) {
        use std::str::FromStr;

        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|pid| i32::try_from(pid).ok()) else {
            return;
        };
        let upper = name.trim().to_ascii_uppercase();
        let full = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        let signal = Signal::from_str(&full).unwrap_or(Signal::SIGTERM);
        if let Err(err) = kill(Pid::from_raw(pid), signal) {
            debug!(%err, pid, ?signal, "signal delivery failed");
        }
    }

    #[cfg(not(unix))]
    fn signal(&self, name: &str) {
        debug!(name, pid = ?self.pid, "signals are not supported on this platform");
    }
}
