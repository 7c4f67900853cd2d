//! Per-connection actor for `/ws/pty`.
//!
//! One task owns the upgraded socket, the frame codec on both halves and at
//! most one [`ProcessBridge`]. Inbound frames, bridge events and registry
//! stop requests are multiplexed in a single `select!`, so bytes for the
//! connection are handled in arrival order and teardown is total: when the
//! loop ends, the bridge and its registry entry are dropped together.

use std::future::pending;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::pty::bridge::{BridgeEvent, BridgeSpec, ProcessBridge};
use crate::pty::commands::resolve_command;
use crate::pty::registry::{SessionGuard, SessionSummary};
use crate::pty::relay::{relay_event, SessionIdentity};
use crate::state::AppState;
use crate::ws::frame::{CloseCode, Frame, FrameCodec, FrameError, Opcode};
use crate::ws::messages::{ClientMessage, MessageError, ServerEvent, StartRequest};

/// Whether the read loop keeps going after handling one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

struct ActiveSession {
    bridge: ProcessBridge,
    events: mpsc::Receiver<BridgeEvent>,
    identity: SessionIdentity,
    // Dropped together with the bridge.
    guard: SessionGuard,
}

enum Step {
    Frame(Option<Result<Frame, FrameError>>),
    Bridge(Option<BridgeEvent>),
    Stop,
}

struct Connection<IO> {
    state: Arc<AppState>,
    connection_id: String,
    out: FramedWrite<WriteHalf<IO>, FrameCodec>,
    session: Option<ActiveSession>,
}

/// Drive one upgraded connection until it closes.
pub async fn run_connection<IO>(io: IO, state: Arc<AppState>, connection_id: String)
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let max_payload = state.config.sessions.max_message_bytes;
    let (read_half, write_half): (ReadHalf<IO>, WriteHalf<IO>) = tokio::io::split(io);
    let mut inbound = FramedRead::new(read_half, FrameCodec::new(max_payload));

    let mut conn = Connection {
        state,
        connection_id,
        out: FramedWrite::new(write_half, FrameCodec::new(max_payload)),
        session: None,
    };
    info!(connection_id = %conn.connection_id, "pty connection opened");

    loop {
        let stop = conn.session.as_ref().map(|s| s.guard.stop_token());
        let step = tokio::select! {
            frame = inbound.next() => Step::Frame(frame),
            event = next_bridge_event(&mut conn.session) => Step::Bridge(event),
            () = async move {
                match stop {
                    Some(token) => token.cancelled().await,
                    None => pending::<()>().await,
                }
            } => Step::Stop,
        };

        let flow = match step {
            Step::Frame(None) => {
                debug!(connection_id = %conn.connection_id, "peer closed the socket");
                Flow::Close
            }
            Step::Frame(Some(Err(FrameError::Violation { code, reason }))) => {
                warn!(
                    connection_id = %conn.connection_id,
                    close = code.code(),
                    %reason,
                    "inbound frame rejected"
                );
                let reply = if code == CloseCode::TooBig {
                    "message too big"
                } else {
                    reason.as_str()
                };
                conn.close(code, reply).await;
                Flow::Close
            }
            Step::Frame(Some(Err(err @ FrameError::Io(_)))) => {
                warn!(connection_id = %conn.connection_id, %err, "socket read failed");
                Flow::Close
            }
            Step::Frame(Some(Ok(frame))) => conn.handle_frame(frame).await,
            Step::Bridge(Some(event)) => conn.handle_bridge_event(event).await,
            Step::Bridge(None) => {
                debug!(connection_id = %conn.connection_id, "bridge event stream ended");
                conn.end_session();
                Flow::Continue
            }
            Step::Stop => {
                info!(connection_id = %conn.connection_id, "session stop requested");
                conn.end_session();
                Flow::Continue
            }
        };

        if flow == Flow::Close {
            break;
        }
    }

    conn.end_session();
    info!(connection_id = %conn.connection_id, "pty connection closed");
}

async fn next_bridge_event(session: &mut Option<ActiveSession>) -> Option<BridgeEvent> {
    match session {
        Some(active) => active.events.recv().await,
        None => pending().await,
    }
}

impl<IO> Connection<IO>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn handle_frame(&mut self, frame: Frame) -> Flow {
        if !frame.fin {
            self.close(CloseCode::ProtocolError, "fragmented frames are not supported")
                .await;
            return Flow::Close;
        }

        match frame.opcode {
            Opcode::Text => match std::str::from_utf8(&frame.payload) {
                Ok(text) => match ClientMessage::parse(text) {
                    Ok(message) => self.dispatch(message).await,
                    Err(err) => {
                        self.send_event(&ServerEvent::error(err.code())).await;
                        Flow::Continue
                    }
                },
                Err(_) => {
                    self.send_event(&ServerEvent::error(MessageError::InvalidJson.code()))
                        .await;
                    Flow::Continue
                }
            },
            Opcode::Binary => {
                self.forward_input(frame.payload.to_vec()).await;
                Flow::Continue
            }
            Opcode::Ping => {
                self.send_frame(Frame::pong(frame.payload)).await;
                Flow::Continue
            }
            Opcode::Pong => Flow::Continue,
            Opcode::Close => {
                self.close(CloseCode::Normal, "").await;
                Flow::Close
            }
            Opcode::Continuation | Opcode::Reserved(_) => {
                self.close(CloseCode::Unsupported, "unsupported opcode").await;
                Flow::Close
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Flow {
        match message {
            ClientMessage::Start(request) => {
                self.start(&request).await;
            }
            ClientMessage::Input {
                data,
                base64,
                append_newline,
            } => {
                let mut bytes = match (base64, data) {
                    (Some(encoded), _) => match STANDARD.decode(encoded.trim()) {
                        Ok(bytes) => bytes,
                        Err(_) => {
                            self.send_event(&ServerEvent::error("invalid_base64")).await;
                            return Flow::Continue;
                        }
                    },
                    (None, Some(text)) => text.into_bytes(),
                    (None, None) => Vec::new(),
                };
                bytes.truncate(self.state.config.sessions.max_input_bytes);
                if append_newline {
                    bytes.push(b'\r');
                }
                self.forward_input(bytes).await;
            }
            ClientMessage::Resize { rows, cols } => {
                if let Some(active) = self.require_session().await {
                    if let Err(err) = active.bridge.resize(rows, cols).await {
                        debug!(%err, "resize not delivered");
                    }
                }
            }
            ClientMessage::Terminate { signal } => {
                if let Some(active) = self.require_session().await {
                    if let Err(err) = active.bridge.terminate(signal.as_deref()).await {
                        debug!(%err, "terminate not delivered");
                    }
                }
            }
            ClientMessage::Ping { ts } => {
                let ts = ts
                    .filter(|ts| !ts.is_null())
                    .unwrap_or_else(|| Value::from(chrono::Utc::now().timestamp_millis()));
                // A live helper answers through the bridge as a pong event.
                if let Some(active) = self.session.as_ref().filter(|a| a.bridge.is_alive()) {
                    match active.bridge.ping(Some(ts.clone())).await {
                        Ok(()) => return Flow::Continue,
                        Err(err) => debug!(%err, "ping not delivered; answering locally"),
                    }
                }
                self.send_event(&ServerEvent::Pong { ts }).await;
            }
            ClientMessage::Close => {
                self.close(CloseCode::Normal, "").await;
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    async fn start(&mut self, request: &StartRequest) {
        if self.session.is_some() {
            self.send_event(&ServerEvent::error("session_already_started"))
                .await;
            return;
        }

        let config = Arc::clone(&self.state.config);
        let Some(command) = resolve_command(request, &config) else {
            self.send_event(&ServerEvent::error("unsupported_command")).await;
            return;
        };

        let spec = BridgeSpec {
            helper_program: config.sessions.helper_program.clone(),
            helper_args: config.sessions.helper_args.clone(),
            cwd: config.sessions.working_dir.clone(),
            rows: request.rows,
            cols: request.cols,
            debug: config.sessions.debug,
            command: command.program.clone(),
            args: command.args.clone(),
            env: request.string_env(),
            grace_period: config.sessions.grace_period(),
        };

        let (mut bridge, events) = match ProcessBridge::spawn(spec) {
            Ok(spawned) => spawned,
            Err(err) => {
                warn!(connection_id = %self.connection_id, %err, "failed to start session");
                self.send_event(&ServerEvent::error(err.to_string())).await;
                return;
            }
        };

        let summary = SessionSummary {
            id: bridge.id().to_owned(),
            command: command.id.clone(),
            args: command.args.clone(),
            pid: None,
            connection_id: self.connection_id.clone(),
            started_at: chrono::Utc::now(),
            ready: false,
        };
        let guard = match self.state.sessions.attach(summary) {
            Ok(guard) => guard,
            Err(err) => {
                bridge.dispose();
                self.send_event(&ServerEvent::error(err.to_string())).await;
                return;
            }
        };

        let identity = SessionIdentity {
            session_id: bridge.id().to_owned(),
            command: command.id,
            args: command.args,
        };
        info!(
            connection_id = %self.connection_id,
            session_id = %identity.session_id,
            command = %identity.command,
            "session starting"
        );

        let starting = ServerEvent::Starting {
            session_id: identity.session_id.clone(),
            command: identity.command.clone(),
            args: identity.args.clone(),
        };
        self.session = Some(ActiveSession {
            bridge,
            events,
            identity,
            guard,
        });
        self.send_event(&starting).await;
    }

    async fn forward_input(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        if let Some(active) = self.require_session().await {
            if let Err(err) = active.bridge.write(&bytes).await {
                debug!(%err, "input not delivered");
            }
        }
    }

    async fn handle_bridge_event(&mut self, event: BridgeEvent) -> Flow {
        let Some(active) = self.session.as_ref() else {
            return Flow::Continue;
        };

        match &event {
            BridgeEvent::Ready { pid } => {
                self.state.sessions.mark_ready(&active.identity.session_id, *pid);
            }
            BridgeEvent::Exit { exit_code, signal } => {
                info!(
                    session_id = %active.identity.session_id,
                    exit_code = ?exit_code,
                    signal = ?signal,
                    "session exited"
                );
                if *exit_code != Some(0) {
                    let tail = active.bridge.stderr_tail();
                    if !tail.trim().is_empty() {
                        warn!(
                            session_id = %active.identity.session_id,
                            stderr_tail = %tail.trim_end(),
                            "helper stderr before abnormal exit"
                        );
                    }
                }
            }
            BridgeEvent::Stderr(text) => {
                debug!(session_id = %active.identity.session_id, stderr = %text.trim_end(), "bridge stderr");
            }
            BridgeEvent::Debug(value) => {
                debug!(session_id = %active.identity.session_id, %value, "bridge debug message");
            }
            _ => {}
        }

        let relay = relay_event(&active.identity, event);
        if let Some(reply) = relay.reply {
            if let Err(err) = active.bridge.write(reply).await {
                debug!(%err, "cursor position reply not delivered");
            }
        }
        if let Some(ref outbound) = relay.event {
            self.send_event(outbound).await;
        }
        if relay.close {
            self.end_session();
            self.close(CloseCode::Normal, "").await;
            return Flow::Close;
        }
        Flow::Continue
    }

    /// The active session, or `None` after telling the client there is none.
    async fn require_session(&mut self) -> Option<&mut ActiveSession> {
        if self.session.is_none() {
            self.send_event(&ServerEvent::error("session_not_started"))
                .await;
            return None;
        }
        self.session.as_mut()
    }

    fn end_session(&mut self) {
        if let Some(mut active) = self.session.take() {
            info!(
                connection_id = %self.connection_id,
                session_id = %active.identity.session_id,
                "session ended"
            );
            active.bridge.dispose();
        }
    }

    async fn send_event(&mut self, event: &ServerEvent) {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(err) => {
                warn!(%err, "failed to serialise server event");
                return;
            }
        };
        let limit = self.state.config.sessions.max_message_bytes;
        if json.len() > limit {
            warn!(
                connection_id = %self.connection_id,
                size = json.len(),
                limit,
                "dropping oversized outbound message"
            );
            return;
        }
        self.send_frame(Frame::text(Bytes::from(json))).await;
    }

    async fn send_frame(&mut self, frame: Frame) {
        if let Err(err) = self.out.send(frame).await {
            debug!(connection_id = %self.connection_id, %err, "socket write failed");
        }
    }

    async fn close(&mut self, code: CloseCode, reason: &str) {
        self.send_frame(Frame::close(code, reason)).await;
        if let Err(err) = self.out.close().await {
            debug!(connection_id = %self.connection_id, %err, "socket shutdown failed");
        }
    }
}
