//! Helper stdin writer task.
//!
//! Receives [`ControlMessage`]s from a tokio [`mpsc`] channel and writes each
//! one as a JSON line to the helper's stdin through [`ServerCodec`].

use futures_util::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pty::codec::ServerCodec;
use crate::pty::protocol::ControlMessage;
use crate::Result;

/// Write control messages to the helper until cancelled or the channel closes.
///
/// # Errors
///
/// Returns the first serialization or write failure. A failed write usually
/// means the helper has already exited.
pub async fn run_writer<W>(
    session_id: String,
    stdin: W,
    mut msg_rx: mpsc::Receiver<ControlMessage>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut framed = FramedWrite::new(stdin, ServerCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(session_id, "bridge writer: cancellation received, stopping");
                break;
            }

            msg = msg_rx.recv() => {
                let Some(msg) = msg else {
                    debug!(session_id, "bridge writer: control channel closed, stopping");
                    break;
                };

                if let Err(err) = framed.send(msg).await {
                    warn!(session_id, %err, "bridge writer: write to helper stdin failed");
                    return Err(err);
                }
            }
        }
    }

    // Closing stdin tells the helper to hang up its child.
    if let Err(err) = framed.close().await {
        debug!(session_id, %err, "bridge writer: stdin close failed");
    }
    Ok(())
}
