//! Per-task heartbeat logging.
//!
//! While a task runs, a [`Heartbeat`] logs its idle time on a fixed
//! interval. It never changes task state; the task engine drops the handle
//! when the task reaches a terminal status.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// What one heartbeat tick reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatSample {
    /// Status wire name.
    pub status: &'static str,
    /// Milliseconds since the last output.
    pub idle_ms: i64,
    /// Child pid, if known.
    pub pid: Option<u32>,
    /// Stdout bytes so far.
    pub stdout_bytes: u64,
    /// Stderr bytes so far.
    pub stderr_bytes: u64,
}

/// Running heartbeat; cancelled when dropped.
#[derive(Debug)]
pub struct Heartbeat {
    cancel: CancellationToken,
}

impl Heartbeat {
    /// Start logging every `interval`. `probe` returns `None` once the task
    /// is gone or terminal, which ends the loop.
    #[must_use]
    pub fn spawn<F>(task_id: String, interval: Duration, probe: F) -> Self
    where
        F: Fn() -> Option<HeartbeatSample> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let span = info_span!("heartbeat", task_id = %task_id);

        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                // The first tick fires immediately.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = token.cancelled() => {
                            debug!("heartbeat cancelled");
                            return;
                        }
                        _ = ticker.tick() => {
                            let Some(sample) = probe() else {
                                return;
                            };
                            let idle_secs = sample.idle_ms / 1000;
                            if u128::try_from(sample.idle_ms).unwrap_or(0) >= interval.as_millis() {
                                info!(
                                    status = sample.status,
                                    idle_secs,
                                    pid = ?sample.pid,
                                    stdout_bytes = sample.stdout_bytes,
                                    stderr_bytes = sample.stderr_bytes,
                                    "task quiet"
                                );
                            } else {
                                debug!(
                                    status = sample.status,
                                    idle_secs,
                                    stdout_bytes = sample.stdout_bytes,
                                    stderr_bytes = sample.stderr_bytes,
                                    "task heartbeat"
                                );
                            }
                        }
                    }
                }
            }
            .instrument(span),
        );

        Self { cancel }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
