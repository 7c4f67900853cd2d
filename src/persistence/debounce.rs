//! Debounced snapshot writer.
//!
//! [`Debouncer`] is the pure clean/dirty state machine; [`spawn_persister`]
//! runs it as an actor fed through a [`PersistHandle`]. Scheduled writes and
//! forced flushes both end in the same `write_and_settle` path, and only a
//! successful write returns the state to clean.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::snapshot::PersistedSnapshot;
use super::store::SnapshotStore;

/// Clean/dirty state of the pending write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    /// Nothing to write.
    Clean,
    /// A write is due at `deadline`.
    Dirty {
        /// When the pending write fires.
        deadline: Instant,
    },
}

/// Debounce window tracking.
///
/// The first mutation arms the deadline; later mutations inside the window
/// join the same write instead of pushing the deadline out.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    state: DebounceState,
}

impl Debouncer {
    /// Clean debouncer with the given quiet window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: DebounceState::Clean,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DebounceState {
        self.state
    }

    /// Record a mutation. Returns `true` if this armed a new deadline.
    pub fn mark_dirty(&mut self, now: Instant) -> bool {
        match self.state {
            DebounceState::Clean => {
                self.state = DebounceState::Dirty {
                    deadline: now + self.window,
                };
                true
            }
            DebounceState::Dirty { .. } => false,
        }
    }

    /// Pending deadline, if dirty.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Clean => None,
            DebounceState::Dirty { deadline } => Some(deadline),
        }
    }

    /// Whether the pending deadline has passed.
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.state, DebounceState::Dirty { deadline } if deadline <= now)
    }

    /// A write succeeded; nothing is pending until the next mutation.
    pub fn mark_written(&mut self) {
        self.state = DebounceState::Clean;
    }

    /// A write failed; stay dirty and retry one window from `now`.
    pub fn mark_failed(&mut self, now: Instant) {
        self.state = DebounceState::Dirty {
            deadline: now + self.window,
        };
    }

    /// Whether a write is pending.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state != DebounceState::Clean
    }
}

/// Provider of the state to persist.
pub trait SnapshotSource: Send + Sync {
    /// Capture the current state.
    fn capture(&self, saved_at: DateTime<Utc>) -> PersistedSnapshot;

    /// Called after a successful write.
    fn mark_persisted(&self, saved_at: DateTime<Utc>);
}

#[derive(Debug)]
enum PersistRequest {
    Schedule,
    Flush(Option<oneshot::Sender<()>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable sender side of the persister actor.
#[derive(Debug, Clone)]
pub struct PersistHandle {
    tx: mpsc::UnboundedSender<PersistRequest>,
}

/// Receiver side, consumed by [`spawn_persister`].
#[derive(Debug)]
pub struct PersistRequests {
    rx: mpsc::UnboundedReceiver<PersistRequest>,
}

impl PersistHandle {
    /// Create a connected handle/receiver pair.
    #[must_use]
    pub fn channel() -> (Self, PersistRequests) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, PersistRequests { rx })
    }

    /// Handle with no persister behind it; every request is dropped.
    #[must_use]
    pub fn disabled() -> Self {
        Self::channel().0
    }

    /// Mark state dirty; a write follows after the debounce window.
    pub fn schedule(&self) {
        let _ = self.tx.send(PersistRequest::Schedule);
    }

    /// Write now, bypassing the debounce, without waiting for it.
    pub fn flush_now(&self) {
        let _ = self.tx.send(PersistRequest::Flush(None));
    }

    /// Write now and wait until the write has been attempted.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistRequest::Flush(Some(ack_tx))).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Final write, then stop the persister.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(PersistRequest::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Spawn the persister actor.
///
/// Save failures are logged and never reach task state. On cancellation a
/// pending write is flushed before the actor exits.
#[must_use]
pub fn spawn_persister(
    requests: PersistRequests,
    source: Arc<dyn SnapshotSource>,
    store: Arc<dyn SnapshotStore>,
    window: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        run_persister(requests.rx, source, store, window, cancel)
            .instrument(info_span!("persister")),
    )
}

async fn run_persister(
    mut rx: mpsc::UnboundedReceiver<PersistRequest>,
    source: Arc<dyn SnapshotSource>,
    store: Arc<dyn SnapshotStore>,
    window: Duration,
    cancel: CancellationToken,
) {
    let mut debouncer = Debouncer::new(window);

    loop {
        let deadline = debouncer.deadline();
        let due = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                if debouncer.is_dirty() {
                    write_and_settle(&mut debouncer, source.as_ref(), store.as_ref()).await;
                }
                info!("persister cancelled");
                break;
            }
            () = due => {
                if debouncer.is_due(Instant::now()) {
                    write_and_settle(&mut debouncer, source.as_ref(), store.as_ref()).await;
                }
            }
            request = rx.recv() => match request {
                Some(PersistRequest::Schedule) => {
                    if debouncer.mark_dirty(Instant::now()) {
                        debug!(?window, "snapshot write scheduled");
                    }
                }
                Some(PersistRequest::Flush(ack)) => {
                    write_and_settle(&mut debouncer, source.as_ref(), store.as_ref()).await;
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                Some(PersistRequest::Shutdown(ack)) => {
                    write_and_settle(&mut debouncer, source.as_ref(), store.as_ref()).await;
                    let _ = ack.send(());
                    info!("persister stopped");
                    break;
                }
                None => {
                    if debouncer.is_dirty() {
                        write_and_settle(&mut debouncer, source.as_ref(), store.as_ref()).await;
                    }
                    break;
                }
            },
        }
    }
}

async fn write_and_settle(
    debouncer: &mut Debouncer,
    source: &dyn SnapshotSource,
    store: &dyn SnapshotStore,
) {
    let saved_at = Utc::now();
    let snapshot = source.capture(saved_at);
    match store.save(&snapshot).await {
        Ok(()) => {
            source.mark_persisted(saved_at);
            debouncer.mark_written();
        }
        Err(err) => {
            warn!(%err, "snapshot write failed; retrying after the debounce window");
            debouncer.mark_failed(Instant::now());
        }
    }
}
