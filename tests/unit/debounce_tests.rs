//! Unit tests for the debounce state machine and the persister actor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use agent_console::persistence::debounce::{DebounceState, Debouncer};
use agent_console::persistence::{
    spawn_persister, PersistHandle, PersistedSnapshot, SnapshotSource, SnapshotStore,
};
use agent_console::{AppError, Result};

const WINDOW: Duration = Duration::from_millis(1200);

// ── Debouncer ───────────────────────────────────────────────────────────────

/// The first mark arms the deadline; later marks do not move it.
#[tokio::test(start_paused = true)]
async fn later_marks_join_the_pending_write() {
    let mut debouncer = Debouncer::new(WINDOW);
    assert_eq!(debouncer.state(), DebounceState::Clean);

    let start = Instant::now();
    assert!(debouncer.mark_dirty(start));
    assert!(!debouncer.mark_dirty(start + Duration::from_millis(900)));
    assert_eq!(debouncer.deadline(), Some(start + WINDOW));

    assert!(!debouncer.is_due(start + Duration::from_millis(1199)));
    assert!(debouncer.is_due(start + WINDOW));
    assert!(debouncer.is_dirty(), "due is not the same as written");

    debouncer.mark_written();
    assert!(!debouncer.is_dirty());
    assert_eq!(debouncer.deadline(), None);
}

/// A failed write keeps the state dirty and re-arms one window later.
#[tokio::test(start_paused = true)]
async fn failed_write_rearms_deadline() {
    let mut debouncer = Debouncer::new(WINDOW);
    let start = Instant::now();
    debouncer.mark_dirty(start);

    let failed_at = start + WINDOW;
    debouncer.mark_failed(failed_at);
    assert_eq!(
        debouncer.state(),
        DebounceState::Dirty {
            deadline: failed_at + WINDOW
        }
    );
    assert!(!debouncer.is_due(failed_at));
    assert!(debouncer.is_due(failed_at + WINDOW));
}

// ── Persister actor ─────────────────────────────────────────────────────────

#[derive(Default)]
struct CountingSource {
    persisted: AtomicUsize,
}

impl SnapshotSource for CountingSource {
    fn capture(&self, saved_at: DateTime<Utc>) -> PersistedSnapshot {
        PersistedSnapshot::capture(1, std::iter::empty(), saved_at)
    }

    fn mark_persisted(&self, _saved_at: DateTime<Utc>) {
        self.persisted.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CountingStore {
    saves: AtomicUsize,
    fail: bool,
}

impl SnapshotStore for CountingStore {
    fn load(
        &self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Option<PersistedSnapshot>>> + Send + '_>>
    {
        Box::pin(async { Ok(None) })
    }

    fn save<'a>(
        &'a self,
        _snapshot: &'a PersistedSnapshot,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AppError::Persistence("disk full".into()))
            } else {
                Ok(())
            }
        })
    }
}

struct Harness {
    handle: PersistHandle,
    source: Arc<CountingSource>,
    store: Arc<CountingStore>,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

fn start(fail: bool) -> Harness {
    let (handle, requests) = PersistHandle::channel();
    let source = Arc::new(CountingSource::default());
    let store = Arc::new(CountingStore {
        fail,
        ..CountingStore::default()
    });
    let cancel = CancellationToken::new();
    let join = spawn_persister(
        requests,
        Arc::clone(&source) as Arc<dyn SnapshotSource>,
        Arc::clone(&store) as Arc<dyn SnapshotStore>,
        WINDOW,
        cancel.clone(),
    );
    Harness {
        handle,
        source,
        store,
        cancel,
        join,
    }
}

/// A burst of schedules produces exactly one write after the window.
#[tokio::test(start_paused = true)]
async fn burst_of_schedules_writes_once() {
    let h = start(false);
    for _ in 0..20 {
        h.handle.schedule();
    }

    tokio::time::sleep(WINDOW / 2).await;
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 0);

    tokio::time::sleep(WINDOW).await;
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);
    assert_eq!(h.source.persisted.load(Ordering::SeqCst), 1);

    tokio::time::sleep(WINDOW * 3).await;
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);
}

/// A flush writes immediately and cancels the pending deadline.
#[tokio::test(start_paused = true)]
async fn flush_bypasses_window() {
    let h = start(false);
    h.handle.schedule();
    h.handle.flush().await;
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);

    tokio::time::sleep(WINDOW * 2).await;
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);
}

/// Shutdown performs a final write and stops the actor.
#[tokio::test(start_paused = true)]
async fn shutdown_writes_and_stops() {
    let h = start(false);
    h.handle.shutdown().await;
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);
    h.join.await.expect("persister joins");
}

/// Cancellation flushes a pending write before exiting.
#[tokio::test(start_paused = true)]
async fn cancel_flushes_dirty_state() {
    let h = start(false);
    h.handle.schedule();
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.cancel.cancel();
    h.join.await.expect("persister joins");
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);
}

/// Failed writes are not reported as persisted.
#[tokio::test(start_paused = true)]
async fn failed_write_is_not_marked_persisted() {
    let h = start(true);
    h.handle.flush().await;
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);
    assert_eq!(h.source.persisted.load(Ordering::SeqCst), 0);
}

/// A failed write is retried after the window without a new mutation.
#[tokio::test(start_paused = true)]
async fn failed_write_is_retried_after_window() {
    let h = start(true);
    h.handle.flush().await;
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 1);

    tokio::time::sleep(WINDOW + Duration::from_millis(10)).await;
    assert_eq!(h.store.saves.load(Ordering::SeqCst), 2);
    assert_eq!(h.source.persisted.load(Ordering::SeqCst), 0);
}

/// A disabled handle never blocks its callers.
#[tokio::test]
async fn disabled_handle_is_inert() {
    let handle = PersistHandle::disabled();
    handle.schedule();
    handle.flush_now();
    handle.flush().await;
    handle.shutdown().await;
}
