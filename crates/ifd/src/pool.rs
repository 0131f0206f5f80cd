//! Wait task scheduling and cancellation bookkeeping
//!
//! Every wait, synchronous or not, runs on its own named worker thread so it
//! can be interrupted from the outside. The [`SessionTable`] tracks the
//! cancellation handles: named entries for asynchronous sessions and one
//! singleton slot for the synchronous wait. Removal and cancellation share
//! one lock, so a cancel racing a completing task resolves to exactly one
//! winner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, bounded};
use tessera_scio::WatchCanceler;
use tracing::{error, trace};

/// Spawns wait tasks on dedicated, sequentially numbered threads.
#[derive(Debug, Default)]
pub(crate) struct WaitPool {
    counter: AtomicUsize,
}

impl WaitPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Run `task` on a fresh worker thread; the receiver yields its result.
    ///
    /// Callers waiting synchronously block on the receiver; asynchronous
    /// callers drop it, the task delivers through its own callback.
    pub(crate) fn spawn<T, F>(&self, task: F) -> Receiver<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("scio-watcher-{id}"))
            .spawn(move || {
                let _ = tx.send(task());
            });
        if let Err(e) = spawned {
            error!("unable to spawn a wait worker: {e}");
        }
        rx
    }
}

/// Cancellation handle of one pending wait task.
///
/// The flag and the canceler are shared with the task: the flag tells the
/// task on wakeup that its termination was requested, the canceler unblocks
/// whatever primitive it currently sleeps in.
pub(crate) struct PendingWait {
    cancelled: Arc<AtomicBool>,
    canceler: Arc<dyn WatchCanceler>,
}

impl std::fmt::Debug for PendingWait {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWait")
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl PendingWait {
    pub(crate) fn new(canceler: Arc<dyn WatchCanceler>) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            canceler,
        }
    }

    /// Flag the owning task checks after its wait returns.
    pub(crate) fn cancelled_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.canceler.cancel();
    }
}

/// Pending-wait registry of one established context.
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    sessions: Mutex<HashMap<String, PendingWait>>,
    sync_wait: Mutex<Option<PendingWait>>,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Track an asynchronous wait under its session id.
    pub(crate) fn register(&self, session: &str, wait: PendingWait) {
        self.sessions
            .lock()
            .unwrap()
            .insert(session.to_string(), wait);
    }

    /// Drop a completed session entry; a no-op when a cancel won the race.
    pub(crate) fn finish(&self, session: &str) {
        if self.sessions.lock().unwrap().remove(session).is_some() {
            trace!(session, "wait session completed");
        }
    }

    /// Cancel the named session. False when no such wait is pending.
    pub(crate) fn cancel(&self, session: &str) -> bool {
        let removed = self.sessions.lock().unwrap().remove(session);
        removed.inspect(|wait| wait.cancel()).is_some()
    }

    /// Track the singleton synchronous wait.
    pub(crate) fn register_sync(&self, wait: PendingWait) {
        *self.sync_wait.lock().unwrap() = Some(wait);
    }

    /// Drop the synchronous wait after its completion.
    pub(crate) fn finish_sync(&self) {
        self.sync_wait.lock().unwrap().take();
    }

    /// Cancel the synchronous wait. False when none is pending.
    pub(crate) fn cancel_sync(&self) -> bool {
        let removed = self.sync_wait.lock().unwrap().take();
        removed.inspect(|wait| wait.cancel()).is_some()
    }

    /// Cancel everything still pending, used at context teardown.
    pub(crate) fn cancel_all(&self) {
        for (_, wait) in self.sessions.lock().unwrap().drain() {
            wait.cancel();
        }
        self.cancel_sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingCanceler(AtomicUsize);

    impl WatchCanceler for CountingCanceler {
        fn cancel(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pending() -> (PendingWait, Arc<CountingCanceler>) {
        let canceler = Arc::new(CountingCanceler(AtomicUsize::new(0)));
        (
            PendingWait::new(Arc::clone(&canceler) as Arc<dyn WatchCanceler>),
            canceler,
        )
    }

    #[test]
    fn pool_runs_tasks_on_named_threads() {
        let pool = WaitPool::new();
        let rx = pool.spawn(|| thread::current().name().map(String::from));
        let name = rx.recv().unwrap().unwrap();
        assert!(name.starts_with("scio-watcher-"));
    }

    #[test]
    fn second_cancel_loses_the_race() {
        let table = SessionTable::new();
        let (wait, canceler) = pending();
        let flag = wait.cancelled_handle();
        table.register("session-1", wait);

        assert!(table.cancel("session-1"));
        assert!(flag.load(Ordering::SeqCst));
        assert_eq!(canceler.0.load(Ordering::SeqCst), 1);

        // entry is gone, a second cancel cannot succeed
        assert!(!table.cancel("session-1"));
        assert_eq!(canceler.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completion_beats_cancellation() {
        let table = SessionTable::new();
        let (wait, canceler) = pending();
        table.register("session-1", wait);

        table.finish("session-1");
        assert!(!table.cancel("session-1"));
        assert_eq!(canceler.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn sync_slot_is_a_singleton() {
        let table = SessionTable::new();
        assert!(!table.cancel_sync());

        let (wait, canceler) = pending();
        table.register_sync(wait);
        assert!(table.cancel_sync());
        assert_eq!(canceler.0.load(Ordering::SeqCst), 1);
        assert!(!table.cancel_sync());
    }
}
