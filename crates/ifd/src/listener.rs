//! Polling fallback of the event subsystem
//!
//! Where [`EventWatcher`](crate::watcher::EventWatcher) rides on the
//! backend's change stream, the [`EventListener`] derives events purely from
//! repeated status snapshots. A background poll thread watches for the first
//! deviation from the expected state; the listener then reports the full
//! recomputed diff. Slower and hungrier than the watcher, but immune to
//! backends whose blocking wait is unreliable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use tessera_scio::{ScioError, ScioErrorCode, ScioResult, ScioTerminals, WatchCanceler};
use tracing::{debug, warn};

use crate::config::PauseCoordinator;
use crate::manager::ChannelManager;
use crate::terminal_info::collect_status;
use crate::types::{IfdStatus, SlotStatus};

/// Substitute sleep when the backend's blocking wait is defective.
const FALLBACK_POLL: Duration = Duration::from_millis(50);
/// Backend errors tolerated before the poll thread gives up.
const MAX_TRANSIENT_ERRORS: u32 = 500;
/// Grace period after a tolerated backend error.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Difference between an expected terminal landscape and an observed one.
///
/// Terminals whose observed state deviates end up in the result, as do new
/// terminals when `with_new` is set. Expected terminals missing from the
/// observation are appended as disconnected entries with all cards absent.
/// Unlike the watcher's comparison, the ATR takes part here, so a card swap
/// between two snapshots still registers as a change.
#[derive(Debug)]
pub struct StatusDiff {
    result: Vec<IfdStatus>,
}

impl StatusDiff {
    /// Compute the diff of `observed` against `expected`.
    pub fn diff(expected: &[IfdStatus], observed: &[IfdStatus], with_new: bool) -> Self {
        let mut result = Vec::new();
        let mut deleted: Vec<&IfdStatus> = expected.iter().collect();

        for next in observed {
            match expected.iter().find(|s| s.ifd_name == next.ifd_name) {
                Some(other) => {
                    if next.connected != other.connected || slots_differ(next, other) {
                        result.push(next.clone());
                    }
                    deleted.retain(|s| s.ifd_name != next.ifd_name);
                }
                None if with_new => result.push(next.clone()),
                None => {}
            }
        }

        // transform all deleted terminals so it is clear they disappeared
        for next in deleted {
            result.push(IfdStatus {
                ifd_name: next.ifd_name.clone(),
                connected: false,
                slots: next
                    .slots
                    .iter()
                    .map(|slot| SlotStatus {
                        index: slot.index,
                        card_available: false,
                        atr: None,
                    })
                    .collect(),
            });
        }

        Self { result }
    }

    /// Whether any terminal deviates from the expectation.
    pub fn has_changes(&self) -> bool {
        !self.result.is_empty()
    }

    /// The deviating entries.
    pub fn into_result(self) -> Vec<IfdStatus> {
        self.result
    }
}

fn slots_differ(next: &IfdStatus, other: &IfdStatus) -> bool {
    if next.slots.len() != other.slots.len() {
        // slot count changes only occur on evolving terminals, skip them
        return false;
    }
    for slot in &next.slots {
        let Some(other_slot) = other.slots.iter().find(|s| s.index == slot.index) else {
            return true;
        };
        if slot.card_available != other_slot.card_available {
            return true;
        }
        if slot.atr != other_slot.atr {
            return true;
        }
    }
    false
}

/// One bounded wait for a status change, driven by polling.
///
/// The listener owns a completion channel shared with its poll thread and
/// with [`canceler`](Self::canceler) handles, so a [`run`](Self::run) in
/// progress can be unblocked from any thread.
pub struct EventListener {
    cm: Arc<ChannelManager>,
    pause: PauseCoordinator,
    poll_delay: Duration,
    timeout: Duration,
    with_new: bool,
    started: Instant,
    expected: Vec<IfdStatus>,
    stop: Arc<AtomicBool>,
    tx: Sender<ScioResult<()>>,
    rx: Receiver<ScioResult<()>>,
}

impl std::fmt::Debug for EventListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventListener")
            .field("timeout", &self.timeout)
            .field("poll_delay", &self.poll_delay)
            .field("with_new", &self.with_new)
            .finish_non_exhaustive()
    }
}

impl EventListener {
    /// Create a listener; the timeout counts from this moment.
    pub fn new(
        cm: Arc<ChannelManager>,
        pause: PauseCoordinator,
        poll_delay: Duration,
        timeout: Duration,
        with_new: bool,
    ) -> Self {
        let (tx, rx) = bounded(1);
        Self {
            cm,
            pause,
            poll_delay,
            timeout,
            with_new,
            started: Instant::now(),
            expected: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            tx,
            rx,
        }
    }

    /// Set the state the caller believes to be current.
    pub fn set_expected(&mut self, expected: Vec<IfdStatus>) {
        self.expected = expected;
    }

    /// Cancellation handle unblocking a pending [`run`](Self::run).
    pub fn canceler(&self) -> Arc<dyn WatchCanceler> {
        Arc::new(ListenerCanceler {
            stop: Arc::clone(&self.stop),
            tx: self.tx.clone(),
        })
    }

    /// Wait for the terminal landscape to deviate from the expected state.
    ///
    /// An already existing difference returns immediately without starting
    /// the poll thread. Otherwise the listener blocks for the remainder of
    /// its timeout and answers with the recomputed diff, which is empty when
    /// the timeout elapsed without a change. A cancel surfaces as an error
    /// with [`ScioErrorCode::Cancelled`].
    pub fn run(&mut self) -> ScioResult<Vec<IfdStatus>> {
        let current = collect_status(&self.cm)?;
        let diff = StatusDiff::diff(&self.expected, &current, self.with_new);
        if diff.has_changes() {
            return Ok(diff.into_result());
        }

        self.spawn_poll_thread();

        let remaining = self
            .timeout
            .saturating_sub(self.started.elapsed())
            .max(Duration::from_millis(1));
        let outcome = self.rx.recv_timeout(remaining);
        self.stop.store(true, Ordering::SeqCst);
        match outcome {
            Ok(Ok(())) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Err(e)) => return Err(e),
            // poll thread died without a verdict, recompute and answer anyway
            Err(RecvTimeoutError::Disconnected) => {
                warn!("poll thread ended without reporting a result");
            }
        }

        let current = collect_status(&self.cm)?;
        Ok(StatusDiff::diff(&self.expected, &current, self.with_new).into_result())
    }

    fn spawn_poll_thread(&self) {
        let cm = Arc::clone(&self.cm);
        let pause = self.pause.clone();
        let expected = self.expected.clone();
        let with_new = self.with_new;
        let poll_delay = self.poll_delay;
        let stop = Arc::clone(&self.stop);
        let tx = self.tx.clone();
        let spawned = thread::Builder::new()
            .name("ifd-poll".to_string())
            .spawn(move || {
                let result = poll_until_change(&cm, &pause, &expected, with_new, poll_delay, &stop);
                let _ = tx.try_send(result);
            });
        if let Err(e) = spawned {
            let _ = self.tx.try_send(Err(ScioError::new(
                ScioErrorCode::Unknown,
                format!("unable to spawn the poll thread: {e}"),
            )));
        }
    }
}

struct ListenerCanceler {
    stop: Arc<AtomicBool>,
    tx: Sender<ScioResult<()>>,
}

impl WatchCanceler for ListenerCanceler {
    fn cancel(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.tx.try_send(Err(ScioError::new(
            ScioErrorCode::Cancelled,
            "wait for change cancelled",
        )));
    }
}

/// Poll loop body. Returns `Ok(())` once a deviation is observed or the stop
/// flag is raised; transient backend errors are absorbed up to a limit.
fn poll_until_change(
    cm: &Arc<ChannelManager>,
    pause: &PauseCoordinator,
    expected: &[IfdStatus],
    with_new: bool,
    poll_delay: Duration,
    stop: &AtomicBool,
) -> ScioResult<()> {
    let terminals = cm.terminals();
    let native_wait = terminals.supports_card_presence_wait();
    let mut watcher = if native_wait {
        let mut watcher = terminals.watcher()?;
        watcher.start()?;
        Some(watcher)
    } else {
        debug!("backend card-presence wait disabled, falling back to fixed sleeps");
        None
    };

    let mut error_count = 0u32;
    while !stop.load(Ordering::SeqCst) {
        let round: ScioResult<bool> = (|| {
            if observe_round(terminals.as_ref(), expected, with_new)? {
                return Ok(true);
            }
            pause.block_while_paused();
            match watcher.as_mut() {
                // a Cancelled outcome is just the poll timeout, the next
                // round decides whether anything changed
                Some(watcher) => {
                    let _ = watcher.wait_for_change(poll_delay)?;
                }
                None => thread::sleep(FALLBACK_POLL),
            }
            Ok(false)
        })();

        match round {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(e) => {
                // the stack pooped, try again after a short break
                error_count += 1;
                if error_count == MAX_TRANSIENT_ERRORS {
                    return Err(e);
                }
                debug!("poll round failed, retrying: {e}");
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }
    Ok(())
}

/// One comparison of the live terminal list against the expectation.
fn observe_round(
    terminals: &dyn ScioTerminals,
    expected: &[IfdStatus],
    with_new: bool,
) -> ScioResult<bool> {
    let list = terminals.list()?;
    let mut deleted: Vec<&IfdStatus> = expected.iter().collect();

    for terminal in &list {
        match expected.iter().find(|s| s.ifd_name == terminal.name()) {
            Some(entry) => {
                let expected_card = entry.slots.first().is_some_and(|s| s.card_available);
                if terminal.is_card_present()? != expected_card {
                    return Ok(true);
                }
                deleted.retain(|s| s.ifd_name != terminal.name());
            }
            None if with_new => return Ok(true),
            None => {}
        }
    }

    Ok(!deleted.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_scio::mock::MockReaders;

    fn status(name: &str, card: bool) -> IfdStatus {
        IfdStatus {
            ifd_name: name.to_string(),
            connected: true,
            slots: vec![SlotStatus {
                index: 0,
                card_available: card,
                atr: None,
            }],
        }
    }

    #[test]
    fn diff_reports_card_changes_and_new_terminals() {
        let expected = vec![status("Reader A", false)];
        let observed = vec![status("Reader A", true), status("Reader B", false)];

        let diff = StatusDiff::diff(&expected, &observed, true);
        assert!(diff.has_changes());
        let result = diff.into_result();
        assert_eq!(result.len(), 2);

        // without with_new the unknown terminal is invisible
        let diff = StatusDiff::diff(&expected, &[status("Reader B", false)], false);
        let result = diff.into_result();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].ifd_name, "Reader A");
        assert!(!result[0].connected);
    }

    #[test]
    fn diff_compares_the_atr() {
        let mut expected = status("Reader A", true);
        expected.slots[0].atr = Some(bytes::Bytes::from_static(&[0x3B, 0x8A]));
        let mut observed = expected.clone();

        assert!(!StatusDiff::diff(&[expected.clone()], &[observed.clone()], true).has_changes());

        observed.slots[0].atr = Some(bytes::Bytes::from_static(&[0x3B, 0x8B]));
        assert!(StatusDiff::diff(&[expected], &[observed], true).has_changes());
    }

    fn listener_over(readers: &MockReaders, timeout: Duration) -> EventListener {
        let cm = Arc::new(ChannelManager::new(Arc::new(readers.clone())));
        EventListener::new(
            cm,
            PauseCoordinator::new(),
            Duration::from_millis(20),
            timeout,
            true,
        )
    }

    #[test]
    fn immediate_return_skips_the_poll_thread() {
        let readers = MockReaders::new();
        readers.add_terminal("Reader A");
        readers.insert_card("Reader A", &[0x3B]);

        let mut listener = listener_over(&readers, Duration::from_secs(30));
        listener.set_expected(vec![status("Reader A", false)]);

        let diff = listener.run().unwrap();
        assert_eq!(diff.len(), 1);
        assert!(diff[0].slots[0].card_available);
        assert_eq!(readers.wait_calls(), 0);
    }

    #[test]
    fn polling_picks_up_a_late_insertion() {
        let readers = MockReaders::new();
        readers.add_terminal("Reader A");

        let mut listener = listener_over(&readers, Duration::from_secs(5));
        listener.set_expected(vec![status("Reader A", false)]);

        let inserter = {
            let readers = readers.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(60));
                readers.insert_card("Reader A", &[0x3B, 0x8A]);
            })
        };

        let diff = listener.run().unwrap();
        inserter.join().unwrap();
        assert_eq!(diff.len(), 1);
        assert!(diff[0].slots[0].card_available);
        assert_eq!(diff[0].slots[0].atr.as_deref(), Some(&[0x3Bu8, 0x8A][..]));
    }

    #[test]
    fn broken_presence_wait_falls_back_to_sleeping() {
        let readers = MockReaders::new().with_broken_presence_wait();
        readers.add_terminal("Reader A");

        let mut listener = listener_over(&readers, Duration::from_secs(5));
        listener.set_expected(vec![status("Reader A", false)]);

        let inserter = {
            let readers = readers.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(60));
                readers.insert_card("Reader A", &[0x3B]);
            })
        };

        let diff = listener.run().unwrap();
        inserter.join().unwrap();
        assert_eq!(diff.len(), 1);
        assert!(diff[0].slots[0].card_available);
        // the defective blocking wait was never used
        assert_eq!(readers.wait_calls(), 0);
    }

    #[test]
    fn timeout_answers_with_an_empty_diff() {
        let readers = MockReaders::new();
        readers.add_terminal("Reader A");

        let mut listener = listener_over(&readers, Duration::from_millis(80));
        listener.set_expected(vec![status("Reader A", false)]);

        let diff = listener.run().unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn cancel_surfaces_as_cancelled_error() {
        let readers = MockReaders::new();
        readers.add_terminal("Reader A");

        let mut listener = listener_over(&readers, Duration::from_secs(30));
        listener.set_expected(vec![status("Reader A", false)]);
        let canceler = listener.canceler();

        let cancel = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceler.cancel();
        });

        let err = listener.run().unwrap_err();
        cancel.join().unwrap();
        assert_eq!(err.code(), ScioErrorCode::Cancelled);
    }
}
