//! Diff based long-poll over a terminal watcher
//!
//! An [`EventWatcher`] keeps its own copy of the terminal landscape and
//! answers wait requests by diffing it against the state the caller claims
//! to know. Only when the diff is empty does it block on the backend
//! watcher; once one change arrives, it drains immediately following events
//! so a burst is reported as one consistent update.

use std::sync::Arc;
use std::time::Duration;

use tessera_scio::{
    ScioResult, StateChange, StateChangeKind, TerminalState, TerminalWatcher, WatchCanceler,
    WatchEvent,
};
use tracing::{error, trace};

use crate::manager::ChannelManager;
use crate::types::{IfdStatus, SlotStatus};

const DRAIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Stateful diff source behind the facade's wait operation.
pub struct EventWatcher {
    cm: Arc<ChannelManager>,
    timeout: Duration,
    watcher: Box<dyn TerminalWatcher>,
    current: Vec<IfdStatus>,
    expected: Vec<IfdStatus>,
}

impl std::fmt::Debug for EventWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWatcher")
            .field("timeout", &self.timeout)
            .field("tracked", &self.current.len())
            .finish_non_exhaustive()
    }
}

impl EventWatcher {
    /// Create a watcher over the manager's terminal backend.
    pub fn new(cm: Arc<ChannelManager>, timeout: Duration) -> ScioResult<Self> {
        let watcher = cm.terminals().watcher()?;
        Ok(Self {
            cm,
            timeout,
            watcher,
            current: Vec::new(),
            expected: Vec::new(),
        })
    }

    /// Capture the initial state; returns an independent copy of it.
    pub fn start(&mut self) -> ScioResult<Vec<IfdStatus>> {
        let initial = self.watcher.start()?;
        self.current = convert(&initial);
        // second conversion, callers cannot alter the internal copy
        Ok(convert(&initial))
    }

    /// Set the state the caller believes to be current.
    pub fn set_expected(&mut self, expected: Vec<IfdStatus>) {
        self.expected = expected;
    }

    /// Cancellation handle unblocking a pending [`run`](Self::run).
    pub fn canceler(&self) -> Arc<dyn WatchCanceler> {
        self.watcher.canceler()
    }

    /// Wait for the next difference against the expected state.
    ///
    /// Returns immediately when a difference already exists. An elapsed
    /// timeout or a cancel yields the (possibly empty) diff computed from
    /// whatever events arrived.
    pub fn run(&mut self) -> ScioResult<Vec<IfdStatus>> {
        let diff = self.compare();
        if !diff.is_empty() {
            return Ok(diff);
        }

        // block for the first event, then drain the burst
        let mut events = Vec::new();
        let mut event = self.watcher.wait_for_change(self.timeout)?;
        if let WatchEvent::Change(change) = event {
            events.push(change);
            loop {
                event = self.watcher.wait_for_change(DRAIN_TIMEOUT)?;
                match event {
                    WatchEvent::Change(change) => events.push(change),
                    WatchEvent::Cancelled => break,
                }
            }
        }
        trace!(count = events.len(), "applying state change events");
        for event in events {
            self.update_state(event);
        }

        Ok(self.compare())
    }

    fn update_state(&mut self, event: StateChange) {
        let name = event.terminal;
        if event.kind == StateChangeKind::TerminalAdded {
            self.current.push(IfdStatus::empty(name));
            return;
        }
        let Some(entry) = self.current.iter_mut().find(|s| s.ifd_name == name) else {
            return;
        };
        let slot = &mut entry.slots[0];
        match event.kind {
            StateChangeKind::CardInserted => match self.cm.open_master_channel(&name) {
                Ok(channel) => {
                    slot.card_available = true;
                    slot.atr = Some(channel.atr());
                }
                Err(e) => {
                    error!(terminal = name, "failed to open master channel: {e}");
                    slot.card_available = false;
                    self.cm.close_master_channel(&name);
                }
            },
            StateChangeKind::CardRemoved => {
                self.cm.close_master_channel(&name);
                slot.card_available = false;
                slot.atr = None;
            }
            StateChangeKind::TerminalRemoved => {
                slot.card_available = false;
                entry.connected = false;
            }
            StateChangeKind::TerminalAdded => unreachable!("handled above"),
        }
    }

    /// Diff the internal state against the expected state.
    ///
    /// Terminals matching the expectation are omitted; expected terminals
    /// absent from the internal state are reported as disconnected. The
    /// result is an independent copy throughout.
    fn compare(&self) -> Vec<IfdStatus> {
        let mut remaining: Vec<&IfdStatus> = self.current.iter().collect();
        let mut disconnected = Vec::new();

        for expect in &self.expected {
            match remaining.iter().position(|s| s.ifd_name == expect.ifd_name) {
                Some(idx) => {
                    if state_equal(remaining[idx], expect) {
                        remaining.remove(idx);
                    }
                }
                None => {
                    let mut removed = expect.clone();
                    removed.connected = false;
                    disconnected.push(removed);
                }
            }
        }

        let mut diff: Vec<IfdStatus> = remaining.into_iter().cloned().collect();
        diff.extend(disconnected);
        diff
    }
}

fn convert(terminals: &[TerminalState]) -> Vec<IfdStatus> {
    terminals
        .iter()
        .map(|t| IfdStatus {
            ifd_name: t.name.clone(),
            connected: true,
            slots: vec![SlotStatus {
                index: 0,
                card_available: t.card_present,
                atr: None,
            }],
        })
        .collect()
}

fn state_equal(a: &IfdStatus, b: &IfdStatus) -> bool {
    a.ifd_name == b.ifd_name
        && a.connected == b.connected
        && a.slots.len() == b.slots.len()
        && a.slots.iter().zip(&b.slots).all(|(sa, sb)| {
            // the ATR is ignored, the initial snapshot does not carry one
            sa.card_available == sb.card_available && sa.index == sb.index
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_scio::mock::MockReaders;

    fn watcher_over(readers: &MockReaders, timeout: Duration) -> EventWatcher {
        let cm = Arc::new(ChannelManager::new(Arc::new(readers.clone())));
        EventWatcher::new(cm, timeout).unwrap()
    }

    #[test]
    fn immediate_return_when_expectation_differs() {
        let readers = MockReaders::new();
        readers.add_terminal("Reader A");

        let mut watcher = watcher_over(&readers, Duration::from_secs(30));
        let initial = watcher.start().unwrap();
        assert_eq!(initial.len(), 1);

        // caller claims a card is present, reality disagrees
        let mut expected = initial;
        expected[0].slots[0].card_available = true;
        watcher.set_expected(expected);

        let diff = watcher.run().unwrap();
        assert_eq!(diff.len(), 1);
        assert!(!diff[0].slots[0].card_available);
        // the blocking wait was never entered
        assert_eq!(readers.wait_calls(), 0);
    }

    #[test]
    fn card_insertion_produces_diff_with_atr() {
        let readers = MockReaders::new();
        readers.add_terminal("Reader A");

        let mut watcher = watcher_over(&readers, Duration::from_secs(5));
        let initial = watcher.start().unwrap();
        watcher.set_expected(initial);

        readers.insert_card("Reader A", &[0x3B, 0x8A]);
        let diff = watcher.run().unwrap();
        assert_eq!(diff.len(), 1);
        assert!(diff[0].slots[0].card_available);
        assert_eq!(diff[0].slots[0].atr.as_deref(), Some(&[0x3Bu8, 0x8A][..]));
    }

    #[test]
    fn event_burst_collapses_into_one_update() {
        let readers = MockReaders::new();
        readers.add_terminal("Reader A");

        let mut watcher = watcher_over(&readers, Duration::from_secs(5));
        let initial = watcher.start().unwrap();
        watcher.set_expected(initial);

        // insert and remove before the watcher looks: net effect is no card,
        // but the terminal entry saw both events
        readers.insert_card("Reader A", &[0x3B]);
        readers.remove_card("Reader A");
        let diff = watcher.run().unwrap();
        // both events applied, state matches expectation again except that
        // nothing differs; diff may be empty
        assert!(diff.is_empty());
    }

    #[test]
    fn vanished_terminal_reported_disconnected() {
        let readers = MockReaders::new();

        let mut watcher = watcher_over(&readers, Duration::from_millis(50));
        watcher.start().unwrap();
        // caller expects a terminal that never existed
        watcher.set_expected(vec![IfdStatus::empty("Ghost Reader")]);

        let diff = watcher.run().unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].ifd_name, "Ghost Reader");
        assert!(!diff[0].connected);
    }

    #[test]
    fn timeout_yields_empty_diff() {
        let readers = MockReaders::new();
        readers.add_terminal("Reader A");

        let mut watcher = watcher_over(&readers, Duration::from_millis(30));
        let initial = watcher.start().unwrap();
        watcher.set_expected(initial);

        let diff = watcher.run().unwrap();
        assert!(diff.is_empty());
        assert!(readers.wait_calls() >= 1);
    }
}
