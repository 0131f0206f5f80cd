//! Scriptable in-memory backend
//!
//! [`MockReaders`] implements the full SCIO contract without hardware. Tests
//! script terminal attach/detach and card insertion/removal and assert on the
//! events and transmissions the layers above produce. Card responses come
//! from programmable responder closures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::{NoSuchTerminal, ScioError, ScioErrorCode};
use crate::terminal::{
    ScioCard, ScioProtocol, ScioResult, ScioTerminal, ScioTerminals, StateChange, StateChangeKind,
    TerminalState, TerminalWatcher, WatchCanceler, WatchEvent,
};

type Responder = dyn Fn(&[u8]) -> ScioResult<Vec<u8>> + Send + Sync;
type ControlResponder = dyn Fn(u32, &[u8]) -> ScioResult<Vec<u8>> + Send + Sync;

#[derive(Clone)]
struct MockCard {
    atr: Bytes,
    generation: u64,
    responder: Arc<Responder>,
    control: Arc<ControlResponder>,
}

#[derive(Clone, Default)]
struct MockSlot {
    card: Option<MockCard>,
    exclusive_by: Option<u64>,
}

struct MockState {
    terminals: Mutex<BTreeMap<String, MockSlot>>,
    subscribers: Mutex<Vec<Sender<StateChange>>>,
    wait_calls: AtomicUsize,
    generation: AtomicU64,
    handle_ids: AtomicU64,
    blocking_wait: AtomicBool,
}

impl MockState {
    fn broadcast(&self, event: StateChange) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Scripted terminal backend for tests.
#[derive(Clone)]
pub struct MockReaders {
    state: Arc<MockState>,
}

impl std::fmt::Debug for MockReaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockReaders").finish_non_exhaustive()
    }
}

impl Default for MockReaders {
    fn default() -> Self {
        Self::new()
    }
}

impl MockReaders {
    /// Create an empty backend with no terminals attached.
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                terminals: Mutex::new(BTreeMap::new()),
                subscribers: Mutex::new(Vec::new()),
                wait_calls: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                handle_ids: AtomicU64::new(0),
                blocking_wait: AtomicBool::new(true),
            }),
        }
    }

    /// Make [`ScioTerminals::supports_card_presence_wait`] report `false`.
    pub fn with_broken_presence_wait(self) -> Self {
        self.state.blocking_wait.store(false, Ordering::Relaxed);
        self
    }

    /// Attach a new, empty terminal.
    pub fn add_terminal(&self, name: &str) {
        let mut terminals = self.state.terminals.lock().unwrap();
        if terminals.insert(name.to_string(), MockSlot::default()).is_none() {
            self.state.broadcast(StateChange {
                terminal: name.to_string(),
                kind: StateChangeKind::TerminalAdded,
            });
        }
    }

    /// Detach a terminal, dropping any card it holds.
    pub fn remove_terminal(&self, name: &str) {
        let mut terminals = self.state.terminals.lock().unwrap();
        if terminals.remove(name).is_some() {
            self.state.broadcast(StateChange {
                terminal: name.to_string(),
                kind: StateChangeKind::TerminalRemoved,
            });
        }
    }

    /// Insert a card answering every APDU with `90 00`.
    pub fn insert_card(&self, name: &str, atr: &[u8]) {
        self.insert_card_with(name, atr, |_| Ok(vec![0x90, 0x00]));
    }

    /// Insert a card with a programmable APDU responder.
    pub fn insert_card_with<F>(&self, name: &str, atr: &[u8], responder: F)
    where
        F: Fn(&[u8]) -> ScioResult<Vec<u8>> + Send + Sync + 'static,
    {
        let card = MockCard {
            atr: Bytes::copy_from_slice(atr),
            generation: self.state.generation.fetch_add(1, Ordering::Relaxed),
            responder: Arc::new(responder),
            control: Arc::new(|_, _| {
                Err(ScioError::new(
                    ScioErrorCode::Unknown,
                    "control commands not scripted",
                ))
            }),
        };
        let mut terminals = self.state.terminals.lock().unwrap();
        if let Some(slot) = terminals.get_mut(name) {
            slot.card = Some(card);
            slot.exclusive_by = None;
            self.state.broadcast(StateChange {
                terminal: name.to_string(),
                kind: StateChangeKind::CardInserted,
            });
        }
    }

    /// Script the reader control responder of the card currently in `name`.
    pub fn set_control_responder<F>(&self, name: &str, control: F)
    where
        F: Fn(u32, &[u8]) -> ScioResult<Vec<u8>> + Send + Sync + 'static,
    {
        let mut terminals = self.state.terminals.lock().unwrap();
        if let Some(card) = terminals.get_mut(name).and_then(|s| s.card.as_mut()) {
            card.control = Arc::new(control);
        }
    }

    /// Remove the card from a terminal.
    pub fn remove_card(&self, name: &str) {
        let mut terminals = self.state.terminals.lock().unwrap();
        if let Some(slot) = terminals.get_mut(name) {
            if slot.card.take().is_some() {
                slot.exclusive_by = None;
                self.state.broadcast(StateChange {
                    terminal: name.to_string(),
                    kind: StateChangeKind::CardRemoved,
                });
            }
        }
    }

    /// Number of `wait_for_change` invocations across all watchers.
    pub fn wait_calls(&self) -> usize {
        self.state.wait_calls.load(Ordering::Relaxed)
    }
}

impl ScioTerminals for MockReaders {
    fn list(&self) -> ScioResult<Vec<Arc<dyn ScioTerminal>>> {
        let terminals = self.state.terminals.lock().unwrap();
        Ok(terminals
            .keys()
            .map(|name| {
                Arc::new(MockTerminal {
                    name: name.clone(),
                    state: Arc::clone(&self.state),
                }) as Arc<dyn ScioTerminal>
            })
            .collect())
    }

    fn get(&self, name: &str) -> Result<Arc<dyn ScioTerminal>, NoSuchTerminal> {
        let terminals = self.state.terminals.lock().unwrap();
        if terminals.contains_key(name) {
            Ok(Arc::new(MockTerminal {
                name: name.to_string(),
                state: Arc::clone(&self.state),
            }))
        } else {
            Err(NoSuchTerminal(name.to_string()))
        }
    }

    fn watcher(&self) -> ScioResult<Box<dyn TerminalWatcher>> {
        let (cancel_tx, cancel_rx) = unbounded();
        Ok(Box::new(MockWatcher {
            state: Arc::clone(&self.state),
            events: None,
            cancel_tx,
            cancel_rx,
        }))
    }

    fn supports_card_presence_wait(&self) -> bool {
        self.state.blocking_wait.load(Ordering::Relaxed)
    }
}

struct MockTerminal {
    name: String,
    state: Arc<MockState>,
}

impl ScioTerminal for MockTerminal {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_card_present(&self) -> ScioResult<bool> {
        let terminals = self.state.terminals.lock().unwrap();
        terminals
            .get(&self.name)
            .map(|slot| slot.card.is_some())
            .ok_or_else(|| ScioError::new(ScioErrorCode::ReaderUnavailable, "terminal detached"))
    }

    fn connect(&self, protocol: ScioProtocol) -> ScioResult<Box<dyn ScioCard>> {
        let terminals = self.state.terminals.lock().unwrap();
        let slot = terminals
            .get(&self.name)
            .ok_or_else(|| ScioError::new(ScioErrorCode::ReaderUnavailable, "terminal detached"))?;
        let card = slot
            .card
            .as_ref()
            .ok_or_else(|| ScioError::new(ScioErrorCode::NoSmartcard, "no card present"))?
            .clone();
        Ok(Box::new(MockCardHandle {
            terminal: self.name.clone(),
            state: Arc::clone(&self.state),
            handle_id: self.state.handle_ids.fetch_add(1, Ordering::Relaxed),
            atr: card.atr.clone(),
            generation: card.generation,
            protocol: match protocol {
                ScioProtocol::Any => ScioProtocol::T1,
                other => other,
            },
        }))
    }
}

struct MockCardHandle {
    terminal: String,
    state: Arc<MockState>,
    handle_id: u64,
    atr: Bytes,
    generation: u64,
    protocol: ScioProtocol,
}

impl MockCardHandle {
    /// Fetch the live card, verifying it is still the same insertion.
    fn live_card(&self) -> ScioResult<MockCard> {
        let terminals = self.state.terminals.lock().unwrap();
        let slot = terminals
            .get(&self.terminal)
            .ok_or_else(|| ScioError::new(ScioErrorCode::ReaderUnavailable, "terminal detached"))?;
        match &slot.card {
            Some(card) if card.generation == self.generation => Ok(card.clone()),
            _ => Err(ScioError::new(
                ScioErrorCode::RemovedCard,
                "card removed since connect",
            )),
        }
    }
}

impl ScioCard for MockCardHandle {
    fn atr(&self) -> Bytes {
        self.atr.clone()
    }

    fn protocol(&self) -> ScioProtocol {
        self.protocol
    }

    fn terminal_name(&self) -> &str {
        &self.terminal
    }

    fn transmit(&mut self, apdu: &[u8]) -> ScioResult<Bytes> {
        let card = self.live_card()?;
        (card.responder)(apdu).map(Bytes::from)
    }

    fn transmit_control(&mut self, code: u32, data: &[u8]) -> ScioResult<Bytes> {
        let card = self.live_card()?;
        (card.control)(code, data).map(Bytes::from)
    }

    fn begin_exclusive(&mut self) -> ScioResult<()> {
        self.live_card()?;
        let mut terminals = self.state.terminals.lock().unwrap();
        let slot = terminals.get_mut(&self.terminal).ok_or_else(|| {
            ScioError::new(ScioErrorCode::ReaderUnavailable, "terminal detached")
        })?;
        match slot.exclusive_by {
            Some(owner) if owner != self.handle_id => Err(ScioError::new(
                ScioErrorCode::SharingViolation,
                "card locked by another channel",
            )),
            _ => {
                slot.exclusive_by = Some(self.handle_id);
                Ok(())
            }
        }
    }

    fn end_exclusive(&mut self) -> ScioResult<()> {
        let mut terminals = self.state.terminals.lock().unwrap();
        let slot = terminals.get_mut(&self.terminal).ok_or_else(|| {
            ScioError::new(ScioErrorCode::ReaderUnavailable, "terminal detached")
        })?;
        if slot.exclusive_by == Some(self.handle_id) {
            slot.exclusive_by = None;
            Ok(())
        } else {
            Err(ScioError::new(
                ScioErrorCode::Unknown,
                "no transaction held by this channel",
            ))
        }
    }

    fn reconnect(&mut self) -> ScioResult<()> {
        self.live_card().map(|_| ())
    }

    fn disconnect(&mut self, _reset: bool) -> ScioResult<()> {
        let mut terminals = self.state.terminals.lock().unwrap();
        if let Some(slot) = terminals.get_mut(&self.terminal) {
            if slot.exclusive_by == Some(self.handle_id) {
                slot.exclusive_by = None;
            }
        }
        Ok(())
    }
}

struct MockWatcher {
    state: Arc<MockState>,
    events: Option<Receiver<StateChange>>,
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
}

impl TerminalWatcher for MockWatcher {
    fn start(&mut self) -> ScioResult<Vec<TerminalState>> {
        // Terminals lock held across subscribe + snapshot so no event between
        // the two is lost or duplicated.
        let terminals = self.state.terminals.lock().unwrap();
        let (tx, rx) = unbounded();
        self.state.subscribers.lock().unwrap().push(tx);
        self.events = Some(rx);
        Ok(terminals
            .iter()
            .map(|(name, slot)| TerminalState {
                name: name.clone(),
                card_present: slot.card.is_some(),
            })
            .collect())
    }

    fn wait_for_change(&mut self, timeout: Duration) -> ScioResult<WatchEvent> {
        self.state.wait_calls.fetch_add(1, Ordering::Relaxed);
        let events = self.events.as_ref().ok_or_else(|| {
            ScioError::new(ScioErrorCode::Unknown, "watcher not started")
        })?;
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(event) => Ok(WatchEvent::Change(event)),
                Err(_) => Ok(WatchEvent::Cancelled),
            },
            recv(self.cancel_rx) -> _ => Ok(WatchEvent::Cancelled),
            default(timeout) => Ok(WatchEvent::Cancelled),
        }
    }

    fn canceler(&self) -> Arc<dyn WatchCanceler> {
        Arc::new(MockCanceler {
            tx: self.cancel_tx.clone(),
        })
    }
}

struct MockCanceler {
    tx: Sender<()>,
}

impl WatchCanceler for MockCanceler {
    fn cancel(&self) {
        let _ = self.tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watcher_sees_scripted_events() {
        let readers = MockReaders::new();
        readers.add_terminal("Reader A");

        let mut watcher = readers.watcher().unwrap();
        let initial = watcher.start().unwrap();
        assert_eq!(initial.len(), 1);
        assert!(!initial[0].card_present);

        readers.insert_card("Reader A", &[0x3B, 0x8A]);
        let event = watcher.wait_for_change(Duration::from_millis(100)).unwrap();
        assert_eq!(
            event,
            WatchEvent::Change(StateChange {
                terminal: "Reader A".to_string(),
                kind: StateChangeKind::CardInserted,
            })
        );

        // nothing further pending
        let event = watcher.wait_for_change(Duration::from_millis(1)).unwrap();
        assert!(event.is_cancelled());
    }

    #[test]
    fn canceler_unblocks_wait() {
        let readers = MockReaders::new();
        let mut watcher = readers.watcher().unwrap();
        watcher.start().unwrap();
        let canceler = watcher.canceler();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceler.cancel();
        });
        let event = watcher.wait_for_change(Duration::from_secs(30)).unwrap();
        assert!(event.is_cancelled());
        handle.join().unwrap();
    }

    #[test]
    fn card_handle_outlives_removal_but_fails() {
        let readers = MockReaders::new();
        readers.add_terminal("Reader A");
        readers.insert_card("Reader A", &[0x3B]);

        let terminal = readers.get("Reader A").unwrap();
        let mut card = terminal.connect(ScioProtocol::Any).unwrap();
        assert_eq!(card.transmit(&[0x00, 0xA4, 0x04, 0x00]).unwrap().as_ref(), &[0x90, 0x00]);

        readers.remove_card("Reader A");
        let err = card.transmit(&[0x00, 0xA4, 0x04, 0x00]).unwrap_err();
        assert_eq!(err.code(), ScioErrorCode::RemovedCard);
    }

    #[test]
    fn exclusive_lock_is_per_handle() {
        let readers = MockReaders::new();
        readers.add_terminal("Reader A");
        readers.insert_card("Reader A", &[0x3B]);

        let terminal = readers.get("Reader A").unwrap();
        let mut first = terminal.connect(ScioProtocol::Any).unwrap();
        let mut second = terminal.connect(ScioProtocol::Any).unwrap();

        first.begin_exclusive().unwrap();
        let err = second.begin_exclusive().unwrap_err();
        assert_eq!(err.code(), ScioErrorCode::SharingViolation);

        first.end_exclusive().unwrap();
        second.begin_exclusive().unwrap();
        second.end_exclusive().unwrap();
    }
}
