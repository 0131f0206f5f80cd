//! Terminal, card and watcher contracts
//!
//! These traits are the seam between the IFD layer and a concrete smart-card
//! stack. A backend (PC/SC, an emulator, a test double) implements them; the
//! layers above only ever talk to trait objects.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{NoSuchTerminal, ScioError};

/// Result alias of this crate.
pub type ScioResult<T> = Result<T, ScioError>;

/// Card protocol requested on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScioProtocol {
    /// Character oriented T=0.
    T0,
    /// Block oriented T=1.
    T1,
    /// Whatever the stack can negotiate.
    #[default]
    Any,
}

/// Presence snapshot of one terminal as seen by a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalState {
    /// Terminal name, unique within the backend.
    pub name: String,
    /// Whether a card is present in the (single) slot.
    pub card_present: bool,
}

/// Kind of a state transition observed by a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeKind {
    /// A new terminal appeared.
    TerminalAdded,
    /// A known terminal disappeared.
    TerminalRemoved,
    /// A card was inserted into a known terminal.
    CardInserted,
    /// The card was removed from a known terminal.
    CardRemoved,
}

/// One state transition of one terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Name of the affected terminal.
    pub terminal: String,
    /// What happened.
    pub kind: StateChangeKind,
}

/// Outcome of a bounded blocking wait.
///
/// `Cancelled` covers both an elapsed timeout and an explicit
/// [`WatchCanceler::cancel`]; the caller decides which of the two it was.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A real transition happened.
    Change(StateChange),
    /// The wait ended without a transition.
    Cancelled,
}

impl WatchEvent {
    /// Whether the wait ended without observing a transition.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Entry point of a backend: terminal enumeration and watcher creation.
pub trait ScioTerminals: Send + Sync {
    /// List the currently attached terminals.
    fn list(&self) -> ScioResult<Vec<Arc<dyn ScioTerminal>>>;

    /// Look up a terminal by name.
    fn get(&self, name: &str) -> Result<Arc<dyn ScioTerminal>, NoSuchTerminal>;

    /// Create a fresh watcher over this backend.
    fn watcher(&self) -> ScioResult<Box<dyn TerminalWatcher>>;

    /// Whether the backend's blocking card-presence wait actually works.
    ///
    /// A backend with a defective native wait returns `false`; pollers then
    /// substitute a short fixed sleep for the blocking call.
    fn supports_card_presence_wait(&self) -> bool {
        true
    }
}

/// One physical (or emulated) card terminal.
pub trait ScioTerminal: Send + Sync {
    /// Name of the terminal.
    fn name(&self) -> &str;

    /// Whether a card is currently present.
    fn is_card_present(&self) -> ScioResult<bool>;

    /// Connect the card in this terminal and return its channel.
    fn connect(&self, protocol: ScioProtocol) -> ScioResult<Box<dyn ScioCard>>;
}

/// A connected card with its basic channel.
///
/// An instance owns the hardware access for its connection; commands are
/// serialized by the exclusive `&mut` receiver.
pub trait ScioCard: Send {
    /// Answer To Reset of the card.
    fn atr(&self) -> Bytes;

    /// Protocol the connection was established with.
    fn protocol(&self) -> ScioProtocol;

    /// Name of the terminal the card sits in.
    fn terminal_name(&self) -> &str;

    /// Transmit one APDU and return the full response including trailer.
    fn transmit(&mut self, apdu: &[u8]) -> ScioResult<Bytes>;

    /// Transmit a reader control command (vendor function, not card data).
    fn transmit_control(&mut self, code: u32, data: &[u8]) -> ScioResult<Bytes>;

    /// Acquire the hardware transaction lock for this connection.
    fn begin_exclusive(&mut self) -> ScioResult<()>;

    /// Release the hardware transaction lock.
    fn end_exclusive(&mut self) -> ScioResult<()>;

    /// Re-establish the connection after a reset, keeping the instance valid.
    fn reconnect(&mut self) -> ScioResult<()>;

    /// Disconnect, optionally resetting the card.
    fn disconnect(&mut self, reset: bool) -> ScioResult<()>;
}

/// Diff source of the event subsystem: snapshot once, then block for changes.
pub trait TerminalWatcher: Send {
    /// Capture and return the initial state of all terminals.
    ///
    /// Must be called exactly once, before the first
    /// [`wait_for_change`](Self::wait_for_change).
    fn start(&mut self) -> ScioResult<Vec<TerminalState>>;

    /// Block until a transition happens, the timeout elapses or the watcher
    /// is cancelled from another thread.
    fn wait_for_change(&mut self, timeout: Duration) -> ScioResult<WatchEvent>;

    /// Obtain a handle that can abort a pending wait from another thread.
    fn canceler(&self) -> Arc<dyn WatchCanceler>;
}

/// Cross-thread cancellation handle of a [`TerminalWatcher`].
pub trait WatchCanceler: Send + Sync {
    /// Unblock the watcher's pending wait; it reports [`WatchEvent::Cancelled`].
    fn cancel(&self);
}
