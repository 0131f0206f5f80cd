//! The terminal layer facade
//!
//! An [`Ifd`] owns one shared context over a terminal backend and exposes the
//! full operation set: context lifecycle, enumeration and status, long
//! running waits with cancellation, card channels, APDU batches, reader
//! control functions, PIN verification and channel establishment. Operations
//! report failures through [`Outcome`] values; only an explicit cancel makes
//! an operation return [`Terminated`].

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera_scio::{ScioErrorCode, ScioTerminals, WatchCanceler};
use tracing::{debug, info, warn};

use crate::channel::TransmitFault;
use crate::config::{IfdConfig, PauseCoordinator};
use crate::consent::UserConsent;
use crate::error::{IfdResult, Minor, Outcome, Terminated, outcome_or_terminated};
use crate::listener::EventListener;
use crate::manager::{ChannelManager, OpenChannelError};
use crate::pool::{PendingWait, SessionTable, WaitPool};
use crate::protocol::{ProtocolFactory, ProtocolRegistry, uris};
use crate::reader::{
    EstablishPaceRequest, EstablishPaceResponse, ExecutePaceRequest, ExecutePaceResponse, Feature,
    PaceCapability, PaceFunction, pace_protocol_list,
};
use crate::terminal::{OutputInfo, UserTerminal};
use crate::terminal_info::{TerminalInfo, collect_status};
use crate::types::{
    CancelTarget, CapabilitiesResponse, ConnectResponse, ContextHandle, ControlResponse,
    DisconnectAction, EstablishChannelRequest, EstablishChannelResponse, EstablishContextResponse,
    IfdStatus, InputApdu, ListTerminalsResponse, SharedCallback, SimpleResponse, SlotCapability,
    SlotHandle, SlotStatus, StatusResponse, TransmitResponse, VerifyUser, VerifyUserResponse,
    WaitResponse,
};
use crate::watcher::EventWatcher;

/// Substitute for an unbounded wait; avoids overflowing deadline arithmetic.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

const MSG_NO_CONTEXT: &str = "Context not initialized.";
const MSG_BAD_CONTEXT: &str = "Invalid context handle specified.";
const MSG_NO_SLOT: &str = "Slot handle is not available.";

/// Facade over one terminal backend.
///
/// All operations take `&self`; the facade is meant to be shared behind an
/// [`Arc`] between clients and background threads.
pub struct Ifd {
    config: IfdConfig,
    pause: PauseCoordinator,
    terminals: Arc<dyn ScioTerminals>,
    gui: Option<Arc<dyn UserConsent>>,
    protocols: Mutex<ProtocolRegistry>,
    state: Mutex<Option<IfdState>>,
}

impl std::fmt::Debug for Ifd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ifd")
            .field("config", &self.config)
            .field("established", &self.state.lock().unwrap().is_some())
            .finish_non_exhaustive()
    }
}

/// Live parts of the established context.
struct IfdState {
    context: ContextHandle,
    clients: usize,
    cm: Arc<ChannelManager>,
    pool: Arc<WaitPool>,
    sessions: Arc<SessionTable>,
}

impl IfdState {
    fn parts(&self) -> ContextParts {
        ContextParts {
            cm: Arc::clone(&self.cm),
            pool: Arc::clone(&self.pool),
            sessions: Arc::clone(&self.sessions),
        }
    }
}

/// Clonable handles an operation works with after the context check.
struct ContextParts {
    cm: Arc<ChannelManager>,
    pool: Arc<WaitPool>,
    sessions: Arc<SessionTable>,
}

/// Event source of one wait, chosen by configuration.
enum WaitSource {
    Watcher(EventWatcher),
    Listener(EventListener),
}

impl WaitSource {
    fn set_expected(&mut self, expected: Vec<IfdStatus>) {
        match self {
            Self::Watcher(watcher) => watcher.set_expected(expected),
            Self::Listener(listener) => listener.set_expected(expected),
        }
    }

    fn canceler(&self) -> Arc<dyn WatchCanceler> {
        match self {
            Self::Watcher(watcher) => watcher.canceler(),
            Self::Listener(listener) => listener.canceler(),
        }
    }

    fn run(&mut self) -> tessera_scio::ScioResult<Vec<IfdStatus>> {
        match self {
            Self::Watcher(watcher) => watcher.run(),
            Self::Listener(listener) => listener.run(),
        }
    }
}

impl Ifd {
    /// Facade over a terminal backend with default configuration.
    pub fn new(terminals: Arc<dyn ScioTerminals>) -> Self {
        Self::with_config(terminals, IfdConfig::default())
    }

    /// Facade over a terminal backend with explicit configuration.
    pub fn with_config(terminals: Arc<dyn ScioTerminals>, config: IfdConfig) -> Self {
        Self {
            config,
            pause: PauseCoordinator::new(),
            terminals,
            gui: None,
            protocols: Mutex::new(ProtocolRegistry::new()),
            state: Mutex::new(None),
        }
    }

    /// Attach a consent engine; dialogs stand in for missing reader hardware.
    pub fn set_gui(&mut self, gui: Arc<dyn UserConsent>) {
        self.gui = Some(gui);
    }

    /// Register a software channel establishment protocol.
    ///
    /// Returns `false` when the identifier is already taken.
    pub fn add_protocol(&self, protocol: &str, factory: Box<dyn ProtocolFactory>) -> bool {
        self.protocols.lock().unwrap().add(protocol, factory)
    }

    /// Open the polling pause window, keeping event pollers off the hardware.
    pub fn pause_events(&self) {
        self.pause.pause(self.config.pause_delay());
    }

    /// Establish (or join) the context.
    ///
    /// The context is shared: every caller receives the same handle, and the
    /// context lives until as many releases as establishments happened.
    pub fn establish_context(&self) -> EstablishContextResponse {
        let mut guard = self.state.lock().unwrap();
        let state = guard.get_or_insert_with(|| {
            info!("establishing terminal context");
            IfdState {
                context: ContextHandle::random(),
                clients: 0,
                cm: Arc::new(ChannelManager::new(Arc::clone(&self.terminals))),
                pool: Arc::new(WaitPool::new()),
                sessions: Arc::new(SessionTable::new()),
            }
        });
        state.clients += 1;
        EstablishContextResponse {
            outcome: Outcome::ok(),
            context: Some(state.context),
        }
    }

    /// Release the context; the last release tears everything down.
    pub fn release_context(&self, ctx: &ContextHandle) -> SimpleResponse {
        let mut guard = self.state.lock().unwrap();
        let Some(state) = guard.as_mut() else {
            return SimpleResponse {
                outcome: Outcome::error(Minor::InvalidContextHandle, MSG_NO_CONTEXT),
            };
        };
        if state.context != *ctx {
            return SimpleResponse {
                outcome: Outcome::error(Minor::InvalidContextHandle, MSG_BAD_CONTEXT),
            };
        }
        state.clients -= 1;
        if state.clients == 0 {
            let state = guard.take().expect("state checked above");
            drop(guard);
            state.sessions.cancel_all();
            state.cm.shutdown();
            info!("terminal context released");
        }
        SimpleResponse {
            outcome: Outcome::ok(),
        }
    }

    fn checked_parts(&self, ctx: &ContextHandle) -> Result<ContextParts, Outcome> {
        match self.state.lock().unwrap().as_ref() {
            Some(state) if state.context == *ctx => Ok(state.parts()),
            Some(_) => Err(Outcome::error(Minor::InvalidContextHandle, MSG_BAD_CONTEXT)),
            None => Err(Outcome::error(Minor::InvalidContextHandle, MSG_NO_CONTEXT)),
        }
    }

    /// Slot-handle operations report a missing context as an invalid slot.
    fn slot_parts(&self) -> Result<ContextParts, Outcome> {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(IfdState::parts)
            .ok_or_else(|| Outcome::error(Minor::InvalidSlotHandle, MSG_NO_CONTEXT))
    }

    /// Names of all attached terminals.
    pub fn list_terminals(&self, ctx: &ContextHandle) -> ListTerminalsResponse {
        let parts = match self.checked_parts(ctx) {
            Ok(parts) => parts,
            Err(outcome) => {
                return ListTerminalsResponse {
                    outcome,
                    terminals: Vec::new(),
                };
            }
        };
        match parts.cm.terminals().list() {
            Ok(list) => ListTerminalsResponse {
                outcome: Outcome::ok(),
                terminals: list.iter().map(|t| t.name().to_string()).collect(),
            },
            Err(e) => ListTerminalsResponse {
                outcome: Outcome::unknown_ifd_error(e.message()),
                terminals: Vec::new(),
            },
        }
    }

    /// Capabilities of one terminal.
    ///
    /// Hardware capabilities are augmented with the registered software
    /// protocols and with plain PIN comparison, which the dialog based
    /// verification path provides on any reader.
    pub fn get_capabilities(&self, ctx: &ContextHandle, ifd_name: &str) -> CapabilitiesResponse {
        let parts = match self.checked_parts(ctx) {
            Ok(parts) => parts,
            Err(outcome) => {
                return CapabilitiesResponse {
                    outcome,
                    capabilities: None,
                };
            }
        };
        let Ok(terminal) = parts.cm.terminals().get(ifd_name) else {
            return CapabilitiesResponse {
                outcome: Outcome::error(Minor::UnknownIfd, "Requested terminal not found."),
                capabilities: None,
            };
        };
        let info = match parts.cm.master_channel(ifd_name) {
            Some(channel) => TerminalInfo::connected(terminal, channel),
            // without a card only the hardware-less view remains
            None => match parts.cm.open_master_channel(ifd_name) {
                Ok(channel) => TerminalInfo::connected(terminal, channel),
                Err(_) => TerminalInfo::unconnected(terminal),
            },
        };
        match info.capabilities() {
            Ok(mut capabilities) => {
                self.augment_protocols(&mut capabilities.slot);
                CapabilitiesResponse {
                    outcome: Outcome::ok(),
                    capabilities: Some(capabilities),
                }
            }
            Err(e) => CapabilitiesResponse {
                outcome: Outcome::unknown_ifd_error(e.message()),
                capabilities: None,
            },
        }
    }

    fn augment_protocols(&self, slot: &mut SlotCapability) {
        for proto in self.protocols.lock().unwrap().protocols() {
            if !slot.protocols.contains(&proto) {
                slot.protocols.push(proto);
            }
        }
        let pin_compare = uris::PIN_COMPARE.to_string();
        if !slot.protocols.contains(&pin_compare) {
            slot.protocols.push(pin_compare);
        }
    }

    /// Status of one terminal, or of every attached terminal.
    pub fn get_status(&self, ctx: &ContextHandle, ifd_name: Option<&str>) -> StatusResponse {
        let parts = match self.checked_parts(ctx) {
            Ok(parts) => parts,
            Err(outcome) => {
                return StatusResponse {
                    outcome,
                    statuses: Vec::new(),
                };
            }
        };
        let terminals = match ifd_name {
            Some(name) => match parts.cm.terminals().get(name) {
                Ok(terminal) => vec![terminal],
                Err(_) => {
                    return StatusResponse {
                        outcome: Outcome::error(
                            Minor::UnknownIfd,
                            "The requested IFD name does not exist.",
                        ),
                        statuses: Vec::new(),
                    };
                }
            },
            None => match parts.cm.terminals().list() {
                Ok(list) => list,
                Err(e) => {
                    return StatusResponse {
                        outcome: Outcome::unknown_ifd_error(e.message()),
                        statuses: Vec::new(),
                    };
                }
            },
        };

        let mut statuses = Vec::new();
        for terminal in terminals {
            let info = match parts.cm.master_channel(terminal.name()) {
                Some(channel) => TerminalInfo::connected(Arc::clone(&terminal), channel),
                None => TerminalInfo::unconnected(Arc::clone(&terminal)),
            };
            match info.status(&parts.cm) {
                Ok(status) => statuses.push(status),
                Err(e) => {
                    warn!(terminal = terminal.name(), "status query failed: {e}");
                    return StatusResponse {
                        outcome: Outcome::unknown_ifd_error(format!(
                            "Failed to determine status of terminal '{}'.",
                            terminal.name()
                        )),
                        statuses: Vec::new(),
                    };
                }
            }
        }
        StatusResponse {
            outcome: Outcome::ok(),
            statuses,
        }
    }

    /// Wait until the terminal landscape deviates from the expected state.
    ///
    /// An empty expectation answers immediately with the current snapshot.
    /// With a callback the wait runs asynchronously: the response only
    /// carries the session identifier, and the diff is delivered through the
    /// callback once it exists. Without a callback the caller blocks. A
    /// missing timeout means effectively unbounded.
    pub fn wait(
        &self,
        ctx: &ContextHandle,
        timeout: Option<Duration>,
        mut expected: Vec<IfdStatus>,
        callback: Option<SharedCallback>,
    ) -> IfdResult<WaitResponse> {
        let parts = match self.checked_parts(ctx) {
            Ok(parts) => parts,
            Err(outcome) => return Ok(wait_failure(outcome)),
        };
        let timeout = match timeout {
            None => UNBOUNDED_WAIT,
            Some(t) if t.is_zero() => {
                return Ok(wait_failure(Outcome::error(
                    Minor::IncorrectParameter,
                    "Invalid timeout value given, must be strictly positive.",
                )));
            }
            Some(t) => t,
        };
        // expectation entries without slot state compare against an empty slot
        for entry in &mut expected {
            if entry.slots.is_empty() {
                entry.slots.push(SlotStatus::empty());
            }
        }

        let mut source = if self.config.use_polling_listener {
            if expected.is_empty() {
                let events = match collect_status(&parts.cm) {
                    Ok(events) => events,
                    Err(e) => {
                        return Ok(wait_failure(outcome_or_terminated(
                            &e,
                            Minor::UnknownIfdError,
                        )?));
                    }
                };
                return Ok(WaitResponse {
                    outcome: Outcome::ok(),
                    events,
                    session: None,
                });
            }
            WaitSource::Listener(EventListener::new(
                Arc::clone(&parts.cm),
                self.pause.clone(),
                self.config.poll_delay(),
                timeout,
                true,
            ))
        } else {
            let mut watcher = match EventWatcher::new(Arc::clone(&parts.cm), timeout) {
                Ok(watcher) => watcher,
                Err(e) => {
                    return Ok(wait_failure(outcome_or_terminated(
                        &e,
                        Minor::UnknownIfdError,
                    )?));
                }
            };
            let initial = match watcher.start() {
                Ok(initial) => initial,
                Err(e) => {
                    return Ok(wait_failure(outcome_or_terminated(
                        &e,
                        Minor::UnknownIfdError,
                    )?));
                }
            };
            if expected.is_empty() {
                return Ok(WaitResponse {
                    outcome: Outcome::ok(),
                    events: initial,
                    session: None,
                });
            }
            WaitSource::Watcher(watcher)
        };
        source.set_expected(expected);

        let pending = PendingWait::new(source.canceler());
        let cancelled = pending.cancelled_handle();

        if let Some(callback) = callback {
            let session = hex::encode(rand::random::<[u8; 16]>());
            parts.sessions.register(&session, pending);
            let sessions = Arc::clone(&parts.sessions);
            let sid = session.clone();
            let _ = parts.pool.spawn(move || {
                let result = source.run();
                if cancelled.load(Ordering::SeqCst) {
                    return;
                }
                sessions.finish(&sid);
                match result {
                    Ok(events) => {
                        if let Err(e) = callback.signal(&sid, &events) {
                            // delivery is fire and forget, never retried
                            warn!(session = %sid, "wait result delivery failed: {e}");
                        }
                    }
                    Err(e) => warn!(session = %sid, "asynchronous wait failed: {e}"),
                }
            });
            return Ok(WaitResponse {
                outcome: Outcome::ok(),
                events: Vec::new(),
                session: Some(session),
            });
        }

        parts.sessions.register_sync(pending);
        let rx = parts.pool.spawn(move || source.run());
        let result = rx.recv();
        parts.sessions.finish_sync();
        if cancelled.load(Ordering::SeqCst) {
            return Err(Terminated);
        }
        match result {
            Ok(Ok(events)) => Ok(WaitResponse {
                outcome: Outcome::ok(),
                events,
                session: None,
            }),
            Ok(Err(e)) => {
                let minor = if e.code() == ScioErrorCode::InvalidHandle {
                    Minor::InvalidSlotHandle
                } else {
                    Minor::UnknownIfdError
                };
                Ok(wait_failure(outcome_or_terminated(&e, minor)?))
            }
            Err(_) => Ok(wait_failure(Outcome::unknown_error(
                "The wait worker ended without a result.",
            ))),
        }
    }

    /// Cancel a pending wait.
    pub fn cancel(&self, target: &CancelTarget) -> SimpleResponse {
        let sessions = self
            .state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| Arc::clone(&s.sessions));
        let outcome = match target {
            CancelTarget::Session(session) => {
                if sessions.is_some_and(|s| s.cancel(session)) {
                    Outcome::ok()
                } else {
                    Outcome::error(
                        Minor::CancelNotPossible,
                        "No matching Wait call exists for the given session.",
                    )
                }
            }
            CancelTarget::Terminal(_) => {
                if sessions.is_some_and(|s| s.cancel_sync()) {
                    Outcome::ok()
                } else {
                    Outcome::error(Minor::CancelNotPossible, "No synchronous Wait to cancel.")
                }
            }
        };
        SimpleResponse { outcome }
    }

    /// Connect the card in a terminal and hand out a slot handle.
    pub fn connect(
        &self,
        ctx: &ContextHandle,
        ifd_name: &str,
        exclusive: bool,
    ) -> IfdResult<ConnectResponse> {
        let parts = match self.checked_parts(ctx) {
            Ok(parts) => parts,
            Err(outcome) => return Ok(ConnectResponse { outcome, slot: None }),
        };
        // the shared channel first, so status queries keep working
        if let Err(e) = parts.cm.open_master_channel(ifd_name) {
            return Ok(ConnectResponse {
                outcome: open_error_outcome(&e)?,
                slot: None,
            });
        }
        let (handle, channel) = match parts.cm.open_slave_channel(ifd_name) {
            Ok(pair) => pair,
            Err(e) => {
                return Ok(ConnectResponse {
                    outcome: open_error_outcome(&e)?,
                    slot: None,
                });
            }
        };
        if exclusive && let Err(e) = channel.begin_exclusive() {
            // roll the fresh channel back before reporting
            if let Ok(channel) = parts.cm.close_slave_channel(&handle)
                && let Err(e) = channel.shutdown(DisconnectAction::Leave)
            {
                debug!(terminal = ifd_name, "rollback shutdown failed: {e}");
            }
            return Ok(ConnectResponse {
                outcome: outcome_or_terminated(&e, Minor::UnknownIfdError)?,
                slot: None,
            });
        }
        debug!(terminal = ifd_name, exclusive, "connected card");
        Ok(ConnectResponse {
            outcome: Outcome::ok(),
            slot: Some(handle),
        })
    }

    /// Close a slot handle, optionally resetting the card.
    pub fn disconnect(&self, slot: &SlotHandle, action: DisconnectAction) -> IfdResult<SimpleResponse> {
        let parts = match self.slot_parts() {
            Ok(parts) => parts,
            Err(outcome) => return Ok(SimpleResponse { outcome }),
        };
        let Ok(channel) = parts.cm.close_slave_channel(slot) else {
            return Ok(SimpleResponse {
                outcome: Outcome::error(Minor::InvalidSlotHandle, MSG_NO_SLOT),
            });
        };
        let name = channel.terminal_name().to_string();
        if let Err(e) = channel.shutdown(action) {
            return Ok(SimpleResponse {
                outcome: outcome_or_terminated(&e, Minor::UnknownIfdError)?,
            });
        }
        if action == DisconnectAction::Reset
            && let Some(master) = parts.cm.master_channel(&name)
            && master.reconnect().is_err()
        {
            // the reset invalidated the shared channel, replace it
            parts.cm.close_master_channel(&name);
            if let Err(e) = parts.cm.open_master_channel(&name) {
                debug!(terminal = %name, "master channel reopen after reset failed: {e}");
            }
        }
        Ok(SimpleResponse {
            outcome: Outcome::ok(),
        })
    }

    /// Acquire the hardware transaction lock of a slot.
    pub fn begin_transaction(&self, slot: &SlotHandle) -> IfdResult<SimpleResponse> {
        self.with_transaction(slot, |channel| channel.begin_exclusive())
    }

    /// Release the hardware transaction lock of a slot.
    pub fn end_transaction(&self, slot: &SlotHandle) -> IfdResult<SimpleResponse> {
        self.with_transaction(slot, |channel| channel.end_exclusive())
    }

    fn with_transaction(
        &self,
        slot: &SlotHandle,
        op: impl FnOnce(&crate::channel::SlotChannel) -> tessera_scio::ScioResult<()>,
    ) -> IfdResult<SimpleResponse> {
        let parts = match self.slot_parts() {
            Ok(parts) => parts,
            Err(outcome) => return Ok(SimpleResponse { outcome }),
        };
        let Ok(channel) = parts.cm.slave_channel(slot) else {
            return Ok(SimpleResponse {
                outcome: Outcome::error(Minor::InvalidSlotHandle, MSG_NO_SLOT),
            });
        };
        let outcome = match op(&channel) {
            Ok(()) => Outcome::ok(),
            Err(e) => transaction_outcome(&e)?,
        };
        Ok(SimpleResponse { outcome })
    }

    /// Send a batch of APDUs, stopping at the first unaccepted response.
    ///
    /// Accepted status entries are validated up front; nothing reaches the
    /// card when one of them is malformed. The response list contains every
    /// answer received, including the one that stopped the batch.
    pub fn transmit(
        &self,
        slot: &SlotHandle,
        inputs: &[InputApdu],
    ) -> IfdResult<TransmitResponse> {
        let parts = match self.slot_parts() {
            Ok(parts) => parts,
            Err(outcome) => {
                return Ok(TransmitResponse {
                    outcome,
                    responses: Vec::new(),
                });
            }
        };
        for input in inputs {
            if input
                .accepted_status
                .iter()
                .any(|entry| !matches!(entry.len(), 1 | 2))
            {
                return Ok(TransmitResponse {
                    outcome: Outcome::error(
                        Minor::ParameterError,
                        "Invalid accepted status code given.",
                    ),
                    responses: Vec::new(),
                });
            }
        }
        let Ok(channel) = parts.cm.slave_channel(slot) else {
            return Ok(TransmitResponse {
                outcome: Outcome::error(Minor::InvalidSlotHandle, MSG_NO_SLOT),
                responses: Vec::new(),
            });
        };

        let mut responses = Vec::with_capacity(inputs.len());
        let mut outcome = Outcome::ok();
        for input in inputs {
            match channel.transmit(&input.apdu, &input.accepted_status) {
                Ok(response) => responses.push(response),
                Err(TransmitFault::Rejected { response }) => {
                    let trailer = hex::encode(&response[response.len().saturating_sub(2)..]);
                    responses.push(response);
                    outcome = Outcome::unknown_error(format!(
                        "Transmit stopped at unaccepted status {trailer}."
                    ));
                    break;
                }
                Err(TransmitFault::ChannelManagement) => {
                    outcome = Outcome::error(
                        Minor::InvalidSlotHandle,
                        "Command contains a MANAGE CHANNEL APDU.",
                    );
                    break;
                }
                Err(TransmitFault::SecureMessaging(msg)) => {
                    outcome = Outcome::unknown_error(msg);
                    break;
                }
                Err(TransmitFault::Scio(e)) => {
                    outcome = match e.code() {
                        ScioErrorCode::RemovedCard | ScioErrorCode::NoSmartcard => Outcome::error(
                            Minor::InvalidSlotHandle,
                            "Card removed during transmit.",
                        ),
                        _ => outcome_or_terminated(&e, Minor::UnknownIfdError)?,
                    };
                    break;
                }
            }
        }
        Ok(TransmitResponse { outcome, responses })
    }

    /// Invoke a vendor function of the reader behind a slot.
    ///
    /// The first command byte selects the feature; the remainder is passed
    /// through verbatim. The raw answer is evaluated as a status word.
    pub fn control_ifd(&self, slot: &SlotHandle, command: &[u8]) -> IfdResult<ControlResponse> {
        let parts = match self.slot_parts() {
            Ok(parts) => parts,
            Err(outcome) => {
                return Ok(ControlResponse {
                    outcome,
                    response: None,
                });
            }
        };
        let Ok(channel) = parts.cm.slave_channel(slot) else {
            return Ok(ControlResponse {
                outcome: Outcome::error(
                    Minor::UnknownIfd,
                    "The card or the terminal is not available anymore.",
                ),
                response: None,
            });
        };
        let Ok(terminal) = parts.cm.terminals().get(channel.terminal_name()) else {
            return Ok(ControlResponse {
                outcome: Outcome::error(
                    Minor::UnknownIfd,
                    "The card or the terminal is not available anymore.",
                ),
                response: None,
            });
        };

        let unsupported = || {
            Ok(ControlResponse {
                outcome: Outcome::unknown_ifd_error(
                    "The terminal is not capable of performing the requested action.",
                ),
                response: None,
            })
        };
        let Some(feature) = command.first().copied().and_then(Feature::from_tag) else {
            return unsupported();
        };
        let info = TerminalInfo::connected(terminal, Arc::clone(&channel));
        let Some(code) = info.feature_codes().get(&feature).copied() else {
            return unsupported();
        };

        let response = match channel.transmit_control(code, &command[1..]) {
            Ok(response) => response,
            Err(e) => {
                return Ok(ControlResponse {
                    outcome: outcome_or_terminated(&e, Minor::UnknownIfdError)?,
                    response: None,
                });
            }
        };
        let outcome = match response.as_ref() {
            [0x90, 0x00] => Outcome::ok(),
            [0x64, 0x00] => Outcome::error(Minor::Timeout, "Timeout."),
            _ => Outcome::unknown_ifd_error("Unknown return code from terminal."),
        };
        Ok(ControlResponse {
            outcome,
            response: Some(response),
        })
    }

    /// Verify a PIN on the terminal behind a slot.
    ///
    /// Readers with a secure keypad verify natively; on plain readers the
    /// attached consent engine captures the PIN and the comparison runs as a
    /// software built verify command.
    pub fn verify_user(&self, verify: &VerifyUser) -> IfdResult<VerifyUserResponse> {
        let parts = match self.slot_parts() {
            Ok(parts) => parts,
            Err(outcome) => {
                return Ok(VerifyUserResponse {
                    outcome,
                    response: None,
                });
            }
        };
        let Ok(channel) = parts.cm.slave_channel(&verify.slot) else {
            return Ok(VerifyUserResponse {
                outcome: Outcome::error(Minor::InvalidSlotHandle, MSG_NO_SLOT),
                response: None,
            });
        };
        let Ok(terminal) = parts.cm.terminals().get(channel.terminal_name()) else {
            return Ok(VerifyUserResponse {
                outcome: Outcome::error(Minor::UnknownIfd, "Requested terminal not found."),
                response: None,
            });
        };
        let info = TerminalInfo::connected(terminal, Arc::clone(&channel));
        let mut capabilities = match info.capabilities() {
            Ok(capabilities) => capabilities,
            Err(e) => {
                return Ok(VerifyUserResponse {
                    outcome: outcome_or_terminated(&e, Minor::UnknownIfdError)?,
                    response: None,
                });
            }
        };
        self.augment_protocols(&mut capabilities.slot);

        let terminal = UserTerminal::new(
            channel,
            info,
            capabilities,
            self.gui.clone(),
            verify.display_index,
        );
        terminal.verify_user(verify)
    }

    /// Emit signals or show a message on a terminal.
    ///
    /// Requires a card, since the capability query runs over the shared
    /// channel. A consent engine stands in for missing reader hardware.
    pub fn output(
        &self,
        ctx: &ContextHandle,
        ifd_name: &str,
        out: &OutputInfo,
    ) -> IfdResult<SimpleResponse> {
        let parts = match self.checked_parts(ctx) {
            Ok(parts) => parts,
            Err(outcome) => return Ok(SimpleResponse { outcome }),
        };
        let Ok(terminal) = parts.cm.terminals().get(ifd_name) else {
            return Ok(SimpleResponse {
                outcome: Outcome::error(Minor::UnknownIfd, "Requested terminal not found."),
            });
        };
        let channel = match parts.cm.open_master_channel(ifd_name) {
            Ok(channel) => channel,
            Err(e) => {
                return Ok(SimpleResponse {
                    outcome: open_error_outcome(&e)?,
                });
            }
        };
        let info = TerminalInfo::connected(terminal, Arc::clone(&channel));
        let capabilities = match info.capabilities() {
            Ok(capabilities) => capabilities,
            Err(e) => {
                return Ok(SimpleResponse {
                    outcome: outcome_or_terminated(&e, Minor::UnknownIfdError)?,
                });
            }
        };
        let terminal = UserTerminal::new(
            channel,
            info,
            capabilities,
            self.gui.clone(),
            out.display_index,
        );
        Ok(SimpleResponse {
            outcome: terminal.output(out),
        })
    }

    /// Establish a protected channel on a slot.
    ///
    /// A reader running the protocol in firmware is preferred; otherwise a
    /// registered software protocol takes over and, on success, stays
    /// attached to the channel as its secure messaging layer.
    pub fn establish_channel(
        &self,
        request: &EstablishChannelRequest,
    ) -> IfdResult<EstablishChannelResponse> {
        let parts = match self.slot_parts() {
            Ok(parts) => parts,
            Err(outcome) => return Ok(EstablishChannelResponse { outcome, data: None }),
        };
        let Ok(channel) = parts.cm.slave_channel(&request.slot) else {
            return Ok(EstablishChannelResponse {
                outcome: Outcome::error(Minor::InvalidSlotHandle, MSG_NO_SLOT),
                data: None,
            });
        };
        let Ok(terminal) = parts.cm.terminals().get(channel.terminal_name()) else {
            return Ok(EstablishChannelResponse {
                outcome: Outcome::error(Minor::UnknownIfd, "Requested terminal not found."),
                data: None,
            });
        };
        let info = TerminalInfo::connected(terminal, Arc::clone(&channel));

        let capabilities = match info.pace_capabilities() {
            Ok(capabilities) => capabilities,
            Err(e) => {
                return Ok(EstablishChannelResponse {
                    outcome: outcome_or_terminated(&e, Minor::UnknownIfdError)?,
                    data: None,
                });
            }
        };
        let native_protocols = pace_protocol_list(&capabilities);
        let establish = EstablishPaceRequest::new(&request.pace);

        if let Some(code) = info.pace_ctrl_code()
            && native_protocols
                .first()
                .is_some_and(|p| p.starts_with(&request.protocol))
            && establish.is_supported_type(&capabilities)
        {
            debug!(terminal = channel.terminal_name(), "running PACE on the reader");
            let frame =
                ExecutePaceRequest::with_data(PaceFunction::EstablishChannel, establish.to_bytes());
            let raw = match channel.transmit_control(code, &frame.to_bytes()) {
                Ok(raw) => raw,
                Err(e) => {
                    return Ok(EstablishChannelResponse {
                        outcome: outcome_or_terminated(&e, Minor::UnknownIfdError)?,
                        data: None,
                    });
                }
            };
            let Some(executed) = ExecutePaceResponse::from_bytes(&raw) else {
                return Ok(EstablishChannelResponse {
                    outcome: Outcome::unknown_ifd_error("Malformed EXECUTE PACE response."),
                    data: None,
                });
            };
            if executed.is_error() {
                return Ok(EstablishChannelResponse {
                    outcome: executed.outcome(),
                    data: None,
                });
            }
            let Some(established) = EstablishPaceResponse::from_bytes(&executed.data) else {
                return Ok(EstablishChannelResponse {
                    outcome: Outcome::unknown_ifd_error("Malformed PACE establish response."),
                    data: None,
                });
            };
            return Ok(EstablishChannelResponse {
                outcome: Outcome::ok(),
                data: Some(established.into_output()),
            });
        }

        let software = self.protocols.lock().unwrap().create(&request.protocol);
        match software {
            Some(mut protocol) => {
                let response = protocol.establish(request, self.gui.as_deref());
                if response.outcome.is_ok() {
                    channel.attach_secure_messaging(protocol);
                }
                Ok(response)
            }
            None => Ok(EstablishChannelResponse {
                outcome: Outcome::unknown_error("No such protocol available in this IFD."),
                data: None,
            }),
        }
    }

    /// Tear down a protected channel on a slot.
    ///
    /// A reader with explicit channel destruction is told to destroy it; the
    /// secure messaging layer is stripped in any case.
    pub fn destroy_channel(&self, slot: &SlotHandle) -> IfdResult<SimpleResponse> {
        let parts = match self.slot_parts() {
            Ok(parts) => parts,
            Err(outcome) => return Ok(SimpleResponse { outcome }),
        };
        let Ok(channel) = parts.cm.slave_channel(slot) else {
            return Ok(SimpleResponse {
                outcome: Outcome::error(Minor::InvalidSlotHandle, MSG_NO_SLOT),
            });
        };
        let Ok(terminal) = parts.cm.terminals().get(channel.terminal_name()) else {
            channel.remove_secure_messaging();
            return Ok(SimpleResponse {
                outcome: Outcome::error(Minor::UnknownIfd, "Requested terminal not found."),
            });
        };
        let info = TerminalInfo::connected(terminal, Arc::clone(&channel));

        let mut outcome = Outcome::ok();
        if let Some(code) = info.pace_ctrl_code()
            && info
                .pace_capabilities()
                .is_ok_and(|caps| caps.contains(&PaceCapability::DestroyChannel))
        {
            let frame = ExecutePaceRequest::new(PaceFunction::DestroyChannel);
            match channel.transmit_control(code, &frame.to_bytes()) {
                Ok(raw) => {
                    if let Some(executed) = ExecutePaceResponse::from_bytes(&raw)
                        && executed.is_error()
                    {
                        outcome = executed.outcome();
                    }
                }
                Err(e) => outcome = outcome_or_terminated(&e, Minor::UnknownIfdError)?,
            }
        }
        channel.remove_secure_messaging();
        Ok(SimpleResponse { outcome })
    }
}

const fn wait_failure(outcome: Outcome) -> WaitResponse {
    WaitResponse {
        outcome,
        events: Vec::new(),
        session: None,
    }
}

fn open_error_outcome(err: &OpenChannelError) -> Result<Outcome, Terminated> {
    match err {
        OpenChannelError::NoSuchTerminal(_) => Ok(Outcome::error(
            Minor::UnknownIfd,
            "The requested terminal does not exist.",
        )),
        OpenChannelError::SlotOccupied(name) => Ok(Outcome::unknown_ifd_error(format!(
            "A channel to terminal '{name}' is already open."
        ))),
        OpenChannelError::Scio(e) if e.code() == ScioErrorCode::NoSmartcard => Ok(Outcome::error(
            Minor::NoCard,
            "No card available in the requested terminal.",
        )),
        OpenChannelError::Scio(e) => outcome_or_terminated(e, Minor::UnknownIfdError),
    }
}

fn transaction_outcome(err: &tessera_scio::ScioError) -> Result<Outcome, Terminated> {
    match err.code() {
        ScioErrorCode::ResetCard
        | ScioErrorCode::RemovedCard
        | ScioErrorCode::ReaderUnavailable
        | ScioErrorCode::NoSmartcard
        | ScioErrorCode::NoService => {
            Ok(Outcome::error(Minor::InvalidSlotHandle, MSG_NO_SLOT))
        }
        _ => outcome_or_terminated(err, Minor::UnknownError),
    }
}
