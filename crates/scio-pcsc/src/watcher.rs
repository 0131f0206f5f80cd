//! Status-change watcher built on `SCardGetStatusChange`

use std::collections::VecDeque;
use std::ffi::CString;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pcsc::{Context, ReaderState, State};
use tessera_scio::{
    ScioError, ScioErrorCode, ScioResult, StateChange, StateChangeKind, TerminalState,
    TerminalWatcher, WatchCanceler, WatchEvent,
};
use tracing::debug;

fn present(state: State) -> bool {
    state.contains(State::PRESENT) && !state.contains(State::EMPTY)
}

fn gone(state: State) -> bool {
    state.intersects(State::UNKNOWN | State::IGNORE)
}

/// Watcher over one dedicated PC/SC context.
///
/// Hotplug is tracked through the PnP notification pseudo reader; pending
/// events are queued so each `wait_for_change` hands out exactly one.
pub struct PcscWatcher {
    ctx: Context,
    states: Vec<ReaderState>,
    pending: VecDeque<StateChange>,
    started: bool,
}

impl std::fmt::Debug for PcscWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcscWatcher")
            .field("tracked", &(self.states.len().saturating_sub(1)))
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl PcscWatcher {
    pub(crate) fn new(ctx: Context) -> Self {
        Self {
            ctx,
            states: Vec::new(),
            pending: VecDeque::new(),
            started: false,
        }
    }

    fn list_names(&self) -> ScioResult<Vec<CString>> {
        let len = match self.ctx.list_readers_len() {
            Ok(len) => len,
            Err(pcsc::Error::NoReadersAvailable) => return Ok(Vec::new()),
            Err(e) => return Err(crate::util::wrap(e, "failed to size reader list")),
        };
        let mut buf = vec![0u8; len];
        match self.ctx.list_readers(&mut buf) {
            Ok(names) => Ok(names.map(CString::from).collect()),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(e) => Err(crate::util::wrap(e, "failed to list readers")),
        }
    }

    /// Turn the outcome of a status-change call into queued events.
    fn harvest(&mut self) -> ScioResult<()> {
        let mut relist = false;
        let mut removed = Vec::new();

        for rs in &mut self.states {
            if rs.name() == pcsc::PNP_NOTIFICATION() {
                if rs.event_state().contains(State::CHANGED) {
                    relist = true;
                }
                rs.sync_current_state();
                continue;
            }
            let event = rs.event_state();
            let name = rs.name().to_string_lossy().into_owned();
            if gone(event) {
                if present(rs.current_state()) {
                    self.pending.push_back(StateChange {
                        terminal: name.clone(),
                        kind: StateChangeKind::CardRemoved,
                    });
                }
                self.pending.push_back(StateChange {
                    terminal: name.clone(),
                    kind: StateChangeKind::TerminalRemoved,
                });
                removed.push(rs.name().to_owned());
                continue;
            }
            let was = present(rs.current_state());
            let now = present(event);
            if was != now {
                self.pending.push_back(StateChange {
                    terminal: name,
                    kind: if now {
                        StateChangeKind::CardInserted
                    } else {
                        StateChangeKind::CardRemoved
                    },
                });
            }
            rs.sync_current_state();
        }

        if !removed.is_empty() {
            self.states.retain(|rs| !removed.iter().any(|r| r.as_c_str() == rs.name()));
        }

        if relist {
            for cname in self.list_names()? {
                let known = self.states.iter().any(|rs| rs.name() == cname.as_c_str());
                if !known {
                    self.pending.push_back(StateChange {
                        terminal: cname.to_string_lossy().into_owned(),
                        kind: StateChangeKind::TerminalAdded,
                    });
                    // UNAWARE so the next status query reports the card state
                    self.states.push(ReaderState::new(cname, State::UNAWARE));
                }
            }
        }

        Ok(())
    }
}

impl TerminalWatcher for PcscWatcher {
    fn start(&mut self) -> ScioResult<Vec<TerminalState>> {
        self.states.clear();
        self.pending.clear();
        self.states
            .push(ReaderState::new(pcsc::PNP_NOTIFICATION().to_owned(), State::UNAWARE));
        for cname in self.list_names()? {
            self.states.push(ReaderState::new(cname, State::UNAWARE));
        }

        // UNAWARE entries report their real state immediately
        match self.ctx.get_status_change(Duration::ZERO, &mut self.states) {
            Ok(()) | Err(pcsc::Error::Timeout) => {}
            Err(e) => return Err(crate::util::wrap(e, "initial status query failed")),
        }

        let mut snapshot = Vec::with_capacity(self.states.len() - 1);
        for rs in &mut self.states {
            if rs.name() != pcsc::PNP_NOTIFICATION() {
                snapshot.push(TerminalState {
                    name: rs.name().to_string_lossy().into_owned(),
                    card_present: present(rs.event_state()),
                });
            }
            rs.sync_current_state();
        }
        self.started = true;
        Ok(snapshot)
    }

    fn wait_for_change(&mut self, timeout: Duration) -> ScioResult<WatchEvent> {
        if !self.started {
            return Err(ScioError::new(
                ScioErrorCode::Unknown,
                "watcher not started",
            ));
        }
        if let Some(event) = self.pending.pop_front() {
            return Ok(WatchEvent::Change(event));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(WatchEvent::Cancelled);
            }
            match self.ctx.get_status_change(remaining, &mut self.states) {
                Ok(()) => {}
                Err(pcsc::Error::Timeout) | Err(pcsc::Error::Cancelled) => {
                    return Ok(WatchEvent::Cancelled);
                }
                Err(e) => return Err(crate::util::wrap(e, "status change wait failed")),
            }
            self.harvest()?;
            if let Some(event) = self.pending.pop_front() {
                return Ok(WatchEvent::Change(event));
            }
            debug!("spurious status change wakeup, waiting again");
        }
    }

    fn canceler(&self) -> Arc<dyn WatchCanceler> {
        Arc::new(PcscCanceler {
            ctx: self.ctx.clone(),
        })
    }
}

struct PcscCanceler {
    ctx: Context,
}

impl WatchCanceler for PcscCanceler {
    fn cancel(&self) {
        if let Err(e) = self.ctx.cancel() {
            debug!("cancel of status change wait failed: {e}");
        }
    }
}
