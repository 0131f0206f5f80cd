//! PC/SC backend for the tessera terminal primitive contract
//!
//! Implements [`ScioTerminals`] and friends over the system PC/SC stack via
//! the `pcsc` crate: reader enumeration, card connections, reader control
//! commands and a status-change watcher with hotplug detection.
//!
//! Exclusive access (`begin_exclusive`/`end_exclusive`) is realized by
//! switching the connection's share mode with `SCardReconnect`; the `pcsc`
//! crate models transactions as RAII borrows which cannot be stored across
//! trait method calls.
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

mod util;
mod watcher;

use std::ffi::CString;
use std::sync::Arc;

use bytes::Bytes;
use pcsc::{Context, Disposition, Protocols, Scope, ShareMode};
use tessera_scio::{
    NoSuchTerminal, ScioCard, ScioError, ScioErrorCode, ScioProtocol, ScioResult, ScioTerminal,
    ScioTerminals, TerminalWatcher,
};

use crate::util::wrap;
pub use crate::watcher::PcscWatcher;

fn protocols_for(protocol: ScioProtocol) -> Protocols {
    match protocol {
        ScioProtocol::T0 => Protocols::T0,
        ScioProtocol::T1 => Protocols::T1,
        ScioProtocol::Any => Protocols::ANY,
    }
}

/// PC/SC based terminal backend.
#[derive(Clone)]
pub struct PcscReaders {
    ctx: Context,
}

impl std::fmt::Debug for PcscReaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcscReaders").finish_non_exhaustive()
    }
}

impl PcscReaders {
    /// Establish a user-scope PC/SC context.
    pub fn new() -> ScioResult<Self> {
        let ctx = Context::establish(Scope::User)
            .map_err(|e| wrap(e, "failed to establish PC/SC context"))?;
        Ok(Self { ctx })
    }

    fn reader_names(&self) -> ScioResult<Vec<CString>> {
        let len = self
            .ctx
            .list_readers_len()
            .map_err(|e| wrap(e, "failed to size reader list"))?;
        let mut buf = vec![0u8; len];
        let names = self
            .ctx
            .list_readers(&mut buf)
            .map_err(|e| wrap(e, "failed to list readers"))?;
        Ok(names.map(CString::from).collect())
    }
}

impl ScioTerminals for PcscReaders {
    fn list(&self) -> ScioResult<Vec<Arc<dyn ScioTerminal>>> {
        let names = match self.reader_names() {
            Ok(names) => names,
            // an empty system answers with a dedicated error code
            Err(e) if e.code() == ScioErrorCode::NoReadersAvailable => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(names
            .into_iter()
            .map(|cname| {
                Arc::new(PcscTerminal {
                    name: cname.to_string_lossy().into_owned(),
                    cname,
                    ctx: self.ctx.clone(),
                }) as Arc<dyn ScioTerminal>
            })
            .collect())
    }

    fn get(&self, name: &str) -> Result<Arc<dyn ScioTerminal>, NoSuchTerminal> {
        let names = self
            .reader_names()
            .map_err(|_| NoSuchTerminal(name.to_string()))?;
        names
            .into_iter()
            .find(|cname| cname.to_string_lossy() == name)
            .map(|cname| {
                Arc::new(PcscTerminal {
                    name: name.to_string(),
                    cname,
                    ctx: self.ctx.clone(),
                }) as Arc<dyn ScioTerminal>
            })
            .ok_or_else(|| NoSuchTerminal(name.to_string()))
    }

    fn watcher(&self) -> ScioResult<Box<dyn TerminalWatcher>> {
        // dedicated context so cancel() does not disturb other operations
        let ctx = Context::establish(Scope::User)
            .map_err(|e| wrap(e, "failed to establish watcher context"))?;
        Ok(Box::new(PcscWatcher::new(ctx)))
    }

    fn supports_card_presence_wait(&self) -> bool {
        // SCardGetStatusChange never wakes up on the Apple PC/SC fork;
        // pollers must fall back to sleeping.
        !cfg!(target_os = "macos")
    }
}

struct PcscTerminal {
    name: String,
    cname: CString,
    ctx: Context,
}

impl ScioTerminal for PcscTerminal {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_card_present(&self) -> ScioResult<bool> {
        let mut states = [pcsc::ReaderState::new(self.cname.clone(), pcsc::State::UNAWARE)];
        self.ctx
            .get_status_change(std::time::Duration::ZERO, &mut states)
            .map_err(|e| wrap(e, "failed to query reader state"))?;
        let state = states[0].event_state();
        Ok(state.contains(pcsc::State::PRESENT) && !state.contains(pcsc::State::EMPTY))
    }

    fn connect(&self, protocol: ScioProtocol) -> ScioResult<Box<dyn ScioCard>> {
        let card = self
            .ctx
            .connect(&self.cname, ShareMode::Shared, protocols_for(protocol))
            .map_err(|e| wrap(e, "failed to connect card"))?;
        let status = card
            .status2_owned()
            .map_err(|e| wrap(e, "failed to read card status"))?;
        let negotiated = match status.protocol2() {
            Some(pcsc::Protocol::T0) => ScioProtocol::T0,
            Some(pcsc::Protocol::T1) => ScioProtocol::T1,
            _ => ScioProtocol::Any,
        };
        Ok(Box::new(PcscCard {
            card: Some(card),
            atr: Bytes::copy_from_slice(status.atr()),
            protocol: negotiated,
            terminal: self.name.clone(),
        }))
    }
}

struct PcscCard {
    card: Option<pcsc::Card>,
    atr: Bytes,
    protocol: ScioProtocol,
    terminal: String,
}

impl PcscCard {
    fn card(&self) -> ScioResult<&pcsc::Card> {
        self.card
            .as_ref()
            .ok_or_else(|| ScioError::new(ScioErrorCode::InvalidHandle, "card already disconnected"))
    }

    fn card_mut(&mut self) -> ScioResult<&mut pcsc::Card> {
        self.card
            .as_mut()
            .ok_or_else(|| ScioError::new(ScioErrorCode::InvalidHandle, "card already disconnected"))
    }
}

impl ScioCard for PcscCard {
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
        let card = self.card()?;
        let mut recv = vec![0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        let response = card
            .transmit(apdu, &mut recv)
            .map_err(|e| wrap(e, "transmit failed"))?;
        Ok(Bytes::copy_from_slice(response))
    }

    fn transmit_control(&mut self, code: u32, data: &[u8]) -> ScioResult<Bytes> {
        let card = self.card()?;
        let mut recv = vec![0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        let response = card
            .control(code.into(), data, &mut recv)
            .map_err(|e| wrap(e, "control transmit failed"))?;
        Ok(Bytes::copy_from_slice(response))
    }

    fn begin_exclusive(&mut self) -> ScioResult<()> {
        let protocols = protocols_for(self.protocol);
        self.card_mut()?
            .reconnect(ShareMode::Exclusive, protocols, Disposition::LeaveCard)
            .map_err(|e| wrap(e, "failed to acquire exclusive access"))
    }

    fn end_exclusive(&mut self) -> ScioResult<()> {
        let protocols = protocols_for(self.protocol);
        self.card_mut()?
            .reconnect(ShareMode::Shared, protocols, Disposition::LeaveCard)
            .map_err(|e| wrap(e, "failed to release exclusive access"))
    }

    fn reconnect(&mut self) -> ScioResult<()> {
        let protocols = protocols_for(self.protocol);
        self.card_mut()?
            .reconnect(ShareMode::Shared, protocols, Disposition::ResetCard)
            .map_err(|e| wrap(e, "reconnect failed"))
    }

    fn disconnect(&mut self, reset: bool) -> ScioResult<()> {
        if let Some(card) = self.card.take() {
            let disposition = if reset {
                Disposition::ResetCard
            } else {
                Disposition::LeaveCard
            };
            card.disconnect(disposition)
                .map_err(|(_, e)| wrap(e, "disconnect failed"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hardware dependent tests skip when no PC/SC stack is running.

    #[test]
    fn list_readers_or_skip() {
        let readers = match PcscReaders::new() {
            Ok(readers) => readers,
            Err(_) => {
                println!("Skipping test, PC/SC not available");
                return;
            }
        };
        match readers.list() {
            Ok(list) => {
                for terminal in &list {
                    println!("found reader: {}", terminal.name());
                }
            }
            Err(e) => println!("Could not list readers: {e}"),
        }
    }

    #[test]
    fn connect_and_dump_atr_or_skip() {
        let readers = match PcscReaders::new() {
            Ok(readers) => readers,
            Err(_) => {
                println!("Skipping test, PC/SC not available");
                return;
            }
        };
        let list = match readers.list() {
            Ok(list) => list,
            Err(e) => {
                println!("Skipping test, could not list readers: {e}");
                return;
            }
        };
        let Some(terminal) = list
            .iter()
            .find(|t| t.is_card_present().unwrap_or(false))
        else {
            println!("Skipping test, no reader with a card present");
            return;
        };
        match terminal.connect(ScioProtocol::Any) {
            Ok(mut card) => {
                println!("ATR: {}", hex::encode(card.atr()));
                let _ = card.disconnect(false);
            }
            Err(e) => println!("Could not connect (might be expected): {e}"),
        }
    }

    #[test]
    fn watcher_snapshot_or_skip() {
        let readers = match PcscReaders::new() {
            Ok(readers) => readers,
            Err(_) => {
                println!("Skipping test, PC/SC not available");
                return;
            }
        };
        let mut watcher = match readers.watcher() {
            Ok(watcher) => watcher,
            Err(e) => {
                println!("Skipping test, watcher unavailable: {e}");
                return;
            }
        };
        match watcher.start() {
            Ok(snapshot) => assert!(snapshot.iter().all(|t| !t.name.is_empty())),
            Err(e) => println!("Snapshot failed (might be expected): {e}"),
        }
    }
}
