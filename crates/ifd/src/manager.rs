//! Channel bookkeeping
//!
//! Two kinds of channels exist per terminal: one shared master channel used
//! internally for status queries and capability probing, and at most one
//! slave channel handed to a client under an opaque slot handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tessera_scio::{ScioError, ScioProtocol, ScioTerminals};
use tracing::{debug, warn};

use crate::channel::SlotChannel;
use crate::types::{DisconnectAction, SlotHandle};

/// Lookup failure for a slot handle.
#[derive(Debug, Clone, thiserror::Error)]
#[error("no channel for the given slot handle")]
pub struct NoSuchChannel;

/// Failure to open a channel.
#[derive(Debug, thiserror::Error)]
pub enum OpenChannelError {
    /// The terminal name is unknown.
    #[error(transparent)]
    NoSuchTerminal(#[from] tessera_scio::NoSuchTerminal),
    /// A client channel is already open for the terminal.
    #[error("a channel to terminal '{0}' is already open")]
    SlotOccupied(String),
    /// The smart-card stack failed, e.g. because the slot is empty.
    #[error(transparent)]
    Scio(#[from] ScioError),
}

/// Owner of all channels of one context.
pub struct ChannelManager {
    terminals: Arc<dyn ScioTerminals>,
    masters: Mutex<HashMap<String, Arc<SlotChannel>>>,
    slaves: Mutex<HashMap<SlotHandle, Arc<SlotChannel>>>,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("masters", &self.masters.lock().unwrap().len())
            .field("slaves", &self.slaves.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl ChannelManager {
    /// Create a manager over a terminal backend.
    pub fn new(terminals: Arc<dyn ScioTerminals>) -> Self {
        Self {
            terminals,
            masters: Mutex::new(HashMap::new()),
            slaves: Mutex::new(HashMap::new()),
        }
    }

    /// The terminal backend this manager works on.
    pub fn terminals(&self) -> &Arc<dyn ScioTerminals> {
        &self.terminals
    }

    /// Open (or reuse) the internal shared channel of a terminal.
    pub fn open_master_channel(&self, name: &str) -> Result<Arc<SlotChannel>, OpenChannelError> {
        let mut masters = self.masters.lock().unwrap();
        if let Some(channel) = masters.get(name) {
            return Ok(Arc::clone(channel));
        }
        let terminal = self.terminals.get(name)?;
        let card = terminal.connect(ScioProtocol::Any)?;
        let channel = Arc::new(SlotChannel::new(card));
        masters.insert(name.to_string(), Arc::clone(&channel));
        debug!(terminal = name, "opened master channel");
        Ok(channel)
    }

    /// The master channel of a terminal, if one is open.
    pub fn master_channel(&self, name: &str) -> Option<Arc<SlotChannel>> {
        self.masters.lock().unwrap().get(name).cloned()
    }

    /// Close the master channel of a terminal, if one is open.
    pub fn close_master_channel(&self, name: &str) {
        if let Some(channel) = self.masters.lock().unwrap().remove(name) {
            if let Err(e) = channel.shutdown(DisconnectAction::Leave) {
                debug!(terminal = name, "master channel shutdown failed: {e}");
            }
        }
    }

    /// Open a client channel and register it under a fresh random handle.
    ///
    /// At most one client channel per terminal is allowed.
    pub fn open_slave_channel(
        &self,
        name: &str,
    ) -> Result<(SlotHandle, Arc<SlotChannel>), OpenChannelError> {
        let mut slaves = self.slaves.lock().unwrap();
        if slaves.values().any(|c| c.terminal_name() == name) {
            return Err(OpenChannelError::SlotOccupied(name.to_string()));
        }
        let terminal = self.terminals.get(name)?;
        let card = terminal.connect(ScioProtocol::Any)?;
        let channel = Arc::new(SlotChannel::new(card));
        let handle = SlotHandle::random();
        slaves.insert(handle, Arc::clone(&channel));
        debug!(terminal = name, handle = ?handle, "opened slave channel");
        Ok((handle, channel))
    }

    /// Look up a client channel by handle.
    pub fn slave_channel(&self, handle: &SlotHandle) -> Result<Arc<SlotChannel>, NoSuchChannel> {
        self.slaves
            .lock()
            .unwrap()
            .get(handle)
            .cloned()
            .ok_or(NoSuchChannel)
    }

    /// Unregister a client channel and hand it back for teardown.
    pub fn close_slave_channel(
        &self,
        handle: &SlotHandle,
    ) -> Result<Arc<SlotChannel>, NoSuchChannel> {
        self.slaves
            .lock()
            .unwrap()
            .remove(handle)
            .ok_or(NoSuchChannel)
    }

    /// Close every channel; errors are logged, teardown always completes.
    pub fn shutdown(&self) {
        let slaves: Vec<_> = self.slaves.lock().unwrap().drain().collect();
        for (handle, channel) in slaves {
            if let Err(e) = channel.shutdown(DisconnectAction::Leave) {
                warn!(handle = ?handle, "slave channel shutdown failed: {e}");
            }
        }
        let masters: Vec<_> = self.masters.lock().unwrap().drain().collect();
        for (name, channel) in masters {
            if let Err(e) = channel.shutdown(DisconnectAction::Leave) {
                warn!(terminal = name, "master channel shutdown failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_scio::mock::MockReaders;

    fn backend() -> (MockReaders, ChannelManager) {
        let readers = MockReaders::new();
        readers.add_terminal("Reader A");
        readers.insert_card("Reader A", &[0x3B, 0x8A]);
        let manager = ChannelManager::new(Arc::new(readers.clone()));
        (readers, manager)
    }

    #[test]
    fn master_channel_is_shared() {
        let (_readers, manager) = backend();
        let first = manager.open_master_channel("Reader A").unwrap();
        let second = manager.open_master_channel("Reader A").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        manager.close_master_channel("Reader A");
        assert!(manager.master_channel("Reader A").is_none());
    }

    #[test]
    fn one_slave_channel_per_terminal() {
        let (_readers, manager) = backend();
        let (handle, _channel) = manager.open_slave_channel("Reader A").unwrap();

        let err = manager.open_slave_channel("Reader A").unwrap_err();
        assert!(matches!(err, OpenChannelError::SlotOccupied(_)));

        let closed = manager.close_slave_channel(&handle).unwrap();
        assert_eq!(closed.terminal_name(), "Reader A");
        assert!(manager.slave_channel(&handle).is_err());

        // slot is free again
        manager.open_slave_channel("Reader A").unwrap();
    }

    #[test]
    fn unknown_terminal_and_empty_slot() {
        let (readers, manager) = backend();
        let err = manager.open_slave_channel("Reader B").unwrap_err();
        assert!(matches!(err, OpenChannelError::NoSuchTerminal(_)));

        readers.remove_card("Reader A");
        let err = manager.open_slave_channel("Reader A").unwrap_err();
        assert!(matches!(err, OpenChannelError::Scio(_)));
    }
}
