//! Card channel with transmit policy and secure messaging
//!
//! A [`SlotChannel`] owns one card connection. All hardware access goes
//! through an internal lock, so a channel can be shared between the facade,
//! the event subsystem and background dialogs without interleaving APDUs.

use std::sync::Mutex;

use bytes::Bytes;
use tessera_scio::{ScioCard, ScioError, ScioProtocol, ScioResult};
use tracing::debug;

use crate::protocol::SecureMessaging;
use crate::types::DisconnectAction;

const INS_MANAGE_CHANNEL: u8 = 0x70;

/// Reason a transmit did not produce an accepted response.
#[derive(Debug, thiserror::Error)]
pub enum TransmitFault {
    /// The card answered, but the trailer is not in the accepted set.
    #[error("status {status} not in the accepted set", status = hex::encode(&response[response.len().saturating_sub(2)..]))]
    Rejected {
        /// The full response including the rejected trailer.
        response: Bytes,
    },
    /// The command is a MANAGE CHANNEL APDU, which would desynchronize the
    /// channel bookkeeping.
    #[error("command contains a MANAGE CHANNEL APDU")]
    ChannelManagement,
    /// The smart-card stack failed.
    #[error(transparent)]
    Scio(#[from] ScioError),
    /// The secure messaging layer failed to wrap or unwrap.
    #[error("secure messaging failed: {0}")]
    SecureMessaging(String),
}

/// One card connection, serialized and optionally wrapped in secure
/// messaging.
pub struct SlotChannel {
    terminal: String,
    atr: Bytes,
    protocol: ScioProtocol,
    card: Mutex<Box<dyn ScioCard>>,
    sm: Mutex<Option<Box<dyn SecureMessaging>>>,
}

impl std::fmt::Debug for SlotChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotChannel")
            .field("terminal", &self.terminal)
            .field("atr", &hex::encode(&self.atr))
            .finish_non_exhaustive()
    }
}

impl SlotChannel {
    pub(crate) fn new(card: Box<dyn ScioCard>) -> Self {
        Self {
            terminal: card.terminal_name().to_string(),
            atr: card.atr(),
            protocol: card.protocol(),
            card: Mutex::new(card),
            sm: Mutex::new(None),
        }
    }

    /// Protocol the connection was established with.
    pub const fn protocol(&self) -> ScioProtocol {
        self.protocol
    }

    /// Name of the terminal the channel is connected through.
    pub fn terminal_name(&self) -> &str {
        &self.terminal
    }

    /// Answer To Reset captured at connect time.
    pub fn atr(&self) -> Bytes {
        self.atr.clone()
    }

    /// Attach a secure messaging layer; subsequent transmits are wrapped.
    pub fn attach_secure_messaging(&self, sm: Box<dyn SecureMessaging>) {
        *self.sm.lock().unwrap() = Some(sm);
    }

    /// Strip the secure messaging layer, if one is attached.
    pub fn remove_secure_messaging(&self) {
        *self.sm.lock().unwrap() = None;
    }

    /// Send one APDU and enforce the accepted trailer set.
    ///
    /// An empty set accepts every response. A one-byte entry matches SW1
    /// alone, a two-byte entry the full trailer.
    pub fn transmit(&self, apdu: &[u8], accepted: &[Bytes]) -> Result<Bytes, TransmitFault> {
        if apdu.len() >= 4 && apdu[1] == INS_MANAGE_CHANNEL {
            return Err(TransmitFault::ChannelManagement);
        }

        let mut sm = self.sm.lock().unwrap();
        let wire = match sm.as_mut() {
            Some(sm) => Bytes::from(
                sm.apply(apdu)
                    .map_err(|e| TransmitFault::SecureMessaging(e.0))?,
            ),
            None => Bytes::copy_from_slice(apdu),
        };

        let raw = self.card.lock().unwrap().transmit(&wire)?;

        let response = match sm.as_mut() {
            Some(sm) => Bytes::from(
                sm.remove(&raw)
                    .map_err(|e| TransmitFault::SecureMessaging(e.0))?,
            ),
            None => raw,
        };
        drop(sm);

        if !accepted.is_empty() && !trailer_accepted(&response, accepted) {
            debug!(
                terminal = %self.terminal,
                "transmit finished with unaccepted status"
            );
            return Err(TransmitFault::Rejected { response });
        }
        Ok(response)
    }

    /// Send a reader control command; secure messaging never applies here.
    pub fn transmit_control(&self, code: u32, data: &[u8]) -> ScioResult<Bytes> {
        self.card.lock().unwrap().transmit_control(code, data)
    }

    /// Acquire the hardware transaction lock.
    pub fn begin_exclusive(&self) -> ScioResult<()> {
        self.card.lock().unwrap().begin_exclusive()
    }

    /// Release the hardware transaction lock.
    pub fn end_exclusive(&self) -> ScioResult<()> {
        self.card.lock().unwrap().end_exclusive()
    }

    /// Reset the card and re-establish the connection.
    pub fn reconnect(&self) -> ScioResult<()> {
        self.remove_secure_messaging();
        self.card.lock().unwrap().reconnect()
    }

    /// Close the channel, optionally resetting the card.
    pub fn shutdown(&self, action: DisconnectAction) -> ScioResult<()> {
        self.remove_secure_messaging();
        self.card
            .lock()
            .unwrap()
            .disconnect(action == DisconnectAction::Reset)
    }
}

fn trailer_accepted(response: &[u8], accepted: &[Bytes]) -> bool {
    if response.len() < 2 {
        return false;
    }
    let sw1 = response[response.len() - 2];
    let sw2 = response[response.len() - 1];
    accepted.iter().any(|entry| match entry.as_ref() {
        [b1] => *b1 == sw1,
        [b1, b2] => *b1 == sw1 && *b2 == sw2,
        _ => false,
    })
}
