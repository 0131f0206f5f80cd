//! Lazy terminal introspection
//!
//! A [`TerminalInfo`] bundles a terminal with an optional connected channel
//! and answers capability questions from it: vendor features, PACE support,
//! display and keypad properties. Feature discovery runs at most once per
//! instance; readers that reject the query degrade to an empty feature set.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tessera_scio::{ScioError, ScioErrorCode, ScioProtocol, ScioResult, ScioTerminal};
use tracing::{debug, warn};

use crate::channel::SlotChannel;
use crate::manager::{ChannelManager, OpenChannelError};
use crate::reader::{
    ExecutePaceRequest, ExecutePaceResponse, Feature, PaceCapability, PaceFunction,
    feature_request_code, pace_protocol_list, parse_feature_list,
};
use crate::types::{
    DisplayCapability, IfdCapabilities, IfdStatus, KeyPadCapability, SlotCapability, SlotStatus,
};

const PROTO_T0: &str = "urn:iso:std:iso-iec:7816:-3:tech:protocols:T-equals-0";
const PROTO_T1: &str = "urn:iso:std:iso-iec:7816:-3:tech:protocols:T-equals-1";

/// Introspection view over one terminal.
pub struct TerminalInfo {
    terminal: Arc<dyn ScioTerminal>,
    channel: Option<Arc<SlotChannel>>,
    features: OnceLock<HashMap<Feature, u32>>,
}

impl std::fmt::Debug for TerminalInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalInfo")
            .field("terminal", &self.terminal.name())
            .field("connected", &self.channel.is_some())
            .finish_non_exhaustive()
    }
}

impl TerminalInfo {
    /// View over a terminal without a card connection.
    pub fn unconnected(terminal: Arc<dyn ScioTerminal>) -> Self {
        Self {
            terminal,
            channel: None,
            features: OnceLock::new(),
        }
    }

    /// View over a terminal with an established channel; capability queries
    /// that need card access become available.
    pub fn connected(terminal: Arc<dyn ScioTerminal>, channel: Arc<SlotChannel>) -> Self {
        Self {
            terminal,
            channel: Some(channel),
            features: OnceLock::new(),
        }
    }

    /// Name of the terminal.
    pub fn name(&self) -> &str {
        self.terminal.name()
    }

    /// Whether a channel is attached to this view.
    pub const fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    /// Card presence; query failures count as absent.
    pub fn is_card_present(&self) -> bool {
        self.terminal.is_card_present().unwrap_or(false)
    }

    /// Full status of the terminal.
    ///
    /// When a card is present its ATR is read through the attached channel,
    /// or through the shared master channel otherwise. A card that cannot be
    /// connected due to a transient fault is reported as absent.
    pub fn status(&self, cm: &ChannelManager) -> ScioResult<IfdStatus> {
        let mut slot = SlotStatus::empty();
        slot.card_available = self.is_card_present();

        if let Some(channel) = &self.channel {
            slot.atr = Some(channel.atr());
        } else if slot.card_available {
            match cm.open_master_channel(self.name()) {
                Ok(channel) => slot.atr = Some(channel.atr()),
                Err(OpenChannelError::Scio(e)) if e.code().is_transient_card_fault() => {
                    debug!(terminal = self.name(), "card unusable, reporting absent: {e}");
                    slot.card_available = false;
                }
                Err(OpenChannelError::NoSuchTerminal(_)) => {
                    return Err(ScioError::new(
                        ScioErrorCode::ReaderUnavailable,
                        "terminal disappeared while reading its status",
                    ));
                }
                Err(OpenChannelError::SlotOccupied(_)) => unreachable!("master channels shared"),
                Err(OpenChannelError::Scio(e)) => return Err(e),
            }
        }

        Ok(IfdStatus {
            ifd_name: self.name().to_string(),
            connected: true,
            slots: vec![slot],
        })
    }

    /// Vendor feature map of the reader; empty without a channel or when the
    /// driver rejects the query.
    pub fn feature_codes(&self) -> &HashMap<Feature, u32> {
        self.features.get_or_init(|| {
            let Some(channel) = &self.channel else {
                return HashMap::new();
            };
            match channel.transmit_control(feature_request_code(), &[]) {
                Ok(response) => parse_feature_list(&response),
                Err(e) => {
                    warn!(terminal = self.name(), "unable to request reader features: {e}");
                    HashMap::new()
                }
            }
        })
    }

    /// Control code of the reader's PACE execution, if advertised.
    pub fn pace_ctrl_code(&self) -> Option<u32> {
        self.feature_codes().get(&Feature::ExecutePace).copied()
    }

    /// Control code of the reader's direct PIN verification, if advertised.
    pub fn pin_compare_ctrl_code(&self) -> Option<u32> {
        self.feature_codes().get(&Feature::VerifyPinDirect).copied()
    }

    /// Whether the reader runs PACE in firmware.
    pub fn supports_pace(&self) -> bool {
        self.pace_ctrl_code().is_some()
    }

    /// Whether the reader verifies PINs on its own keypad.
    pub fn supports_pin_compare(&self) -> bool {
        self.pin_compare_ctrl_code().is_some()
    }

    /// PACE capabilities of the reader; empty when PACE is not advertised.
    pub fn pace_capabilities(&self) -> ScioResult<Vec<PaceCapability>> {
        let Some(code) = self.pace_ctrl_code() else {
            return Ok(Vec::new());
        };
        let channel = self.channel.as_ref().expect("features imply a channel");
        let request = ExecutePaceRequest::new(PaceFunction::GetReaderCapabilities).to_bytes();
        let response = channel.transmit_control(code, &request)?;
        let response = ExecutePaceResponse::from_bytes(&response).ok_or_else(|| {
            ScioError::new(ScioErrorCode::Unknown, "malformed PACE capability response")
        })?;
        if response.is_error() {
            return Err(ScioError::new(
                ScioErrorCode::Unknown,
                "PACE is advertised but the capability query failed",
            ));
        }
        Ok(PaceCapability::from_response(&response.data))
    }

    /// Protocols the slot supports: interface protocol, PACE flavors and
    /// plain PIN comparison.
    pub fn slot_capability(&self) -> ScioResult<SlotCapability> {
        let mut cap = SlotCapability::default();
        if let Some(channel) = &self.channel {
            cap.protocols.push(
                match channel.protocol() {
                    ScioProtocol::T0 => PROTO_T0,
                    _ => PROTO_T1,
                }
                .to_string(),
            );
        }
        cap.protocols
            .extend(pace_protocol_list(&self.pace_capabilities()?));
        if self.supports_pin_compare() {
            cap.protocols.push(crate::protocol::uris::PIN_COMPARE.to_string());
        }
        Ok(cap)
    }

    /// Display properties, when the reader advertises a display.
    pub fn display_capability(&self) -> Option<DisplayCapability> {
        let code = self.feature_codes().get(&Feature::IfdDisplayProperties)?;
        let channel = self.channel.as_ref()?;
        let data = channel.transmit_control(*code, &[]).ok()?;
        if data.len() != 4 {
            return None;
        }
        let columns = u64::from(u16::from_le_bytes([data[0], data[1]]));
        let lines = u64::from(u16::from_le_bytes([data[2], data[3]]));
        (columns > 0 && lines > 0).then_some(DisplayCapability {
            index: 0,
            lines: Some(lines),
            columns: Some(columns),
        })
    }

    /// Keypad properties, when the reader advertises secure PIN entry.
    pub fn keypad_capability(&self) -> Option<KeyPadCapability> {
        let code = self.feature_codes().get(&Feature::IfdPinProperties)?;
        let channel = self.channel.as_ref()?;
        let data = channel.transmit_control(*code, &[]).ok()?;
        if data.len() != 4 {
            return None;
        }
        Some(KeyPadCapability {
            index: 0,
            min_length: 0,
            max_length: 15,
        })
    }

    /// Everything the terminal can do beyond moving APDUs.
    pub fn capabilities(&self) -> ScioResult<IfdCapabilities> {
        Ok(IfdCapabilities {
            slot: self.slot_capability()?,
            displays: self.display_capability().into_iter().collect(),
            keypads: self.keypad_capability().into_iter().collect(),
            optical_signal: self.is_optical_signal(),
            acoustic_signal: self.is_acoustic_signal(),
        })
    }

    /// Whether the terminal can beep. PC/SC offers no query for this.
    pub const fn is_acoustic_signal(&self) -> bool {
        false
    }

    /// Whether the terminal can blink. PC/SC offers no query for this.
    pub const fn is_optical_signal(&self) -> bool {
        false
    }
}

/// Status snapshot of every attached terminal.
pub(crate) fn collect_status(cm: &ChannelManager) -> ScioResult<Vec<IfdStatus>> {
    let mut statuses = Vec::new();
    for terminal in cm.terminals().list()? {
        let info = match cm.master_channel(terminal.name()) {
            Some(channel) => TerminalInfo::connected(Arc::clone(&terminal), channel),
            None => TerminalInfo::unconnected(Arc::clone(&terminal)),
        };
        statuses.push(info.status(cm)?);
    }
    Ok(statuses)
}
