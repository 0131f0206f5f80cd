//! Reader-executed PACE structures
//!
//! Readers with the EXECUTE PACE feature run the whole protocol in firmware.
//! The structures here follow the BSI TR-03119 wire format: an outer execute
//! frame selecting the function, and inner establish request/response blocks.
//! All length fields are little endian.

use bytes::Bytes;

use crate::error::{Minor, Outcome};
use crate::protocol::uris;
use crate::types::{PaceInput, PaceOutput};

/// Function selector of the outer execute frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PaceFunction {
    /// Query the PACE capability bitmap of the reader.
    GetReaderCapabilities = 0x01,
    /// Establish a PACE channel.
    EstablishChannel = 0x02,
    /// Destroy the established PACE channel.
    DestroyChannel = 0x03,
}

/// PACE related reader capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaceCapability {
    /// Generic PACE support.
    GenericPace,
    /// German eID flavor with terminal authentication.
    GermanEid,
    /// Qualified electronic signature support.
    QualifiedSignature,
    /// The reader can tear a PACE channel down explicitly.
    DestroyChannel,
}

impl PaceCapability {
    const ALL: [(u8, Self); 4] = [
        (0x10, Self::GenericPace),
        (0x20, Self::GermanEid),
        (0x40, Self::QualifiedSignature),
        (0x80, Self::DestroyChannel),
    ];

    /// Decode the capability bitmap of a capabilities response.
    ///
    /// TR-03119 readers answer with a length byte followed by the bitmap;
    /// some readers send the bare bitmap.
    pub fn from_response(data: &[u8]) -> Vec<Self> {
        let bitmap = match data {
            [bitmap] => *bitmap,
            [_, bitmap, ..] => *bitmap,
            [] => 0,
        };
        Self::ALL
            .iter()
            .filter(|(bit, _)| bitmap & bit != 0)
            .map(|(_, cap)| *cap)
            .collect()
    }

    /// Protocol identifier advertised for this capability, if any.
    pub const fn protocol(self) -> Option<&'static str> {
        match self {
            Self::GenericPace | Self::GermanEid | Self::QualifiedSignature => Some(uris::PACE),
            Self::DestroyChannel => None,
        }
    }
}

/// Protocol identifiers a capability list advertises, deduplicated.
pub fn pace_protocol_list(capabilities: &[PaceCapability]) -> Vec<String> {
    let mut protocols: Vec<String> = Vec::new();
    for cap in capabilities {
        if let Some(proto) = cap.protocol()
            && !protocols.iter().any(|p| p == proto)
        {
            protocols.push(proto.to_string());
        }
    }
    protocols
}

/// Outer execute frame sent over the EXECUTE PACE control code.
#[derive(Debug, Clone)]
pub struct ExecutePaceRequest {
    function: PaceFunction,
    data: Vec<u8>,
}

impl ExecutePaceRequest {
    /// Frame without payload, e.g. for capability query or destroy.
    pub const fn new(function: PaceFunction) -> Self {
        Self {
            function,
            data: Vec::new(),
        }
    }

    /// Frame carrying a function specific payload.
    pub const fn with_data(function: PaceFunction, data: Vec<u8>) -> Self {
        Self { function, data }
    }

    /// Serialize: function byte, 2-byte length, payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.data.len());
        out.push(self.function as u8);
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Outer execute frame received from the reader.
#[derive(Debug, Clone)]
pub struct ExecutePaceResponse {
    /// Reader result code, 0 means success.
    pub result: u32,
    /// Function specific payload.
    pub data: Vec<u8>,
}

impl ExecutePaceResponse {
    /// Parse: 4-byte result, 2-byte length, payload.
    pub fn from_bytes(response: &[u8]) -> Option<Self> {
        if response.len() < 6 {
            return None;
        }
        let result = u32::from_le_bytes([response[0], response[1], response[2], response[3]]);
        let len = u16::from_le_bytes([response[4], response[5]]) as usize;
        if response.len() < 6 + len {
            return None;
        }
        Some(Self {
            result,
            data: response[6..6 + len].to_vec(),
        })
    }

    /// Whether the reader reported a failure.
    pub const fn is_error(&self) -> bool {
        self.result != 0
    }

    /// Map the reader result code onto an operation outcome.
    pub fn outcome(&self) -> Outcome {
        match self.result {
            0x0000_0000 => Outcome::ok(),
            0xD000_0001 => Outcome::error(Minor::ParameterError, "inconsistent lengths in input"),
            0xD000_0002 => Outcome::error(Minor::ParameterError, "unexpected data in input"),
            0xD000_0003 => {
                Outcome::error(Minor::ParameterError, "unexpected combination of input data")
            }
            0xE000_0001 => Outcome::unknown_ifd_error("syntax error in TLV response"),
            0xE000_0002 => Outcome::unknown_ifd_error("unexpected or missing TLV object"),
            0xE000_0003 => Outcome::error(Minor::IncorrectParameter, "unknown password identifier"),
            0xE000_0006 => {
                Outcome::error(Minor::AuthenticationFailed, "wrong authentication token")
            }
            0xF010_0001 => Outcome::unknown_ifd_error("communication with the card aborted"),
            0xF010_0002 => Outcome::error(Minor::NoCard, "no card in the reader"),
            0xF020_0001 => Outcome::error(Minor::CancellationByUser, "aborted by the user"),
            0xF020_0002 => Outcome::error(Minor::Timeout, "PACE timed out at the reader"),
            code => Outcome::unknown_ifd_error(format!(
                "PACE failed with reader code 0x{code:08X}"
            )),
        }
    }
}

/// Inner establish request block.
#[derive(Debug, Clone, Default)]
pub struct EstablishPaceRequest {
    pin_id: u8,
    chat: Option<Bytes>,
    pin: Option<String>,
    certificate_description: Option<Bytes>,
}

impl EstablishPaceRequest {
    /// Build from the protocol input of an establish-channel request.
    pub fn new(input: &PaceInput) -> Self {
        Self {
            pin_id: input.pin_id,
            chat: input.chat.clone(),
            pin: input.pin.clone(),
            certificate_description: input.certificate_description.clone(),
        }
    }

    /// Whether the reader capabilities cover this request flavor.
    pub fn is_supported_type(&self, capabilities: &[PaceCapability]) -> bool {
        if self.certificate_description.is_some() {
            capabilities.contains(&PaceCapability::GermanEid)
        } else if self.pin.is_some() {
            capabilities.contains(&PaceCapability::GenericPace)
        } else {
            capabilities.contains(&PaceCapability::GermanEid)
                || capabilities.contains(&PaceCapability::GenericPace)
        }
    }

    /// Serialize: pin id, 1-byte CHAT length + CHAT, 1-byte PIN length + PIN,
    /// 2-byte certificate description length + description.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.pin_id);
        #[allow(clippy::cast_possible_truncation)]
        {
            let chat = self.chat.as_deref().unwrap_or(&[]);
            out.push(chat.len() as u8);
            out.extend_from_slice(chat);
            let pin = self.pin.as_deref().unwrap_or("").as_bytes();
            out.push(pin.len() as u8);
            out.extend_from_slice(pin);
            let desc = self.certificate_description.as_deref().unwrap_or(&[]);
            out.extend_from_slice(&(desc.len() as u16).to_le_bytes());
            out.extend_from_slice(desc);
        }
        out
    }
}

/// Inner establish response block.
#[derive(Debug, Clone)]
pub struct EstablishPaceResponse {
    /// Status word of the final protocol step.
    pub status: u16,
    /// Content of `EF.CardAccess`.
    pub ef_card_access: Bytes,
    /// Most recent certification authority reference.
    pub current_car: Option<Bytes>,
    /// Previous certification authority reference.
    pub previous_car: Option<Bytes>,
    /// Card identifier from the PACE mapping.
    pub id_icc: Option<Bytes>,
}

impl EstablishPaceResponse {
    /// Parse: 2-byte status (little endian), 2-byte `EF.CardAccess` length +
    /// content, then optionally 1-byte CAR lengths + CARs and a 2-byte card
    /// identifier length + identifier.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }
        let status = u16::from_le_bytes([data[0], data[1]]);
        let mut idx = 2;

        let take = |idx: &mut usize, len: usize| -> Option<Bytes> {
            let slice = data.get(*idx..*idx + len)?;
            *idx += len;
            Some(Bytes::copy_from_slice(slice))
        };
        let take_len8 = |idx: &mut usize| -> Option<usize> {
            let len = *data.get(*idx)? as usize;
            *idx += 1;
            Some(len)
        };
        let take_len16 = |idx: &mut usize| -> Option<usize> {
            let bytes = data.get(*idx..*idx + 2)?;
            *idx += 2;
            Some(u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
        };

        let ef_len = take_len16(&mut idx)?;
        let ef_card_access = take(&mut idx, ef_len)?;

        let mut current_car = None;
        let mut previous_car = None;
        let mut id_icc = None;
        if idx < data.len() {
            let len = take_len8(&mut idx)?;
            if len > 0 {
                current_car = Some(take(&mut idx, len)?);
            }
        }
        if idx < data.len() {
            let len = take_len8(&mut idx)?;
            if len > 0 {
                previous_car = Some(take(&mut idx, len)?);
            }
        }
        if idx < data.len() {
            let len = take_len16(&mut idx)?;
            if len > 0 {
                id_icc = Some(take(&mut idx, len)?);
            }
        }

        Some(Self {
            status,
            ef_card_access,
            current_car,
            previous_car,
            id_icc,
        })
    }

    /// Remaining retries when the status word is `63 CX`.
    pub const fn retry_counter(&self) -> Option<u8> {
        let [sw2, sw1] = self.status.to_le_bytes();
        if sw1 == 0x63 && sw2 & 0xF0 == 0xC0 {
            Some(sw2 & 0x0F)
        } else {
            None
        }
    }

    /// Convert into the protocol output of the facade response.
    pub fn into_output(self) -> PaceOutput {
        PaceOutput {
            status: self.status,
            retry_counter: self.retry_counter(),
            ef_card_access: self.ef_card_access,
            current_car: self.current_car,
            previous_car: self.previous_car,
            id_icc: self.id_icc,
        }
    }
}
