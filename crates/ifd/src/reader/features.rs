//! CCID reader feature discovery
//!
//! Readers advertise their vendor functions through a TLV list obtained with
//! the feature request control code. Each entry maps a feature tag to the
//! control code that invokes the function on this particular driver.

use std::collections::HashMap;

/// Vendor feature tags of the CCID class specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Feature {
    /// Start a PIN verification on the reader.
    VerifyPinStart = 0x01,
    /// Finish a started PIN verification.
    VerifyPinFinish = 0x02,
    /// Start a PIN modification on the reader.
    ModifyPinStart = 0x03,
    /// Finish a started PIN modification.
    ModifyPinFinish = 0x04,
    /// Poll the keypad for a pressed key.
    GetKeyPressed = 0x05,
    /// One-shot PIN verification on the reader.
    VerifyPinDirect = 0x06,
    /// One-shot PIN modification on the reader.
    ModifyPinDirect = 0x07,
    /// MCT reader direct access.
    MctReaderDirect = 0x08,
    /// MCT universal access.
    MctUniversal = 0x09,
    /// Keypad properties of the reader.
    IfdPinProperties = 0x0A,
    /// Abort a pending keypad operation.
    Abort = 0x0B,
    /// Set the message shown during secure PIN entry.
    SetSpeMessage = 0x0C,
    /// PIN verification with application identifier.
    VerifyPinDirectAppId = 0x0D,
    /// PIN modification with application identifier.
    ModifyPinDirectAppId = 0x0E,
    /// Write to the reader display.
    WriteDisplay = 0x0F,
    /// Read a key from the keypad.
    GetKey = 0x10,
    /// Display properties of the reader.
    IfdDisplayProperties = 0x11,
    /// TLV encoded reader properties.
    GetTlvProperties = 0x12,
    /// CCID escape command.
    CcidEscCommand = 0x13,
    /// Execute a PACE protocol run on the reader.
    ExecutePace = 0x20,
}

impl Feature {
    /// Decode a feature tag byte.
    pub const fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::VerifyPinStart,
            0x02 => Self::VerifyPinFinish,
            0x03 => Self::ModifyPinStart,
            0x04 => Self::ModifyPinFinish,
            0x05 => Self::GetKeyPressed,
            0x06 => Self::VerifyPinDirect,
            0x07 => Self::ModifyPinDirect,
            0x08 => Self::MctReaderDirect,
            0x09 => Self::MctUniversal,
            0x0A => Self::IfdPinProperties,
            0x0B => Self::Abort,
            0x0C => Self::SetSpeMessage,
            0x0D => Self::VerifyPinDirectAppId,
            0x0E => Self::ModifyPinDirectAppId,
            0x0F => Self::WriteDisplay,
            0x10 => Self::GetKey,
            0x11 => Self::IfdDisplayProperties,
            0x12 => Self::GetTlvProperties,
            0x13 => Self::CcidEscCommand,
            0x20 => Self::ExecutePace,
            _ => return None,
        })
    }
}

/// Control code that requests the feature TLV list from the driver.
pub const fn feature_request_code() -> u32 {
    scard_ctl_code(3400)
}

/// Translate a PC/SC function number into a platform control code.
pub const fn scard_ctl_code(function: u32) -> u32 {
    if cfg!(windows) {
        0x0031_0000 | (function << 2)
    } else {
        0x4200_0000 + function
    }
}

/// Parse the feature TLV list into a tag to control-code map.
///
/// Entries are `tag(1) length(1 = 4) code(4, big endian)`; malformed or
/// unknown entries are skipped so a quirky driver degrades to fewer features
/// instead of an error.
pub fn parse_feature_list(data: &[u8]) -> HashMap<Feature, u32> {
    let mut features = HashMap::new();
    let mut rest = data;
    while let [tag, len, value @ ..] = rest {
        let len = *len as usize;
        if value.len() < len {
            break;
        }
        if len == 4
            && let Some(feature) = Feature::from_tag(*tag)
        {
            let code = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
            features.insert(feature, code);
        }
        rest = &value[len..];
    }
    features
}
