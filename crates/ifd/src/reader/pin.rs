//! PIN encoding and the CCID secure PIN entry structure
//!
//! Two consumers exist: the software verification path encodes a PIN typed
//! into a dialog, and the native path serializes a [`PcscPinVerify`]
//! structure the reader firmware completes with the PIN entered on its own
//! keypad.

use crate::types::{PasswordAttributes, PasswordType};

/// Failure to encode a PIN or build a PIN entry structure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PinError {
    /// The entered PIN violates the length constraints.
    #[error("{0}")]
    BadLength(String),
    /// The entered PIN contains characters the encoding cannot express.
    #[error("entered PIN contains invalid characters")]
    InvalidCharacter,
    /// The attributes are inconsistent, e.g. padding without a stored length.
    #[error("{0}")]
    BadAttributes(String),
}

fn pad_char(attributes: &PasswordAttributes) -> Result<u8, PinError> {
    if attributes.pwd_type == PasswordType::Iso9564_1 {
        return Ok(0xFF);
    }
    match attributes.pad_char {
        Some(c) => Ok(c),
        None if attributes.needs_padding() => Err(PinError::BadAttributes(
            "padding is required but no pad character is given".into(),
        )),
        None => Ok(0),
    }
}

fn digit(c: char) -> Result<u8, PinError> {
    c.to_digit(10).map_or(Err(PinError::InvalidCharacter), |d| {
        #[allow(clippy::cast_possible_truncation)]
        Ok(d as u8)
    })
}

impl PasswordAttributes {
    /// Whether the encoded PIN is padded up to the stored length. ISO 9564-1
    /// blocks are always padded.
    pub fn needs_padding(&self) -> bool {
        self.pwd_type == PasswordType::Iso9564_1 || self.needs_padding
    }
}

/// Template of an untyped PIN: the padding bytes without any digits.
///
/// Returns an empty slice for unpadded encodings; the reader then appends
/// the PIN itself.
pub fn create_pin_mask(attributes: &PasswordAttributes) -> Result<Vec<u8>, PinError> {
    if !attributes.needs_padding() {
        return Ok(Vec::new());
    }
    if attributes.stored_length == 0 {
        return Err(PinError::BadAttributes(
            "PIN mask can only be created when the storage size is known".into(),
        ));
    }

    let mut pad = pad_char(attributes)?;
    if attributes.pwd_type == PasswordType::HalfNibbleBcd {
        pad |= 0xF0;
    }
    let mut mask = vec![pad; attributes.stored_length];
    if attributes.pwd_type == PasswordType::Iso9564_1 {
        mask[0] = 0x20;
    }
    Ok(mask)
}

/// Encode a typed PIN according to the password attributes.
pub fn encode_pin(pin: &str, attributes: &PasswordAttributes) -> Result<Vec<u8>, PinError> {
    let chars: Vec<char> = pin.chars().collect();
    if chars.len() < attributes.min_length {
        return Err(PinError::BadLength(format!(
            "entered PIN is too short, enter at least {} characters",
            attributes.min_length
        )));
    }
    if let Some(max) = attributes.max_length
        && chars.len() > max
    {
        return Err(PinError::BadLength(format!(
            "entered PIN is too long, enter at most {max} characters"
        )));
    }

    match attributes.pwd_type {
        PasswordType::AsciiNumeric | PasswordType::Utf8 => encode_text_pin(pin, attributes),
        PasswordType::Bcd | PasswordType::HalfNibbleBcd | PasswordType::Iso9564_1 => {
            encode_bcd_pin(&chars, attributes)
        }
    }
}

fn encode_text_pin(pin: &str, attributes: &PasswordAttributes) -> Result<Vec<u8>, PinError> {
    let needs_padding = attributes.needs_padding();
    if needs_padding && attributes.stored_length == 0 {
        return Err(PinError::BadAttributes(
            "padding is required but no stored length is given".into(),
        ));
    }
    if attributes.pwd_type == PasswordType::AsciiNumeric && !pin.is_ascii() {
        return Err(PinError::InvalidCharacter);
    }

    let mut bytes = pin.as_bytes().to_vec();
    if attributes.stored_length > 0 && bytes.len() > attributes.stored_length {
        return Err(PinError::BadLength(format!(
            "storage size for PIN exceeded, only {} bytes are allowed",
            attributes.stored_length
        )));
    }
    if needs_padding && bytes.len() < attributes.stored_length {
        let pad = pad_char(attributes)?;
        bytes.resize(attributes.stored_length, pad);
    }
    Ok(bytes)
}

fn encode_bcd_pin(pin: &[char], attributes: &PasswordAttributes) -> Result<Vec<u8>, PinError> {
    let pad = pad_char(attributes)?;
    let mut out = Vec::new();

    match attributes.pwd_type {
        PasswordType::Iso9564_1 => {
            #[allow(clippy::cast_possible_truncation)]
            out.push(0x20 | (pin.len() as u8 & 0x0F));
            pack_bcd(pin, pad, &mut out)?;
        }
        PasswordType::Bcd => pack_bcd(pin, pad, &mut out)?,
        PasswordType::HalfNibbleBcd => {
            for c in pin {
                out.push(0xF0 | digit(*c)?);
            }
        }
        _ => unreachable!("dispatched by encode_pin"),
    }

    if attributes.needs_padding() && out.len() < attributes.stored_length {
        out.resize(attributes.stored_length, pad);
    }
    Ok(out)
}

fn pack_bcd(pin: &[char], pad: u8, out: &mut Vec<u8>) -> Result<(), PinError> {
    for pair in pin.chunks(2) {
        let hi = digit(pair[0])? << 4;
        let lo = match pair.get(1) {
            Some(c) => digit(*c)?,
            None => pad & 0x0F,
        };
        out.push(hi | lo);
    }
    Ok(())
}

/// Complete a verification command template with an encoded PIN block.
pub fn build_verify_command(
    template: &[u8],
    attributes: &PasswordAttributes,
    pin: &str,
) -> Result<Vec<u8>, PinError> {
    let block = encode_pin(pin, attributes)?;
    let mut command = template.to_vec();
    #[allow(clippy::cast_possible_truncation)]
    command.push(block.len() as u8);
    command.extend_from_slice(&block);
    Ok(command)
}

/// Serialized `PIN_VERIFY` structure for secure PIN entry on the reader.
///
/// The field layout follows the USB CCID class specification; the command
/// payload is the verify template with the untyped PIN mask appended, which
/// the reader fills with the digits typed on its keypad.
#[derive(Debug, Clone)]
pub struct PcscPinVerify {
    /// Timeout in seconds, 0 means reader default.
    pub timeout: u8,
    /// Timeout in seconds after the first keystroke.
    pub timeout_after_key: u8,
    bm_format_string: u8,
    bm_pin_block_string: u8,
    bm_pin_length_format: u8,
    max_pin_size: u8,
    min_pin_size: u8,
    entry_validation: u8,
    number_messages: u8,
    lang_id: u16,
    msg_index: u8,
    data: Vec<u8>,
}

impl PcscPinVerify {
    /// Build the structure from password attributes and a command template.
    pub fn new(attributes: &PasswordAttributes, template: &[u8]) -> Result<Self, PinError> {
        let mask = create_pin_mask(attributes)?;
        let mut data = template.to_vec();
        if !mask.is_empty() {
            #[allow(clippy::cast_possible_truncation)]
            data.push(mask.len() as u8);
            data.extend_from_slice(&mask);
        }

        let iso_pin = attributes.pwd_type == PasswordType::Iso9564_1;
        let nibble = iso_pin || attributes.pwd_type == PasswordType::Bcd;

        // bit 7 system units are bytes, bits 3-6 PIN position, bits 0-1 type
        let pin_type: u8 = if nibble {
            1
        } else {
            match attributes.pwd_type {
                PasswordType::AsciiNumeric | PasswordType::Utf8 => 2,
                _ => 0,
            }
        };
        let pin_pos: u8 = if iso_pin { 1 } else { 0 };
        let bm_format_string = (1 << 7) | (pin_pos << 3) | pin_type;

        // high nibble bits of the length field, low nibble PIN block size
        let length_bits: u8 = if iso_pin { 4 } else { 0 };
        #[allow(clippy::cast_possible_truncation)]
        let pin_size = if iso_pin {
            (attributes.stored_length - 1) as u8
        } else {
            attributes.stored_length as u8
        };
        let bm_pin_block_string = (length_bits << 4) | pin_size;

        // length position in system units (bits)
        let bm_pin_length_format: u8 = if iso_pin { 4 } else { 0 };

        let max_len = attributes.max_length.unwrap_or(match attributes.pwd_type {
            PasswordType::Iso9564_1 => attributes.stored_length * 2 - 2,
            PasswordType::Bcd => attributes.stored_length * 2,
            _ => attributes.stored_length,
        });

        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            timeout: 0x3C,
            timeout_after_key: 0,
            bm_format_string,
            bm_pin_block_string,
            bm_pin_length_format,
            max_pin_size: max_len as u8,
            min_pin_size: attributes.min_length as u8,
            entry_validation: 0x02, // validation key pressed
            number_messages: 0x01,
            lang_id: 0x0409, // English (US)
            msg_index: 0,
            data,
        })
    }

    /// Set the USB language identifier of the reader messages.
    pub const fn set_language(&mut self, lang_id: u16) {
        self.lang_id = lang_id;
    }

    /// Serialize for the `VERIFY_PIN_DIRECT` control command.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(19 + self.data.len());
        out.push(self.timeout);
        out.push(self.timeout_after_key);
        out.push(self.bm_format_string);
        out.push(self.bm_pin_block_string);
        out.push(self.bm_pin_length_format);
        out.push(self.max_pin_size);
        out.push(self.min_pin_size);
        out.push(self.entry_validation);
        out.push(self.number_messages);
        out.extend_from_slice(&self.lang_id.to_le_bytes());
        out.push(self.msg_index);
        out.extend_from_slice(&[0, 0, 0]); // T=1 prologue
        #[allow(clippy::cast_possible_truncation)]
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}
