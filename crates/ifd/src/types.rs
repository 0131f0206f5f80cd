//! Data types of the facade operation set
//!
//! Handles are opaque 16-byte random values; equality is the only operation
//! callers may rely on. Status structures are plain owned data, so a snapshot
//! handed out by the facade never aliases internal state.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Outcome;

/// Opaque handle of an established context.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle([u8; 16]);

impl ContextHandle {
    /// Draw a fresh random handle.
    pub(crate) fn random() -> Self {
        Self(rand::random())
    }

    /// The raw handle bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContextHandle({})", hex::encode(self.0))
    }
}

/// Opaque handle of a connected card channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle([u8; 16]);

impl SlotHandle {
    pub(crate) fn random() -> Self {
        Self(rand::random())
    }

    /// The raw handle bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SlotHandle({})", hex::encode(self.0))
    }
}

/// State of the single slot of a terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStatus {
    /// Slot index, always 0 on single-slot terminals.
    pub index: u64,
    /// Whether a card is available in the slot.
    pub card_available: bool,
    /// Answer To Reset of the card, if one is available and readable.
    pub atr: Option<Bytes>,
}

impl SlotStatus {
    /// Empty slot at index 0.
    pub const fn empty() -> Self {
        Self {
            index: 0,
            card_available: false,
            atr: None,
        }
    }
}

/// Full state of one terminal as reported by status and wait operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdStatus {
    /// Terminal name.
    pub ifd_name: String,
    /// Whether the terminal is attached to the system.
    pub connected: bool,
    /// Per-slot state; single-slot terminals report exactly one entry.
    pub slots: Vec<SlotStatus>,
}

impl IfdStatus {
    /// Status of an attached terminal with one empty slot.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            ifd_name: name.into(),
            connected: true,
            slots: vec![SlotStatus::empty()],
        }
    }
}

/// Receiver of asynchronous wait results.
///
/// The facade invokes `signal` from a background thread once the registered
/// wait observes a difference; a delivery failure is logged, never retried.
pub trait WaitCallback: Send + Sync {
    /// Deliver the diff for the session the callback was registered under.
    fn signal(&self, session: &str, events: &[IfdStatus]) -> Result<(), CallbackError>;
}

/// Failure to deliver an asynchronous wait result.
#[derive(Debug, Clone, thiserror::Error)]
#[error("callback delivery failed: {0}")]
pub struct CallbackError(pub String);

/// Response of the establish-context operation.
#[derive(Debug, Clone)]
pub struct EstablishContextResponse {
    /// Operation outcome.
    pub outcome: Outcome,
    /// Handle of the (possibly shared) context on success.
    pub context: Option<ContextHandle>,
}

/// Response of operations that only report an outcome.
#[derive(Debug, Clone)]
pub struct SimpleResponse {
    /// Operation outcome.
    pub outcome: Outcome,
}

/// Response of the terminal enumeration operation.
#[derive(Debug, Clone)]
pub struct ListTerminalsResponse {
    /// Operation outcome.
    pub outcome: Outcome,
    /// Names of the attached terminals.
    pub terminals: Vec<String>,
}

/// Response of the status query operation.
#[derive(Debug, Clone)]
pub struct StatusResponse {
    /// Operation outcome.
    pub outcome: Outcome,
    /// One entry per queried terminal.
    pub statuses: Vec<IfdStatus>,
}

/// Response of the wait operation.
#[derive(Debug, Clone)]
pub struct WaitResponse {
    /// Operation outcome.
    pub outcome: Outcome,
    /// Terminals whose state differs from the expectation.
    pub events: Vec<IfdStatus>,
    /// Session identifier of an asynchronous wait, used to cancel it.
    pub session: Option<String>,
}

/// Response of the connect operation.
#[derive(Debug, Clone)]
pub struct ConnectResponse {
    /// Operation outcome.
    pub outcome: Outcome,
    /// Handle of the fresh card channel on success.
    pub slot: Option<SlotHandle>,
}

/// One command of a transmit batch.
#[derive(Debug, Clone)]
pub struct InputApdu {
    /// The command APDU.
    pub apdu: Bytes,
    /// Accepted status codes; one byte matches SW1 alone, two bytes match the
    /// full trailer. An empty list accepts every response.
    pub accepted_status: Vec<Bytes>,
}

impl InputApdu {
    /// Command that only accepts a `90 00` trailer.
    pub fn expecting_ok(apdu: impl Into<Bytes>) -> Self {
        Self {
            apdu: apdu.into(),
            accepted_status: vec![Bytes::from_static(&[0x90, 0x00])],
        }
    }
}

/// Response of the transmit operation.
#[derive(Debug, Clone)]
pub struct TransmitResponse {
    /// Operation outcome.
    pub outcome: Outcome,
    /// Responses received so far, including the one that stopped the batch.
    pub responses: Vec<Bytes>,
}

/// Response of the reader control operation.
#[derive(Debug, Clone)]
pub struct ControlResponse {
    /// Operation outcome.
    pub outcome: Outcome,
    /// Raw response of the reader function.
    pub response: Option<Bytes>,
}

/// Disposition of the card on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectAction {
    /// Leave the card as is.
    #[default]
    Leave,
    /// Cold-reset the card on disconnect.
    Reset,
}

/// Stored password encoding, governing how a PIN is turned into bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordType {
    /// Digits as ASCII characters.
    AsciiNumeric,
    /// UTF-8 encoded characters.
    Utf8,
    /// One digit per byte, high nibble padded with `F`.
    HalfNibbleBcd,
    /// Two digits per byte.
    Bcd,
    /// ISO 9564-1 format 2 PIN block.
    Iso9564_1,
}

/// Attributes of the password a verification asks for.
#[derive(Debug, Clone)]
pub struct PasswordAttributes {
    /// Encoding of the stored password.
    pub pwd_type: PasswordType,
    /// Minimum number of characters.
    pub min_length: usize,
    /// Length of the stored password object in bytes.
    pub stored_length: usize,
    /// Maximum number of characters, if constrained.
    pub max_length: Option<usize>,
    /// Whether the encoded password is padded up to the stored length.
    pub needs_padding: bool,
    /// Padding byte; defaults to `FF` when padding is needed but unset.
    pub pad_char: Option<u8>,
}

/// PIN input unit selection of a verification.
#[derive(Debug, Clone)]
pub struct PinInput {
    /// Index of the input unit on the terminal.
    pub index: u64,
    /// Attributes of the password to capture.
    pub password: PasswordAttributes,
}

/// Input unit a verification runs against.
#[derive(Debug, Clone)]
pub enum InputUnit {
    /// PIN entry via keypad or dialog.
    Pin(PinInput),
    /// Biometric sensor; not supported by this layer.
    Biometric,
}

/// Request of the user verification operation.
#[derive(Debug, Clone)]
pub struct VerifyUser {
    /// Card channel the verification runs on.
    pub slot: SlotHandle,
    /// Input unit to use.
    pub input_unit: InputUnit,
    /// Display to show instructions on, if any.
    pub display_index: Option<u64>,
    /// Command template, e.g. `00 20 00 01`, completed with the PIN block.
    pub template: Bytes,
}

/// Response of the user verification operation.
#[derive(Debug, Clone)]
pub struct VerifyUserResponse {
    /// Operation outcome.
    pub outcome: Outcome,
    /// Raw card response of the verification command, when one was sent.
    pub response: Option<Bytes>,
}

/// PACE parameters of an establish-channel request.
#[derive(Debug, Clone, Default)]
pub struct PaceInput {
    /// Identifier of the password to use (MRZ, CAN, PIN, PUK).
    pub pin_id: u8,
    /// Certificate holder authorization template, if terminal authentication
    /// follows.
    pub chat: Option<Bytes>,
    /// Password value when it is supplied by software instead of the reader.
    pub pin: Option<String>,
    /// Certificate description to show to the user.
    pub certificate_description: Option<Bytes>,
}

/// Request of the establish-channel operation.
#[derive(Debug, Clone)]
pub struct EstablishChannelRequest {
    /// Card channel to establish the protocol on.
    pub slot: SlotHandle,
    /// Protocol identifier, e.g. the PACE object identifier URN.
    pub protocol: String,
    /// Protocol specific input.
    pub pace: PaceInput,
}

/// Result data of a PACE channel establishment.
#[derive(Debug, Clone, Default)]
pub struct PaceOutput {
    /// Status word the card reported for the final protocol step.
    pub status: u16,
    /// Remaining password retries, if the reader reported them.
    pub retry_counter: Option<u8>,
    /// Content of the card's `EF.CardAccess` file.
    pub ef_card_access: Bytes,
    /// Most recent certification authority reference.
    pub current_car: Option<Bytes>,
    /// Previous certification authority reference.
    pub previous_car: Option<Bytes>,
    /// Card identifier derived from the PACE mapping.
    pub id_icc: Option<Bytes>,
}

/// Response of the establish-channel operation.
#[derive(Debug, Clone)]
pub struct EstablishChannelResponse {
    /// Operation outcome.
    pub outcome: Outcome,
    /// Protocol output on success.
    pub data: Option<PaceOutput>,
}

/// Slot capability: the protocols a connected card can be addressed with.
#[derive(Debug, Clone, Default)]
pub struct SlotCapability {
    /// Protocol identifiers, e.g. PACE and PIN-compare URNs.
    pub protocols: Vec<String>,
}

/// A display the terminal offers.
#[derive(Debug, Clone)]
pub struct DisplayCapability {
    /// Index used to address this display.
    pub index: u64,
    /// Number of text lines, if known.
    pub lines: Option<u64>,
    /// Number of columns per line, if known.
    pub columns: Option<u64>,
}

/// A keypad the terminal offers.
#[derive(Debug, Clone)]
pub struct KeyPadCapability {
    /// Index used to address this keypad.
    pub index: u64,
    /// Minimum accepted input length.
    pub min_length: u64,
    /// Maximum accepted input length.
    pub max_length: u64,
}

/// Everything a terminal can do beyond moving APDUs.
#[derive(Debug, Clone, Default)]
pub struct IfdCapabilities {
    /// Capability of the (single) slot.
    pub slot: SlotCapability,
    /// Displays, usually empty on consumer readers.
    pub displays: Vec<DisplayCapability>,
    /// Keypads; present when the reader does native PIN entry.
    pub keypads: Vec<KeyPadCapability>,
    /// Whether the terminal can emit an optical signal.
    pub optical_signal: bool,
    /// Whether the terminal can emit an acoustic signal.
    pub acoustic_signal: bool,
}

/// Response of the capability query operation.
#[derive(Debug, Clone)]
pub struct CapabilitiesResponse {
    /// Operation outcome.
    pub outcome: Outcome,
    /// Capabilities of the queried terminal on success.
    pub capabilities: Option<IfdCapabilities>,
}

/// Target of a cancel request.
#[derive(Debug, Clone)]
pub enum CancelTarget {
    /// Cancel the asynchronous wait registered under this session.
    Session(String),
    /// Cancel the synchronous wait pending for this terminal.
    Terminal(String),
}

/// Shared callback handle used by asynchronous waits.
pub type SharedCallback = Arc<dyn WaitCallback>;
