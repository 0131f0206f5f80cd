//! Per-terminal user interaction: PIN verification and signal output
//!
//! A [`UserTerminal`] runs everything that needs the user on one connected
//! terminal. PIN verification takes one of two paths: a reader with a secure
//! keypad verifies natively while the dialog merely instructs the user, a
//! plain reader gets the PIN captured in the dialog, encoded in software and
//! sent as an ordinary verify command. Either way, a dialog abort surfaces
//! as a user cancellation, never as a generic failure.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tessera_scio::{ScioErrorCode, ScioResult};
use tracing::{info, warn};

use crate::channel::{SlotChannel, TransmitFault};
use crate::consent::{
    ConsentStatus, Form, PasswordField, Step, StepAction, StepOutcome, UserConsent,
};
use crate::error::{Minor, Outcome, Terminated, outcome_or_terminated};
use crate::protocol::uris;
use crate::reader::{PcscPinVerify, build_verify_command};
use crate::terminal_info::TerminalInfo;
use crate::types::{IfdCapabilities, InputUnit, PinInput, VerifyUser, VerifyUserResponse};

const PIN_STEP_ID: &str = "enter-pin";
const PIN_FIELD_ID: &str = "pin";
const OK_TRAILER: &[u8] = &[0x90, 0x00];

/// Output request of the signal operation: beep, blink or show a message.
#[derive(Debug, Clone, Default)]
pub struct OutputInfo {
    /// Display to show the message on, if a specific one is requested.
    pub display_index: Option<u64>,
    /// Message to show.
    pub message: Option<String>,
    /// How long to show the message.
    pub timeout: Option<Duration>,
    /// Emit an acoustic signal.
    pub acoustic: bool,
    /// Emit an optical signal.
    pub optic: bool,
}

/// User interaction adapter over one connected terminal.
///
/// Capabilities are supplied by the caller, who may extend the raw hardware
/// capabilities with software provided protocols.
pub struct UserTerminal {
    channel: Arc<SlotChannel>,
    info: TerminalInfo,
    capabilities: IfdCapabilities,
    gui: Option<Arc<dyn UserConsent>>,
    display_index: Option<u64>,
}

impl std::fmt::Debug for UserTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserTerminal")
            .field("terminal", &self.info.name())
            .field("virtual", &self.gui.is_some())
            .finish_non_exhaustive()
    }
}

impl UserTerminal {
    /// Adapter over a connected channel. Without a dialog engine only what
    /// the reader hardware itself provides is usable.
    pub fn new(
        channel: Arc<SlotChannel>,
        info: TerminalInfo,
        capabilities: IfdCapabilities,
        gui: Option<Arc<dyn UserConsent>>,
        display_index: Option<u64>,
    ) -> Self {
        Self {
            channel,
            info,
            capabilities,
            gui,
            display_index,
        }
    }

    /// A dialog engine can stand in for missing reader hardware.
    fn is_virtual(&self) -> bool {
        self.gui.is_some()
    }

    /// Emit the requested signals and message.
    ///
    /// Every requested signal must be available on the reader, or a dialog
    /// engine must be present to stand in for it.
    pub fn output(&self, out: &OutputInfo) -> Outcome {
        if out.acoustic && !(self.capabilities.acoustic_signal || self.is_virtual()) {
            let msg = "No device to output a beep available.";
            warn!(terminal = self.info.name(), msg);
            return Outcome::unknown_ifd_error(msg);
        }
        if out.optic && !(self.capabilities.optical_signal || self.is_virtual()) {
            let msg = "No device to output a blink available.";
            warn!(terminal = self.info.name(), msg);
            return Outcome::unknown_ifd_error(msg);
        }
        if let Some(message) = &out.message {
            if !(self.can_display() || self.is_virtual()) {
                let msg = "No device to output a message available.";
                warn!(terminal = self.info.name(), msg);
                return Outcome::unknown_ifd_error(msg);
            }
            if let Some(gui) = &self.gui {
                let mut form = Form::new(self.info.name());
                let mut step = Step::new("display-message", self.info.name());
                step.message = Some(message.clone());
                form.steps.push(step);
                if gui.run(&mut form) == ConsentStatus::Cancel {
                    return Outcome::error(
                        Minor::CancellationByUser,
                        "Message output cancelled by user.",
                    );
                }
            }
        }
        Outcome::ok()
    }

    fn can_display(&self) -> bool {
        match self.display_index {
            None => !self.capabilities.displays.is_empty(),
            Some(idx) => self.capabilities.displays.iter().any(|d| d.index == idx),
        }
    }

    /// Verify a PIN on this terminal.
    pub fn verify_user(&self, verify: &VerifyUser) -> Result<VerifyUserResponse, Terminated> {
        if !self
            .capabilities
            .slot
            .protocols
            .iter()
            .any(|p| p == uris::PIN_COMPARE)
        {
            return Ok(failed(Outcome::error(
                Minor::UnsupportedOperation,
                "PIN comparison is not supported by this terminal.",
            )));
        }

        let pin_input = match &verify.input_unit {
            InputUnit::Pin(pin_input) => pin_input,
            InputUnit::Biometric => {
                let msg = "Biometric authentication not supported.";
                warn!(terminal = self.info.name(), msg);
                return Ok(failed(Outcome::error(Minor::UnknownInputUnit, msg)));
            }
        };

        let Some(gui) = &self.gui else {
            return Ok(failed(Outcome::error(
                Minor::UnknownInputUnit,
                "No input unit available to perform the PIN comparison.",
            )));
        };

        if self.info.supports_pin_compare() {
            self.verify_native(gui.as_ref(), pin_input, &verify.template)
        } else {
            self.verify_software(gui.as_ref(), pin_input, &verify.template)
        }
    }

    /// Native path: the reader captures and checks the PIN on its keypad
    /// while the dialog shows an instruction and returns instantly.
    fn verify_native(
        &self,
        gui: &dyn UserConsent,
        pin_input: &PinInput,
        template: &[u8],
    ) -> Result<VerifyUserResponse, Terminated> {
        let Some(ctrl_code) = self.info.pin_compare_ctrl_code() else {
            unreachable!("checked by the caller");
        };
        let structure = match PcscPinVerify::new(&pin_input.password, template) {
            Ok(structure) => structure,
            Err(e) => {
                return Ok(failed(Outcome::unknown_error(format!(
                    "Unable to build the secure PIN entry structure: {e}"
                ))));
            }
        };

        let step = NativePinStep::new(Arc::clone(&self.channel), ctrl_code, structure.to_bytes());
        let outcome_slot = step.outcome_handle();

        let mut form = Form::new("PIN entry");
        let mut gui_step = Step::new(PIN_STEP_ID, "PIN entry");
        gui_step.message = Some("Enter the PIN on the card reader.".to_string());
        gui_step.instant_return = true;
        gui_step.action = Some(Box::new(step));
        form.steps.push(gui_step);

        if gui.run(&mut form) == ConsentStatus::Cancel {
            let msg = "PIN entry cancelled by user.";
            warn!(terminal = self.info.name(), msg);
            return Ok(failed(Outcome::error(Minor::CancellationByUser, msg)));
        }

        let result = outcome_slot.lock().unwrap().take();
        match result {
            Some(Ok(response)) => Ok(VerifyUserResponse {
                outcome: check_native_pin_verify(&response),
                response: Some(response),
            }),
            Some(Err(e)) => {
                warn!(terminal = self.info.name(), "native PIN verify failed: {e}");
                Ok(failed(outcome_or_terminated(
                    &e,
                    Minor::AuthenticationFailed,
                )?))
            }
            None => Ok(failed(Outcome::unknown_error(
                "The PIN entry step was never executed.",
            ))),
        }
    }

    /// Software path: capture the PIN in the dialog, encode it and send an
    /// ordinary verify command. Repeats while the card reports tries left.
    fn verify_software(
        &self,
        gui: &dyn UserConsent,
        pin_input: &PinInput,
        template: &[u8],
    ) -> Result<VerifyUserResponse, Terminated> {
        let attributes = &pin_input.password;
        let min_length = attributes.min_length;
        let max_length = attributes
            .max_length
            .unwrap_or(attributes.stored_length * 2);

        loop {
            let mut form = Form::new("PIN entry");
            let mut step = Step::new(PIN_STEP_ID, "PIN entry");
            step.message = Some("Enter the PIN.".to_string());
            step.password = Some(PasswordField {
                id: PIN_FIELD_ID.to_string(),
                description: "PIN".to_string(),
                min_length,
                max_length,
            });
            form.steps.push(step);

            if gui.run(&mut form) == ConsentStatus::Cancel {
                let msg = "PIN entry cancelled by user.";
                warn!(terminal = self.info.name(), msg);
                return Ok(failed(Outcome::error(Minor::CancellationByUser, msg)));
            }

            let Some(pin) = form.field_value(PIN_STEP_ID, PIN_FIELD_ID) else {
                return Ok(failed(Outcome::unknown_error(
                    "The dialog did not capture a PIN.",
                )));
            };

            let command = match build_verify_command(template, attributes, pin) {
                Ok(command) => command,
                Err(e) => {
                    return Ok(failed(Outcome::unknown_error(format!(
                        "Failed to create the verification command: {e}"
                    ))));
                }
            };

            let accepted = vec![Bytes::from_static(OK_TRAILER)];
            match self.channel.transmit(&command, &accepted) {
                Ok(response) => {
                    return Ok(VerifyUserResponse {
                        outcome: Outcome::ok(),
                        response: Some(response),
                    });
                }
                Err(TransmitFault::Rejected { response }) => {
                    if let Some(tries) = tries_left(&response) {
                        info!("PIN not entered successfully, {tries} tries left");
                        continue;
                    }
                    return Ok(VerifyUserResponse {
                        outcome: Outcome::error(
                            Minor::AuthenticationFailed,
                            "The card rejected the entered PIN.",
                        ),
                        response: Some(response),
                    });
                }
                Err(TransmitFault::Scio(e)) => {
                    return Ok(failed(outcome_or_terminated(
                        &e,
                        Minor::AuthenticationFailed,
                    )?));
                }
                Err(other) => {
                    return Ok(failed(Outcome::unknown_error(other.to_string())));
                }
            }
        }
    }
}

const fn failed(outcome: Outcome) -> VerifyUserResponse {
    VerifyUserResponse {
        outcome,
        response: None,
    }
}

/// Remaining tries encoded in a `63 CX` trailer, when X is non-zero.
fn tries_left(response: &[u8]) -> Option<u8> {
    if response.len() < 2 {
        return None;
    }
    let sw1 = response[response.len() - 2];
    let sw2 = response[response.len() - 1];
    if sw1 == 0x63 && sw2 & 0xF0 == 0xC0 && sw2 & 0x0F > 0 {
        Some(sw2 & 0x0F)
    } else {
        None
    }
}

/// Classify the raw status word of a native keypad verification.
pub(crate) fn check_native_pin_verify(response: &[u8]) -> Outcome {
    let [sw1, sw2, ..] = response else {
        return Outcome::unknown_error("Verification produced a malformed response.");
    };
    match (*sw1, *sw2) {
        (0x90, 0x00) => Outcome::ok(),
        (0x64, 0x00) => Outcome::error(Minor::Timeout, "Verify operation timed out."),
        (0x64, 0x01) => Outcome::error(
            Minor::CancellationByUser,
            "Verify operation was cancelled with the cancel button.",
        ),
        (0x64, 0x02) => Outcome::unknown_error("The two entered PINs were different."),
        (0x64, 0x03) => Outcome::unknown_error("PIN has wrong length."),
        (0x6B, 0x80) => Outcome::unknown_error("Invalid parameter passed to verify command."),
        (sw1, sw2) => Outcome::unknown_error(format!(
            "Verification ended with status {}",
            hex::encode([sw1, sw2])
        )),
    }
}

/// Dialog step action submitting a secure PIN entry structure to the reader.
///
/// The reader blocks inside the control call while the user types; the step
/// stores the raw response (or the failure) for the caller waiting on the
/// dialog to finish.
pub struct NativePinStep {
    channel: Arc<SlotChannel>,
    ctrl_code: u32,
    command: Vec<u8>,
    outcome: Arc<Mutex<Option<ScioResult<Bytes>>>>,
}

impl NativePinStep {
    /// Step over a channel, a control code and a serialized request.
    pub fn new(channel: Arc<SlotChannel>, ctrl_code: u32, command: Vec<u8>) -> Self {
        Self {
            channel,
            ctrl_code,
            command,
            outcome: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle the dialog owner polls after the form completed.
    pub fn outcome_handle(&self) -> Arc<Mutex<Option<ScioResult<Bytes>>>> {
        Arc::clone(&self.outcome)
    }
}

impl StepAction for NativePinStep {
    fn perform(&mut self) -> StepOutcome {
        let result = self.channel.transmit_control(self.ctrl_code, &self.command);
        let verdict = match &result {
            Err(e) if e.code() == ScioErrorCode::CancelledByUser => StepOutcome::Cancel,
            _ => StepOutcome::Proceed,
        };
        *self.outcome.lock().unwrap() = Some(result);
        verdict
    }
}
