//! End to end tests of the facade against the in-memory backend.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Sender, unbounded};
use tessera_ifd::consent::{ConsentStatus, Form, StepOutcome, UserConsent};
use tessera_ifd::protocol::{
    IfdProtocol, ProtocolFactory, SecureMessaging, SecureMessagingError, uris,
};
use tessera_ifd::reader::feature_request_code;
use tessera_ifd::terminal::OutputInfo;
use tessera_ifd::types::{
    CallbackError, EstablishChannelRequest, EstablishChannelResponse, InputUnit, PaceInput,
    PasswordAttributes, PasswordType, PinInput, VerifyUser,
};
use tessera_ifd::{
    CancelTarget, ContextHandle, DisconnectAction, Ifd, IfdConfig, IfdStatus, InputApdu, Minor,
    Outcome, Terminated, WaitCallback,
};
use tessera_scio::mock::MockReaders;
use tessera_scio::{ScioError, ScioErrorCode};

fn ifd_over(readers: &MockReaders) -> Ifd {
    // Honours RUST_LOG under `cargo test -- --nocapture`; later calls are no-ops.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Ifd::new(Arc::new(readers.clone()))
}

fn context(ifd: &Ifd) -> ContextHandle {
    let response = ifd.establish_context();
    assert!(response.outcome.is_ok());
    response.context.unwrap()
}

/// Scripted consent engine: fills password fields and runs step actions.
struct AutoEngine {
    pin: Option<String>,
}

impl UserConsent for AutoEngine {
    fn run(&self, form: &mut Form) -> ConsentStatus {
        let Form { steps, results, .. } = form;
        for step in steps {
            if let (Some(field), Some(pin)) = (&step.password, &self.pin) {
                results.insert((step.id.clone(), field.id.clone()), pin.clone());
            }
            if let Some(action) = step.action.as_mut()
                && action.perform() == StepOutcome::Cancel
            {
                return ConsentStatus::Cancel;
            }
        }
        ConsentStatus::Ok
    }
}

/// Software protocol whose secure messaging inverts every byte.
struct XorProtocol;

impl SecureMessaging for XorProtocol {
    fn apply(&mut self, apdu: &[u8]) -> Result<Vec<u8>, SecureMessagingError> {
        Ok(apdu.iter().map(|b| b ^ 0xFF).collect())
    }

    fn remove(&mut self, response: &[u8]) -> Result<Vec<u8>, SecureMessagingError> {
        Ok(response.iter().map(|b| b ^ 0xFF).collect())
    }
}

impl IfdProtocol for XorProtocol {
    fn establish(
        &mut self,
        _request: &EstablishChannelRequest,
        _gui: Option<&dyn UserConsent>,
    ) -> EstablishChannelResponse {
        EstablishChannelResponse {
            outcome: Outcome::ok(),
            data: None,
        }
    }
}

struct XorFactory;

impl ProtocolFactory for XorFactory {
    fn create(&self) -> Box<dyn IfdProtocol> {
        Box::new(XorProtocol)
    }
}

struct ChannelCallback(Sender<(String, Vec<IfdStatus>)>);

impl WaitCallback for ChannelCallback {
    fn signal(&self, session: &str, events: &[IfdStatus]) -> Result<(), CallbackError> {
        self.0
            .send((session.to_string(), events.to_vec()))
            .map_err(|e| CallbackError(e.to_string()))
    }
}

fn ascii_pin_attributes() -> PasswordAttributes {
    PasswordAttributes {
        pwd_type: PasswordType::AsciiNumeric,
        min_length: 6,
        stored_length: 6,
        max_length: Some(6),
        needs_padding: false,
        pad_char: None,
    }
}

#[test]
fn context_lifecycle_is_refcounted() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    let ifd = ifd_over(&readers);

    let ctx = context(&ifd);
    let joined = ifd.establish_context();
    assert_eq!(joined.context, Some(ctx));

    // one of two clients releases, the context stays alive
    assert!(ifd.release_context(&ctx).outcome.is_ok());
    assert!(ifd.list_terminals(&ctx).outcome.is_ok());

    assert!(ifd.release_context(&ctx).outcome.is_ok());
    let gone = ifd.list_terminals(&ctx);
    assert_eq!(gone.outcome.minor(), Some(Minor::InvalidContextHandle));

    // a stale handle cannot touch the next context
    let fresh = context(&ifd);
    assert_ne!(fresh, ctx);
    let stale = ifd.release_context(&ctx);
    assert_eq!(stale.outcome.minor(), Some(Minor::InvalidContextHandle));
    assert!(ifd.release_context(&fresh).outcome.is_ok());
}

#[test]
fn listing_and_status() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    readers.add_terminal("Reader B");
    readers.insert_card("Reader A", &[0x3B, 0x8A]);
    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);

    let listed = ifd.list_terminals(&ctx);
    assert_eq!(listed.terminals, vec!["Reader A", "Reader B"]);

    let all = ifd.get_status(&ctx, None);
    assert!(all.outcome.is_ok());
    assert_eq!(all.statuses.len(), 2);
    let a = all.statuses.iter().find(|s| s.ifd_name == "Reader A").unwrap();
    assert!(a.slots[0].card_available);
    assert_eq!(a.slots[0].atr.as_deref(), Some(&[0x3Bu8, 0x8A][..]));
    let b = all.statuses.iter().find(|s| s.ifd_name == "Reader B").unwrap();
    assert!(!b.slots[0].card_available);

    let missing = ifd.get_status(&ctx, Some("Reader C"));
    assert_eq!(missing.outcome.minor(), Some(Minor::UnknownIfd));
}

#[test]
fn capabilities_carry_software_protocols() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    readers.insert_card("Reader A", &[0x3B]);
    let ifd = ifd_over(&readers);
    assert!(ifd.add_protocol(uris::PACE, Box::new(XorFactory)));
    assert!(!ifd.add_protocol(uris::PACE, Box::new(XorFactory)));
    let ctx = context(&ifd);

    let response = ifd.get_capabilities(&ctx, "Reader A");
    assert!(response.outcome.is_ok());
    let protocols = &response.capabilities.unwrap().slot.protocols;
    assert!(protocols.iter().any(|p| p == uris::PACE));
    assert!(protocols.iter().any(|p| p == uris::PIN_COMPARE));

    let missing = ifd.get_capabilities(&ctx, "Reader B");
    assert_eq!(missing.outcome.minor(), Some(Minor::UnknownIfd));
}

#[test]
fn wait_with_empty_expectation_returns_the_snapshot() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    readers.insert_card("Reader A", &[0x3B]);
    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);

    let response = ifd
        .wait(&ctx, Some(Duration::from_secs(5)), Vec::new(), None)
        .unwrap();
    assert!(response.outcome.is_ok());
    assert_eq!(response.session, None);
    assert_eq!(response.events.len(), 1);
    assert!(response.events[0].slots[0].card_available);
    // answered from the snapshot, no blocking wait involved
    assert_eq!(readers.wait_calls(), 0);
}

#[test]
fn wait_rejects_a_zero_timeout() {
    let readers = MockReaders::new();
    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);

    let response = ifd
        .wait(&ctx, Some(Duration::ZERO), Vec::new(), None)
        .unwrap();
    assert_eq!(response.outcome.minor(), Some(Minor::IncorrectParameter));
}

#[test]
fn synchronous_wait_observes_an_insertion() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);

    let snapshot = ifd
        .wait(&ctx, Some(Duration::from_secs(5)), Vec::new(), None)
        .unwrap()
        .events;

    let inserter = {
        let readers = readers.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            readers.insert_card("Reader A", &[0x3B, 0x8A]);
        })
    };
    let response = ifd
        .wait(&ctx, Some(Duration::from_secs(5)), snapshot, None)
        .unwrap();
    inserter.join().unwrap();

    assert!(response.outcome.is_ok());
    assert_eq!(response.events.len(), 1);
    assert!(response.events[0].slots[0].card_available);
    assert_eq!(
        response.events[0].slots[0].atr.as_deref(),
        Some(&[0x3Bu8, 0x8A][..])
    );
}

#[test]
fn cancel_terminates_a_synchronous_wait() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    let ifd = Arc::new(ifd_over(&readers));
    let ctx = context(&ifd);

    let snapshot = ifd
        .wait(&ctx, Some(Duration::from_secs(30)), Vec::new(), None)
        .unwrap()
        .events;

    let canceller = {
        let ifd = Arc::clone(&ifd);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let response = ifd.cancel(&CancelTarget::Terminal("Reader A".to_string()));
            assert!(response.outcome.is_ok());
        })
    };
    let result = ifd.wait(&ctx, Some(Duration::from_secs(30)), snapshot, None);
    canceller.join().unwrap();
    assert!(matches!(result, Err(Terminated)));

    // nothing left to cancel
    let again = ifd.cancel(&CancelTarget::Terminal("Reader A".to_string()));
    assert_eq!(again.outcome.minor(), Some(Minor::CancelNotPossible));
}

#[test]
fn asynchronous_wait_delivers_through_the_callback() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);

    let snapshot = ifd
        .wait(&ctx, Some(Duration::from_secs(5)), Vec::new(), None)
        .unwrap()
        .events;

    let (tx, rx) = unbounded();
    let response = ifd
        .wait(
            &ctx,
            Some(Duration::from_secs(5)),
            snapshot,
            Some(Arc::new(ChannelCallback(tx))),
        )
        .unwrap();
    assert!(response.outcome.is_ok());
    assert!(response.events.is_empty());
    let session = response.session.unwrap();

    readers.insert_card("Reader A", &[0x3B]);
    let (delivered, events) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(delivered, session);
    assert_eq!(events.len(), 1);
    assert!(events[0].slots[0].card_available);

    // the completed session is gone
    let cancel = ifd.cancel(&CancelTarget::Session(session));
    assert_eq!(cancel.outcome.minor(), Some(Minor::CancelNotPossible));
}

#[test]
fn cancelled_asynchronous_wait_never_signals() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);

    let snapshot = ifd
        .wait(&ctx, Some(Duration::from_secs(5)), Vec::new(), None)
        .unwrap()
        .events;

    let (tx, rx) = unbounded();
    let session = ifd
        .wait(
            &ctx,
            Some(Duration::from_secs(30)),
            snapshot,
            Some(Arc::new(ChannelCallback(tx))),
        )
        .unwrap()
        .session
        .unwrap();

    let cancel = ifd.cancel(&CancelTarget::Session(session.clone()));
    assert!(cancel.outcome.is_ok());
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    let again = ifd.cancel(&CancelTarget::Session(session));
    assert_eq!(again.outcome.minor(), Some(Minor::CancelNotPossible));
}

#[test]
fn connect_reports_missing_terminal_and_card() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);

    let response = ifd.connect(&ctx, "Ghost Reader", false).unwrap();
    assert_eq!(response.outcome.minor(), Some(Minor::UnknownIfd));
    assert_eq!(response.slot, None);

    let response = ifd.connect(&ctx, "Reader A", false).unwrap();
    assert_eq!(response.outcome.minor(), Some(Minor::NoCard));
}

#[test]
fn transmit_stops_at_the_first_unaccepted_response() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    readers.insert_card_with("Reader A", &[0x3B], |apdu| match apdu[1] {
        0xA4 => Ok(vec![0x01, 0x90, 0x00]),
        0xB0 => Ok(vec![0x6A, 0x82]),
        _ => Ok(vec![0x90, 0x00]),
    });
    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);
    let slot = ifd.connect(&ctx, "Reader A", false).unwrap().slot.unwrap();

    let inputs = vec![
        InputApdu::expecting_ok(Bytes::from_static(&[0x00, 0xA4, 0x04, 0x00])),
        InputApdu::expecting_ok(Bytes::from_static(&[0x00, 0xB0, 0x00, 0x00])),
        InputApdu::expecting_ok(Bytes::from_static(&[0x00, 0xCA, 0x00, 0x00])),
    ];
    let response = ifd.transmit(&slot, &inputs).unwrap();
    assert!(!response.outcome.is_ok());
    // the rejected answer is still part of the response list
    assert_eq!(response.responses.len(), 2);
    assert_eq!(response.responses[0].as_ref(), &[0x01, 0x90, 0x00]);
    assert_eq!(response.responses[1].as_ref(), &[0x6A, 0x82]);

    assert!(ifd.disconnect(&slot, DisconnectAction::Leave).unwrap().outcome.is_ok());
    let gone = ifd.transmit(&slot, &inputs).unwrap();
    assert_eq!(gone.outcome.minor(), Some(Minor::InvalidSlotHandle));
}

#[test]
fn transmit_validates_status_codes_before_the_card() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    readers.insert_card_with("Reader A", &[0x3B], |_| {
        Err(ScioError::new(ScioErrorCode::Unknown, "must not be reached"))
    });
    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);
    let slot = ifd.connect(&ctx, "Reader A", false).unwrap().slot.unwrap();

    let inputs = vec![InputApdu {
        apdu: Bytes::from_static(&[0x00, 0xA4, 0x04, 0x00]),
        accepted_status: vec![Bytes::from_static(&[0x90, 0x00, 0x00])],
    }];
    let response = ifd.transmit(&slot, &inputs).unwrap();
    assert_eq!(response.outcome.minor(), Some(Minor::ParameterError));
    assert!(response.responses.is_empty());

    let manage = vec![InputApdu::expecting_ok(Bytes::from_static(&[
        0x00, 0x70, 0x00, 0x00,
    ]))];
    let response = ifd.transmit(&slot, &manage).unwrap();
    assert_eq!(response.outcome.minor(), Some(Minor::InvalidSlotHandle));
}

#[test]
fn transactions_need_a_live_slot() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    readers.insert_card("Reader A", &[0x3B]);
    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);
    let slot = ifd.connect(&ctx, "Reader A", false).unwrap().slot.unwrap();

    assert!(ifd.begin_transaction(&slot).unwrap().outcome.is_ok());
    assert!(ifd.end_transaction(&slot).unwrap().outcome.is_ok());

    ifd.disconnect(&slot, DisconnectAction::Leave).unwrap();
    let stale = ifd.begin_transaction(&slot).unwrap();
    assert_eq!(stale.outcome.minor(), Some(Minor::InvalidSlotHandle));
}

#[test]
fn control_dispatches_on_the_feature_tag() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    readers.insert_card("Reader A", &[0x3B]);
    readers.set_control_responder("Reader A", |code, data| {
        if code == feature_request_code() {
            // VERIFY_PIN_DIRECT at 0x42000D48
            return Ok(vec![0x06, 0x04, 0x42, 0x00, 0x0D, 0x48]);
        }
        assert_eq!(code, 0x4200_0D48);
        if data == [0x01] {
            Ok(vec![0x64, 0x00])
        } else {
            Ok(vec![0x90, 0x00])
        }
    });
    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);
    let slot = ifd.connect(&ctx, "Reader A", false).unwrap().slot.unwrap();

    let response = ifd.control_ifd(&slot, &[0x06, 0x00]).unwrap();
    assert!(response.outcome.is_ok());
    assert_eq!(response.response.as_deref(), Some(&[0x90u8, 0x00][..]));

    let timed_out = ifd.control_ifd(&slot, &[0x06, 0x01]).unwrap();
    assert_eq!(timed_out.outcome.minor(), Some(Minor::Timeout));

    // a valid tag the reader does not advertise
    let unsupported = ifd.control_ifd(&slot, &[0x0B, 0x00]).unwrap();
    assert_eq!(unsupported.outcome.minor(), Some(Minor::UnknownIfdError));

    let empty = ifd.control_ifd(&slot, &[]).unwrap();
    assert_eq!(empty.outcome.minor(), Some(Minor::UnknownIfdError));
}

#[test]
fn verify_user_runs_the_software_path() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    readers.insert_card_with("Reader A", &[0x3B], |apdu| {
        assert_eq!(apdu, [0x00, 0x20, 0x00, 0x01, 0x06, b'1', b'2', b'3', b'4', b'5', b'6']);
        Ok(vec![0x90, 0x00])
    });
    let mut ifd = ifd_over(&readers);
    ifd.set_gui(Arc::new(AutoEngine {
        pin: Some("123456".to_string()),
    }));
    let ctx = context(&ifd);
    let slot = ifd.connect(&ctx, "Reader A", false).unwrap().slot.unwrap();

    let verify = VerifyUser {
        slot,
        input_unit: InputUnit::Pin(PinInput {
            index: 0,
            password: ascii_pin_attributes(),
        }),
        display_index: None,
        template: Bytes::from_static(&[0x00, 0x20, 0x00, 0x01]),
    };
    let response = ifd.verify_user(&verify).unwrap();
    assert!(response.outcome.is_ok());
    assert_eq!(response.response.as_deref(), Some(&[0x90u8, 0x00][..]));
}

#[test]
fn verify_user_prefers_the_reader_keypad() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    readers.insert_card_with("Reader A", &[0x3B], |_| {
        Err(ScioError::new(
            ScioErrorCode::Unknown,
            "native verification never transmits",
        ))
    });
    readers.set_control_responder("Reader A", |code, _| {
        if code == feature_request_code() {
            return Ok(vec![0x06, 0x04, 0x42, 0x00, 0x0D, 0x48]);
        }
        assert_eq!(code, 0x4200_0D48);
        Ok(vec![0x90, 0x00])
    });
    let mut ifd = ifd_over(&readers);
    ifd.set_gui(Arc::new(AutoEngine { pin: None }));
    let ctx = context(&ifd);
    let slot = ifd.connect(&ctx, "Reader A", false).unwrap().slot.unwrap();

    let verify = VerifyUser {
        slot,
        input_unit: InputUnit::Pin(PinInput {
            index: 0,
            password: ascii_pin_attributes(),
        }),
        display_index: None,
        template: Bytes::from_static(&[0x00, 0x20, 0x00, 0x01]),
    };
    let response = ifd.verify_user(&verify).unwrap();
    assert!(response.outcome.is_ok());
    assert_eq!(response.response.as_deref(), Some(&[0x90u8, 0x00][..]));
}

#[test]
fn software_protocol_attaches_and_detaches_secure_messaging() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    // the card only understands inverted commands while the channel is up
    readers.insert_card_with("Reader A", &[0x3B], |apdu| {
        if apdu[0] == 0xFF {
            Ok(vec![!0x90u8, !0x00u8])
        } else {
            Ok(vec![0x6F, 0x00])
        }
    });
    let ifd = ifd_over(&readers);
    assert!(ifd.add_protocol("urn:example:xor", Box::new(XorFactory)));
    let ctx = context(&ifd);
    let slot = ifd.connect(&ctx, "Reader A", false).unwrap().slot.unwrap();

    let unknown = ifd
        .establish_channel(&EstablishChannelRequest {
            slot,
            protocol: "urn:example:nonexistent".to_string(),
            pace: PaceInput::default(),
        })
        .unwrap();
    assert_eq!(unknown.outcome.minor(), Some(Minor::UnknownError));

    let established = ifd
        .establish_channel(&EstablishChannelRequest {
            slot,
            protocol: "urn:example:xor".to_string(),
            pace: PaceInput::default(),
        })
        .unwrap();
    assert!(established.outcome.is_ok());

    let select = vec![InputApdu::expecting_ok(Bytes::from_static(&[
        0x00, 0xA4, 0x00, 0x00,
    ]))];
    let wrapped = ifd.transmit(&slot, &select).unwrap();
    assert!(wrapped.outcome.is_ok());
    assert_eq!(wrapped.responses[0].as_ref(), &[0x90, 0x00]);

    assert!(ifd.destroy_channel(&slot).unwrap().outcome.is_ok());
    let plain = ifd.transmit(&slot, &select).unwrap();
    assert!(!plain.outcome.is_ok());
}

#[test]
fn native_pace_runs_on_the_reader() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    readers.insert_card("Reader A", &[0x3B]);
    readers.set_control_responder("Reader A", |code, data| {
        if code == feature_request_code() {
            // EXECUTE_PACE at 0x42000D98
            return Ok(vec![0x20, 0x04, 0x42, 0x00, 0x0D, 0x98]);
        }
        assert_eq!(code, 0x4200_0D98);
        match data[0] {
            // capability query: generic PACE
            0x01 => Ok(vec![0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01, 0x10]),
            // establish: status 9000, EF.CardAccess 31 81
            0x02 => Ok(vec![
                0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x00, 0x90, 0x02, 0x00, 0x31, 0x81,
            ]),
            other => panic!("unexpected PACE function {other}"),
        }
    });
    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);
    let slot = ifd.connect(&ctx, "Reader A", false).unwrap().slot.unwrap();

    let response = ifd
        .establish_channel(&EstablishChannelRequest {
            slot,
            protocol: uris::PACE.to_string(),
            pace: PaceInput::default(),
        })
        .unwrap();
    assert!(response.outcome.is_ok());
    let data = response.data.unwrap();
    assert_eq!(data.status, 0x9000);
    assert_eq!(data.ef_card_access.as_ref(), &[0x31, 0x81]);
    assert_eq!(data.retry_counter, None);
}

#[test]
fn output_needs_hardware_or_a_dialog_engine() {
    let readers = MockReaders::new();
    readers.add_terminal("Reader A");
    readers.insert_card("Reader A", &[0x3B]);

    let ifd = ifd_over(&readers);
    let ctx = context(&ifd);
    let out = OutputInfo {
        message: Some("Insert your card".to_string()),
        ..OutputInfo::default()
    };
    let response = ifd.output(&ctx, "Reader A", &out).unwrap();
    assert_eq!(response.outcome.minor(), Some(Minor::UnknownIfdError));

    let mut ifd = ifd_over(&readers);
    ifd.set_gui(Arc::new(AutoEngine { pin: None }));
    let ctx = context(&ifd);
    let response = ifd.output(&ctx, "Reader A", &out).unwrap();
    assert!(response.outcome.is_ok());
}

#[test]
fn polling_listener_serves_waits_when_configured() {
    let readers = MockReaders::new().with_broken_presence_wait();
    readers.add_terminal("Reader A");
    let config = IfdConfig {
        poll_delay_ms: 20,
        pause_delay_ms: 50,
        use_polling_listener: true,
    };
    let ifd = Ifd::with_config(Arc::new(readers.clone()), config);
    let ctx = context(&ifd);

    let snapshot = ifd
        .wait(&ctx, Some(Duration::from_secs(5)), Vec::new(), None)
        .unwrap()
        .events;
    assert_eq!(snapshot.len(), 1);

    // a pause window only delays polling, it does not lose the change
    ifd.pause_events();
    let inserter = {
        let readers = readers.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            readers.insert_card("Reader A", &[0x3B, 0x8A]);
        })
    };
    let response = ifd
        .wait(&ctx, Some(Duration::from_secs(5)), snapshot, None)
        .unwrap();
    inserter.join().unwrap();

    assert!(response.outcome.is_ok());
    assert_eq!(response.events.len(), 1);
    assert!(response.events[0].slots[0].card_available);
    // the defective blocking wait stayed out of the game
    assert_eq!(readers.wait_calls(), 0);
}
