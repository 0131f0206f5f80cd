//! Terminal primitive contract for smart-card stacks
//!
//! This crate defines the seam between an IFD-style terminal layer and a
//! concrete smart-card stack: terminal enumeration, card presence, channel
//! transmit, a bounded blocking change watcher and the error-code vocabulary
//! shared by all backends.
//!
//! Backends implement [`ScioTerminals`] and friends; the in-memory
//! [`mock::MockReaders`] backend ships here so dependent crates can test
//! without hardware.
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod error;
pub mod mock;
pub mod terminal;

pub use error::{NoSuchTerminal, ScioError, ScioErrorCode};
pub use terminal::{
    ScioCard, ScioProtocol, ScioResult, ScioTerminal, ScioTerminals, StateChange, StateChangeKind,
    TerminalState, TerminalWatcher, WatchCanceler, WatchEvent,
};
