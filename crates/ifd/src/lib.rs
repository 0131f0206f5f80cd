//! Interface-device layer over a smart-card terminal backend
//!
//! The [`Ifd`] facade turns a [`tessera_scio::ScioTerminals`] backend into a
//! complete terminal service: a shared refcounted context, terminal
//! enumeration and status, long running waits with asynchronous delivery and
//! cancellation, card channels with transmit policy and secure messaging,
//! reader vendor functions, PIN verification with a native and a software
//! path, and pluggable channel establishment protocols.
//!
//! Operations report their result as an [`Outcome`]; an explicit cancel is
//! the only thing that unwinds as an error, see [`Terminated`].
#![forbid(unsafe_code)]
#![warn(missing_docs, rustdoc::missing_crate_level_docs)]

pub mod channel;
pub mod config;
pub mod consent;
pub mod error;
pub mod facade;
pub mod listener;
pub mod manager;
mod pool;
pub mod protocol;
pub mod reader;
pub mod terminal;
pub mod terminal_info;
pub mod types;
pub mod watcher;

pub use config::{IfdConfig, PauseCoordinator};
pub use error::{IfdResult, Major, Minor, Outcome, Terminated};
pub use facade::Ifd;
pub use types::{
    CancelTarget, ContextHandle, DisconnectAction, IfdStatus, InputApdu, SlotHandle, SlotStatus,
    WaitCallback,
};
