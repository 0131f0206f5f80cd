//! Reader vendor functions: feature discovery, secure PIN entry, PACE

pub mod features;
pub mod pace;
pub mod pin;

pub use features::{Feature, feature_request_code, parse_feature_list, scard_ctl_code};
pub use pace::{
    EstablishPaceRequest, EstablishPaceResponse, ExecutePaceRequest, ExecutePaceResponse,
    PaceCapability, PaceFunction, pace_protocol_list,
};
pub use pin::{PcscPinVerify, PinError, build_verify_command, create_pin_mask, encode_pin};
