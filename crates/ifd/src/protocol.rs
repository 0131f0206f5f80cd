//! Pluggable channel establishment protocols
//!
//! When a reader cannot run a protocol natively, a software implementation
//! registered here takes over. A protocol that establishes successfully is
//! attached to the card channel as its [`SecureMessaging`] layer, so every
//! subsequent transmit is wrapped and unwrapped transparently.

use std::collections::HashMap;

use crate::consent::UserConsent;
use crate::types::{EstablishChannelRequest, EstablishChannelResponse};

/// Well known protocol identifiers.
pub mod uris {
    /// PACE, password authenticated connection establishment.
    pub const PACE: &str = "urn:oid:0.4.0.127.0.7.2.2.4";
    /// Plain PIN comparison on the card.
    pub const PIN_COMPARE: &str = "urn:oid:1.3.162.15480.3.0.9";
}

/// Failure inside a secure messaging layer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("secure messaging failed: {0}")]
pub struct SecureMessagingError(pub String);

/// Cryptographic wrapper around a card channel.
pub trait SecureMessaging: Send {
    /// Wrap a plain command APDU for the wire.
    fn apply(&mut self, apdu: &[u8]) -> Result<Vec<u8>, SecureMessagingError>;

    /// Unwrap a wire response into its plain form.
    fn remove(&mut self, response: &[u8]) -> Result<Vec<u8>, SecureMessagingError>;
}

/// A software channel establishment protocol.
pub trait IfdProtocol: SecureMessaging {
    /// Run the protocol against the card; user interaction, when needed,
    /// goes through the supplied consent engine.
    fn establish(
        &mut self,
        request: &EstablishChannelRequest,
        gui: Option<&dyn UserConsent>,
    ) -> EstablishChannelResponse;
}

/// Factory producing a fresh protocol instance per establishment.
pub trait ProtocolFactory: Send + Sync {
    /// Create an unestablished protocol instance.
    fn create(&self) -> Box<dyn IfdProtocol>;
}

/// Registry of software protocol factories, keyed by protocol identifier.
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: HashMap<String, Box<dyn ProtocolFactory>>,
}

impl std::fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("protocols", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProtocolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a protocol identifier.
    ///
    /// Returns `false` when the identifier is already taken; the existing
    /// registration wins.
    pub fn add(&mut self, protocol: &str, factory: Box<dyn ProtocolFactory>) -> bool {
        if self.factories.contains_key(protocol) {
            return false;
        }
        self.factories.insert(protocol.to_string(), factory);
        true
    }

    /// Whether a factory is registered for the identifier.
    pub fn contains(&self, protocol: &str) -> bool {
        self.factories.contains_key(protocol)
    }

    /// Create a fresh instance of the protocol, if registered.
    pub fn create(&self, protocol: &str) -> Option<Box<dyn IfdProtocol>> {
        self.factories.get(protocol).map(|f| f.create())
    }

    /// All registered protocol identifiers.
    pub fn protocols(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Outcome;

    struct NullProtocol;

    impl SecureMessaging for NullProtocol {
        fn apply(&mut self, apdu: &[u8]) -> Result<Vec<u8>, SecureMessagingError> {
            Ok(apdu.to_vec())
        }

        fn remove(&mut self, response: &[u8]) -> Result<Vec<u8>, SecureMessagingError> {
            Ok(response.to_vec())
        }
    }

    impl IfdProtocol for NullProtocol {
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

    struct NullFactory;

    impl ProtocolFactory for NullFactory {
        fn create(&self) -> Box<dyn IfdProtocol> {
            Box::new(NullProtocol)
        }
    }

    #[test]
    fn first_registration_wins() {
        let mut registry = ProtocolRegistry::new();
        assert!(registry.add(uris::PACE, Box::new(NullFactory)));
        assert!(!registry.add(uris::PACE, Box::new(NullFactory)));
        assert!(registry.contains(uris::PACE));
        assert!(registry.create(uris::PACE).is_some());
        assert!(registry.create(uris::PIN_COMPARE).is_none());
    }
}
