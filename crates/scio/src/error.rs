//! Error type and error-code vocabulary of the SCIO layer

/// Distilled smart-card service error codes.
///
/// The variants mirror the `SCARD_*` codes a PC/SC stack reports, reduced to
/// the set upper layers actually dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScioErrorCode {
    /// The operation requires a card, but no card is present.
    NoSmartcard,
    /// The card was removed while the operation was in progress.
    RemovedCard,
    /// The card was reset by another process or a warm reset occurred.
    ResetCard,
    /// The card is present but not powered.
    UnpoweredCard,
    /// The card did not answer to reset.
    UnresponsiveCard,
    /// The card is not supported by the reader or driver.
    UnsupportedCard,
    /// None of the requested protocols could be negotiated.
    ProtoMismatch,
    /// The operation timed out.
    Timeout,
    /// The operation was cancelled programmatically.
    Cancelled,
    /// The operation was cancelled by the user, e.g. with a reader button.
    CancelledByUser,
    /// A stale or foreign card/channel handle was used.
    InvalidHandle,
    /// The reader disappeared or cannot be reached.
    ReaderUnavailable,
    /// The smart-card service is not running.
    NoService,
    /// No readers are attached to the system.
    NoReadersAvailable,
    /// The card is opened exclusively by someone else.
    SharingViolation,
    /// Any condition without a dedicated variant.
    Unknown,
}

impl ScioErrorCode {
    /// Whether the code describes a transient card-not-usable condition
    /// rather than a real fault. Status queries absorb these.
    pub const fn is_transient_card_fault(self) -> bool {
        matches!(
            self,
            Self::NoSmartcard
                | Self::RemovedCard
                | Self::UnpoweredCard
                | Self::UnresponsiveCard
                | Self::UnsupportedCard
                | Self::ProtoMismatch
        )
    }
}

/// Error of the terminal primitive layer.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} [{code:?}]")]
pub struct ScioError {
    code: ScioErrorCode,
    message: String,
}

impl ScioError {
    /// Create an error with a code and message.
    pub fn new(code: ScioErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The error code.
    pub const fn code(&self) -> ScioErrorCode {
        self.code
    }

    /// The human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Error raised when a terminal name does not exist (anymore).
#[derive(Debug, Clone, thiserror::Error)]
#[error("no terminal with name '{0}'")]
pub struct NoSuchTerminal(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_faults() {
        assert!(ScioErrorCode::NoSmartcard.is_transient_card_fault());
        assert!(ScioErrorCode::UnresponsiveCard.is_transient_card_fault());
        assert!(!ScioErrorCode::ReaderUnavailable.is_transient_card_fault());
        assert!(!ScioErrorCode::Cancelled.is_transient_card_fault());
    }
}
