//! Operation outcomes and the cancellation signal
//!
//! Every facade operation reports an [`Outcome`]: a coarse major verdict plus
//! a [`Minor`] code from a fixed vocabulary that callers dispatch on. Errors
//! never abort the facade; the one exception is cancellation, which unwinds
//! as [`Terminated`] so the cancelling caller can tell a torn-down wait from
//! a wait that merely failed.

use tessera_scio::{ScioError, ScioErrorCode};

/// Coarse verdict of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Major {
    /// The operation succeeded.
    Ok,
    /// The operation failed; the minor code says why.
    Error,
}

/// Fine grained outcome codes callers dispatch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Minor {
    /// The context handle does not belong to a live context.
    InvalidContextHandle,
    /// The slot handle does not belong to a connected card channel.
    InvalidSlotHandle,
    /// No terminal with the given name is attached.
    UnknownIfd,
    /// The operation requires a card, but the slot is empty.
    NoCard,
    /// The operation did not finish within its deadline.
    Timeout,
    /// The user aborted the operation, e.g. in a dialog or at the reader.
    CancellationByUser,
    /// There is no pending operation matching the cancel request.
    CancelNotPossible,
    /// A parameter carries a value the operation cannot work with.
    IncorrectParameter,
    /// A parameter is structurally invalid, e.g. a malformed status code.
    ParameterError,
    /// The user could be asked, but authentication did not succeed.
    AuthenticationFailed,
    /// The requested input unit (display, keypad, biometric) does not exist.
    UnknownInputUnit,
    /// The requested operation is not available on this terminal.
    UnsupportedOperation,
    /// A fault in the terminal layer without a dedicated code.
    UnknownIfdError,
    /// A fault outside the terminal layer without a dedicated code.
    UnknownError,
}

/// Result of a facade operation: major verdict, minor code and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    major: Major,
    minor: Option<Minor>,
    message: Option<String>,
}

impl Outcome {
    /// Successful outcome.
    pub const fn ok() -> Self {
        Self {
            major: Major::Ok,
            minor: None,
            message: None,
        }
    }

    /// Failed outcome with a minor code and message.
    pub fn error(minor: Minor, message: impl Into<String>) -> Self {
        Self {
            major: Major::Error,
            minor: Some(minor),
            message: Some(message.into()),
        }
    }

    /// Failed outcome for terminal-layer faults without a dedicated code.
    pub fn unknown_ifd_error(message: impl Into<String>) -> Self {
        Self::error(Minor::UnknownIfdError, message)
    }

    /// Failed outcome for faults outside the terminal layer.
    pub fn unknown_error(message: impl Into<String>) -> Self {
        Self::error(Minor::UnknownError, message)
    }

    /// Whether the operation succeeded.
    pub fn is_ok(&self) -> bool {
        self.major == Major::Ok
    }

    /// The major verdict.
    pub const fn major(&self) -> Major {
        self.major
    }

    /// The minor code, present on errors.
    pub const fn minor(&self) -> Option<Minor> {
        self.minor
    }

    /// The human readable message, present on errors.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

/// Signal that a pending operation was torn down by an explicit cancel.
///
/// Cancellation is not converted into a normal error [`Outcome`]; it unwinds
/// past the facade boundary as the `Err` variant of every operation so the
/// caller that issued the cancel observes termination, not failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation terminated by cancellation")]
pub struct Terminated;

/// Result alias of all facade operations.
pub type IfdResult<T> = Result<T, Terminated>;

/// Translate a backend error into an outcome, or recognize cancellation.
///
/// A [`ScioErrorCode::Cancelled`] means somebody tore the operation down;
/// that is never reported as a result but propagated as [`Terminated`].
pub(crate) fn outcome_or_terminated(err: &ScioError, minor: Minor) -> Result<Outcome, Terminated> {
    match err.code() {
        ScioErrorCode::Cancelled => Err(Terminated),
        ScioErrorCode::Timeout => Ok(Outcome::error(Minor::Timeout, err.message())),
        ScioErrorCode::CancelledByUser => {
            Ok(Outcome::error(Minor::CancellationByUser, err.message()))
        }
        _ => Ok(Outcome::error(minor, err.message())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_accessors() {
        let ok = Outcome::ok();
        assert!(ok.is_ok());
        assert_eq!(ok.minor(), None);

        let err = Outcome::error(Minor::NoCard, "slot is empty");
        assert!(!err.is_ok());
        assert_eq!(err.minor(), Some(Minor::NoCard));
        assert_eq!(err.message(), Some("slot is empty"));
    }

    #[test]
    fn cancellation_is_not_an_outcome() {
        let err = ScioError::new(ScioErrorCode::Cancelled, "torn down");
        assert_eq!(
            outcome_or_terminated(&err, Minor::UnknownIfdError),
            Err(Terminated)
        );

        let err = ScioError::new(ScioErrorCode::NoSmartcard, "empty");
        let outcome = outcome_or_terminated(&err, Minor::NoCard).unwrap();
        assert_eq!(outcome.minor(), Some(Minor::NoCard));
    }
}
