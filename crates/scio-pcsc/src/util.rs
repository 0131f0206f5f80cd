//! Mapping between PC/SC errors and the SCIO vocabulary

use tessera_scio::{ScioError, ScioErrorCode};

/// Translate a `pcsc` error into the backend-independent code.
pub(crate) fn map_code(err: pcsc::Error) -> ScioErrorCode {
    match err {
        pcsc::Error::NoSmartcard => ScioErrorCode::NoSmartcard,
        pcsc::Error::RemovedCard => ScioErrorCode::RemovedCard,
        pcsc::Error::ResetCard => ScioErrorCode::ResetCard,
        pcsc::Error::UnpoweredCard => ScioErrorCode::UnpoweredCard,
        pcsc::Error::UnresponsiveCard => ScioErrorCode::UnresponsiveCard,
        pcsc::Error::UnsupportedCard | pcsc::Error::CardUnsupported => {
            ScioErrorCode::UnsupportedCard
        }
        pcsc::Error::ProtoMismatch => ScioErrorCode::ProtoMismatch,
        pcsc::Error::Timeout => ScioErrorCode::Timeout,
        pcsc::Error::Cancelled => ScioErrorCode::Cancelled,
        pcsc::Error::CancelledByUser => ScioErrorCode::CancelledByUser,
        pcsc::Error::InvalidHandle => ScioErrorCode::InvalidHandle,
        pcsc::Error::ReaderUnavailable | pcsc::Error::UnknownReader => {
            ScioErrorCode::ReaderUnavailable
        }
        pcsc::Error::NoService | pcsc::Error::ServiceStopped => ScioErrorCode::NoService,
        pcsc::Error::NoReadersAvailable => ScioErrorCode::NoReadersAvailable,
        pcsc::Error::SharingViolation => ScioErrorCode::SharingViolation,
        _ => ScioErrorCode::Unknown,
    }
}

/// Wrap a `pcsc` error with a context message.
pub(crate) fn wrap(err: pcsc::Error, context: &str) -> ScioError {
    ScioError::new(map_code(err), format!("{context}: {err}"))
}
