//! Error types for PC/SC transport

use cie_apdu_core::TransportError;

/// PC/SC-specific errors
#[derive(Debug, thiserror::Error)]
pub enum PcscError {
    /// PC/SC error
    #[error("PC/SC error: {0}")]
    Pcsc(#[from] pcsc::Error),

    /// Reader not found
    #[error("reader not found: {0}")]
    ReaderNotFound(String),

    /// No card present in reader
    #[error("no card present in reader: {0}")]
    NoCard(String),

    /// Card was removed
    #[error("card was removed")]
    CardRemoved,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl From<PcscError> for TransportError {
    fn from(error: PcscError) -> Self {
        match error {
            PcscError::Pcsc(e) => e.into_transport_error(),
            PcscError::ReaderNotFound(_) => Self::Connection,
            PcscError::NoCard(_) => Self::NoCard,
            PcscError::CardRemoved => Self::CardRemoved,
            PcscError::Other(msg) => Self::Other(msg),
        }
    }
}

/// Classification of raw PC/SC errors into transport errors
pub(crate) trait IntoTransportError {
    fn into_transport_error(self) -> TransportError;
}

impl IntoTransportError for pcsc::Error {
    fn into_transport_error(self) -> TransportError {
        match self {
            Self::NoSmartcard => TransportError::NoCard,
            Self::RemovedCard => TransportError::CardRemoved,
            Self::ResetCard => TransportError::CardReset,
            Self::Timeout => TransportError::Timeout,
            Self::Cancelled => TransportError::Cancelled,
            Self::InsufficientBuffer => TransportError::BufferTooSmall,
            Self::UnknownReader | Self::ReaderUnavailable | Self::NoService | Self::ServiceStopped => {
                TransportError::Connection
            }
            other => TransportError::Other(other.to_string()),
        }
    }
}
