//! Core error type for APDU operations

use crate::response::status::StatusWord;
use crate::transport::TransportError;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type that encompasses all possible errors in the crate
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport failed to deliver the command or its response
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Parse error when processing a response
    #[error("parse error: {0}")]
    Parse(&'static str),

    /// The card answered with a status word the caller did not accept
    #[error("card returned {status} ({})", status.description())]
    Status {
        /// Status word that caused the error
        status: StatusWord,
    },

    /// Command could not be encoded or decoded
    #[error("invalid command length: {0}")]
    InvalidCommandLength(usize),

    /// Command data exceeds what the encoding can carry
    #[error("command data too long: {0} bytes")]
    DataTooLong(usize),

    /// The card kept answering 61xx beyond the chaining limit
    #[error("response chain limit exceeded")]
    ChainLimitExceeded,

    /// Context error with message and source error
    #[error("{context}: {source}")]
    Context {
        /// Contextual message
        context: String,
        /// Source error
        source: Box<Self>,
    },
}

impl Error {
    /// Create a new error with context information
    pub fn with_context<S: Into<String>>(self, context: S) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a new status error
    pub const fn status(sw1: u8, sw2: u8) -> Self {
        Self::Status {
            status: StatusWord::new(sw1, sw2),
        }
    }

    /// Status word carried by this error, looking through context layers
    pub fn status_word(&self) -> Option<StatusWord> {
        match self {
            Self::Status { status } => Some(*status),
            Self::Context { source, .. } => source.status_word(),
            _ => None,
        }
    }

    /// Transport error carried by this error, looking through context layers
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Context { source, .. } => source.transport_error(),
            _ => None,
        }
    }
}

/// Extension trait for Result with APDU Errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context<S: Into<String>>(self, context: S) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context<S: Into<String>>(self, context: S) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_word_through_context() {
        let err = Error::status(0x69, 0x82).with_context("reading certificate");
        assert_eq!(err.status_word(), Some(StatusWord::new(0x69, 0x82)));
        assert!(err.transport_error().is_none());
        assert_eq!(
            err.to_string(),
            "reading certificate: card returned 69 82 (Security status not satisfied)"
        );
    }

    #[test]
    fn test_transport_context() {
        let res: std::result::Result<(), TransportError> = Err(TransportError::CardRemoved);
        let err = res.context("select").unwrap_err();
        assert!(matches!(
            err.transport_error(),
            Some(TransportError::CardRemoved)
        ));
    }
}
