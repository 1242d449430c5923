//! Provider errors and their Cryptoki return values
//!
//! [`ErrorKind`] is the closed vocabulary of failures the engine can report.
//! [`Error`] pairs a kind with an optional message and the diagnostic trail
//! that was active when it was built. Only the ABI layer turns errors into
//! `CK_RV` values, through [`Error::rv`].

use std::fmt;

use cie_apdu_core::{StatusWord, TransportError};
use pkcs11_sys::*;
use tracing::{debug, error, info};

use crate::trail;

/// Result type of the provider engine
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Broad family of a failure, deciding how it is logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller did something the API does not allow
    Usage,
    /// The token refused, e.g. a wrong or blocked PIN
    Token,
    /// The card answered with an unexpected status word
    Hardware,
    /// The reader or the platform card service failed
    Transport,
    /// Anything not covered above
    Unexpected,
}

/// Every failure the provider distinguishes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("cryptoki is not initialized")]
    NotInitialized,
    #[error("cryptoki is already initialized")]
    AlreadyInitialized,
    #[error("application supplied locking is not supported")]
    CantLock,
    #[error("bad arguments: {0}")]
    ArgumentsBad(&'static str),
    #[error("slot {0} does not exist")]
    SlotIdInvalid(CK_SLOT_ID),
    #[error("no token present")]
    TokenNotPresent,
    #[error("token not recognized")]
    TokenNotRecognized,
    #[error("session handle {0} is invalid")]
    SessionHandleInvalid(CK_SESSION_HANDLE),
    #[error("parallel sessions are not supported")]
    SessionParallelNotSupported,
    #[error("session is read-only")]
    SessionReadOnly,
    #[error("a read-only session is open on the slot")]
    SessionReadOnlyExists,
    #[error("object handle {0} is invalid")]
    ObjectHandleInvalid(CK_OBJECT_HANDLE),
    #[error("key handle {0} is invalid")]
    KeyHandleInvalid(CK_OBJECT_HANDLE),
    #[error("key does not permit this function")]
    KeyFunctionNotPermitted,
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
    #[error("an operation of this kind is already active")]
    OperationActive,
    #[error("a search is already active")]
    SearchAlreadyActive,
    #[error("operation not initialized")]
    OperationNotInitialized,
    #[error("mechanism {0:#x} is invalid")]
    MechanismInvalid(CK_MECHANISM_TYPE),
    #[error("mechanism parameter is invalid")]
    MechanismParamInvalid,
    #[error("attribute type {0:#x} is invalid for this object")]
    AttributeTypeInvalid(CK_ATTRIBUTE_TYPE),
    #[error("attribute {0:#x} is sensitive")]
    AttributeSensitive(CK_ATTRIBUTE_TYPE),
    #[error("user not logged in")]
    UserNotLoggedIn,
    #[error("user already logged in")]
    UserAlreadyLoggedIn,
    #[error("user type {0} is invalid")]
    UserTypeInvalid(CK_USER_TYPE),
    #[error("PIN incorrect, {retries} tries left")]
    PinIncorrect { retries: u8 },
    #[error("PIN locked")]
    PinLocked,
    #[error("PIN expired")]
    PinExpired,
    #[error("PIN length out of range")]
    PinLenRange,
    #[error("data length out of range")]
    DataLenRange,
    #[error("encrypted data length out of range")]
    EncryptedDataLenRange,
    #[error("signature length out of range")]
    SignatureLenRange,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("no slot event")]
    NoEvent,
    #[error("function not supported")]
    FunctionNotSupported,
    #[error("card removed")]
    DeviceRemoved,
    #[error("card returned {0}")]
    Card(StatusWord),
    #[error("transport failure: {0}")]
    Transport(TransportError),
    #[error("{0}")]
    General(String),
}

impl ErrorKind {
    /// Family of this failure
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::TokenNotPresent
            | Self::TokenNotRecognized
            | Self::UserNotLoggedIn
            | Self::PinIncorrect { .. }
            | Self::PinLocked
            | Self::PinExpired
            | Self::SignatureInvalid
            | Self::DeviceRemoved => ErrorClass::Token,
            Self::Card(_) => ErrorClass::Hardware,
            Self::Transport(_) => ErrorClass::Transport,
            Self::General(_) => ErrorClass::Unexpected,
            _ => ErrorClass::Usage,
        }
    }

    /// Cryptoki return value reported for this failure
    pub const fn rv(&self) -> CK_RV {
        match self {
            Self::NotInitialized => CKR_CRYPTOKI_NOT_INITIALIZED,
            Self::AlreadyInitialized => CKR_CRYPTOKI_ALREADY_INITIALIZED,
            Self::CantLock => CKR_CANT_LOCK,
            Self::ArgumentsBad(_) => CKR_ARGUMENTS_BAD,
            Self::SlotIdInvalid(_) => CKR_SLOT_ID_INVALID,
            Self::TokenNotPresent => CKR_TOKEN_NOT_PRESENT,
            Self::TokenNotRecognized => CKR_TOKEN_NOT_RECOGNIZED,
            Self::SessionHandleInvalid(_) => CKR_SESSION_HANDLE_INVALID,
            Self::SessionParallelNotSupported => CKR_SESSION_PARALLEL_NOT_SUPPORTED,
            Self::SessionReadOnly => CKR_SESSION_READ_ONLY,
            Self::SessionReadOnlyExists => CKR_SESSION_READ_ONLY_EXISTS,
            Self::ObjectHandleInvalid(_) => CKR_OBJECT_HANDLE_INVALID,
            Self::KeyHandleInvalid(_) => CKR_KEY_HANDLE_INVALID,
            Self::KeyFunctionNotPermitted => CKR_KEY_FUNCTION_NOT_PERMITTED,
            Self::BufferTooSmall { .. } => CKR_BUFFER_TOO_SMALL,
            Self::OperationActive | Self::SearchAlreadyActive => CKR_OPERATION_ACTIVE,
            Self::OperationNotInitialized => CKR_OPERATION_NOT_INITIALIZED,
            Self::MechanismInvalid(_) => CKR_MECHANISM_INVALID,
            Self::MechanismParamInvalid => CKR_MECHANISM_PARAM_INVALID,
            Self::AttributeTypeInvalid(_) => CKR_ATTRIBUTE_TYPE_INVALID,
            Self::AttributeSensitive(_) => CKR_ATTRIBUTE_SENSITIVE,
            Self::UserNotLoggedIn => CKR_USER_NOT_LOGGED_IN,
            Self::UserAlreadyLoggedIn => CKR_USER_ALREADY_LOGGED_IN,
            Self::UserTypeInvalid(_) => CKR_USER_TYPE_INVALID,
            Self::PinIncorrect { .. } => CKR_PIN_INCORRECT,
            Self::PinLocked => CKR_PIN_LOCKED,
            Self::PinExpired => CKR_PIN_EXPIRED,
            Self::PinLenRange => CKR_PIN_LEN_RANGE,
            Self::DataLenRange => CKR_DATA_LEN_RANGE,
            Self::EncryptedDataLenRange => CKR_ENCRYPTED_DATA_LEN_RANGE,
            Self::SignatureLenRange => CKR_SIGNATURE_LEN_RANGE,
            Self::SignatureInvalid => CKR_SIGNATURE_INVALID,
            Self::NoEvent => CKR_NO_EVENT,
            Self::FunctionNotSupported => CKR_FUNCTION_NOT_SUPPORTED,
            Self::DeviceRemoved => CKR_DEVICE_REMOVED,
            Self::Card(status) => match (status.sw1, status.sw2) {
                (0x69, 0x82) => CKR_USER_NOT_LOGGED_IN,
                (0x65, 0x81) => CKR_DEVICE_MEMORY,
                _ => CKR_FUNCTION_FAILED,
            },
            Self::Transport(_) => CKR_DEVICE_ERROR,
            Self::General(_) => CKR_GENERAL_ERROR,
        }
    }

    fn from_transport(error: TransportError) -> Self {
        match error {
            TransportError::NoCard => Self::TokenNotPresent,
            TransportError::CardRemoved => Self::DeviceRemoved,
            other => Self::Transport(other),
        }
    }
}

/// A provider failure with the trail that led to it
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    trail: Vec<&'static str>,
}

impl Error {
    /// Build an error, capturing the current trail
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            trail: trail::snapshot(),
        }
    }

    /// Shorthand for [`ErrorKind::General`]
    pub fn general(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::General(message.into()))
    }

    /// The kind of failure
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Trail captured when the error was built, innermost first
    pub fn trail(&self) -> &[&'static str] {
        &self.trail
    }

    /// Cryptoki return value for this error
    pub const fn rv(&self) -> CK_RV {
        self.kind.rv()
    }

    /// Prefix the message with `context`
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let context = context.into();
        self.context = Some(match self.context.take() {
            Some(inner) => format!("{context}: {inner}"),
            None => context,
        });
        self
    }

    /// Log the error at the level of its class
    pub fn log(&self, function: &str) {
        let trail = trail::render(&self.trail);
        match self.kind.class() {
            ErrorClass::Usage => debug!(function, rv = self.rv(), "{self}"),
            ErrorClass::Token => info!(function, rv = self.rv(), "{self}"),
            ErrorClass::Hardware | ErrorClass::Transport | ErrorClass::Unexpected => {
                error!(function, rv = self.rv(), %trail, "{self}")
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "{context}: {}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        Self::new(ErrorKind::from_transport(error))
    }
}

impl From<cie_apdu_core::Error> for Error {
    fn from(error: cie_apdu_core::Error) -> Self {
        let kind = if let Some(transport) = error.transport_error() {
            ErrorKind::from_transport(transport.clone())
        } else if let Some(status) = error.status_word() {
            ErrorKind::Card(status)
        } else {
            ErrorKind::General(error.to_string())
        };
        Self::new(kind)
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::new(ErrorKind::ArgumentsBad("length does not fit the platform"))
    }
}

/// Extension trait adding context to results
pub trait ResultExt<T> {
    /// Prefix the error message with `context`
    fn context(self, context: &str) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}
