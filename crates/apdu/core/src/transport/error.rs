//! Error types specific to card transport

/// Transport error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection error
    #[error("failed to connect to device")]
    Connection,

    /// Transmission error
    #[error("failed to transmit data")]
    Transmission,

    /// No card in the reader
    #[error("no card present")]
    NoCard,

    /// The card was removed while in use
    #[error("card removed")]
    CardRemoved,

    /// The card was reset by another party
    #[error("card reset")]
    CardReset,

    /// Buffer too small
    #[error("buffer too small")]
    BufferTooSmall,

    /// Driver error (with code)
    #[error("driver error code: {0:#010x}")]
    Driver(u32),

    /// Timeout error
    #[error("operation timed out")]
    Timeout,

    /// Cancelled operation
    #[error("operation cancelled")]
    Cancelled,

    /// Other error with message
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Create a new driver error
    pub const fn driver(code: u32) -> Self {
        Self::Driver(code)
    }

    /// Whether the card is gone and the connection must be rebuilt
    pub const fn is_card_lost(&self) -> bool {
        matches!(self, Self::NoCard | Self::CardRemoved)
    }

    /// Create a general other error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other(message.into())
    }
}
