//! Card backends
//!
//! A backend enumerates readers, opens connections to the cards in them and
//! reports presence changes. It never interprets APDUs; the card layer does.

#[cfg(feature = "pcsc")]
mod pcsc;
#[cfg(feature = "virtual-card")]
pub mod virtual_card;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cie_apdu_core::{CardTransport, TransportError};

#[cfg(feature = "pcsc")]
pub use self::pcsc::PcscBackend;
#[cfg(feature = "virtual-card")]
pub use self::virtual_card::{VirtualCard, VirtualCardBackend};
use crate::config::{BackendKind, ProviderConfig};
use crate::error::{Error, ErrorKind, Result};

/// Snapshot of one reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderStatus {
    /// Reader name as reported by the platform
    pub name: String,
    /// Whether a card sits in the reader
    pub card_present: bool,
    /// ATR of the card, when known
    pub atr: Option<Vec<u8>>,
}

/// Source of readers and card connections
pub trait CardBackend: Send + Sync + fmt::Debug {
    /// Current readers, in discovery order
    fn readers(&self) -> Result<Vec<ReaderStatus>, TransportError>;

    /// Open a connection to the card in `reader`
    fn connect(&self, reader: &str) -> Result<Box<dyn CardConnection>, TransportError>;

    /// Block until a reader or card change happens or `timeout` elapses
    ///
    /// Returns whether something changed. Spurious `true` results are
    /// allowed, callers compare reader snapshots themselves.
    fn wait_for_change(&self, timeout: Duration) -> Result<bool, TransportError>;

    /// Make pending and future [`wait_for_change`](Self::wait_for_change)
    /// calls return promptly
    fn cancel_wait(&self);

    /// Manufacturer reported in slot information
    fn manufacturer(&self) -> &str;
}

/// Connection to the card of one reader
pub trait CardConnection: Send + fmt::Debug {
    /// Run `body` while holding the card exclusively against other processes
    fn transaction(
        &mut self,
        body: &mut dyn FnMut(&mut dyn CardTransport),
    ) -> Result<(), TransportError>;
}

/// Create the backend selected by `config`
pub fn from_config(config: &ProviderConfig) -> Result<Arc<dyn CardBackend>> {
    match config.backend {
        #[cfg(feature = "pcsc")]
        BackendKind::Pcsc => Ok(Arc::new(PcscBackend::new(config)?)),
        #[cfg(feature = "virtual-card")]
        BackendKind::Virtual => Ok(Arc::new(VirtualCardBackend::with_default_card()?)),
        #[allow(unreachable_patterns)]
        other => Err(Error::new(ErrorKind::General(format!(
            "backend {other:?} is not compiled in"
        )))),
    }
}
