//! PC/SC transport implementation

use std::ffi::CString;
use std::fmt;

use bytes::Bytes;
use cie_apdu_core::{CardTransport, TransportError};
use pcsc::{Card, Context, Disposition};
use tracing::{debug, warn};

use crate::config::PcscConfig;
use crate::error::{IntoTransportError, PcscError};

/// Transport implementation using PC/SC
pub struct PcscTransport {
    /// PC/SC context
    context: Context,
    /// Card connection, if established
    card: Option<Card>,
    /// Reader name
    reader_name: String,
    /// Configuration
    config: PcscConfig,
}

impl fmt::Debug for PcscTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscTransport")
            .field("reader_name", &self.reader_name)
            .field("has_card", &self.card.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl PcscTransport {
    /// Create a new PC/SC transport for the specified reader
    pub(crate) fn new(
        context: Context,
        reader_name: &str,
        config: PcscConfig,
    ) -> Result<Self, PcscError> {
        let mut transport = Self {
            context,
            card: None,
            reader_name: reader_name.to_string(),
            config,
        };

        // An empty reader is fine here, the card is connected on first use
        if let Err(e) = transport.connect_card() {
            debug!(reader = %transport.reader_name, error = %e, "Deferred card connection");
        }

        Ok(transport)
    }

    /// Try to connect to the card
    fn connect_card(&mut self) -> Result<&mut Card, PcscError> {
        if self.card.is_none() {
            let reader_cstr = CString::new(self.reader_name.clone())
                .map_err(|_| PcscError::ReaderNotFound(self.reader_name.clone()))?;

            let card = match self.context.connect(
                &reader_cstr,
                self.config.share_mode.into(),
                self.config.protocols,
            ) {
                Ok(card) => card,
                Err(pcsc::Error::NoSmartcard) | Err(pcsc::Error::RemovedCard) => {
                    return Err(PcscError::NoCard(self.reader_name.clone()));
                }
                Err(pcsc::Error::UnknownReader) => {
                    return Err(PcscError::ReaderNotFound(self.reader_name.clone()));
                }
                Err(e) => return Err(e.into()),
            };
            debug!(reader = %self.reader_name, "Connected to card");
            self.card = Some(card);
        }

        self.card
            .as_mut()
            .ok_or_else(|| PcscError::NoCard(self.reader_name.clone()))
    }

    /// Get the ATR of the current card
    pub fn atr(&mut self) -> Result<Vec<u8>, PcscError> {
        let card = self.connect_card()?;
        Ok(card.get_attribute_owned(pcsc::Attribute::AtrString)?)
    }

    /// Get the reader name
    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    /// Check if the transport is connected to a card
    pub const fn has_card(&self) -> bool {
        self.card.is_some()
    }

    /// Drop the card handle after the card went away
    fn forget_card(&mut self, error: &pcsc::Error) {
        if matches!(error, pcsc::Error::RemovedCard | pcsc::Error::NoSmartcard) {
            self.card = None;
        }
    }

    /// Run `body` inside an exclusive PC/SC transaction on this reader
    ///
    /// The transaction is ended with [`Disposition::LeaveCard`] when `body`
    /// returns, and also when it unwinds. A card reset by another process is
    /// reconnected once before the transaction starts, never in the middle of
    /// it.
    pub fn transaction<R>(
        &mut self,
        body: impl FnOnce(&mut TransactionTransport<'_>) -> R,
    ) -> Result<R, PcscError> {
        let reader_name = self.reader_name.clone();

        let error = 'begin: {
            let (result, ended) = match self.connect_card()?.transaction() {
                Ok(tx) => run_in(tx, &reader_name, body),
                Err(e) => break 'begin e,
            };
            self.after_end(ended);
            return Ok(result);
        };

        match begin_recovery(error, self.config.auto_reconnect) {
            BeginRecovery::Reconnect => {
                debug!(reader = %reader_name, "Card was reset, reconnecting");
                let share_mode = self.config.share_mode.into();
                let protocols = self.config.protocols;
                let reconnect = self.connect_card()?.reconnect(
                    share_mode,
                    protocols,
                    Disposition::LeaveCard,
                );
                if let Err(e) = reconnect {
                    self.forget_card(&e);
                    return Err(e.into());
                }
            }
            BeginRecovery::Forget => {
                self.card = None;
                return Err(error.into());
            }
            BeginRecovery::Keep => return Err(error.into()),
        }

        let begin = match self.connect_card()?.transaction() {
            Ok(tx) => Ok(run_in(tx, &reader_name, body)),
            Err(e) => Err(e),
        };
        match begin {
            Ok((result, ended)) => {
                self.after_end(ended);
                Ok(result)
            }
            Err(e) => {
                if begin_recovery(e, false) == BeginRecovery::Forget {
                    self.card = None;
                }
                Err(e.into())
            }
        }
    }

    /// Log a failed `SCardEndTransaction`, dropping the card if it went away
    fn after_end(&mut self, ended: Result<(), pcsc::Error>) {
        if let Err(e) = ended {
            warn!(reader = %self.reader_name, error = %e, "Failed to end transaction");
            self.forget_card(&e);
        }
    }

    /// Transmit a command to the card
    fn transmit_command(&mut self, command: &[u8]) -> Result<Bytes, PcscError> {
        let card = self.connect_card()?;
        let mut response_buffer = [0u8; pcsc::MAX_BUFFER_SIZE];

        match card.transmit(command, &mut response_buffer) {
            Ok(response) => Ok(Bytes::copy_from_slice(response)),
            Err(e) => {
                self.forget_card(&e);
                Err(e.into())
            }
        }
    }
}

impl CardTransport for PcscTransport {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        self.transmit_command(command).map_err(TransportError::from)
    }

    fn is_connected(&self) -> bool {
        self.card.is_some()
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        if let Some(card) = self.card.take() {
            let _ = card.disconnect(Disposition::ResetCard);
        }
        self.connect_card().map(drop).map_err(Into::into)
    }
}

/// What to do with the cached card after `SCardBeginTransaction` failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BeginRecovery {
    /// Reconnect the handle and begin once more
    Reconnect,
    /// The handle is dead, connect afresh on the next call
    Forget,
    /// The handle is still usable
    Keep,
}

const fn begin_recovery(error: pcsc::Error, may_reconnect: bool) -> BeginRecovery {
    match error {
        pcsc::Error::ResetCard if may_reconnect => BeginRecovery::Reconnect,
        pcsc::Error::ResetCard | pcsc::Error::RemovedCard | pcsc::Error::NoSmartcard => {
            BeginRecovery::Forget
        }
        _ => BeginRecovery::Keep,
    }
}

/// Run `body` on an open transaction and end it, returning the end status
fn run_in<R>(
    tx: pcsc::Transaction<'_>,
    reader_name: &str,
    body: impl FnOnce(&mut TransactionTransport<'_>) -> R,
) -> (R, Result<(), pcsc::Error>) {
    let result = {
        let mut transport = TransactionTransport {
            card: &tx,
            reader_name,
        };
        body(&mut transport)
    };
    let ended = tx.end(Disposition::LeaveCard).map_err(|(_, e)| e);
    (result, ended)
}

impl Drop for PcscTransport {
    fn drop(&mut self) {
        if let Some(card) = self.card.take() {
            let _ = card.disconnect(Disposition::LeaveCard);
        }
    }
}

/// Transport handed to the body of [`PcscTransport::transaction`]
pub struct TransactionTransport<'tx> {
    card: &'tx Card,
    reader_name: &'tx str,
}

impl fmt::Debug for TransactionTransport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionTransport")
            .field("reader_name", &self.reader_name)
            .finish()
    }
}

impl CardTransport for TransactionTransport<'_> {
    fn do_transmit_raw(&mut self, command: &[u8]) -> Result<Bytes, TransportError> {
        let mut response_buffer = [0u8; pcsc::MAX_BUFFER_SIZE];
        self.card
            .transmit(command, &mut response_buffer)
            .map(Bytes::copy_from_slice)
            .map_err(IntoTransportError::into_transport_error)
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn reset(&mut self) -> Result<(), TransportError> {
        // Resetting would silently drop the card security state mid-transaction
        Err(TransportError::other("reset is not allowed inside a transaction"))
    }
}
